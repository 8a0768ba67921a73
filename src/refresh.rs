//! Live manifest refresh: re-parse the manifest and splice the new segment indexes into the
//! representations being played, without losing the playback position.
//!
//! The refresh is transactional. The fresh manifest is parsed into a *shadow*
//! [`Presentation`]; only once the driven representation has been located in the shadow and its
//! media parameters verified compatible are the index arrays moved into the live representation
//! and the global timing attributes adopted. Any failure before that point leaves the live state
//! exactly as it was, so a broken refresh surfaces as an error on the next read without
//! corrupting playback.

use crate::fetch::ResourceOpener;
use crate::presentation::{parse_frame_rate, MediaKind, Presentation, Representation, SegmentIndex};
use crate::sequencer;
use crate::{DashDemuxError, DemuxOptions};
use tracing::{debug, info};


fn frame_rates_differ(old: &Option<String>, new: &Option<String>) -> bool {
    match (old, new) {
        (Some(a), Some(b)) => {
            // tolerate a change of spelling ("30/1" vs "30")
            match (parse_frame_rate(a), parse_frame_rate(b)) {
                (Some(fa), Some(fb)) => (fa - fb).abs() > f64::EPSILON,
                _ => a != b,
            }
        },
        (a, b) => a != b,
    }
}

// A refreshed representation must still describe the same elementary stream; anything the
// downstream decoder cannot absorb mid-stream is an input change the consumer has to handle.
fn check_media_compatibility(
    old: &Representation,
    new: &Representation,
) -> Result<(), DashDemuxError> {
    let id = &old.id;
    match old.kind {
        MediaKind::Video => {
            if old.width != new.width || old.height != new.height {
                return Err(DashDemuxError::InputChanged(
                    format!("video resolution of representation {id} changed")));
            }
            if frame_rates_differ(&old.frame_rate, &new.frame_rate) {
                return Err(DashDemuxError::InputChanged(
                    format!("frame rate of representation {id} changed")));
            }
            if old.codecs != new.codecs {
                return Err(DashDemuxError::InputChanged(
                    format!("video codecs of representation {id} changed")));
            }
            if old.scan_type != new.scan_type {
                return Err(DashDemuxError::InputChanged(
                    format!("scan type of representation {id} changed")));
            }
        },
        MediaKind::Audio => {
            if old.codecs != new.codecs {
                return Err(DashDemuxError::InputChanged(
                    format!("audio codecs of representation {id} changed")));
            }
        },
        MediaKind::Subtitle => {},
    }
    Ok(())
}

fn same_style(a: &SegmentIndex, b: &SegmentIndex) -> bool {
    matches!(
        (a, b),
        (SegmentIndex::List(_), SegmentIndex::List(_))
            | (SegmentIndex::Timeline { .. }, SegmentIndex::Timeline { .. })
            | (SegmentIndex::TemplateDuration { .. }, SegmentIndex::TemplateDuration { .. })
    )
}

// Move the segment index (and everything derived from the manifest) from the shadow
// representation into the live one. Sequencing state (cur_seq_no, buffers, play position) is
// left alone; the caller fixes cur_seq_no according to the splice rules.
fn adopt_index(rep: &mut Representation, fresh: Representation) {
    if rep.init_section != fresh.init_section {
        rep.init_loaded = false;
        rep.init_buf = Vec::new();
        rep.init_read_offset = 0;
    }
    rep.base_url = fresh.base_url;
    rep.index = fresh.index;
    rep.first_seq_no = fresh.first_seq_no;
    rep.last_seq_no = fresh.last_seq_no;
    rep.fragment_duration = fresh.fragment_duration;
    rep.fragment_timescale = fresh.fragment_timescale;
    rep.presentation_timeoffset = fresh.presentation_timeoffset;
    rep.init_section = fresh.init_section;
}

fn mark_init_stale(rep: &mut Representation) {
    rep.init_loaded = false;
    rep.init_buf = Vec::new();
    rep.init_read_offset = 0;
}

/// Re-fetch and re-parse the manifest, then splice the refreshed segment index into `rep`. On
/// success the presentation's global timing attributes are updated as well; on failure nothing
/// is modified.
pub fn refresh(
    pres: &mut Presentation,
    rep: &mut Representation,
    opener: &dyn ResourceOpener,
    options: &DemuxOptions,
    now: i64,
) -> Result<(), DashDemuxError> {
    // Playback position in presentation seconds, used to select the right Period on re-parse.
    let curr_timepoint = match &rep.index {
        SegmentIndex::Timeline { .. } => {
            let timescale = rep.fragment_timescale.max(1);
            rep.period_start
                + sequencer::segment_start_time(rep, rep.cur_seq_no, options) / timescale
        },
        _ => {
            if rep.fragment_timescale > 0 {
                (rep.first_seq_no * rep.fragment_duration) / rep.fragment_timescale
            } else {
                0
            }
        },
    };

    let (xml, final_url) = opener.fetch_document(&pres.mpd_url)?;
    let mut shadow = Presentation::from_xml(
        &xml, &final_url, curr_timepoint, pres.period_start, options, now)?;
    debug!("refreshed manifest: publishTime {} period_start {}",
           shadow.publish_time, shadow.period_start);

    let pool = match rep.kind {
        MediaKind::Video => &mut shadow.videos,
        MediaKind::Audio => &mut shadow.audios,
        MediaKind::Subtitle => &mut shadow.subtitles,
    };
    let Some(pos) = pool.iter().position(|cand| cand.id == rep.id) else {
        return Err(DashDemuxError::InvalidManifest(
            format!("representation {} disappeared from the refreshed manifest", rep.id)));
    };
    let fresh = pool.swap_remove(pos);
    check_media_compatibility(rep, &fresh)?;
    if !same_style(&rep.index, &fresh.index) {
        return Err(DashDemuxError::InvalidManifest(
            format!("representation {} changed its segment index style", rep.id)));
    }

    // All checks passed; from here on we mutate.
    let new_period = shadow.period_start > rep.period_start;
    let mut invalidate_init = false;
    let new_cur = match &fresh.index {
        SegmentIndex::Timeline { .. } => {
            if new_period {
                fresh.first_seq_no
            } else {
                let timescale = rep.fragment_timescale.max(1);
                let current_time =
                    sequencer::segment_start_time(rep, rep.cur_seq_no, options) / timescale;
                let fresh_ticks = current_time * fresh.fragment_timescale;
                sequencer::next_seg_no_from_timelines(&fresh, fresh_ticks - 1)
                    .unwrap_or(rep.cur_seq_no)
            }
        },
        SegmentIndex::List(_) if new_period => {
            invalidate_init = true;
            fresh.first_seq_no
        },
        // same window, possibly renumbered: clamp back in when the window has slid past the
        // playback position
        SegmentIndex::List(_) | SegmentIndex::TemplateDuration { .. } => {
            rep.cur_seq_no.max(fresh.first_seq_no)
        },
    };
    adopt_index(rep, fresh);
    rep.cur_seq_no = new_cur;
    if invalidate_init {
        mark_init_stale(rep);
    }
    rep.period_start = shadow.period_start;
    rep.period_duration = shadow.period_duration;
    rep.period_media_presentation_duration = shadow.media_presentation_duration;

    pres.base_url = shadow.base_url;
    pres.availability_start_time = shadow.availability_start_time;
    pres.publish_time = shadow.publish_time;
    pres.minimum_update_period = shadow.minimum_update_period;
    pres.time_shift_buffer_depth = shadow.time_shift_buffer_depth;
    pres.suggested_presentation_delay = shadow.suggested_presentation_delay;
    pres.min_buffer_time = shadow.min_buffer_time;
    pres.media_presentation_duration = shadow.media_presentation_duration;
    pres.period_start = shadow.period_start;
    pres.period_duration = shadow.period_duration;

    info!("refreshed representation {}: segments {}..{}, resuming at {}",
          rep.id, rep.first_seq_no, rep.last_seq_no, rep.cur_seq_no);
    Ok(())
}
