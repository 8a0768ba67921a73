//! Computation of segment sequence numbers and their fragments.
//!
//! Each representation exposes a contiguous range of sequence numbers
//! `[first_seq_no, last_seq_no]`. The functions here map a sequence number to its fragment (URL
//! plus byte range) across the three segmenting styles, map timeline positions back to sequence
//! numbers, and compute the live playback window from the wall clock. Everything that depends on
//! the clock takes `now` (epoch seconds) explicitly.

use crate::presentation::{Fragment, Presentation, Representation, SegmentIndex};
use crate::resolver::{merge_baseurls, resolve_url_template};
use crate::{DashDemuxError, DemuxOptions};
use std::collections::HashMap;


/// Start time of segment `seq` in @timescale units, for a timeline-style representation.
///
/// Walks the timeline entries, honouring absolute `t` overrides (timeline discontinuities) and
/// repeat counts. An entry with repeat -1 fills the rest of the period: its closed form
/// `duration * target` is returned for any target not yet matched. When
/// `use_timeline_segment_offset_correction` is on (the default), the target is first normalized
/// by `first_seq_no` so that manifests indexing their timeline from @startNumber address entry 0
/// with their first sequence number.
pub fn segment_start_time(rep: &Representation, seq: i64, options: &DemuxOptions) -> i64 {
    let SegmentIndex::Timeline { entries, .. } = &rep.index else {
        return 0;
    };
    let target = if options.use_timeline_segment_offset_correction {
        seq - rep.first_seq_no
    } else {
        seq
    };
    let mut start_time = 0;
    let mut num = 0;
    for entry in entries {
        if entry.start_time > 0 {
            start_time = entry.start_time;
        }
        if num == target {
            return start_time;
        }
        if entry.repeat == -1 {
            return entry.duration * target;
        }
        start_time += entry.duration;
        for _ in 0..entry.repeat {
            num += 1;
            if num == target {
                return start_time;
            }
            start_time += entry.duration;
        }
        num += 1;
    }
    start_time
}

/// The absolute sequence number of the first segment whose start time lies strictly after
/// `time_offset` (@timescale units), or `None` when the timeline ends before that.
pub fn next_seg_no_from_timelines(rep: &Representation, time_offset: i64) -> Option<i64> {
    let SegmentIndex::Timeline { entries, .. } = &rep.index else {
        return None;
    };
    let mut start_time = 0;
    let mut num = 0;
    for entry in entries {
        if entry.start_time > 0 {
            start_time = entry.start_time;
        }
        if start_time > time_offset {
            return Some(rep.first_seq_no + num);
        }
        start_time += entry.duration;
        for _ in 0..entry.repeat.max(0) {
            num += 1;
            if start_time > time_offset {
                return Some(rep.first_seq_no + num);
            }
            start_time += entry.duration;
        }
        num += 1;
    }
    None
}

// Effective start time of the last timeline entry (the absolute `t` if it carries one, otherwise
// the accumulated position).
fn timeline_end_time(rep: &Representation) -> i64 {
    let SegmentIndex::Timeline { entries, .. } = &rep.index else {
        return 0;
    };
    let mut start_time = 0;
    for (i, entry) in entries.iter().enumerate() {
        if entry.start_time > 0 {
            start_time = entry.start_time;
        }
        if i + 1 == entries.len() {
            break;
        }
        start_time += entry.duration * (1 + entry.repeat.max(0));
    }
    start_time
}

/// The sequence number to start playing at, evaluated when opening a live stream or when
/// catching up after falling out of the time-shift window.
pub fn calc_cur_seg_no(
    rep: &Representation,
    pres: &Presentation,
    options: &DemuxOptions,
    now: i64,
) -> i64 {
    if !pres.is_live {
        return rep.first_seq_no;
    }
    match &rep.index {
        SegmentIndex::List(_) => rep.first_seq_no,
        SegmentIndex::Timeline { .. } => {
            // start 60 seconds back from the end of the announced timeline
            let offset = timeline_end_time(rep) - 60 * rep.fragment_timescale;
            next_seg_no_from_timelines(rep, offset).unwrap_or(rep.first_seq_no)
        },
        SegmentIndex::TemplateDuration { .. } => {
            if rep.fragment_duration <= 0 {
                return rep.first_seq_no;
            }
            let timescale = rep.fragment_timescale;
            let mut num = if let Some(pto) = rep.presentation_timeoffset {
                rep.first_seq_no
                    + ((now - pres.availability_start_time) * timescale - pto) / rep.fragment_duration
                    - pres.min_buffer_time
            } else if pres.publish_time > 0 && pres.availability_start_time == 0
                && pres.min_buffer_time > 0
            {
                rep.first_seq_no
                    + ((pres.publish_time + rep.fragment_duration
                        - pres.suggested_presentation_delay) * timescale) / rep.fragment_duration
                    - pres.min_buffer_time
            } else if pres.publish_time > 0 && pres.availability_start_time == 0 {
                rep.first_seq_no
                    + ((pres.publish_time - pres.time_shift_buffer_depth + rep.fragment_duration
                        - pres.suggested_presentation_delay) * timescale) / rep.fragment_duration
            } else {
                rep.first_seq_no
                    + ((now - pres.availability_start_time - pres.suggested_presentation_delay)
                       * timescale) / rep.fragment_duration
            };
            // The head segment may still be in production; don't request it before it finalizes.
            if options.fetch_completed_segments_only
                && pres.time_shift_buffer_depth == 0
                && pres.suggested_presentation_delay == 0
                && num > rep.first_seq_no
            {
                num -= 1;
            }
            num
        },
    }
}

/// The oldest sequence number still inside the time-shift window.
pub fn calc_min_seg_no(rep: &Representation, pres: &Presentation, now: i64) -> i64 {
    if pres.is_live && rep.fragment_duration > 0 {
        rep.first_seq_no
            + ((now - pres.availability_start_time - pres.time_shift_buffer_depth)
               * rep.fragment_timescale) / rep.fragment_duration
    } else {
        rep.first_seq_no
    }
}

/// The newest sequence number believed to exist: derived from the descriptor for VOD, from the
/// wall clock for template+duration live streams.
pub fn calc_max_seg_no(rep: &Representation, pres: &Presentation, now: i64) -> i64 {
    match &rep.index {
        SegmentIndex::List(fragments) => {
            rep.first_seq_no + fragments.len() as i64 - 1
        },
        SegmentIndex::Timeline { entries, .. } => {
            let mut num = rep.first_seq_no + entries.len() as i64 - 1;
            for entry in entries {
                if entry.repeat == -1 {
                    // the entry fills the period; derive the count from the period duration
                    let fill = if rep.period_duration > 0 {
                        rep.period_duration
                    } else {
                        rep.period_media_presentation_duration
                    };
                    if entry.duration > 0 {
                        num = rep.first_seq_no + (fill * rep.fragment_timescale) / entry.duration - 1;
                    }
                } else {
                    num += entry.repeat;
                }
            }
            num
        },
        SegmentIndex::TemplateDuration { .. } => {
            if rep.fragment_duration <= 0 {
                return rep.first_seq_no;
            }
            if pres.is_live {
                rep.first_seq_no
                    + ((now - pres.availability_start_time) * rep.fragment_timescale)
                      / rep.fragment_duration
            } else {
                let duration = if rep.period_duration > 0 {
                    rep.period_duration
                } else {
                    rep.period_media_presentation_duration
                };
                let ticks = duration * rep.fragment_timescale;
                // round up so a final partial segment is counted
                rep.first_seq_no + (ticks + rep.fragment_duration - 1) / rep.fragment_duration - 1
            }
        },
    }
}

/// The fragment (URL plus byte range) for sequence number `seq`, or `None` when an explicit
/// fragment list has no entry for it (end of stream). For the template styles the URL is built by
/// placeholder substitution; availability bounds are enforced by the caller.
pub fn fragment_for(
    rep: &Representation,
    seq: i64,
    options: &DemuxOptions,
) -> Result<Option<Fragment>, DashDemuxError> {
    match &rep.index {
        SegmentIndex::List(fragments) => {
            let idx = seq - rep.first_seq_no;
            if idx < 0 || idx as usize >= fragments.len() {
                return Ok(None);
            }
            Ok(Some(fragments[idx as usize].clone()))
        },
        SegmentIndex::Timeline { media, .. } => {
            let time = segment_start_time(rep, seq, options);
            expand_media(rep, media, seq, time).map(Some)
        },
        SegmentIndex::TemplateDuration { media } => {
            let time = (seq - rep.first_seq_no) * rep.fragment_duration
                + rep.presentation_timeoffset.unwrap_or(0);
            expand_media(rep, media, seq, time).map(Some)
        },
    }
}

fn expand_media(
    rep: &Representation,
    media: &str,
    number: i64,
    time: i64,
) -> Result<Fragment, DashDemuxError> {
    let dict = HashMap::from([
        ("RepresentationID", rep.id.clone()),
        ("Bandwidth", rep.bandwidth.to_string()),
        ("Number", number.to_string()),
        ("Time", time.to_string()),
    ]);
    let path = resolve_url_template(media, &dict);
    Ok(Fragment {
        url: merge_baseurls(&rep.base_url, &path)?,
        url_offset: 0,
        size: -1,
    })
}
