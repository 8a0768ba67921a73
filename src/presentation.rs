//! Runtime model of a DASH presentation, built from a parsed MPD document.
//!
//! The serde structs in the crate root mirror the XML; the types here are what the segment
//! sequencer and the demuxer actually drive: value types with clear ownership, absolute sequence
//! numbers, and resolved URLs. A `Presentation` is rebuilt from scratch on every manifest
//! (re)parse; the refresh controller moves the per-representation index arrays from the freshly
//! built ("shadow") presentation into the live one.

use crate::resolver::{merge_baseurls, parse_range, resolve_url_template};
use crate::sequencer;
use crate::{is_audio_adaptation, is_subtitle_adaptation, is_video_adaptation};
use crate::{AdaptationSet, DashDemuxError, DemuxOptions, Period, ProgramInformation, SegmentList,
            SegmentTemplate, MPD};
use std::collections::HashMap;
use tracing::warn;
use url::Url;


/// Scheme URI of the SupplementalProperty carrying the number of the last available segment.
pub const LAST_SEGMENT_NUMBER_SCHEME: &str = "http://dashif.org/guidelines/last-segment-number";

/// One independently addressable byte range of a representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub url: Url,
    /// Byte offset of the fragment within the resource.
    pub url_offset: i64,
    /// Size in bytes, -1 when unknown (read until EOF).
    pub size: i64,
}

/// One `S` element of a SegmentTimeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Absolute start in @timescale units; 0 means contiguous with the previous entry.
    pub start_time: i64,
    pub duration: i64,
    /// Number of additional repetitions; -1 means "repeat until the end of the period".
    pub repeat: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
}

/// The three exclusive segmenting styles of a representation.
#[derive(Debug, Clone)]
pub enum SegmentIndex {
    /// Explicit fragment list (SegmentList, or a single BaseURL resource).
    List(Vec<Fragment>),
    /// SegmentTemplate with a SegmentTimeline.
    Timeline { media: String, entries: Vec<TimelineEntry> },
    /// SegmentTemplate with a fixed segment duration.
    TemplateDuration { media: String },
}

/// A single encoding of a media component, together with its sequencing state.
#[derive(Debug, Clone)]
pub struct Representation {
    pub id: String,
    pub kind: MediaKind,
    pub bandwidth: u64,
    pub lang: Option<String>,
    pub codecs: Option<String>,
    pub scan_type: Option<String>,
    pub frame_rate: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    /// Accumulated BaseURL chain for this representation.
    pub base_url: Url,
    pub index: SegmentIndex,
    /// Segment duration in @timescale units (template+duration style; also carried for list
    /// style when the manifest declares it).
    pub fragment_duration: i64,
    pub fragment_timescale: i64,
    pub presentation_timeoffset: Option<i64>,
    /// Sequence number of the first available segment (@startNumber).
    pub first_seq_no: i64,
    /// Derived for VOD, tracked across refreshes for live.
    pub last_seq_no: i64,
    /// Next segment to play; may transiently be `last_seq_no + 1` ("need next fragment").
    pub cur_seq_no: i64,
    pub init_section: Option<Fragment>,
    pub init_buf: Vec<u8>,
    pub init_loaded: bool,
    pub init_read_offset: usize,
    pub cur_seg: Option<Fragment>,
    pub cur_seg_offset: i64,
    pub cur_seg_size: i64,
    /// Timestamp of the last delivered packet, in 90 kHz ticks.
    pub cur_timestamp: i64,
    pub period_start: i64,
    pub period_duration: i64,
    pub period_media_presentation_duration: i64,
    /// Set by the byte stream when the current segment ended and the inner parser must be
    /// reopened on the next one.
    pub is_restart_needed: bool,
}

/// A DASH presentation: the global timing attributes of the MPD plus the representations of the
/// currently selected period.
#[derive(Debug, Clone)]
pub struct Presentation {
    /// The manifest document URL (after any redirect), used for refresh.
    pub mpd_url: Url,
    pub base_url: Url,
    pub is_live: bool,
    /// Epoch seconds; 0 when the manifest carries no availabilityStartTime.
    pub availability_start_time: i64,
    pub publish_time: i64,
    pub minimum_update_period: i64,
    pub time_shift_buffer_depth: i64,
    pub suggested_presentation_delay: i64,
    pub min_buffer_time: i64,
    /// Seconds; 0 when unknown (live).
    pub media_presentation_duration: i64,
    pub period_start: i64,
    pub period_duration: i64,
    pub program_information: Option<ProgramInformation>,
    pub videos: Vec<Representation>,
    pub audios: Vec<Representation>,
    pub subtitles: Vec<Representation>,
}


// Frame rate attributes are rational numbers serialized as "30000/1001", or plain integers.
pub(crate) fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        if let Ok(numerator) = num.parse::<u64>() {
            if let Ok(denominator) = den.parse::<u64>() {
                if denominator > 0 {
                    return Some(numerator as f64 / denominator as f64);
                }
            }
        }
        return None;
    }
    s.parse::<u64>().ok().map(|n| n as f64)
}

fn duration_secs(d: &Option<std::time::Duration>) -> i64 {
    d.map_or(0, |d| d.as_secs() as i64)
}

/// Select the Period active at `curr_timepoint` (seconds into the presentation). The chosen
/// Period is the one whose start is ≤ `curr_timepoint` with the smallest non-negative gap; when
/// none matches, the latest Period whose start is ≥ the previously-remembered period start is
/// used as a default. Returns the period, its start in seconds, and whether the default rule was
/// applied.
pub fn select_period<'a>(
    mpd: &'a MPD,
    curr_timepoint: i64,
    remembered_period_start: i64,
) -> Result<(&'a Period, i64, bool), DashDemuxError> {
    let mut chosen: Option<(&Period, i64)> = None;
    for p in &mpd.periods {
        let start = duration_secs(&p.start);
        if start <= curr_timepoint && chosen.map_or(true, |(_, s)| start >= s) {
            chosen = Some((p, start));
        }
    }
    if let Some((p, start)) = chosen {
        return Ok((p, start, false));
    }
    // No period covers the playback position; fall back to the latest period at or after the
    // previously active one.
    let mut fallback: Option<(&Period, i64)> = None;
    for p in &mpd.periods {
        let start = duration_secs(&p.start);
        if start >= remembered_period_start && fallback.map_or(true, |(_, s)| start >= s) {
            fallback = Some((p, start));
        }
    }
    match fallback {
        Some((p, start)) => Ok((p, start, true)),
        None => Err(DashDemuxError::InvalidManifest(
            format!("no Period matches timepoint {curr_timepoint}"))),
    }
}

// SegmentTemplate attributes are inherited: a Representation-level template overrides the
// enclosing AdaptationSet's, which overrides the Period's, attribute by attribute.
fn merged_segment_template(levels: [Option<&SegmentTemplate>; 3]) -> Option<SegmentTemplate> {
    let mut merged: Option<SegmentTemplate> = None;
    for st in levels.into_iter().flatten() {
        merged = Some(match merged {
            None => st.clone(),
            Some(outer) => SegmentTemplate {
                initialization: st.initialization.clone().or(outer.initialization),
                media: st.media.clone().or(outer.media),
                SegmentTimeline: st.SegmentTimeline.clone().or(outer.SegmentTimeline),
                startNumber: st.startNumber.or(outer.startNumber),
                duration: st.duration.or(outer.duration),
                timescale: st.timescale.or(outer.timescale),
                presentationTimeOffset: st.presentationTimeOffset.or(outer.presentationTimeOffset),
            },
        });
    }
    merged
}

fn range_fragment(url: Url, range: Option<&String>) -> Result<Fragment, DashDemuxError> {
    match range {
        Some(r) => {
            let (start, end) = parse_range(r)?;
            Ok(Fragment { url, url_offset: start as i64, size: (end - start + 1) as i64 })
        },
        None => Ok(Fragment { url, url_offset: 0, size: -1 }),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_representation(
    xml_rep: &crate::Representation,
    adaptation: &AdaptationSet,
    period: &Period,
    kind: MediaKind,
    ordinal: usize,
    period_base: &Url,
    globals: &Presentation,
    options: &DemuxOptions,
    now: i64,
) -> Result<Representation, DashDemuxError> {
    let mut base_url = period_base.clone();
    if let Some(bu) = &adaptation.BaseURL {
        base_url = merge_baseurls(&base_url, &bu.base)?;
    }
    if let Some(bu) = &xml_rep.BaseURL {
        base_url = merge_baseurls(&base_url, &bu.base)?;
    }
    let id = xml_rep.id.clone().unwrap_or_else(|| ordinal.to_string());
    let bandwidth = xml_rep.bandwidth.unwrap_or(0);
    let template_dict = HashMap::from([
        ("RepresentationID", id.clone()),
        ("Bandwidth", bandwidth.to_string()),
    ]);

    let template = merged_segment_template([
        period.SegmentTemplate.as_ref(),
        adaptation.SegmentTemplate.as_ref(),
        xml_rep.SegmentTemplate.as_ref(),
    ]);
    let segment_list: Option<&SegmentList> = xml_rep.SegmentList.as_ref()
        .or(adaptation.SegmentList.as_ref())
        .or(period.SegmentList.as_ref());

    let mut fragment_duration = 0;
    let mut fragment_timescale = 1;
    let mut presentation_timeoffset = None;
    let mut first_seq_no = 1;
    let mut init_section = None;
    let index;
    if let Some(st) = template.as_ref().filter(|st| st.media.is_some()) {
        let media = st.media.clone().unwrap_or_default();
        fragment_timescale = st.timescale.unwrap_or(1);
        fragment_duration = st.duration.unwrap_or(0);
        presentation_timeoffset = st.presentationTimeOffset;
        first_seq_no = st.startNumber.unwrap_or(1);
        if let Some(init) = &st.initialization {
            let path = resolve_url_template(init, &template_dict);
            init_section = Some(Fragment {
                url: merge_baseurls(&base_url, &path)?,
                url_offset: 0,
                size: -1,
            });
        }
        let entries: Vec<TimelineEntry> = st.SegmentTimeline.as_ref()
            .map(|stl| stl.segments.iter()
                 .map(|s| TimelineEntry {
                     start_time: s.t.unwrap_or(0),
                     duration: s.d,
                     repeat: s.r.unwrap_or(0),
                 })
                 .collect())
            .unwrap_or_default();
        if !entries.is_empty() {
            index = SegmentIndex::Timeline { media, entries };
        } else if fragment_duration > 0 {
            index = SegmentIndex::TemplateDuration { media };
        } else {
            return Err(DashDemuxError::InvalidManifest(
                format!("representation {id} has a SegmentTemplate with neither timeline nor duration")));
        }
    } else if let Some(sl) = segment_list {
        fragment_timescale = sl.timescale.unwrap_or(1);
        fragment_duration = sl.duration.unwrap_or(0);
        first_seq_no = sl.startNumber.unwrap_or(1);
        if let Some(init) = &sl.Initialization {
            let url = match &init.sourceURL {
                Some(su) => merge_baseurls(&base_url, &resolve_url_template(su, &template_dict))?,
                None => base_url.clone(),
            };
            init_section = Some(range_fragment(url, init.range.as_ref())?);
        }
        let mut fragments = Vec::with_capacity(sl.segment_urls.len());
        for su in &sl.segment_urls {
            let url = match &su.media {
                Some(m) => merge_baseurls(&base_url, m)?,
                None => base_url.clone(),
            };
            fragments.push(range_fragment(url, su.mediaRange.as_ref())?);
        }
        index = SegmentIndex::List(fragments);
    } else if xml_rep.BaseURL.is_some() || adaptation.BaseURL.is_some() {
        // A representation with a plain BaseURL and no segment descriptor is served as a single
        // fragment covering the whole resource.
        index = SegmentIndex::List(vec![Fragment {
            url: base_url.clone(),
            url_offset: 0,
            size: -1,
        }]);
    } else {
        return Err(DashDemuxError::InvalidManifest(
            format!("representation {id} carries no segment information")));
    }

    let mut rep = Representation {
        id,
        kind,
        bandwidth,
        lang: xml_rep.lang.clone()
            .or_else(|| adaptation.lang.clone())
            .or_else(|| adaptation.ContentComponent.as_ref().and_then(|cc| cc.lang.clone())),
        codecs: xml_rep.codecs.clone().or_else(|| adaptation.codecs.clone()),
        scan_type: xml_rep.scanType.clone(),
        frame_rate: xml_rep.frameRate.clone().or_else(|| adaptation.frameRate.clone()),
        width: xml_rep.width,
        height: xml_rep.height,
        base_url,
        index,
        fragment_duration,
        fragment_timescale,
        presentation_timeoffset,
        first_seq_no,
        last_seq_no: first_seq_no,
        cur_seq_no: first_seq_no,
        init_section,
        init_buf: Vec::new(),
        init_loaded: false,
        init_read_offset: 0,
        cur_seg: None,
        cur_seg_offset: 0,
        cur_seg_size: -1,
        cur_timestamp: 0,
        period_start: globals.period_start,
        period_duration: globals.period_duration,
        period_media_presentation_duration: globals.media_presentation_duration,
        is_restart_needed: false,
    };
    rep.last_seq_no = sequencer::calc_max_seg_no(&rep, globals, now);
    for prop in &adaptation.supplemental_properties {
        if prop.schemeIdUri.as_deref() == Some(LAST_SEGMENT_NUMBER_SCHEME) {
            match prop.value.as_ref().map(|v| v.parse::<i64>()) {
                Some(Ok(last)) => rep.last_seq_no = last,
                _ => warn!("ignoring unparseable last-segment-number property"),
            }
        }
    }
    if globals.is_live {
        rep.cur_seq_no = sequencer::calc_cur_seg_no(&rep, globals, options, now)
            .max(rep.first_seq_no);
    }
    Ok(rep)
}

impl Presentation {
    /// Build the runtime presentation from manifest XML. `curr_timepoint` is the playback
    /// position in seconds (0 on first load) used for period selection;
    /// `remembered_period_start` is the start of the previously active period (0 on first load).
    /// `now` is the wall clock in epoch seconds, used for live edge computations.
    pub fn from_xml(
        xml: &str,
        doc_url: &Url,
        curr_timepoint: i64,
        remembered_period_start: i64,
        options: &DemuxOptions,
        now: i64,
    ) -> Result<Presentation, DashDemuxError> {
        let mpd = crate::parse(xml)?;
        let is_live = mpd.mpdtype.as_deref() == Some("dynamic");
        let mut base_url = doc_url.clone();
        // There may be several BaseURL elements for redundancy; we don't implement failover
        if let Some(bu) = mpd.base_urls.first() {
            base_url = merge_baseurls(&base_url, &bu.base)?;
        }

        let (period, period_start, used_default) =
            select_period(&mpd, curr_timepoint, remembered_period_start)?;
        let mut media_presentation_duration = duration_secs(&mpd.mediaPresentationDuration);
        let period_duration = period.duration.map(|d| d.as_secs() as i64)
            .unwrap_or(media_presentation_duration);
        if used_default && period.duration.is_some() {
            // Historical behavior: falling back to the latest period couples the presentation
            // duration to that period's own duration.
            media_presentation_duration = period_duration;
        }
        if let Some(bu) = &period.BaseURL {
            base_url = merge_baseurls(&base_url, &bu.base)?;
        }

        let mut presentation = Presentation {
            mpd_url: doc_url.clone(),
            base_url: base_url.clone(),
            is_live,
            availability_start_time: mpd.availabilityStartTime.map_or(0, |dt| dt.timestamp()),
            publish_time: mpd.publishTime.map_or(0, |dt| dt.timestamp()),
            minimum_update_period: duration_secs(&mpd.minimumUpdatePeriod),
            time_shift_buffer_depth: duration_secs(&mpd.timeShiftBufferDepth),
            suggested_presentation_delay: duration_secs(&mpd.suggestedPresentationDelay),
            min_buffer_time: duration_secs(&mpd.minBufferTime),
            media_presentation_duration,
            period_start,
            period_duration,
            program_information: mpd.ProgramInformation.clone(),
            videos: Vec::new(),
            audios: Vec::new(),
            subtitles: Vec::new(),
        };

        for adaptation in &period.adaptations {
            let kind = if is_video_adaptation(&adaptation) {
                MediaKind::Video
            } else if is_audio_adaptation(&adaptation) {
                MediaKind::Audio
            } else if is_subtitle_adaptation(&adaptation) {
                MediaKind::Subtitle
            } else {
                warn!("ignoring AdaptationSet with unrecognized content type");
                continue;
            };
            for xml_rep in &adaptation.representations {
                let ordinal = match kind {
                    MediaKind::Video => presentation.videos.len(),
                    MediaKind::Audio => presentation.audios.len(),
                    MediaKind::Subtitle => presentation.subtitles.len(),
                };
                let rep = build_representation(
                    xml_rep, adaptation, period, kind, ordinal,
                    &base_url, &presentation, options, now)?;
                match kind {
                    MediaKind::Video => presentation.videos.push(rep),
                    MediaKind::Audio => presentation.audios.push(rep),
                    MediaKind::Subtitle => presentation.subtitles.push(rep),
                }
            }
        }
        Ok(presentation)
    }

    pub fn representation_count(&self) -> usize {
        self.videos.len() + self.audios.len() + self.subtitles.len()
    }
}
