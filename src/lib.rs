//! A Rust library for demultiplexing media content described by a DASH MPD manifest.
//!
//! [DASH](https://en.wikipedia.org/wiki/Dynamic_Adaptive_Streaming_over_HTTP) (dynamic adaptive
//! streaming over HTTP), also called MPEG-DASH, is a technology used for media streaming over the
//! web, used both for video on demand (VOD) services and for live/OTT television. The Media
//! Presentation Description (MPD) is a description of the resources (manifest or “playlist”)
//! forming a streaming service, that a DASH client uses to determine which assets to request in
//! order to play the content.
//!
//! This library provides a serde-based parser for the subset of the DASH MPD format (formally
//! defined in ISO/IEC standard 23009-1) needed for demultiplexing, and a demuxer core that turns
//! an MPD URL into an ordered stream of elementary media packets: it computes which segment to
//! fetch next for each representation (from timeline, template or list descriptors, including
//! live clock-driven sequence numbers), splices the initialization section in front of the
//! segment bytes, refreshes dynamic manifests without losing the playback position, and
//! interleaves the packets of the active representations in presentation order. When MPD files in
//! practical use diverge from the formal standard, this library prefers to interoperate with
//! existing practice.
//!
//! The byte-oriented resource opener and the inner container parsers (fragmented MP4, MPEG-2 TS)
//! are collaborator seams expressed as traits; a default opener over HTTP(S) and local files is
//! provided.
//!
//! ## DASH features supported
//!
//! - VOD (static) and live (dynamic) stream manifests, with manifest refresh
//! - All three segment index forms: SegmentTimeline, SegmentTemplate@duration, SegmentList
//! - Multi-period content (the period active at the playback position is selected)
//!
//! ## Limitations / unsupported features
//!
//! - Encrypted content using DRM such as Encrypted Media Extensions (EME)
//! - Adaptive bitrate switching between representations
//! - XLink elements

#![allow(non_snake_case)]

pub mod demux;
pub mod fetch;
pub mod presentation;
pub mod refresh;
pub mod resolver;
pub mod sequencer;
pub mod stream;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de;
use serde::Deserialize;
use std::cmp::min;
use std::time::Duration;
use thiserror::Error;


/// Errors produced while opening or demultiplexing a DASH presentation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DashDemuxError {
    /// The manifest is missing, too large, structurally invalid, or references resources through
    /// a scheme we refuse to open.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("parse error: {0}")]
    Parsing(String),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("invalid datetime: {0}")]
    InvalidDateTime(String),
    /// A manifest refresh returned a representation whose media parameters (codecs, resolution,
    /// frame rate) no longer match the stream being played. The consumer must reopen.
    #[error("media parameters changed during manifest refresh: {0}")]
    InputChanged(String),
    #[error("I/O error {1} ({0})")]
    Io(#[source] std::io::Error, String),
    #[error("network error: {0}")]
    Network(String),
    #[error("network timeout: {0}")]
    NetworkTimeout(String),
    #[error("network connection error: {0}")]
    NetworkConnect(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The interrupt callback requested cancellation.
    #[error("interrupted")]
    Interrupted,
    #[error("{0}")]
    Other(String),
}

/// Configuration values recognized by the demuxer.
#[derive(Debug, Clone)]
pub struct DemuxOptions {
    /// Comma-separated list of filename extensions that file:// segment URLs may carry. The
    /// literal value `ALL` disables the check.
    pub allowed_extensions: String,
    /// Normalize timeline walk targets by `startNumber`, so that manifests which index their
    /// SegmentTimeline entries from `@startNumber` rather than from zero address the timeline
    /// correctly. Manifests in the wild vary; this matches the common case.
    pub use_timeline_segment_offset_correction: bool,
    /// When the live edge computation lands exactly on the segment currently being produced,
    /// step one segment back so that only finalized segments are requested.
    pub fetch_completed_segments_only: bool,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        DemuxOptions {
            allowed_extensions: String::from("aac,m4a,m4s,m4v,mov,mp4,webm,ts"),
            use_timeline_segment_offset_correction: true,
            fetch_completed_segments_only: true,
        }
    }
}

impl DemuxOptions {
    pub fn allowed_extensions(mut self, extensions: &str) -> DemuxOptions {
        self.allowed_extensions = String::from(extensions);
        self
    }

    pub fn timeline_segment_offset_correction(mut self, enable: bool) -> DemuxOptions {
        self.use_timeline_segment_offset_correction = enable;
        self
    }

    pub fn fetch_completed_segments_only(mut self, enable: bool) -> DemuxOptions {
        self.fetch_completed_segments_only = enable;
        self
    }
}


// Parse an XML duration string, as per https://www.w3.org/TR/xmlschema-2/#duration
//
// The lexical representation for duration is the ISO 8601 extended format PnYn MnDTnH nMnS, where
// nY represents the number of years, nM the number of months, nD the number of days, 'T' is the
// date/time separator, nH the number of hours, nM the number of minutes and nS the number of
// seconds. The number of seconds can include decimal digits to arbitrary precision.
//
// Examples: "PT0H0M30.030S", "PT1.2S", PT1004199059S, PT130S
// P2Y6M5DT12H35M30S	=> 2 years, 6 months, 5 days, 12 hours, 35 minutes, 30 seconds
// P1DT2H => 1 day, 2 hours
// PT1M30.5S => 1 minute, 30.5 seconds
pub(crate) fn parse_xs_duration(s: &str) -> Result<Duration, DashDemuxError> {
    match iso8601::duration(s) {
        Ok(iso_duration) => {
            match iso_duration {
                iso8601::Duration::Weeks(w) => Ok(Duration::new(w as u64 * 60 * 60 * 24 * 7, 0)),
                iso8601::Duration::YMDHMS { year, month, day, hour, minute, second, millisecond } => {
                    // note that if year and month are specified, we are not going to do a very
                    // good conversion here
                    let mut secs: u64 = second.into();
                    secs += minute as u64 * 60;
                    secs += hour as u64 * 60 * 60;
                    secs += day as u64 * 60 * 60 * 24;
                    secs += month as u64 * 60 * 60 * 24 * 31;
                    secs += year as u64 * 60 * 60 * 24 * 31 * 365;
                    Ok(Duration::new(secs, millisecond * 1_000_000))
                },
            }
        },
        Err(e) => Err(DashDemuxError::InvalidDuration(format!("{s}: {e:?}"))),
    }
}

// Parse an XML dateTime, an ISO 8601 UTC date such as "2022-09-15T16:35:08Z". Some manifests in
// the wild omit the timezone designator.
pub(crate) fn parse_xs_datetime(s: &str) -> Result<DateTime<Utc>, DashDemuxError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| DashDemuxError::InvalidDateTime(format!("{s}: {e}")))
}

// Deserialize an optional XML duration string to an Option<Duration>. This is a little trickier
// than deserializing a required field with serde.
fn deserialize_xs_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    match <Option<String>>::deserialize(deserializer) {
        Ok(optstring) => match optstring {
            Some(xs) => match parse_xs_duration(&xs) {
                Ok(d) => Ok(Some(d)),
                Err(e) => Err(de::Error::custom(e)),
            },
            None => Ok(None),
        },
        // the field isn't present, return an Ok(None)
        Err(_) => Ok(None),
    }
}

fn deserialize_xs_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    match <Option<String>>::deserialize(deserializer) {
        Ok(optstring) => match optstring {
            Some(xs) => match parse_xs_datetime(&xs) {
                Ok(d) => Ok(Some(d)),
                Err(e) => Err(de::Error::custom(e)),
            },
            None => Ok(None),
        },
        Err(_) => Ok(None),
    }
}


// The MPD format is documented by ISO using an XML Schema at
// https://standards.iso.org/ittf/PubliclyAvailableStandards/MPEG-DASH_schema_files/DASH-MPD-edition2.xsd
// We are using the quick_xml + serde crates to deserialize the XML content to Rust structs. Note
// that serde will ignore unknown fields when deserializing, so we don't need to cover every single
// possible field; only the subset that feeds the segment sequencer is declared here.

/// The title of the media stream.
#[derive(Debug, Deserialize, Clone)]
pub struct Title {
    #[serde(rename = "$text")]
    pub content: Option<String>,
}

/// Metainformation concerning the media stream (title, language, etc.)
#[derive(Debug, Deserialize, Clone)]
pub struct ProgramInformation {
    pub Title: Option<Title>,
    /// Language in RFC 5646 format
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@moreInformationURL")]
    pub moreInformationURL: Option<String>,
}

/// Describes a sequence of contiguous Segments with identical duration.
#[derive(Debug, Deserialize, Clone)]
pub struct S {
    /// Time (in @timescale units) at which this run of segments starts. Absent means contiguous
    /// with the preceding entry.
    #[serde(rename = "@t")]
    pub t: Option<i64>,
    /// The duration (shall not exceed the value of MPD@maxSegmentDuration)
    #[serde(rename = "@d")]
    pub d: i64,
    /// The repeat count (number of contiguous Segments with identical MPD duration minus one),
    /// defaulting to zero if not present. -1 means "repeat until the end of the Period".
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

/// Contains a sequence of `S` elements, each of which describes a sequence of contiguous segments
/// of identical duration.
#[derive(Debug, Deserialize, Clone)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<S>,
}

/// The first media segment in a sequence of Segments. Subsequent segments can be concatenated to
/// this segment to produce a media stream.
#[derive(Debug, Deserialize, Clone)]
pub struct Initialization {
    #[serde(rename = "@sourceURL")]
    pub sourceURL: Option<String>,
    #[serde(rename = "@range")]
    pub range: Option<String>,
}

/// Allows template-based `SegmentURL` construction. Specifies various substitution rules using
/// dynamic values such as `$Time$` and `$Number$` that map to a sequence of Segments.
#[derive(Debug, Deserialize, Clone)]
pub struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    pub SegmentTimeline: Option<SegmentTimeline>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<i64>,
    // note: the spec says this is an unsigned int, not an xs:duration
    #[serde(rename = "@duration")]
    pub duration: Option<i64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<i64>,
    #[serde(rename = "@presentationTimeOffset")]
    pub presentationTimeOffset: Option<i64>,
}

/// A URI string that specifies one or more common locations for Segments and other resources.
#[derive(Debug, Deserialize, Clone)]
pub struct BaseURL {
    #[serde(rename = "$text", default)]
    pub base: String,
}

/// The URL of a media segment.
#[derive(Debug, Deserialize, Clone)]
pub struct SegmentURL {
    #[serde(rename = "@media")]
    pub media: Option<String>, // actually an URI
    #[serde(rename = "@mediaRange")]
    pub mediaRange: Option<String>,
}

/// Contains a sequence of SegmentURL elements.
#[derive(Debug, Deserialize, Clone)]
pub struct SegmentList {
    // note: the spec says this is an unsigned int, not an xs:duration
    #[serde(rename = "@duration")]
    pub duration: Option<i64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<i64>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<i64>,
    pub Initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL", default)]
    pub segment_urls: Vec<SegmentURL>,
}

/// Additional information concerning an AdaptationSet, keyed by a scheme URI. The scheme
/// `http://dashif.org/guidelines/last-segment-number` carries the sequence number of the last
/// available segment.
#[derive(Debug, Deserialize, Clone)]
pub struct SupplementalProperty {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

/// A representation describes a version of the content, using a specific encoding and bitrate.
/// Streams often have multiple representations with different bitrates, to allow the client to
/// select that most suitable to its network conditions.
#[derive(Debug, Deserialize, Clone)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    // The specification says that @mimeType is mandatory, but it's not always present on
    // akamaized.net MPDs
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    /// An RFC6381 string, <https://tools.ietf.org/html/rfc6381>
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    /// If present, this attribute is expected to be set to "progressive" or "interlaced".
    #[serde(rename = "@scanType")]
    pub scanType: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    /// Can be a rational such as "30000/1001"
    #[serde(rename = "@frameRate")]
    pub frameRate: Option<String>,
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    pub BaseURL: Option<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentList: Option<SegmentList>,
}

/// Describes a media content component.
#[derive(Debug, Deserialize, Clone)]
pub struct ContentComponent {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    /// Language in RFC 5646 format
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
}

/// Contains a set of Representations. For example, if multiple language streams are available for
/// the audio content, each one can be in its own AdaptationSet.
#[derive(Debug, Deserialize, Clone)]
pub struct AdaptationSet {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    pub BaseURL: Option<BaseURL>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    /// Content language, in RFC 5646 format
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    /// An RFC6381 string, <https://tools.ietf.org/html/rfc6381>
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@frameRate")]
    pub frameRate: Option<String>, // it can be something like "15/2"
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentList: Option<SegmentList>,
    pub ContentComponent: Option<ContentComponent>,
    #[serde(rename = "SupplementalProperty", default)]
    pub supplemental_properties: Vec<SupplementalProperty>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

/// Describes a chunk of the content with a start time and a duration. Content can be split up
/// into multiple periods (such as chapters, advertising segments).
#[derive(Debug, Deserialize, Clone)]
pub struct Period {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@start", default, deserialize_with = "deserialize_xs_duration")]
    pub start: Option<Duration>,
    // note: the spec says that this is an xs:duration, not an unsigned int as for other
    // "duration" fields
    #[serde(rename = "@duration", default, deserialize_with = "deserialize_xs_duration")]
    pub duration: Option<Duration>,
    pub BaseURL: Option<BaseURL>,
    pub SegmentTemplate: Option<SegmentTemplate>,
    pub SegmentList: Option<SegmentList>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptations: Vec<AdaptationSet>,
}

/// The root node of a parsed DASH MPD manifest.
#[derive(Debug, Deserialize, Clone)]
pub struct MPD {
    #[serde(rename = "@type")]
    pub mpdtype: Option<String>,
    #[serde(rename = "@profiles")]
    pub profiles: Option<String>,
    #[serde(rename = "@minBufferTime", default, deserialize_with = "deserialize_xs_duration")]
    pub minBufferTime: Option<Duration>,
    #[serde(rename = "@minimumUpdatePeriod", default, deserialize_with = "deserialize_xs_duration")]
    pub minimumUpdatePeriod: Option<Duration>,
    #[serde(rename = "@timeShiftBufferDepth", default, deserialize_with = "deserialize_xs_duration")]
    pub timeShiftBufferDepth: Option<Duration>,
    #[serde(rename = "@mediaPresentationDuration", default, deserialize_with = "deserialize_xs_duration")]
    pub mediaPresentationDuration: Option<Duration>,
    #[serde(rename = "@suggestedPresentationDelay", default, deserialize_with = "deserialize_xs_duration")]
    pub suggestedPresentationDelay: Option<Duration>,
    #[serde(rename = "@publishTime", default, deserialize_with = "deserialize_xs_datetime")]
    pub publishTime: Option<DateTime<Utc>>,
    #[serde(rename = "@availabilityStartTime", default, deserialize_with = "deserialize_xs_datetime")]
    pub availabilityStartTime: Option<DateTime<Utc>>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
    /// There may be several BaseURLs, for redundancy (for example multiple CDNs)
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseURL>,
    pub ProgramInformation: Option<ProgramInformation>,
}


/// Parse an MPD manifest, provided as an XML string, returning an `MPD` node.
pub fn parse(xml: &str) -> Result<MPD, DashDemuxError> {
    let mpd: MPD = quick_xml::de::from_str(xml)
        .map_err(|e| DashDemuxError::InvalidManifest(format!("deserializing MPD: {e}")))?;
    Ok(mpd)
}


// The DASH profile URNs that identify a manifest we know how to sequence.
const KNOWN_PROFILES: [&str; 5] = [
    "dash:profile:isoff-on-demand:2011",
    "dash:profile:isoff-live:2011",
    "dash:profile:isoff-live:2012",
    "dash:profile:isoff-main:2011",
    "3GPP:PSS:profile:DASH1",
];

/// Content sniffing: returns `true` if the initial bytes of a resource look like a DASH MPD
/// manifest. Only the first 4 KiB are considered.
pub fn probe(data: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&data[..min(data.len(), 4096)]);
    if !head.contains("<MPD") {
        return false;
    }
    KNOWN_PROFILES.iter().any(|p| head.contains(p)) || head.contains("dash:profile")
}


/// Returns `true` if this AdaptationSet contains audio content.
///
/// It contains audio if the `contentType` attribute is `audio`, or the `mimeType` attribute is
/// `audio/*`, or if one of its child `Representation` nodes has an audio `contentType` or
/// `mimeType` attribute, or if its ContentComponent describes audio.
pub fn is_audio_adaptation(a: &&AdaptationSet) -> bool {
    adaptation_content_type(a, "audio")
}

/// Returns `true` if this AdaptationSet contains video content.
pub fn is_video_adaptation(a: &&AdaptationSet) -> bool {
    adaptation_content_type(a, "video")
}

/// Returns `true` if this AdaptationSet contains subtitle content (a `text` content type).
pub fn is_subtitle_adaptation(a: &&AdaptationSet) -> bool {
    adaptation_content_type(a, "text")
}

fn adaptation_content_type(a: &&AdaptationSet, wanted: &str) -> bool {
    let mime_prefix = format!("{wanted}/");
    if let Some(ct) = &a.contentType {
        if ct == wanted {
            return true;
        }
    }
    if let Some(mimetype) = &a.mimeType {
        if mimetype.starts_with(&mime_prefix) {
            return true;
        }
    }
    if let Some(cc) = &a.ContentComponent {
        if let Some(ct) = &cc.contentType {
            if ct == wanted {
                return true;
            }
        }
    }
    for r in a.representations.iter() {
        if let Some(ct) = &r.contentType {
            if ct == wanted {
                return true;
            }
        }
        if let Some(mimetype) = &r.mimeType {
            if mimetype.starts_with(&mime_prefix) {
                return true;
            }
        }
    }
    false
}
