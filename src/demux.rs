//! The demuxer orchestrator: one inner container parser per enabled representation, packets
//! interleaved in presentation order.
//!
//! The orchestrator owns a [`StreamDriver`] per representation (its sequencing state, its byte
//! stream and its container parser) and exposes the classic demuxer surface: `open`,
//! `read_packet`, `seek`, `close`. Inner container parsers (fragmented MP4, MPEG-2 TS, WebM) are
//! external collaborators: they are obtained through a [`ContainerProbe`] registry and speak to
//! the byte stream through a [`SegmentReader`].

use crate::fetch::{ByteSource, DefaultOpener, ResourceOpener};
use crate::presentation::{MediaKind, Presentation, Representation, SegmentIndex};
use crate::stream::{load_init_section, SegmentStream, StreamContext};
use crate::{DashDemuxError, DemuxOptions};
use chrono::Utc;
use std::cmp::min;
use std::io::Read;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;


/// Packet timestamps delivered by the demuxer are expressed in this tick rate (90 kHz).
pub const TIME_BASE: i64 = 90_000;

// How much of the head of a representation is handed to the container probe.
const PROBE_BUFFER_SIZE: usize = 4096;

// value * num / den without intermediate overflow.
fn rescale(value: i64, num: i64, den: i64, round_up: bool) -> i64 {
    if den == 0 {
        return 0;
    }
    let prod = value as i128 * num as i128;
    let den = den as i128;
    let q = if round_up && prod >= 0 {
        (prod + den - 1) / den
    } else {
        prod / den
    };
    q as i64
}

fn not_open() -> DashDemuxError {
    DashDemuxError::Other(String::from("presentation is not open"))
}


/// A packet as produced by an inner container parser, timestamped in the parser's own time base.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub pts: i64,
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// An elementary media packet with its DASH side metadata attached.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    pub kind: MediaKind,
    /// Presentation timestamp in `time_base` units.
    pub pts: i64,
    /// The parser's time base as (numerator, denominator).
    pub time_base: (i64, i64),
    pub data: Vec<u8>,
    pub keyframe: bool,
    /// `pts` rescaled to [`TIME_BASE`] ticks.
    pub timestamp: i64,
    /// Sequence number of the segment this packet came from.
    pub seg_number: i64,
    /// Size in bytes of that segment, -1 when unknown.
    pub seg_size: i64,
    pub frag_timescale: i64,
    pub frag_duration: i64,
}

/// Program metadata for one stream of the presentation.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub kind: MediaKind,
    pub id: String,
    pub language: Option<String>,
    pub variant_bitrate: u64,
    pub codecs: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub time_base: (i64, i64),
}

/// Per-stream discard level, set by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discard {
    /// Deliver everything.
    None,
    /// Deliver what the parser deems useful.
    #[default]
    Default,
    /// Discard the whole stream: the representation is disabled and its transport closed.
    All,
}

/// Seek behavior flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeekFlags {
    /// Round the target position down (land at or before the requested timestamp).
    pub backward: bool,
    /// Byte-offset seeking; not supported by the DASH layer.
    pub byte: bool,
}


/// What an inner container parser sees of a representation: a byte stream (init section first,
/// then segment bodies back to back) plus a few capability queries.
pub struct SegmentReader<'a> {
    rep: &'a mut Representation,
    stream: &'a mut SegmentStream,
    ctx: StreamContext<'a>,
    byte_seekable: bool,
    pending_error: Option<DashDemuxError>,
}

impl SegmentReader<'_> {
    /// Read with a typed error, for parsers that propagate [`DashDemuxError`] themselves.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, DashDemuxError> {
        self.stream.read(self.rep, &mut self.ctx, buf)
    }

    /// Whether byte-level seeking is available (VOD served as a single explicit fragment).
    pub fn byte_seekable(&self) -> bool {
        self.byte_seekable
    }

    pub fn seek_bytes(&mut self, pos: u64) -> Result<(), DashDemuxError> {
        if !self.byte_seekable {
            return Err(DashDemuxError::Other(String::from("stream is not byte seekable")));
        }
        self.stream.seek_bytes(self.rep, &mut self.ctx, pos)
    }

    /// Inner parsers are not allowed to open external resources; every request is rejected.
    pub fn nested_io_open(&mut self, url: &str) -> Result<ByteSource, DashDemuxError> {
        Err(DashDemuxError::PermissionDenied(
            format!("inner parser attempted to open {url}")))
    }

    fn take_error(&mut self) -> Option<DashDemuxError> {
        self.pending_error.take()
    }
}

// std::io::Read for parsers written against generic readers. A structural error (interrupted,
// refresh failure, input change) is stashed so the orchestrator can surface it typed.
impl Read for SegmentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.read_bytes(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let kind = match e {
                    DashDemuxError::Interrupted => std::io::ErrorKind::Interrupted,
                    _ => std::io::ErrorKind::Other,
                };
                let msg = e.to_string();
                self.pending_error = Some(e);
                Err(std::io::Error::new(kind, msg))
            },
        }
    }
}


/// An inner container parser (fragmented MP4, MPEG-2 TS, WebM...). Implementations consume the
/// representation byte stream through the [`SegmentReader`] they are handed on every call.
pub trait ContainerParser {
    /// Called once with the stream positioned at its start (init section first). Returns the
    /// time base (numerator, denominator) of the pts values this parser produces.
    fn open(&mut self, src: &mut SegmentReader) -> Result<(i64, i64), DashDemuxError>;

    /// `Ok(None)` signals the end of the byte stream; the orchestrator decides whether that is
    /// the end of one segment (restart) or of the whole representation.
    fn next_packet(&mut self, src: &mut SegmentReader)
                   -> Result<Option<ParsedPacket>, DashDemuxError>;

    /// Frame-accurate seek, invoked only when the byte stream itself is seekable.
    fn seek(&mut self, src: &mut SegmentReader, pos_msec: i64) -> Result<(), DashDemuxError>;
}

/// Registry of known container formats: inspects the first bytes of a representation and
/// instantiates a parser for it.
pub trait ContainerProbe {
    fn probe(&self, header: &[u8]) -> Option<Box<dyn ContainerParser>>;
}


struct StreamDriver {
    rep: Representation,
    stream: SegmentStream,
    parser: Option<Box<dyn ContainerParser>>,
    time_base: (i64, i64),
    discard: Discard,
    enabled: bool,
    finished: bool,
}

/// Demultiplexer for a DASH presentation.
///
/// ```no_run
/// use dash_demux::demux::DashDemuxer;
/// # fn probe() -> Box<dyn dash_demux::demux::ContainerProbe> { unimplemented!() }
///
/// let mut demuxer = DashDemuxer::new("https://example.net/content/stream.mpd")
///     .with_container_probe(probe());
/// demuxer.open()?;
/// while let Some(packet) = demuxer.read_packet()? {
///     println!("stream {} pts {} (segment {})",
///              packet.stream_index, packet.pts, packet.seg_number);
/// }
/// # Ok::<(), dash_demux::DashDemuxError>(())
/// ```
pub struct DashDemuxer {
    mpd_url: String,
    options: DemuxOptions,
    opener: Option<Arc<dyn ResourceOpener>>,
    container_probe: Option<Box<dyn ContainerProbe>>,
    interrupt: Arc<dyn Fn() -> bool>,
    clock: Arc<dyn Fn() -> i64>,
    presentation: Option<Presentation>,
    drivers: Vec<StreamDriver>,
    duration: Option<i64>,
    seekable: bool,
}

impl DashDemuxer {
    pub fn new(mpd_url: &str) -> DashDemuxer {
        DashDemuxer {
            mpd_url: String::from(mpd_url),
            options: DemuxOptions::default(),
            opener: None,
            container_probe: None,
            interrupt: Arc::new(|| false),
            clock: Arc::new(|| Utc::now().timestamp()),
            presentation: None,
            drivers: Vec::new(),
            duration: None,
            seekable: false,
        }
    }

    pub fn with_options(mut self, options: DemuxOptions) -> DashDemuxer {
        self.options = options;
        self
    }

    /// Substitute the resource opener (the default opens HTTP(S) and allowlisted files).
    pub fn with_opener(mut self, opener: Arc<dyn ResourceOpener>) -> DashDemuxer {
        self.opener = Some(opener);
        self
    }

    /// Register the container parser registry. Required before `open`.
    pub fn with_container_probe(mut self, probe: Box<dyn ContainerProbe>) -> DashDemuxer {
        self.container_probe = Some(probe);
        self
    }

    /// Install a cancellation callback, polled in every blocking loop. Returning `true` aborts
    /// the current operation with [`DashDemuxError::Interrupted`].
    pub fn with_interrupt(mut self, interrupt: Arc<dyn Fn() -> bool>) -> DashDemuxer {
        self.interrupt = interrupt;
        self
    }

    /// Override the wall clock used for live edge computations (deterministic replay, tests).
    pub fn with_wall_clock(mut self, clock: Arc<dyn Fn() -> i64>) -> DashDemuxer {
        self.clock = clock;
        self
    }

    /// Fetch and parse the manifest, build the representation drivers, load (and share) the
    /// initialization sections, and probe a container parser for every stream.
    pub fn open(&mut self) -> Result<(), DashDemuxError> {
        if self.container_probe.is_none() {
            return Err(DashDemuxError::Other(
                String::from("no container parser registry configured")));
        }
        if self.opener.is_none() {
            self.opener = Some(Arc::new(DefaultOpener::new(&self.options)?));
        }
        let opener = self.opener.clone().ok_or_else(not_open)?;
        let doc_url = Url::parse(&self.mpd_url)
            .map_err(|e| DashDemuxError::InvalidManifest(format!("MPD URL: {e}")))?;
        let now = (self.clock)();
        let (xml, final_url) = opener.fetch_document(&doc_url)?;
        let mut presentation =
            Presentation::from_xml(&xml, &final_url, 0, 0, &self.options, now)?;
        if presentation.representation_count() == 0 {
            return Err(DashDemuxError::InvalidManifest(
                String::from("manifest contains no playable representation")));
        }
        self.duration = if presentation.is_live {
            None
        } else {
            Some(presentation.media_presentation_duration * TIME_BASE)
        };
        self.seekable = !presentation.is_live;

        let reps = presentation.videos.drain(..)
            .chain(presentation.audios.drain(..))
            .chain(presentation.subtitles.drain(..));
        let mut drivers: Vec<StreamDriver> = reps
            .map(|rep| StreamDriver {
                rep,
                stream: SegmentStream::new(),
                parser: None,
                time_base: (1, 1000),
                discard: Discard::Default,
                enabled: true,
                finished: false,
            })
            .collect();

        // Load the initialization sections up front. Representations of the same kind that
        // declare an identical init fragment share one download.
        for i in 0..drivers.len() {
            if drivers[i].rep.init_loaded {
                continue;
            }
            if let Some(init) = drivers[i].rep.init_section.clone() {
                let twin = (0..i).find(|&j| {
                    drivers[j].rep.kind == drivers[i].rep.kind
                        && drivers[j].rep.init_loaded
                        && drivers[j].rep.init_section.as_ref() == Some(&init)
                });
                if let Some(j) = twin {
                    let buf = drivers[j].rep.init_buf.clone();
                    let rep = &mut drivers[i].rep;
                    rep.init_buf = buf;
                    rep.init_loaded = true;
                    rep.init_read_offset = 0;
                    continue;
                }
            }
            load_init_section(&mut drivers[i].rep, opener.as_ref())?;
        }

        self.presentation = Some(presentation);
        self.drivers = drivers;
        for i in 0..self.drivers.len() {
            self.ensure_parser(i)?;
        }
        info!("opened DASH presentation with {} streams ({})",
              self.drivers.len(), if self.seekable { "VOD" } else { "live" });
        Ok(())
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        self.drivers.iter()
            .map(|d| StreamInfo {
                kind: d.rep.kind,
                id: d.rep.id.clone(),
                language: d.rep.lang.clone(),
                variant_bitrate: d.rep.bandwidth,
                codecs: d.rep.codecs.clone(),
                width: d.rep.width,
                height: d.rep.height,
                time_base: d.time_base,
            })
            .collect()
    }

    /// Total duration in [`TIME_BASE`] ticks; `None` for live presentations.
    pub fn duration(&self) -> Option<i64> {
        self.duration
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    pub fn is_live(&self) -> bool {
        self.presentation.as_ref().is_some_and(|p| p.is_live)
    }

    /// Set the discard level of a stream. Takes effect on the next `read_packet` call: a stream
    /// discarded entirely has its parser and transport closed, and a re-enabled stream snaps
    /// forward to the newest position of the streams that kept playing.
    pub fn set_discard(&mut self, stream_index: usize, discard: Discard)
                       -> Result<(), DashDemuxError> {
        let drv = self.drivers.get_mut(stream_index)
            .ok_or_else(|| DashDemuxError::Other(format!("no stream {stream_index}")))?;
        drv.discard = discard;
        Ok(())
    }

    // Toggle representations on or off according to their discard level.
    fn apply_discard(&mut self) {
        let catch_up = self.drivers.iter()
            .filter(|d| d.enabled)
            .map(|d| d.rep.cur_seq_no)
            .max();
        for drv in self.drivers.iter_mut() {
            let want = drv.discard != Discard::All;
            if want && !drv.enabled {
                drv.enabled = true;
                drv.finished = false;
                if let Some(target) = catch_up {
                    if target > drv.rep.cur_seq_no {
                        drv.rep.cur_seq_no = target;
                    }
                }
                drv.stream.restart(&mut drv.rep);
                drv.parser = None;
            } else if !want && drv.enabled {
                drv.enabled = false;
                drv.stream.close(&mut drv.rep);
                drv.parser = None;
            }
        }
    }

    // The next stream to read from: minimum (cur_seq_no, cur_timestamp), ties broken by stream
    // order.
    fn select_stream(&self) -> Option<usize> {
        self.drivers.iter().enumerate()
            .filter(|(_, d)| d.enabled && !d.finished)
            .min_by_key(|(_, d)| (d.rep.cur_seq_no, d.rep.cur_timestamp))
            .map(|(i, _)| i)
    }

    // Probe and open the container parser of a driver, if not already open.
    fn ensure_parser(&mut self, idx: usize) -> Result<(), DashDemuxError> {
        if self.drivers[idx].parser.is_some() {
            return Ok(());
        }
        let now = (self.clock)();
        let drv = &mut self.drivers[idx];
        let pres = self.presentation.as_mut().ok_or_else(not_open)?;
        let opener = self.opener.as_deref().ok_or_else(not_open)?;
        let probe = self.container_probe.as_deref().ok_or_else(not_open)?;
        let interrupt: &dyn Fn() -> bool = self.interrupt.as_ref();
        let byte_seekable = !pres.is_live
            && matches!(&drv.rep.index, SegmentIndex::List(f) if f.len() == 1);

        // Identify the container from the head of the stream: the init section when there is
        // one, otherwise the first bytes of the first segment (rewound afterwards).
        let header: Vec<u8> = if drv.rep.init_loaded && !drv.rep.init_buf.is_empty() {
            drv.rep.init_buf[..min(drv.rep.init_buf.len(), PROBE_BUFFER_SIZE)].to_vec()
        } else {
            let mut head = vec![0u8; PROBE_BUFFER_SIZE];
            let n = {
                let mut ctx = StreamContext {
                    presentation: &mut *pres, opener, options: &self.options, interrupt, now,
                };
                drv.stream.read(&mut drv.rep, &mut ctx, &mut head)?
            };
            head.truncate(n);
            drv.stream.restart(&mut drv.rep);
            head
        };
        let Some(mut parser) = probe.probe(&header) else {
            return Err(DashDemuxError::Other(
                format!("no container parser recognizes representation {}", drv.rep.id)));
        };
        let mut reader = SegmentReader {
            rep: &mut drv.rep,
            stream: &mut drv.stream,
            ctx: StreamContext {
                presentation: pres, opener, options: &self.options, interrupt, now,
            },
            byte_seekable,
            pending_error: None,
        };
        let opened = parser.open(&mut reader);
        if let Some(e) = reader.take_error() {
            return Err(e);
        }
        drv.time_base = opened?;
        drv.parser = Some(parser);
        Ok(())
    }

    /// Read the next packet in presentation order, or `Ok(None)` once every enabled stream has
    /// reached its end.
    pub fn read_packet(&mut self) -> Result<Option<Packet>, DashDemuxError> {
        if self.presentation.is_none() {
            return Err(not_open());
        }
        loop {
            if (self.interrupt)() {
                return Err(DashDemuxError::Interrupted);
            }
            self.apply_discard();
            let Some(idx) = self.select_stream() else {
                return Ok(None);
            };
            if self.drivers[idx].rep.is_restart_needed {
                let drv = &mut self.drivers[idx];
                drv.stream.restart(&mut drv.rep);
                drv.parser = None;
            }
            self.ensure_parser(idx)?;
            let now = (self.clock)();

            let parsed = {
                let drv = &mut self.drivers[idx];
                let pres = self.presentation.as_mut().ok_or_else(not_open)?;
                let opener = self.opener.as_deref().ok_or_else(not_open)?;
                let interrupt: &dyn Fn() -> bool = self.interrupt.as_ref();
                let byte_seekable = !pres.is_live
                    && matches!(&drv.rep.index, SegmentIndex::List(f) if f.len() == 1);
                let Some(parser) = drv.parser.as_mut() else {
                    continue;
                };
                let mut reader = SegmentReader {
                    rep: &mut drv.rep,
                    stream: &mut drv.stream,
                    ctx: StreamContext {
                        presentation: pres, opener, options: &self.options, interrupt, now,
                    },
                    byte_seekable,
                    pending_error: None,
                };
                let result = parser.next_packet(&mut reader);
                if let Some(e) = reader.take_error() {
                    return Err(e);
                }
                result?
            };

            match parsed {
                Some(p) => {
                    let drv = &mut self.drivers[idx];
                    let (num, den) = drv.time_base;
                    let timestamp = rescale(p.pts, num * TIME_BASE, den, false);
                    drv.rep.cur_timestamp = timestamp;
                    return Ok(Some(Packet {
                        stream_index: idx,
                        kind: drv.rep.kind,
                        pts: p.pts,
                        time_base: drv.time_base,
                        data: p.data,
                        keyframe: p.keyframe,
                        timestamp,
                        seg_number: drv.rep.cur_seq_no,
                        seg_size: drv.rep.cur_seg_size,
                        frag_timescale: drv.rep.fragment_timescale,
                        frag_duration: drv.rep.fragment_duration,
                    }));
                },
                None => {
                    let drv = &mut self.drivers[idx];
                    if drv.rep.is_restart_needed {
                        // segment boundary: reopen the parser on the next segment
                        drv.stream.restart(&mut drv.rep);
                        drv.parser = None;
                        continue;
                    }
                    drv.finished = true;
                },
            }
        }
    }

    /// Seek every representation to `ts`, expressed in the time base of `stream_index`. Only
    /// available for VOD presentations and non-byte seeks. Disabled representations get a
    /// dry-run seek (their state is updated without reopening anything).
    pub fn seek(&mut self, stream_index: usize, ts: i64, flags: SeekFlags)
                -> Result<(), DashDemuxError> {
        let pres = self.presentation.as_ref().ok_or_else(not_open)?;
        if pres.is_live {
            return Err(DashDemuxError::Other(String::from("cannot seek in a live stream")));
        }
        if flags.byte {
            return Err(DashDemuxError::Other(String::from("byte seeking is not supported")));
        }
        let drv = self.drivers.get(stream_index)
            .ok_or_else(|| DashDemuxError::Other(format!("no stream {stream_index}")))?;
        let (num, den) = drv.time_base;
        let seek_pos_msec = rescale(ts, num * 1000, den, !flags.backward);
        for idx in 0..self.drivers.len() {
            self.seek_driver(idx, seek_pos_msec)?;
        }
        Ok(())
    }

    fn seek_driver(&mut self, idx: usize, seek_pos_msec: i64) -> Result<(), DashDemuxError> {
        let now = (self.clock)();
        let drv = &mut self.drivers[idx];
        let single_fragment = matches!(&drv.rep.index, SegmentIndex::List(f) if f.len() == 1);
        if single_fragment {
            // the whole representation is one resource; the parser's own frame index is finer
            // than anything the manifest can offer
            if drv.enabled {
                let pres = self.presentation.as_mut().ok_or_else(not_open)?;
                let opener = self.opener.as_deref().ok_or_else(not_open)?;
                let interrupt: &dyn Fn() -> bool = self.interrupt.as_ref();
                if let Some(parser) = drv.parser.as_mut() {
                    let mut reader = SegmentReader {
                        rep: &mut drv.rep,
                        stream: &mut drv.stream,
                        ctx: StreamContext {
                            presentation: pres, opener, options: &self.options, interrupt, now,
                        },
                        byte_seekable: true,
                        pending_error: None,
                    };
                    let sought = parser.seek(&mut reader, seek_pos_msec);
                    if let Some(e) = reader.take_error() {
                        return Err(e);
                    }
                    sought?;
                }
            }
            drv.finished = false;
            drv.rep.cur_timestamp = seek_pos_msec * (TIME_BASE / 1000);
            return Ok(());
        }

        drv.stream.close(&mut drv.rep);
        drv.parser = None;
        drv.finished = false;
        drv.rep.init_read_offset = 0;
        drv.rep.cur_seg_offset = 0;
        drv.rep.is_restart_needed = false;
        match &drv.rep.index {
            SegmentIndex::Timeline { entries, .. } if drv.rep.fragment_timescale > 0 => {
                let timescale = drv.rep.fragment_timescale;
                let mut duration = 0i64;
                let mut num = drv.rep.first_seq_no;
                'walk: for entry in entries {
                    if entry.start_time > 0 {
                        duration = entry.start_time;
                    }
                    duration += entry.duration;
                    if seek_pos_msec < rescale(duration, 1000, timescale, true) {
                        break 'walk;
                    }
                    for _ in 0..entry.repeat.max(0) {
                        duration += entry.duration;
                        num += 1;
                        if seek_pos_msec < rescale(duration, 1000, timescale, true) {
                            break 'walk;
                        }
                    }
                    num += 1;
                }
                drv.rep.cur_seq_no = num.min(drv.rep.last_seq_no);
            },
            SegmentIndex::TemplateDuration { .. } if drv.rep.fragment_duration > 0 => {
                drv.rep.cur_seq_no = drv.rep.first_seq_no
                    + ((seek_pos_msec * drv.rep.fragment_timescale) / drv.rep.fragment_duration)
                      / 1000;
            },
            _ => {
                warn!("seek on representation {} without usable timing; rewinding", drv.rep.id);
                drv.rep.cur_seq_no = drv.rep.first_seq_no;
            },
        }
        drv.rep.cur_timestamp = seek_pos_msec * (TIME_BASE / 1000);
        Ok(())
    }

    /// Tear down all inner parsers, transport handles and buffers.
    pub fn close(&mut self) {
        for drv in self.drivers.iter_mut() {
            drv.stream.close(&mut drv.rep);
            drv.parser = None;
        }
        self.drivers.clear();
        self.presentation = None;
        self.duration = None;
    }
}

impl Drop for DashDemuxer {
    fn drop(&mut self) {
        self.close();
    }
}
