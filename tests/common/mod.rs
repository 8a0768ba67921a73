//! Shared code for our test harness.
//!
//! The network and the inner container parsers are both collaborator seams of the demuxer, so
//! the tests script them: `MockOpener` serves manifests and segments from memory (counting the
//! opens, which several tests assert on), and `RecordParser` reads a trivial synthetic container
//! where each packet is a "PK" record carrying a millisecond pts and an opaque payload.

#![allow(dead_code)]

use dash_demux::demux::{ContainerParser, ContainerProbe, ParsedPacket, SegmentReader};
use dash_demux::fetch::{ByteSource, ResourceOpener};
use dash_demux::DashDemuxError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Once;
use url::Url;


static TRACING_INIT: Once = Once::new();

pub fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    TRACING_INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .compact()
            .with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info,reqwest=warn,hyper=warn"))
            .expect("initializing logging");
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}


/// Serves manifests and media resources from memory. Manifests are a queue: each
/// `fetch_document` call pops the next one (the last is sticky), which lets refresh tests serve
/// an updated manifest on the second fetch.
pub struct MockOpener {
    manifests: RefCell<Vec<String>>,
    resources: RefCell<HashMap<String, Vec<u8>>>,
    open_counts: RefCell<HashMap<String, usize>>,
    failures: RefCell<HashMap<String, usize>>,
    manifest_fetches: RefCell<usize>,
}

impl MockOpener {
    pub fn new(manifest: &str) -> MockOpener {
        MockOpener {
            manifests: RefCell::new(vec![String::from(manifest)]),
            resources: RefCell::new(HashMap::new()),
            open_counts: RefCell::new(HashMap::new()),
            failures: RefCell::new(HashMap::new()),
            manifest_fetches: RefCell::new(0),
        }
    }

    /// Serve this manifest on the next fetch (and later ones, until another is queued).
    pub fn queue_manifest(&self, manifest: &str) {
        self.manifests.borrow_mut().push(String::from(manifest));
    }

    pub fn add_resource(&self, url: &str, data: Vec<u8>) {
        self.resources.borrow_mut().insert(String::from(url), data);
    }

    pub fn remove_resource(&self, url: &str) {
        self.resources.borrow_mut().remove(url);
    }

    /// Make the next `times` opens of this URL fail with a network error.
    pub fn fail_times(&self, url: &str, times: usize) {
        self.failures.borrow_mut().insert(String::from(url), times);
    }

    /// How many times a URL has been opened (any byte range).
    pub fn opens(&self, url: &str) -> usize {
        *self.open_counts.borrow().get(url).unwrap_or(&0)
    }

    pub fn manifest_fetches(&self) -> usize {
        *self.manifest_fetches.borrow()
    }
}

impl ResourceOpener for MockOpener {
    fn open_resource(&self, url: &Url, offset: i64, end_offset: i64)
                     -> Result<ByteSource, DashDemuxError> {
        *self.open_counts.borrow_mut().entry(String::from(url.as_str())).or_insert(0) += 1;
        if let Some(remaining) = self.failures.borrow_mut().get_mut(url.as_str()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DashDemuxError::Network(format!("injected failure for {url}")));
            }
        }
        let data = self.resources.borrow().get(url.as_str()).cloned()
            .ok_or_else(|| DashDemuxError::Network(format!("404 for {url}")))?;
        let len = data.len() as i64;
        let start = offset.clamp(0, len);
        let end = if end_offset >= 0 { end_offset.clamp(start, len) } else { len };
        let window = data[start as usize..end as usize].to_vec();
        let size = window.len() as i64;
        Ok(ByteSource::new(Box::new(Cursor::new(window)), size))
    }

    fn fetch_document(&self, url: &Url) -> Result<(String, Url), DashDemuxError> {
        *self.manifest_fetches.borrow_mut() += 1;
        let mut manifests = self.manifests.borrow_mut();
        let text = if manifests.len() > 1 {
            manifests.remove(0)
        } else {
            manifests.first().cloned()
                .ok_or_else(|| DashDemuxError::InvalidManifest(String::from("no manifest")))?
        };
        Ok((text, url.clone()))
    }
}


/// The init-section marker of the synthetic record container.
pub const INIT_MARKER: &[u8] = b"MOCKINIT";

/// One packet of the synthetic container: "PK", a millisecond pts, a payload length, a payload.
pub fn record(pts_msec: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(b"PK");
    out.extend_from_slice(&pts_msec.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn read_full(src: &mut SegmentReader, buf: &mut [u8]) -> Result<usize, DashDemuxError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read_bytes(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub struct RecordParser;

impl ContainerParser for RecordParser {
    fn open(&mut self, _src: &mut SegmentReader) -> Result<(i64, i64), DashDemuxError> {
        // pts values are milliseconds
        Ok((1, 1000))
    }

    fn next_packet(&mut self, src: &mut SegmentReader)
                   -> Result<Option<ParsedPacket>, DashDemuxError> {
        loop {
            let mut magic = [0u8; 2];
            if read_full(src, &mut magic)? < 2 {
                return Ok(None);
            }
            if &magic == b"MO" {
                // init marker: swallow and continue with the records behind it
                let mut rest = [0u8; 6];
                read_full(src, &mut rest)?;
                continue;
            }
            if &magic != b"PK" {
                return Err(DashDemuxError::Parsing(String::from("bad record magic")));
            }
            let mut header = [0u8; 6];
            if read_full(src, &mut header)? < 6 {
                return Ok(None);
            }
            let pts = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as i64;
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut payload = vec![0u8; len];
            if read_full(src, &mut payload)? < len {
                return Ok(None);
            }
            return Ok(Some(ParsedPacket { pts, data: payload, keyframe: true }));
        }
    }

    fn seek(&mut self, src: &mut SegmentReader, _pos_msec: i64) -> Result<(), DashDemuxError> {
        // frame-level positioning for single-resource streams: rewind and let the caller skip
        src.seek_bytes(0)
    }
}

pub struct RecordProbe;

impl ContainerProbe for RecordProbe {
    fn probe(&self, header: &[u8]) -> Option<Box<dyn ContainerParser>> {
        if header.starts_with(INIT_MARKER) || header.starts_with(b"PK") {
            Some(Box::new(RecordParser))
        } else {
            None
        }
    }
}
