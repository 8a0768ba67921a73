//! The per-representation byte stream fed to an inner container parser.
//!
//! A [`SegmentStream`] presents the many segment fetches of one representation as a single byte
//! stream: the initialization section (downloaded once and cached) is replayed ahead of each
//! (re)start, segment boundaries are crossed transparently, and for live streams the manifest is
//! refreshed when the sequencer runs past the segments the current manifest announces. The stream
//! is seekable at the byte level only for VOD presentations served as a single explicit fragment.

use crate::fetch::{ByteSource, ResourceOpener};
use crate::presentation::{Fragment, Presentation, Representation, SegmentIndex};
use crate::refresh;
use crate::sequencer;
use crate::{DashDemuxError, DemuxOptions};
use std::cmp::min;
use std::io::Read;
use std::time::Duration;
use tracing::{trace, warn};


/// Cap on the size of a cached initialization section.
pub(crate) const MAX_INIT_SECTION_SIZE: usize = 1024 * 1024;

// Pacing for the refresh loop at the live edge, so we don't hammer the origin while the next
// segment is still being produced.
const REFRESH_PACING: Duration = Duration::from_millis(100);

/// State shared by every representation stream of a presentation: the manifest globals, the
/// resource opener, the options, the cancellation callback and the wall clock of the current
/// operation.
pub struct StreamContext<'a> {
    pub presentation: &'a mut Presentation,
    pub opener: &'a dyn ResourceOpener,
    pub options: &'a DemuxOptions,
    pub interrupt: &'a dyn Fn() -> bool,
    /// Epoch seconds at the start of the current read/seek operation.
    pub now: i64,
}

impl StreamContext<'_> {
    fn check_interrupt(&self) -> Result<(), DashDemuxError> {
        if (self.interrupt)() {
            return Err(DashDemuxError::Interrupted);
        }
        Ok(())
    }
}

fn open_fragment(
    opener: &dyn ResourceOpener,
    frag: &Fragment,
) -> Result<ByteSource, DashDemuxError> {
    let end_offset = if frag.size >= 0 { frag.url_offset + frag.size } else { -1 };
    opener.open_resource(&frag.url, frag.url_offset, end_offset)
}

/// Download the initialization section of a representation into its cache buffer. The size is
/// taken from the fragment's declared range, else from the transport, else bounded by the cap.
/// A representation without an init section gets an empty buffer.
pub fn load_init_section(
    rep: &mut Representation,
    opener: &dyn ResourceOpener,
) -> Result<(), DashDemuxError> {
    rep.init_buf.clear();
    rep.init_read_offset = 0;
    if let Some(init) = rep.init_section.clone() {
        let mut source = open_fragment(opener, &init)?;
        let declared = if init.size >= 0 { init.size } else { source.size };
        let cap = if declared >= 0 {
            min(declared as usize, MAX_INIT_SECTION_SIZE)
        } else {
            MAX_INIT_SECTION_SIZE
        };
        source.by_ref().take(cap as u64)
            .read_to_end(&mut rep.init_buf)
            .map_err(|e| DashDemuxError::Io(e, format!("reading init section of {}", rep.id)))?;
        trace!("loaded init section of {} ({} bytes)", rep.id, rep.init_buf.len());
    }
    rep.init_loaded = true;
    Ok(())
}

// The fragment for the current sequence number, refreshing the manifest when a live stream has
// run past the window the manifest announces. `None` means end of stream.
fn current_fragment(
    rep: &mut Representation,
    ctx: &mut StreamContext,
) -> Result<Option<Fragment>, DashDemuxError> {
    if ctx.presentation.is_live {
        let min_seq = sequencer::calc_min_seg_no(rep, ctx.presentation, ctx.now);
        if rep.cur_seq_no < min_seq {
            // fell out of the time-shift window; rejoin at the live edge
            refresh::refresh(ctx.presentation, rep, ctx.opener, ctx.options, ctx.now)?;
            let edge = sequencer::calc_cur_seg_no(rep, ctx.presentation, ctx.options, ctx.now);
            rep.cur_seq_no = edge.max(min_seq);
        }
        while rep.cur_seq_no > sequencer::calc_max_seg_no(rep, ctx.presentation, ctx.now) {
            ctx.check_interrupt()?;
            refresh::refresh(ctx.presentation, rep, ctx.opener, ctx.options, ctx.now)?;
            if rep.cur_seq_no > sequencer::calc_max_seg_no(rep, ctx.presentation, ctx.now) {
                std::thread::sleep(REFRESH_PACING);
            }
        }
    } else if rep.cur_seq_no > rep.last_seq_no {
        return Ok(None);
    }
    sequencer::fragment_for(rep, rep.cur_seq_no, ctx.options)
}

/// The byte stream of one representation. Owns the transport handle of the segment being read;
/// all other state lives on the [`Representation`].
#[derive(Default)]
pub struct SegmentStream {
    source: Option<ByteSource>,
}

impl SegmentStream {
    pub fn new() -> SegmentStream {
        SegmentStream { source: None }
    }

    /// Drop the transport handle and the current-segment state.
    pub fn close(&mut self, rep: &mut Representation) {
        self.source = None;
        rep.cur_seg = None;
    }

    /// Reset for a restart on a new segment: the init section will be replayed and the inner
    /// parser must be reopened.
    pub fn restart(&mut self, rep: &mut Representation) {
        self.source = None;
        rep.cur_seg = None;
        rep.cur_seg_offset = 0;
        rep.init_read_offset = 0;
        rep.is_restart_needed = false;
    }

    /// Read bytes for the container parser. Returns `Ok(0)` at end of stream, and also at the
    /// end of each segment once `is_restart_needed` has been raised (the orchestrator then
    /// reopens the parser on the next segment).
    pub fn read(
        &mut self,
        rep: &mut Representation,
        ctx: &mut StreamContext,
        buf: &mut [u8],
    ) -> Result<usize, DashDemuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            ctx.check_interrupt()?;
            if self.source.is_none() {
                let Some(frag) = current_fragment(rep, ctx)? else {
                    return Ok(0);
                };
                if !rep.init_loaded {
                    load_init_section(rep, ctx.opener)?;
                    rep.init_read_offset = 0;
                }
                match open_fragment(ctx.opener, &frag) {
                    Ok(source) => {
                        rep.cur_seg_size = if frag.size >= 0 { frag.size } else { source.size };
                        rep.cur_seg_offset = 0;
                        rep.cur_seg = Some(frag);
                        self.source = Some(source);
                    },
                    Err(e) => {
                        warn!("failed to open segment {} of representation {}: {e}",
                              rep.cur_seq_no, rep.id);
                        if ctx.presentation.is_live {
                            // retry the same segment; once the manifest moves on, the refresh
                            // in current_fragment repositions us
                            std::thread::sleep(REFRESH_PACING);
                            continue;
                        }
                        rep.cur_seq_no += 1;
                        if rep.cur_seq_no > rep.last_seq_no {
                            return Ok(0);
                        }
                        continue;
                    },
                }
            }
            // the init section goes out before any body byte of the segment
            if rep.init_read_offset < rep.init_buf.len() {
                let n = min(buf.len(), rep.init_buf.len() - rep.init_read_offset);
                buf[..n].copy_from_slice(&rep.init_buf[rep.init_read_offset..rep.init_read_offset + n]);
                rep.init_read_offset += n;
                return Ok(n);
            }
            // body bytes, bounded by the declared segment size when known
            let mut cap = buf.len();
            if rep.cur_seg_size >= 0 {
                cap = min(cap, (rep.cur_seg_size - rep.cur_seg_offset).max(0) as usize);
            }
            let n = match self.source.as_mut() {
                Some(source) if cap > 0 => match source.read(&mut buf[..cap]) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("error reading segment {} of representation {}: {e}",
                              rep.cur_seq_no, rep.id);
                        0
                    },
                },
                _ => 0,
            };
            if n == 0 {
                self.source = None;
                rep.cur_seg = None;
                if ctx.presentation.is_live || rep.cur_seq_no < rep.last_seq_no {
                    if !rep.is_restart_needed {
                        rep.cur_seq_no += 1;
                    }
                    rep.is_restart_needed = true;
                } else {
                    // final segment exhausted: move to the end-of-stream position
                    rep.cur_seq_no = rep.last_seq_no + 1;
                }
                return Ok(0);
            }
            rep.cur_seg_offset += n as i64;
            return Ok(n);
        }
    }

    /// Byte-level seek, available only for a VOD presentation served as a single explicit
    /// fragment. Positions before the end of the init section land inside the cached buffer;
    /// later positions reopen the fragment at the corresponding body offset.
    pub fn seek_bytes(
        &mut self,
        rep: &mut Representation,
        ctx: &mut StreamContext,
        pos: u64,
    ) -> Result<(), DashDemuxError> {
        if ctx.presentation.is_live {
            return Err(DashDemuxError::Other(
                String::from("byte seeking is not available on live streams")));
        }
        let frag = match &rep.index {
            SegmentIndex::List(frags) if frags.len() == 1 => frags[0].clone(),
            _ => return Err(DashDemuxError::Other(
                String::from("byte seeking requires a single-fragment representation"))),
        };
        if !rep.init_loaded {
            load_init_section(rep, ctx.opener)?;
        }
        self.source = None;
        rep.cur_seg = None;
        rep.cur_seq_no = rep.first_seq_no;
        rep.is_restart_needed = false;
        let init_len = rep.init_buf.len() as u64;
        if pos < init_len {
            rep.init_read_offset = pos as usize;
            rep.cur_seg_offset = 0;
            return Ok(());
        }
        let body = (pos - init_len) as i64;
        rep.init_read_offset = rep.init_buf.len();
        let end_offset = if frag.size >= 0 { frag.url_offset + frag.size } else { -1 };
        let source = ctx.opener.open_resource(&frag.url, frag.url_offset + body, end_offset)?;
        rep.cur_seg_size = if frag.size >= 0 { frag.size } else { source.size.saturating_add(body) };
        rep.cur_seg_offset = body;
        rep.cur_seg = Some(frag);
        self.source = Some(source);
        Ok(())
    }
}
