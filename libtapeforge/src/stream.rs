//! Byte-stream adapters over whole-block tape I/O.
//!
//! Streams are issued by the [`crate::manager::StreamManager`] and
//! borrow it exclusively while alive, so only one can exist at a time.
//! They implement the standard [`io::Read`]/[`io::Write`] traits so hash
//! adapters and `io::copy` compose directly; block alignment, padding
//! and tapemark detection stay in here.

use std::io::{self, Read, Write};

use crate::buffer::{self, PooledBuffer};
use crate::error::{Result, TapeError};
use crate::manager::StreamManager;

/// A single-use stream writing one logical file to tape.
///
/// Data is staged in a two-block buffer; whole blocks go to the drive as
/// they fill, and a caller handing over at least a buffer's worth at
/// once bypasses staging entirely. The byte accumulator counts only
/// bytes accepted from the caller, never padding.
pub struct TapeWriteStream<'a> {
    mgr: &'a mut StreamManager,
    buf: PooledBuffer,
    accepted: u64,
    hit_tapemark: bool,
    hit_eom: bool,
}

impl<'a> TapeWriteStream<'a> {
    pub(crate) fn new(mgr: &'a mut StreamManager) -> TapeWriteStream<'a> {
        let block = mgr.drive().block_size() as usize;
        TapeWriteStream {
            mgr,
            buf: buffer::acquire(block * 2),
            accepted: 0,
            hit_tapemark: false,
            hit_eom: false,
        }
    }

    /// Bytes accepted from the caller so far.
    pub fn length(&self) -> u64 {
        self.accepted
    }

    fn note_flags(&mut self, tapemark: bool, eof: bool) {
        self.hit_tapemark |= tapemark;
        self.hit_eom |= eof;
    }

    /// Push every whole buffered block to the drive.
    fn drain_whole_blocks(&mut self) -> Result<()> {
        let block = self.mgr.drive().block_size() as usize;
        let whole = self.buf.len() - self.buf.len() % block;
        if whole == 0 {
            return Ok(());
        }
        let drive = self.mgr.drive_mut();
        let mut flags = (false, false);
        self.buf.spill_with(whole, |chunk| {
            let aligned = chunk.len() - chunk.len() % block;
            let outcome = drive.write_block(&chunk[..aligned])?;
            flags.0 |= outcome.tapemark;
            flags.1 |= outcome.eof;
            Ok(outcome.count)
        })?;
        self.note_flags(flags.0, flags.1);
        if self.hit_eom {
            return Err(TapeError::EndOfMedia);
        }
        Ok(())
    }

    /// Flush everything: whole blocks, then one zero-padded block for
    /// any partial remainder.
    fn flush_all(&mut self) -> Result<()> {
        self.drain_whole_blocks()?;
        if !self.buf.is_empty() {
            let block = self.mgr.drive().block_size() as usize;
            self.buf.zero_pad_to(block);
            self.drain_whole_blocks()?;
        }
        Ok(())
    }

    /// Flush and close, handing the tapemark bookkeeping back to the
    /// manager. Returns the accumulator.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_all()?;
        self.mgr
            .note_stream_closed(self.hit_tapemark || self.hit_eom, self.accepted);
        Ok(self.accepted)
    }
}

impl Write for TapeWriteStream<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.buf.len() == self.buf.capacity() {
            self.drain_whole_blocks()?;
        }

        // Bypass: nothing staged and at least a buffer's worth on
        // offer, so the drive can take it without a copy.
        if self.buf.is_empty() && data.len() >= self.buf.capacity() {
            let block = self.mgr.drive().block_size() as usize;
            let aligned = data.len() - data.len() % block;
            let outcome = self.mgr.drive_mut().write_block(&data[..aligned])?;
            self.note_flags(outcome.tapemark, outcome.eof);
            if outcome.count == 0 {
                return Err(TapeError::EndOfMedia.into());
            }
            self.accepted += outcome.count as u64;
            return Ok(outcome.count);
        }

        let n = self.buf.append(data);
        debug_assert!(n > 0);
        self.accepted += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_all()?;
        Ok(())
    }
}

/// A single-use stream reading one logical file from tape.
///
/// An optional length limit stops delivery exactly at a file boundary
/// even when no filemark follows; text mode ends the stream at the
/// first NUL byte instead.
pub struct TapeReadStream<'a> {
    mgr: &'a mut StreamManager,
    buf: PooledBuffer,
    delivered: u64,
    limit: Option<u64>,
    textmode: bool,
    eof: bool,
    hit_tapemark: bool,
}

impl<'a> TapeReadStream<'a> {
    pub(crate) fn new(
        mgr: &'a mut StreamManager,
        textmode: bool,
        limit: Option<u64>,
    ) -> TapeReadStream<'a> {
        let block = mgr.drive().block_size() as usize;
        // Filemark-heavy layouts amortize mark detection over a bigger
        // buffer.
        let factor = if mgr.filemarks_mode() { 4 } else { 1 };
        TapeReadStream {
            mgr,
            buf: buffer::acquire(block * factor),
            delivered: 0,
            limit,
            textmode,
            eof: false,
            hit_tapemark: false,
        }
    }

    /// The length limit if one is set, else bytes delivered so far.
    pub fn length(&self) -> u64 {
        self.limit.unwrap_or(self.delivered)
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.buf.is_empty()
    }

    /// Install or raise the length limit. It can never drop below what
    /// was already delivered, and never shrink.
    pub fn set_length_limit(&mut self, limit: u64) -> Result<()> {
        if limit < self.delivered || self.limit.is_some_and(|cur| limit < cur) {
            return Err(TapeError::InvalidState {
                op: "set_length_limit",
                state: "limit below delivered length",
            });
        }
        self.limit = Some(limit);
        Ok(())
    }

    /// Scan freshly arrived bytes for NUL and cut the stream there.
    fn apply_textmode(&self, fresh: &[u8]) -> Option<usize> {
        if !self.textmode {
            return None;
        }
        fresh.iter().position(|&b| b == 0)
    }

    fn refill(&mut self) -> Result<()> {
        let block = self.mgr.drive().block_size() as usize;
        let drive = self.mgr.drive_mut();
        let mut flags = (false, false, 0usize);
        self.buf.fill_with(block, |slice| {
            let outcome = drive.read_block(slice)?;
            flags.0 |= outcome.tapemark;
            flags.1 |= outcome.eof;
            flags.2 = outcome.count;
            Ok(outcome.count)
        })?;
        self.hit_tapemark |= flags.0;
        if flags.1 || flags.2 == 0 {
            self.eof = true;
        }
        if flags.2 > 0 {
            let content = self.buf.content();
            let fresh = &content[content.len() - flags.2..];
            if let Some(nul_at) = self.apply_textmode(fresh) {
                let keep = self.buf.len() - flags.2 + nul_at;
                let mut truncated = vec![0u8; keep];
                let got = self.buf.consume(&mut truncated);
                debug_assert_eq!(got, keep);
                self.buf.reset();
                self.buf.append(&truncated);
                self.eof = true;
            }
        }
        Ok(())
    }

    /// Close the stream, handing tapemark bookkeeping back to the
    /// manager. Returns bytes delivered.
    pub fn finish(self) -> Result<u64> {
        self.mgr.note_stream_closed(self.hit_tapemark, self.delivered);
        Ok(self.delivered)
    }
}

impl Read for TapeReadStream<'_> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut want = dst.len();
        if let Some(limit) = self.limit {
            want = want.min(limit.saturating_sub(self.delivered) as usize);
        }
        if want == 0 {
            return Ok(0);
        }

        // Buffered bytes that arrived before a mark are still owed to
        // the caller; EOF only counts once the buffer is dry.
        if self.buf.is_empty() {
            if self.eof {
                return Ok(0);
            }

            // Direct path: a request at least one buffer big reads
            // whole blocks straight into the caller's memory.
            let block = self.mgr.drive().block_size() as usize;
            if want >= self.buf.capacity() && want >= block {
                let aligned = want - want % block;
                let outcome = self.mgr.drive_mut().read_block(&mut dst[..aligned])?;
                self.hit_tapemark |= outcome.tapemark;
                if outcome.eof || outcome.count == 0 {
                    self.eof = true;
                }
                let mut n = outcome.count;
                if let Some(nul_at) = self.apply_textmode(&dst[..n]) {
                    n = nul_at;
                    self.eof = true;
                    self.buf.reset();
                }
                self.delivered += n as u64;
                return Ok(n);
            }

            self.refill()?;
            if self.buf.is_empty() {
                return Ok(0);
            }
        }

        let take = want.min(dst.len());
        let n = self.buf.consume(&mut dst[..take]);
        self.delivered += n as u64;
        Ok(n)
    }
}
