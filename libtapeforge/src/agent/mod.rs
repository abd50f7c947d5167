//! Backup, restore, validate and verify agents.
//!
//! Agents sit on top of the stream manager and the in-memory catalog.
//! This module carries what they share: the notification hooks, batch
//! statistics, the on-tape file header, and the catalog's double-write
//! protocol (two copies back to back, each protected by a CRC-64
//! trailer regardless of the set's file-hash algorithm).

pub mod backup;
pub mod restore;

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::catalog::{Ticks, Toc};
use crate::error::{Result, TapeError};
use crate::hash::CRC64;
use crate::manager::StreamManager;
use crate::navigator::TOC_COPIES;
use crate::wire::{Wire, WireReader, WireWriter};

/// On-tape length of the per-file header: signature+version plus the
/// 64-bit identifier. The header is not covered by the file hash.
pub const FILE_HEADER_LEN: u64 = 4 + 8;

/// What the pre-process hook wants done with a file.
pub enum FileDisposition {
    Process,
    /// Process, but read from / write to this path instead.
    ProcessAs(PathBuf),
    Skip,
}

/// Notification hooks shared by all agents. Default implementations do
/// nothing, so callers override only what they observe.
pub trait AgentNotify {
    fn pre_process_file(&mut self, _path: &Path) -> FileDisposition {
        FileDisposition::Process
    }

    fn on_file_done(&mut self, _path: &Path, _bytes: u64) {}

    fn on_file_skipped(&mut self, _path: &Path, _reason: &str) {}

    fn on_file_failed(&mut self, _path: &Path, _error: &TapeError) {}

    fn on_batch_start(&mut self, _total: usize) {}

    fn on_batch_end(&mut self, _stats: &BatchStats) {}
}

/// The no-op notification sink.
pub struct NullNotify;

impl AgentNotify for NullNotify {}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes: u64,
}

pub(crate) fn write_file_header<W: Write>(sink: &mut W, uid: u64) -> Result<()> {
    let mut w = WireWriter::new(sink);
    w.write_signature()?;
    w.write_u64(uid)
}

/// Read and check a file header. Returns the identifier, or invalid
/// data if the bytes at the head of the stream are not a file header.
pub(crate) fn read_file_header<R: Read>(source: &mut R) -> Result<u64> {
    let mut r = WireReader::new(source);
    if !r.read_signature()? {
        return Err(TapeError::InvalidData("file header signature mismatch".into()));
    }
    r.read_u64()
}

/// Serialize a catalog with its CRC-64 trailer.
fn toc_payload(toc: &Toc) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    let mut w = WireWriter::new(&mut payload);
    toc.encode(&mut w)?;
    let crc = CRC64.checksum(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    Ok(payload)
}

/// Parse one catalog copy out of a raw tape file (trailing block
/// padding included). Fails on signature, format or CRC trouble.
fn parse_toc_copy(raw: &[u8]) -> Result<Toc> {
    let mut r = WireReader::new(Cursor::new(raw));
    let toc = match Toc::decode(&mut r)? {
        Some(toc) => toc,
        None => return Err(TapeError::InvalidData("catalog signature mismatch".into())),
    };
    let consumed = r.bytes_consumed() as usize;
    if raw.len() < consumed + 8 {
        return Err(TapeError::InvalidData("catalog trailer missing".into()));
    }
    let mut trailer = [0u8; 8];
    trailer.copy_from_slice(&raw[consumed..consumed + 8]);
    let stored = u64::from_le_bytes(trailer);
    let computed = CRC64.checksum(&raw[..consumed]);
    if stored != computed {
        return Err(TapeError::InvalidData(format!(
            "catalog CRC mismatch: stored {:016x}, computed {:016x}",
            stored, computed
        )));
    }
    Ok(toc)
}

/// Write the catalog to tape: both copies back to back, each its own
/// filemark-delimited file.
pub fn write_toc(mgr: &mut StreamManager, toc: &mut Toc) -> Result<()> {
    toc.last_saved = Ticks::now();
    let payload = toc_payload(toc)?;
    mgr.begin_write_toc()?;
    for copy in 0..TOC_COPIES {
        let mut stream = mgr.produce_write_toc_stream()?;
        stream.write_all(&payload).map_err(TapeError::from_stream_io)?;
        stream.finish()?;
        mgr.end_write_file()?;
        debug!(copy, bytes = payload.len(), "catalog copy written");
    }
    mgr.notify_toc_written()?;
    mgr.end_current_phase()?;
    Ok(())
}

fn read_toc_copy(mgr: &mut StreamManager) -> Result<Toc> {
    let mut raw = Vec::new();
    let mut stream = mgr.produce_read_toc_stream(false, None)?;
    stream
        .read_to_end(&mut raw)
        .map_err(TapeError::from_stream_io)?;
    stream.finish()?;
    mgr.end_read_file()?;
    parse_toc_copy(&raw)
}

/// Restore the catalog from tape. The first copy is tried first; any
/// signature, format or CRC failure falls through to the second copy.
pub fn restore_toc(mgr: &mut StreamManager) -> Result<Toc> {
    mgr.begin_read_toc()?;
    let outcome = match read_toc_copy(mgr) {
        Ok(toc) => Ok(toc),
        Err(first) => {
            warn!(error = %first, "first catalog copy unreadable, trying second");
            read_toc_copy(mgr)
        }
    };
    mgr.notify_toc_read(outcome.is_ok());
    mgr.end_current_phase()?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SetToc;
    use crate::device::virt::VirtualConfig;
    use crate::manager::tests::prepared_manager;

    fn sample_toc() -> Toc {
        let mut toc = Toc::new("nightly");
        toc.push_set(SetToc::new("full")).unwrap();
        toc
    }

    #[test]
    fn toc_double_write_and_restore() {
        let (mut mgr, handle) = prepared_manager(VirtualConfig::basic(1 << 22));
        let mut toc = sample_toc();
        write_toc(&mut mgr, &mut toc).unwrap();
        // Two copies, each one block plus filemark.
        assert_eq!(handle.layout(0), "DFDF");

        let restored = restore_toc(&mut mgr).unwrap();
        assert_eq!(restored, toc);
    }

    #[test]
    fn corrupted_first_copy_falls_back_to_second() {
        let (mut mgr, handle) = prepared_manager(VirtualConfig::basic(1 << 22));
        let mut toc = sample_toc();
        write_toc(&mut mgr, &mut toc).unwrap();

        // Flip one payload byte inside the first copy.
        handle.corrupt_byte(0, 0, 10);
        let restored = restore_toc(&mut mgr).unwrap();
        assert_eq!(restored, toc);
    }

    #[test]
    fn both_copies_corrupt_is_a_hard_failure() {
        let (mut mgr, handle) = prepared_manager(VirtualConfig::basic(1 << 22));
        let mut toc = sample_toc();
        write_toc(&mut mgr, &mut toc).unwrap();

        handle.corrupt_byte(0, 0, 10);
        handle.corrupt_byte(0, 2, 10);
        assert!(matches!(
            restore_toc(&mut mgr),
            Err(TapeError::InvalidData(_))
        ));
    }

    #[test]
    fn rewriting_the_toc_after_more_content_keeps_it_last() {
        let (mut mgr, handle) = prepared_manager(VirtualConfig::basic(1 << 22));
        mgr.set_content_block_size(256).unwrap();
        let mut toc = sample_toc();
        write_toc(&mut mgr, &mut toc).unwrap();

        // Append a content set; the stale catalog area is overwritten.
        mgr.begin_write_content().unwrap();
        let mut stream = mgr.produce_write_content_stream(Some(256)).unwrap();
        std::io::Write::write_all(&mut stream, &[3u8; 256]).unwrap();
        stream.finish().unwrap();
        mgr.end_write_file().unwrap();
        mgr.end_write_content_set().unwrap();

        toc.push_set(SetToc::new("second")).unwrap();
        write_toc(&mut mgr, &mut toc).unwrap();

        let restored = restore_toc(&mut mgr).unwrap();
        assert_eq!(restored.set_count(), 2);
        // Content block, separator, then the fresh catalog copies.
        assert_eq!(handle.layout(0), "DFDFDF");
    }
}
