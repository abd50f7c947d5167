//! The reading agents: restore, validate and verify.
//!
//! All three share one per-file protocol (header check, length-limited
//! read, hash comparison) and differ only in where the bytes go: a
//! freshly created local file, nowhere, or a byte-for-byte comparison
//! against an existing local file.

use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::{cmp, fs};

use tracing::{debug, info, warn};

use crate::agent::{read_file_header, restore_toc, AgentNotify, BatchStats, FILE_HEADER_LEN};
use crate::catalog::select::{select_files, SetSelection};
use crate::catalog::{FileInfo, Toc};
use crate::error::{Result, TapeError};
use crate::hash::{HashKind, HashingReader};
use crate::manager::StreamManager;

/// Where the payload bytes of one file end up.
pub trait FileConsumer {
    /// Drain the reader (already clamped to the file's length) and
    /// return how many bytes were consumed.
    fn consume(&mut self, info: &FileInfo, reader: &mut dyn Read) -> Result<u64>;

    /// Called after the hash check passed.
    fn post_process(&mut self, _info: &FileInfo) -> Result<()> {
        Ok(())
    }
}

/// Writes each file under a target root, recreating the source
/// directory structure and reapplying the recorded metadata.
pub struct RestoreConsumer {
    target_root: PathBuf,
}

impl RestoreConsumer {
    pub fn new<P: AsRef<Path>>(target_root: P) -> RestoreConsumer {
        RestoreConsumer {
            target_root: target_root.as_ref().to_path_buf(),
        }
    }

    fn target_path(&self, info: &FileInfo) -> PathBuf {
        let source = Path::new(&info.descriptor.path);
        let mut target = self.target_root.clone();
        for component in source.components() {
            if let Component::Normal(part) = component {
                target.push(part);
            }
        }
        target
    }
}

impl FileConsumer for RestoreConsumer {
    fn consume(&mut self, info: &FileInfo, reader: &mut dyn Read) -> Result<u64> {
        let target = self.target_path(info);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&target)?;
        Ok(io::copy(reader, &mut file)?)
    }

    fn post_process(&mut self, info: &FileInfo) -> Result<()> {
        let target = self.target_path(info);
        info.descriptor.apply_to(&target)?;
        Ok(())
    }
}

/// Discards the bytes; only the hash check does any work.
pub struct ValidateConsumer;

impl FileConsumer for ValidateConsumer {
    fn consume(&mut self, _info: &FileInfo, reader: &mut dyn Read) -> Result<u64> {
        Ok(io::copy(reader, &mut io::sink())?)
    }
}

/// Compares the tape bytes against the file at its original path.
pub struct VerifyConsumer;

impl FileConsumer for VerifyConsumer {
    fn consume(&mut self, info: &FileInfo, reader: &mut dyn Read) -> Result<u64> {
        let mut local = fs::File::open(&info.descriptor.path)?;
        let mut tape_buf = [0u8; 8192];
        let mut local_buf = [0u8; 8192];
        let mut offset = 0u64;
        loop {
            let n = reader.read(&mut tape_buf)?;
            if n == 0 {
                // The local file must end here too.
                if local.read(&mut local_buf[..1])? != 0 {
                    return Err(TapeError::InvalidData(format!(
                        "{}: local file is longer than the archived copy",
                        info.descriptor.path
                    )));
                }
                return Ok(offset);
            }
            let mut filled = 0;
            while filled < n {
                let got = local.read(&mut local_buf[filled..n])?;
                if got == 0 {
                    return Err(TapeError::InvalidData(format!(
                        "{}: local file is shorter than the archived copy",
                        info.descriptor.path
                    )));
                }
                filled += got;
            }
            if tape_buf[..n] != local_buf[..n] {
                return Err(TapeError::InvalidData(format!(
                    "{}: contents differ near offset {}",
                    info.descriptor.path, offset
                )));
            }
            offset += n as u64;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadRequest {
    /// `None` selects every file, an empty list none.
    pub patterns: Option<Vec<String>>,
    pub incremental: bool,
    /// Keep going past per-file failures.
    pub ignore_failures: bool,
}

/// Continuation context when the selection spans volumes.
pub struct ReadResume {
    /// Volume that must be mounted next.
    pub volume: u32,
    selections: Vec<SetSelection>,
    next_selection: usize,
    stats: BatchStats,
    request: ReadRequest,
}

pub enum ReadOutcome {
    Complete { stats: BatchStats, ok: bool },
    /// A selected set lives on another volume; swap media, revalidate
    /// with [`revalidate_volume`], then call [`ReadingAgent::resume`].
    NeedVolume(ReadResume),
}

/// After a media swap, check that the mounted volume belongs to the
/// chain: its own catalog must carry the expected volume number and the
/// same set census for that volume. The in-memory catalog stays
/// authoritative; only the original spans the whole chain.
pub fn revalidate_volume(mgr: &mut StreamManager, toc: &Toc, expected_volume: u32) -> Result<()> {
    let tape_toc = restore_toc(mgr)?;
    if tape_toc.volume != expected_volume {
        return Err(TapeError::InvalidData(format!(
            "wrong volume mounted: expected {}, found {}",
            expected_volume, tape_toc.volume
        )));
    }
    let expected_sets = toc
        .sets()
        .iter()
        .filter(|s| s.volume == expected_volume)
        .count();
    let found_sets = tape_toc
        .sets()
        .iter()
        .filter(|s| s.volume == expected_volume)
        .count();
    if expected_sets != found_sets {
        return Err(TapeError::InvalidData(format!(
            "volume {} carries {} sets, catalog expects {}",
            expected_volume, found_sets, expected_sets
        )));
    }
    info!(volume = expected_volume, "volume revalidated");
    Ok(())
}

pub struct ReadingAgent<'a, N: AgentNotify> {
    mgr: &'a mut StreamManager,
    toc: &'a Toc,
    notify: &'a mut N,
    /// Volume number of the mounted medium.
    mounted_volume: u32,
}

impl<'a, N: AgentNotify> ReadingAgent<'a, N> {
    pub fn new(
        mgr: &'a mut StreamManager,
        toc: &'a Toc,
        notify: &'a mut N,
    ) -> ReadingAgent<'a, N> {
        let mounted_volume = toc.volume;
        ReadingAgent {
            mgr,
            toc,
            notify,
            mounted_volume,
        }
    }

    /// Run the selection against the mounted volume, oldest set first
    /// so the tape keeps moving forward.
    pub fn run(
        &mut self,
        request: ReadRequest,
        consumer: &mut dyn FileConsumer,
    ) -> Result<ReadOutcome> {
        let current = self.toc.current_index().ok_or_else(|| {
            TapeError::InvalidData("catalog has no sets to read".into())
        })?;
        let mut selections = select_files(
            self.toc,
            current,
            request.patterns.as_deref(),
            request.incremental,
        )?;
        selections.reverse();
        let total: usize = selections.iter().map(|s| s.file_indices.len()).sum();
        self.notify.on_batch_start(total);
        self.process(selections, 0, BatchStats::default(), request, consumer)
    }

    /// Continue after a volume swap (already revalidated).
    pub fn resume(
        &mut self,
        resume: ReadResume,
        consumer: &mut dyn FileConsumer,
    ) -> Result<ReadOutcome> {
        self.mounted_volume = resume.volume;
        self.process(
            resume.selections,
            resume.next_selection,
            resume.stats,
            resume.request,
            consumer,
        )
    }

    fn process(
        &mut self,
        selections: Vec<SetSelection>,
        start: usize,
        mut stats: BatchStats,
        request: ReadRequest,
        consumer: &mut dyn FileConsumer,
    ) -> Result<ReadOutcome> {
        self.mgr.begin_read_content()?;
        let mut overall_ok = true;

        for at in start..selections.len() {
            let selection = &selections[at];
            if selection.is_empty() {
                continue;
            }
            let set = &self.toc.sets()[selection.set_index];

            if set.volume != self.mounted_volume {
                self.mgr.end_current_phase()?;
                info!(
                    need = set.volume,
                    mounted = self.mounted_volume,
                    "selected set is on another volume"
                );
                return Ok(ReadOutcome::NeedVolume(ReadResume {
                    volume: set.volume,
                    selections,
                    next_selection: at,
                    stats,
                    request,
                }));
            }

            // The set's block size and marks mode are authoritative for
            // reading it back.
            self.mgr.set_content_block_size(set.block_size)?;
            self.mgr.set_filemarks_mode(set.filemarks_mode);

            let mut previous: Option<usize> = None;
            for &file_index in &selection.file_indices {
                let info = &set.files()[file_index];
                let outcome = self.read_one_file(
                    selection.set_index,
                    file_index,
                    previous,
                    info,
                    consumer,
                );
                match outcome {
                    Ok(bytes) => {
                        stats.processed += 1;
                        stats.bytes += bytes;
                        previous = Some(file_index);
                        self.notify
                            .on_file_done(Path::new(&info.descriptor.path), bytes);
                    }
                    Err(e) => {
                        stats.failed += 1;
                        overall_ok = false;
                        previous = None;
                        warn!(path = %info.descriptor.path, error = %e, "file failed");
                        self.notify
                            .on_file_failed(Path::new(&info.descriptor.path), &e);
                        if !request.ignore_failures {
                            self.mgr.end_current_phase()?;
                            self.notify.on_batch_end(&stats);
                            return Ok(ReadOutcome::Complete { stats, ok: false });
                        }
                    }
                }
            }
        }

        self.mgr.end_current_phase()?;
        self.notify.on_batch_end(&stats);
        Ok(ReadOutcome::Complete {
            stats,
            ok: overall_ok,
        })
    }

    /// Position of a catalog set on the mounted medium: sets are laid
    /// out in catalog order, starting over on each volume.
    fn tape_set_index(&self, set_index: usize) -> i64 {
        let volume = self.toc.sets()[set_index].volume;
        let first_on_volume = self
            .toc
            .sets()
            .iter()
            .position(|s| s.volume == volume)
            .unwrap_or(0);
        (set_index - first_on_volume) as i64
    }

    /// Filemarks recorded on this volume ahead of the given set: one
    /// per file for filemark-separated sets, plus one emulated-setmark
    /// separator per set.
    fn filemarks_before_set(&self, set_index: usize) -> u32 {
        let volume = self.toc.sets()[set_index].volume;
        self.toc.sets()[..set_index]
            .iter()
            .filter(|s| s.volume == volume)
            .map(|s| {
                if s.filemarks_mode {
                    s.files().len() as u32 + 1
                } else {
                    1
                }
            })
            .sum()
    }

    /// Park at the start of file `file_index` of the set, using the
    /// positioning mode the set was written with.
    fn position_at_file(
        &mut self,
        set_index: usize,
        file_index: usize,
        info: &FileInfo,
    ) -> Result<()> {
        let set = &self.toc.sets()[set_index];
        if !set.filemarks_mode {
            return self.mgr.position_at_block(info.block);
        }
        if self.mgr.set_separators_are_filemarks() {
            // Set and file marks are indistinguishable on tape; the
            // catalog knows how many precede the target.
            let marks = self.filemarks_before_set(set_index) + file_index as u32;
            self.mgr.position_by_filemarks(marks)
        } else {
            self.mgr
                .move_to_content_set(self.tape_set_index(set_index))?;
            if file_index > 0 {
                self.mgr.drive_mut().move_next_filemark(file_index as i32)?;
            }
            Ok(())
        }
    }

    fn read_one_file(
        &mut self,
        set_index: usize,
        file_index: usize,
        previous: Option<usize>,
        info: &FileInfo,
        consumer: &mut dyn FileConsumer,
    ) -> Result<u64> {
        let hash_kind = self.toc.sets()[set_index].hash_kind;
        // When the previous file succeeded and this one is its direct
        // successor the head is already in place.
        let sequential = previous == Some(file_index.wrapping_sub(1)) && file_index > 0;
        if !sequential {
            self.position_at_file(set_index, file_index, info)?;
        }
        debug!(path = %info.descriptor.path, uid = info.id, sequential, "reading file");

        let mut stream = self.mgr.produce_read_content_stream(false, None)?;
        let uid = read_file_header(&mut stream)?;
        if uid != info.id {
            return Err(TapeError::InvalidData(format!(
                "{}: header id {} does not match catalog id {}",
                info.descriptor.path, uid, info.id
            )));
        }
        // Stop exactly at the file boundary even if no filemark comes.
        stream.set_length_limit(FILE_HEADER_LEN + info.descriptor.length)?;

        let mut hashed = HashingReader::new(&mut stream, hash_kind);
        let consumed = consumer.consume(info, &mut hashed)?;
        // Drain whatever the consumer left so the digest covers the
        // whole payload and the head lands on the file boundary.
        io::copy(&mut hashed, &mut io::sink())?;
        let digest = hashed.finalize();
        stream.finish()?;
        self.mgr.end_read_file()?;

        if hash_kind != HashKind::None && digest.as_ref() != info.hash.as_ref() {
            return Err(TapeError::InvalidData(format!(
                "{}: hash mismatch",
                info.descriptor.path
            )));
        }
        consumer.post_process(info)?;
        Ok(cmp::min(consumed, info.descriptor.length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::backup::tests::{request, write_sample};
    use crate::agent::backup::{BackupAgent, BackupOutcome};
    use crate::agent::NullNotify;
    use crate::device::virt::{VirtualConfig, VirtualHandle};
    use crate::manager::tests::prepared_manager;
    use crate::manager::StreamManager;

    fn all_files() -> ReadRequest {
        ReadRequest {
            patterns: None,
            incremental: false,
            ignore_failures: false,
        }
    }

    /// Two files backed up onto one volume, catalog appended.
    fn backed_up_pair(
        config: VirtualConfig,
        filemarks_mode: bool,
    ) -> (StreamManager, VirtualHandle, Toc, Vec<PathBuf>, tempfile::TempDir) {
        let src = tempfile::tempdir().unwrap();
        let a = write_sample(src.path(), "alpha.txt", b"alpha contents");
        let b = write_sample(src.path(), "beta.bin", &[0x5Au8; 700]);
        let files = vec![a, b];

        let (mut mgr, handle) = prepared_manager(config);
        let mut toc = Toc::new("fixture");
        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        let mut req = request(files.clone());
        req.block_size = 256;
        req.filemarks_mode = filemarks_mode;
        match agent.backup(req).unwrap() {
            BackupOutcome::Complete { ok, .. } => assert!(ok),
            BackupOutcome::MediaFull(_) => panic!("fixture should fit"),
        }
        (mgr, handle, toc, files, src)
    }

    #[test]
    fn validate_passes_then_catches_corruption() {
        let (mut mgr, handle, toc, _files, _src) =
            backed_up_pair(VirtualConfig::basic(1 << 22), false);

        let mut notify = NullNotify;
        let mut agent = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        match agent.run(all_files(), &mut ValidateConsumer).unwrap() {
            ReadOutcome::Complete { stats, ok } => {
                assert!(ok);
                assert_eq!(stats.processed, 2);
            }
            ReadOutcome::NeedVolume(_) => panic!("single volume"),
        }

        // Flip a payload byte of the second file (alpha occupies record
        // 0, beta records 1..3).
        handle.corrupt_byte(0, 1, 100);
        let mut notify = NullNotify;
        let mut agent = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        let mut req = all_files();
        req.ignore_failures = true;
        match agent.run(req, &mut ValidateConsumer).unwrap() {
            ReadOutcome::Complete { stats, ok } => {
                assert!(!ok);
                assert_eq!(stats.failed, 1);
                assert_eq!(stats.processed, 1);
            }
            ReadOutcome::NeedVolume(_) => panic!("single volume"),
        }
    }

    #[test]
    fn verify_compares_against_local_files() {
        let (mut mgr, _handle, toc, files, _src) =
            backed_up_pair(VirtualConfig::basic(1 << 22), false);

        let mut notify = NullNotify;
        let mut agent = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        match agent.run(all_files(), &mut VerifyConsumer).unwrap() {
            ReadOutcome::Complete { ok, .. } => assert!(ok),
            ReadOutcome::NeedVolume(_) => panic!("single volume"),
        }

        // Change the local copy; verification must notice.
        fs::write(&files[0], b"alpha CONTENTS").unwrap();
        let mut notify = NullNotify;
        let mut agent = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        let mut req = all_files();
        req.ignore_failures = true;
        match agent.run(req, &mut VerifyConsumer).unwrap() {
            ReadOutcome::Complete { stats, ok } => {
                assert!(!ok);
                assert_eq!(stats.failed, 1);
            }
            ReadOutcome::NeedVolume(_) => panic!("single volume"),
        }
    }

    #[test]
    fn pattern_selection_restores_a_subset() {
        let (mut mgr, _handle, toc, _files, _src) =
            backed_up_pair(VirtualConfig::basic(1 << 22), false);
        let dst = tempfile::tempdir().unwrap();

        let mut notify = NullNotify;
        let mut agent = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        let mut consumer = RestoreConsumer::new(dst.path());
        let req = ReadRequest {
            patterns: Some(vec!["*alpha.txt".to_string()]),
            incremental: false,
            ignore_failures: false,
        };
        match agent.run(req, &mut consumer).unwrap() {
            ReadOutcome::Complete { stats, ok } => {
                assert!(ok);
                assert_eq!(stats.processed, 1);
            }
            ReadOutcome::NeedVolume(_) => panic!("single volume"),
        }

        let mut restored = Vec::new();
        for entry in walk(dst.path()) {
            restored.push(entry.file_name().unwrap().to_string_lossy().into_owned());
        }
        assert_eq!(restored, vec!["alpha.txt"]);
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
        out
    }

    #[test]
    fn filemark_separated_files_position_by_mark_counts() {
        let (mut mgr, handle, toc, files, _src) =
            backed_up_pair(VirtualConfig::basic(1 << 22), true);
        // Each file carries its own trailing filemark ahead of the set
        // separator.
        assert!(handle.layout(0).starts_with("DFDDDF"));

        // Restore only the second file: positioning must count the
        // first file's mark.
        let dst = tempfile::tempdir().unwrap();
        let mut notify = NullNotify;
        let mut agent = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        let mut consumer = RestoreConsumer::new(dst.path());
        let req = ReadRequest {
            patterns: Some(vec!["*beta.bin".to_string()]),
            incremental: false,
            ignore_failures: false,
        };
        match agent.run(req, &mut consumer).unwrap() {
            ReadOutcome::Complete { stats, ok } => {
                assert!(ok);
                assert_eq!(stats.processed, 1);
            }
            ReadOutcome::NeedVolume(_) => panic!("single volume"),
        }
        let restored = walk(dst.path());
        assert_eq!(restored.len(), 1);
        assert_eq!(fs::read(&restored[0]).unwrap(), fs::read(&files[1]).unwrap());
    }

    #[test]
    fn cross_volume_restore_walks_the_chain() {
        let src = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..5)
            .map(|i| write_sample(src.path(), &format!("file{}.dat", i), &[0x41u8; 1024]))
            .collect();

        let (mut mgr, handle) = prepared_manager(VirtualConfig::basic(1 << 20));
        mgr.set_user_capacity_limit(Some((1 << 20) - 4096));
        let mut toc = Toc::new("chain");
        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        let mut req = request(files.clone());
        req.block_size = 256;
        let resume = match agent.backup(req).unwrap() {
            BackupOutcome::MediaFull(resume) => resume,
            BackupOutcome::Complete { .. } => panic!("expected overflow"),
        };

        let volume1 = handle.eject_medium().unwrap();
        mgr.release_media().unwrap();
        mgr.unload_media().unwrap();
        handle.insert_blank_medium();
        mgr.load_media().unwrap();
        mgr.prepare_media().unwrap();
        mgr.set_user_capacity_limit(None);
        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        match agent.resume(resume).unwrap() {
            BackupOutcome::Complete { ok, .. } => assert!(ok),
            BackupOutcome::MediaFull(_) => panic!("second volume should suffice"),
        }

        // Restore the whole chain; volume 2 is mounted, the oldest set
        // lives on volume 1.
        let dst = tempfile::tempdir().unwrap();
        let mut consumer = RestoreConsumer::new(dst.path());
        let read_request = ReadRequest {
            patterns: None,
            incremental: true,
            ignore_failures: false,
        };

        let mut notify = NullNotify;
        let mut agent = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        let pending = match agent.run(read_request, &mut consumer).unwrap() {
            ReadOutcome::NeedVolume(pending) => pending,
            ReadOutcome::Complete { .. } => panic!("chain spans volumes"),
        };
        assert_eq!(pending.volume, 1);

        // Mount volume 1, revalidate, continue.
        let volume2 = handle.eject_medium().unwrap();
        mgr.release_media().unwrap();
        mgr.unload_media().unwrap();
        handle.insert_medium(volume1);
        mgr.load_media().unwrap();
        mgr.prepare_media().unwrap();
        revalidate_volume(&mut mgr, &toc, 1).unwrap();

        let mut notify = NullNotify;
        let mut agent = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        let pending = match agent.resume(pending, &mut consumer).unwrap() {
            ReadOutcome::NeedVolume(pending) => pending,
            ReadOutcome::Complete { .. } => panic!("continuation set is on volume 2"),
        };
        assert_eq!(pending.volume, 2);

        // Back to volume 2 for the continuation set.
        handle.eject_medium().unwrap();
        mgr.release_media().unwrap();
        mgr.unload_media().unwrap();
        handle.insert_medium(volume2);
        mgr.load_media().unwrap();
        mgr.prepare_media().unwrap();
        revalidate_volume(&mut mgr, &toc, 2).unwrap();

        let mut notify = NullNotify;
        let mut agent = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        match agent.resume(pending, &mut consumer).unwrap() {
            ReadOutcome::Complete { stats, ok } => {
                assert!(ok);
                assert_eq!(stats.processed, 5);
            }
            ReadOutcome::NeedVolume(_) => panic!("chain ends on volume 2"),
        }

        let mut restored = walk(dst.path());
        restored.sort();
        assert_eq!(restored.len(), 5);
        for (i, path) in restored.iter().enumerate() {
            assert!(path.ends_with(format!("file{}.dat", i)));
            assert_eq!(fs::read(path).unwrap(), vec![0x41u8; 1024]);
        }

        // A wrong medium is refused during revalidation.
        handle.insert_blank_medium();
        mgr.release_media().unwrap();
        mgr.unload_media().unwrap();
        mgr.load_media().unwrap();
        mgr.prepare_media().unwrap();
        assert!(revalidate_volume(&mut mgr, &toc, 1).is_err());
    }
}
