//! The backup agent: writes one set of files to tape, continuing onto
//! further volumes when the medium fills up.

use std::path::PathBuf;
use std::{fs, io};

use tracing::{debug, info, warn};

use crate::agent::{
    write_file_header, write_toc, AgentNotify, BatchStats, FileDisposition,
};
use crate::catalog::select::is_file_uptodate;
use crate::catalog::{FileDescriptor, FileInfo, SetToc, Toc};
use crate::error::{Result, TapeError};
use crate::hash::{HashKind, HashingWriter};
use crate::manager::StreamManager;

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub files: Vec<PathBuf>,
    pub description: String,
    pub hash_kind: HashKind,
    /// Separate files inside the set with filemarks.
    pub filemarks_mode: bool,
    pub incremental: bool,
    pub block_size: u32,
    /// Keep going past per-file failures.
    pub ignore_failures: bool,
}

/// Where to pick the batch up again on the next volume.
pub struct BackupResume {
    request: BackupRequest,
    /// Index of the file that did not fit; it is retried first.
    next_index: usize,
    stats: BatchStats,
}

pub enum BackupOutcome {
    Complete { stats: BatchStats, ok: bool },
    /// The medium filled up; load a fresh volume and call
    /// [`BackupAgent::resume`].
    MediaFull(BackupResume),
}

pub struct BackupAgent<'a, N: AgentNotify> {
    mgr: &'a mut StreamManager,
    toc: &'a mut Toc,
    notify: &'a mut N,
}

impl<'a, N: AgentNotify> BackupAgent<'a, N> {
    pub fn new(
        mgr: &'a mut StreamManager,
        toc: &'a mut Toc,
        notify: &'a mut N,
    ) -> BackupAgent<'a, N> {
        BackupAgent { mgr, toc, notify }
    }

    /// Write a new backup set. On a full medium the catalog is still
    /// appended to the exhausted volume and a resume context comes
    /// back.
    pub fn backup(&mut self, request: BackupRequest) -> Result<BackupOutcome> {
        let mut set = SetToc::new(&request.description);
        set.hash_kind = request.hash_kind;
        set.volume = self.toc.volume;
        set.set_incremental(request.incremental)?;
        self.toc.push_set(set)?;
        self.run_batch(request, 0, BatchStats::default())
    }

    /// Continue a batch on a freshly loaded volume. The caller has
    /// already reloaded media and re-prepared the manager; this bumps
    /// the volume number and opens a continuation set, so the file that
    /// overflowed the previous volume is written first.
    pub fn resume(&mut self, resume: BackupResume) -> Result<BackupOutcome> {
        let BackupResume {
            request,
            next_index,
            stats,
        } = resume;
        self.toc.volume += 1;
        self.toc.continued_on_next = false;
        let cont = match self.toc.current_set() {
            Some(set) => set.continuation(self.toc.volume),
            None => {
                return Err(TapeError::InvalidState {
                    op: "resume",
                    state: "no set to continue",
                })
            }
        };
        info!(volume = self.toc.volume, next_index, "resuming batch on new volume");
        self.toc.push_set(cont)?;
        self.run_batch(request, next_index, stats)
    }

    fn current_set_mut(&mut self) -> Result<&mut SetToc> {
        self.toc.current_set_mut().ok_or(TapeError::InvalidState {
            op: "backup",
            state: "catalog has no open set",
        })
    }

    fn run_batch(
        &mut self,
        request: BackupRequest,
        start_index: usize,
        mut stats: BatchStats,
    ) -> Result<BackupOutcome> {
        // The drive and the navigator have the final say on block size
        // and marks; the set records what actually happened.
        let applied_block = self.mgr.set_content_block_size(request.block_size)?;
        let applied_marks = self.mgr.set_filemarks_mode(request.filemarks_mode);
        {
            let set = self.current_set_mut()?;
            set.block_size = applied_block;
            set.filemarks_mode = applied_marks;
        }

        self.mgr.begin_write_content()?;
        self.notify.on_batch_start(request.files.len() - start_index);
        let mut overall_ok = true;
        let mut media_full_at = None;

        for index in start_index..request.files.len() {
            let path = match self.notify.pre_process_file(&request.files[index]) {
                FileDisposition::Process => request.files[index].clone(),
                FileDisposition::ProcessAs(other) => other,
                FileDisposition::Skip => {
                    stats.skipped += 1;
                    self.notify
                        .on_file_skipped(&request.files[index], "pre-process");
                    continue;
                }
            };

            let descriptor = match FileDescriptor::snapshot(&path) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    stats.failed += 1;
                    overall_ok = false;
                    let e = TapeError::Io(e);
                    warn!(path = %path.display(), error = %e, "cannot stat file");
                    self.notify.on_file_failed(&path, &e);
                    if request.ignore_failures {
                        continue;
                    }
                    break;
                }
            };

            if request.incremental {
                let current = self.toc.current_index().unwrap_or(0);
                if is_file_uptodate(self.toc, current, &descriptor.path, descriptor.modified) {
                    stats.skipped += 1;
                    continue;
                }
            }

            match self.write_one_file(&path, descriptor, request.hash_kind) {
                Ok(bytes) => {
                    stats.processed += 1;
                    stats.bytes += bytes;
                    self.notify.on_file_done(&path, bytes);
                }
                Err(TapeError::EndOfMedia) => {
                    info!(path = %path.display(), index, "medium full, recording resume point");
                    self.toc.continued_on_next = true;
                    self.notify.on_file_failed(&path, &TapeError::EndOfMedia);
                    media_full_at = Some(index);
                    break;
                }
                Err(e) => {
                    stats.failed += 1;
                    overall_ok = false;
                    warn!(path = %path.display(), error = %e, "file failed");
                    self.notify.on_file_failed(&path, &e);
                    if !request.ignore_failures {
                        break;
                    }
                }
            }
        }

        self.mgr.end_write_content_set()?;
        self.mgr.end_current_phase()?;
        write_toc(self.mgr, self.toc)?;
        self.notify.on_batch_end(&stats);

        match media_full_at {
            Some(next_index) => Ok(BackupOutcome::MediaFull(BackupResume {
                request,
                next_index,
                stats,
            })),
            None => Ok(BackupOutcome::Complete {
                stats,
                ok: overall_ok,
            }),
        }
    }

    /// The per-file protocol: admission check, identifier, start block,
    /// unhashed header, hashed payload, catalog row.
    fn write_one_file(
        &mut self,
        path: &std::path::Path,
        descriptor: FileDescriptor,
        hash_kind: HashKind,
    ) -> Result<u64> {
        self.mgr.begin_write_file(Some(descriptor.length))?;
        let block = self.mgr.current_block()?;
        let uid = self.toc.allocate_id();
        debug!(path = %path.display(), uid, block, length = descriptor.length, "writing file");

        let mut file = fs::File::open(path)?;
        let mut stream = self.mgr.produce_write_content_stream(None)?;
        write_file_header(&mut stream, uid)?;

        let mut hashed = HashingWriter::new(&mut stream, hash_kind);
        let copied = io::copy(&mut file, &mut hashed).map_err(TapeError::from_stream_io)?;
        let (_, digest) = hashed.finalize();
        stream.finish()?;
        self.mgr.end_write_file()?;

        let mut info = FileInfo::new(uid, block, descriptor);
        info.hash = digest;
        self.current_set_mut()?.push_file(info)?;
        Ok(copied)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::restore::{ReadOutcome, ReadRequest, ReadingAgent, RestoreConsumer};
    use crate::agent::NullNotify;
    use crate::catalog::Ticks;
    use crate::device::virt::VirtualConfig;
    use crate::manager::tests::prepared_manager;
    use std::io::Write as _;

    pub(crate) fn request(files: Vec<PathBuf>) -> BackupRequest {
        BackupRequest {
            files,
            description: "unit".to_string(),
            hash_kind: HashKind::Crc32,
            filemarks_mode: false,
            incremental: false,
            block_size: 1024,
            ignore_failures: false,
        }
    }

    pub(crate) fn write_sample(dir: &std::path::Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn single_set_round_trip_with_known_hashes() {
        let src = tempfile::tempdir().unwrap();
        let all_bytes: Vec<u8> = (0u8..=255).collect();
        let a = write_sample(src.path(), "a.txt", b"hello");
        let b = write_sample(src.path(), "b.bin", &all_bytes);

        let (mut mgr, _) = prepared_manager(VirtualConfig::basic(1 << 22));
        let mut toc = Toc::new("round trip");
        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        let outcome = agent.backup(request(vec![a.clone(), b.clone()])).unwrap();
        match outcome {
            BackupOutcome::Complete { stats, ok } => {
                assert!(ok);
                assert_eq!(stats.processed, 2);
                assert_eq!(stats.bytes, 5 + 256);
            }
            BackupOutcome::MediaFull(_) => panic!("medium should not fill"),
        }

        let set = toc.current_set().unwrap();
        assert_eq!(set.files().len(), 2);
        assert_eq!(
            set.files()[0].hash,
            Some(0x3610A686u32.to_le_bytes().to_vec())
        );
        assert_eq!(
            set.files()[1].hash,
            Some(0x29058C73u32.to_le_bytes().to_vec())
        );
        assert!(set.files()[0].id < set.files()[1].id);
        assert!(set.files()[1].id < toc.next_id());

        // Restore into a fresh directory and compare bytes and times.
        let dst = tempfile::tempdir().unwrap();
        let mut consumer = RestoreConsumer::new(dst.path());
        let mut notify = NullNotify;
        let mut reader = ReadingAgent::new(&mut mgr, &toc, &mut notify);
        let outcome = reader
            .run(
                ReadRequest {
                    patterns: None,
                    incremental: false,
                    ignore_failures: false,
                },
                &mut consumer,
            )
            .unwrap();
        match outcome {
            ReadOutcome::Complete { stats, ok } => {
                assert!(ok);
                assert_eq!(stats.processed, 2);
            }
            ReadOutcome::NeedVolume(_) => panic!("single volume"),
        }

        for (original, info) in [(&a, &toc.sets()[0].files()[0]), (&b, &toc.sets()[0].files()[1])] {
            let mut restored = dst.path().to_path_buf();
            for part in original.components() {
                if let std::path::Component::Normal(p) = part {
                    restored.push(p);
                }
            }
            assert_eq!(fs::read(&restored).unwrap(), fs::read(original).unwrap());
            let meta = fs::metadata(&restored).unwrap();
            assert_eq!(
                Ticks::from_system_time(meta.modified().unwrap()),
                info.descriptor.modified
            );
        }
    }

    #[test]
    fn media_overflow_resumes_on_the_next_volume() {
        let src = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..5)
            .map(|i| write_sample(src.path(), &format!("file{}.dat", i), &[0x41u8; 1024]))
            .collect();

        let (mut mgr, handle) = prepared_manager(VirtualConfig::basic(1 << 20));
        // Leave 4096 bytes of effective content capacity.
        mgr.set_user_capacity_limit(Some((1 << 20) - 4096));
        let mut toc = Toc::new("spanning");
        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        let mut req = request(files.clone());
        req.block_size = 256;
        let outcome = agent.backup(req).unwrap();

        let resume = match outcome {
            BackupOutcome::MediaFull(resume) => resume,
            BackupOutcome::Complete { .. } => panic!("expected overflow"),
        };
        assert_eq!(resume.next_index, 3);
        assert_eq!(resume.stats.processed, 3);
        assert!(toc.continued_on_next);
        assert_eq!(toc.sets()[0].files().len(), 3);

        // Swap in a blank volume and pick the batch up again.
        handle.eject_medium().unwrap();
        mgr.release_media().unwrap();
        mgr.unload_media().unwrap();
        handle.insert_blank_medium();
        mgr.load_media().unwrap();
        mgr.prepare_media().unwrap();
        mgr.set_user_capacity_limit(None);

        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        match agent.resume(resume).unwrap() {
            BackupOutcome::Complete { stats, ok } => {
                assert!(ok);
                assert_eq!(stats.processed, 5);
            }
            BackupOutcome::MediaFull(_) => panic!("second volume should suffice"),
        }

        assert_eq!(toc.volume, 2);
        assert!(!toc.continued_on_next);
        let cont = toc.current_set().unwrap();
        assert!(cont.continued_from_previous);
        assert_eq!(cont.volume, 2);
        assert_eq!(cont.files().len(), 2);
        // The file that overflowed volume 1 leads volume 2.
        assert!(cont.files()[0].descriptor.path.ends_with("file3.dat"));
    }

    #[test]
    fn incremental_skips_files_that_are_up_to_date() {
        let src = tempfile::tempdir().unwrap();
        let a = write_sample(src.path(), "a.txt", b"stable");
        let b = write_sample(src.path(), "b.txt", b"stable too");

        let (mut mgr, _) = prepared_manager(VirtualConfig::basic(1 << 22));
        let mut toc = Toc::new("incrementals");
        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        agent.backup(request(vec![a.clone(), b.clone()])).unwrap();

        // Nothing changed: the incremental pass writes an empty set.
        let mut incremental = request(vec![a.clone(), b.clone()]);
        incremental.incremental = true;
        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        match agent.backup(incremental.clone()).unwrap() {
            BackupOutcome::Complete { stats, ok } => {
                assert!(ok);
                assert_eq!(stats.processed, 0);
                assert_eq!(stats.skipped, 2);
            }
            BackupOutcome::MediaFull(_) => panic!("no overflow expected"),
        }

        // Touch one file into the future; only it gets picked up.
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let f = fs::File::options().write(true).open(&a).unwrap();
        f.set_times(fs::FileTimes::new().set_modified(future)).unwrap();
        drop(f);

        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        match agent.backup(incremental).unwrap() {
            BackupOutcome::Complete { stats, .. } => {
                assert_eq!(stats.processed, 1);
                assert_eq!(stats.skipped, 1);
            }
            BackupOutcome::MediaFull(_) => panic!("no overflow expected"),
        }
        let newest = toc.current_set().unwrap();
        assert!(newest.files()[0].descriptor.path.ends_with("a.txt"));
    }

    #[test]
    fn missing_files_respect_ignore_failures() {
        let src = tempfile::tempdir().unwrap();
        let a = write_sample(src.path(), "a.txt", b"present");
        let ghost = src.path().join("ghost.txt");

        let (mut mgr, _) = prepared_manager(VirtualConfig::basic(1 << 22));
        let mut toc = Toc::new("failures");
        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        let mut req = request(vec![ghost.clone(), a.clone()]);
        req.ignore_failures = true;
        match agent.backup(req).unwrap() {
            BackupOutcome::Complete { stats, ok } => {
                assert!(!ok);
                assert_eq!(stats.failed, 1);
                assert_eq!(stats.processed, 1);
            }
            BackupOutcome::MediaFull(_) => panic!("no overflow expected"),
        }

        // Without the flag the batch stops at the first failure.
        let mut toc = Toc::new("failures strict");
        let mut notify = NullNotify;
        let mut agent = BackupAgent::new(&mut mgr, &mut toc, &mut notify);
        match agent.backup(request(vec![ghost, a])).unwrap() {
            BackupOutcome::Complete { stats, ok } => {
                assert!(!ok);
                assert_eq!(stats.processed, 0);
            }
            BackupOutcome::MediaFull(_) => panic!("no overflow expected"),
        }
    }
}
