extern crate argparse;
extern crate libtapeforge;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use argparse::{ArgumentParser, Collect, Store, StoreConst, StoreTrue};

use libtapeforge::agent::backup::{BackupAgent, BackupOutcome, BackupRequest};
use libtapeforge::agent::restore::{
    ReadOutcome, ReadRequest, ReadingAgent, RestoreConsumer, ValidateConsumer, VerifyConsumer,
    revalidate_volume,
};
use libtapeforge::agent::{restore_toc, write_toc, NullNotify};
use libtapeforge::catalog::Toc;
use libtapeforge::hash::HashKind;
use libtapeforge::manager::StreamManager;
use libtapeforge::tuning::Configuration;
use libtapeforge::{Result, TapeError};

#[derive(Copy, Clone)]
enum Operation {
    Backup,
    Restore,
    Validate,
    Verify,
    List,
    Format,
    Eject,
}

fn parse_hash(name: &str) -> Result<HashKind> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "none" => HashKind::None,
        "crc32" => HashKind::Crc32,
        "crc64" => HashKind::Crc64,
        "xxhash32" => HashKind::XxHash32,
        "xxhash3" => HashKind::XxHash3,
        "xxhash64" => HashKind::XxHash64,
        "xxhash128" => HashKind::XxHash128,
        other => {
            return Err(TapeError::InvalidData(format!(
                "unknown hash algorithm {:?}",
                other
            )))
        }
    })
}

/// Block until the operator confirms the next volume is in the drive.
fn await_volume_change(volume: u32) {
    eprint!("Insert volume {} and press return...", volume);
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok();
}

fn reload_media(mgr: &mut StreamManager) -> Result<()> {
    mgr.release_media()?;
    mgr.unload_media()?;
    mgr.load_media()?;
    mgr.prepare_media()
}

fn run() -> Result<bool> {
    let mut operation = Operation::List;
    let mut device_index = 0u32;
    let mut paths: Vec<String> = Vec::new();
    let mut description = String::new();
    let mut target = ".".to_string();
    let mut hash_name = "crc64".to_string();
    let mut block_size = 0u32;
    let mut filemarks_mode = false;
    let mut incremental = false;
    let mut ignore_failures = false;
    let mut initiator_size = 0u64;

    {
        let mut ap = ArgumentParser::new();
        ap.set_description("Back up files to tape and read them back, catalog included.");
        ap.refer(&mut operation)
            .add_option(&["-c", "--backup"], StoreConst(Operation::Backup), "Write a backup set.")
            .add_option(&["-x", "--restore"], StoreConst(Operation::Restore), "Restore files from tape.")
            .add_option(&["--validate"], StoreConst(Operation::Validate), "Check archived hashes without writing anything.")
            .add_option(&["-d", "--verify"], StoreConst(Operation::Verify), "Compare archived files against the filesystem.")
            .add_option(&["-t", "--list"], StoreConst(Operation::List), "List the on-tape catalog.")
            .add_option(&["--format"], StoreConst(Operation::Format), "Format the medium and write an empty catalog.")
            .add_option(&["--eject"], StoreConst(Operation::Eject), "Unload the medium.");
        ap.refer(&mut device_index)
            .add_option(&["-f", "--device"], Store, "Tape device number.");
        ap.refer(&mut description)
            .add_option(&["--description"], Store, "Description recorded in the backup set.");
        ap.refer(&mut target)
            .add_option(&["-C", "--target"], Store, "Directory restored files are written under.");
        ap.refer(&mut hash_name)
            .add_option(&["--hash"], Store, "File hash algorithm: none, crc32, crc64, xxhash32, xxhash3, xxhash64, xxhash128.");
        ap.refer(&mut block_size)
            .add_option(&["--block_size"], Store, "Content block size in bytes (0 = drive default).");
        ap.refer(&mut filemarks_mode)
            .add_option(&["--filemarks"], StoreTrue, "Separate files inside the set with filemarks.");
        ap.refer(&mut incremental)
            .add_option(&["--incremental"], StoreTrue, "Incremental set (backup) or chain-wide selection (read).");
        ap.refer(&mut ignore_failures)
            .add_option(&["--ignore_failures"], StoreTrue, "Keep going past per-file failures.");
        ap.refer(&mut initiator_size)
            .add_option(&["--initiator_size"], Store, "Catalog partition size in bytes when formatting.");
        ap.refer(&mut paths)
            .add_argument("path", Collect, "Files to back up, or selection patterns for reads.");
        ap.parse_args_or_exit();
    }

    let mut mgr = StreamManager::open_device(device_index, Configuration::default())?;
    mgr.load_media()?;

    match operation {
        Operation::Eject => {
            mgr.unload_media()?;
            return Ok(true);
        }
        Operation::Format => {
            mgr.format_media(initiator_size)?;
            mgr.prepare_media()?;
            let mut toc = Toc::new(&description);
            write_toc(&mut mgr, &mut toc)?;
            return Ok(true);
        }
        _ => {}
    }

    mgr.prepare_media()?;

    match operation {
        Operation::List => {
            let toc = restore_toc(&mut mgr)?;
            println!("catalog {:?}, volume {}, {} sets", toc.description, toc.volume, toc.set_count());
            for (i, set) in toc.sets().iter().enumerate() {
                println!(
                    "  set {} {:?}: {} files, volume {}{}{}",
                    i + 1,
                    set.description,
                    set.files().len(),
                    set.volume,
                    if set.is_incremental() { ", incremental" } else { "" },
                    if set.continued_from_previous { ", continued" } else { "" },
                );
                for file in set.files() {
                    println!("    {:>8}  {}", file.descriptor.length, file.descriptor.path);
                }
            }
            Ok(true)
        }
        Operation::Backup => {
            // Append to an existing catalog when the tape carries one.
            let mut toc = restore_toc(&mut mgr).unwrap_or_else(|_| Toc::new(&description));
            let request = BackupRequest {
                files: paths.iter().map(PathBuf::from).collect(),
                description: description.clone(),
                hash_kind: parse_hash(&hash_name)?,
                filemarks_mode,
                incremental,
                block_size,
                ignore_failures,
            };
            let mut notify = NullNotify;
            let mut outcome = BackupAgent::new(&mut mgr, &mut toc, &mut notify).backup(request)?;
            loop {
                match outcome {
                    BackupOutcome::Complete { stats, ok } => {
                        eprintln!(
                            "{} files, {} bytes, {} skipped, {} failed",
                            stats.processed, stats.bytes, stats.skipped, stats.failed
                        );
                        return Ok(ok);
                    }
                    BackupOutcome::MediaFull(resume) => {
                        await_volume_change(toc.volume + 1);
                        reload_media(&mut mgr)?;
                        let mut notify = NullNotify;
                        outcome = BackupAgent::new(&mut mgr, &mut toc, &mut notify).resume(resume)?;
                    }
                }
            }
        }
        Operation::Restore | Operation::Validate | Operation::Verify => {
            let toc = restore_toc(&mut mgr)?;
            let request = ReadRequest {
                patterns: if paths.is_empty() { None } else { Some(paths.clone()) },
                incremental,
                ignore_failures,
            };
            let mut restore_consumer;
            let mut validate_consumer;
            let mut verify_consumer;
            let consumer: &mut dyn libtapeforge::agent::restore::FileConsumer = match operation {
                Operation::Restore => {
                    restore_consumer = RestoreConsumer::new(&target);
                    &mut restore_consumer
                }
                Operation::Validate => {
                    validate_consumer = ValidateConsumer;
                    &mut validate_consumer
                }
                _ => {
                    verify_consumer = VerifyConsumer;
                    &mut verify_consumer
                }
            };
            let mut notify = NullNotify;
            let mut outcome =
                ReadingAgent::new(&mut mgr, &toc, &mut notify).run(request, consumer)?;
            loop {
                match outcome {
                    ReadOutcome::Complete { stats, ok } => {
                        eprintln!(
                            "{} files, {} bytes, {} failed",
                            stats.processed, stats.bytes, stats.failed
                        );
                        return Ok(ok);
                    }
                    ReadOutcome::NeedVolume(pending) => {
                        await_volume_change(pending.volume);
                        reload_media(&mut mgr)?;
                        revalidate_volume(&mut mgr, &toc, pending.volume)?;
                        let mut notify = NullNotify;
                        outcome = ReadingAgent::new(&mut mgr, &toc, &mut notify)
                            .resume(pending, consumer)?;
                    }
                }
            }
        }
        Operation::Format | Operation::Eject => unreachable!(),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("tapeforge: {}", e);
            ExitCode::FAILURE
        }
    }
}
