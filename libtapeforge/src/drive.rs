//! The drive abstraction: block I/O with tapemark normalization,
//! positioning, formatting, and the transient-retry policy.
//!
//! A [`Drive`] owns the OS handle from open to close. Block transfers
//! operate in whole blocks only; a request that is not a multiple of the
//! block size is truncated down, per the contract with the stream layer
//! above. Tapemark and end-of-media conditions come back out-of-band as
//! [`BlockIo`] flags rather than errors.

use std::thread;

use tracing::{debug, warn};

use crate::device::{
    DriveFeatures, DriveParams, DriveSettings, MediaParams, PartitionMethod, PositionTarget,
    PrepareOp, TapeIo, TapemarkKind,
};
use crate::error::{ErrorKind, Result};
use crate::tuning::Configuration;

/// Outcome of one block transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct BlockIo {
    /// Bytes actually transferred.
    pub count: usize,
    /// A filemark, setmark or end-of-media terminated the transfer.
    pub tapemark: bool,
    /// No further data will arrive from the current position.
    pub eof: bool,
}

pub struct Drive {
    io: Box<dyn TapeIo>,
    config: Configuration,
    params: DriveParams,
    media: Option<MediaParams>,
    block_size: u32,
    bytes_transferred: u64,
    last_error: Option<ErrorKind>,
    sticky_error: Option<ErrorKind>,
}

impl Drive {
    /// Open a tape drive by device index and apply the optimal drive
    /// settings.
    pub fn open(device_index: u32, config: Configuration) -> Result<Drive> {
        #[cfg(unix)]
        let io: Box<dyn TapeIo> = Box::new(crate::device::unix::UnixTapeDevice::open_tape_number(
            device_index,
        )?);
        #[cfg(windows)]
        let io: Box<dyn TapeIo> = Box::new(
            crate::device::windows::WindowsTapeDevice::open_tape_number(device_index)?,
        );
        #[cfg(not(any(unix, windows)))]
        {
            let _ = device_index;
            return Err(TapeError::Unsupported("no tape endpoint on this platform"));
        }
        #[cfg(any(unix, windows))]
        Drive::with_io(io, config)
    }

    /// Build a drive over an already-open endpoint. Queries drive
    /// capabilities (with the transient retry policy) and applies the
    /// optimal settings the hardware supports.
    pub fn with_io(mut io: Box<dyn TapeIo>, config: Configuration) -> Result<Drive> {
        let params = retry_transient(&config, "query drive parameters", || io.drive_params())?;
        let features = params.features;
        let settings = DriveSettings {
            compression: features.contains(DriveFeatures::COMPRESSION),
            ecc: features.contains(DriveFeatures::ECC),
            data_padding: features.contains(DriveFeatures::DATA_PADDING),
            report_setmarks: features.contains(DriveFeatures::REPORT_SETMARKS),
            eot_warning_size: params.default_block_size * config.eot_warning_factor,
        };
        io.set_drive_settings(&settings)?;
        debug!(?params, "tape drive opened");

        Ok(Drive {
            io,
            config,
            params,
            media: None,
            block_size: params.default_block_size,
            bytes_transferred: 0,
            last_error: None,
            sticky_error: None,
        })
    }

    pub fn params(&self) -> &DriveParams {
        &self.params
    }

    pub fn media(&self) -> Option<&MediaParams> {
        self.media.as_ref()
    }

    pub fn features(&self) -> DriveFeatures {
        self.params.features
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Cumulative bytes moved through `read_block`/`write_block`,
    /// including short transfers.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// The most recent error worth reporting: the latest one, or the
    /// one that preceded the latest success.
    pub fn significant_error(&self) -> Option<ErrorKind> {
        self.last_error.or(self.sticky_error)
    }

    /// Clear only the latest error; the sticky one survives.
    pub fn reset_error(&mut self) {
        self.last_error = None;
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                if let Some(last) = self.last_error.take() {
                    self.sticky_error = Some(last);
                }
            }
            Err(e) => self.last_error = Some(e.kind()),
        }
        result
    }

    /// Load the medium (retrying transient conditions) and refresh the
    /// media view.
    pub fn load_media(&mut self) -> Result<()> {
        let config = self.config;
        retry_transient(&config, "load media", || self.io.prepare(PrepareOp::Load))?;
        let media = self.io.media_params()?;
        self.media = Some(media);
        if media.block_size != self.block_size {
            self.set_block_size(self.block_size)?;
        }
        debug!(?media, "media loaded");
        Ok(())
    }

    pub fn unload_media(&mut self) -> Result<()> {
        let r = self.io.prepare(PrepareOp::Unload);
        self.media = None;
        self.track(r)
    }

    /// Format the medium. With a nonzero initiator size on a drive that
    /// creates initiator partitions, lay out a catalog partition plus a
    /// content partition; otherwise a single partition by whatever
    /// method the drive supports. Reloads the medium and restores the
    /// optimal block size afterwards.
    pub fn format_media(&mut self, initiator_size: u64) -> Result<()> {
        let features = self.params.features;
        let method = if initiator_size > 0
            && features.contains(DriveFeatures::INITIATOR_PARTITIONS)
            && self.params.max_partition_count >= 2
        {
            PartitionMethod::Initiator(initiator_size)
        } else if features.contains(DriveFeatures::SELECT_PARTITIONS) {
            PartitionMethod::Select(1)
        } else {
            PartitionMethod::Fixed
        };
        debug!(?method, "formatting media");
        let r = self.io.create_partition(method);
        self.track(r)?;
        self.load_media()?;
        self.set_block_size(0)?;
        Ok(())
    }

    /// Set the medium block size, clamped into the drive's range; 0
    /// selects the drive default. Returns the size actually applied.
    pub fn set_block_size(&mut self, size: u32) -> Result<u32> {
        let clamped = self.params.clamp_block_size(size);
        let r = self.io.set_block_size(clamped);
        self.track(r)?;
        self.block_size = clamped;
        if let Some(media) = self.media.as_mut() {
            media.block_size = clamped;
        }
        Ok(clamped)
    }

    /// Write whole blocks from `data`; a trailing fragment below one
    /// block is truncated off. End-of-media surfaces in the flags, with
    /// the count reflecting what the drive accepted.
    pub fn write_block(&mut self, data: &[u8]) -> Result<BlockIo> {
        let block = self.block_size as usize;
        let len = data.len() - data.len() % block;
        let mut outcome = BlockIo::default();
        while outcome.count < len {
            match self.io.write(&data[outcome.count..outcome.count + block]) {
                Ok(n) => {
                    outcome.count += n;
                    if n < block {
                        break;
                    }
                }
                Err(e) => match e.tapemark_flags() {
                    Some((tapemark, eof)) => {
                        outcome.tapemark |= tapemark;
                        outcome.eof |= eof;
                        break;
                    }
                    None => {
                        self.bytes_transferred += outcome.count as u64;
                        return self.track(Err(e));
                    }
                },
            }
        }
        self.bytes_transferred += outcome.count as u64;
        Ok(outcome)
    }

    /// Read whole blocks into `buf`; a trailing fragment of the request
    /// below one block is truncated off. Tapemarks and end-of-media
    /// surface in the flags; buffered data before the mark is still
    /// delivered.
    pub fn read_block(&mut self, buf: &mut [u8]) -> Result<BlockIo> {
        let block = self.block_size as usize;
        let len = buf.len() - buf.len() % block;
        let mut outcome = BlockIo::default();
        while outcome.count < len {
            match self.io.read(&mut buf[outcome.count..outcome.count + block]) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    outcome.count += n;
                    if n < block {
                        break;
                    }
                }
                Err(e) => match e.tapemark_flags() {
                    Some((tapemark, eof)) => {
                        outcome.tapemark |= tapemark;
                        outcome.eof |= eof;
                        break;
                    }
                    None => {
                        self.bytes_transferred += outcome.count as u64;
                        return self.track(Err(e));
                    }
                },
            }
        }
        self.bytes_transferred += outcome.count as u64;
        Ok(outcome)
    }

    pub fn rewind(&mut self) -> Result<()> {
        let r = self.io.set_position(PositionTarget::Rewind);
        self.track(r)
    }

    /// Wind to the end of recorded data, optionally switching partition
    /// first.
    pub fn fast_forward_to_end(&mut self, partition: Option<u32>) -> Result<()> {
        if let Some(p) = partition {
            self.move_to_partition(p)?;
        }
        let r = self.io.set_position(PositionTarget::EndOfData);
        self.track(r)
    }

    /// Switch partitions. Some drives refuse to move directly between
    /// high-numbered partitions, so any move above partition 1 bounces
    /// through partition 1 first.
    pub fn move_to_partition(&mut self, partition: u32) -> Result<()> {
        if partition > 1 {
            let bounce = self.io.set_position(PositionTarget::Partition(1));
            self.track(bounce)?;
        }
        let r = self.io.set_position(PositionTarget::Partition(partition));
        self.track(r)
    }

    pub fn move_to_block(&mut self, block: u64) -> Result<()> {
        let r = self.io.set_position(PositionTarget::AbsoluteBlock(block));
        self.track(r)
    }

    pub fn current_block(&mut self) -> Result<u64> {
        let r = self.io.position().map(|(_, block)| block);
        self.track(r)
    }

    pub fn move_next_filemark(&mut self, count: i32) -> Result<()> {
        let r = self.io.set_position(PositionTarget::Filemarks(count));
        self.track(r)
    }

    pub fn move_next_setmark(&mut self, count: i32) -> Result<()> {
        let r = self.io.set_position(PositionTarget::Setmarks(count));
        self.track(r)
    }

    pub fn move_past_sequential_filemarks(&mut self, count: i32) -> Result<()> {
        let r = self
            .io
            .set_position(PositionTarget::SequentialFilemarks(count));
        self.track(r)
    }

    pub fn write_filemark(&mut self, count: u32) -> Result<()> {
        let r = self.io.write_tapemark(TapemarkKind::Filemark, count);
        self.track(r)
    }

    pub fn write_setmark(&mut self, count: u32) -> Result<()> {
        let r = self.io.write_tapemark(TapemarkKind::Setmark, count);
        self.track(r)
    }

    /// Write a short run of zero bytes as its own file, so filemarks on
    /// either side never end up adjacent.
    pub fn write_gap_file(&mut self) -> Result<()> {
        let len = (self.params.min_block_size as usize).max(64);
        let zeros = vec![0u8; len];
        let r = self.io.write(&zeros).map(|_| ());
        self.track(r)
    }

    /// Live remaining capacity of the current partition.
    pub fn remaining_capacity(&mut self) -> Result<u64> {
        let r = self.io.media_params().map(|m| m.remaining);
        self.track(r)
    }
}

/// Retry the transient kernel conditions (bus reset, media changed, not
/// ready) a bounded number of times with a pause in between. Everything
/// else fails straight through.
fn retry_transient<T>(
    config: &Configuration,
    what: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < config.open_retry_limit => {
                attempt += 1;
                warn!(error = %e, attempt, "{} failed, retrying", what);
                thread::sleep(config.open_retry_pause);
            }
            Err(e) => return Err(e),
        }
    }
}
