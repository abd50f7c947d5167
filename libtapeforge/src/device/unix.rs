//! Linux st-driver tape endpoint.
//!
//! Everything goes through `MTIOCTOP`/`MTIOCGET`/`MTIOCPOS` ioctls on a
//! raw file descriptor. The st driver does not report drive capability
//! or medium capacity, so the parameter queries return a permissive
//! profile and the engine relies on the device's own end-of-media
//! reporting.

use std::os::unix::io::{IntoRawFd, RawFd};
use std::{ffi, fmt, fs, io, mem};

use libc;

use crate::device::{
    DriveFeatures, DriveParams, DriveSettings, MediaParams, PartitionMethod, PositionTarget,
    PrepareOp, TapeIo, TapemarkKind,
};
use crate::error::{Result, TapeError};

const MTFSF: libc::c_short = 1;
const MTBSF: libc::c_short = 2;
const MTWEOF: libc::c_short = 5;
const MTREW: libc::c_short = 6;
const MTOFFL: libc::c_short = 7;
const MTEOM: libc::c_short = 12;
const MTSETBLK: libc::c_short = 20;
const MTSEEK: libc::c_short = 22;
const MTFSS: libc::c_short = 25;
const MTBSS: libc::c_short = 26;
const MTWSM: libc::c_short = 27;
const MTLOAD: libc::c_short = 30;
const MTCOMPRESSION: libc::c_short = 32;
const MTSETPART: libc::c_short = 33;
const MTMKPART: libc::c_short = 34;

const GMT_WR_PROT: libc::c_long = 0x0400_0000;

#[repr(C)]
struct mtop {
    mt_op: libc::c_short,
    mt_count: libc::c_int,
}

#[repr(C)]
struct mtget {
    mt_type: libc::c_long,
    mt_resid: libc::c_long,
    mt_dsreg: libc::c_long,
    mt_gstat: libc::c_long,
    mt_erreg: libc::c_long,
    mt_fileno: libc::c_int,
    mt_blkno: libc::c_int,
}

#[repr(C)]
struct mtpos {
    mt_blkno: libc::c_long,
}

const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((b'm' as libc::c_ulong) << 8) | nr
}

const MTIOCTOP: libc::c_ulong = ioc(1, 1, mem::size_of::<mtop>());
const MTIOCGET: libc::c_ulong = ioc(2, 2, mem::size_of::<mtget>());
const MTIOCPOS: libc::c_ulong = ioc(2, 3, mem::size_of::<mtpos>());

fn classify_errno(err: io::Error) -> TapeError {
    match err.raw_os_error() {
        Some(libc::ENOSPC) => TapeError::EndOfMedia,
        Some(libc::EBUSY) => TapeError::NotReady,
        Some(libc::ENXIO) => TapeError::NoMedia,
        Some(libc::EROFS) => TapeError::WriteProtected,
        _ => TapeError::Io(err),
    }
}

pub struct UnixTapeDevice {
    tape_device: RawFd,
    /// The st driver reports block position but not the partition; the
    /// last successful switch is remembered here.
    partition: u32,
}

impl UnixTapeDevice {
    /// Open a non-rewinding tape device by number (`/dev/nst{n}`).
    pub fn open_tape_number<I: num::Integer>(id: I) -> Result<UnixTapeDevice>
    where
        I: fmt::Display,
    {
        let path = format!("/dev/nst{}", id);
        UnixTapeDevice::open_device(ffi::OsStr::new(&path))
    }

    pub fn open_device(path: &ffi::OsStr) -> Result<UnixTapeDevice> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(classify_errno)?;
        Ok(unsafe { UnixTapeDevice::from_file_descriptor(file.into_raw_fd()) })
    }

    /// # Safety
    ///
    /// `fd` must be an open descriptor onto a tape character device;
    /// the returned value owns and eventually closes it.
    pub unsafe fn from_file_descriptor(fd: RawFd) -> UnixTapeDevice {
        UnixTapeDevice {
            tape_device: fd,
            partition: 1,
        }
    }

    fn op(&self, op: libc::c_short, count: libc::c_int) -> Result<()> {
        let op = mtop {
            mt_op: op,
            mt_count: count,
        };
        let res = unsafe { libc::ioctl(self.tape_device, MTIOCTOP, &op) };
        if res == -1 {
            return Err(classify_errno(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn status(&self) -> Result<mtget> {
        let mut status: mtget = unsafe { mem::zeroed() };
        let res = unsafe { libc::ioctl(self.tape_device, MTIOCGET, &mut status) };
        if res == -1 {
            return Err(classify_errno(io::Error::last_os_error()));
        }
        Ok(status)
    }
}

impl Drop for UnixTapeDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.tape_device) };
    }
}

impl TapeIo for UnixTapeDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = unsafe {
            libc::read(
                self.tape_device,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if size > 0 {
            Ok(size as usize)
        } else if size == 0 {
            // The st driver reports a filemark as a zero-length read and
            // leaves the head past the mark.
            Err(TapeError::Filemark)
        } else {
            Err(classify_errno(io::Error::last_os_error()))
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let size = unsafe {
            libc::write(
                self.tape_device,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if size > 0 {
            Ok(size as usize)
        } else if size == 0 {
            Err(TapeError::EndOfMedia)
        } else {
            Err(classify_errno(io::Error::last_os_error()))
        }
    }

    fn drive_params(&mut self) -> Result<DriveParams> {
        // st exposes no capability query; report a permissive fixed
        // profile and let unsupported operations fail at call time.
        self.status()?;
        Ok(DriveParams {
            min_block_size: 512,
            max_block_size: 256 * 1024,
            default_block_size: 16 * 1024,
            max_partition_count: 1,
            features: DriveFeatures::COMPRESSION | DriveFeatures::ABSOLUTE_POSITIONING,
        })
    }

    fn media_params(&mut self) -> Result<MediaParams> {
        let status = self.status()?;
        let block_size = (status.mt_dsreg & 0x00FF_FFFF) as u32;
        Ok(MediaParams {
            // st reports no capacity; the device's own end-of-media
            // condition is authoritative.
            capacity: u64::MAX,
            remaining: u64::MAX,
            block_size,
            partition_count: 1,
            write_protected: status.mt_gstat & GMT_WR_PROT != 0,
        })
    }

    fn set_drive_settings(&mut self, settings: &DriveSettings) -> Result<()> {
        self.op(MTCOMPRESSION, settings.compression as libc::c_int)
    }

    fn set_block_size(&mut self, size: u32) -> Result<()> {
        self.op(MTSETBLK, size as libc::c_int)
    }

    fn set_position(&mut self, target: PositionTarget) -> Result<()> {
        match target {
            PositionTarget::Rewind => self.op(MTREW, 1),
            PositionTarget::EndOfData => self.op(MTEOM, 1),
            PositionTarget::AbsoluteBlock(block) => self.op(MTSEEK, block as libc::c_int),
            PositionTarget::Filemarks(n) if n >= 0 => self.op(MTFSF, n),
            PositionTarget::Filemarks(n) => self.op(MTBSF, -n),
            PositionTarget::Setmarks(n) if n >= 0 => self.op(MTFSS, n),
            PositionTarget::Setmarks(n) => self.op(MTBSS, -n),
            PositionTarget::SequentialFilemarks(_) => {
                Err(TapeError::Unsupported("sequential filemark spacing"))
            }
            PositionTarget::Partition(p) => {
                self.op(MTSETPART, p.saturating_sub(1) as libc::c_int)?;
                self.partition = p;
                Ok(())
            }
        }
    }

    fn position(&mut self) -> Result<(u32, u64)> {
        let mut pos: mtpos = unsafe { mem::zeroed() };
        let res = unsafe { libc::ioctl(self.tape_device, MTIOCPOS, &mut pos) };
        if res == -1 {
            return Err(classify_errno(io::Error::last_os_error()));
        }
        Ok((self.partition, pos.mt_blkno as u64))
    }

    fn write_tapemark(&mut self, kind: TapemarkKind, count: u32) -> Result<()> {
        match kind {
            TapemarkKind::Filemark => self.op(MTWEOF, count as libc::c_int),
            TapemarkKind::Setmark => self.op(MTWSM, count as libc::c_int),
        }
    }

    fn prepare(&mut self, op: PrepareOp) -> Result<()> {
        match op {
            PrepareOp::Load => self.op(MTLOAD, 1),
            PrepareOp::Unload => self.op(MTOFFL, 1),
        }
    }

    fn create_partition(&mut self, method: PartitionMethod) -> Result<()> {
        match method {
            // MTMKPART takes the size of the first partition in
            // megabytes; zero reformats to a single partition.
            PartitionMethod::Initiator(size) => {
                self.op(MTMKPART, (size / (1024 * 1024)) as libc::c_int)
            }
            PartitionMethod::Fixed => self.op(MTMKPART, 0),
            PartitionMethod::Select(_) => Err(TapeError::Unsupported("select partitions")),
        }
    }
}
