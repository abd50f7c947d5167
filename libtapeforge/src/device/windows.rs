//! NT tape endpoint (`\\.\TAPE{n}`).
//!
//! Thin unsafe wrappers over the Win32 tape API. The kernel reports
//! tapemarks and media boundaries through the 11xx error-code family;
//! [`classify_error`] maps those onto the engine's error taxonomy.

use std::os::windows::ffi::OsStrExt;
use std::{ffi, fmt, io, mem, ptr};

use winapi::shared::minwindef::{BOOL, DWORD, FALSE, LPVOID};
use winapi::shared::winerror::{
    ERROR_BEGINNING_OF_MEDIA, ERROR_BUS_RESET, ERROR_END_OF_MEDIA, ERROR_FILEMARK_DETECTED,
    ERROR_MEDIA_CHANGED, ERROR_NOT_READY, ERROR_NO_DATA_DETECTED, ERROR_NO_MEDIA_IN_DRIVE,
    ERROR_SETMARK_DETECTED, ERROR_WRITE_PROTECT, NO_ERROR,
};
use winapi::um::fileapi::{CreateFileW, ReadFile, WriteFile, OPEN_EXISTING};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::winbase::{
    CreateTapePartition, GetTapeParameters, GetTapePosition, PrepareTape, SetTapeParameters,
    SetTapePosition, WriteTapemark,
};
use winapi::um::winnt::{
    BOOLEAN, GENERIC_READ, GENERIC_WRITE, HANDLE, TAPE_FILEMARKS, TAPE_FIXED_PARTITIONS,
    TAPE_GET_DRIVE_PARAMETERS, TAPE_GET_MEDIA_PARAMETERS, TAPE_INITIATOR_PARTITIONS, TAPE_LOAD,
    TAPE_LOGICAL_BLOCK, TAPE_LOGICAL_POSITION, TAPE_REWIND, TAPE_SELECT_PARTITIONS,
    TAPE_SETMARKS, TAPE_SET_DRIVE_PARAMETERS, TAPE_SET_MEDIA_PARAMETERS, TAPE_SPACE_END_OF_DATA,
    TAPE_SPACE_FILEMARKS, TAPE_SPACE_SEQUENTIAL_FMKS, TAPE_SPACE_SETMARKS, TAPE_UNLOAD, WCHAR,
};
use winapi::um::winnt::{
    TAPE_DRIVE_COMPRESSION, TAPE_DRIVE_ECC, TAPE_DRIVE_FIXED, TAPE_DRIVE_INITIATOR,
    TAPE_DRIVE_LOGICAL_BLK, TAPE_DRIVE_PADDING, TAPE_DRIVE_REPORT_SMKS, TAPE_DRIVE_SELECT,
    TAPE_DRIVE_SEQUENTIAL_FMKS, TAPE_DRIVE_WRITE_SETMARKS,
};

use crate::device::{
    DriveFeatures, DriveParams, DriveSettings, MediaParams, PartitionMethod, PositionTarget,
    PrepareOp, TapeIo, TapemarkKind,
};
use crate::error::{Result, TapeError};

const GET_TAPE_MEDIA_INFORMATION: DWORD = 0;
const GET_TAPE_DRIVE_INFORMATION: DWORD = 1;
const SET_TAPE_MEDIA_INFORMATION: DWORD = 0;
const SET_TAPE_DRIVE_INFORMATION: DWORD = 1;

fn classify_error(code: DWORD) -> TapeError {
    match code {
        ERROR_END_OF_MEDIA => TapeError::EndOfMedia,
        ERROR_FILEMARK_DETECTED => TapeError::Filemark,
        ERROR_BEGINNING_OF_MEDIA => TapeError::BeginningOfMedia,
        ERROR_SETMARK_DETECTED => TapeError::Setmark,
        ERROR_NO_DATA_DETECTED => TapeError::NoData,
        ERROR_MEDIA_CHANGED => TapeError::MediaChanged,
        ERROR_BUS_RESET => TapeError::BusReset,
        ERROR_NO_MEDIA_IN_DRIVE => TapeError::NoMedia,
        ERROR_NOT_READY => TapeError::NotReady,
        ERROR_WRITE_PROTECT => TapeError::WriteProtected,
        code => TapeError::Io(io::Error::from_raw_os_error(code as i32)),
    }
}

fn last_error() -> TapeError {
    classify_error(unsafe { winapi::um::errhandlingapi::GetLastError() })
}

pub struct WindowsTapeDevice {
    tape_device: HANDLE,
}

// NT handles are movable between threads even though the raw pointer
// type is not; the drive itself is still single-threaded.
unsafe impl Send for WindowsTapeDevice {}

impl WindowsTapeDevice {
    /// Open a tape device by its NT device number.
    pub fn open_tape_number<I: num::Integer>(nt_tape_id: I) -> Result<WindowsTapeDevice>
    where
        I: fmt::Display,
    {
        let filepath = format!("\\\\.\\TAPE{}", nt_tape_id);
        WindowsTapeDevice::open_device(ffi::OsStr::new(&filepath))
    }

    pub fn open_device(nt_device_path: &ffi::OsStr) -> Result<WindowsTapeDevice> {
        let mut wide: Vec<WCHAR> = nt_device_path.encode_wide().collect();
        wide.push(0);
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null_mut(),
                OPEN_EXISTING,
                0,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(last_error());
        }
        Ok(unsafe { WindowsTapeDevice::from_device_handle(handle) })
    }

    /// # Safety
    ///
    /// `handle` must be a valid NT handle onto an open tape device; the
    /// returned value owns and eventually closes it.
    pub unsafe fn from_device_handle(handle: HANDLE) -> WindowsTapeDevice {
        WindowsTapeDevice {
            tape_device: handle,
        }
    }

    fn check(error: DWORD) -> Result<()> {
        if error == NO_ERROR {
            Ok(())
        } else {
            Err(classify_error(error))
        }
    }

    fn set_position_raw(&mut self, method: DWORD, partition: DWORD, offset: i64) -> Result<()> {
        let error = unsafe {
            SetTapePosition(
                self.tape_device,
                method,
                partition,
                (offset & 0xFFFF_FFFF) as DWORD,
                ((offset >> 32) & 0xFFFF_FFFF) as DWORD,
                FALSE,
            )
        };
        WindowsTapeDevice::check(error)
    }
}

impl Drop for WindowsTapeDevice {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.tape_device) };
    }
}

impl TapeIo for WindowsTapeDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut count: DWORD = 0;
        let ok = unsafe {
            ReadFile(
                self.tape_device,
                buf.as_mut_ptr() as LPVOID,
                buf.len() as DWORD,
                &mut count,
                ptr::null_mut(),
            )
        };
        if ok != 0 {
            Ok(count as usize)
        } else if count > 0 {
            // A mark terminated the transfer; deliver what arrived and
            // let the next read report the mark itself.
            Ok(count as usize)
        } else {
            Err(last_error())
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut count: DWORD = 0;
        let ok = unsafe {
            WriteFile(
                self.tape_device,
                buf.as_ptr() as *const winapi::ctypes::c_void,
                buf.len() as DWORD,
                &mut count,
                ptr::null_mut(),
            )
        };
        if ok != 0 {
            Ok(count as usize)
        } else {
            Err(last_error())
        }
    }

    fn drive_params(&mut self) -> Result<DriveParams> {
        let mut params: TAPE_GET_DRIVE_PARAMETERS = unsafe { mem::zeroed() };
        let mut size = mem::size_of::<TAPE_GET_DRIVE_PARAMETERS>() as DWORD;
        let error = unsafe {
            GetTapeParameters(
                self.tape_device,
                GET_TAPE_DRIVE_INFORMATION,
                &mut size,
                &mut params as *mut _ as LPVOID,
            )
        };
        WindowsTapeDevice::check(error)?;

        let mut features = DriveFeatures::empty();
        if params.FeaturesHigh & TAPE_DRIVE_WRITE_SETMARKS != 0 {
            features |= DriveFeatures::SETMARKS;
        }
        if params.FeaturesHigh & TAPE_DRIVE_SEQUENTIAL_FMKS != 0 {
            features |= DriveFeatures::SEQUENTIAL_FILEMARKS;
        }
        if params.FeaturesHigh & TAPE_DRIVE_LOGICAL_BLK != 0 {
            features |= DriveFeatures::ABSOLUTE_POSITIONING;
        }
        if params.FeaturesLow & TAPE_DRIVE_INITIATOR != 0 {
            features |= DriveFeatures::INITIATOR_PARTITIONS;
        }
        if params.FeaturesLow & TAPE_DRIVE_SELECT != 0 {
            features |= DriveFeatures::SELECT_PARTITIONS;
        }
        if params.FeaturesLow & TAPE_DRIVE_FIXED != 0 {
            features |= DriveFeatures::FIXED_PARTITIONS;
        }
        if params.FeaturesLow & TAPE_DRIVE_COMPRESSION != 0 {
            features |= DriveFeatures::COMPRESSION;
        }
        if params.FeaturesLow & TAPE_DRIVE_ECC != 0 {
            features |= DriveFeatures::ECC;
        }
        if params.FeaturesLow & TAPE_DRIVE_PADDING != 0 {
            features |= DriveFeatures::DATA_PADDING;
        }
        if params.FeaturesLow & TAPE_DRIVE_REPORT_SMKS != 0 {
            features |= DriveFeatures::REPORT_SETMARKS;
        }

        Ok(DriveParams {
            min_block_size: params.MinimumBlockSize,
            max_block_size: params.MaximumBlockSize,
            default_block_size: params.DefaultBlockSize,
            max_partition_count: params.MaximumPartitionCount,
            features,
        })
    }

    fn media_params(&mut self) -> Result<MediaParams> {
        let mut params: TAPE_GET_MEDIA_PARAMETERS = unsafe { mem::zeroed() };
        let mut size = mem::size_of::<TAPE_GET_MEDIA_PARAMETERS>() as DWORD;
        let error = unsafe {
            GetTapeParameters(
                self.tape_device,
                GET_TAPE_MEDIA_INFORMATION,
                &mut size,
                &mut params as *mut _ as LPVOID,
            )
        };
        WindowsTapeDevice::check(error)?;
        Ok(MediaParams {
            capacity: unsafe { *params.Capacity.QuadPart() } as u64,
            remaining: unsafe { *params.Remaining.QuadPart() } as u64,
            block_size: params.BlockSize,
            partition_count: params.PartitionCount,
            write_protected: params.WriteProtected != 0,
        })
    }

    fn set_drive_settings(&mut self, settings: &DriveSettings) -> Result<()> {
        let mut params = TAPE_SET_DRIVE_PARAMETERS {
            ECC: settings.ecc as BOOLEAN,
            Compression: settings.compression as BOOLEAN,
            DataPadding: settings.data_padding as BOOLEAN,
            ReportSetmarks: settings.report_setmarks as BOOLEAN,
            EOTWarningZoneSize: settings.eot_warning_size,
        };
        let error = unsafe {
            SetTapeParameters(
                self.tape_device,
                SET_TAPE_DRIVE_INFORMATION,
                &mut params as *mut _ as LPVOID,
            )
        };
        WindowsTapeDevice::check(error)
    }

    fn set_block_size(&mut self, size: u32) -> Result<()> {
        let mut params = TAPE_SET_MEDIA_PARAMETERS { BlockSize: size };
        let error = unsafe {
            SetTapeParameters(
                self.tape_device,
                SET_TAPE_MEDIA_INFORMATION,
                &mut params as *mut _ as LPVOID,
            )
        };
        WindowsTapeDevice::check(error)
    }

    fn set_position(&mut self, target: PositionTarget) -> Result<()> {
        match target {
            PositionTarget::Rewind => self.set_position_raw(TAPE_REWIND, 0, 0),
            PositionTarget::EndOfData => self.set_position_raw(TAPE_SPACE_END_OF_DATA, 0, 0),
            PositionTarget::AbsoluteBlock(block) => {
                self.set_position_raw(TAPE_LOGICAL_BLOCK, 0, block as i64)
            }
            PositionTarget::Filemarks(n) => {
                self.set_position_raw(TAPE_SPACE_FILEMARKS, 0, n as i64)
            }
            PositionTarget::Setmarks(n) => self.set_position_raw(TAPE_SPACE_SETMARKS, 0, n as i64),
            PositionTarget::SequentialFilemarks(n) => {
                self.set_position_raw(TAPE_SPACE_SEQUENTIAL_FMKS, 0, n as i64)
            }
            PositionTarget::Partition(p) => self.set_position_raw(TAPE_LOGICAL_BLOCK, p, 0),
        }
    }

    fn position(&mut self) -> Result<(u32, u64)> {
        let mut partition: DWORD = 0;
        let mut low: DWORD = 0;
        let mut high: DWORD = 0;
        let error = unsafe {
            GetTapePosition(
                self.tape_device,
                TAPE_LOGICAL_POSITION,
                &mut partition,
                &mut low,
                &mut high,
            )
        };
        WindowsTapeDevice::check(error)?;
        Ok((partition, ((high as u64) << 32) | low as u64))
    }

    fn write_tapemark(&mut self, kind: TapemarkKind, count: u32) -> Result<()> {
        let mark_type = match kind {
            TapemarkKind::Filemark => TAPE_FILEMARKS,
            TapemarkKind::Setmark => TAPE_SETMARKS,
        };
        let error = unsafe { WriteTapemark(self.tape_device, mark_type, count, FALSE) };
        WindowsTapeDevice::check(error)
    }

    fn prepare(&mut self, op: PrepareOp) -> Result<()> {
        let operation = match op {
            PrepareOp::Load => TAPE_LOAD,
            PrepareOp::Unload => TAPE_UNLOAD,
        };
        let error = unsafe { PrepareTape(self.tape_device, operation, FALSE) };
        WindowsTapeDevice::check(error)
    }

    fn create_partition(&mut self, method: PartitionMethod) -> Result<()> {
        let (method, count, size) = match method {
            PartitionMethod::Initiator(bytes) => (
                TAPE_INITIATOR_PARTITIONS,
                2,
                (bytes / (1024 * 1024)) as DWORD,
            ),
            PartitionMethod::Select(count) => (TAPE_SELECT_PARTITIONS, count, 0),
            PartitionMethod::Fixed => (TAPE_FIXED_PARTITIONS, 0, 0),
        };
        let error = unsafe { CreateTapePartition(self.tape_device, method, count, size) };
        WindowsTapeDevice::check(error)
    }
}
