//! Low-level tape device endpoints.
//!
//! [`TapeIo`] is the ioctl-shaped contract every backend implements:
//! whole-record read/write, capability queries, positioning, tapemarks,
//! load/unload and partitioning. Backends classify their kernel error
//! codes into [`crate::TapeError`] variants; everything above this layer
//! is OS-agnostic.

use bitflags::bitflags;

use crate::error::Result;

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

pub mod virt;

bitflags! {
    /// What the drive hardware can do. Filled once per open.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DriveFeatures: u32 {
        /// Can write and space over setmarks.
        const SETMARKS             = 0x0001;
        /// Can space to the n-th occurrence of consecutive filemarks.
        const SEQUENTIAL_FILEMARKS = 0x0002;
        /// Can create a small initiator partition plus a main partition.
        const INITIATOR_PARTITIONS = 0x0004;
        /// Can create a requested number of equal partitions.
        const SELECT_PARTITIONS    = 0x0008;
        /// Partition layout is fixed by the medium format.
        const FIXED_PARTITIONS     = 0x0010;
        const COMPRESSION          = 0x0020;
        const ECC                  = 0x0040;
        const DATA_PADDING         = 0x0080;
        /// Can report setmarks while reading.
        const REPORT_SETMARKS      = 0x0100;
        const ABSOLUTE_POSITIONING = 0x0200;
    }
}

impl DriveFeatures {
    pub fn supports_partitions(self) -> bool {
        self.intersects(
            DriveFeatures::INITIATOR_PARTITIONS
                | DriveFeatures::SELECT_PARTITIONS
                | DriveFeatures::FIXED_PARTITIONS,
        )
    }
}

/// Immutable (per-open) drive capability descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DriveParams {
    pub min_block_size: u32,
    pub max_block_size: u32,
    pub default_block_size: u32,
    pub max_partition_count: u32,
    pub features: DriveFeatures,
}

impl DriveParams {
    /// Clamp a requested block size into the drive's range; 0 requests
    /// the default.
    pub fn clamp_block_size(&self, size: u32) -> u32 {
        if size == 0 {
            self.default_block_size
        } else {
            size.clamp(self.min_block_size, self.max_block_size)
        }
    }
}

/// Mutable view of the mounted medium. Refreshed on every load.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MediaParams {
    pub capacity: u64,
    pub remaining: u64,
    pub block_size: u32,
    pub partition_count: u32,
    pub write_protected: bool,
}

/// Optional drive settings applied once after open.
#[derive(Debug, Copy, Clone)]
pub struct DriveSettings {
    pub compression: bool,
    pub ecc: bool,
    pub data_padding: bool,
    pub report_setmarks: bool,
    /// Early-warning zone size in bytes; the drive reports end-of-media
    /// this far before the physical end.
    pub eot_warning_size: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TapemarkKind {
    Filemark,
    Setmark,
}

/// A positioning request. Relative counts are signed: positive moves
/// toward end-of-tape.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PositionTarget {
    Rewind,
    EndOfData,
    AbsoluteBlock(u64),
    Filemarks(i32),
    Setmarks(i32),
    /// Space to the first run of `|n|` consecutive filemarks (sign is
    /// the direction), landing on the far side of the run.
    SequentialFilemarks(i32),
    Partition(u32),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionMethod {
    /// One initiator partition of the given size in bytes, the rest in
    /// a second partition.
    Initiator(u64),
    /// A requested number of partitions.
    Select(u32),
    /// The medium's fixed partition layout.
    Fixed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrepareOp {
    Load,
    Unload,
}

/// The OS tape endpoint. Implementations transfer whole records only;
/// partial transfers surface as classified errors, never as silent
/// truncation.
pub trait TapeIo {
    /// Read one record into `buf`. Returns the transferred byte count.
    /// Filemarks, setmarks and blank tape surface as the matching
    /// [`crate::TapeError`] variants with the head past the mark.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write one record. A full medium surfaces as
    /// [`crate::TapeError::EndOfMedia`]; the count reflects bytes the
    /// drive actually accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn drive_params(&mut self) -> Result<DriveParams>;

    fn media_params(&mut self) -> Result<MediaParams>;

    fn set_drive_settings(&mut self, settings: &DriveSettings) -> Result<()>;

    /// Set the medium block size. The caller has already clamped the
    /// value into the drive's supported range.
    fn set_block_size(&mut self, size: u32) -> Result<()>;

    fn set_position(&mut self, target: PositionTarget) -> Result<()>;

    /// Current (partition, logical block).
    fn position(&mut self) -> Result<(u32, u64)>;

    fn write_tapemark(&mut self, kind: TapemarkKind, count: u32) -> Result<()>;

    fn prepare(&mut self, op: PrepareOp) -> Result<()>;

    fn create_partition(&mut self, method: PartitionMethod) -> Result<()>;
}
