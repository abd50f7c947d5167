//! Navigator for media with a dedicated catalog partition.
//!
//! Content lives in partition 1, the catalog in partition 2. Content
//! writes can never clobber the catalog, so the invalidation protocol
//! of the in-set layouts does not apply here.

use crate::device::DriveFeatures;
use crate::drive::Drive;
use crate::error::Result;
use crate::navigator::{LayoutScheme, NavCore, Navigator, SetCursor};
use crate::tuning::Configuration;

const CONTENT_PARTITION: u32 = 1;
const TOC_PARTITION: u32 = 2;

pub struct PartitionNavigator {
    core: NavCore,
    /// Separate sets with setmarks when the drive can write them;
    /// filemarks emulate them otherwise.
    use_setmarks: bool,
}

impl PartitionNavigator {
    pub fn new(features: DriveFeatures, config: &Configuration) -> PartitionNavigator {
        PartitionNavigator {
            core: NavCore::new(config),
            use_setmarks: features.contains(DriveFeatures::SETMARKS),
        }
    }
}

impl Navigator for PartitionNavigator {
    fn scheme(&self) -> LayoutScheme {
        LayoutScheme::TocPartition
    }

    fn core(&self) -> &NavCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NavCore {
        &mut self.core
    }

    fn space_separators(&mut self, drive: &mut Drive, count: i32) -> Result<()> {
        if self.use_setmarks {
            drive.move_next_setmark(count)
        } else {
            drive.move_next_filemark(count)
        }
    }

    fn write_separator_mark(&mut self, drive: &mut Drive) -> Result<()> {
        if self.use_setmarks {
            drive.write_setmark(1)
        } else {
            drive.write_filemark(1)
        }
    }

    fn separators_are_filemarks(&self) -> bool {
        !self.use_setmarks
    }

    fn move_to_begin_of_toc(&mut self, drive: &mut Drive) -> Result<()> {
        let r = drive
            .move_to_partition(TOC_PARTITION)
            .and_then(|_| drive.rewind());
        self.core.cursor = match r {
            Ok(()) => SetCursor::InToc,
            Err(_) => SetCursor::Unknown,
        };
        r
    }

    fn move_to_begin_of_content(&mut self, drive: &mut Drive) -> Result<()> {
        let r = drive
            .move_to_partition(CONTENT_PARTITION)
            .and_then(|_| drive.rewind());
        self.core.cursor = match r {
            Ok(()) => SetCursor::At(0),
            Err(_) => SetCursor::Unknown,
        };
        r
    }

    fn move_to_end_of_content(&mut self, drive: &mut Drive) -> Result<()> {
        let r = drive.fast_forward_to_end(Some(CONTENT_PARTITION));
        self.core.cursor = match r {
            Ok(()) => SetCursor::At(-1),
            Err(_) => SetCursor::Unknown,
        };
        r
    }

    fn begin_toc_write(&mut self, drive: &mut Drive) -> Result<()> {
        self.move_to_begin_of_toc(drive)
    }

    /// The catalog partition is untouchable from the content side.
    fn on_content_written(&mut self, _drive: &mut Drive) -> Result<()> {
        Ok(())
    }

    /// No reserve needed; the catalog has its own partition.
    fn remaining_content_capacity(&self, drive: &mut Drive) -> Result<u64> {
        drive.remaining_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::virt::{VirtualConfig, VirtualHandle, VirtualTape};
    use crate::drive::tests::test_config;
    use crate::navigator::build;

    fn setup() -> (Drive, Box<dyn Navigator>, VirtualHandle) {
        let (tape, handle) = VirtualTape::new(VirtualConfig::with_partitions(1 << 20));
        let mut drive = Drive::with_io(Box::new(tape), test_config()).unwrap();
        drive.load_media().unwrap();
        drive.format_media(1 << 16).unwrap();
        drive.set_block_size(64).unwrap();
        let nav = build(&drive, &test_config());
        (drive, nav, handle)
    }

    #[test]
    fn formatted_media_selects_the_partition_scheme() {
        let (_, nav, _) = setup();
        assert_eq!(nav.scheme(), LayoutScheme::TocPartition);
    }

    #[test]
    fn toc_and_content_live_in_different_partitions() {
        let (mut drive, mut nav, handle) = setup();

        nav.move_to_end_of_content(&mut drive).unwrap();
        drive.write_block(&vec![1u8; 64]).unwrap();
        nav.write_set_separator(&mut drive).unwrap();

        nav.begin_toc_write(&mut drive).unwrap();
        drive.write_block(&vec![0xAAu8; 64]).unwrap();
        drive.write_filemark(1).unwrap();
        nav.on_toc_written(&mut drive).unwrap();

        assert_eq!(handle.layout(0), "DF");
        assert_eq!(handle.layout(1), "DF");
        // Content writes never invalidate a partitioned catalog.
        assert!(!nav.toc_invalidated());

        // And appending more content leaves the catalog intact.
        nav.move_to_end_of_content(&mut drive).unwrap();
        drive.write_block(&vec![2u8; 64]).unwrap();
        nav.write_set_separator(&mut drive).unwrap();
        assert_eq!(handle.layout(1), "DF");
        assert!(!nav.toc_invalidated());

        nav.move_to_begin_of_toc(&mut drive).unwrap();
        let mut buf = vec![0u8; 64];
        let outcome = drive.read_block(&mut buf).unwrap();
        assert_eq!(outcome.count, 64);
        assert_eq!(buf[0], 0xAA);
    }
}
