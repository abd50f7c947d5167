//! Navigators for media where the catalog shares the content partition.
//!
//! The catalog sits behind the last content set as two filemark-
//! delimited files. With setmark support, sets are separated by
//! setmarks and the catalog starts after the last one. Without it,
//! filemarks emulate setmarks, and optionally a locator ensemble (gap
//! file plus two consecutive filemarks) is written ahead of the catalog
//! so drives that can space over sequential filemarks find it without
//! winding to end-of-data first.

use crate::drive::Drive;
use crate::error::{Result, TapeError};
use crate::navigator::{
    LayoutScheme, NavCore, Navigator, SetCursor, TOC_COPIES, TOC_MARK_FILEMARKS,
};
use crate::tuning::Configuration;

/// Wind to end-of-data and back off over `marks` filemarks, then cross
/// the last one forward again. Lands on the first byte after that mark.
/// An empty content area backs into the physical beginning, which is
/// then the answer.
fn back_off_from_end(drive: &mut Drive, marks: i32) -> Result<()> {
    drive.fast_forward_to_end(None)?;
    match drive.move_next_filemark(-marks) {
        Ok(()) => drive.move_next_filemark(1),
        Err(TapeError::BeginningOfMedia) => {
            drive.rewind()?;
            drive.reset_error();
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Catalog-in-set layout with real setmarks:
/// `[set0][SM][set1][SM]…[setN][SM][toc][FM][toc][FM]`.
pub struct SetmarkNavigator {
    core: NavCore,
}

impl SetmarkNavigator {
    pub fn new(config: &Configuration) -> SetmarkNavigator {
        SetmarkNavigator {
            core: NavCore::new(config),
        }
    }

    fn seek_past_last_setmark(&mut self, drive: &mut Drive) -> Result<()> {
        drive.fast_forward_to_end(None)?;
        match drive.move_next_setmark(-1) {
            Ok(()) => drive.move_next_setmark(1),
            Err(TapeError::BeginningOfMedia) => {
                drive.rewind()?;
                drive.reset_error();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Navigator for SetmarkNavigator {
    fn scheme(&self) -> LayoutScheme {
        LayoutScheme::TocInSetSetmarks
    }

    fn core(&self) -> &NavCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NavCore {
        &mut self.core
    }

    fn space_separators(&mut self, drive: &mut Drive, count: i32) -> Result<()> {
        drive.move_next_setmark(count)
    }

    fn separators_are_filemarks(&self) -> bool {
        false
    }

    fn write_separator_mark(&mut self, drive: &mut Drive) -> Result<()> {
        drive.write_setmark(1)
    }

    fn move_to_begin_of_toc(&mut self, drive: &mut Drive) -> Result<()> {
        let r = self.seek_past_last_setmark(drive);
        self.core.cursor = match r {
            Ok(()) => SetCursor::InToc,
            Err(_) => SetCursor::Unknown,
        };
        r
    }

    fn move_to_end_of_content(&mut self, drive: &mut Drive) -> Result<()> {
        // With no valid catalog behind the content, end-of-data is the
        // end of content. Otherwise the catalog area starts exactly at
        // the end of content.
        let r = if !self.core.toc_on_tape || self.core.toc_invalidated {
            drive.fast_forward_to_end(None)
        } else {
            self.seek_past_last_setmark(drive)
        };
        self.core.cursor = match r {
            Ok(()) => SetCursor::At(-1),
            Err(_) => SetCursor::Unknown,
        };
        r
    }

    fn remaining_content_capacity(&self, drive: &mut Drive) -> Result<u64> {
        Ok(drive
            .remaining_capacity()?
            .saturating_sub(self.core.reserved_toc_capacity))
    }
}

/// Catalog-in-set layout with filemarks emulating setmarks. With
/// `use_toc_mark`, the catalog is preceded by the locator ensemble:
/// `[content][FM][gap][FM][FM][toc][FM][toc][FM]`; without it the
/// catalog is simply the last two files:
/// `[content][FM][toc][FM][toc][FM]`.
pub struct FilemarkNavigator {
    core: NavCore,
    use_toc_mark: bool,
}

impl FilemarkNavigator {
    pub fn new(config: &Configuration, use_toc_mark: bool) -> FilemarkNavigator {
        FilemarkNavigator {
            core: NavCore::new(config),
            use_toc_mark,
        }
    }

    /// Filemarks between the end of content and end-of-data.
    fn trailer_marks(&self) -> i32 {
        if self.use_toc_mark {
            (TOC_COPIES + TOC_MARK_FILEMARKS) as i32
        } else {
            (TOC_COPIES + 1) as i32
        }
    }
}

impl Navigator for FilemarkNavigator {
    fn scheme(&self) -> LayoutScheme {
        if self.use_toc_mark {
            LayoutScheme::TocInSetFilemarksMarked
        } else {
            LayoutScheme::TocInSetFilemarks
        }
    }

    fn core(&self) -> &NavCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NavCore {
        &mut self.core
    }

    fn space_separators(&mut self, drive: &mut Drive, count: i32) -> Result<()> {
        drive.move_next_filemark(count)
    }

    fn separators_are_filemarks(&self) -> bool {
        true
    }

    fn write_separator_mark(&mut self, drive: &mut Drive) -> Result<()> {
        drive.write_filemark(1)
    }

    fn move_to_begin_of_toc(&mut self, drive: &mut Drive) -> Result<()> {
        let r = if self.use_toc_mark {
            // Fast path: the locator is the only run of two consecutive
            // filemarks, so it can be found from the near end of the
            // tape. Fall back to winding to end-of-data if it is
            // missing.
            let fast = drive
                .rewind()
                .and_then(|_| drive.move_past_sequential_filemarks(2));
            match fast {
                Ok(()) => Ok(()),
                Err(_) => {
                    drive.reset_error();
                    back_off_from_end(drive, (TOC_COPIES + 1) as i32)
                }
            }
        } else {
            back_off_from_end(drive, (TOC_COPIES + 1) as i32)
        };
        self.core.cursor = match r {
            Ok(()) => SetCursor::InToc,
            Err(_) => SetCursor::Unknown,
        };
        r
    }

    fn move_to_end_of_content(&mut self, drive: &mut Drive) -> Result<()> {
        let r = if !self.core.toc_on_tape || self.core.toc_invalidated {
            drive.fast_forward_to_end(None)
        } else {
            back_off_from_end(drive, self.trailer_marks())
        };
        self.core.cursor = match r {
            Ok(()) => SetCursor::At(-1),
            Err(_) => SetCursor::Unknown,
        };
        r
    }

    fn begin_toc_write(&mut self, drive: &mut Drive) -> Result<()> {
        self.move_to_end_of_content(drive)?;
        if self.use_toc_mark {
            // The locator: a gap file so the content's closing mark
            // stays isolated, then the two consecutive marks the
            // sequential-filemark seek looks for.
            drive.write_gap_file()?;
            drive.write_filemark(2)?;
        }
        Ok(())
    }

    fn remaining_content_capacity(&self, drive: &mut Drive) -> Result<u64> {
        Ok(drive
            .remaining_capacity()?
            .saturating_sub(self.core.reserved_toc_capacity))
    }
}
