//! Layout strategies: where content sets and the catalog live on tape,
//! and how to move between them.
//!
//! One navigator variant is selected per mount, from what the drive and
//! medium support. The catalog either gets its own partition or shares
//! the content area, in which case it sits behind the last set and is
//! invalidated (and later rewritten) whenever content is appended.

mod inset;
mod partition;

pub use self::inset::{FilemarkNavigator, SetmarkNavigator};
pub use self::partition::PartitionNavigator;

use tracing::debug;

use crate::device::DriveFeatures;
use crate::drive::Drive;
use crate::error::{Result, TapeError};
use crate::tuning::Configuration;

/// Catalog copies written back to back.
pub const TOC_COPIES: u32 = 2;

/// Filemarks making up the catalog locator ensemble: the mark closing
/// the content area, then two consecutive marks behind the gap file.
pub const TOC_MARK_FILEMARKS: u32 = 3;

/// Which set the tape head is parked at.
///
/// `At(k)` keeps the dual indexing of the catalog area: `0, 1, 2, …`
/// count from the beginning, `-1` is the end of the content area, and
/// `-2, -3, …` count from the last set backwards. Neither form depends
/// on knowing the total number of sets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetCursor {
    Unknown,
    /// Inside the catalog area.
    InToc,
    At(i64),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayoutScheme {
    /// Content in partition 1, catalog in partition 2.
    TocPartition,
    /// Catalog behind the last setmark-separated set.
    TocInSetSetmarks,
    /// Catalog behind the last filemark-separated set, with a locator
    /// mark for fast seeks.
    TocInSetFilemarksMarked,
    /// Catalog is simply the last two files on tape.
    TocInSetFilemarks,
}

/// State shared by every navigator variant.
pub struct NavCore {
    pub(crate) cursor: SetCursor,
    /// Content has been written over the on-tape catalog area.
    pub(crate) toc_invalidated: bool,
    /// A catalog is believed to exist on this medium.
    pub(crate) toc_on_tape: bool,
    pub(crate) reserved_toc_capacity: u64,
}

impl NavCore {
    pub(crate) fn new(config: &Configuration) -> NavCore {
        NavCore {
            cursor: SetCursor::Unknown,
            toc_invalidated: false,
            toc_on_tape: false,
            reserved_toc_capacity: config.reserved_toc_capacity,
        }
    }
}

/// How to reach a target set from the current cursor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Route {
    Stay,
    FromBegin,
    FromEnd,
    /// Separator-relative move from the current set, same sign domain.
    Relative(i64),
}

/// Plan the cheapest traversal: from the beginning, from the end, or
/// relative to the current position when its sign domain matches the
/// target's. The sign of the current cursor is preserved so counting
/// stays consistent without knowing the total set count.
pub(crate) fn choose_route(cursor: SetCursor, target: i64) -> Route {
    if target >= 0 {
        match cursor {
            SetCursor::At(cur) if cur >= 0 => {
                if cur == target {
                    Route::Stay
                } else if (target - cur).abs() < target {
                    Route::Relative(target - cur)
                } else {
                    Route::FromBegin
                }
            }
            _ => Route::FromBegin,
        }
    } else {
        match cursor {
            SetCursor::At(cur) if cur < 0 => {
                if cur == target {
                    Route::Stay
                } else if (target - cur).abs() < -target {
                    Route::Relative(target - cur)
                } else {
                    Route::FromEnd
                }
            }
            _ => Route::FromEnd,
        }
    }
}

/// A layout strategy. Variant-specific code supplies the positioning
/// primitives; traversal planning, separator bookkeeping and the
/// notification protocol live in the provided methods.
pub trait Navigator {
    fn scheme(&self) -> LayoutScheme;

    fn core(&self) -> &NavCore;

    fn core_mut(&mut self) -> &mut NavCore;

    /// Space over `count` set separators (sign is the direction).
    fn space_separators(&mut self, drive: &mut Drive, count: i32) -> Result<()>;

    /// Whether set separators are plain filemarks. When they are, and a
    /// set also separates its files with filemarks, set arithmetic by
    /// separator counting is ambiguous; readers position with
    /// catalog-derived mark counts instead.
    fn separators_are_filemarks(&self) -> bool;

    /// Write one set separator mark at the current position.
    fn write_separator_mark(&mut self, drive: &mut Drive) -> Result<()>;

    /// Park at the first byte of the on-tape catalog. Idempotent.
    fn move_to_begin_of_toc(&mut self, drive: &mut Drive) -> Result<()>;

    /// Park where the next content set would start. Idempotent.
    fn move_to_end_of_content(&mut self, drive: &mut Drive) -> Result<()>;

    /// Remaining bytes available to content, after any catalog reserve.
    fn remaining_content_capacity(&self, drive: &mut Drive) -> Result<u64>;

    /// Park at the start of the first content set. Idempotent.
    fn move_to_begin_of_content(&mut self, drive: &mut Drive) -> Result<()> {
        let r = drive.rewind();
        self.core_mut().cursor = match r {
            Ok(()) => SetCursor::At(0),
            Err(_) => SetCursor::Unknown,
        };
        r
    }

    /// Position for (and physically prepare) a catalog rewrite.
    fn begin_toc_write(&mut self, drive: &mut Drive) -> Result<()> {
        self.move_to_end_of_content(drive)
    }

    fn cursor(&self) -> SetCursor {
        self.core().cursor
    }

    fn toc_invalidated(&self) -> bool {
        self.core().toc_invalidated
    }

    /// Told by the catalog agents whether a catalog was found on tape.
    fn on_toc_read(&mut self, present: bool) {
        self.core_mut().toc_on_tape = present;
    }

    fn on_begin_write_content(&mut self, _drive: &mut Drive) -> Result<()> {
        Ok(())
    }

    /// Content reached the medium; an in-set catalog is stale now.
    fn on_content_written(&mut self, _drive: &mut Drive) -> Result<()> {
        self.core_mut().toc_invalidated = true;
        Ok(())
    }

    fn on_toc_written(&mut self, _drive: &mut Drive) -> Result<()> {
        let core = self.core_mut();
        core.toc_on_tape = true;
        core.toc_invalidated = false;
        core.cursor = SetCursor::InToc;
        Ok(())
    }

    /// Park at the start of the addressed content set, taking the
    /// cheapest route. On success the cursor equals `target`; on
    /// failure it is `Unknown`.
    fn move_to_content_set(&mut self, drive: &mut Drive, target: i64) -> Result<()> {
        let route = choose_route(self.core().cursor, target);
        debug!(?route, target, cursor = ?self.core().cursor, "moving to content set");
        let moved = self.run_route(drive, route, target);
        match moved {
            Ok(()) => {
                self.core_mut().cursor = SetCursor::At(target);
                Ok(())
            }
            Err(TapeError::BeginningOfMedia) if target == 0 => {
                // Ran into the physical beginning: that is exactly where
                // set 0 lives, so the condition is not an error here.
                drive.reset_error();
                self.core_mut().cursor = SetCursor::At(0);
                Ok(())
            }
            Err(e) => {
                self.core_mut().cursor = SetCursor::Unknown;
                Err(e)
            }
        }
    }

    #[doc(hidden)]
    fn run_route(&mut self, drive: &mut Drive, route: Route, target: i64) -> Result<()> {
        match route {
            Route::Stay => Ok(()),
            Route::FromBegin => {
                self.move_to_begin_of_content(drive)?;
                if target > 0 {
                    self.space_separators(drive, target as i32)?;
                }
                Ok(())
            }
            Route::FromEnd => {
                self.move_to_end_of_content(drive)?;
                if target < -1 {
                    self.space_separators(drive, target as i32)?;
                    self.space_separators(drive, 1)?;
                }
                Ok(())
            }
            Route::Relative(delta) => {
                if delta > 0 {
                    self.space_separators(drive, delta as i32)
                } else {
                    self.space_separators(drive, (delta - 1) as i32)?;
                    self.space_separators(drive, 1)
                }
            }
        }
    }

    /// Cross one set separator forward, advancing the cursor.
    fn skip_set_separator(&mut self, drive: &mut Drive) -> Result<()> {
        let r = self.space_separators(drive, 1);
        let core = self.core_mut();
        match r {
            Ok(()) => {
                if let SetCursor::At(k) = core.cursor {
                    if k >= 0 || k < -1 {
                        core.cursor = SetCursor::At(k + 1);
                    }
                }
                Ok(())
            }
            Err(e) => {
                core.cursor = SetCursor::Unknown;
                Err(e)
            }
        }
    }

    /// Close the current set with a separator mark; the head is then at
    /// the end of the content area.
    fn write_set_separator(&mut self, drive: &mut Drive) -> Result<()> {
        self.write_separator_mark(drive)?;
        self.core_mut().cursor = SetCursor::At(-1);
        self.on_content_written(drive)
    }
}

/// Pick the layout strategy for the mounted medium.
pub fn build(drive: &Drive, config: &Configuration) -> Box<dyn Navigator> {
    let features = drive.features();
    let media_partitions = drive.media().map(|m| m.partition_count).unwrap_or(1);
    let nav: Box<dyn Navigator> = if media_partitions >= 2 {
        Box::new(PartitionNavigator::new(features, config))
    } else if features.contains(DriveFeatures::SETMARKS) {
        Box::new(SetmarkNavigator::new(config))
    } else if features.contains(DriveFeatures::SEQUENTIAL_FILEMARKS) && config.use_toc_mark {
        Box::new(FilemarkNavigator::new(config, true))
    } else {
        Box::new(FilemarkNavigator::new(config, false))
    };
    debug!(scheme = ?nav.scheme(), "navigator selected");
    nav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_planning_prefers_short_traversals() {
        // Unknown cursor always goes absolute.
        assert_eq!(choose_route(SetCursor::Unknown, 3), Route::FromBegin);
        assert_eq!(choose_route(SetCursor::Unknown, -2), Route::FromEnd);
        assert_eq!(choose_route(SetCursor::InToc, 0), Route::FromBegin);

        // Matching sign domain moves relatively when cheaper.
        assert_eq!(choose_route(SetCursor::At(2), 3), Route::Relative(1));
        assert_eq!(choose_route(SetCursor::At(9), 1), Route::FromBegin);
        assert_eq!(choose_route(SetCursor::At(-2), -4), Route::Relative(-2));
        assert_eq!(choose_route(SetCursor::At(-9), -2), Route::FromEnd);

        // Sign mismatch cannot be bridged without the set count.
        assert_eq!(choose_route(SetCursor::At(-2), 3), Route::FromBegin);
        assert_eq!(choose_route(SetCursor::At(3), -2), Route::FromEnd);

        // Idempotence.
        assert_eq!(choose_route(SetCursor::At(4), 4), Route::Stay);
        assert_eq!(choose_route(SetCursor::At(-1), -1), Route::Stay);
    }
}
