//! Incremental base-set resolution and file selection across sets.

use tracing::debug;

use crate::catalog::pattern::PatternSet;
use crate::catalog::{Ticks, Toc};
use crate::error::Result;

/// Selected file rows of one set, in tape order.
#[derive(Debug, Clone, PartialEq)]
pub struct SetSelection {
    pub set_index: usize,
    pub file_indices: Vec<usize>,
}

impl SetSelection {
    pub fn is_empty(&self) -> bool {
        self.file_indices.is_empty()
    }
}

/// The most recent non-incremental set at or below `current`. If that
/// base set is itself a continuation from the previous volume, the range
/// extends one set further back so the whole chain is covered.
pub fn base_set_index(toc: &Toc, current: usize) -> usize {
    let sets = toc.sets();
    let mut base = current.min(sets.len().saturating_sub(1));
    while base > 0 && sets[base].is_incremental() {
        base -= 1;
    }
    if base > 0 && sets[base].continued_from_previous {
        base -= 1;
    }
    base
}

/// Compute one selection per set, newest first.
///
/// With `incremental` off only the current set is consulted. With it on,
/// every set from the current one down to its base is consulted, and a
/// file is excluded when its absolute path (case-insensitive) already
/// appears in a newer selected set; the newest copy wins.
pub fn select_files(
    toc: &Toc,
    current: usize,
    patterns: Option<&[String]>,
    incremental: bool,
) -> Result<Vec<SetSelection>> {
    let patterns = PatternSet::compile(patterns)?;
    let sets = toc.sets();
    if sets.is_empty() {
        return Ok(Vec::new());
    }
    let current = current.min(sets.len() - 1);
    let base = if incremental {
        base_set_index(toc, current)
    } else {
        current
    };

    let mut claimed: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut selections = Vec::with_capacity(current - base + 1);

    for set_index in (base..=current).rev() {
        let set = &sets[set_index];
        // Walk newest-first inside the set so a path repeated within one
        // set also resolves to its newest copy, then restore tape order.
        let mut picked = Vec::new();
        for (file_index, info) in set.files().iter().enumerate().rev() {
            if !patterns.matches(&info.descriptor.path) {
                continue;
            }
            let key = info.descriptor.path.to_lowercase();
            if claimed.insert(key) {
                picked.push(file_index);
            }
        }
        picked.reverse();
        debug!(
            set_index,
            selected = picked.len(),
            total = set.files().len(),
            "selected files from set"
        );
        selections.push(SetSelection {
            set_index,
            file_indices: picked,
        });
    }

    Ok(selections)
}

/// Whether a file is already covered by the incremental chain ending at
/// `current`: any matching catalog entry with a write time at or after
/// the file's counts. Equal mtime is up to date.
pub fn is_file_uptodate(toc: &Toc, current: usize, path: &str, modified: Ticks) -> bool {
    let sets = toc.sets();
    if sets.is_empty() {
        return false;
    }
    let current = current.min(sets.len() - 1);
    let base = base_set_index(toc, current);
    for set in sets[base..=current].iter().rev() {
        if let Some(entry) = set.find_by_path(path) {
            if entry.descriptor.modified >= modified {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FileAttributes, FileDescriptor, FileInfo, SetToc};
    use crate::hash::HashKind;

    fn entry(toc: &mut Toc, path: &str, mtime: i64) -> FileInfo {
        FileInfo::new(
            toc.allocate_id(),
            0,
            FileDescriptor {
                path: path.to_string(),
                length: 1,
                attributes: FileAttributes::ARCHIVE,
                created: Ticks(mtime),
                modified: Ticks(mtime),
                accessed: Ticks(mtime),
            },
        )
    }

    /// Catalog with sets [full, inc, inc]; `/data/f` appears in the full
    /// set at T0 and the newest incremental at T2.
    fn chain() -> Toc {
        let mut toc = Toc::new("");
        let mut full = SetToc::new("full");
        full.hash_kind = HashKind::None;
        let f0 = entry(&mut toc, "/data/f", 100);
        let g = entry(&mut toc, "/data/g", 100);
        full.push_file(f0).unwrap();
        full.push_file(g).unwrap();
        toc.push_set(full).unwrap();

        let mut inc1 = SetToc::new("inc1");
        inc1.set_incremental(true).unwrap();
        toc.push_set(inc1).unwrap();

        let mut inc2 = SetToc::new("inc2");
        inc2.set_incremental(true).unwrap();
        let f2 = entry(&mut toc, "/data/f", 300);
        inc2.push_file(f2).unwrap();
        toc.push_set(inc2).unwrap();
        toc
    }

    #[test]
    fn base_resolution_walks_past_incrementals() {
        let toc = chain();
        assert_eq!(base_set_index(&toc, 2), 0);
        assert_eq!(base_set_index(&toc, 1), 0);
        assert_eq!(base_set_index(&toc, 0), 0);
    }

    #[test]
    fn base_extends_over_volume_continuation() {
        let mut toc = Toc::new("");
        toc.push_set(SetToc::new("full-v1")).unwrap();
        let cont = toc.sets()[0].continuation(2);
        toc.push_set(cont).unwrap();
        let mut inc = SetToc::new("inc");
        inc.set_incremental(true).unwrap();
        toc.push_set(inc).unwrap();
        // Base lands on the continuation, which pulls in its first half.
        assert_eq!(base_set_index(&toc, 2), 0);
    }

    #[test]
    fn newest_copy_wins_across_sets() {
        let toc = chain();
        let selections = select_files(&toc, 2, None, true).unwrap();
        assert_eq!(selections.len(), 3);
        // Newest first: the newest incremental claims /data/f at T2.
        assert_eq!(selections[0].set_index, 2);
        assert_eq!(selections[0].file_indices, vec![0]);
        assert!(selections[1].is_empty());
        // The full set still contributes the file the chain never
        // rewrote.
        assert_eq!(selections[2].set_index, 0);
        assert_eq!(selections[2].file_indices, vec![1]);
    }

    #[test]
    fn pattern_narrowing_and_empty_list() {
        let toc = chain();
        let only_g = select_files(&toc, 2, Some(&["/data/g".to_string()]), true).unwrap();
        assert!(only_g[0].is_empty());
        assert_eq!(only_g[2].file_indices, vec![1]);

        let nothing = select_files(&toc, 2, Some(&[]), true).unwrap();
        assert!(nothing.iter().all(|s| s.is_empty()));
    }

    #[test]
    fn non_incremental_reads_only_current_set() {
        let toc = chain();
        let selections = select_files(&toc, 0, None, false).unwrap();
        assert_eq!(selections.len(), 1);
        assert_eq!(selections[0].set_index, 0);
        assert_eq!(selections[0].file_indices, vec![0, 1]);
    }

    #[test]
    fn uptodate_compares_inclusive() {
        let toc = chain();
        assert!(is_file_uptodate(&toc, 2, "/data/f", Ticks(300)));
        assert!(is_file_uptodate(&toc, 2, "/data/f", Ticks(250)));
        assert!(!is_file_uptodate(&toc, 2, "/data/f", Ticks(301)));
        assert!(is_file_uptodate(&toc, 2, "/DATA/F", Ticks(300)));
        assert!(!is_file_uptodate(&toc, 2, "/data/missing", Ticks(0)));
    }
}
