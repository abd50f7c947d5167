//! The on-tape catalog: backup sets, file rows, and the top-level
//! directory that links volumes together.
//!
//! Catalog objects are plain data. A [`FileDescriptor`] is a snapshot of
//! a filesystem entry at backup time; mutating one never touches the
//! filesystem. The catalog travels on tape through the [`crate::wire`]
//! codec in the exact field order fixed by the wire layout.

pub mod pattern;
pub mod select;

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::error::{Result, TapeError};
use crate::hash::HashKind;
use crate::wire::{Wire, WireReader, WireWriter};

/// 100-nanosecond intervals since 0001-01-01T00:00:00 UTC.
///
/// The epoch is a shim constant: hosts count from the Unix epoch and
/// offset by [`UNIX_EPOCH_TICKS`] when converting.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Ticks(pub i64);

/// Tick count of 1970-01-01T00:00:00 UTC.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

impl Ticks {
    pub fn now() -> Ticks {
        Ticks::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Ticks {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Ticks(UNIX_EPOCH_TICKS + (d.as_nanos() / 100) as i64),
            Err(e) => Ticks(UNIX_EPOCH_TICKS - (e.duration().as_nanos() / 100) as i64),
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        let delta = self.0 - UNIX_EPOCH_TICKS;
        if delta >= 0 {
            UNIX_EPOCH + Duration::from_nanos(delta as u64 * 100)
        } else {
            UNIX_EPOCH - Duration::from_nanos(delta.unsigned_abs() * 100)
        }
    }
}

bitflags! {
    /// Attribute bitset carried in the 4-byte wire field. The bit
    /// values match the usual FILE_ATTRIBUTE_* constants; on unix,
    /// READONLY and DIRECTORY are synthesized and the rest round-trip
    /// opaquely.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        const READONLY  = 0x0001;
        const HIDDEN    = 0x0002;
        const SYSTEM    = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE   = 0x0020;
        const NORMAL    = 0x0080;
        const TEMPORARY = 0x0100;
    }
}

/// Semantic snapshot of a filesystem entry at backup time.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDescriptor {
    /// Absolute path the entry was read from.
    pub path: String,
    pub length: u64,
    pub attributes: FileAttributes,
    pub created: Ticks,
    pub modified: Ticks,
    pub accessed: Ticks,
}

impl FileDescriptor {
    /// Snapshot a live filesystem entry. This is the only constructor
    /// that touches the filesystem.
    pub fn snapshot<P: AsRef<Path>>(path: P) -> std::io::Result<FileDescriptor> {
        let abs = std::path::absolute(path.as_ref())?;
        let metadata = fs::metadata(&abs)?;

        let mut attributes = FileAttributes::empty();
        if metadata.permissions().readonly() {
            attributes |= FileAttributes::READONLY;
        }
        if metadata.is_dir() {
            attributes |= FileAttributes::DIRECTORY;
        } else {
            attributes |= FileAttributes::ARCHIVE;
        }

        Ok(FileDescriptor {
            path: abs.to_string_lossy().into_owned(),
            length: metadata.len(),
            attributes,
            created: metadata
                .created()
                .map(Ticks::from_system_time)
                .unwrap_or_default(),
            modified: metadata
                .modified()
                .map(Ticks::from_system_time)
                .unwrap_or_default(),
            accessed: metadata
                .accessed()
                .map(Ticks::from_system_time)
                .unwrap_or_default(),
        })
    }

    /// Apply the recorded timestamps and the readonly bit to a restored
    /// file.
    pub fn apply_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = fs::File::options().write(true).open(path.as_ref())?;
        let times = fs::FileTimes::new()
            .set_modified(self.modified.to_system_time())
            .set_accessed(self.accessed.to_system_time());
        file.set_times(times)?;
        drop(file);

        if self.attributes.contains(FileAttributes::READONLY) {
            let mut perms = fs::metadata(path.as_ref())?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(path.as_ref(), perms)?;
        }
        Ok(())
    }

    fn encode_fields<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_string(&self.path)?;
        w.write_u64(self.length)?;
        w.write_u32(self.attributes.bits())?;
        w.write_i64(self.created.0)?;
        w.write_i64(self.modified.0)?;
        w.write_i64(self.accessed.0)
    }

    fn decode_fields<R: Read>(r: &mut WireReader<R>) -> Result<FileDescriptor> {
        Ok(FileDescriptor {
            path: r.read_string()?,
            length: r.read_u64()?,
            attributes: FileAttributes::from_bits_retain(r.read_u32()?),
            created: Ticks(r.read_i64()?),
            modified: Ticks(r.read_i64()?),
            accessed: Ticks(r.read_i64()?),
        })
    }
}

impl Wire for FileDescriptor {
    fn encode<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        self.encode_fields(w)
    }

    fn decode<R: Read>(r: &mut WireReader<R>) -> Result<Option<FileDescriptor>> {
        Ok(Some(FileDescriptor::decode_fields(r)?))
    }
}

/// One catalog row: identifier, payload location, descriptor, digest.
///
/// `id == 0` means "unset"; a valid row always has a nonzero id unique
/// within its catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub id: u64,
    /// Logical block where the payload (header included) starts.
    pub block: u64,
    pub descriptor: FileDescriptor,
    pub hash: Option<Vec<u8>>,
}

impl FileInfo {
    pub fn new(id: u64, block: u64, descriptor: FileDescriptor) -> FileInfo {
        FileInfo {
            id,
            block,
            descriptor,
            hash: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.id != 0
    }
}

impl Wire for FileInfo {
    fn encode<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_signature()?;
        w.write_u64(self.id)?;
        w.write_u64(self.block)?;
        self.descriptor.encode_fields(w)?;
        w.write_bytes(self.hash.as_deref())
    }

    fn decode<R: Read>(r: &mut WireReader<R>) -> Result<Option<FileInfo>> {
        if !r.read_signature()? {
            return Ok(None);
        }
        let id = r.read_u64()?;
        let block = r.read_u64()?;
        let descriptor = FileDescriptor::decode_fields(r)?;
        let hash = r.read_bytes()?;
        Ok(Some(FileInfo {
            id,
            block,
            descriptor,
            hash,
        }))
    }
}

/// The directory of one backup set. Insertion order is wire order is
/// tape order.
#[derive(Debug, Clone, PartialEq)]
pub struct SetToc {
    files: Vec<FileInfo>,
    pub description: String,
    pub created: Ticks,
    pub last_saved: Ticks,
    /// Whether files inside this set are separated by filemarks.
    pub filemarks_mode: bool,
    /// Block size the drive used while this set was written.
    pub block_size: u32,
    pub hash_kind: HashKind,
    incremental: bool,
    pub volume: u32,
    pub continued_from_previous: bool,
}

impl SetToc {
    pub fn new(description: &str) -> SetToc {
        SetToc {
            files: Vec::new(),
            description: description.to_string(),
            created: Ticks::now(),
            last_saved: Ticks::now(),
            filemarks_mode: false,
            block_size: 0,
            hash_kind: HashKind::None,
            incremental: false,
            volume: 1,
            continued_from_previous: false,
        }
    }

    /// Clone the set's metadata into a fresh, empty set. Used when a
    /// set spills over onto the next volume.
    pub fn continuation(&self, volume: u32) -> SetToc {
        SetToc {
            files: Vec::new(),
            description: self.description.clone(),
            created: self.created,
            last_saved: Ticks::now(),
            filemarks_mode: self.filemarks_mode,
            block_size: self.block_size,
            hash_kind: self.hash_kind,
            incremental: self.incremental,
            volume,
            continued_from_previous: true,
        }
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// The incremental flag can only be toggled while the set is empty.
    pub fn set_incremental(&mut self, incremental: bool) -> Result<()> {
        if !self.files.is_empty() {
            return Err(TapeError::InvalidState {
                op: "set_incremental",
                state: "set already has files",
            });
        }
        self.incremental = incremental;
        Ok(())
    }

    /// Append a row. The row's digest length must match the set's hash
    /// algorithm.
    pub fn push_file(&mut self, info: FileInfo) -> Result<()> {
        if !info.is_valid() {
            return Err(TapeError::InvalidData("file row with unset id".into()));
        }
        let expected = self.hash_kind.digest_len();
        let actual = info.hash.as_ref().map(|h| h.len()).unwrap_or(0);
        if actual != expected {
            return Err(TapeError::InvalidData(format!(
                "digest length {} does not match algorithm length {}",
                actual, expected
            )));
        }
        self.files.push(info);
        self.last_saved = Ticks::now();
        Ok(())
    }

    /// Case-insensitive lookup by absolute path. Returns the last
    /// (newest) match.
    pub fn find_by_path(&self, path: &str) -> Option<&FileInfo> {
        let needle = path.to_lowercase();
        self.files
            .iter()
            .rev()
            .find(|f| f.descriptor.path.to_lowercase() == needle)
    }
}

impl Wire for SetToc {
    fn encode<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_signature()?;
        w.write_list(&self.files)?;
        w.write_string(&self.description)?;
        w.write_i64(self.created.0)?;
        w.write_bool(self.filemarks_mode)?;
        w.write_u32(self.block_size)?;
        w.write_i64(self.last_saved.0)?;
        w.write_i32(self.hash_kind.code())?;
        w.write_bool(self.incremental)?;
        w.write_u32(self.volume)?;
        w.write_bool(self.continued_from_previous)
    }

    fn decode<R: Read>(r: &mut WireReader<R>) -> Result<Option<SetToc>> {
        if !r.read_signature()? {
            return Ok(None);
        }
        let files = match r.read_list()? {
            Some(files) => files,
            None => return Ok(None),
        };
        let description = r.read_string()?;
        let created = Ticks(r.read_i64()?);
        let filemarks_mode = r.read_bool()?;
        let block_size = r.read_u32()?;
        let last_saved = Ticks(r.read_i64()?);
        let hash_code = r.read_i32()?;
        let hash_kind = HashKind::from_code(hash_code)
            .ok_or_else(|| TapeError::InvalidData(format!("unknown hash code {}", hash_code)))?;
        let incremental = r.read_bool()?;
        let volume = r.read_u32()?;
        let continued_from_previous = r.read_bool()?;
        Ok(Some(SetToc {
            files,
            description,
            created,
            last_saved,
            filemarks_mode,
            block_size,
            hash_kind,
            incremental,
            volume,
            continued_from_previous,
        }))
    }
}

/// Top-level catalog: the ordered list of sets (oldest first) plus the
/// id counter and volume linkage.
#[derive(Debug, Clone, PartialEq)]
pub struct Toc {
    sets: Vec<SetToc>,
    next_id: u64,
    pub description: String,
    pub created: Ticks,
    pub last_saved: Ticks,
    /// Number of the volume this catalog copy was written to.
    pub volume: u32,
    pub continued_on_next: bool,
    /// Write cursor; always a valid index while sets exist. Not part of
    /// the wire form.
    current: usize,
}

impl Toc {
    pub fn new(description: &str) -> Toc {
        Toc {
            sets: Vec::new(),
            next_id: 1,
            description: description.to_string(),
            created: Ticks::now(),
            last_saved: Ticks::now(),
            volume: 1,
            continued_on_next: false,
            current: 0,
        }
    }

    pub fn sets(&self) -> &[SetToc] {
        &self.sets
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Issue a fresh identifier. Strictly greater than anything issued
    /// before by this catalog.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Append a set and move the write cursor onto it. The first set of
    /// a volume chain cannot be incremental.
    pub fn push_set(&mut self, set: SetToc) -> Result<()> {
        if self.sets.is_empty() && set.is_incremental() && !set.continued_from_previous {
            return Err(TapeError::InvalidState {
                op: "push_set",
                state: "first set of a chain cannot be incremental",
            });
        }
        self.sets.push(set);
        self.current = self.sets.len() - 1;
        self.last_saved = Ticks::now();
        Ok(())
    }

    pub fn current_index(&self) -> Option<usize> {
        if self.sets.is_empty() {
            None
        } else {
            Some(self.current)
        }
    }

    pub fn current_set(&self) -> Option<&SetToc> {
        self.sets.get(self.current)
    }

    pub fn current_set_mut(&mut self) -> Option<&mut SetToc> {
        self.sets.get_mut(self.current)
    }

    pub fn select_current(&mut self, index: usize) -> Result<()> {
        if index >= self.sets.len() {
            return Err(TapeError::InvalidData(format!(
                "set index {} out of range 0..{}",
                index,
                self.sets.len()
            )));
        }
        self.current = index;
        Ok(())
    }

    /// Resolve a dual-form set index to an internal position.
    ///
    /// Positive `1..=N` counts oldest to newest; `0` is the latest;
    /// negative `-k` is the k-th before the latest.
    pub fn resolve_index(&self, index: i64) -> Option<usize> {
        let n = self.sets.len() as i64;
        if n == 0 {
            return None;
        }
        let resolved = if index > 0 { index - 1 } else { n - 1 + index };
        if (0..n).contains(&resolved) {
            Some(resolved as usize)
        } else {
            None
        }
    }

    /// Like [`Toc::resolve_index`] but clamps out-of-range requests to
    /// the nearest end.
    pub fn resolve_index_clamped(&self, index: i64) -> Option<usize> {
        let n = self.sets.len() as i64;
        if n == 0 {
            return None;
        }
        let resolved = if index > 0 { index - 1 } else { n - 1 + index };
        Some(resolved.clamp(0, n - 1) as usize)
    }

    /// First set (lowest index) whose volume equals the current set's
    /// volume, contiguous with it.
    pub fn first_set_on_volume(&self) -> Option<usize> {
        let mut idx = self.current_index()?;
        let volume = self.sets[idx].volume;
        while idx > 0 && self.sets[idx - 1].volume == volume {
            idx -= 1;
        }
        Some(idx)
    }

    /// Last set (highest index) whose volume equals the current set's
    /// volume, contiguous with it.
    pub fn last_set_on_volume(&self) -> Option<usize> {
        let mut idx = self.current_index()?;
        let volume = self.sets[idx].volume;
        while idx + 1 < self.sets.len() && self.sets[idx + 1].volume == volume {
            idx += 1;
        }
        Some(idx)
    }
}

impl Wire for Toc {
    fn encode<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_signature()?;
        w.write_u64(self.next_id)?;
        w.write_list(&self.sets)?;
        w.write_string(&self.description)?;
        w.write_i64(self.created.0)?;
        w.write_i64(self.last_saved.0)?;
        w.write_u32(self.volume)?;
        w.write_bool(self.continued_on_next)
    }

    fn decode<R: Read>(r: &mut WireReader<R>) -> Result<Option<Toc>> {
        if !r.read_signature()? {
            return Ok(None);
        }
        let next_id = r.read_u64()?;
        let sets: Vec<SetToc> = match r.read_list()? {
            Some(sets) => sets,
            None => return Ok(None),
        };
        let description = r.read_string()?;
        let created = Ticks(r.read_i64()?);
        let last_saved = Ticks(r.read_i64()?);
        let volume = r.read_u32()?;
        let continued_on_next = r.read_bool()?;
        let current = sets.len().saturating_sub(1);
        Ok(Some(Toc {
            sets,
            next_id,
            description,
            created,
            last_saved,
            volume,
            continued_on_next,
            current,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) fn descriptor(path: &str, length: u64, mtime: i64) -> FileDescriptor {
        FileDescriptor {
            path: path.to_string(),
            length,
            attributes: FileAttributes::ARCHIVE,
            created: Ticks(mtime),
            modified: Ticks(mtime),
            accessed: Ticks(mtime),
        }
    }

    fn roundtrip<T: Wire + PartialEq + std::fmt::Debug>(value: &T) {
        let mut w = WireWriter::new(Vec::new());
        value.encode(&mut w).unwrap();
        let buf = w.into_inner();
        let mut r = WireReader::new(Cursor::new(buf));
        let back = T::decode(&mut r).unwrap().expect("decode yielded absent");
        assert_eq!(&back, value);
    }

    fn sample_toc() -> Toc {
        let mut toc = Toc::new("weekly");
        let mut set = SetToc::new("full");
        set.hash_kind = HashKind::Crc32;
        set.block_size = 1024;
        let mut info = FileInfo::new(toc.allocate_id(), 12, descriptor("/a/b", 5, 100));
        info.hash = Some(vec![1, 2, 3, 4]);
        set.push_file(info).unwrap();
        toc.push_set(set).unwrap();
        toc
    }

    #[test]
    fn ticks_epoch_shim() {
        assert_eq!(Ticks::from_system_time(UNIX_EPOCH).0, UNIX_EPOCH_TICKS);
        let later = UNIX_EPOCH + Duration::from_secs(1);
        assert_eq!(
            Ticks::from_system_time(later).0,
            UNIX_EPOCH_TICKS + 10_000_000
        );
        assert_eq!(Ticks(UNIX_EPOCH_TICKS).to_system_time(), UNIX_EPOCH);
    }

    #[test]
    fn descriptor_round_trip() {
        roundtrip(&descriptor("/x/y/z.txt", 42, 7_000));
    }

    #[test]
    fn file_info_round_trip_with_and_without_hash() {
        let mut info = FileInfo::new(3, 99, descriptor("/f", 1, 0));
        roundtrip(&info);
        info.hash = Some(vec![0xAA; 8]);
        roundtrip(&info);
    }

    #[test]
    fn set_and_toc_round_trip() {
        let toc = sample_toc();
        roundtrip(&toc.sets[0]);
        roundtrip(&toc);
    }

    #[test]
    fn corrupted_signature_decodes_as_absent() {
        let toc = sample_toc();
        let mut w = WireWriter::new(Vec::new());
        toc.encode(&mut w).unwrap();
        let mut buf = w.into_inner();
        buf[0] ^= 0xFF;
        let mut r = WireReader::new(Cursor::new(buf));
        assert!(Toc::decode(&mut r).unwrap().is_none());
    }

    #[test]
    fn uid_allocation_is_monotonic() {
        let mut toc = Toc::new("");
        let a = toc.allocate_id();
        let b = toc.allocate_id();
        assert!(a < b);
        assert!(b < toc.next_id());
        assert_eq!(a, 1);
    }

    #[test]
    fn digest_length_enforced_on_push() {
        let mut set = SetToc::new("");
        set.hash_kind = HashKind::Crc32;
        let mut info = FileInfo::new(1, 0, descriptor("/f", 1, 0));
        assert!(set.push_file(info.clone()).is_err()); // no digest
        info.hash = Some(vec![0; 8]);
        assert!(set.push_file(info.clone()).is_err()); // wrong length
        info.hash = Some(vec![0; 4]);
        assert!(set.push_file(info).is_ok());
    }

    #[test]
    fn incremental_toggle_requires_empty_set() {
        let mut set = SetToc::new("");
        set.set_incremental(true).unwrap();
        set.set_incremental(false).unwrap();
        set.hash_kind = HashKind::None;
        set.push_file(FileInfo::new(1, 0, descriptor("/f", 1, 0)))
            .unwrap();
        assert!(set.set_incremental(true).is_err());
    }

    #[test]
    fn first_set_cannot_be_incremental() {
        let mut toc = Toc::new("");
        let mut set = SetToc::new("");
        set.set_incremental(true).unwrap();
        assert!(toc.push_set(set).is_err());

        // A continuation of an incremental chain is allowed as the
        // first set of a follow-on volume's catalog view.
        let mut base = SetToc::new("");
        base.set_incremental(true).unwrap();
        let cont = base.continuation(2);
        let mut toc2 = Toc::new("");
        assert!(toc2.push_set(cont).is_ok());
    }

    #[test]
    fn dual_indexing() {
        let mut toc = Toc::new("");
        for i in 0..3 {
            toc.push_set(SetToc::new(&format!("s{}", i))).unwrap();
        }
        // Positive: 1..N oldest to newest.
        assert_eq!(toc.resolve_index(1), Some(0));
        assert_eq!(toc.resolve_index(3), Some(2));
        // Zero and negative: newest to oldest.
        assert_eq!(toc.resolve_index(0), Some(2));
        assert_eq!(toc.resolve_index(-1), Some(1));
        assert_eq!(toc.resolve_index(-2), Some(0));
        // Out of range.
        assert_eq!(toc.resolve_index(4), None);
        assert_eq!(toc.resolve_index(-3), None);
        assert_eq!(toc.resolve_index_clamped(9), Some(2));
        assert_eq!(toc.resolve_index_clamped(-9), Some(0));
    }

    #[test]
    fn volume_range_queries() {
        let mut toc = Toc::new("");
        for volume in [1, 1, 2, 2, 2] {
            let mut set = SetToc::new("");
            set.volume = volume;
            toc.push_set(set).unwrap();
        }
        toc.select_current(3).unwrap();
        assert_eq!(toc.first_set_on_volume(), Some(2));
        assert_eq!(toc.last_set_on_volume(), Some(4));
        toc.select_current(0).unwrap();
        assert_eq!(toc.first_set_on_volume(), Some(0));
        assert_eq!(toc.last_set_on_volume(), Some(1));
    }
}
