//! File-level integrity hashing.
//!
//! Hashes here protect against bit rot and misaligned reads, not against
//! an adversary. The algorithm travels with the backup set; the catalog
//! itself is always protected with CRC-64 regardless of the set's
//! choice.

use std::io::{self, Read, Write};

use crc::{Crc, CRC_32_ISO_HDLC, CRC_64_ECMA_182};
use xxhash_rust::xxh3::Xxh3;
use xxhash_rust::xxh32::Xxh32;
use xxhash_rust::xxh64::Xxh64;

// Statics, not consts: the streaming digests borrow the tables for
// their whole lifetime.
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
pub static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// On-wire hash algorithm codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HashKind {
    None,
    Crc32,
    Crc64,
    XxHash32,
    XxHash3,
    XxHash64,
    XxHash128,
}

impl HashKind {
    pub fn code(self) -> i32 {
        match self {
            HashKind::None => 0,
            HashKind::Crc32 => 1,
            HashKind::Crc64 => 2,
            HashKind::XxHash32 => 3,
            HashKind::XxHash3 => 4,
            HashKind::XxHash64 => 5,
            HashKind::XxHash128 => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<HashKind> {
        Some(match code {
            0 => HashKind::None,
            1 => HashKind::Crc32,
            2 => HashKind::Crc64,
            3 => HashKind::XxHash32,
            4 => HashKind::XxHash3,
            5 => HashKind::XxHash64,
            6 => HashKind::XxHash128,
            _ => return None,
        })
    }

    /// Digest length in bytes; the catalog invariant ties every stored
    /// hash to this length.
    pub fn digest_len(self) -> usize {
        match self {
            HashKind::None => 0,
            HashKind::Crc32 | HashKind::XxHash32 => 4,
            HashKind::Crc64 | HashKind::XxHash3 | HashKind::XxHash64 => 8,
            HashKind::XxHash128 => 16,
        }
    }
}

/// A streaming hasher for any of the supported algorithms.
///
/// Digests are emitted little-endian, matching the rest of the wire.
pub enum TapeHasher {
    None,
    Crc32(crc::Digest<'static, u32>),
    Crc64(crc::Digest<'static, u64>),
    XxHash32(Xxh32),
    XxHash3(Xxh3),
    XxHash64(Xxh64),
    XxHash128(Xxh3),
}

impl TapeHasher {
    pub fn new(kind: HashKind) -> TapeHasher {
        match kind {
            HashKind::None => TapeHasher::None,
            HashKind::Crc32 => TapeHasher::Crc32(CRC32.digest()),
            HashKind::Crc64 => TapeHasher::Crc64(CRC64.digest()),
            HashKind::XxHash32 => TapeHasher::XxHash32(Xxh32::new(0)),
            HashKind::XxHash3 => TapeHasher::XxHash3(Xxh3::new()),
            HashKind::XxHash64 => TapeHasher::XxHash64(Xxh64::new(0)),
            HashKind::XxHash128 => TapeHasher::XxHash128(Xxh3::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            TapeHasher::None => {}
            TapeHasher::Crc32(d) => d.update(bytes),
            TapeHasher::Crc64(d) => d.update(bytes),
            TapeHasher::XxHash32(h) => h.update(bytes),
            TapeHasher::XxHash3(h) => h.update(bytes),
            TapeHasher::XxHash64(h) => h.update(bytes),
            TapeHasher::XxHash128(h) => h.update(bytes),
        }
    }

    /// Consume the hasher and return the digest, or `None` for the null
    /// algorithm.
    pub fn finalize(self) -> Option<Vec<u8>> {
        match self {
            TapeHasher::None => None,
            TapeHasher::Crc32(d) => Some(d.finalize().to_le_bytes().to_vec()),
            TapeHasher::Crc64(d) => Some(d.finalize().to_le_bytes().to_vec()),
            TapeHasher::XxHash32(h) => Some(h.digest().to_le_bytes().to_vec()),
            TapeHasher::XxHash3(h) => Some(h.digest().to_le_bytes().to_vec()),
            TapeHasher::XxHash64(h) => Some(h.digest().to_le_bytes().to_vec()),
            TapeHasher::XxHash128(h) => Some(h.digest128().to_le_bytes().to_vec()),
        }
    }
}

/// Reader adapter that hashes everything it delivers.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: TapeHasher,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, kind: HashKind) -> HashingReader<R> {
        HashingReader {
            inner,
            hasher: TapeHasher::new(kind),
        }
    }

    pub fn finalize(self) -> Option<Vec<u8>> {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Writer adapter that hashes everything it accepts.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: TapeHasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, kind: HashKind) -> HashingWriter<W> {
        HashingWriter {
            inner,
            hasher: TapeHasher::new(kind),
        }
    }

    pub fn finalize(self) -> (W, Option<Vec<u8>>) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(kind: HashKind, bytes: &[u8]) -> Option<Vec<u8>> {
        let mut h = TapeHasher::new(kind);
        h.update(bytes);
        h.finalize()
    }

    #[test]
    fn crc32_known_answers() {
        assert_eq!(
            digest_of(HashKind::Crc32, b"hello"),
            Some(0x3610A686u32.to_le_bytes().to_vec())
        );
        let all_bytes: Vec<u8> = (0u8..=255).collect();
        assert_eq!(
            digest_of(HashKind::Crc32, &all_bytes),
            Some(0x29058C73u32.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn digest_lengths_match_declared() {
        for kind in [
            HashKind::None,
            HashKind::Crc32,
            HashKind::Crc64,
            HashKind::XxHash32,
            HashKind::XxHash3,
            HashKind::XxHash64,
            HashKind::XxHash128,
        ] {
            let digest = digest_of(kind, b"payload");
            assert_eq!(
                digest.map(|d| d.len()).unwrap_or(0),
                kind.digest_len(),
                "{:?}",
                kind
            );
        }
    }

    #[test]
    fn incremental_equals_oneshot() {
        let mut inc = TapeHasher::new(HashKind::XxHash64);
        inc.update(b"abc");
        inc.update(b"def");
        assert_eq!(inc.finalize(), digest_of(HashKind::XxHash64, b"abcdef"));
    }

    #[test]
    fn wire_codes_round_trip() {
        for code in 0..=6 {
            let kind = HashKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(HashKind::from_code(7), None);
        assert_eq!(HashKind::from_code(-1), None);
    }

    #[test]
    fn hashing_reader_sees_delivered_bytes_only() {
        let data = b"0123456789".to_vec();
        let mut rd = HashingReader::new(&data[..], HashKind::Crc32);
        let mut sink = Vec::new();
        std::io::copy(&mut rd, &mut sink).unwrap();
        assert_eq!(rd.finalize(), digest_of(HashKind::Crc32, &data));
    }
}
