//! Little-endian, signature-tagged, versioned binary codec.
//!
//! Every self-describing object on tape opens with the two-byte
//! signature `"TF"` followed by a 16-bit format version. The decoder is
//! strict: a signature or version mismatch yields `Ok(None)` ("absent"),
//! a short read is a format error.
//!
//! Integers are little-endian on the wire. Strings are UTF-8 with a
//! signed 32-bit byte-length prefix. Byte sequences use the same prefix
//! with a negative length denoting a null sequence. Timestamps travel as
//! 64-bit tick counts (see [`crate::catalog::Ticks`]).

use std::io::{self, Read, Write};

use crate::error::{Result, TapeError};

pub const SIGNATURE: [u8; 2] = [0x54, 0x46]; // "TF"
pub const WIRE_VERSION: u16 = 0x0100;

/// Objects that serialize themselves with a leading signature.
pub trait Wire: Sized {
    fn encode<W: Write>(&self, w: &mut WireWriter<W>) -> Result<()>;

    /// Decode one object. Returns `Ok(None)` when the bytes at the
    /// current position do not carry this codec's signature/version.
    fn decode<R: Read>(r: &mut WireReader<R>) -> Result<Option<Self>>;
}

pub struct WireWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> WireWriter<W> {
        WireWriter { inner, written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub fn write_signature(&mut self) -> Result<()> {
        self.put(&SIGNATURE)?;
        self.write_u16(WIRE_VERSION)
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put(&[v])
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_i32(s.len() as i32)?;
        self.put(s.as_bytes())
    }

    /// Length-prefixed byte sequence; `None` travels as length -1.
    pub fn write_bytes(&mut self, b: Option<&[u8]>) -> Result<()> {
        match b {
            Some(b) => {
                self.write_i32(b.len() as i32)?;
                self.put(b)
            }
            None => self.write_i32(-1),
        }
    }

    pub fn write_list<T: Wire>(&mut self, items: &[T]) -> Result<()> {
        self.write_i32(items.len() as i32)?;
        for item in items {
            item.encode(self)?;
        }
        Ok(())
    }
}

pub struct WireReader<R: Read> {
    inner: R,
    consumed: u64,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> WireReader<R> {
        WireReader { inner, consumed: 0 }
    }

    /// Bytes consumed so far. The catalog agents use this to locate the
    /// integrity trailer that follows a decoded object.
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn take(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    TapeError::InvalidData("short read while decoding".into())
                }
                _ => TapeError::Io(e),
            })?;
        self.consumed += buf.len() as u64;
        Ok(())
    }

    /// Consume a signature+version pair. `Ok(false)` means the bytes do
    /// not start a well-formed object of this codec.
    pub fn read_signature(&mut self) -> Result<bool> {
        let mut sig = [0u8; 2];
        self.take(&mut sig)?;
        let version = self.read_u16()?;
        Ok(sig == SIGNATURE && version == WIRE_VERSION)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.take(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.take(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.take(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.take(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.take(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.take(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(TapeError::InvalidData(format!(
                "negative string length {}",
                len
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.take(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| TapeError::InvalidData(format!("string is not UTF-8: {}", e)))
    }

    pub fn read_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; len as usize];
        self.take(&mut buf)?;
        Ok(Some(buf))
    }

    /// Decode a counted list. Any element with a bad signature poisons
    /// the whole list.
    pub fn read_list<T: Wire>(&mut self) -> Result<Option<Vec<T>>> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(TapeError::InvalidData(format!(
                "negative list count {}",
                count
            )));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match T::decode(self)? {
                Some(item) => items.push(item),
                None => return Ok(None),
            }
        }
        Ok(Some(items))
    }
}
