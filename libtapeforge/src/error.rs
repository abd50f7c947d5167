//! The engine-wide error type and its classification helpers.
//!
//! Tape kernels report a lot of conditions through error codes that are
//! not actually failures: hitting a filemark mid-read, running into the
//! end-of-media warning zone, finding no data past the last write. The
//! drive layer normalizes those into `(tapemark, eof)` flags; everything
//! that remains an error travels through [`TapeError`].

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TapeError>;

#[derive(Debug, Error)]
pub enum TapeError {
    /// The drive needs more time before it can accept commands.
    #[error("drive is not ready")]
    NotReady,

    /// The bus the drive sits on was reset mid-operation.
    #[error("bus reset occurred")]
    BusReset,

    /// The medium was swapped since the last command.
    #[error("media changed")]
    MediaChanged,

    #[error("no media in drive")]
    NoMedia,

    #[error("media is write protected")]
    WriteProtected,

    /// A filemark was encountered during a read or spacing operation.
    #[error("filemark encountered")]
    Filemark,

    /// A setmark was encountered during a read or spacing operation.
    #[error("setmark encountered")]
    Setmark,

    /// The head moved past the last thing ever written to the partition.
    #[error("no data detected")]
    NoData,

    #[error("beginning of media")]
    BeginningOfMedia,

    /// The medium is (almost) full. The backup agent catches this
    /// variant precisely to drive multi-volume continuation.
    #[error("end of media")]
    EndOfMedia,

    /// The drive or medium cannot do what was asked of it at all.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// An operation was requested in a phase that does not allow it.
    #[error("invalid state for {op}: currently {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// Signature, version, CRC or UID mismatch, or a short read while
    /// decoding an on-tape object.
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Byte streams speak [`io::Error`]; end-of-media crosses that boundary
/// as `WriteZero` so a composed copy pipeline can still be unwound into
/// the multi-volume continuation path (see [`TapeError::from_stream_io`]).
impl From<TapeError> for io::Error {
    fn from(e: TapeError) -> io::Error {
        match e {
            TapeError::EndOfMedia => io::Error::new(io::ErrorKind::WriteZero, "end of media"),
            TapeError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

impl TapeError {
    /// Recover the domain meaning of an error that travelled through an
    /// `io::copy` pipeline over a tape stream.
    pub fn from_stream_io(e: io::Error) -> TapeError {
        if e.kind() == io::ErrorKind::WriteZero {
            TapeError::EndOfMedia
        } else {
            TapeError::Io(e)
        }
    }
}

/// Copyable discriminant of [`TapeError`], used for the drive's
/// last/sticky error bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotReady,
    BusReset,
    MediaChanged,
    NoMedia,
    WriteProtected,
    Filemark,
    Setmark,
    NoData,
    BeginningOfMedia,
    EndOfMedia,
    Unsupported,
    InvalidState,
    InvalidData,
    Io,
}

impl TapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TapeError::NotReady => ErrorKind::NotReady,
            TapeError::BusReset => ErrorKind::BusReset,
            TapeError::MediaChanged => ErrorKind::MediaChanged,
            TapeError::NoMedia => ErrorKind::NoMedia,
            TapeError::WriteProtected => ErrorKind::WriteProtected,
            TapeError::Filemark => ErrorKind::Filemark,
            TapeError::Setmark => ErrorKind::Setmark,
            TapeError::NoData => ErrorKind::NoData,
            TapeError::BeginningOfMedia => ErrorKind::BeginningOfMedia,
            TapeError::EndOfMedia => ErrorKind::EndOfMedia,
            TapeError::Unsupported(_) => ErrorKind::Unsupported,
            TapeError::InvalidState { .. } => ErrorKind::InvalidState,
            TapeError::InvalidData(_) => ErrorKind::InvalidData,
            TapeError::Io(_) => ErrorKind::Io,
        }
    }

    /// Transient conditions are retried by the drive during open and
    /// media load; nothing else retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TapeError::BusReset | TapeError::MediaChanged | TapeError::NotReady
        )
    }

    /// Classify a block I/O outcome into `(tapemark, eof)` flags, or
    /// `None` if the error is a real failure.
    ///
    /// Filemark, setmark and end-of-media raise both flags; no-data and
    /// a clean handle EOF raise only `eof`.
    pub fn tapemark_flags(&self) -> Option<(bool, bool)> {
        match self {
            TapeError::Filemark | TapeError::Setmark | TapeError::EndOfMedia => Some((true, true)),
            TapeError::NoData => Some((false, true)),
            TapeError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => Some((false, true)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_set_is_exactly_the_retry_set() {
        assert!(TapeError::BusReset.is_transient());
        assert!(TapeError::MediaChanged.is_transient());
        assert!(TapeError::NotReady.is_transient());
        assert!(!TapeError::EndOfMedia.is_transient());
        assert!(!TapeError::Filemark.is_transient());
    }

    #[test]
    fn tapemark_classification() {
        assert_eq!(TapeError::Filemark.tapemark_flags(), Some((true, true)));
        assert_eq!(TapeError::Setmark.tapemark_flags(), Some((true, true)));
        assert_eq!(TapeError::EndOfMedia.tapemark_flags(), Some((true, true)));
        assert_eq!(TapeError::NoData.tapemark_flags(), Some((false, true)));
        assert_eq!(TapeError::BusReset.tapemark_flags(), None);
        let eof = TapeError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(eof.tapemark_flags(), Some((false, true)));
    }
}
