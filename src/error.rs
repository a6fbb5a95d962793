//! Crate-wide error taxonomy.
//!
//! Every layer of the engine reports through [`FsaError`]. The set of kinds
//! is closed: readers and writers map OS errors onto it at the call site so
//! that the drivers can decide fatal-vs-countable without string matching.

use std::io;
use thiserror::Error;

pub type FsaResult<T> = Result<T, FsaError>;

#[derive(Error, Debug)]
pub enum FsaError {
    #[error("unknown error: {0}")]
    Unknown(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// End of file, queue, or buffer. Not a failure for streaming readers.
    #[error("end of file")]
    EndOfFile,
    #[error("wrong type of data: {0}")]
    WrongType(String),
    #[error("resource has been closed: {0}")]
    Closed(String),
    #[error("no space left on device: {0}")]
    NoSpace(String),
    #[error("seek error: {0}")]
    Seek(String),
    #[error("read error: {0}")]
    Read(String),
    #[error("write error: {0}")]
    Write(String),
    #[error("archive is corrupt: {0}")]
    Corrupt(String),
    #[error("wrong volume: {0}")]
    WrongVolume(String),
    #[error("wrong version: {0}")]
    WrongVersion(String),
    #[error("wrong archive: {0}")]
    WrongArchive(String),
    #[error("cannot open file: {0}")]
    Open(String),
    #[error("file already exists: {0}")]
    Exists(String),
    #[error("cannot stat file: {0}")]
    Stat(String),
}

impl FsaError {
    /// True for conditions that must stop the whole read pipeline rather
    /// than being counted against a single object.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FsaError::WrongVolume(_)
                | FsaError::WrongVersion(_)
                | FsaError::WrongArchive(_)
                | FsaError::NoSpace(_)
        )
    }
}

impl From<io::Error> for FsaError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => FsaError::NotFound(e.to_string()),
            io::ErrorKind::AlreadyExists => FsaError::Exists(e.to_string()),
            io::ErrorKind::UnexpectedEof => FsaError::EndOfFile,
            _ if e.raw_os_error() == Some(libc::ENOSPC) => FsaError::NoSpace(e.to_string()),
            _ if e.raw_os_error() == Some(libc::ENOMEM) => FsaError::OutOfMemory(e.to_string()),
            _ => FsaError::Unknown(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds() {
        assert!(FsaError::WrongArchive("x".into()).is_fatal());
        assert!(FsaError::NoSpace("x".into()).is_fatal());
        assert!(!FsaError::Corrupt("x".into()).is_fatal());
        assert!(!FsaError::EndOfFile.is_fatal());
    }

    #[test]
    fn io_error_mapping() {
        let e = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(FsaError::from(e), FsaError::NotFound(_)));
        let e = io::Error::from_raw_os_error(libc::ENOSPC);
        assert!(matches!(FsaError::from(e), FsaError::NoSpace(_)));
    }
}
