//! Restore-side file materialization: streams decompressed blocks into a
//! destination file, punching holes for all-zero regions of sparse files,
//! and accumulates the MD5 of everything written for the footer check.
//!
//! Excluded files run in simulate mode: the data is consumed (and hashed)
//! so the archive stream stays aligned, but nothing touches the disk.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::error::{FsaError, FsaResult};

pub struct DataFile {
    file: Option<File>,
    path: PathBuf,
    sparse: bool,
    /// Hole bytes accumulated but not yet materialized.
    stored_skips: u64,
    hasher: Md5,
}

fn is_all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

impl DataFile {
    /// Open `path` for writing. `simulate` consumes without writing.
    /// Permissions start restrictive; real attributes are applied by the
    /// caller once the content is complete.
    pub fn open_write(path: &Path, simulate: bool, sparse: bool) -> FsaResult<DataFile> {
        let file = if simulate {
            None
        } else {
            Some(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o600)
                    .open(path)
                    .map_err(|e| FsaError::Open(format!("{}: {e}", path.display())))?,
            )
        };
        Ok(DataFile {
            file,
            path: path.to_path_buf(),
            sparse,
            stored_skips: 0,
            hasher: Md5::new(),
        })
    }

    pub fn write(&mut self, data: &[u8]) -> FsaResult<()> {
        self.hasher.update(data);
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => return Ok(()), // simulate mode
        };

        if self.sparse && is_all_zero(data) {
            self.stored_skips += data.len() as u64;
            return Ok(());
        }

        if self.stored_skips > 0 {
            file.seek(SeekFrom::Current(self.stored_skips as i64))
                .map_err(|e| FsaError::Seek(format!("{}: {e}", self.path.display())))?;
            self.stored_skips = 0;
        }
        file.write_all(data).map_err(|e| match e.raw_os_error() {
            Some(code) if code == libc::ENOSPC => {
                FsaError::NoSpace(self.path.display().to_string())
            }
            _ => FsaError::Write(format!("{}: {e}", self.path.display())),
        })?;
        Ok(())
    }

    /// Finish the file (materializing any trailing hole) and return the
    /// MD5 of all bytes passed to [`DataFile::write`].
    pub fn close(mut self) -> FsaResult<[u8; 16]> {
        if let Some(file) = self.file.as_mut() {
            if self.stored_skips > 0 {
                let pos = file
                    .stream_position()
                    .map_err(|e| FsaError::Seek(e.to_string()))?;
                file.set_len(pos + self.stored_skips)
                    .map_err(|e| FsaError::Write(format!("{}: {e}", self.path.display())))?;
            }
        }
        Ok(self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn plain_write_and_md5() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out");
        let mut df = DataFile::open_write(&path, false, false).unwrap();
        df.write(b"hello ").unwrap();
        df.write(b"world").unwrap();
        let md5 = df.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        let expected: [u8; 16] = Md5::digest(b"hello world").into();
        assert_eq!(md5, expected);
    }

    #[test]
    fn sparse_holes_keep_logical_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sparse");
        let mut df = DataFile::open_write(&path, false, true).unwrap();
        df.write(b"head").unwrap();
        df.write(&vec![0u8; 1 << 16]).unwrap();
        df.write(b"tail").unwrap();
        df.write(&vec![0u8; 1 << 16]).unwrap(); // trailing hole
        let md5 = df.close().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 4 + (1 << 16) + 4 + (1 << 16));
        assert_eq!(&data[..4], b"head");
        assert!(data[4..4 + (1 << 16)].iter().all(|&b| b == 0));
        assert_eq!(&data[4 + (1 << 16)..8 + (1 << 16)], b"tail");

        let expected: [u8; 16] = Md5::digest(&data).into();
        assert_eq!(md5, expected);
    }

    #[test]
    fn simulate_mode_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ghost");
        let mut df = DataFile::open_write(&path, true, false).unwrap();
        df.write(b"data").unwrap();
        let md5 = df.close().unwrap();
        assert!(!path.exists());
        let expected: [u8; 16] = Md5::digest(b"data").into();
        assert_eq!(md5, expected);
    }
}
