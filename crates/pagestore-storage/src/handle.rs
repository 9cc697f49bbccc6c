//! Positional file access for sub-stream backing files
//!
//! Windows are written at arbitrary byte offsets and several holders may
//! share one handle, so all I/O goes through `pread`/`pwrite` style calls
//! that never touch the shared file cursor.

use pagestore_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Open handle to one backing file
#[derive(Debug)]
pub struct BackingFile {
    file: File,
    path: PathBuf,
}

impl BackingFile {
    /// Open a backing file for reading and writing.
    ///
    /// Returns `Ok(None)` when the file does not exist and `create` is false.
    pub fn open(path: impl AsRef<Path>, create: bool) -> Result<Option<Self>> {
        let path = path.as_ref();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if create {
            options.create(true);
        }

        match options.open(path) {
            Ok(file) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !create => Ok(None),
            Err(e) => Err(Error::Storage(format!(
                "failed to open {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `buf.len()` bytes starting at `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset).map_err(|e| {
            Error::Storage(format!(
                "read of {} bytes at {} failed on {}: {}",
                buf.len(),
                offset,
                self.path.display(),
                e
            ))
        })
    }

    /// Write all of `buf` starting at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset).map_err(|e| {
            Error::Storage(format!(
                "write of {} bytes at {} failed on {}: {}",
                buf.len(),
                offset,
                self.path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempdir().unwrap();
        let result = BackingFile::open(dir.path().join("pm-absent"), false).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_write_then_read_at_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");

        let file = BackingFile::open(&path, true).unwrap().unwrap();
        file.write_at(0, b"first").unwrap();
        file.write_at(5, b"second").unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 11);

        let mut buf = [0u8; 6];
        file.read_at(5, &mut buf).unwrap();
        assert_eq!(&buf, b"second");
    }

    #[test]
    fn test_short_read_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pm-main");

        let file = BackingFile::open(&path, true).unwrap().unwrap();
        file.write_at(0, b"abc").unwrap();

        let mut buf = [0u8; 10];
        assert!(file.read_at(0, &mut buf).is_err());
    }
}
