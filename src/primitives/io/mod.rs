#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::Arc,
};

use crate::types::{CountsError, Result};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    /// Reads exact number of bytes at offset using Unix pread semantics.
    pub(super) fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    /// Writes all bytes at offset using Unix pwrite semantics.
    pub(super) fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    /// Reads exact number of bytes at offset using Windows seek_read semantics.
    pub(super) fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    /// Writes all bytes at offset using Windows seek_write semantics.
    pub(super) fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Creates a new StdFileIo from an existing File handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(CountsError::from)?;
        Ok(Self::new(file))
    }

    /// Opens an existing file without write access; never creates it.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                CountsError::NotFound
            } else {
                CountsError::from(err)
            }
        })?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_unix::read_exact(self.file(), off, dst)
    }

    #[cfg(windows)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_win::read_exact(self.file(), off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(self.file(), off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(self.file(), off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(CountsError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src).map_err(CountsError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(CountsError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(CountsError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(CountsError::from)
    }
}
