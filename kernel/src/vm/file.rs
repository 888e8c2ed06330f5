//! The file interface seen by file-backed pages.
//!
//! Reads and writes are positional, so a page can be populated or written
//! back without disturbing the position of the descriptor the process uses
//! for ordinary `read`/`write` calls.

use crate::sync::Mutex;
use alloc::vec::Vec;
use core::{cmp::min, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    /// the underlying filesystem failed the transfer
    Io,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => write!(f, "file i/o error"),
        }
    }
}

impl core::error::Error for FileError {}

/// An open file that pages can be loaded from and written back to.
///
/// The owning process keeps the file open for as long as any page refers to
/// it; pages hold an `Arc` to the same object.
pub trait BackingFile: Send + Sync {
    /// Read from the file into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError>;
    /// Write `buf` into the file starting at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FileError>;
    /// Length of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A file whose contents live in kernel memory.
#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn new(contents: &[u8]) -> Self {
        Self {
            data: Mutex::new(contents.to_vec()),
        }
    }

    /// Copy of the whole file.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FileError> {
        let data = self.data.lock();
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= data.len() {
            return Ok(0);
        }
        let n = min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FileError> {
        let mut data = self.data.lock();
        let offset = usize::try_from(offset).map_err(|_| FileError::Io)?;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
