use crate::block::block_error::BlockError;
use crate::vm::address_space::Pid;
use crate::vm::file::FileError;
use crate::vm::mmap::MapId;
use core::fmt;

/// Recoverable failures of a single VM request.
///
/// Everything else that can go wrong in this subsystem (swap exhaustion,
/// double frees, untracked pages) is a kernel bug and panics instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// no page descriptor covers the faulting address
    NotPresent(usize),
    /// a swap or file transfer failed
    Io,
    /// the backing file ended before the recorded byte count
    ShortRead,
    /// the page directory refused to install a mapping
    MapFailed(usize),
    /// address is null, unaligned, or reaches into kernel space
    InvalidAddress(usize),
    /// cannot map a zero-length file
    EmptyFile,
    /// the requested range collides with an existing page
    Overlap(usize),
    /// the process has no mapping with this id
    NoSuchMapping(MapId),
    /// an address space is already registered for this process
    AlreadyRegistered(Pid),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPresent(addr) => write!(f, "no page at {addr:#X}"),
            Self::Io => write!(f, "i/o error"),
            Self::ShortRead => write!(f, "backing file shorter than expected"),
            Self::MapFailed(addr) => write!(f, "could not map page at {addr:#X}"),
            Self::InvalidAddress(addr) => write!(f, "invalid address {addr:#X}"),
            Self::EmptyFile => write!(f, "cannot map an empty file"),
            Self::Overlap(addr) => write!(f, "range overlaps existing page at {addr:#X}"),
            Self::NoSuchMapping(id) => write!(f, "no mapping with id {}", id.0),
            Self::AlreadyRegistered(pid) => write!(f, "process {pid} already has an address space"),
        }
    }
}

impl core::error::Error for Error {}

impl From<BlockError> for Error {
    fn from(_: BlockError) -> Self {
        Self::Io
    }
}

impl From<FileError> for Error {
    fn from(_: FileError) -> Self {
        Self::Io
    }
}

pub type Result<T> = core::result::Result<T, Error>;
