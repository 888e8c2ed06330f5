use core::fmt;

/// Failure of a single sector transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// sector index is past the end of the device
    SectorOutOfBounds,
    /// buffer is not exactly `BLOCK_SECTOR_SIZE` bytes
    BufferInvalid,
    /// the driver could not read the sector
    ReadError,
    /// the driver could not write the sector
    WriteError,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SectorOutOfBounds => "sector out of bounds",
            Self::BufferInvalid => "buffer is not one sector long",
            Self::ReadError => "block device read failed",
            Self::WriteError => "block device write failed",
        })
    }
}

impl core::error::Error for BlockError {}
