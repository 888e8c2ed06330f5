use crate::mem::PAGE_FRAME_SIZE;

pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

/// Size of one block-device sector in bytes.
pub const SECTOR_SIZE: u32 = 512;

/// Number of sectors that make up one page-sized swap slot.
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

/// Frames handed to user pages unless the kernel is configured otherwise.
pub const DEFAULT_USER_FRAMES: usize = 4 * MB / PAGE_FRAME_SIZE;
