use crate::sizes::KB;

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// The initial user stack grows down from the top of user space.
pub const USER_STACK_TOP: usize = OFFSET;

/// Rounds `addr` down to the start of the page containing it.
#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

/// Offset of `addr` within its page.
#[inline]
pub const fn pg_ofs(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    pg_ofs(addr) == 0
}

/// Number of pages needed to hold `bytes` bytes.
#[inline]
pub const fn pages_spanned(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_FRAME_SIZE)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}
