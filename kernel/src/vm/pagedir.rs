//! The hardware page directory as seen by the VM subsystem.
//!
//! The real x86 directory lives with the process layer; the VM code only
//! needs the handful of per-page operations below. [`SoftPageDirectory`] keeps
//! the same entries in software for hosted builds and tests, and can play the
//! MMU's part by setting accessed/dirty bits on simulated user accesses.

use crate::sync::Mutex;
use crate::vm::frame::FrameNumber;
use alloc::{collections::BTreeMap, sync::Arc};
use demandos_shared::{
    mem::{is_page_aligned, is_user_vaddr},
    paging::{PageTableEntry, VirtualAddress},
};

/// Per-process hardware address space.
///
/// All addresses are user virtual page addresses (page aligned).
pub trait PageDirectory: Send + Sync {
    /// Map `upage` to `frame`. Returns false if `upage` is already mapped or
    /// the entry cannot be created.
    fn map(&self, upage: usize, frame: FrameNumber, writable: bool) -> bool;
    /// Remove the mapping for `upage`, if any. Later accesses fault.
    fn unmap(&self, upage: usize);
    fn translate(&self, upage: usize) -> Option<FrameNumber>;
    fn is_dirty(&self, upage: usize) -> bool;
    fn set_dirty(&self, upage: usize, dirty: bool);
    fn is_accessed(&self, upage: usize) -> bool;
    fn set_accessed(&self, upage: usize, accessed: bool);
}

/// Lets the process layer keep its own handle on a directory it hands over.
impl<T: PageDirectory + ?Sized> PageDirectory for Arc<T> {
    fn map(&self, upage: usize, frame: FrameNumber, writable: bool) -> bool {
        (**self).map(upage, frame, writable)
    }
    fn unmap(&self, upage: usize) {
        (**self).unmap(upage)
    }
    fn translate(&self, upage: usize) -> Option<FrameNumber> {
        (**self).translate(upage)
    }
    fn is_dirty(&self, upage: usize) -> bool {
        (**self).is_dirty(upage)
    }
    fn set_dirty(&self, upage: usize, dirty: bool) {
        (**self).set_dirty(upage, dirty)
    }
    fn is_accessed(&self, upage: usize) -> bool {
        (**self).is_accessed(upage)
    }
    fn set_accessed(&self, upage: usize, accessed: bool) {
        (**self).set_accessed(upage, accessed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Outcome of a simulated user access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResult {
    Hit(FrameNumber),
    /// Not present; the trap handler would call the fault servicer.
    PageFault,
    /// Write to a read-only page.
    ProtectionFault,
}

#[derive(Default)]
pub struct SoftPageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

fn page_number(upage: usize) -> usize {
    VirtualAddress::from_usize(upage).page_number()
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, upage: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(entry) = self.entries.lock().get_mut(&page_number(upage)) {
            *entry = f(*entry);
        }
    }

    fn entry(&self, upage: usize) -> Option<PageTableEntry> {
        self.entries.lock().get(&page_number(upage)).copied()
    }

    /// Number of present mappings.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_writable(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|entry| entry.read_write())
    }

    /// Performs the bookkeeping the MMU does when user code touches `addr`.
    pub fn access(&self, addr: usize, access: Access) -> AccessResult {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&page_number(addr)) else {
            return AccessResult::PageFault;
        };
        if access == Access::Write && !entry.read_write() {
            return AccessResult::ProtectionFault;
        }
        *entry = entry
            .with_accessed(true)
            .with_dirty(entry.dirty() || access == Access::Write);
        AccessResult::Hit(FrameNumber(entry.frame_number()))
    }
}

impl PageDirectory for SoftPageDirectory {
    fn map(&self, upage: usize, frame: FrameNumber, writable: bool) -> bool {
        debug_assert!(is_page_aligned(upage));
        if !is_user_vaddr(upage) {
            return false;
        }
        let Some(entry) = PageTableEntry::user(frame.0, writable) else {
            return false;
        };
        let mut entries = self.entries.lock();
        let key = page_number(upage);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, entry);
        true
    }

    fn unmap(&self, upage: usize) {
        self.entries.lock().remove(&page_number(upage));
    }

    fn translate(&self, upage: usize) -> Option<FrameNumber> {
        self.entry(upage)
            .map(|entry| FrameNumber(entry.frame_number()))
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|entry| entry.dirty())
    }

    fn set_dirty(&self, upage: usize, dirty: bool) {
        self.update(upage, |entry| entry.with_dirty(dirty));
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|entry| entry.accessed())
    }

    fn set_accessed(&self, upage: usize, accessed: bool) {
        self.update(upage, |entry| entry.with_accessed(accessed));
    }
}
