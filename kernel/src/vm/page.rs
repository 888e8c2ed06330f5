//! Supplemental page table: where every user page of a process lives.

use crate::vm::file::BackingFile;
use crate::vm::frame::FrameNumber;
use crate::vm::swap::SwapSlot;
use alloc::{collections::BTreeMap, sync::Arc};
use core::fmt;
use demandos_shared::mem::PAGE_FRAME_SIZE;

/// The part of a file a page is loaded from.
///
/// `read_bytes` come from `file` at `offset`; the remaining `zero_bytes` of
/// the page are zero.
#[derive(Clone)]
pub struct FileSegment {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}

impl FileSegment {
    pub fn new(file: Arc<dyn BackingFile>, offset: u64, read_bytes: usize, writable: bool) -> Self {
        assert!(read_bytes <= PAGE_FRAME_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - read_bytes,
            writable,
        }
    }
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSegment")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum PageLocation {
    /// In a frame and mapped in the page directory. `origin` is kept so a
    /// clean page can be dropped and reloaded from its file.
    Resident {
        frame: FrameNumber,
        origin: Option<FileSegment>,
    },
    /// Not yet materialized; reads as zeros.
    ZeroFill,
    /// Not yet materialized (or evicted clean); contents are in the file.
    FileBacked(FileSegment),
    /// Evicted to swap.
    Swapped {
        slot: SwapSlot,
        origin: Option<FileSegment>,
    },
}

impl PageLocation {
    pub fn frame(&self) -> Option<FrameNumber> {
        match self {
            Self::Resident { frame, .. } => Some(*frame),
            _ => None,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, Self::Resident { .. })
    }

    /// The file segment this page was loaded from, if any.
    pub fn origin(&self) -> Option<&FileSegment> {
        match self {
            Self::Resident { origin, .. } | Self::Swapped { origin, .. } => origin.as_ref(),
            Self::FileBacked(segment) => Some(segment),
            Self::ZeroFill => None,
        }
    }
}

/// Everything the kernel knows about one user page.
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    pub upage: usize,
    pub location: PageLocation,
    /// Sticky: once set, the page's contents differ from its file origin and
    /// must never be silently reloaded from it.
    pub dirty: bool,
    pub writable: bool,
}

/// What to declare a page as.
pub enum PageKind {
    ZeroFill,
    FileBacked(FileSegment),
    /// Already in a frame the caller allocated and pinned.
    Frame(FrameNumber),
}

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<usize, PageDescriptor>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `page`, returning the descriptor it replaced.
    pub fn insert(&mut self, page: PageDescriptor) -> Option<PageDescriptor> {
        self.pages.insert(page.upage, page)
    }

    pub fn get(&self, upage: usize) -> Option<&PageDescriptor> {
        self.pages.get(&upage)
    }

    pub fn get_mut(&mut self, upage: usize) -> Option<&mut PageDescriptor> {
        self.pages.get_mut(&upage)
    }

    pub fn contains(&self, upage: usize) -> bool {
        self.pages.contains_key(&upage)
    }

    pub fn remove(&mut self, upage: usize) -> Option<PageDescriptor> {
        self.pages.remove(&upage)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.pages.values()
    }

    /// Empties the table, yielding every descriptor.
    pub fn drain(&mut self) -> impl Iterator<Item = PageDescriptor> {
        core::mem::take(&mut self.pages).into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::file::MemFile;

    fn zero_page(upage: usize) -> PageDescriptor {
        PageDescriptor {
            upage,
            location: PageLocation::ZeroFill,
            dirty: false,
            writable: true,
        }
    }

    #[test]
    fn one_descriptor_per_page() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.insert(zero_page(0x1000)).is_none());
        let old = spt.insert(PageDescriptor {
            writable: false,
            ..zero_page(0x1000)
        });
        assert!(old.is_some_and(|page| page.writable));
        assert_eq!(spt.len(), 1);
        assert!(!spt.get(0x1000).unwrap().writable);
    }

    #[test]
    fn segment_zero_bytes_fill_page() {
        let file: Arc<dyn BackingFile> = Arc::new(MemFile::new(b"0123456789"));
        let segment = FileSegment::new(file, 0, 10, false);
        assert_eq!(segment.zero_bytes, PAGE_FRAME_SIZE - 10);

        let location = PageLocation::FileBacked(segment);
        assert!(!location.is_resident());
        assert_eq!(location.origin().map(|s| s.read_bytes), Some(10));
        assert!(PageLocation::ZeroFill.origin().is_none());
    }

    #[test]
    fn drain_empties_table() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(zero_page(0x1000));
        spt.insert(zero_page(0x3000));
        let drained: alloc::vec::Vec<_> = spt.drain().map(|page| page.upage).collect();
        assert_eq!(drained, [0x1000, 0x3000]);
        assert!(spt.is_empty());
    }
}
