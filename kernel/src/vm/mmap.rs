//! Memory-mapped files.
//!
//! A mapping places a whole file at a page-aligned user address, one
//! file-backed page per page of file, loaded lazily by the fault servicer.
//! Unmapping writes every modified page back to the file.

use crate::vm::address_space::{AddressSpace, SpaceState};
use crate::vm::error::{Error, Result};
use crate::vm::file::BackingFile;
use crate::vm::page::{FileSegment, PageDescriptor, PageKind, PageLocation};
use crate::vm::Vm;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cmp::min;
use demandos_shared::mem::{is_page_aligned, pages_spanned, OFFSET, PAGE_FRAME_SIZE};
use log::{debug, warn};

/// Per-process handle for a live mapping, as returned to user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(pub u32);

pub struct Mapping {
    pub id: MapId,
    pub file: Arc<dyn BackingFile>,
    pub addr: usize,
    /// File length at the time of mapping.
    pub length: usize,
}

impl Mapping {
    /// User pages covered by the mapping, with the number of file bytes each
    /// one holds.
    pub fn pages(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..pages_spanned(self.length)).map(move |i| {
            let start = i * PAGE_FRAME_SIZE;
            (self.addr + start, min(self.length - start, PAGE_FRAME_SIZE))
        })
    }

    /// Whether `page` still holds this mapping's part of the file, rather
    /// than something declared over it since.
    pub fn backs(&self, page: &PageDescriptor) -> bool {
        page.location.origin().is_some_and(|segment| {
            Arc::as_ptr(&segment.file) as *const () == Arc::as_ptr(&self.file) as *const ()
                && page.upage.checked_sub(self.addr) == usize::try_from(segment.offset).ok()
        })
    }
}

/// Live mappings of one process, in the order they were created.
#[derive(Default)]
pub struct MappingTable {
    mappings: Vec<Mapping>,
}

impl MappingTable {
    /// One past the newest live id, or 1 when there is none.
    fn next_id(&self) -> MapId {
        MapId(self.mappings.last().map_or(1, |m| m.id.0 + 1))
    }

    pub fn insert(&mut self, file: Arc<dyn BackingFile>, addr: usize, length: usize) -> MapId {
        let id = self.next_id();
        self.mappings.push(Mapping {
            id,
            file,
            addr,
            length,
        });
        id
    }

    pub fn get(&self, id: MapId) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.id == id)
    }

    pub fn remove(&mut self, id: MapId) -> Option<Mapping> {
        let idx = self.mappings.iter().position(|m| m.id == id)?;
        Some(self.mappings.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Mapping> {
        core::mem::take(&mut self.mappings)
    }
}

impl Vm {
    /// Maps all of `file` at `addr` in `space`.
    ///
    /// The whole range is checked against existing pages before anything is
    /// declared, so a failed request leaves the address space untouched.
    pub fn map_file(
        &self,
        space: &AddressSpace,
        file: Arc<dyn BackingFile>,
        addr: usize,
    ) -> Result<MapId> {
        if addr == 0 || !is_page_aligned(addr) {
            return Err(Error::InvalidAddress(addr));
        }
        if file.is_empty() {
            return Err(Error::EmptyFile);
        }
        let length = usize::try_from(file.len()).map_err(|_| Error::InvalidAddress(addr))?;
        let end = pages_spanned(length)
            .checked_mul(PAGE_FRAME_SIZE)
            .and_then(|size| addr.checked_add(size));
        if !end.is_some_and(|end| end <= OFFSET) {
            return Err(Error::InvalidAddress(addr));
        }

        let mut state = space.lock();
        let pages = (0..pages_spanned(length)).map(|i| addr + i * PAGE_FRAME_SIZE);
        if let Some(upage) = pages.clone().find(|&upage| state.spt.contains(upage)) {
            return Err(Error::Overlap(upage));
        }

        for (i, upage) in pages.enumerate() {
            let start = i * PAGE_FRAME_SIZE;
            let segment = FileSegment::new(
                file.clone(),
                start as u64,
                min(length - start, PAGE_FRAME_SIZE),
                true,
            );
            self.declare_locked(space, &mut state, upage, PageKind::FileBacked(segment), true)?;
        }

        let id = state.mappings.insert(file, addr, length);
        debug!(
            "pid {}: mapping {} covers {length} bytes at {addr:#X}",
            space.pid, id.0
        );
        Ok(id)
    }

    /// Removes mapping `id`, writing modified pages back to its file.
    pub fn unmap_file(&self, space: &AddressSpace, id: MapId) -> Result<()> {
        let mut state = space.lock();
        let mapping = state.mappings.remove(id).ok_or(Error::NoSuchMapping(id))?;
        self.unmap_locked(space, &mut state, mapping)
    }

    /// Tears down every page of `mapping`.
    ///
    /// A failed write-back does not stop the teardown; the remaining pages
    /// are still released and the first error is returned.
    pub(crate) fn unmap_locked(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        mapping: Mapping,
    ) -> Result<()> {
        let mut result = Ok(());
        for (upage, len) in mapping.pages() {
            let Some(page) = state.spt.remove(upage) else {
                panic!("pid {}: unmapping untracked page {upage:#X}", space.pid);
            };
            if !mapping.backs(&page) {
                debug!(
                    "pid {}: page {upage:#X} was redeclared, left out of mapping {}",
                    space.pid, mapping.id.0
                );
                state.spt.insert(page);
                continue;
            }
            let offset = (upage - mapping.addr) as u64;
            if let Err(err) = self.write_back(space, page, &*mapping.file, offset, len) {
                warn!(
                    "pid {}: write-back of page {upage:#X} to mapping {} failed: {err}",
                    space.pid, mapping.id.0
                );
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        debug!("pid {}: mapping {} removed", space.pid, mapping.id.0);
        result
    }

    /// Saves `page` to `file` if it was modified and frees whatever backs it.
    fn write_back(
        &self,
        space: &AddressSpace,
        page: PageDescriptor,
        file: &dyn BackingFile,
        offset: u64,
        len: usize,
    ) -> Result<()> {
        match page.location {
            PageLocation::Resident { frame, .. } => {
                let dirty = page.dirty
                    || space.pagedir.is_dirty(page.upage)
                    || self.frames.is_dirty(frame);
                space.pagedir.unmap(page.upage);
                let result = if dirty {
                    let data = self.frames.lock_frame(frame);
                    write_all_at(file, offset, &data[..len])
                } else {
                    Ok(())
                };
                self.frames.release(frame);
                result
            }
            PageLocation::Swapped { slot, .. } if page.dirty => {
                let mut scratch = Box::new([0; PAGE_FRAME_SIZE]);
                if let Err(err) = self.swap.read(slot, &mut scratch) {
                    self.swap.free(slot);
                    return Err(err.into());
                }
                write_all_at(file, offset, &scratch[..len])
            }
            PageLocation::Swapped { slot, .. } => {
                self.swap.free(slot);
                Ok(())
            }
            PageLocation::FileBacked(_) | PageLocation::ZeroFill => Ok(()),
        }
    }
}

fn write_all_at(file: &dyn BackingFile, offset: u64, buf: &[u8]) -> Result<()> {
    if file.write_at(offset, buf)? != buf.len() {
        return Err(Error::Io);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::file::MemFile;

    fn file(len: usize) -> Arc<dyn BackingFile> {
        Arc::new(MemFile::new(&alloc::vec![7; len]))
    }

    #[test]
    fn ids_follow_newest_mapping() {
        let mut table = MappingTable::default();
        assert_eq!(table.insert(file(1), 0x1000, 1), MapId(1));
        assert_eq!(table.insert(file(1), 0x2000, 1), MapId(2));
        assert_eq!(table.insert(file(1), 0x3000, 1), MapId(3));

        assert!(table.remove(MapId(2)).is_some());
        assert_eq!(table.insert(file(1), 0x4000, 1), MapId(4));

        table.remove(MapId(4));
        table.remove(MapId(3));
        assert_eq!(table.insert(file(1), 0x5000, 1), MapId(2));

        table.drain();
        assert!(table.is_empty());
        assert_eq!(table.insert(file(1), 0x6000, 1), MapId(1));
    }

    #[test]
    fn pages_cover_file() {
        let mapping = Mapping {
            id: MapId(1),
            file: file(PAGE_FRAME_SIZE + 10),
            addr: 0x10000,
            length: PAGE_FRAME_SIZE + 10,
        };
        let pages: Vec<_> = mapping.pages().collect();
        assert_eq!(pages, [(0x10000, PAGE_FRAME_SIZE), (0x11000, 10)]);
    }
}
