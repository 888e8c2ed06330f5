//! Demand-paged virtual memory for user processes.
//!
//! User pages are declared up front (program segments, the initial stack,
//! memory-mapped files) and materialized by [`Vm::service_page_fault`] on
//! first touch. When the user frame pool runs dry, the clock picks a victim
//! whose contents go to swap or, if unmodified, back to their file.

pub mod address_space;
pub mod error;
pub mod fault;
pub mod file;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod swap;


use crate::block::block_core::Block;
use crate::sync::Mutex;
use address_space::{AddressSpace, Pid, SpaceState};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::cmp::min;
use demandos_shared::{
    mem::{is_page_aligned, is_user_vaddr, pages_spanned, OFFSET, PAGE_FRAME_SIZE, USER_STACK_TOP},
    sizes::DEFAULT_USER_FRAMES,
};
use file::BackingFile;
use frame::{FrameNumber, FrameTable};
use log::{debug, info, warn};
use once_cell::race::OnceBox;
use page::{FileSegment, PageDescriptor, PageKind, PageLocation};
use pagedir::PageDirectory;
use swap::SwapSpace;

pub use error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Frames in the user pool.
    pub user_frames: usize,
    /// Top of every process's initial stack.
    pub stack_top: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: DEFAULT_USER_FRAMES,
            stack_top: USER_STACK_TOP,
        }
    }
}

pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapSpace,
    /// Resolves a frame's owner pid during eviction.
    spaces: Mutex<BTreeMap<Pid, Arc<AddressSpace>>>,
}

static VM: OnceBox<Vm> = OnceBox::new();

/// Installs the kernel-wide VM. May only be called once.
pub fn init(vm: Vm) {
    if VM.set(Box::new(vm)).is_err() {
        panic!("VM initialized twice");
    }
}

pub fn unwrap_vm() -> &'static Vm {
    VM.get().expect("VM not initialized.")
}

impl Vm {
    pub fn new(config: VmConfig, swap_device: Block) -> Self {
        assert!(
            config.stack_top > 0 && is_page_aligned(config.stack_top) && is_user_vaddr(config.stack_top - 1),
            "stack top {:#X} is not a user page boundary",
            config.stack_top
        );
        info!(
            "vm: {} user frames, stack top {:#X}",
            config.user_frames, config.stack_top
        );
        Self {
            config,
            frames: FrameTable::new(config.user_frames),
            swap: SwapSpace::new(swap_device),
            spaces: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn space(&self, pid: Pid) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().get(&pid).cloned()
    }

    /// Called at process start.
    pub fn create_address_space_vm_state(
        &self,
        pid: Pid,
        pagedir: Box<dyn PageDirectory>,
    ) -> Result<Arc<AddressSpace>> {
        let mut spaces = self.spaces.lock();
        if spaces.contains_key(&pid) {
            return Err(Error::AlreadyRegistered(pid));
        }
        let space = Arc::new(AddressSpace::new(pid, pagedir));
        spaces.insert(pid, space.clone());
        debug!("pid {pid}: address space created");
        Ok(space)
    }

    /// Called at process exit, after the process's page directory has been
    /// switched away from. Unmaps every file mapping (writing back modified
    /// pages) and then frees every frame and swap slot the process holds.
    pub fn destroy_address_space_vm_state(&self, space: &AddressSpace) {
        // Deregister first so evictors stop picking this process's frames.
        self.spaces.lock().remove(&space.pid);

        let mut state = space.lock();
        let mappings = state.mappings.drain();
        for mapping in mappings {
            let id = mapping.id;
            if let Err(err) = self.unmap_locked(space, &mut state, mapping) {
                warn!("pid {}: mapping {} lost data at exit: {err}", space.pid, id.0);
            }
        }
        for page in state.spt.drain() {
            self.release_page(space, page);
        }
        debug!("pid {}: address space destroyed", space.pid);
    }

    /// Gets a pinned frame for `upage` of `space`, zeroed if asked.
    pub fn acquire_frame(&self, space: &AddressSpace, upage: usize, zero: bool) -> Result<FrameNumber> {
        let mut state = space.lock();
        let frame = self.acquire_locked(space, &mut state, upage)?;
        if zero {
            self.frames.zero(frame);
        }
        Ok(frame)
    }

    /// Declares page `upage` of `space` as `kind`, replacing whatever was
    /// there.
    ///
    /// A [`PageKind::Frame`] must be pinned and already hold the page's
    /// contents; it is mapped right away and unpinned. On failure it is
    /// released. A [`PageKind::FileBacked`] page takes its write permission
    /// from the segment and ignores `writable`.
    pub fn declare(&self, space: &AddressSpace, upage: usize, kind: PageKind, writable: bool) -> Result<()> {
        let mut state = space.lock();
        self.declare_locked(space, &mut state, upage, kind, writable)
    }

    pub(crate) fn declare_locked(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        upage: usize,
        kind: PageKind,
        writable: bool,
    ) -> Result<()> {
        if !is_page_aligned(upage) || !is_user_vaddr(upage) {
            if let PageKind::Frame(frame) = kind {
                self.discard_frame(frame);
            }
            return Err(Error::InvalidAddress(upage));
        }

        let writable = match &kind {
            PageKind::FileBacked(segment) => segment.writable,
            PageKind::ZeroFill | PageKind::Frame(_) => writable,
        };
        space.pagedir.unmap(upage);
        let (location, frame) = match kind {
            PageKind::ZeroFill => (PageLocation::ZeroFill, None),
            PageKind::FileBacked(segment) => (PageLocation::FileBacked(segment), None),
            PageKind::Frame(frame) => (PageLocation::Resident { frame, origin: None }, Some(frame)),
        };
        let replaced = state.spt.insert(PageDescriptor {
            upage,
            location,
            dirty: false,
            writable,
        });
        if let Some(old) = replaced {
            debug!("pid {}: page {upage:#X} redeclared", space.pid);
            self.release_page(space, old);
        }

        if let Some(frame) = frame {
            if !space.pagedir.map(upage, frame, writable) {
                state.spt.remove(upage);
                self.discard_frame(frame);
                return Err(Error::MapFailed(upage));
            }
            self.frames.unpin(frame);
        }
        Ok(())
    }

    /// Frees whatever backs a page that is leaving its table.
    fn release_page(&self, space: &AddressSpace, page: PageDescriptor) {
        space.pagedir.unmap(page.upage);
        match page.location {
            PageLocation::Resident { frame, .. } => self.frames.release(frame),
            PageLocation::Swapped { slot, .. } => self.swap.free(slot),
            PageLocation::ZeroFill | PageLocation::FileBacked(_) => {}
        }
    }

    /// Declares a loadable program segment starting at `upage`.
    ///
    /// `read_bytes` come from `file` at `offset`, followed by `zero_bytes`
    /// of zeros; together they must fill whole pages.
    #[allow(clippy::too_many_arguments)]
    pub fn register_segment(
        &self,
        space: &AddressSpace,
        upage: usize,
        file: Arc<dyn BackingFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        let Some(total) = read_bytes.checked_add(zero_bytes) else {
            return Err(Error::InvalidAddress(upage));
        };
        if !is_page_aligned(upage) || offset % PAGE_FRAME_SIZE as u64 != 0 || !is_page_aligned(total) {
            return Err(Error::InvalidAddress(upage));
        }
        if !upage.checked_add(total).is_some_and(|end| end <= OFFSET) {
            return Err(Error::InvalidAddress(upage));
        }

        let mut state = space.lock();
        for i in 0..pages_spanned(total) {
            let start = i * PAGE_FRAME_SIZE;
            let page_read = min(read_bytes.saturating_sub(start), PAGE_FRAME_SIZE);
            let kind = if page_read == 0 {
                PageKind::ZeroFill
            } else {
                PageKind::FileBacked(FileSegment::new(
                    file.clone(),
                    offset + start as u64,
                    page_read,
                    writable,
                ))
            };
            self.declare_locked(space, &mut state, upage + start, kind, writable)?;
        }
        debug!(
            "pid {}: segment at {upage:#X}, {read_bytes} file bytes, {zero_bytes} zero bytes",
            space.pid
        );
        Ok(())
    }

    /// Installs a zeroed, writable page just below the stack top and returns
    /// the initial stack pointer.
    pub fn register_stack_page(&self, space: &AddressSpace) -> Result<usize> {
        let stack_top = self.config.stack_top;
        let upage = stack_top - PAGE_FRAME_SIZE;
        let mut state = space.lock();
        let frame = self.acquire_locked(space, &mut state, upage)?;
        self.frames.zero(frame);
        self.declare_locked(space, &mut state, upage, PageKind::Frame(frame), true)?;
        Ok(stack_top)
    }
}
