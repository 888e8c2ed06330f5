use crate::sync::{Mutex, MutexGuard};
use crate::vm::mmap::MappingTable;
use crate::vm::page::SupplementalPageTable;
use crate::vm::pagedir::PageDirectory;
use alloc::boxed::Box;

pub type Pid = u16;

/// The parts of a process's VM state that change together.
#[derive(Default)]
pub struct SpaceState {
    pub spt: SupplementalPageTable,
    pub mappings: MappingTable,
}

/// A process as seen by the VM subsystem.
pub struct AddressSpace {
    pub pid: Pid,
    pub pagedir: Box<dyn PageDirectory>,
    state: Mutex<SpaceState>,
}

impl AddressSpace {
    pub fn new(pid: Pid, pagedir: Box<dyn PageDirectory>) -> Self {
        Self {
            pid,
            pagedir,
            state: Mutex::new(SpaceState::default()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SpaceState> {
        self.state.lock()
    }

    /// Used by the evictor, which must never wait on another process.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, SpaceState>> {
        self.state.try_lock()
    }
}
