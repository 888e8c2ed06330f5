//! The user frame table.
//!
//! Every physical frame in the user pool has a core map entry recording
//! whether it is allocated, pinned, and dirty through its kernel alias, plus
//! the `(process, virtual page)` it currently backs. Free frames are handed
//! out next-fit; when none are left, [`FrameTable::select_victim`] runs the
//! clock (second chance) sweep over the same entries.

use crate::sync::{Mutex, MutexGuard};
use crate::vm::address_space::Pid;
use alloc::{boxed::Box, vec, vec::Vec};
use bitbybit::bitfield;
use demandos_shared::mem::PAGE_FRAME_SIZE;
use log::trace;

/// One page worth of physical memory.
pub type PageBuf = [u8; PAGE_FRAME_SIZE];

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    pinned: bool,
    /// Set when the kernel writes the frame through its own mapping.
    #[bit(2, rw)]
    dirty: bool,
}

/// Index of a frame in the user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub usize);

/// Which page a frame currently backs. This is a lookup key into the owner's
/// tables, not a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    pub pid: Pid,
    pub upage: usize,
}

/// Verdict of the eviction callback on one candidate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Leave the frame alone this time around.
    Skip,
    /// Recently used; its accessed bit has been cleared.
    SecondChance,
    /// Take this frame.
    Evict,
}

struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    owners: Box<[Option<FrameOwner>]>,
    /// The next frame number to start searching for free frames.
    position: usize,
    /// Clock hand for eviction; persists across sweeps.
    hand: usize,
    frames_allocated: usize,
}

impl CoreMap {
    fn entry(&self, frame: FrameNumber) -> CoreMapEntry {
        let Some(entry) = self.entries.get(frame.0) else {
            panic!("frame {} outside the user pool", frame.0);
        };
        *entry
    }

    fn set(&mut self, frame: FrameNumber, entry: CoreMapEntry) {
        self.entries[frame.0] = entry;
    }

    fn next_free(&mut self) -> Option<usize> {
        let total = self.entries.len();
        let found = (0..total)
            .map(|i| (self.position + i) % total)
            .find(|&i| !self.entries[i].allocated())?;
        self.position = (found + 1) % total;
        Some(found)
    }
}

pub struct FrameTable {
    core_map: Mutex<CoreMap>,
    memory: Box<[Mutex<PageBuf>]>,
}

impl FrameTable {
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "frame table needs at least one frame");
        let memory: Vec<Mutex<PageBuf>> = (0..frames)
            .map(|_| Mutex::new([0; PAGE_FRAME_SIZE]))
            .collect();
        Self {
            core_map: Mutex::new(CoreMap {
                entries: vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
                owners: vec![None; frames].into_boxed_slice(),
                position: 0,
                hand: 0,
                frames_allocated: 0,
            }),
            memory: memory.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn allocated_frames(&self) -> usize {
        self.core_map.lock().frames_allocated
    }

    pub fn pinned_frames(&self) -> usize {
        let core_map = self.core_map.lock();
        core_map.entries.iter().filter(|e| e.pinned()).count()
    }

    /// Takes a free frame for `owner`, returning it pinned.
    ///
    /// Returns `None` when every frame is allocated; the caller then has to
    /// evict.
    pub fn alloc(&self, owner: FrameOwner) -> Option<FrameNumber> {
        let mut core_map = self.core_map.lock();
        let idx = core_map.next_free()?;
        core_map.entries[idx] = CoreMapEntry::DEFAULT
            .with_allocated(true)
            .with_pinned(true);
        core_map.owners[idx] = Some(owner);
        core_map.frames_allocated += 1;
        trace!("frame {idx} allocated to pid {} page {:#X}", owner.pid, owner.upage);
        Some(FrameNumber(idx))
    }

    /// Runs the clock over allocated, unpinned frames.
    ///
    /// `probe` inspects each candidate (typically its owner's accessed bit)
    /// and decides. The sweep visits at most two full laps: the first clears
    /// every accessed bit it finds, so by the second any candidate that is not
    /// skipped gets taken. The chosen frame is pinned before the table lock is
    /// released, so no other caller can select it too.
    pub fn select_victim(
        &self,
        mut probe: impl FnMut(FrameNumber, FrameOwner) -> Probe,
    ) -> Option<(FrameNumber, FrameOwner)> {
        let mut core_map = self.core_map.lock();
        let total = core_map.entries.len();

        for _ in 0..2 * total {
            let idx = core_map.hand;
            core_map.hand = (idx + 1) % total;

            let entry = core_map.entries[idx];
            if !entry.allocated() || entry.pinned() {
                continue;
            }
            let Some(owner) = core_map.owners[idx] else {
                panic!("allocated frame {idx} has no owner");
            };
            let frame = FrameNumber(idx);
            match probe(frame, owner) {
                Probe::Skip | Probe::SecondChance => continue,
                Probe::Evict => {
                    core_map.entries[idx] = entry.with_pinned(true);
                    return Some((frame, owner));
                }
            }
        }

        None
    }

    /// Hands a pinned frame over to a new owner after its old page was
    /// evicted.
    pub fn reassign(&self, frame: FrameNumber, owner: FrameOwner) {
        let mut core_map = self.core_map.lock();
        let entry = core_map.entry(frame);
        assert!(
            entry.allocated() && entry.pinned(),
            "reassigning frame {} that is not held by an evictor",
            frame.0
        );
        core_map.set(frame, entry.with_dirty(false));
        core_map.owners[frame.0] = Some(owner);
    }

    pub fn pin(&self, frame: FrameNumber) {
        let mut core_map = self.core_map.lock();
        let entry = core_map.entry(frame);
        assert!(entry.allocated(), "pinning free frame {}", frame.0);
        assert!(!entry.pinned(), "frame {} is already pinned", frame.0);
        core_map.set(frame, entry.with_pinned(true));
    }

    pub fn unpin(&self, frame: FrameNumber) {
        let mut core_map = self.core_map.lock();
        let entry = core_map.entry(frame);
        assert!(entry.pinned(), "unpinning frame {} that is not pinned", frame.0);
        core_map.set(frame, entry.with_pinned(false));
    }

    pub fn is_pinned(&self, frame: FrameNumber) -> bool {
        self.core_map.lock().entry(frame).pinned()
    }

    /// Returns a frame to the free pool. The frame must be allocated and
    /// unpinned.
    pub fn release(&self, frame: FrameNumber) {
        let mut core_map = self.core_map.lock();
        let entry = core_map.entry(frame);
        assert!(entry.allocated(), "releasing free frame {}", frame.0);
        assert!(!entry.pinned(), "releasing pinned frame {}", frame.0);
        core_map.set(frame, CoreMapEntry::DEFAULT);
        core_map.owners[frame.0] = None;
        core_map.frames_allocated -= 1;
        trace!("frame {} released", frame.0);
    }

    pub fn owner(&self, frame: FrameNumber) -> Option<FrameOwner> {
        self.core_map.lock().owners.get(frame.0).copied().flatten()
    }

    /// Dirty bit of the frame's kernel alias.
    pub fn is_dirty(&self, frame: FrameNumber) -> bool {
        self.core_map.lock().entry(frame).dirty()
    }

    pub fn set_dirty(&self, frame: FrameNumber, dirty: bool) {
        let mut core_map = self.core_map.lock();
        let entry = core_map.entry(frame);
        core_map.set(frame, entry.with_dirty(dirty));
    }

    /// Direct access to a frame's memory. Does not touch the dirty bit.
    pub(crate) fn lock_frame(&self, frame: FrameNumber) -> MutexGuard<'_, PageBuf> {
        self.memory[frame.0].lock()
    }

    pub fn zero(&self, frame: FrameNumber) {
        self.lock_frame(frame).fill(0);
    }

    /// Copies the frame's memory starting at `offset` into `buf`.
    pub fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]) {
        let data = self.lock_frame(frame);
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Writes into the frame through the kernel's mapping of it, which marks
    /// the frame dirty.
    pub fn write(&self, frame: FrameNumber, offset: usize, bytes: &[u8]) {
        self.lock_frame(frame)[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.set_dirty(frame, true);
    }
}
