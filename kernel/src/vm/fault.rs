//! Page-fault servicing and frame reclamation.
//!
//! Lock order: a process's own state, then the frame table. The evictor may
//! need a *second* process's state while holding the frame table, so it only
//! ever `try_lock`s it and moves on to the next candidate if that fails.

use crate::sync::MutexGuard;
use crate::vm::address_space::{AddressSpace, SpaceState};
use crate::vm::error::{Error, Result};
use crate::vm::frame::{FrameNumber, FrameOwner, Probe};
use crate::vm::page::{PageDescriptor, PageLocation};
use crate::vm::Vm;
use core::hint::spin_loop;
use demandos_shared::mem::{pg_round_down, PAGE_FRAME_SIZE};
use log::{debug, trace};

impl Vm {
    /// Gets a pinned frame for page `upage` of `space`, evicting if the pool
    /// is empty.
    ///
    /// The caller holds `space`'s state lock and passes the state in, so that
    /// the evictor can also take the frame from one of `space`'s own pages.
    pub(crate) fn acquire_locked(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        upage: usize,
    ) -> Result<FrameNumber> {
        let owner = FrameOwner {
            pid: space.pid,
            upage,
        };
        loop {
            if let Some(frame) = self.frames.alloc(owner) {
                return Ok(frame);
            }
            if let Some(frame) = self.evict(space, state, owner)? {
                return Ok(frame);
            }
            // Every candidate is pinned by a fault in flight or belongs to a
            // busy process. Both release their hold once their I/O is done.
            spin_loop();
        }
    }

    /// Picks a victim with the clock and reclaims it for `owner`.
    ///
    /// Returns `Ok(None)` when no frame could be taken this sweep.
    fn evict(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        owner: FrameOwner,
    ) -> Result<Option<FrameNumber>> {
        let spaces = self.spaces.lock().clone();
        let mut held: Option<MutexGuard<'_, SpaceState>> = None;

        let victim = self.frames.select_victim(|_, candidate| {
            let victim_space: &AddressSpace = if candidate.pid == space.pid {
                space
            } else {
                match spaces.get(&candidate.pid) {
                    Some(victim_space) => victim_space,
                    // Owner is being torn down.
                    None => return Probe::Skip,
                }
            };
            if victim_space.pagedir.is_accessed(candidate.upage) {
                victim_space.pagedir.set_accessed(candidate.upage, false);
                return Probe::SecondChance;
            }
            if candidate.pid == space.pid {
                return Probe::Evict;
            }
            match victim_space.try_lock() {
                Some(guard) => {
                    held = Some(guard);
                    Probe::Evict
                }
                None => Probe::Skip,
            }
        });
        let Some((frame, victim)) = victim else {
            return Ok(None);
        };

        let (victim_space, victim_state) = match held.as_mut() {
            Some(guard) => match spaces.get(&victim.pid) {
                Some(victim_space) => (&**victim_space, &mut **guard),
                None => panic!("evicting from unregistered pid {}", victim.pid),
            },
            None => (space, state),
        };
        self.page_out(victim_space, victim_state, frame, victim.upage)?;
        self.frames.reassign(frame, owner);
        debug!(
            "evicted pid {} page {:#X} from frame {} for pid {} page {:#X}",
            victim.pid, victim.upage, frame.0, owner.pid, owner.upage
        );
        Ok(Some(frame))
    }

    /// Moves the contents of pinned `frame` out of page `upage`.
    ///
    /// Modified pages, and pages with no file to reload from, go to swap;
    /// clean file pages simply revert to their file. If the swap write fails
    /// the page is mapped again and the frame unpinned.
    fn page_out(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        frame: FrameNumber,
        upage: usize,
    ) -> Result<()> {
        let Some(page) = state.spt.get_mut(upage) else {
            panic!("pid {}: frame {} backs untracked page {upage:#X}", space.pid, frame.0);
        };
        let origin = match &page.location {
            PageLocation::Resident { frame: resident, origin } if *resident == frame => {
                origin.clone()
            }
            location => panic!(
                "pid {}: frame {} owns page {upage:#X} but it is {location:?}",
                space.pid, frame.0
            ),
        };

        let dirty = page.dirty || space.pagedir.is_dirty(upage) || self.frames.is_dirty(frame);
        space.pagedir.unmap(upage);

        match origin {
            Some(segment) if !dirty => {
                trace!("pid {}: page {upage:#X} dropped back to file", space.pid);
                page.location = PageLocation::FileBacked(segment);
            }
            origin => {
                let stored = self.swap.store(&self.frames.lock_frame(frame));
                match stored {
                    Ok(slot) => {
                        trace!("pid {}: page {upage:#X} to swap slot {}", space.pid, slot.0);
                        page.location = PageLocation::Swapped { slot, origin };
                        page.dirty = dirty;
                    }
                    Err(err) => {
                        if !space.pagedir.map(upage, frame, page.writable) {
                            panic!("pid {}: cannot restore page {upage:#X}", space.pid);
                        }
                        space.pagedir.set_dirty(upage, dirty);
                        self.frames.unpin(frame);
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Makes the page containing `addr` resident.
    ///
    /// Fails with [`Error::NotPresent`] when no page is declared there, which
    /// the trap handler treats as an invalid user access. On any failure the
    /// page keeps its previous location and nothing is left allocated.
    pub fn service_page_fault(&self, space: &AddressSpace, addr: usize) -> Result<()> {
        let upage = pg_round_down(addr);
        let mut state = space.lock();

        let (location, writable) = match state.spt.get(upage) {
            None => return Err(Error::NotPresent(addr)),
            Some(page) if page.location.is_resident() => return Ok(()),
            Some(page) => (page.location.clone(), page.writable),
        };

        let frame = self.acquire_locked(space, &mut state, upage)?;
        if let Err(err) = self.populate(frame, &location) {
            self.discard_frame(frame);
            return Err(err);
        }

        if !space.pagedir.map(upage, frame, writable) {
            if let PageLocation::Swapped { origin, .. } = location {
                // The swap slot was consumed by the read; save the page again.
                let slot = match self.swap.store(&self.frames.lock_frame(frame)) {
                    Ok(slot) => slot,
                    Err(err) => panic!("pid {}: lost swapped page {upage:#X}: {err}", space.pid),
                };
                set_location(&mut state, upage, PageLocation::Swapped { slot, origin });
            }
            self.discard_frame(frame);
            return Err(Error::MapFailed(upage));
        }

        let from_swap = matches!(location, PageLocation::Swapped { .. });
        let origin = location.origin().cloned();
        let page = set_location(&mut state, upage, PageLocation::Resident { frame, origin });
        if from_swap {
            page.dirty = true;
        }
        space.pagedir.set_dirty(upage, false);
        self.frames.set_dirty(frame, false);
        self.frames.unpin(frame);
        trace!("pid {}: page {upage:#X} resident in frame {}", space.pid, frame.0);
        Ok(())
    }

    /// Fills `frame` with the contents `location` describes.
    fn populate(&self, frame: FrameNumber, location: &PageLocation) -> Result<()> {
        match location {
            PageLocation::ZeroFill => self.frames.zero(frame),
            PageLocation::FileBacked(segment) => {
                let mut data = self.frames.lock_frame(frame);
                let (head, tail) = data.split_at_mut(PAGE_FRAME_SIZE - segment.zero_bytes);
                if segment.file.read_at(segment.offset, head)? != segment.read_bytes {
                    return Err(Error::ShortRead);
                }
                tail.fill(0);
            }
            PageLocation::Swapped { slot, .. } => {
                self.swap.read(*slot, &mut self.frames.lock_frame(frame))?;
            }
            PageLocation::Resident { frame: resident, .. } => {
                panic!("populating frame {} from resident frame {}", frame.0, resident.0)
            }
        }
        Ok(())
    }

    /// Gives back a frame that never made it into a page.
    pub(crate) fn discard_frame(&self, frame: FrameNumber) {
        self.frames.unpin(frame);
        self.frames.release(frame);
    }
}

fn set_location(state: &mut SpaceState, upage: usize, location: PageLocation) -> &mut PageDescriptor {
    let Some(page) = state.spt.get_mut(upage) else {
        panic!("page {upage:#X} vanished while its fault was serviced");
    };
    page.location = location;
    page
}
