//! Swap space on a block device, divided into page-sized slots.

use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::Mutex;
use crate::vm::frame::PageBuf;
use demandos_shared::{bit_array::Bitmap, sizes::SECTORS_PER_PAGE};
use log::{info, trace};

/// A page-sized region of the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    fn sector(self, i: u32) -> BlockSector {
        self.0 as BlockSector * SECTORS_PER_PAGE + i
    }
}

pub struct SwapSpace {
    /// Set bits are slots holding a page.
    bitmap: Mutex<Bitmap>,
    device: Mutex<Block>,
}

impl SwapSpace {
    /// Slots are carved out of the whole device; a trailing partial page is
    /// left unused.
    pub fn new(device: Block) -> Self {
        let slots = (device.get_size() / SECTORS_PER_PAGE) as usize;
        info!("swap: {device}, {slots} slots");
        Self {
            bitmap: Mutex::new(Bitmap::new(slots)),
            device: Mutex::new(device),
        }
    }

    pub fn capacity(&self) -> usize {
        self.bitmap.lock().len()
    }

    pub fn used_slots(&self) -> usize {
        self.bitmap.lock().count_ones()
    }

    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().test(slot.0)
    }

    /// Claims the lowest free slot. Running out of swap is fatal.
    pub fn allocate_slot(&self) -> SwapSlot {
        let Some(idx) = self.bitmap.lock().scan_and_flip() else {
            panic!("swap space exhausted");
        };
        SwapSlot(idx)
    }

    /// Copies `page` into `slot`, which must be allocated.
    pub fn write(&self, slot: SwapSlot, page: &PageBuf) -> Result<(), BlockError> {
        assert!(self.is_used(slot), "writing to free swap slot {}", slot.0);
        let mut device = self.device.lock();
        for (i, chunk) in (0..).zip(page.chunks_exact(BLOCK_SECTOR_SIZE)) {
            device.write(slot.sector(i), chunk)?;
        }
        trace!("swap: page written to slot {}", slot.0);
        Ok(())
    }

    /// Copies `slot` into `page` and frees the slot. On error the slot stays
    /// allocated and its contents are untouched.
    pub fn read(&self, slot: SwapSlot, page: &mut PageBuf) -> Result<(), BlockError> {
        assert!(self.is_used(slot), "reading free swap slot {}", slot.0);
        {
            let mut device = self.device.lock();
            for (i, chunk) in (0..).zip(page.chunks_exact_mut(BLOCK_SECTOR_SIZE)) {
                device.read(slot.sector(i), chunk)?;
            }
        }
        trace!("swap: page read from slot {}", slot.0);
        self.free(slot);
        Ok(())
    }

    /// Allocates a slot and writes `page` into it.
    pub fn store(&self, page: &PageBuf) -> Result<SwapSlot, BlockError> {
        let slot = self.allocate_slot();
        if let Err(err) = self.write(slot, page) {
            self.free(slot);
            return Err(err);
        }
        Ok(slot)
    }

    /// Discards the contents of `slot`.
    pub fn free(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        assert!(bitmap.test(slot.0), "freeing free swap slot {}", slot.0);
        bitmap.set(slot.0, false);
    }
}
