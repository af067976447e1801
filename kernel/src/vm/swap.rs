//! Swap backing store.
//!
//! A fixed array of page-sized slots on a dedicated block device; each
//! slot spans `PAGE_SIZE / SECTOR_SIZE` consecutive sectors. The owner
//! serializes access behind one lock.

use alloc::{vec, vec::Vec};

use opintos_fs_types::SECTOR_SIZE;

use crate::{
    block::BlockDevice,
    param::{MAX_SWAP_SLOTS, PAGE_SIZE, SECTORS_PER_PAGE},
};

/// Slot occupancy over the swap device.
pub struct SwapTable<D> {
    device: D,
    used: Vec<bool>,
}

impl<D: BlockDevice> SwapTable<D> {
    #[must_use]
    pub fn new(device: D) -> Self {
        let slots = (device.sector_count() as usize / SECTORS_PER_PAGE).min(MAX_SWAP_SLOTS);
        Self {
            device,
            used: vec![false; slots],
        }
    }

    /// Writes a page into a free slot and returns its index.
    ///
    /// Panics when no slot is free: an unevictable memory load is a
    /// liveness failure, not a recoverable error.
    pub fn allocate(&mut self, page: &[u8; PAGE_SIZE]) -> usize {
        let slot = self
            .used
            .iter()
            .position(|used| !used)
            .expect("swap space exhausted");
        self.used[slot] = true;
        for i in 0..SECTORS_PER_PAGE {
            let sector = (slot * SECTORS_PER_PAGE + i) as u32;
            let buf: &[u8; SECTOR_SIZE] = page[i * SECTOR_SIZE..][..SECTOR_SIZE]
                .try_into()
                .unwrap();
            self.device.write(sector, buf);
        }
        slot
    }

    /// Reads slot `slot` back into `page`. The slot stays occupied until
    /// freed.
    pub fn read_into(&mut self, slot: usize, page: &mut [u8; PAGE_SIZE]) {
        assert!(self.used[slot], "reading free swap slot {slot}");
        for i in 0..SECTORS_PER_PAGE {
            let sector = (slot * SECTORS_PER_PAGE + i) as u32;
            let buf: &mut [u8; SECTOR_SIZE] = (&mut page[i * SECTOR_SIZE..][..SECTOR_SIZE])
                .try_into()
                .unwrap();
            self.device.read(sector, buf);
        }
    }

    pub fn free(&mut self, slot: usize) {
        assert!(self.used[slot], "freeing free swap slot {slot}");
        self.used[slot] = false;
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.used.len()
    }

    #[must_use]
    pub fn used_slots(&self) -> usize {
        self.used.iter().filter(|&&u| u).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;

    fn page(fill: u8) -> Box<[u8; PAGE_SIZE]> {
        Box::new([fill; PAGE_SIZE])
    }

    #[test]
    fn round_trips_a_page() {
        let mut swap = SwapTable::new(MemDisk::new(64));
        assert_eq!(swap.slot_count(), 8);
        let slot = swap.allocate(&page(0x5A));
        let mut back = page(0);
        swap.read_into(slot, &mut back);
        assert!(back.iter().all(|&b| b == 0x5A));
        swap.free(slot);
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn slots_are_reused_after_free() {
        let mut swap = SwapTable::new(MemDisk::new(64));
        let a = swap.allocate(&page(1));
        let b = swap.allocate(&page(2));
        assert_ne!(a, b);
        swap.free(a);
        let c = swap.allocate(&page(3));
        assert_eq!(c, a);
        let mut back = page(0);
        swap.read_into(b, &mut back);
        assert!(back.iter().all(|&x| x == 2));
    }

    #[test]
    #[should_panic(expected = "swap space exhausted")]
    fn exhaustion_panics() {
        let mut swap = SwapTable::new(MemDisk::new(16)); // 2 slots
        swap.allocate(&page(1));
        swap.allocate(&page(2));
        swap.allocate(&page(3));
    }

    #[test]
    #[should_panic(expected = "reading free swap slot")]
    fn reading_a_free_slot_panics() {
        let mut swap = SwapTable::new(MemDisk::new(64));
        let mut back = page(0);
        swap.read_into(3, &mut back);
    }
}
