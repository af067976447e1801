//! Kernel-wide frame table.
//!
//! One entry per resident user frame, in allocation order. When the pool
//! runs dry, allocation evicts: the victim is preferably an unpinned
//! frame backing a writable page, else the first unpinned frame. Victim
//! selection and the pin write happen under the same borrow of the
//! table, so a concurrent free cannot invalidate the choice.
//!
//! Callers must not hold their own address-space lock while allocating:
//! eviction takes the victim's address-space lock after the frame-table
//! lock, and the victim may be the caller.

use alloc::sync::Arc;

use sync_api::{Mutex as _, SyncPrimitives};

use crate::{block::BlockDevice, proc::Pid};

use super::{
    page::AddressSpace,
    pool::{AllocFlags, FrameId, FramePool},
    swap::SwapTable,
};

/// One resident frame.
pub struct FrameEntry<P: SyncPrimitives> {
    pub frame: FrameId,
    pub owner: Pid,
    /// Page base this frame backs in the owner's address space.
    pub upage: usize,
    vm: Arc<P::Mutex<AddressSpace>>,
    pub pinned: bool,
}

/// The frame pool plus the entry list, kept behind one lock.
pub struct FrameTable<P: SyncPrimitives> {
    pool: FramePool,
    entries: alloc::vec::Vec<FrameEntry<P>>,
}

impl<P: SyncPrimitives> FrameTable<P> {
    #[must_use]
    pub fn new(pool: FramePool) -> Self {
        Self {
            pool,
            entries: alloc::vec::Vec::new(),
        }
    }

    /// Allocates a frame for `upage` of `owner`, evicting if necessary.
    /// The new entry starts pinned; unpin it once the mapping is
    /// installed.
    pub fn allocate<D: BlockDevice>(
        &mut self,
        swap: &mut SwapTable<D>,
        owner: Pid,
        upage: usize,
        vm: &Arc<P::Mutex<AddressSpace>>,
        flags: AllocFlags,
    ) -> FrameId {
        let frame = match self.pool.allocate(flags) {
            Some(frame) => frame,
            None => {
                self.evict_one(swap);
                self.pool
                    .allocate(flags)
                    .expect("frame pool still exhausted after eviction")
            }
        };
        self.entries.push(FrameEntry {
            frame,
            owner,
            upage,
            vm: Arc::clone(vm),
            pinned: true,
        });
        frame
    }

    /// Copies the victim's page to swap, records the slot in its
    /// supplemental entry, clears its mapping and frees the frame.
    fn evict_one<D: BlockDevice>(&mut self, swap: &mut SwapTable<D>) {
        let victim = self.pick_victim().expect("every frame is pinned");
        self.entries[victim].pinned = true;
        let entry = self.entries.remove(victim);

        let slot = swap.allocate(self.pool.bytes(entry.frame));
        {
            let mut vm = entry.vm.lock();
            let spte = vm
                .spt
                .get_mut(entry.upage)
                .expect("resident frame without a supplemental entry");
            spte.swap_slot = Some(slot);
            vm.page_dir.clear(entry.upage);
        }
        self.pool.free(entry.frame);
    }

    fn pick_victim(&self) -> Option<usize> {
        // prefer a frame whose supplemental entry is writable
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.pinned {
                continue;
            }
            let writable = entry
                .vm
                .lock()
                .spt
                .get(entry.upage)
                .is_some_and(|s| s.writable);
            if writable {
                return Some(i);
            }
        }
        self.entries.iter().position(|e| !e.pinned)
    }

    pub fn set_pinned(&mut self, frame: FrameId, pinned: bool) {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.frame == frame)
            .expect("pinning a frame with no entry");
        entry.pinned = pinned;
    }

    /// The frame backing `upage` of `owner`, if resident.
    #[must_use]
    pub fn frame_of(&self, owner: Pid, upage: usize) -> Option<FrameId> {
        self.entries
            .iter()
            .find(|e| e.owner == owner && e.upage == upage)
            .map(|e| e.frame)
    }

    /// Removes the entry for `frame` owned by `owner` and frees the
    /// frame. Missing entries are ignored, as a racing eviction may
    /// already have taken the frame.
    pub fn free_frame(&mut self, owner: Pid, frame: FrameId) {
        if let Some(i) = self
            .entries
            .iter()
            .position(|e| e.owner == owner && e.frame == frame)
        {
            let entry = self.entries.remove(i);
            self.pool.free(entry.frame);
        }
    }

    /// Drops every frame owned by `owner` (process teardown).
    pub fn release_process(&mut self, owner: Pid) {
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].owner == owner {
                let entry = self.entries.remove(i);
                self.pool.free(entry.frame);
            } else {
                i += 1;
            }
        }
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn bytes(&self, frame: FrameId) -> &[u8; crate::param::PAGE_SIZE] {
        self.pool.bytes(frame)
    }

    pub fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8; crate::param::PAGE_SIZE] {
        self.pool.bytes_mut(frame)
    }
}
