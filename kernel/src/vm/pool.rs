//! The user frame pool.
//!
//! Stands in for the low-level page allocator: a fixed number of 4 KiB
//! frames handed out by index. The capacity is what makes eviction real —
//! a kernel configured with `n` frames starts evicting at the `n+1`-th
//! resident page.

use alloc::{boxed::Box, vec::Vec};

use crate::param::PAGE_SIZE;

bitflags::bitflags! {
    /// Frame allocation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Hand out a zero-filled frame.
        const ZERO = 1 << 0;
    }
}

/// Index of a physical frame in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(usize);

impl FrameId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A fixed-capacity pool of page frames.
pub struct FramePool {
    frames: Vec<Option<Box<[u8; PAGE_SIZE]>>>,
}

impl FramePool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        frames.resize_with(capacity, || None);
        Self { frames }
    }

    /// Takes a free frame, `None` if the pool is exhausted.
    pub fn allocate(&mut self, flags: AllocFlags) -> Option<FrameId> {
        let slot = self.frames.iter().position(|f| f.is_none())?;
        let mut frame = Box::new([0u8; PAGE_SIZE]);
        if !flags.contains(AllocFlags::ZERO) {
            // a recycled hardware frame would hold stale data; nothing to
            // do for a fresh allocation
            frame.fill(0);
        }
        self.frames[slot] = Some(frame);
        Some(FrameId(slot))
    }

    pub fn free(&mut self, frame: FrameId) {
        let taken = self.frames[frame.0].take();
        assert!(taken.is_some(), "freeing unallocated frame {}", frame.0);
    }

    #[must_use]
    pub fn bytes(&self, frame: FrameId) -> &[u8; PAGE_SIZE] {
        self.frames[frame.0].as_deref().expect("unallocated frame")
    }

    pub fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8; PAGE_SIZE] {
        self.frames[frame.0]
            .as_deref_mut()
            .expect("unallocated frame")
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_at_capacity() {
        let mut pool = FramePool::new(2);
        let a = pool.allocate(AllocFlags::ZERO).unwrap();
        let _b = pool.allocate(AllocFlags::ZERO).unwrap();
        assert_eq!(pool.allocate(AllocFlags::ZERO), None);
        pool.free(a);
        assert!(pool.allocate(AllocFlags::ZERO).is_some());
    }

    #[test]
    fn frames_are_independent() {
        let mut pool = FramePool::new(2);
        let a = pool.allocate(AllocFlags::ZERO).unwrap();
        let b = pool.allocate(AllocFlags::ZERO).unwrap();
        pool.bytes_mut(a).fill(1);
        assert!(pool.bytes(b).iter().all(|&x| x == 0));
    }

    #[test]
    #[should_panic(expected = "freeing unallocated frame")]
    fn double_free_panics() {
        let mut pool = FramePool::new(1);
        let a = pool.allocate(AllocFlags::ZERO).unwrap();
        pool.free(a);
        pool.free(a);
    }
}
