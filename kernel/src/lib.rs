//! The opintos kernel core: an indexed on-disk file system, a demand-paged
//! virtual memory subsystem, and the process/system-call boundary that ties
//! them together.
//!
//! The crate is a library deliberately cut at the contracts the rest of a
//! kernel would provide: block devices ([`block::BlockDevice`]), blocking
//! primitives ([`sync_api`]), thread creation and the user-mode boundary
//! ([`proc::Scheduler`]), and the console ([`console::Console`]). A
//! [`Kernel`] instance owns one file system, one frame table, one swap
//! table and the process registry, each behind its own lock; lock order is
//! file system, then frame table, then swap.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
};

use sync_api::SyncPrimitives;

pub mod block;
pub mod console;
pub mod error;
pub mod fs;
pub mod param;
pub mod proc;
pub mod syscall;
pub mod vm;


pub use self::error::KernelError;

use self::{
    block::BlockDevice,
    console::Console,
    fs::Filesystem,
    proc::{ProcTable, Scheduler},
    vm::{frame::FrameTable, swap::SwapTable},
};

/// One kernel instance: every subsystem of the core behind its lock.
pub struct Kernel<D, P, S>
where
    D: Send,
    P: SyncPrimitives,
{
    /// The global file system lock (serializes every path-touching
    /// operation, the open-inode registry included).
    fs: P::Mutex<Filesystem<D>>,
    frames: P::Mutex<FrameTable<P>>,
    swap: P::Mutex<SwapTable<D>>,
    procs: P::Mutex<ProcTable<P>>,
    console: Box<dyn Console>,
    scheduler: S,
    /// Back-reference handed to spawned process threads.
    me: Weak<Self>,
}

impl<D, P, S> Kernel<D, P, S>
where
    D: BlockDevice + Send + 'static,
    P: SyncPrimitives,
    S: Scheduler,
{
    /// Assembles a kernel from its subsystems.
    pub fn new(
        fs: Filesystem<D>,
        frames: FrameTable<P>,
        swap: SwapTable<D>,
        console: Box<dyn Console>,
        scheduler: S,
    ) -> Arc<Self> {
        use sync_api::Mutex as _;
        Arc::new_cyclic(|me| Self {
            fs: P::Mutex::new(fs),
            frames: P::Mutex::new(frames),
            swap: P::Mutex::new(swap),
            procs: P::Mutex::new(ProcTable::new()),
            console,
            scheduler,
            me: me.clone(),
        })
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn console(&self) -> &dyn Console {
        &*self.console
    }
}
