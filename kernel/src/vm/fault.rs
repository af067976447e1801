//! Page-fault service.
//!
//! Classifies a fault against the process's supplemental page table and
//! materializes the page: swap-in, lazy code load, or zeroed stack
//! growth. Anything else is a fatal fault and the caller terminates the
//! process with status -1.
//!
//! Lock discipline: the faulting thread holds no address-space lock when
//! the frame table is taken, and the filesystem lock is released before
//! the frame-table lock is acquired (code bytes go through a bounce
//! page).

use alloc::{boxed::Box, sync::Arc};

use sync_api::{Mutex as _, SyncPrimitives};

use crate::{
    Kernel,
    block::BlockDevice,
    error::KernelError,
    param::{CODE_FLOOR, PAGE_SIZE, STACK_LIMIT, STACK_SLACK, USER_TOP, page_base},
    proc::{Process, Scheduler},
    vm::{AllocFlags, FileBacking, PageEntry},
};

enum Service {
    /// Read the page back from this swap slot.
    SwapIn { slot: usize, writable: bool },
    /// Read `read_bytes` from the executable, zero the tail.
    FileLoad { backing: FileBacking, writable: bool },
    /// A fresh zeroed page; `grow` adds a stack entry first.
    Zero { grow: bool, writable: bool },
}

impl<D, P, S> Kernel<D, P, S>
where
    D: BlockDevice + Send + 'static,
    P: SyncPrimitives,
    S: Scheduler,
{
    /// Services a user page fault at `fault_va` with the faulting
    /// thread's stack pointer `user_esp`. An `Err` means the fault is
    /// fatal to the process.
    pub fn handle_page_fault(
        &self,
        proc: &Arc<Process<P>>,
        fault_va: usize,
        user_esp: usize,
    ) -> Result<(), KernelError> {
        if fault_va < CODE_FLOOR || fault_va >= USER_TOP {
            return Err(KernelError::BadUserPointer(fault_va));
        }
        let upage = page_base(fault_va);

        let service = {
            let vm = proc.vm().lock();
            if vm.page_dir.lookup(upage).is_some() {
                // present: the access itself was illegal
                return Err(KernelError::BadUserPointer(fault_va));
            }
            match vm.spt.get(upage) {
                Some(entry) => match (entry.swap_slot, entry.backing) {
                    (Some(slot), _) => Service::SwapIn {
                        slot,
                        writable: entry.writable,
                    },
                    (None, Some(backing)) => Service::FileLoad {
                        backing,
                        writable: entry.writable,
                    },
                    (None, None) => Service::Zero {
                        grow: false,
                        writable: entry.writable,
                    },
                },
                None => {
                    let in_stack_region = fault_va >= STACK_LIMIT;
                    let near_esp = fault_va.saturating_add(STACK_SLACK) >= user_esp;
                    if in_stack_region && near_esp {
                        Service::Zero {
                            grow: true,
                            writable: true,
                        }
                    } else {
                        return Err(KernelError::BadUserPointer(fault_va));
                    }
                }
            }
        };

        match service {
            Service::SwapIn { slot, writable } => {
                let frame = {
                    let mut frames = self.frames.lock();
                    let mut swap = self.swap.lock();
                    let frame =
                        frames.allocate(&mut swap, proc.pid(), upage, proc.vm(), AllocFlags::empty());
                    swap.read_into(slot, frames.bytes_mut(frame));
                    swap.free(slot);
                    frame
                };
                {
                    let mut vm = proc.vm().lock();
                    vm.spt.get_mut(upage).expect("page entry vanished").swap_slot = None;
                    vm.page_dir.map(upage, frame, writable);
                }
                self.frames.lock().set_pinned(frame, false);
            }
            Service::FileLoad { backing, writable } => {
                let mut bounce = Box::new([0u8; PAGE_SIZE]);
                {
                    let exe = proc.executable().lock();
                    let exe = exe.as_ref().ok_or(KernelError::BadUserPointer(fault_va))?;
                    let mut fs = self.fs.lock();
                    let read = fs.file_read_at(exe, &mut bounce[..backing.read_bytes], backing.offset);
                    if read != backing.read_bytes {
                        return Err(KernelError::InvalidExecutable);
                    }
                }
                let frame = {
                    let mut frames = self.frames.lock();
                    let mut swap = self.swap.lock();
                    let frame =
                        frames.allocate(&mut swap, proc.pid(), upage, proc.vm(), AllocFlags::ZERO);
                    frames.bytes_mut(frame)[..backing.read_bytes]
                        .copy_from_slice(&bounce[..backing.read_bytes]);
                    frame
                };
                {
                    let mut vm = proc.vm().lock();
                    vm.page_dir.map(upage, frame, writable);
                }
                self.frames.lock().set_pinned(frame, false);
            }
            Service::Zero { grow, writable } => {
                let frame = {
                    let mut frames = self.frames.lock();
                    let mut swap = self.swap.lock();
                    frames.allocate(&mut swap, proc.pid(), upage, proc.vm(), AllocFlags::ZERO)
                };
                {
                    let mut vm = proc.vm().lock();
                    if grow {
                        vm.spt.insert(upage, PageEntry::stack());
                    }
                    vm.page_dir.map(upage, frame, writable);
                }
                self.frames.lock().set_pinned(frame, false);
            }
        }
        Ok(())
    }
}
