//! User-pointer validation and user-space copying.
//!
//! Every address arriving from user code goes through here: it must lie
//! between the code floor and the kernel boundary, and each touched page
//! must be resident, lazily materializable through the supplemental page
//! table, or eligible for stack growth. Strings are fetched byte by byte
//! up to a caller-supplied cap.

use alloc::{sync::Arc, vec::Vec};

use sync_api::{Mutex as _, SyncPrimitives};

use crate::{
    Kernel,
    block::BlockDevice,
    error::KernelError,
    param::{CODE_FLOOR, PAGE_SIZE, USER_TOP, page_base, page_offset},
    proc::{Process, Scheduler},
};

impl<D, P, S> Kernel<D, P, S>
where
    D: BlockDevice + Send + 'static,
    P: SyncPrimitives,
    S: Scheduler,
{
    /// Makes the page under `va` resident (faulting it in if needed) and
    /// checks the access mode.
    fn ensure_user_page(
        &self,
        proc: &Arc<Process<P>>,
        va: usize,
        user_esp: usize,
        write: bool,
    ) -> Result<(), KernelError> {
        if va < CODE_FLOOR || va >= USER_TOP {
            return Err(KernelError::BadUserPointer(va));
        }
        let upage = page_base(va);
        {
            let vm = proc.vm().lock();
            if let Some(mapping) = vm.page_dir.lookup(upage) {
                if write && !mapping.writable {
                    return Err(KernelError::BadUserPointer(va));
                }
                return Ok(());
            }
        }
        self.handle_page_fault(proc, va, user_esp)?;
        let vm = proc.vm().lock();
        match vm.page_dir.lookup(upage) {
            Some(mapping) if !write || mapping.writable => Ok(()),
            _ => Err(KernelError::BadUserPointer(va)),
        }
    }

    /// Copies `buf.len()` bytes from user memory at `va`.
    pub fn copy_in_user(
        &self,
        proc: &Arc<Process<P>>,
        user_esp: usize,
        va: usize,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let va = va + done;
            self.ensure_user_page(proc, va, user_esp, false)?;
            let upage = page_base(va);
            let offset = page_offset(va);
            let chunk = (buf.len() - done).min(PAGE_SIZE - offset);
            let frames = self.frames.lock();
            // the page can be evicted between the fault and this lock;
            // retry the loop iteration if so
            if let Some(frame) = frames.frame_of(proc.pid(), upage) {
                buf[done..done + chunk].copy_from_slice(&frames.bytes(frame)[offset..offset + chunk]);
                done += chunk;
            }
        }
        Ok(())
    }

    /// Copies `buf` into user memory at `va`. The destination pages must
    /// be writable.
    pub fn copy_out_user(
        &self,
        proc: &Arc<Process<P>>,
        user_esp: usize,
        va: usize,
        buf: &[u8],
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let va = va + done;
            self.ensure_user_page(proc, va, user_esp, true)?;
            let upage = page_base(va);
            let offset = page_offset(va);
            let chunk = (buf.len() - done).min(PAGE_SIZE - offset);
            let mut frames = self.frames.lock();
            if let Some(frame) = frames.frame_of(proc.pid(), upage) {
                frames.bytes_mut(frame)[offset..offset + chunk]
                    .copy_from_slice(&buf[done..done + chunk]);
                done += chunk;
            }
        }
        Ok(())
    }

    /// Fetches a NUL-terminated user string, at most `max` bytes long.
    pub fn copy_in_str(
        &self,
        proc: &Arc<Process<P>>,
        user_esp: usize,
        va: usize,
        max: usize,
    ) -> Result<Vec<u8>, KernelError> {
        let mut out = Vec::new();
        loop {
            if out.len() >= max {
                return Err(KernelError::NameTooLong);
            }
            let mut byte = [0u8; 1];
            self.copy_in_user(proc, user_esp, va + out.len(), &mut byte)?;
            if byte[0] == 0 {
                return Ok(out);
            }
            out.push(byte[0]);
        }
    }

    /// Reads a little-endian word from user memory.
    pub(crate) fn read_user_u32(
        &self,
        proc: &Arc<Process<P>>,
        user_esp: usize,
        va: usize,
    ) -> Result<u32, KernelError> {
        let mut bytes = [0u8; 4];
        self.copy_in_user(proc, user_esp, va, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }
}
