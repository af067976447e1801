//! System-call dispatch.
//!
//! ABI: the number lives at the user stack pointer, the argument words at
//! `esp + 4`, `esp + 8`, `esp + 12`. An unknown number or an invalid user
//! pointer terminates the process with status -1; everything else comes
//! back as a 32-bit return value.

use alloc::sync::Arc;

use strum::FromRepr;
use sync_api::SyncPrimitives;

use crate::{
    Kernel,
    block::BlockDevice,
    error::KernelError,
    proc::{Process, Scheduler},
};

mod file;
mod proc;

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum SyscallCode {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Wait = 3,
    Create = 4,
    Remove = 5,
    Open = 6,
    Filesize = 7,
    Read = 8,
    Write = 9,
    Seek = 10,
    Tell = 11,
    Close = 12,
    Mkdir = 13,
    Chdir = 14,
    Readdir = 15,
    Isdir = 16,
    Inumber = 17,
}

/// What the trap layer does after a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Store the value and return to user code.
    Return(i32),
    /// Terminate the process with this status.
    Terminate(i32),
    /// Power off.
    Halt,
}

impl<D, P, S> Kernel<D, P, S>
where
    D: BlockDevice + Send + 'static,
    P: SyncPrimitives,
    S: Scheduler,
{
    /// Handles the system call whose frame starts at `esp`.
    pub fn syscall(&self, proc: &Arc<Process<P>>, esp: usize) -> SyscallOutcome {
        match self.dispatch(proc, esp) {
            Ok(outcome) => outcome,
            // bad pointers, bad descriptors, unknown numbers
            Err(_) => SyscallOutcome::Terminate(-1),
        }
    }

    /// Fetches argument word `n` of the current call.
    pub(super) fn arg(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
        n: usize,
    ) -> Result<u32, KernelError> {
        self.read_user_u32(proc, esp, esp + 4 + 4 * n)
    }

    fn dispatch(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let number = self.read_user_u32(proc, esp, esp)?;
        let Some(code) = SyscallCode::from_repr(number) else {
            return Err(KernelError::UnknownSyscall(number));
        };
        match code {
            SyscallCode::Halt => Ok(SyscallOutcome::Halt),
            SyscallCode::Exit => {
                let status = self.arg(proc, esp, 0)? as i32;
                Ok(SyscallOutcome::Terminate(status))
            }
            SyscallCode::Exec => self.sys_exec(proc, esp),
            SyscallCode::Wait => self.sys_wait(proc, esp),
            SyscallCode::Create => self.sys_create(proc, esp),
            SyscallCode::Remove => self.sys_remove(proc, esp),
            SyscallCode::Open => self.sys_open(proc, esp),
            SyscallCode::Filesize => self.sys_filesize(proc, esp),
            SyscallCode::Read => self.sys_read(proc, esp),
            SyscallCode::Write => self.sys_write(proc, esp),
            SyscallCode::Seek => self.sys_seek(proc, esp),
            SyscallCode::Tell => self.sys_tell(proc, esp),
            SyscallCode::Close => self.sys_close(proc, esp),
            SyscallCode::Mkdir => self.sys_mkdir(proc, esp),
            SyscallCode::Chdir => self.sys_chdir(proc, esp),
            SyscallCode::Readdir => self.sys_readdir(proc, esp),
            SyscallCode::Isdir => self.sys_isdir(proc, esp),
            SyscallCode::Inumber => self.sys_inumber(proc, esp),
        }
    }
}
