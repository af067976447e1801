//! Process system calls: exec and wait. (`exit` and `halt` are pure
//! control flow and live in the dispatcher.)

use alloc::sync::Arc;

use sync_api::SyncPrimitives;

use crate::{
    Kernel,
    block::BlockDevice,
    error::KernelError,
    param::MAX_CMDLINE,
    proc::{Pid, Process, Scheduler},
};

use super::SyscallOutcome;

impl<D, P, S> Kernel<D, P, S>
where
    D: BlockDevice + Send + 'static,
    P: SyncPrimitives,
    S: Scheduler,
{
    pub(super) fn sys_exec(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let cmd_ptr = self.arg(proc, esp, 0)?;
        let cmd = match self.copy_in_str(proc, esp, cmd_ptr as usize, MAX_CMDLINE) {
            Ok(cmd) => cmd,
            Err(KernelError::NameTooLong) => return Ok(SyscallOutcome::Return(-1)),
            Err(e) => return Err(e),
        };
        let Ok(cmd) = core::str::from_utf8(&cmd) else {
            return Ok(SyscallOutcome::Return(-1));
        };
        let ret = self.exec(proc, cmd).map_or(-1, |pid| pid.value() as i32);
        Ok(SyscallOutcome::Return(ret))
    }

    pub(super) fn sys_wait(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let child = Pid::new(self.arg(proc, esp, 0)?);
        let ret = self.wait(proc, child).unwrap_or(-1);
        Ok(SyscallOutcome::Return(ret))
    }
}
