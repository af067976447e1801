//! File and directory system calls.
//!
//! Every path-touching call runs under the global filesystem lock.
//! Expected failures (missing names, full disk, full descriptor table)
//! come back as `false`/`-1`/short counts; misuse of a descriptor or a
//! bad pointer propagates as an error and terminates the caller.

use alloc::{sync::Arc, vec::Vec};

use sync_api::{Mutex as _, SyncPrimitives};

use crate::{
    Kernel,
    block::BlockDevice,
    error::KernelError,
    fs::FsNode,
    param::{MAX_PATH, PAGE_SIZE},
    proc::{Descriptor, Process, Scheduler},
};

use super::SyscallOutcome;

impl<D, P, S> Kernel<D, P, S>
where
    D: BlockDevice + Send + 'static,
    P: SyncPrimitives,
    S: Scheduler,
{
    /// Fetches a path argument. `Ok(None)` means the string was too long
    /// for any path, which surfaces as an ordinary failure rather than a
    /// kill.
    fn fetch_path(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
        va: u32,
    ) -> Result<Option<Vec<u8>>, KernelError> {
        match self.copy_in_str(proc, esp, va as usize, MAX_PATH) {
            Ok(path) => Ok(Some(path)),
            Err(KernelError::NameTooLong) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(super) fn sys_create(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let path_ptr = self.arg(proc, esp, 0)?;
        let size = self.arg(proc, esp, 1)? as usize;
        let Some(path) = self.fetch_path(proc, esp, path_ptr)? else {
            return Ok(SyscallOutcome::Return(0));
        };
        let mut fs = self.fs.lock();
        let cwd = proc.cwd().lock();
        let cwd = cwd.as_ref().ok_or(KernelError::NotFound)?;
        let ok = fs.create_file(cwd, &path, size).is_ok();
        Ok(SyscallOutcome::Return(i32::from(ok)))
    }

    pub(super) fn sys_remove(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let path_ptr = self.arg(proc, esp, 0)?;
        let Some(path) = self.fetch_path(proc, esp, path_ptr)? else {
            return Ok(SyscallOutcome::Return(0));
        };
        let mut fs = self.fs.lock();
        let cwd = proc.cwd().lock();
        let cwd = cwd.as_ref().ok_or(KernelError::NotFound)?;
        let ok = fs.remove(cwd, &path).is_ok();
        Ok(SyscallOutcome::Return(i32::from(ok)))
    }

    pub(super) fn sys_mkdir(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let path_ptr = self.arg(proc, esp, 0)?;
        let Some(path) = self.fetch_path(proc, esp, path_ptr)? else {
            return Ok(SyscallOutcome::Return(0));
        };
        let mut fs = self.fs.lock();
        let cwd = proc.cwd().lock();
        let cwd = cwd.as_ref().ok_or(KernelError::NotFound)?;
        let ok = fs.make_dir(cwd, &path).is_ok();
        Ok(SyscallOutcome::Return(i32::from(ok)))
    }

    pub(super) fn sys_chdir(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let path_ptr = self.arg(proc, esp, 0)?;
        let Some(path) = self.fetch_path(proc, esp, path_ptr)? else {
            return Ok(SyscallOutcome::Return(0));
        };
        let mut fs = self.fs.lock();
        let mut cwd = proc.cwd().lock();
        let old = cwd.take().ok_or(KernelError::NotFound)?;
        match fs.resolve_dir(&old, &path) {
            Ok(new) => {
                fs.dir_close(old);
                *cwd = Some(new);
                Ok(SyscallOutcome::Return(1))
            }
            Err(_) => {
                *cwd = Some(old);
                Ok(SyscallOutcome::Return(0))
            }
        }
    }

    pub(super) fn sys_open(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let path_ptr = self.arg(proc, esp, 0)?;
        let Some(path) = self.fetch_path(proc, esp, path_ptr)? else {
            return Ok(SyscallOutcome::Return(-1));
        };
        let node = {
            let mut fs = self.fs.lock();
            let cwd = proc.cwd().lock();
            let cwd = cwd.as_ref().ok_or(KernelError::NotFound)?;
            match fs.open_node(cwd, &path) {
                Ok(node) => node,
                Err(_) => return Ok(SyscallOutcome::Return(-1)),
            }
        };
        let descriptor = match node {
            FsNode::File(file) => Descriptor::File(file),
            FsNode::Dir(dir) => Descriptor::Dir(dir),
        };
        match proc.fds().lock().allocate(descriptor) {
            Ok(fd) => Ok(SyscallOutcome::Return(fd as i32)),
            Err(rejected) => {
                let mut fs = self.fs.lock();
                match rejected {
                    Descriptor::File(file) => fs.file_close(file),
                    Descriptor::Dir(dir) => fs.dir_close(dir),
                }
                Ok(SyscallOutcome::Return(-1))
            }
        }
    }

    pub(super) fn sys_close(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let fd = self.arg(proc, esp, 0)? as usize;
        let descriptor = proc
            .fds()
            .lock()
            .take(fd)
            .ok_or(KernelError::BadFileDescriptor(fd))?;
        let mut fs = self.fs.lock();
        match descriptor {
            Descriptor::File(file) => fs.file_close(file),
            Descriptor::Dir(dir) => fs.dir_close(dir),
        }
        Ok(SyscallOutcome::Return(0))
    }

    pub(super) fn sys_filesize(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let fd = self.arg(proc, esp, 0)? as usize;
        let mut fds = proc.fds().lock();
        match fds.get_mut(fd) {
            Some(Descriptor::File(file)) => {
                let len = self.fs.lock().file_length(file);
                Ok(SyscallOutcome::Return(len as i32))
            }
            _ => Err(KernelError::BadFileDescriptor(fd)),
        }
    }

    pub(super) fn sys_read(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let fd = self.arg(proc, esp, 0)? as usize;
        let buf_va = self.arg(proc, esp, 1)? as usize;
        let size = self.arg(proc, esp, 2)? as usize;

        if fd == 0 {
            let mut total = 0;
            let mut chunk = [0u8; PAGE_SIZE];
            while total < size {
                let want = (size - total).min(PAGE_SIZE);
                let got = self.console.read(&mut chunk[..want]);
                if got == 0 {
                    break;
                }
                self.copy_out_user(proc, esp, buf_va + total, &chunk[..got])?;
                total += got;
            }
            return Ok(SyscallOutcome::Return(total as i32));
        }
        if fd == 1 {
            return Err(KernelError::BadFileDescriptor(fd));
        }

        let mut total = 0;
        let mut chunk = [0u8; PAGE_SIZE];
        loop {
            let want = (size - total).min(PAGE_SIZE);
            if want == 0 {
                break;
            }
            let got = {
                let mut fds = proc.fds().lock();
                match fds.get_mut(fd) {
                    Some(Descriptor::File(file)) => self.fs.lock().file_read(file, &mut chunk[..want]),
                    Some(Descriptor::Dir(_)) => return Ok(SyscallOutcome::Return(-1)),
                    None => return Err(KernelError::BadFileDescriptor(fd)),
                }
            };
            if got == 0 {
                break;
            }
            self.copy_out_user(proc, esp, buf_va + total, &chunk[..got])?;
            total += got;
            if got < want {
                break;
            }
        }
        Ok(SyscallOutcome::Return(total as i32))
    }

    pub(super) fn sys_write(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let fd = self.arg(proc, esp, 0)? as usize;
        let buf_va = self.arg(proc, esp, 1)? as usize;
        let size = self.arg(proc, esp, 2)? as usize;

        if fd == 0 {
            return Err(KernelError::BadFileDescriptor(fd));
        }
        if fd == 1 {
            let mut total = 0;
            let mut chunk = [0u8; PAGE_SIZE];
            while total < size {
                let want = (size - total).min(PAGE_SIZE);
                self.copy_in_user(proc, esp, buf_va + total, &mut chunk[..want])?;
                self.console.write(&chunk[..want]);
                total += want;
            }
            return Ok(SyscallOutcome::Return(total as i32));
        }

        let mut total = 0;
        let mut chunk = [0u8; PAGE_SIZE];
        loop {
            let want = (size - total).min(PAGE_SIZE);
            if want == 0 {
                break;
            }
            self.copy_in_user(proc, esp, buf_va + total, &mut chunk[..want])?;
            let wrote = {
                let mut fds = proc.fds().lock();
                match fds.get_mut(fd) {
                    Some(Descriptor::File(file)) => self.fs.lock().file_write(file, &chunk[..want]),
                    // writing to a directory is fatal
                    Some(Descriptor::Dir(_)) => return Err(KernelError::IsADirectory),
                    None => return Err(KernelError::BadFileDescriptor(fd)),
                }
            };
            total += wrote;
            if wrote < want {
                break;
            }
        }
        Ok(SyscallOutcome::Return(total as i32))
    }

    pub(super) fn sys_seek(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let fd = self.arg(proc, esp, 0)? as usize;
        let pos = self.arg(proc, esp, 1)? as usize;
        let mut fds = proc.fds().lock();
        match fds.get_mut(fd) {
            Some(Descriptor::File(file)) => {
                file.seek(pos);
                Ok(SyscallOutcome::Return(0))
            }
            _ => Err(KernelError::BadFileDescriptor(fd)),
        }
    }

    pub(super) fn sys_tell(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let fd = self.arg(proc, esp, 0)? as usize;
        let mut fds = proc.fds().lock();
        match fds.get_mut(fd) {
            Some(Descriptor::File(file)) => Ok(SyscallOutcome::Return(file.tell() as i32)),
            _ => Err(KernelError::BadFileDescriptor(fd)),
        }
    }

    pub(super) fn sys_readdir(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let fd = self.arg(proc, esp, 0)? as usize;
        let buf_va = self.arg(proc, esp, 1)? as usize;
        let name = {
            let mut fds = proc.fds().lock();
            match fds.get_mut(fd) {
                Some(Descriptor::Dir(dir)) => self.fs.lock().dir_read_next(dir),
                Some(Descriptor::File(_)) => return Ok(SyscallOutcome::Return(0)),
                None => return Err(KernelError::BadFileDescriptor(fd)),
            }
        };
        match name {
            Some(name) => {
                let mut out = Vec::with_capacity(name.len() + 1);
                out.extend_from_slice(&name);
                out.push(0);
                self.copy_out_user(proc, esp, buf_va, &out)?;
                Ok(SyscallOutcome::Return(1))
            }
            None => Ok(SyscallOutcome::Return(0)),
        }
    }

    pub(super) fn sys_isdir(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let fd = self.arg(proc, esp, 0)? as usize;
        let mut fds = proc.fds().lock();
        match fds.get_mut(fd) {
            Some(Descriptor::Dir(_)) => Ok(SyscallOutcome::Return(1)),
            Some(Descriptor::File(_)) => Ok(SyscallOutcome::Return(0)),
            None => Err(KernelError::BadFileDescriptor(fd)),
        }
    }

    pub(super) fn sys_inumber(
        &self,
        proc: &Arc<Process<P>>,
        esp: usize,
    ) -> Result<SyscallOutcome, KernelError> {
        let fd = self.arg(proc, esp, 0)? as usize;
        let mut fds = proc.fds().lock();
        let sector = match fds.get_mut(fd) {
            Some(Descriptor::File(file)) => file.sector(),
            Some(Descriptor::Dir(dir)) => dir.sector(),
            None => return Err(KernelError::BadFileDescriptor(fd)),
        };
        Ok(SyscallOutcome::Return(sector.value() as i32))
    }
}
