//! Processes: records, lifecycle, descriptors.
//!
//! A process record is reference counted; the parent's handle keeps an
//! exited child observable until `wait` harvests it. The load/exit
//! protocol is semaphore based: `exec` blocks the parent on its
//! `child_exec_status` semaphore until the child reports the load result,
//! and an exiting child blocks on its own `allow_exit` semaphore until
//! the parent has read the exit status.

use alloc::{
    boxed::Box,
    format,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::fmt;

use sync_api::{Mutex as _, Semaphore as _, SyncPrimitives};

use crate::{
    Kernel,
    block::BlockDevice,
    error::KernelError,
    fs::{Dir, File},
    param::{FD_BASE, NOFILE},
    vm::AddressSpace,
};

pub mod elf;
mod exec;
mod user_mem;

pub use self::exec::UserEntry;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The contracts the thread system provides: thread creation, yielding,
/// and the jump to user mode. `enter_user` runs the loaded program and
/// returns its exit status.
pub trait Scheduler: Send + Sync + 'static {
    fn spawn(&self, body: Box<dyn FnOnce() + Send + 'static>);
    fn yield_now(&self);
    fn enter_user(&self, entry: UserEntry) -> i32;
}

/// An open descriptor: a file or a directory handle.
#[derive(Debug)]
pub enum Descriptor {
    File(File),
    Dir(Dir),
}

/// Per-process descriptor table, indexed by `fd - 2`.
pub struct DescriptorTable {
    slots: [Option<Descriptor>; NOFILE],
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [const { None }; NOFILE],
        }
    }

    /// Puts `descriptor` in the first free slot. On a full table the
    /// descriptor is handed back so the caller can close it.
    pub fn allocate(&mut self, descriptor: Descriptor) -> Result<usize, Descriptor> {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(i) => {
                self.slots[i] = Some(descriptor);
                Ok(i + FD_BASE)
            }
            None => Err(descriptor),
        }
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut Descriptor> {
        fd.checked_sub(FD_BASE)
            .and_then(|i| self.slots.get_mut(i))
            .and_then(|s| s.as_mut())
    }

    pub fn take(&mut self, fd: usize) -> Option<Descriptor> {
        fd.checked_sub(FD_BASE)
            .and_then(|i| self.slots.get_mut(i))
            .and_then(|s| s.take())
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Descriptor> + '_ {
        self.slots.iter_mut().filter_map(|s| s.take())
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// State shared between a process and its relatives.
pub struct ProcShared<P: SyncPrimitives> {
    pub name: String,
    pub children: Vec<Arc<Process<P>>>,
    pub exit_status: i32,
    pub done: bool,
    /// Set by an exec-ed child: +1 loaded, -1 failed.
    pub child_exec_loaded: i32,
}

/// One process.
pub struct Process<P: SyncPrimitives> {
    pid: Pid,
    parent: Weak<Process<P>>,
    shared: P::Mutex<ProcShared<P>>,
    /// Downed by this process in `exec`; upped by the child once its load
    /// result is in `child_exec_loaded`.
    child_exec_status: P::Semaphore,
    /// Downed by this process in `exit`; upped when the parent harvests
    /// the status (or abandons the child).
    allow_exit: P::Semaphore,
    fds: P::Mutex<DescriptorTable>,
    cwd: P::Mutex<Option<Dir>>,
    /// The running image, held open with writes denied.
    executable: P::Mutex<Option<File>>,
    vm: Arc<P::Mutex<AddressSpace>>,
}

impl<P: SyncPrimitives> Process<P> {
    fn new(pid: Pid, name: &str, parent: Weak<Self>, cwd: Option<Dir>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            parent,
            shared: P::Mutex::new(ProcShared {
                name: String::from(name),
                children: Vec::new(),
                exit_status: 0,
                done: false,
                child_exec_loaded: 0,
            }),
            child_exec_status: P::Semaphore::new(0),
            allow_exit: P::Semaphore::new(0),
            fds: P::Mutex::new(DescriptorTable::new()),
            cwd: P::Mutex::new(cwd),
            executable: P::Mutex::new(None),
            vm: Arc::new(P::Mutex::new(AddressSpace::new())),
        })
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn shared(&self) -> &P::Mutex<ProcShared<P>> {
        &self.shared
    }

    pub fn fds(&self) -> &P::Mutex<DescriptorTable> {
        &self.fds
    }

    pub fn cwd(&self) -> &P::Mutex<Option<Dir>> {
        &self.cwd
    }

    pub fn executable(&self) -> &P::Mutex<Option<File>> {
        &self.executable
    }

    pub fn vm(&self) -> &Arc<P::Mutex<AddressSpace>> {
        &self.vm
    }
}

/// Registry of live processes.
pub struct ProcTable<P: SyncPrimitives> {
    next_pid: u32,
    procs: Vec<Arc<Process<P>>>,
}

impl<P: SyncPrimitives> Default for ProcTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: SyncPrimitives> ProcTable<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: 1,
            procs: Vec::new(),
        }
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        pid
    }

    fn insert(&mut self, proc: Arc<Process<P>>) {
        self.procs.push(proc);
    }

    fn remove(&mut self, pid: Pid) {
        self.procs.retain(|p| p.pid != pid);
    }

    fn find(&self, pid: Pid) -> Option<Arc<Process<P>>> {
        self.procs.iter().find(|p| p.pid == pid).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

impl<D, P, S> Kernel<D, P, S>
where
    D: BlockDevice + Send + 'static,
    P: SyncPrimitives,
    S: Scheduler,
{
    /// Creates the first process, with the root directory as its cwd.
    pub fn init_process(&self, name: &str) -> Result<Arc<Process<P>>, KernelError> {
        let root = self.fs.lock().open_root()?;
        Ok(self.new_process(name, None, Some(root)))
    }

    fn new_process(
        &self,
        name: &str,
        parent: Option<&Arc<Process<P>>>,
        cwd: Option<Dir>,
    ) -> Arc<Process<P>> {
        let mut procs = self.procs.lock();
        let pid = procs.allocate_pid();
        let weak = parent.map_or_else(Weak::new, Arc::downgrade);
        let proc = Process::new(pid, name, weak, cwd);
        procs.insert(Arc::clone(&proc));
        drop(procs);
        if let Some(parent) = parent {
            parent.shared.lock().children.push(Arc::clone(&proc));
        }
        proc
    }

    #[must_use]
    pub fn find_process(&self, pid: Pid) -> Option<Arc<Process<P>>> {
        self.procs.lock().find(pid)
    }

    /// Spawns a child running `cmd` and waits for its load result.
    /// Returns the child's pid, or an error if the load failed.
    pub fn exec(&self, parent: &Arc<Process<P>>, cmd: &str) -> Result<Pid, KernelError> {
        let name = cmd.split_whitespace().next().ok_or(KernelError::InvalidName)?;
        let cwd = {
            let mut fs = self.fs.lock();
            let parent_cwd = parent.cwd.lock();
            match parent_cwd.as_ref() {
                Some(dir) => Some(fs.dir_reopen(dir)?),
                None => None,
            }
        };
        let child = self.new_process(name, Some(parent), cwd);
        let pid = child.pid;

        let kernel = self.me.upgrade().expect("kernel is being torn down");
        let cmdline = String::from(cmd);
        self.scheduler.spawn(Box::new(move || {
            kernel.start_process(&child, &cmdline);
        }));

        parent.child_exec_status.down();
        let loaded = {
            let mut shared = parent.shared.lock();
            let v = shared.child_exec_loaded;
            shared.child_exec_loaded = 0;
            v
        };
        if loaded < 0 {
            return Err(KernelError::ExecFailed);
        }
        Ok(pid)
    }

    /// Body of a freshly spawned process thread: load, report to the
    /// parent, run user code, exit.
    fn start_process(&self, proc: &Arc<Process<P>>, cmdline: &str) {
        let loaded = self.load_process(proc, cmdline);
        if let Some(parent) = proc.parent.upgrade() {
            parent.shared.lock().child_exec_loaded = if loaded.is_ok() { 1 } else { -1 };
            parent.child_exec_status.up();
        }
        self.scheduler.yield_now();
        match loaded {
            Ok(entry) => {
                let status = self.scheduler.enter_user(entry);
                self.exit_process(proc, status);
            }
            Err(_) => self.exit_process(proc, -1),
        }
    }

    /// Waits for `child` to exit and returns its status. Fails if `child`
    /// is not an un-waited child of `parent`.
    pub fn wait(&self, parent: &Arc<Process<P>>, child: Pid) -> Result<i32, KernelError> {
        let child = parent
            .shared
            .lock()
            .children
            .iter()
            .find(|c| c.pid == child)
            .cloned()
            .ok_or(KernelError::NoSuchChild)?;

        while !child.shared.lock().done {
            self.scheduler.yield_now();
        }

        let status = child.shared.lock().exit_status;
        parent.shared.lock().children.retain(|c| c.pid != child.pid);
        self.procs.lock().remove(child.pid);
        child.allow_exit.up();
        Ok(status)
    }

    /// Terminates `proc` with `status`: releases every resource it holds,
    /// publishes the status, then (if a parent may still wait) blocks
    /// until the parent has harvested it.
    pub fn exit_process(&self, proc: &Arc<Process<P>>, status: i32) {
        let name = proc.shared.lock().name.clone();
        self.console.write(format!("{name}: exit({status})\n").as_bytes());

        {
            let mut fs = self.fs.lock();
            for descriptor in proc.fds.lock().drain() {
                match descriptor {
                    Descriptor::File(file) => fs.file_close(file),
                    Descriptor::Dir(dir) => fs.dir_close(dir),
                }
            }
            if let Some(cwd) = proc.cwd.lock().take() {
                fs.dir_close(cwd);
            }
            if let Some(mut exe) = proc.executable.lock().take() {
                fs.file_allow_write(&mut exe);
                fs.file_close(exe);
            }
        }

        self.frames.lock().release_process(proc.pid);
        {
            let mut swap = self.swap.lock();
            let mut vm = proc.vm.lock();
            for (_upage, entry) in vm.spt.iter() {
                if let Some(slot) = entry.swap_slot {
                    swap.free(slot);
                }
            }
            vm.spt.clear();
            vm.page_dir.clear_all();
        }

        // abandon remaining children so their exits cannot block forever
        let children = core::mem::take(&mut proc.shared.lock().children);
        for child in children {
            if child.shared.lock().done {
                self.procs.lock().remove(child.pid);
            }
            child.allow_exit.up();
        }

        {
            let mut shared = proc.shared.lock();
            shared.exit_status = status;
            shared.done = true;
        }

        if proc.parent.upgrade().is_some() {
            proc.allow_exit.down();
        } else {
            self.procs.lock().remove(proc.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::MemDisk, fs::Filesystem};

    fn root_descriptor(fs: &mut Filesystem<MemDisk>) -> Descriptor {
        Descriptor::Dir(fs.open_root().unwrap())
    }

    #[test]
    fn descriptors_start_at_two_and_reuse_slots() {
        let mut fs = Filesystem::format(MemDisk::new(256)).unwrap();
        let mut table = DescriptorTable::new();
        assert_eq!(table.allocate(root_descriptor(&mut fs)).unwrap(), 2);
        assert_eq!(table.allocate(root_descriptor(&mut fs)).unwrap(), 3);
        assert!(table.take(2).is_some());
        assert!(table.take(2).is_none());
        assert_eq!(table.allocate(root_descriptor(&mut fs)).unwrap(), 2);
    }

    #[test]
    fn full_table_returns_the_descriptor() {
        let mut fs = Filesystem::format(MemDisk::new(256)).unwrap();
        let mut table = DescriptorTable::new();
        for i in 0..NOFILE {
            assert_eq!(
                table.allocate(root_descriptor(&mut fs)).unwrap(),
                i + FD_BASE
            );
        }
        assert!(table.allocate(root_descriptor(&mut fs)).is_err());
    }

    #[test]
    fn reserved_fds_are_never_table_slots() {
        let mut fs = Filesystem::format(MemDisk::new(256)).unwrap();
        let mut table = DescriptorTable::new();
        table.allocate(root_descriptor(&mut fs)).unwrap();
        assert!(table.get_mut(0).is_none());
        assert!(table.get_mut(1).is_none());
        assert!(table.get_mut(2).is_some());
    }
}
