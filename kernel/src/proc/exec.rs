//! Program loading: ELF validation, lazy segment registration and
//! argument-stack construction.
//!
//! No code page is read here; `PT_LOAD` segments only populate the
//! supplemental page table, and the bytes come in through page faults.
//! Only the first stack page is materialized eagerly, to hold the
//! argument vector.

use alloc::{string::String, sync::Arc};

use arrayvec::ArrayVec;
use dataview::PodMethods as _;
use sync_api::{Mutex as _, SyncPrimitives};

use crate::{
    Kernel,
    block::BlockDevice,
    error::KernelError,
    fs::{File, Filesystem, FsNode},
    param::{MAX_ARG, MAX_ARG_LEN, PAGE_SIZE, USER_TOP, page_base, page_offset, page_round_up},
    vm::{AddressSpace, AllocFlags, PageEntry},
};

use super::{Pid, Process, Scheduler, elf};

/// Where a loaded program starts: handed to the user-mode jump.
#[derive(Debug, Clone)]
pub struct UserEntry {
    pub pid: Pid,
    pub name: String,
    pub entry_point: usize,
    pub esp: usize,
}

fn segment_is_valid(ph: &elf::ProgramHeader, file_len: usize) -> bool {
    let offset = ph.offset as usize;
    let vaddr = ph.vaddr as usize;
    let memsz = ph.memsz as usize;
    // the segment must sit at the same offset within its page in the
    // file and in memory
    page_offset(offset) == page_offset(vaddr)
        && offset <= file_len
        && ph.memsz >= ph.filesz
        && memsz > 0
        && vaddr.checked_add(memsz).is_some_and(|end| end <= USER_TOP)
        && vaddr >= PAGE_SIZE
}

/// Records one `PT_LOAD` segment as lazy code pages.
fn register_segment(vm: &mut AddressSpace, ph: &elf::ProgramHeader) {
    let writable = elf::SegmentFlags::from_bits_truncate(ph.flags).contains(elf::SegmentFlags::W);
    let page_ofs = page_offset(ph.vaddr as usize);
    let filesz = ph.filesz as usize;
    let memsz = ph.memsz as usize;

    let mut read_bytes = if filesz > 0 { page_ofs + filesz } else { 0 };
    let mut zero_bytes = page_round_up(page_ofs + memsz) - read_bytes;
    let mut upage = page_base(ph.vaddr as usize);
    let mut file_offset = page_base(ph.offset as usize);

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;
        vm.spt
            .insert(upage, PageEntry::code(file_offset, page_read, page_zero, writable));
        read_bytes -= page_read;
        zero_bytes -= page_zero;
        upage += PAGE_SIZE;
        file_offset += PAGE_SIZE;
    }
}

impl<D, P, S> Kernel<D, P, S>
where
    D: BlockDevice + Send + 'static,
    P: SyncPrimitives,
    S: Scheduler,
{
    /// Loads the program named by `cmdline` into `proc`'s address space
    /// and builds its initial stack. On success the executable stays open
    /// with writes denied for the life of the process.
    pub(super) fn load_process(
        &self,
        proc: &Arc<Process<P>>,
        cmdline: &str,
    ) -> Result<UserEntry, KernelError> {
        let mut args: ArrayVec<&str, MAX_ARG> = ArrayVec::new();
        for token in cmdline.split_whitespace() {
            if token.len() > MAX_ARG_LEN {
                return Err(KernelError::ArgumentListTooLong);
            }
            args.try_push(token)
                .map_err(|_| KernelError::ArgumentListTooLong)?;
        }
        let name = *args.first().ok_or(KernelError::InvalidExecutable)?;

        let entry_point = {
            let mut fs = self.fs.lock();
            let node = {
                let cwd = proc.cwd().lock();
                let cwd = cwd.as_ref().ok_or(KernelError::NotFound)?;
                fs.open_node(cwd, name.as_bytes())?
            };
            let mut exe = match node {
                FsNode::File(file) => file,
                FsNode::Dir(dir) => {
                    fs.dir_close(dir);
                    return Err(KernelError::InvalidExecutable);
                }
            };
            match Self::load_image(&mut fs, &exe, proc) {
                Ok(entry_point) => {
                    fs.file_deny_write(&mut exe);
                    *proc.executable().lock() = Some(exe);
                    entry_point
                }
                Err(e) => {
                    fs.file_close(exe);
                    return Err(e);
                }
            }
        };

        let esp = self.build_user_stack(proc, &args)?;
        Ok(UserEntry {
            pid: proc.pid(),
            name: String::from(name),
            entry_point,
            esp,
        })
    }

    /// Validates the image and registers its segments; returns the entry
    /// point.
    fn load_image(
        fs: &mut Filesystem<D>,
        exe: &File,
        proc: &Arc<Process<P>>,
    ) -> Result<usize, KernelError> {
        let mut header = elf::ElfHeader::zeroed();
        if fs.file_read_at(exe, header.as_bytes_mut(), 0) != size_of::<elf::ElfHeader>() {
            return Err(KernelError::InvalidExecutable);
        }
        if !header.is_loadable() {
            return Err(KernelError::InvalidExecutable);
        }

        let file_len = fs.file_length(exe);
        let mut vm = proc.vm().lock();
        for i in 0..header.phnum as usize {
            let offset = header.phoff as usize + i * size_of::<elf::ProgramHeader>();
            if offset > file_len {
                return Err(KernelError::InvalidExecutable);
            }
            let mut ph = elf::ProgramHeader::zeroed();
            if fs.file_read_at(exe, ph.as_bytes_mut(), offset) != size_of::<elf::ProgramHeader>()
            {
                return Err(KernelError::InvalidExecutable);
            }
            match ph.ty {
                elf::PT_LOAD => {
                    if !segment_is_valid(&ph, file_len) {
                        return Err(KernelError::InvalidExecutable);
                    }
                    register_segment(&mut vm, &ph);
                }
                elf::PT_DYNAMIC | elf::PT_INTERP | elf::PT_SHLIB => {
                    return Err(KernelError::InvalidExecutable);
                }
                _ => {}
            }
        }
        Ok(header.entry as usize)
    }

    /// Materializes the top stack page and lays out the argument vector:
    /// strings in reverse, word alignment, NULL sentinel, `argv[]`
    /// pointers in reverse, `argv`, `argc`, fake return address.
    fn build_user_stack(
        &self,
        proc: &Arc<Process<P>>,
        args: &[&str],
    ) -> Result<usize, KernelError> {
        let upage = USER_TOP - PAGE_SIZE;
        let frame = {
            let mut frames = self.frames.lock();
            let mut swap = self.swap.lock();
            frames.allocate(&mut swap, proc.pid(), upage, proc.vm(), AllocFlags::ZERO)
        };
        {
            let mut vm = proc.vm().lock();
            vm.spt.insert(upage, PageEntry::stack());
            vm.page_dir.map(upage, frame, true);
        }

        let esp = {
            let mut frames = self.frames.lock();
            let page = frames.bytes_mut(frame);
            let put_u32 = |page: &mut [u8; PAGE_SIZE], at: usize, value: u32| {
                page[at - upage..at - upage + 4].copy_from_slice(&value.to_le_bytes());
            };

            let mut sp = USER_TOP;
            let mut addrs: ArrayVec<u32, MAX_ARG> = ArrayVec::new();
            for arg in args.iter().rev() {
                let bytes = arg.as_bytes();
                sp -= bytes.len() + 1;
                page[sp - upage..sp - upage + bytes.len()].copy_from_slice(bytes);
                page[sp - upage + bytes.len()] = 0;
                addrs.push(sp as u32);
            }
            // word-align, then the argv[argc] NULL sentinel
            sp &= !3;
            sp -= 4;
            put_u32(page, sp, 0);
            // argv[i] pointers, last argument first
            for &addr in &addrs {
                sp -= 4;
                put_u32(page, sp, addr);
            }
            let argv = sp as u32;
            sp -= 4;
            put_u32(page, sp, argv);
            sp -= 4;
            put_u32(page, sp, args.len() as u32);
            sp -= 4;
            put_u32(page, sp, 0); // fake return address
            sp
        };
        self.frames.lock().set_pinned(frame, false);
        Ok(esp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_validation_matches_the_loader_rules() {
        let file_len = 0x3000;
        let mut ph = elf::ProgramHeader::zeroed();
        ph.ty = elf::PT_LOAD;
        ph.offset = 0x1020;
        ph.vaddr = 0x0804_8020;
        ph.filesz = 0x100;
        ph.memsz = 0x200;
        assert!(segment_is_valid(&ph, file_len));

        // mismatched page offsets
        let mut bad = ph.clone();
        bad.vaddr = 0x0804_8040;
        assert!(!segment_is_valid(&bad, file_len));

        // memsz < filesz
        let mut bad = ph.clone();
        bad.memsz = 0x80;
        assert!(!segment_is_valid(&bad, file_len));

        // empty
        let mut bad = ph.clone();
        bad.memsz = 0;
        bad.filesz = 0;
        assert!(!segment_is_valid(&bad, file_len));

        // first page is off limits
        let mut bad = ph.clone();
        bad.vaddr = 0x20;
        assert!(!segment_is_valid(&bad, file_len));

        // must not reach into kernel space
        let mut bad = ph.clone();
        bad.vaddr = (USER_TOP - 0x100) as u32;
        bad.memsz = 0x200;
        assert!(!segment_is_valid(&bad, file_len));
    }

    #[test]
    fn segment_registration_covers_every_page_once() {
        let mut vm = AddressSpace::new();
        let mut ph = elf::ProgramHeader::zeroed();
        ph.ty = elf::PT_LOAD;
        ph.offset = 0x20;
        ph.vaddr = 0x0804_8020;
        ph.filesz = 0x1500; // spans two pages of file data
        ph.memsz = 0x2800; // plus bss into a third page
        ph.flags = elf::SegmentFlags::R.bits() | elf::SegmentFlags::W.bits();
        register_segment(&mut vm, &ph);

        assert_eq!(vm.spt.len(), 3);
        let first = vm.spt.get(0x0804_8000).unwrap();
        let backing = first.backing.unwrap();
        assert_eq!(backing.offset, 0);
        assert_eq!(backing.read_bytes, PAGE_SIZE);
        assert!(first.writable);

        let mid = vm.spt.get(0x0804_9000).unwrap().backing.unwrap();
        assert_eq!(mid.offset, PAGE_SIZE);
        assert_eq!(mid.read_bytes, 0x20 + 0x1500 - PAGE_SIZE);

        // the bss tail is a pure zero page
        let last = vm.spt.get(0x0804_A000).unwrap().backing.unwrap();
        assert_eq!(last.read_bytes, 0);
        assert_eq!(last.zero_bytes, PAGE_SIZE);
    }

    #[test]
    fn read_only_segments_register_read_only_pages() {
        let mut vm = AddressSpace::new();
        let mut ph = elf::ProgramHeader::zeroed();
        ph.ty = elf::PT_LOAD;
        ph.offset = 0;
        ph.vaddr = 0x0804_8000;
        ph.filesz = 0x100;
        ph.memsz = 0x100;
        ph.flags = (elf::SegmentFlags::R | elf::SegmentFlags::X).bits();
        register_segment(&mut vm, &ph);
        assert!(!vm.spt.get(0x0804_8000).unwrap().writable);
    }
}
