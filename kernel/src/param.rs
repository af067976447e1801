//! Kernel tunables.

/// Open descriptors per process (fds 2.. map onto this table).
pub const NOFILE: usize = 16;

/// First descriptor number backed by the table; 0 and 1 are the console.
pub const FD_BASE: usize = 2;

/// Max exec arguments.
pub const MAX_ARG: usize = 32;

/// Max bytes in one exec argument.
pub const MAX_ARG_LEN: usize = 64;

/// Max bytes in an exec command line.
pub const MAX_CMDLINE: usize = 1024;

/// Max bytes in a path passed to a system call.
pub const MAX_PATH: usize = 256;

/// User page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Sectors per page on the swap device.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / opintos_fs_types::SECTOR_SIZE;

/// Capacity of the swap slot table.
pub const MAX_SWAP_SLOTS: usize = 1024;

/// First address above user space (the kernel boundary).
pub const USER_TOP: usize = 0xC000_0000;

/// Lowest mappable user address; the code segment starts here.
pub const CODE_FLOOR: usize = 0x0804_8000;

/// Largest user stack, in pages (8 MiB).
pub const MAX_STACK_PAGES: usize = 2048;

/// Lowest address the stack may grow down to.
pub const STACK_LIMIT: usize = USER_TOP - MAX_STACK_PAGES * PAGE_SIZE;

/// How far below the stack pointer a faulting access may land and still
/// count as stack growth (covers x86 `push`/`pusha` slack).
pub const STACK_SLACK: usize = 32;

/// Rounds `addr` down to its page base.
#[must_use]
pub const fn page_base(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[must_use]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Offset of `addr` within its page.
#[must_use]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}
