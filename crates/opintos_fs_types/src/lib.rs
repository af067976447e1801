//! On-disk data types for the opintos file system.
//!
//! The disk layout:
//!
//! | sector        | content                  | type                      |
//! |---------------|--------------------------|---------------------------|
//! | 0             | reserved, never allocated | —                        |
//! | 1             | free-map file inode      | [`DiskInode`]             |
//! | 2             | root directory inode     | [`DiskInode`]             |
//! | 3..           | inodes, index blocks, data | [`DiskInode`] / [`IndirectBlock`] / `[u8; SECTOR_SIZE]` |
//!
//! Sector 0 is reserved so that a zero sector pointer inside an inode or an
//! index block can mean "not yet allocated". Everything here is fixed by
//! byte offsets (`const` asserted), not by whatever the compiler would lay
//! out.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use dataview::{Pod, PodMethods as _};

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector of the free-map file inode.
pub const FREE_MAP_SECTOR: u32 = 1;

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 2;

/// Number of sector pointers held directly in an inode.
pub const DIRECT_PTRS: usize = 10;

/// Inode slot holding the single-indirect index block.
pub const SINGLE_INDIRECT_SLOT: usize = 10;

/// Inode slot holding the double-indirect index block.
pub const DOUBLE_INDIRECT_SLOT: usize = 11;

/// Total sector pointers in an inode.
pub const INODE_PTRS: usize = 12;

/// Sector pointers per index block.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / size_of::<u32>();

/// Largest number of data sectors one inode can index.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_PTRS + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// Largest file size in bytes.
pub const MAX_FILE_SIZE: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// Identifies an inode sector ("INOD").
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Ordinary file.
pub const T_FILE: u32 = 0;
/// Directory.
pub const T_DIR: u32 = 1;

/// Block-device sector number.
///
/// `SectorNo` is always a real, allocated sector; the on-disk value 0
/// ("not yet allocated") maps to `Option::None` at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct SectorNo(u32);

impl fmt::Display for SectorNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SectorNo {
    pub const FREE_MAP: Self = Self::new(FREE_MAP_SECTOR);
    pub const ROOT_DIR: Self = Self::new(ROOT_DIR_SECTOR);

    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Maps the on-disk encoding to an API value (0 becomes `None`).
    #[must_use]
    pub const fn from_raw(n: u32) -> Option<Self> {
        if n == 0 { None } else { Some(Self(n)) }
    }

    /// Maps an API value back to the on-disk encoding.
    #[must_use]
    pub const fn to_raw(this: Option<Self>) -> u32 {
        match this {
            Some(sector) => sector.0,
            None => 0,
        }
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(&self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

/// Number of sectors needed to hold `bytes` bytes.
#[must_use]
pub const fn sectors_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_SIZE)
}

/// On-disk inode, exactly one sector.
///
/// Slots `0..10` of `blocks` are direct data sectors, slot 10 the
/// single-indirect index block, slot 11 the double-indirect index block.
/// A zero slot is unallocated.
#[derive(Clone, Pod)]
#[repr(C)]
pub struct DiskInode {
    blocks: [u32; INODE_PTRS],
    /// Must be [`INODE_MAGIC`].
    pub magic: u32,
    /// End of file, in bytes.
    pub length: u32,
    /// Sector of the parent directory's inode. Meaningful for
    /// directories; the root points at itself.
    pub parent: u32,
    /// [`T_FILE`] or [`T_DIR`].
    pub ty: u32,
    padding: [u32; 112],
}
const _: () = const { assert!(size_of::<DiskInode>() == SECTOR_SIZE) };

impl DiskInode {
    #[must_use]
    pub fn new(ty: u32, parent: SectorNo) -> Self {
        let mut inode = Self::zeroed();
        inode.magic = INODE_MAGIC;
        inode.ty = ty;
        inode.parent = parent.value();
        inode
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.ty == T_DIR
    }

    #[must_use]
    pub fn parent(&self) -> SectorNo {
        SectorNo::new(self.parent)
    }

    /// Returns the sector in slot `i`, `None` if unallocated.
    #[must_use]
    pub fn block(&self, i: usize) -> Option<SectorNo> {
        SectorNo::from_raw(self.blocks[i])
    }

    pub fn set_block(&mut self, i: usize, sector: Option<SectorNo>) {
        self.blocks[i] = SectorNo::to_raw(sector);
    }

    /// Index of the first unallocated slot in `blocks[..n]`.
    #[must_use]
    pub fn first_free_slot(&self, n: usize) -> Option<usize> {
        self.blocks[..n].iter().position(|&raw| raw == 0)
    }
}

/// An index block: one sector of sector pointers.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndirectBlock([u32; PTRS_PER_SECTOR]);
const _: () = const { assert!(size_of::<IndirectBlock>() == SECTOR_SIZE) };

impl IndirectBlock {
    #[must_use]
    pub fn get(&self, i: usize) -> Option<SectorNo> {
        SectorNo::from_raw(self.0[i])
    }

    pub fn set(&mut self, i: usize, sector: Option<SectorNo>) {
        self.0[i] = SectorNo::to_raw(sector);
    }

    /// Index of the first zero (unallocated) slot.
    #[must_use]
    pub fn first_free(&self) -> Option<usize> {
        self.0.iter().position(|&raw| raw == 0)
    }

    /// Index of the last allocated slot.
    #[must_use]
    pub fn last_used(&self) -> Option<usize> {
        self.0.iter().rposition(|&raw| raw != 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<SectorNo>> + '_ {
        self.0.iter().map(|&raw| SectorNo::from_raw(raw))
    }
}

/// Longest directory entry name, in bytes.
pub const NAME_MAX: usize = 14;

/// On-disk size of one directory entry.
pub const DIR_ENTRY_SIZE: usize = 20;

/// A directory entry: 4-byte inode sector, 15-byte NUL-terminated name,
/// 1-byte in-use flag. The 20-byte stride is part of the disk format.
#[derive(Debug, Pod)]
#[repr(C)]
pub struct DirEntry {
    sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}
const _: () = const { assert!(size_of::<DirEntry>() == DIR_ENTRY_SIZE) };

impl DirEntry {
    #[must_use]
    pub fn new(sector: SectorNo, name: &[u8]) -> Self {
        let mut entry = Self::zeroed();
        entry.sector = sector.value();
        entry.set_name(name);
        entry.in_use = 1;
        entry
    }

    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    pub fn clear(&mut self) {
        self.in_use = 0;
    }

    #[must_use]
    pub fn sector(&self) -> SectorNo {
        SectorNo::new(self.sector)
    }

    /// The entry name, up to the first NUL.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(NAME_MAX);
        &self.name[..len]
    }

    #[must_use]
    pub fn is_same_name(&self, name: &[u8]) -> bool {
        self.name() == name
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let len = usize::min(name.len(), NAME_MAX);
        self.name[..len].copy_from_slice(&name[..len]);
        self.name[len..].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use dataview::PodMethods as _;

    use super::*;

    #[test]
    fn on_disk_sizes_are_fixed() {
        assert_eq!(size_of::<DiskInode>(), SECTOR_SIZE);
        assert_eq!(size_of::<IndirectBlock>(), SECTOR_SIZE);
        assert_eq!(size_of::<DirEntry>(), DIR_ENTRY_SIZE);
        assert_eq!(align_of::<DirEntry>(), 4);
    }

    #[test]
    fn max_file_size_spans_both_indirections() {
        assert_eq!(MAX_FILE_SECTORS, 10 + 128 + 128 * 128);
        assert_eq!(MAX_FILE_SIZE, 16522 * 512);
    }

    #[test]
    fn sector_no_raw_round_trip() {
        assert_eq!(SectorNo::from_raw(0), None);
        assert_eq!(SectorNo::from_raw(7), Some(SectorNo::new(7)));
        assert_eq!(SectorNo::to_raw(None), 0);
        assert_eq!(SectorNo::to_raw(Some(SectorNo::new(7))), 7);
    }

    #[test]
    fn inode_slot_accessors() {
        let mut inode = DiskInode::new(T_FILE, SectorNo::ROOT_DIR);
        assert!(inode.is_valid());
        assert!(!inode.is_dir());
        assert_eq!(inode.first_free_slot(DIRECT_PTRS), Some(0));

        inode.set_block(0, Some(SectorNo::new(9)));
        assert_eq!(inode.block(0), Some(SectorNo::new(9)));
        assert_eq!(inode.first_free_slot(DIRECT_PTRS), Some(1));

        for i in 0..DIRECT_PTRS {
            inode.set_block(i, Some(SectorNo::new(9 + i as u32)));
        }
        assert_eq!(inode.first_free_slot(DIRECT_PTRS), None);
    }

    #[test]
    fn indirect_block_scan_order() {
        let mut blk = IndirectBlock::zeroed();
        assert_eq!(blk.first_free(), Some(0));
        assert_eq!(blk.last_used(), None);

        blk.set(0, Some(SectorNo::new(3)));
        blk.set(1, Some(SectorNo::new(4)));
        blk.set(5, Some(SectorNo::new(5)));
        assert_eq!(blk.first_free(), Some(2));
        assert_eq!(blk.last_used(), Some(5));

        blk.set(1, None);
        assert_eq!(blk.first_free(), Some(1));
    }

    #[test]
    fn dir_entry_name_truncates_at_limit() {
        let e = DirEntry::new(SectorNo::new(3), b"a-very-long-file-name");
        assert!(e.in_use());
        assert_eq!(e.name(), b"a-very-long-fi");
        assert_eq!(e.name().len(), NAME_MAX);

        let e = DirEntry::new(SectorNo::new(3), b"short");
        assert_eq!(e.name(), b"short");
        assert!(e.is_same_name(b"short"));
        assert!(!e.is_same_name(b"shor"));
        assert!(!e.is_same_name(b"shorter"));
    }

    #[test]
    fn sectors_for_bytes_rounds_up() {
        assert_eq!(sectors_for_bytes(0), 0);
        assert_eq!(sectors_for_bytes(1), 1);
        assert_eq!(sectors_for_bytes(512), 1);
        assert_eq!(sectors_for_bytes(513), 2);
        assert_eq!(sectors_for_bytes(70 * 1024), 140);
    }
}
