//! Inode layer: the on-disk index structure and the open-inode registry.
//!
//! An inode indexes up to 10 direct sectors, 128 via a single-indirect
//! block and 128×128 via a double-indirect block. Opening the same sector
//! twice yields the same registry entry with its open count bumped;
//! deallocation of a removed inode is deferred to the last close.
//!
//! Files are dense: writes beyond the end of file allocate and zero every
//! sector in between, so [`Filesystem::byte_to_sector`] resolves every
//! byte below the length of a healthy file.

use dataview::PodMethods as _;
use opintos_fs_types::{
    DIRECT_PTRS, DOUBLE_INDIRECT_SLOT, DiskInode, IndirectBlock, MAX_FILE_SIZE, PTRS_PER_SECTOR,
    SECTOR_SIZE, SINGLE_INDIRECT_SLOT, SectorNo, T_DIR, T_FILE, sectors_for_bytes,
};

use crate::{block::BlockDevice, error::KernelError};

use super::Filesystem;

/// A registry entry: one open on-disk inode.
pub(super) struct OpenInode {
    pub(super) sector: SectorNo,
    pub(super) open_count: u32,
    pub(super) deny_write: u32,
    pub(super) removed: bool,
    /// Cached copy of the on-disk image, written through on change.
    pub(super) disk: DiskInode,
}

impl<D: BlockDevice> Filesystem<D> {
    fn registry_index(&self, sector: SectorNo) -> Option<usize> {
        self.open_inodes.iter().position(|oi| oi.sector == sector)
    }

    fn entry(&self, sector: SectorNo) -> &OpenInode {
        let i = self.registry_index(sector).expect("inode is not open");
        &self.open_inodes[i]
    }

    fn entry_mut(&mut self, sector: SectorNo) -> &mut OpenInode {
        let i = self.registry_index(sector).expect("inode is not open");
        &mut self.open_inodes[i]
    }

    /// Number of live references to `sector`, 0 if not open.
    #[must_use]
    pub fn open_count(&self, sector: SectorNo) -> u32 {
        self.registry_index(sector)
            .map_or(0, |i| self.open_inodes[i].open_count)
    }

    /// Current deny-write count of an open inode.
    #[must_use]
    pub fn deny_write_count(&self, sector: SectorNo) -> u32 {
        self.entry(sector).deny_write
    }

    /// Opens the inode at `sector`: registry hit bumps the open count, a
    /// miss reads the image from disk.
    pub(super) fn open_inode(&mut self, sector: SectorNo) -> Result<(), KernelError> {
        if let Some(i) = self.registry_index(sector) {
            self.open_inodes[i].open_count += 1;
            return Ok(());
        }
        let disk: DiskInode = self.read_pod(sector);
        if !disk.is_valid() {
            return Err(KernelError::NotFound);
        }
        self.open_inodes.push(OpenInode {
            sector,
            open_count: 1,
            deny_write: 0,
            removed: false,
            disk,
        });
        Ok(())
    }

    /// Drops one reference. The last close of a removed inode releases its
    /// data sectors, its index blocks and the inode sector itself.
    pub(super) fn close_inode(&mut self, sector: SectorNo) {
        let i = self.registry_index(sector).expect("closing unopened inode");
        let oi = &mut self.open_inodes[i];
        assert!(oi.open_count > 0);
        oi.open_count -= 1;
        if oi.open_count > 0 {
            return;
        }
        assert_eq!(oi.deny_write, 0, "deny_write outlived the last opener");
        let removed = oi.removed;
        let disk = oi.disk.clone();
        self.open_inodes.remove(i);
        if removed {
            self.release_inode_storage(&disk);
            self.release_sector(sector);
        }
    }

    /// Marks an open inode for deletion at last close.
    pub(super) fn remove_inode(&mut self, sector: SectorNo) {
        self.entry_mut(sector).removed = true;
    }

    pub(super) fn inode_length(&self, sector: SectorNo) -> usize {
        self.entry(sector).disk.length as usize
    }

    pub(super) fn inode_is_dir(&self, sector: SectorNo) -> bool {
        self.entry(sector).disk.is_dir()
    }

    pub(super) fn inode_parent(&self, sector: SectorNo) -> SectorNo {
        self.entry(sector).disk.parent()
    }

    pub(super) fn deny_write_inode(&mut self, sector: SectorNo) {
        let oi = self.entry_mut(sector);
        oi.deny_write += 1;
        assert!(oi.deny_write <= oi.open_count);
    }

    pub(super) fn allow_write_inode(&mut self, sector: SectorNo) {
        let oi = self.entry_mut(sector);
        assert!(oi.deny_write > 0);
        oi.deny_write -= 1;
    }

    /// Writes the cached image back to the inode's sector.
    fn update_inode(&mut self, sector: SectorNo, disk: &DiskInode) {
        self.entry_mut(sector).disk = disk.clone();
        self.write_pod(sector, disk);
    }

    /// Initializes a fresh on-disk inode at `sector` with `length` bytes of
    /// zeroed data. On allocation failure the sectors already taken are
    /// released and the inode sector is left unwritten.
    pub(super) fn inode_create(
        &mut self,
        sector: SectorNo,
        length: usize,
        is_dir: bool,
        parent: SectorNo,
    ) -> Result<(), KernelError> {
        if length > MAX_FILE_SIZE {
            return Err(KernelError::FileTooLarge);
        }
        let ty = if is_dir { T_DIR } else { T_FILE };
        let mut disk = DiskInode::new(ty, parent);
        for _ in 0..sectors_for_bytes(length) {
            if let Err(e) = self.extend_one_sector(&mut disk) {
                self.release_inode_storage(&disk);
                return Err(e);
            }
        }
        disk.length = u32::try_from(length).unwrap();
        self.write_pod(sector, &disk);
        Ok(())
    }

    /// Resolves the sector holding byte `pos` of an open inode. `None`
    /// means the position is not backed by an allocated sector.
    ///
    /// This is a pure index walk: callers enforce the end-of-file rule
    /// (reads stop at the length, writes extend).
    pub(super) fn byte_to_sector(&mut self, sector: SectorNo, pos: usize) -> Option<SectorNo> {
        let disk = self.entry(sector).disk.clone();
        self.resolve_index(&disk, pos / SECTOR_SIZE)
    }

    fn resolve_index(&mut self, disk: &DiskInode, index: usize) -> Option<SectorNo> {
        if index < DIRECT_PTRS {
            return disk.block(index);
        }
        let index = index - DIRECT_PTRS;
        if index < PTRS_PER_SECTOR {
            let ind = disk.block(SINGLE_INDIRECT_SLOT)?;
            let blk: IndirectBlock = self.read_pod(ind);
            return blk.get(index);
        }
        let index = index - PTRS_PER_SECTOR;
        let dbl = disk.block(DOUBLE_INDIRECT_SLOT)?;
        let dblk: IndirectBlock = self.read_pod(dbl);
        let ind = dblk.get(index / PTRS_PER_SECTOR)?;
        let blk: IndirectBlock = self.read_pod(ind);
        blk.get(index % PTRS_PER_SECTOR)
    }

    /// Grows the index structure by one zeroed data sector and returns it.
    ///
    /// Fill order is observable: direct slots first, then holes in the
    /// single-indirect block, then holes in existing double-indirect index
    /// blocks front to back, and only then a new index block.
    pub(super) fn extend_one_sector(
        &mut self,
        disk: &mut DiskInode,
    ) -> Result<SectorNo, KernelError> {
        if let Some(slot) = disk.first_free_slot(DIRECT_PTRS) {
            let sector = self.alloc_zeroed_sector()?;
            disk.set_block(slot, Some(sector));
            return Ok(sector);
        }

        let ind = match disk.block(SINGLE_INDIRECT_SLOT) {
            Some(ind) => ind,
            None => {
                let ind = self.alloc_zeroed_sector()?;
                disk.set_block(SINGLE_INDIRECT_SLOT, Some(ind));
                ind
            }
        };
        let mut blk: IndirectBlock = self.read_pod(ind);
        if let Some(slot) = blk.first_free() {
            let sector = self.alloc_zeroed_sector()?;
            blk.set(slot, Some(sector));
            self.write_pod(ind, &blk);
            return Ok(sector);
        }

        let dbl = match disk.block(DOUBLE_INDIRECT_SLOT) {
            Some(dbl) => dbl,
            None => {
                let dbl = self.alloc_zeroed_sector()?;
                disk.set_block(DOUBLE_INDIRECT_SLOT, Some(dbl));
                dbl
            }
        };
        let mut dblk: IndirectBlock = self.read_pod(dbl);
        for i in 0..PTRS_PER_SECTOR {
            let Some(ind) = dblk.get(i) else { continue };
            let mut blk: IndirectBlock = self.read_pod(ind);
            if let Some(slot) = blk.first_free() {
                let sector = self.alloc_zeroed_sector()?;
                blk.set(slot, Some(sector));
                self.write_pod(ind, &blk);
                return Ok(sector);
            }
        }
        let Some(slot) = dblk.first_free() else {
            return Err(KernelError::FileTooLarge);
        };
        let ind = self.alloc_zeroed_sector()?;
        dblk.set(slot, Some(ind));
        self.write_pod(dbl, &dblk);
        let sector = self.alloc_zeroed_sector()?;
        let mut blk = IndirectBlock::zeroed();
        blk.set(0, Some(sector));
        self.write_pod(ind, &blk);
        Ok(sector)
    }

    /// Releases every sector an inode's index reaches, index blocks
    /// included (but not the inode sector itself).
    pub(super) fn release_inode_storage(&mut self, disk: &DiskInode) {
        for i in 0..DIRECT_PTRS {
            if let Some(sector) = disk.block(i) {
                self.release_sector(sector);
            }
        }
        if let Some(ind) = disk.block(SINGLE_INDIRECT_SLOT) {
            let blk: IndirectBlock = self.read_pod(ind);
            for sector in blk.iter().flatten() {
                self.release_sector(sector);
            }
            self.release_sector(ind);
        }
        if let Some(dbl) = disk.block(DOUBLE_INDIRECT_SLOT) {
            let dblk: IndirectBlock = self.read_pod(dbl);
            for ind in dblk.iter().flatten() {
                let blk: IndirectBlock = self.read_pod(ind);
                for sector in blk.iter().flatten() {
                    self.release_sector(sector);
                }
                self.release_sector(ind);
            }
            self.release_sector(dbl);
        }
    }

    /// Reads up to `buf.len()` bytes at `offset`, stopping at end of file
    /// or at a hole. Returns the bytes read.
    pub(super) fn inode_read_at(
        &mut self,
        sector: SectorNo,
        buf: &mut [u8],
        offset: usize,
    ) -> usize {
        let length = self.inode_length(sector);
        let mut read = 0;
        while read < buf.len() {
            let pos = offset + read;
            if pos >= length {
                break;
            }
            let Some(data_sector) = self.byte_to_sector(sector, pos) else {
                break;
            };
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - read)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length - pos);
            let mut bounce = [0u8; SECTOR_SIZE];
            self.read_sector(data_sector, &mut bounce);
            buf[read..read + chunk].copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            read += chunk;
        }
        read
    }

    /// Writes `buf` at `offset`, growing the file as needed. A write past
    /// the end of file first allocates and zeroes the gap. Returns the
    /// bytes written; a short count means the free map ran dry.
    pub(super) fn inode_write_at(&mut self, sector: SectorNo, buf: &[u8], offset: usize) -> usize {
        if self.entry(sector).deny_write > 0 {
            return 0;
        }
        if offset + buf.len() > MAX_FILE_SIZE {
            return 0;
        }
        let mut disk = self.entry(sector).disk.clone();
        let mut length = disk.length as usize;

        if offset > length {
            // zero the tail of the sector holding the current end of file
            if length % SECTOR_SIZE != 0 {
                if let Some(eof_sector) = self.resolve_index(&disk, length / SECTOR_SIZE) {
                    let mut bounce = [0u8; SECTOR_SIZE];
                    self.read_sector(eof_sector, &mut bounce);
                    bounce[length % SECTOR_SIZE..].fill(0);
                    self.write_sector(eof_sector, &bounce);
                }
            }
            let have = sectors_for_bytes(length);
            let need = sectors_for_bytes(offset);
            for _ in have..need {
                if self.extend_one_sector(&mut disk).is_err() {
                    // keep the sectors already indexed, length unchanged
                    self.update_inode(sector, &disk);
                    return 0;
                }
            }
            length = offset;
            disk.length = u32::try_from(length).unwrap();
            self.update_inode(sector, &disk);
        }

        let mut written = 0;
        while written < buf.len() {
            let pos = offset + written;
            let data_sector = match self.resolve_index(&disk, pos / SECTOR_SIZE) {
                Some(s) => s,
                None => match self.extend_one_sector(&mut disk) {
                    Ok(s) => s,
                    Err(_) => break,
                },
            };
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - written).min(SECTOR_SIZE - sector_ofs);
            let mut bounce = [0u8; SECTOR_SIZE];
            self.read_sector(data_sector, &mut bounce);
            bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[written..written + chunk]);
            self.write_sector(data_sector, &bounce);
            written += chunk;
            if pos + chunk > length {
                length = pos + chunk;
                disk.length = u32::try_from(length).unwrap();
            }
        }
        self.update_inode(sector, &disk);
        written
    }
}

#[cfg(test)]
mod tests {
    use opintos_fs_types::{DIR_ENTRY_SIZE, FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

    use super::*;
    use crate::block::MemDisk;

    const DISK_SECTORS: u32 = 4096;

    fn fresh_fs() -> Filesystem<MemDisk> {
        Filesystem::format(MemDisk::new(DISK_SECTORS)).unwrap()
    }

    fn new_file(fs: &mut Filesystem<MemDisk>, length: usize) -> SectorNo {
        let sector = fs.alloc_sector().unwrap();
        fs.inode_create(sector, length, false, SectorNo::ROOT_DIR)
            .unwrap();
        fs.open_inode(sector).unwrap();
        sector
    }

    #[test]
    fn format_places_the_well_known_inodes() {
        let mut fs = fresh_fs();
        assert!(fs.free_map.is_used(0));
        assert!(fs.free_map.is_used(FREE_MAP_SECTOR));
        assert!(fs.free_map.is_used(ROOT_DIR_SECTOR));
        fs.open_inode(SectorNo::ROOT_DIR).unwrap();
        assert!(fs.inode_is_dir(SectorNo::ROOT_DIR));
        assert_eq!(fs.inode_parent(SectorNo::ROOT_DIR), SectorNo::ROOT_DIR);
        fs.close_inode(SectorNo::ROOT_DIR);
    }

    #[test]
    fn registry_shares_open_inodes() {
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 0);
        assert_eq!(fs.open_count(ino), 1);
        fs.open_inode(ino).unwrap();
        assert_eq!(fs.open_count(ino), 2);
        assert_eq!(fs.open_inodes.len(), 1);
        fs.close_inode(ino);
        fs.close_inode(ino);
        assert_eq!(fs.open_count(ino), 0);
    }

    #[test]
    fn create_allocates_zeroed_dense_sectors() {
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 3 * SECTOR_SIZE + 5);
        assert_eq!(fs.inode_length(ino), 3 * SECTOR_SIZE + 5);
        for pos in (0..4 * SECTOR_SIZE).step_by(SECTOR_SIZE) {
            assert!(fs.byte_to_sector(ino, pos).is_some(), "hole at {pos}");
        }
        let mut buf = [0xFFu8; 3 * SECTOR_SIZE + 5];
        let n = fs.inode_read_at(ino, &mut buf, 0);
        assert_eq!(n, 3 * SECTOR_SIZE + 5);
        assert!(buf[..n].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 0);
        let data: alloc::vec::Vec<u8> = (0..1500).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.inode_write_at(ino, &data, 100), data.len());
        assert_eq!(fs.inode_length(ino), 1600);
        let mut back = vec![0u8; data.len()];
        assert_eq!(fs.inode_read_at(ino, &mut back, 100), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn read_stops_at_end_of_file() {
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 0);
        fs.inode_write_at(ino, b"hello", 0);
        let mut buf = [0u8; 64];
        assert_eq!(fs.inode_read_at(ino, &mut buf, 0), 5);
        assert_eq!(fs.inode_read_at(ino, &mut buf, 5), 0);
        assert_eq!(fs.inode_read_at(ino, &mut buf, 1000), 0);
    }

    #[test]
    fn sparse_write_zero_fills_the_gap() {
        // the inode-level half of the seek-past-end scenario
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 0);
        assert_eq!(fs.inode_write_at(ino, b"X", 5000), 1);
        assert_eq!(fs.inode_length(ino), 5001);
        let mut buf = vec![0xFFu8; 5001];
        assert_eq!(fs.inode_read_at(ino, &mut buf, 0), 5001);
        assert!(buf[..5000].iter().all(|&b| b == 0));
        assert_eq!(buf[5000], b'X');
        // the file is dense below its length
        for pos in (0..5001).step_by(SECTOR_SIZE) {
            assert!(fs.byte_to_sector(ino, pos).is_some());
        }
    }

    #[test]
    fn write_at_exact_end_extends() {
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 0);
        assert_eq!(fs.inode_write_at(ino, b"ab", 0), 2);
        // pos == length: read sees nothing, write appends
        let mut buf = [0u8; 4];
        assert_eq!(fs.inode_read_at(ino, &mut buf, 2), 0);
        assert_eq!(fs.inode_write_at(ino, b"cd", 2), 2);
        assert_eq!(fs.inode_length(ino), 4);
    }

    #[test]
    fn grows_across_single_and_double_indirection() {
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 0);
        // 70 KiB = 140 sectors: 10 direct + 128 single-indirect + 2 double
        let len = 70 * 1024;
        let data: alloc::vec::Vec<u8> = (0..len).map(|i| (i * 7 % 253) as u8).collect();
        assert_eq!(fs.inode_write_at(ino, &data, 0), len);
        assert_eq!(fs.inode_length(ino), len);

        let disk = fs.entry(ino).disk.clone();
        assert!(disk.block(SINGLE_INDIRECT_SLOT).is_some());
        assert!(disk.block(DOUBLE_INDIRECT_SLOT).is_some());

        let mut back = vec![0u8; len];
        assert_eq!(fs.inode_read_at(ino, &mut back, 0), len);
        assert_eq!(back, data);
    }

    #[test]
    fn extension_fills_direct_slots_before_indirect_blocks() {
        let mut fs = fresh_fs();
        let mut disk = DiskInode::new(T_FILE, SectorNo::ROOT_DIR);
        for _ in 0..DIRECT_PTRS {
            fs.extend_one_sector(&mut disk).unwrap();
        }
        assert!(disk.block(SINGLE_INDIRECT_SLOT).is_none());
        fs.extend_one_sector(&mut disk).unwrap();
        assert!(disk.block(SINGLE_INDIRECT_SLOT).is_some());
        assert!(disk.block(DOUBLE_INDIRECT_SLOT).is_none());
    }

    #[test]
    fn extension_refills_holes_in_indirect_blocks_first() {
        let mut fs = fresh_fs();
        let mut disk = DiskInode::new(T_FILE, SectorNo::ROOT_DIR);
        for _ in 0..DIRECT_PTRS + 3 {
            fs.extend_one_sector(&mut disk).unwrap();
        }
        // punch a hole in the single-indirect block
        let ind = disk.block(SINGLE_INDIRECT_SLOT).unwrap();
        let mut blk: IndirectBlock = fs.read_pod(ind);
        let hole = blk.get(1).unwrap();
        fs.release_sector(hole);
        blk.set(1, None);
        fs.write_pod(ind, &blk);

        let got = fs.extend_one_sector(&mut disk).unwrap();
        let blk: IndirectBlock = fs.read_pod(ind);
        assert_eq!(blk.get(1), Some(got));
    }

    #[test]
    fn deny_write_blocks_writes_until_allowed() {
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 0);
        fs.deny_write_inode(ino);
        assert_eq!(fs.inode_write_at(ino, b"nope", 0), 0);
        assert_eq!(fs.inode_length(ino), 0);
        fs.allow_write_inode(ino);
        assert_eq!(fs.inode_write_at(ino, b"yes", 0), 3);
    }

    #[test]
    #[should_panic(expected = "deny_write")]
    fn deny_write_cannot_exceed_open_count() {
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 0);
        fs.deny_write_inode(ino);
        fs.deny_write_inode(ino);
    }

    #[test]
    fn removed_inode_is_deallocated_at_last_close() {
        let mut fs = fresh_fs();
        let free_before = fs.free_map.count_free();
        let ino = new_file(&mut fs, 2 * SECTOR_SIZE);
        fs.open_inode(ino).unwrap();
        fs.remove_inode(ino);
        fs.close_inode(ino);
        // still open once: nothing released yet
        assert!(fs.free_map.is_used(ino.value()));
        fs.close_inode(ino);
        assert!(!fs.free_map.is_used(ino.value()));
        assert_eq!(fs.free_map.count_free(), free_before);
    }

    #[test]
    fn release_returns_index_blocks_too() {
        let mut fs = fresh_fs();
        let free_before = fs.free_map.count_free();
        let ino = new_file(&mut fs, 40 * SECTOR_SIZE); // needs the single-indirect block
        fs.remove_inode(ino);
        fs.close_inode(ino);
        assert_eq!(fs.free_map.count_free(), free_before);
    }

    #[test]
    fn write_reports_short_count_when_disk_fills() {
        let mut fs = Filesystem::format(MemDisk::new(64)).unwrap();
        let ino = new_file(&mut fs, 0);
        let big = vec![7u8; 64 * SECTOR_SIZE];
        let written = fs.inode_write_at(ino, &big, 0);
        assert!(written > 0);
        assert!(written < big.len());
        assert_eq!(fs.inode_length(ino), written);
    }

    #[test]
    fn gap_extension_failure_returns_zero_and_keeps_length() {
        let mut fs = Filesystem::format(MemDisk::new(32)).unwrap();
        let ino = new_file(&mut fs, 0);
        fs.inode_write_at(ino, b"seed", 0);
        let written = fs.inode_write_at(ino, b"far", 200 * SECTOR_SIZE);
        assert_eq!(written, 0);
        assert_eq!(fs.inode_length(ino), 4);
    }

    #[test]
    fn dir_entry_stride_divides_into_sectors_unevenly() {
        // entries straddle sector boundaries; the bounce path must handle it
        let mut fs = fresh_fs();
        let ino = new_file(&mut fs, 0);
        let entry = [0xA5u8; DIR_ENTRY_SIZE];
        for i in 0..30 {
            assert_eq!(
                fs.inode_write_at(ino, &entry, i * DIR_ENTRY_SIZE),
                DIR_ENTRY_SIZE
            );
        }
        let mut back = [0u8; DIR_ENTRY_SIZE];
        assert_eq!(fs.inode_read_at(ino, &mut back, 25 * DIR_ENTRY_SIZE), DIR_ENTRY_SIZE);
        assert_eq!(back, entry);
    }
}
