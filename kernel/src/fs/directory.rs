//! Directory layer: fixed-stride entries over a directory inode.
//!
//! Deletion clears an entry's in-use flag without compaction; adding a
//! name reuses the first free slot before growing the file. `.` and `..`
//! are not stored — the parent link lives in the child's inode.

use arrayvec::ArrayVec;
use dataview::PodMethods as _;
use opintos_fs_types::{DIR_ENTRY_SIZE, DirEntry, NAME_MAX, SectorNo};

use crate::{block::BlockDevice, error::KernelError};

use super::{Dir, Filesystem};

impl<D: BlockDevice> Filesystem<D> {
    fn read_dir_entry(&mut self, dir: SectorNo, offset: usize) -> Option<DirEntry> {
        let mut entry = DirEntry::zeroed();
        let n = self.inode_read_at(dir, entry.as_bytes_mut(), offset);
        (n == DIR_ENTRY_SIZE).then_some(entry)
    }

    fn write_dir_entry(
        &mut self,
        dir: SectorNo,
        offset: usize,
        entry: &DirEntry,
    ) -> Result<(), KernelError> {
        if self.inode_write_at(dir, entry.as_bytes(), offset) == DIR_ENTRY_SIZE {
            Ok(())
        } else {
            Err(KernelError::NoFreeSectors)
        }
    }

    /// Finds `name` in `dir`; returns the child's inode sector and the
    /// entry's byte offset.
    pub(super) fn dir_lookup(&mut self, dir: SectorNo, name: &[u8]) -> Option<(SectorNo, usize)> {
        let mut offset = 0;
        while let Some(entry) = self.read_dir_entry(dir, offset) {
            if entry.in_use() && entry.is_same_name(name) {
                return Some((entry.sector(), offset));
            }
            offset += DIR_ENTRY_SIZE;
        }
        None
    }

    /// Adds `name -> child` to `dir`, reusing the first free slot.
    pub(super) fn dir_add(
        &mut self,
        dir: SectorNo,
        name: &[u8],
        child: SectorNo,
    ) -> Result<(), KernelError> {
        if name.is_empty() || name == b"." || name == b".." || name.contains(&b'/') {
            return Err(KernelError::InvalidName);
        }
        if name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        if self.dir_lookup(dir, name).is_some() {
            return Err(KernelError::AlreadyExists);
        }
        let mut offset = 0;
        let slot = loop {
            match self.read_dir_entry(dir, offset) {
                Some(entry) if !entry.in_use() => break offset,
                Some(_) => offset += DIR_ENTRY_SIZE,
                None => break offset, // end of file: append
            }
        };
        self.write_dir_entry(dir, slot, &DirEntry::new(child, name))
    }

    /// Removes `name` from `dir`. A directory child must be empty. The
    /// child's inode is flagged removed; deallocation happens at its last
    /// close.
    pub(super) fn dir_remove_entry(
        &mut self,
        dir: SectorNo,
        name: &[u8],
    ) -> Result<SectorNo, KernelError> {
        let Some((child, offset)) = self.dir_lookup(dir, name) else {
            return Err(KernelError::NotFound);
        };
        self.open_inode(child)?;
        if self.inode_is_dir(child) && !self.dir_is_empty(child) {
            self.close_inode(child);
            return Err(KernelError::DirectoryNotEmpty);
        }
        let mut entry = self.read_dir_entry(dir, offset).unwrap();
        entry.clear();
        if let Err(e) = self.write_dir_entry(dir, offset, &entry) {
            self.close_inode(child);
            return Err(e);
        }
        self.remove_inode(child);
        self.close_inode(child);
        Ok(child)
    }

    /// True iff no entry of `dir` is in use.
    pub(super) fn dir_is_empty(&mut self, dir: SectorNo) -> bool {
        let mut offset = 0;
        while let Some(entry) = self.read_dir_entry(dir, offset) {
            if entry.in_use() {
                return false;
            }
            offset += DIR_ENTRY_SIZE;
        }
        true
    }

    /// Advances the handle's cursor to the next in-use entry and returns
    /// its name; `None` at the end.
    pub fn dir_read_next(&mut self, dir: &mut Dir) -> Option<ArrayVec<u8, NAME_MAX>> {
        loop {
            let entry = self.read_dir_entry(dir.sector, dir.pos)?;
            dir.pos += DIR_ENTRY_SIZE;
            if entry.in_use() {
                let mut name = ArrayVec::new();
                name.try_extend_from_slice(entry.name()).unwrap();
                return Some(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;

    fn fresh_fs() -> Filesystem<MemDisk> {
        Filesystem::format(MemDisk::new(1024)).unwrap()
    }

    fn new_child(fs: &mut Filesystem<MemDisk>, dir: SectorNo) -> SectorNo {
        let sector = fs.alloc_sector().unwrap();
        fs.inode_create(sector, 0, false, dir).unwrap();
        sector
    }

    #[test]
    fn add_then_lookup() {
        let mut fs = fresh_fs();
        let root = SectorNo::ROOT_DIR;
        fs.open_inode(root).unwrap();
        let a = new_child(&mut fs, root);
        fs.dir_add(root, b"alpha", a).unwrap();
        assert_eq!(fs.dir_lookup(root, b"alpha"), Some((a, 0)));
        assert_eq!(fs.dir_lookup(root, b"beta"), None);
        // case-sensitive exact compare
        assert_eq!(fs.dir_lookup(root, b"Alpha"), None);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut fs = fresh_fs();
        let root = SectorNo::ROOT_DIR;
        fs.open_inode(root).unwrap();
        let a = new_child(&mut fs, root);
        let b = new_child(&mut fs, root);
        fs.dir_add(root, b"name", a).unwrap();
        assert_eq!(
            fs.dir_add(root, b"name", b),
            Err(KernelError::AlreadyExists)
        );
    }

    #[test]
    fn bad_names_are_rejected() {
        let mut fs = fresh_fs();
        let root = SectorNo::ROOT_DIR;
        fs.open_inode(root).unwrap();
        let a = new_child(&mut fs, root);
        assert_eq!(fs.dir_add(root, b"", a), Err(KernelError::InvalidName));
        assert_eq!(fs.dir_add(root, b".", a), Err(KernelError::InvalidName));
        assert_eq!(fs.dir_add(root, b"..", a), Err(KernelError::InvalidName));
        assert_eq!(fs.dir_add(root, b"a/b", a), Err(KernelError::InvalidName));
        assert_eq!(
            fs.dir_add(root, b"fifteen-letters", a),
            Err(KernelError::NameTooLong)
        );
    }

    #[test]
    fn removal_frees_the_slot_for_reuse() {
        let mut fs = fresh_fs();
        let root = SectorNo::ROOT_DIR;
        fs.open_inode(root).unwrap();
        let a = new_child(&mut fs, root);
        let b = new_child(&mut fs, root);
        let c = new_child(&mut fs, root);
        fs.dir_add(root, b"a", a).unwrap();
        fs.dir_add(root, b"b", b).unwrap();
        fs.dir_remove_entry(root, b"a").unwrap();
        // no compaction: the file still covers two entries
        assert_eq!(fs.inode_length(root), 2 * DIR_ENTRY_SIZE);
        // first free slot is reused
        fs.dir_add(root, b"c", c).unwrap();
        assert_eq!(fs.dir_lookup(root, b"c"), Some((c, 0)));
    }

    #[test]
    fn remove_then_recreate_same_name() {
        let mut fs = fresh_fs();
        let root = SectorNo::ROOT_DIR;
        fs.open_inode(root).unwrap();
        let a = new_child(&mut fs, root);
        fs.dir_add(root, b"f", a).unwrap();
        fs.dir_remove_entry(root, b"f").unwrap();
        assert_eq!(fs.dir_lookup(root, b"f"), None);
        let b = new_child(&mut fs, root);
        fs.dir_add(root, b"f", b).unwrap();
        assert_eq!(fs.dir_lookup(root, b"f"), Some((b, 0)));
    }

    #[test]
    fn non_empty_directory_cannot_be_removed() {
        let mut fs = fresh_fs();
        let root = SectorNo::ROOT_DIR;
        fs.open_inode(root).unwrap();
        let sub = fs.alloc_sector().unwrap();
        fs.inode_create(sub, 0, true, root).unwrap();
        fs.dir_add(root, b"sub", sub).unwrap();
        fs.open_inode(sub).unwrap();
        let inner = new_child(&mut fs, sub);
        fs.dir_add(sub, b"inner", inner).unwrap();

        assert_eq!(
            fs.dir_remove_entry(root, b"sub"),
            Err(KernelError::DirectoryNotEmpty)
        );
        fs.dir_remove_entry(sub, b"inner").unwrap();
        fs.dir_remove_entry(root, b"sub").unwrap();
        fs.close_inode(sub);
    }

    #[test]
    fn readdir_skips_free_slots() {
        let mut fs = fresh_fs();
        let root = SectorNo::ROOT_DIR;
        fs.open_inode(root).unwrap();
        for name in [&b"one"[..], b"two", b"three"] {
            let child = new_child(&mut fs, root);
            fs.dir_add(root, name, child).unwrap();
        }
        fs.dir_remove_entry(root, b"two").unwrap();

        let mut dir = Dir::from_open_inode(root);
        let mut seen = alloc::vec::Vec::new();
        while let Some(name) = fs.dir_read_next(&mut dir) {
            seen.push(name.to_vec());
        }
        assert_eq!(seen, [b"one".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn is_empty_ignores_cleared_slots() {
        let mut fs = fresh_fs();
        let root = SectorNo::ROOT_DIR;
        fs.open_inode(root).unwrap();
        assert!(fs.dir_is_empty(root));
        let a = new_child(&mut fs, root);
        fs.dir_add(root, b"a", a).unwrap();
        assert!(!fs.dir_is_empty(root));
        fs.dir_remove_entry(root, b"a").unwrap();
        assert!(fs.dir_is_empty(root));
    }
}
