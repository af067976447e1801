//! Open-file and open-directory handles.
//!
//! A handle owns one reference on an open inode plus a cursor. Handles are
//! not `Clone` and `close` takes them by value, so a reference cannot be
//! dropped twice; `reopen` takes a fresh reference instead.

use opintos_fs_types::SectorNo;

use crate::{block::BlockDevice, error::KernelError};

use super::Filesystem;

/// A per-open-instance cursor over a file inode.
#[derive(Debug)]
pub struct File {
    pub(super) sector: SectorNo,
    pub(super) pos: usize,
    pub(super) denies_write: bool,
}

/// A cursor over a directory inode, used by `readdir`.
#[derive(Debug)]
pub struct Dir {
    pub(super) sector: SectorNo,
    pub(super) pos: usize,
}

impl File {
    /// Wraps an inode reference the caller already holds.
    pub(super) fn from_open_inode(sector: SectorNo) -> Self {
        Self {
            sector,
            pos: 0,
            denies_write: false,
        }
    }

    #[must_use]
    pub fn sector(&self) -> SectorNo {
        self.sector
    }

    /// Sets the cursor.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Reads the cursor.
    #[must_use]
    pub fn tell(&self) -> usize {
        self.pos
    }
}

impl Dir {
    pub(super) fn from_open_inode(sector: SectorNo) -> Self {
        Self { sector, pos: 0 }
    }

    #[must_use]
    pub fn sector(&self) -> SectorNo {
        self.sector
    }
}

impl<D: BlockDevice> Filesystem<D> {
    /// Opens the file inode at `sector`.
    pub fn file_open(&mut self, sector: SectorNo) -> Result<File, KernelError> {
        self.open_inode(sector)?;
        if self.inode_is_dir(sector) {
            self.close_inode(sector);
            return Err(KernelError::IsADirectory);
        }
        Ok(File::from_open_inode(sector))
    }

    /// A fresh handle (cursor at 0) on the same inode.
    pub fn file_reopen(&mut self, file: &File) -> Result<File, KernelError> {
        self.open_inode(file.sector)?;
        Ok(File::from_open_inode(file.sector))
    }

    /// Drops the handle's inode reference, releasing its write denial.
    pub fn file_close(&mut self, mut file: File) {
        if file.denies_write {
            self.file_allow_write(&mut file);
        }
        self.close_inode(file.sector);
    }

    pub fn file_read(&mut self, file: &mut File, buf: &mut [u8]) -> usize {
        let n = self.inode_read_at(file.sector, buf, file.pos);
        file.pos += n;
        n
    }

    pub fn file_write(&mut self, file: &mut File, buf: &[u8]) -> usize {
        let n = self.inode_write_at(file.sector, buf, file.pos);
        file.pos += n;
        n
    }

    /// Cursor-independent read, used by the loader.
    pub fn file_read_at(&mut self, file: &File, buf: &mut [u8], offset: usize) -> usize {
        self.inode_read_at(file.sector, buf, offset)
    }

    /// Cursor-independent write.
    pub fn file_write_at(&mut self, file: &File, buf: &[u8], offset: usize) -> usize {
        self.inode_write_at(file.sector, buf, offset)
    }

    #[must_use]
    pub fn file_length(&self, file: &File) -> usize {
        self.inode_length(file.sector)
    }

    /// Rejects writes through any handle until re-allowed; brackets the
    /// lifetime of a running executable.
    pub fn file_deny_write(&mut self, file: &mut File) {
        if !file.denies_write {
            file.denies_write = true;
            self.deny_write_inode(file.sector);
        }
    }

    pub fn file_allow_write(&mut self, file: &mut File) {
        if file.denies_write {
            file.denies_write = false;
            self.allow_write_inode(file.sector);
        }
    }

    /// Marks the file's inode for deletion at last close.
    pub fn file_remove(&mut self, file: &File) {
        self.remove_inode(file.sector);
    }

    /// Opens the directory inode at `sector`.
    pub fn dir_open(&mut self, sector: SectorNo) -> Result<Dir, KernelError> {
        self.open_inode(sector)?;
        if !self.inode_is_dir(sector) {
            self.close_inode(sector);
            return Err(KernelError::NotADirectory);
        }
        Ok(Dir::from_open_inode(sector))
    }

    pub fn dir_reopen(&mut self, dir: &Dir) -> Result<Dir, KernelError> {
        self.open_inode(dir.sector)?;
        Ok(Dir::from_open_inode(dir.sector))
    }

    pub fn dir_close(&mut self, dir: Dir) {
        self.close_inode(dir.sector);
    }

    /// The parent directory of an open directory handle.
    pub fn dir_parent(&mut self, dir: &Dir) -> Result<Dir, KernelError> {
        let parent = self.inode_parent(dir.sector);
        self.dir_open(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::MemDisk, fs::FsNode};

    fn fs_with_file() -> (Filesystem<MemDisk>, File, Dir) {
        let mut fs = Filesystem::format(MemDisk::new(1024)).unwrap();
        let root = fs.open_root().unwrap();
        fs.create_file(&root, b"data", 0).unwrap();
        let FsNode::File(file) = fs.open_node(&root, b"data").unwrap() else {
            panic!("expected a file");
        };
        (fs, file, root)
    }

    #[test]
    fn cursor_advances_across_reads_and_writes() {
        let (mut fs, mut f, root) = fs_with_file();
        assert_eq!(fs.file_write(&mut f, b"hello world"), 11);
        assert_eq!(f.tell(), 11);
        f.seek(6);
        let mut buf = [0u8; 5];
        assert_eq!(fs.file_read(&mut f, &mut buf), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(f.tell(), 11);
        fs.file_close(f);
        fs.dir_close(root);
    }

    #[test]
    fn deny_write_is_per_inode_not_per_handle() {
        let (mut fs, mut f, root) = fs_with_file();
        let mut other = fs.file_reopen(&f).unwrap();
        fs.file_deny_write(&mut f);
        // the second handle is refused as well
        assert_eq!(fs.file_write(&mut other, b"x"), 0);
        fs.file_allow_write(&mut f);
        assert_eq!(fs.file_write(&mut other, b"x"), 1);
        fs.file_close(f);
        fs.file_close(other);
        fs.dir_close(root);
    }

    #[test]
    fn close_releases_write_denial() {
        let (mut fs, mut f, root) = fs_with_file();
        let sector = f.sector();
        fs.file_deny_write(&mut f);
        assert_eq!(fs.deny_write_count(sector), 1);
        let mut other = fs.file_reopen(&f).unwrap();
        fs.file_close(f);
        assert_eq!(fs.deny_write_count(sector), 0);
        assert_eq!(fs.file_write(&mut other, b"y"), 1);
        fs.file_close(other);
        fs.dir_close(root);
    }

    #[test]
    fn removed_file_stays_readable_until_last_close() {
        let (mut fs, mut f, root) = fs_with_file();
        fs.file_write(&mut f, b"persist");
        fs.remove(&root, b"data").unwrap();
        // the name is gone but the open handle still works
        assert!(fs.open_node(&root, b"data").is_err());
        let mut buf = [0u8; 7];
        assert_eq!(fs.file_read_at(&f, &mut buf, 0), 7);
        assert_eq!(&buf, b"persist");
        let sector = f.sector();
        fs.file_close(f);
        assert!(!fs.free_map.is_used(sector.value()));
        fs.dir_close(root);
    }

    #[test]
    fn create_remove_create_reuses_the_name() {
        let (mut fs, f, root) = fs_with_file();
        fs.file_close(f);
        fs.remove(&root, b"data").unwrap();
        fs.create_file(&root, b"data", 123).unwrap();
        let FsNode::File(f) = fs.open_node(&root, b"data").unwrap() else {
            panic!("expected a file");
        };
        assert_eq!(fs.file_length(&f), 123);
        fs.file_close(f);
        fs.dir_close(root);
    }

    #[test]
    fn opening_a_directory_as_file_fails() {
        let mut fs = Filesystem::format(MemDisk::new(1024)).unwrap();
        assert_eq!(
            fs.file_open(SectorNo::ROOT_DIR).unwrap_err(),
            KernelError::IsADirectory
        );
        assert_eq!(fs.open_count(SectorNo::ROOT_DIR), 0);
    }
}
