//! File system implementation.
//!
//! Four layers, bottom up:
//!   + Free map: bitmap allocator for raw disk sectors.
//!   + Inodes: index structure, extensible length, open-inode registry.
//!   + Directories: inode whose content is a packed array of entries.
//!   + Names: path resolution over directories.
//!
//! A [`Filesystem`] owns its block device, the in-memory free map and the
//! open-inode registry, and every method takes `&mut self`: the caller
//! (the system-call layer) serializes all access behind one lock, which is
//! also what keeps the registry consistent.
//!
//! On-disk layout: sector 0 is reserved (a zero sector pointer means
//! "unallocated"), sector 1 holds the free-map file's inode, sector 2 the
//! root directory's inode.

use alloc::{vec, vec::Vec};

use dataview::{Pod, PodMethods as _};
use opintos_fs_types::{DiskInode, SECTOR_SIZE, SectorNo};

use crate::{block::BlockDevice, error::KernelError};

mod directory;
mod file;
mod free_map;
mod inode;
mod path;

pub use self::{
    file::{Dir, File},
    free_map::FreeMap,
};

use self::inode::OpenInode;

/// One mounted file system.
pub struct Filesystem<D> {
    device: D,
    free_map: FreeMap,
    open_inodes: Vec<OpenInode>,
}

/// What a path resolves to.
pub enum FsNode {
    File(File),
    Dir(Dir),
}

impl<D: BlockDevice> Filesystem<D> {
    /// Writes a fresh, empty file system onto `device`.
    pub fn format(device: D) -> Result<Self, KernelError> {
        let total = device.sector_count();
        let mut fs = Self {
            device,
            free_map: FreeMap::new(total),
            open_inodes: Vec::new(),
        };
        fs.free_map.mark_used(0);
        fs.free_map.mark_used(SectorNo::FREE_MAP.value());
        fs.free_map.mark_used(SectorNo::ROOT_DIR.value());

        // The free-map file is fully preallocated so flushing it never
        // allocates (which would dirty the map being written).
        let map_len = fs.free_map.byte_len();
        fs.inode_create(SectorNo::FREE_MAP, map_len, false, SectorNo::ROOT_DIR)?;
        fs.inode_create(SectorNo::ROOT_DIR, 0, true, SectorNo::ROOT_DIR)?;
        fs.flush()?;
        Ok(fs)
    }

    /// Mounts a previously formatted device, loading the free map.
    pub fn mount(device: D) -> Result<Self, KernelError> {
        let total = device.sector_count();
        let mut fs = Self {
            device,
            free_map: FreeMap::new(total),
            open_inodes: Vec::new(),
        };
        fs.open_inode(SectorNo::FREE_MAP)?;
        let len = fs.inode_length(SectorNo::FREE_MAP);
        let mut bits = vec![0u8; len];
        let read = fs.inode_read_at(SectorNo::FREE_MAP, &mut bits, 0);
        fs.close_inode(SectorNo::FREE_MAP);
        if read != len {
            return Err(KernelError::NotFound);
        }
        fs.free_map = FreeMap::from_bytes(bits, total);
        Ok(fs)
    }

    /// Flushes the free map and gives the device back.
    pub fn unmount(mut self) -> Result<D, KernelError> {
        assert!(
            self.open_inodes.is_empty(),
            "unmounting with open inodes"
        );
        self.flush()?;
        Ok(self.device)
    }

    /// Writes the free map back through its file.
    pub fn flush(&mut self) -> Result<(), KernelError> {
        let bits = self.free_map.to_bytes();
        self.open_inode(SectorNo::FREE_MAP)?;
        let written = self.inode_write_at(SectorNo::FREE_MAP, &bits, 0);
        self.close_inode(SectorNo::FREE_MAP);
        if written != bits.len() {
            return Err(KernelError::NoFreeSectors);
        }
        Ok(())
    }

    /// Number of unallocated sectors.
    #[must_use]
    pub fn free_sectors(&self) -> u32 {
        self.free_map.count_free()
    }

    /// Creates a file of `initial_size` bytes at `path`.
    pub fn create_file(
        &mut self,
        cwd: &Dir,
        path: &[u8],
        initial_size: usize,
    ) -> Result<(), KernelError> {
        let (dir, name) = self.resolve_parent(cwd, path)?;
        let res = self.create_node(dir.sector, &name, initial_size, false);
        self.dir_close(dir);
        res
    }

    /// Creates an empty directory at `path`.
    pub fn make_dir(&mut self, cwd: &Dir, path: &[u8]) -> Result<(), KernelError> {
        let (dir, name) = self.resolve_parent(cwd, path)?;
        let res = self.create_node(dir.sector, &name, 0, true);
        self.dir_close(dir);
        res
    }

    fn create_node(
        &mut self,
        dir: SectorNo,
        name: &[u8],
        size: usize,
        is_dir: bool,
    ) -> Result<(), KernelError> {
        if self.dir_lookup(dir, name).is_some() {
            return Err(KernelError::AlreadyExists);
        }
        let sector = self.alloc_sector()?;
        if let Err(e) = self.inode_create(sector, size, is_dir, dir) {
            self.release_sector(sector);
            return Err(e);
        }
        if let Err(e) = self.dir_add(dir, name, sector) {
            let disk: DiskInode = self.read_pod(sector);
            self.release_inode_storage(&disk);
            self.release_sector(sector);
            return Err(e);
        }
        Ok(())
    }

    /// Opens whatever `path` names.
    pub fn open_node(&mut self, cwd: &Dir, path: &[u8]) -> Result<FsNode, KernelError> {
        if path::skip_elem(path).is_none() {
            // "" fails; "/" (and "///") is the root
            if path.first() == Some(&b'/') {
                return Ok(FsNode::Dir(self.open_root()?));
            }
            return Err(KernelError::NotFound);
        }
        let (dir, name) = self.resolve_parent(cwd, path)?;
        if &name[..] == b"." {
            return Ok(FsNode::Dir(dir));
        }
        if &name[..] == b".." {
            let parent = self.inode_parent(dir.sector);
            self.dir_close(dir);
            return Ok(FsNode::Dir(self.dir_open(parent)?));
        }
        let Some((child, _off)) = self.dir_lookup(dir.sector, &name) else {
            self.dir_close(dir);
            return Err(KernelError::NotFound);
        };
        self.dir_close(dir);
        self.open_inode(child)?;
        let is_dir = self.inode_is_dir(child);
        // hand the reference just taken to the returned handle
        if is_dir {
            Ok(FsNode::Dir(Dir::from_open_inode(child)))
        } else {
            Ok(FsNode::File(File::from_open_inode(child)))
        }
    }

    /// Removes the file or empty directory at `path`.
    pub fn remove(&mut self, cwd: &Dir, path: &[u8]) -> Result<(), KernelError> {
        let (dir, name) = self.resolve_parent(cwd, path)?;
        let res = self.dir_remove_entry(dir.sector, &name).map(|_| ());
        self.dir_close(dir);
        res
    }

    // Sector-level helpers.

    fn read_sector(&mut self, sector: SectorNo, buf: &mut [u8; SECTOR_SIZE]) {
        self.device.read(sector.value(), buf);
    }

    fn write_sector(&mut self, sector: SectorNo, buf: &[u8; SECTOR_SIZE]) {
        self.device.write(sector.value(), buf);
    }

    /// Reads a whole sector as a POD value.
    fn read_pod<T: Pod>(&mut self, sector: SectorNo) -> T {
        let mut value = T::zeroed();
        let buf: &mut [u8; SECTOR_SIZE] = value.as_bytes_mut().try_into().unwrap();
        self.device.read(sector.value(), buf);
        value
    }

    /// Writes a whole sector from a POD value.
    fn write_pod<T: Pod>(&mut self, sector: SectorNo, value: &T) {
        let buf: &[u8; SECTOR_SIZE] = value.as_bytes().try_into().unwrap();
        self.device.write(sector.value(), buf);
    }

    fn zero_sector(&mut self, sector: SectorNo) {
        self.write_sector(sector, &[0; SECTOR_SIZE]);
    }

    fn alloc_sector(&mut self) -> Result<SectorNo, KernelError> {
        let first = self
            .free_map
            .allocate(1)
            .ok_or(KernelError::NoFreeSectors)?;
        Ok(SectorNo::new(first))
    }

    /// Allocates a sector and zeroes it on disk.
    fn alloc_zeroed_sector(&mut self) -> Result<SectorNo, KernelError> {
        let sector = self.alloc_sector()?;
        self.zero_sector(sector);
        Ok(sector)
    }

    fn release_sector(&mut self, sector: SectorNo) {
        self.free_map.release(sector.value(), 1);
    }
}
