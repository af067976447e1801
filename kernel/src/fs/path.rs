//! Path resolution.
//!
//! Two entry points, deliberately separate: [`Filesystem::resolve_dir`]
//! walks the whole path and yields the named directory;
//! [`Filesystem::resolve_parent`] stops one level early and yields the
//! containing directory plus the final name, which is what `create`,
//! `mkdir` and `remove` need.

use arrayvec::ArrayVec;
use opintos_fs_types::{NAME_MAX, SectorNo};

use crate::{block::BlockDevice, error::KernelError};

use super::{Dir, Filesystem};

/// Splits the next `/`-separated element off `path`.
///
/// Returns the element and the remainder with leading slashes stripped;
/// `None` if nothing is left.
pub(super) fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];
    let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let elem = &path[..end];
    let path = &path[end..];
    let next = path.iter().position(|&c| c != b'/').unwrap_or(path.len());
    Some((elem, &path[next..]))
}

impl<D: BlockDevice> Filesystem<D> {
    /// Opens the root directory.
    pub fn open_root(&mut self) -> Result<Dir, KernelError> {
        self.dir_open(SectorNo::ROOT_DIR)
    }

    /// Resolves `path` to a directory handle. Every element must name a
    /// directory; `.` is a no-op, `..` follows the parent link (the root
    /// is its own parent), a leading `/` restarts at the root.
    pub fn resolve_dir(&mut self, start: &Dir, path: &[u8]) -> Result<Dir, KernelError> {
        if path.is_empty() {
            return Err(KernelError::NotFound);
        }
        let mut cur = if path.first() == Some(&b'/') {
            self.open_root()?
        } else {
            self.dir_reopen(start)?
        };
        let mut rest = path;
        while let Some((name, r)) = skip_elem(rest) {
            rest = r;
            cur = self.step_into(cur, name)?;
        }
        Ok(cur)
    }

    /// Descends from `cur` into `name`, consuming `cur` either way.
    fn step_into(&mut self, cur: Dir, name: &[u8]) -> Result<Dir, KernelError> {
        if name == b"." {
            return Ok(cur);
        }
        if name == b".." {
            let parent = self.inode_parent(cur.sector);
            self.dir_close(cur);
            return self.dir_open(parent);
        }
        let Some((child, _off)) = self.dir_lookup(cur.sector, name) else {
            self.dir_close(cur);
            return Err(KernelError::NotFound);
        };
        self.dir_close(cur);
        self.dir_open(child)
    }

    /// Resolves all but the last element of `path`, returning the
    /// penultimate directory and the final name.
    pub fn resolve_parent(
        &mut self,
        start: &Dir,
        path: &[u8],
    ) -> Result<(Dir, ArrayVec<u8, NAME_MAX>), KernelError> {
        if skip_elem(path).is_none() {
            // empty, or nothing but slashes: there is no last element
            return Err(KernelError::NotFound);
        }
        let mut cur = if path.first() == Some(&b'/') {
            self.open_root()?
        } else {
            self.dir_reopen(start)?
        };
        let mut rest = path;
        loop {
            let (name, r) = skip_elem(rest).unwrap();
            if skip_elem(r).is_none() {
                if name.len() > NAME_MAX {
                    self.dir_close(cur);
                    return Err(KernelError::NameTooLong);
                }
                let mut out = ArrayVec::new();
                out.try_extend_from_slice(name).unwrap();
                return Ok((cur, out));
            }
            rest = r;
            cur = self.step_into(cur, name)?;
        }
    }
}
