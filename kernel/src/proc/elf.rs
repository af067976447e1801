//! Format of a 32-bit ELF executable file.

use dataview::Pod;

/// "\x7FELF" in little endian.
pub const ELF_MAGIC: u32 = 0x464C_457F;

/// 32-bit objects.
pub const ELF_CLASS_32: u8 = 1;
/// Little-endian data encoding.
pub const ELF_DATA_LSB: u8 = 1;
/// The only defined ELF version.
pub const ELF_VERSION: u8 = 1;

/// Executable file.
pub const ET_EXEC: u16 = 2;
/// Intel 80386.
pub const EM_386: u16 = 3;

/// File header.
#[repr(C)]
#[derive(Debug, Clone, Pod)]
pub struct ElfHeader {
    pub magic: u32,
    /// Class, data encoding, ident version, then padding.
    pub ident: [u8; 12],
    pub ty: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Program header.
#[repr(C)]
#[derive(Debug, Clone, Pod)]
pub struct ProgramHeader {
    pub ty: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_SHLIB: u32 = 5;

bitflags::bitflags! {
    /// Segment permission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

impl ElfHeader {
    /// True for a little-endian 32-bit i386 executable we can load.
    #[must_use]
    pub fn is_loadable(&self) -> bool {
        self.magic == ELF_MAGIC
            && self.ident[0] == ELF_CLASS_32
            && self.ident[1] == ELF_DATA_LSB
            && self.ident[2] == ELF_VERSION
            && self.ty == ET_EXEC
            && self.machine == EM_386
            && self.version == 1
            && self.phentsize as usize == size_of::<ProgramHeader>()
            && self.phnum <= 1024
    }
}

const _: () = const {
    assert!(size_of::<ElfHeader>() == 52);
    assert!(size_of::<ProgramHeader>() == 32);
};

#[cfg(test)]
mod tests {
    use dataview::PodMethods as _;

    use super::*;

    fn loadable_header() -> ElfHeader {
        let mut h = ElfHeader::zeroed();
        h.magic = ELF_MAGIC;
        h.ident[0] = ELF_CLASS_32;
        h.ident[1] = ELF_DATA_LSB;
        h.ident[2] = ELF_VERSION;
        h.ty = ET_EXEC;
        h.machine = EM_386;
        h.version = 1;
        h.ehsize = size_of::<ElfHeader>() as u16;
        h.phentsize = size_of::<ProgramHeader>() as u16;
        h
    }

    #[test]
    fn recognizes_a_loadable_image() {
        assert!(loadable_header().is_loadable());
    }

    #[test]
    fn rejects_foreign_images() {
        let mut h = loadable_header();
        h.machine = 62; // x86-64
        assert!(!h.is_loadable());

        let mut h = loadable_header();
        h.ty = 1; // relocatable
        assert!(!h.is_loadable());

        let mut h = loadable_header();
        h.magic = 0xDEAD_BEEF;
        assert!(!h.is_loadable());

        let mut h = loadable_header();
        h.ident[1] = 2; // big endian
        assert!(!h.is_loadable());
    }

    #[test]
    fn headers_have_their_on_disk_sizes() {
        assert_eq!(size_of::<ElfHeader>(), 52);
        assert_eq!(size_of::<ProgramHeader>(), 32);
    }
}
