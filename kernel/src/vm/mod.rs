//! Virtual memory: frame table, swap, supplemental page tables and the
//! page-fault path.

pub mod fault;
pub mod frame;
pub mod page;
pub mod pool;
pub mod swap;

pub use self::{
    page::{AddressSpace, FileBacking, PageDirectory, PageEntry, PageKind, SupPageTable},
    pool::{AllocFlags, FrameId, FramePool},
};
