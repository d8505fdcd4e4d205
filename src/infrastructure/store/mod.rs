//! Part store adapters

mod fs_store;
mod memory;

pub use fs_store::FsPartStore;
pub use memory::MemoryPartStore;
