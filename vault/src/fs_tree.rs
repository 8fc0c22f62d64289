//! Concrete view of local filesystem trees: deterministic enumeration,
//! hierarchical CRC-32 hashing and bounded reads.

pub mod entry;
pub mod hash;

pub use entry::{ConcreteFsEntry, FsEntryKind, FsTree, LazyReader, INBAND_LIMIT};
