//! Declared remote state and the per-poll reconciliation plan.

pub mod directive;
pub mod manager;

pub use directive::{RemoteStateDirective, StateError, SyncStrategy};
pub use manager::{filter_hierarchy, FsEntryStateManager};
