//! # Fabric Vault library
//!
//! Core of the fabric-vault control plane: a trusted Keeper process that
//! authenticates to untrusted Agents running on fabric nodes and keeps a
//! declared set of files and directory trees in sync on each of them. The
//! `vault-keeper` and `vault-agent` binaries are thin frontends over this
//! library.

pub mod agent;
pub mod event;
pub mod fs_tree;
pub mod keeper;
pub mod logging;
pub mod rpc;
pub mod state;
pub mod transport;
pub mod utils;
