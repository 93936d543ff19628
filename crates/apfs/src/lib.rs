#![forbid(unsafe_code)]
//! Public API facade.
//!
//! Re-exports `apfs-core` through a stable external interface. Downstream
//! readers (volume and file-system layers, tools) depend on this crate.

pub use apfs_core::*;
