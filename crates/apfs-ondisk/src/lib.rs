#![forbid(unsafe_code)]
//! On-disk format decoding for APFS objects.
//!
//! Pure parsing crate: no I/O, no side effects. Turns byte slices into typed
//! structures for object headers (with Fletcher-64 verification), B-tree
//! nodes and their table of contents, the object map and its records,
//! checkpoint mapping blocks, and the container superblock. Every decoder
//! takes the container [`Endian`](apfs_types::Endian) and reports
//! [`ParseError`](apfs_types::ParseError).

pub mod btree;
pub mod checkpoint;
pub mod object;
pub mod omap;
pub mod superblock;

pub use btree::{
    BTreeInfo, BTreeNode, BTreeNodeHeader, KvGeometry, NodeLocation, TocEntry,
};
pub use checkpoint::{CheckpointMapBlock, CheckpointMapping};
pub use object::{
    ObjectHeader, compute_object_checksum, fletcher64, seal_object, verify_checksum,
};
pub use omap::{OmapKey, OmapPhys, OmapSnapshot, OmapValue};
pub use superblock::ContainerSuperblock;
