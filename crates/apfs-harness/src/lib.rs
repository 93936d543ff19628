#![forbid(unsafe_code)]
//! Fixture builders for APFS tests and benchmarks.
//!
//! Everything here produces real, checksummed on-disk bytes through the
//! `apfs-ondisk` encoders: single B-tree nodes, whole multi-level trees,
//! object maps, checkpoint-map chains, superblocks, and complete container
//! images served from memory.

pub mod image;
pub mod node;
pub mod objects;

pub use image::{ContainerBuilder, ContainerImage, ContainerLayout, ImageBuilder, PlacedObject};
pub use node::{
    BuiltNode, BuiltTree, Entry, EntryLayout, NodeBuilder, TreeBuilder, omap_entries,
    snapshot_entries, u64_bytes, u64_entries,
};
pub use objects::{
    blank_superblock, checkpoint_chain, container_superblock, ephemeral_mapping, header,
    omap_object, raw_object, volume_superblock,
};
