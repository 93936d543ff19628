//! Resolver configuration.

use apfs_btree::DEFAULT_MAX_DEPTH;
use apfs_types::Endian;
use serde::{Deserialize, Serialize};

/// Options controlling how objects are resolved.
///
/// The defaults suit any well-formed image. Tighten `max_tree_depth` or
/// `max_checkpoint_map_blocks` when reading untrusted images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// Force a byte order; `None` detects it from the superblock magic.
    pub endian: Option<Endian>,
    /// Decoded-node cache capacity. Zero disables the cache.
    pub node_cache_capacity: usize,
    pub node_cache_shards: usize,
    /// Levels below the root a lookup may descend before `TreeTooDeep`.
    pub max_tree_depth: u16,
    /// Longest checkpoint-map chain to follow; `None` uses the checkpoint's
    /// declared descriptor length.
    pub max_checkpoint_map_blocks: Option<u32>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            endian: None,
            node_cache_capacity: 1024,
            node_cache_shards: 16,
            max_tree_depth: DEFAULT_MAX_DEPTH,
            max_checkpoint_map_blocks: None,
        }
    }
}

impl ResolverOptions {
    /// Defaults with the node cache turned off.
    #[must_use]
    pub fn uncached() -> Self {
        Self {
            node_cache_capacity: 0,
            ..Self::default()
        }
    }
}
