//! Sharded read-through cache of decoded B-tree nodes.
//!
//! Nodes are keyed by physical address. Committed blocks never change in
//! place, so a cached node stays valid for the lifetime of the image;
//! eviction is plain FIFO per shard.

use apfs_ondisk::BTreeNode;
use apfs_types::Paddr;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

#[derive(Debug, Default)]
struct CacheShard {
    nodes: HashMap<Paddr, Arc<BTreeNode>>,
    order: VecDeque<Paddr>,
}

/// Concurrent node cache; shard `i` holds addresses with `paddr % shards == i`.
///
/// A capacity of zero disables caching entirely: every lookup misses and
/// inserts are dropped.
#[derive(Debug)]
pub struct NodeCache {
    shards: Vec<RwLock<CacheShard>>,
    per_shard: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NodeCache {
    #[must_use]
    pub fn new(capacity: usize, shard_count: usize) -> Self {
        let (shards, per_shard) = if capacity == 0 {
            (Vec::new(), 0)
        } else {
            let shard_count = shard_count.clamp(1, capacity);
            let shards = (0..shard_count)
                .map(|_| RwLock::new(CacheShard::default()))
                .collect();
            (shards, capacity.div_ceil(shard_count))
        };
        Self {
            shards,
            per_shard,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache that never stores anything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.shards.is_empty()
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, paddr: Paddr) -> Option<&RwLock<CacheShard>> {
        let count = u64::try_from(self.shards.len()).ok().filter(|c| *c > 0)?;
        let index = usize::try_from(paddr.0 % count).ok()?;
        self.shards.get(index)
    }

    /// Look up `paddr`. A disabled cache always misses and counts nothing.
    pub fn get(&self, paddr: Paddr) -> Option<Arc<BTreeNode>> {
        let shard = self.shard(paddr)?;
        let found = shard.read().nodes.get(&paddr).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Insert a verified node. An address already present keeps its
    /// original entry.
    pub fn insert(&self, paddr: Paddr, node: Arc<BTreeNode>) {
        let Some(shard) = self.shard(paddr) else {
            return;
        };
        let mut guard = shard.write();
        if guard.nodes.contains_key(&paddr) {
            return;
        }
        guard.nodes.insert(paddr, node);
        guard.order.push_back(paddr);
        while guard.order.len() > self.per_shard {
            if let Some(evicted) = guard.order.pop_front() {
                guard.nodes.remove(&evicted);
                trace!(paddr = evicted.0, "node_cache_evict");
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().nodes.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut guard = shard.write();
            guard.nodes.clear();
            guard.order.clear();
        }
    }
}
