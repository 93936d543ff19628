//! B-tree node and whole-tree fixture builders.

use anyhow::{Context, Result, bail, ensure};
use apfs_ondisk::btree::{
    BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT, BTOFF_INVALID, BTREE_EPHEMERAL,
    BTREE_INFO_SIZE, BTREE_NODE_HEADER_SIZE, BTREE_PHYSICAL, KVLOC_SIZE, KVOFF_SIZE,
};
use apfs_ondisk::{
    BTreeInfo, BTreeNodeHeader, KvGeometry, NodeLocation, ObjectHeader, OmapKey, OmapSnapshot,
    OmapValue, seal_object,
};
use apfs_types::{
    Endian, OBJ_EPHEMERAL, OBJ_PHYSICAL, OBJ_VIRTUAL, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE,
    OBJECT_TYPE_OMAP, ObjectId, ObjectRef, Paddr, StorageClass, Xid,
};

/// How a node lays out its table of contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLayout {
    Fixed(KvGeometry),
    Variable,
}

/// Owned key/value pair as it will be written into a node.
pub type Entry = (Vec<u8>, Vec<u8>);

fn storage_flag(storage: StorageClass) -> u32 {
    match storage {
        StorageClass::Physical => OBJ_PHYSICAL,
        StorageClass::Virtual => OBJ_VIRTUAL,
        StorageClass::Ephemeral => OBJ_EPHEMERAL,
    }
}

fn tree_flags(storage: StorageClass) -> u32 {
    match storage {
        StorageClass::Physical => BTREE_PHYSICAL,
        StorageClass::Virtual => 0,
        StorageClass::Ephemeral => BTREE_EPHEMERAL,
    }
}

/// Builds one sealed B-tree node block.
///
/// Keys are packed forwards from the end of the TOC, values backwards from
/// the end of the value area, in entry order. Entries are written in the
/// order given; sorting is the caller's job.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    endian: Endian,
    node_size: usize,
    header: ObjectHeader,
    level: u16,
    root: bool,
    layout: EntryLayout,
    extra_flags: u16,
    info: Option<BTreeInfo>,
    entries: Vec<Entry>,
}

impl NodeBuilder {
    #[must_use]
    pub fn new(endian: Endian, node_size: usize) -> Self {
        Self {
            endian,
            node_size,
            header: ObjectHeader {
                checksum: 0,
                oid: ObjectId(0),
                xid: Xid(1),
                type_and_flags: OBJECT_TYPE_BTREE_NODE | OBJ_PHYSICAL,
                subtype: OBJECT_TYPE_OMAP,
            },
            level: 0,
            root: false,
            layout: EntryLayout::Variable,
            extra_flags: 0,
            info: None,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn object(mut self, oid: u64, xid: u64) -> Self {
        self.header.oid = ObjectId(oid);
        self.header.xid = Xid(xid);
        self
    }

    #[must_use]
    pub fn type_and_flags(mut self, type_and_flags: u32) -> Self {
        self.header.type_and_flags = type_and_flags;
        self
    }

    #[must_use]
    pub fn subtype(mut self, subtype: u32) -> Self {
        self.header.subtype = subtype;
        self
    }

    #[must_use]
    pub fn level(mut self, level: u16) -> Self {
        self.level = level;
        self
    }

    /// Mark as the tree root; a `btree_info_t` footer is written.
    #[must_use]
    pub fn root(mut self, root: bool) -> Self {
        self.root = root;
        self
    }

    #[must_use]
    pub fn layout(mut self, layout: EntryLayout) -> Self {
        self.layout = layout;
        self
    }

    /// OR extra `btn_flags` bits (hashed, no-header, ...) into the header.
    #[must_use]
    pub fn flags(mut self, flags: u16) -> Self {
        self.extra_flags |= flags;
        self
    }

    /// Override the root footer instead of deriving it from the entries.
    #[must_use]
    pub fn info(mut self, info: BTreeInfo) -> Self {
        self.info = Some(info);
        self
    }

    #[must_use]
    pub fn entry(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn entries(mut self, entries: impl IntoIterator<Item = Entry>) -> Self {
        self.entries.extend(entries);
        self
    }

    fn default_info(&self) -> Result<BTreeInfo> {
        let (key_size, val_size) = match self.layout {
            EntryLayout::Fixed(g) => (g.key_size, g.value_size),
            EntryLayout::Variable => (0, 0),
        };
        let longest_key = self.entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        let longest_val = self.entries.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        let storage = self
            .header
            .storage_class()
            .context("node header has both storage bits set")?;
        Ok(BTreeInfo {
            flags: tree_flags(storage),
            node_size: u32::try_from(self.node_size).context("node size")?,
            key_size,
            val_size,
            longest_key: u32::try_from(longest_key).context("longest key")?,
            longest_val: u32::try_from(longest_val).context("longest value")?,
            key_count: u64::try_from(self.entries.len()).context("key count")?,
            node_count: 1,
        })
    }

    /// Lay out, encode, and seal the node.
    pub fn build(&self) -> Result<Vec<u8>> {
        let is_leaf = self.level == 0;
        let entry_size = match self.layout {
            EntryLayout::Fixed(_) => KVOFF_SIZE,
            EntryLayout::Variable => KVLOC_SIZE,
        };
        let toc_len = self.entries.len() * entry_size;
        let val_end = if self.root {
            self.node_size
                .checked_sub(BTREE_INFO_SIZE)
                .context("node too small for info footer")?
        } else {
            self.node_size
        };
        let key_start = BTREE_NODE_HEADER_SIZE + toc_len;
        ensure!(key_start <= val_end, "table of contents overflows node");

        let mut block = vec![0_u8; self.node_size];
        let mut koff = 0_usize;
        let mut voff = 0_usize;
        for (idx, (key, value)) in self.entries.iter().enumerate() {
            if let EntryLayout::Fixed(geometry) = self.layout {
                ensure!(
                    key.len() == geometry.key_size as usize,
                    "entry {idx}: key is {} bytes, tree uses {}",
                    key.len(),
                    geometry.key_size
                );
                ensure!(
                    value.len() == geometry.value_len(is_leaf) as usize,
                    "entry {idx}: value is {} bytes, node expects {}",
                    value.len(),
                    geometry.value_len(is_leaf)
                );
            }

            let kpos = key_start + koff;
            let kend = kpos + key.len();
            voff += value.len();
            let Some(vpos) = val_end.checked_sub(voff) else {
                bail!("entry {idx}: values overflow node");
            };
            ensure!(kend <= vpos, "entry {idx}: keys and values collide");
            block[kpos..kend].copy_from_slice(key);
            block[vpos..vpos + value.len()].copy_from_slice(value);

            let toc = BTREE_NODE_HEADER_SIZE + idx * entry_size;
            let k_off = u16::try_from(koff).context("key offset")?;
            let v_off = u16::try_from(voff).context("value offset")?;
            match self.layout {
                EntryLayout::Fixed(_) => {
                    self.endian.put_u16(&mut block, toc, k_off)?;
                    self.endian.put_u16(&mut block, toc + 2, v_off)?;
                }
                EntryLayout::Variable => {
                    let k_len = u16::try_from(key.len()).context("key length")?;
                    let v_len = u16::try_from(value.len()).context("value length")?;
                    self.endian.put_u16(&mut block, toc, k_off)?;
                    self.endian.put_u16(&mut block, toc + 2, k_len)?;
                    self.endian.put_u16(&mut block, toc + 4, v_off)?;
                    self.endian.put_u16(&mut block, toc + 6, v_len)?;
                }
            }
            koff += key.len();
        }

        let free_len = val_end - key_start - koff - voff;
        let mut flags = self.extra_flags;
        if self.root {
            flags |= BTNODE_ROOT;
        }
        if is_leaf {
            flags |= BTNODE_LEAF;
        }
        if matches!(self.layout, EntryLayout::Fixed(_)) {
            flags |= BTNODE_FIXED_KV_SIZE;
        }

        let header = BTreeNodeHeader {
            object: self.header,
            flags,
            level: self.level,
            nkeys: u32::try_from(self.entries.len()).context("key count")?,
            table_space: NodeLocation {
                off: 0,
                len: u16::try_from(toc_len).context("toc length")?,
            },
            free_space: NodeLocation {
                off: u16::try_from(koff).context("free space offset")?,
                len: u16::try_from(free_len).context("free space length")?,
            },
            key_free_list: NodeLocation {
                off: BTOFF_INVALID,
                len: 0,
            },
            val_free_list: NodeLocation {
                off: BTOFF_INVALID,
                len: 0,
            },
        };
        header.encode_into(&mut block, self.endian)?;

        if self.root {
            let info = match self.info {
                Some(info) => info,
                None => self.default_info()?,
            };
            info.encode_into(&mut block[val_end..], self.endian)?;
        }

        seal_object(&mut block, self.endian)?;
        Ok(block)
    }
}

/// One node produced by [`TreeBuilder`].
#[derive(Debug, Clone)]
pub struct BuiltNode {
    pub oid: ObjectId,
    pub paddr: Paddr,
    pub level: u16,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BuiltTree {
    pub storage: StorageClass,
    pub root_oid: ObjectId,
    pub root_paddr: Paddr,
    /// Level of the root node (0 for a single-leaf tree).
    pub root_level: u16,
    /// Every node, children before parents; the root is last.
    pub nodes: Vec<BuiltNode>,
}

impl BuiltTree {
    /// Reference to the root as a resolver would be asked for it.
    #[must_use]
    pub fn root_ref(&self, xid: Xid) -> ObjectRef {
        match self.storage {
            StorageClass::Physical => ObjectRef::Physical(self.root_paddr),
            StorageClass::Virtual => ObjectRef::Virtual {
                oid: self.root_oid,
                xid,
            },
            StorageClass::Ephemeral => ObjectRef::Ephemeral(self.root_oid),
        }
    }
}

/// Builds a complete multi-level tree bottom-up from sorted entries.
///
/// Leaves hold up to `fanout` entries; each index level holds up to `fanout`
/// children keyed by their first key. Nodes get consecutive physical
/// addresses from `first_paddr` (and, for non-physical trees, consecutive
/// oids from `first_oid`).
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    endian: Endian,
    node_size: usize,
    layout: EntryLayout,
    storage: StorageClass,
    subtype: u32,
    xid: u64,
    fanout: usize,
    first_oid: u64,
    first_paddr: u64,
}

impl TreeBuilder {
    #[must_use]
    pub fn new(endian: Endian, node_size: usize, layout: EntryLayout) -> Self {
        Self {
            endian,
            node_size,
            layout,
            storage: StorageClass::Physical,
            subtype: OBJECT_TYPE_OMAP,
            xid: 1,
            fanout: 64,
            first_oid: 0x1000,
            first_paddr: 1,
        }
    }

    #[must_use]
    pub fn storage(mut self, storage: StorageClass) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn subtype(mut self, subtype: u32) -> Self {
        self.subtype = subtype;
        self
    }

    #[must_use]
    pub fn xid(mut self, xid: u64) -> Self {
        self.xid = xid;
        self
    }

    #[must_use]
    pub fn fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub fn first_oid(mut self, oid: u64) -> Self {
        self.first_oid = oid;
        self
    }

    #[must_use]
    pub fn first_paddr(mut self, paddr: u64) -> Self {
        self.first_paddr = paddr;
        self
    }

    pub fn build(&self, entries: &[Entry]) -> Result<BuiltTree> {
        ensure!(self.fanout >= 2, "fanout must be at least 2");

        let mut groups: Vec<Vec<Entry>> = if entries.is_empty() {
            vec![Vec::new()]
        } else {
            entries.chunks(self.fanout).map(<[Entry]>::to_vec).collect()
        };
        let mut nodes = Vec::new();
        let mut level = 0_u16;
        let mut next = 0_u64;

        loop {
            let is_root = groups.len() == 1;
            let mut parents = Vec::with_capacity(groups.len());
            for group in groups {
                let paddr = Paddr(self.first_paddr + next);
                let oid = match self.storage {
                    StorageClass::Physical => ObjectId(paddr.0),
                    StorageClass::Virtual | StorageClass::Ephemeral => {
                        ObjectId(self.first_oid + next)
                    }
                };
                next += 1;

                let object_type = if is_root {
                    OBJECT_TYPE_BTREE
                } else {
                    OBJECT_TYPE_BTREE_NODE
                };
                let first_key = group.first().map(|(k, _)| k.clone()).unwrap_or_default();
                let mut builder = NodeBuilder::new(self.endian, self.node_size)
                    .object(oid.0, self.xid)
                    .type_and_flags(object_type | storage_flag(self.storage))
                    .subtype(self.subtype)
                    .level(level)
                    .root(is_root)
                    .layout(self.layout)
                    .entries(group);
                if is_root {
                    let (key_size, val_size) = match self.layout {
                        EntryLayout::Fixed(g) => (g.key_size, g.value_size),
                        EntryLayout::Variable => (0, 0),
                    };
                    builder = builder.info(BTreeInfo {
                        flags: tree_flags(self.storage),
                        node_size: u32::try_from(self.node_size).context("node size")?,
                        key_size,
                        val_size,
                        longest_key: entries
                            .iter()
                            .map(|(k, _)| u32::try_from(k.len()).unwrap_or(u32::MAX))
                            .max()
                            .unwrap_or(0),
                        longest_val: entries
                            .iter()
                            .map(|(_, v)| u32::try_from(v.len()).unwrap_or(u32::MAX))
                            .max()
                            .unwrap_or(0),
                        key_count: u64::try_from(entries.len()).context("key count")?,
                        node_count: u64::try_from(nodes.len() + 1).context("node count")?,
                    });
                }
                let bytes = builder
                    .build()
                    .with_context(|| format!("building node at level {level}"))?;

                let mut pointer = vec![0_u8; 8];
                self.endian.put_u64(&mut pointer, 0, oid.0)?;
                parents.push((first_key, pointer));
                nodes.push(BuiltNode {
                    oid,
                    paddr,
                    level,
                    bytes,
                });
            }

            if is_root {
                let root = nodes.last().context("tree has no nodes")?;
                return Ok(BuiltTree {
                    storage: self.storage,
                    root_oid: root.oid,
                    root_paddr: root.paddr,
                    root_level: level,
                    nodes,
                });
            }
            level += 1;
            groups = parents.chunks(self.fanout).map(<[Entry]>::to_vec).collect();
        }
    }
}

// ── Entry encoders ──────────────────────────────────────────────────────────

/// Encode omap mappings, sorted by (oid, xid).
#[must_use]
pub fn omap_entries(endian: Endian, mappings: &[(OmapKey, OmapValue)]) -> Vec<Entry> {
    let mut sorted = mappings.to_vec();
    sorted.sort_by_key(|(key, _)| *key);
    sorted
        .iter()
        .map(|(key, value)| (key.encode(endian).to_vec(), value.encode(endian).to_vec()))
        .collect()
}

/// Encode snapshot-tree records (`xid -> omap_snapshot_t`), sorted by xid.
#[must_use]
pub fn snapshot_entries(endian: Endian, snapshots: &[(Xid, OmapSnapshot)]) -> Vec<Entry> {
    let mut sorted = snapshots.to_vec();
    sorted.sort_by_key(|(xid, _)| *xid);
    sorted
        .iter()
        .map(|(xid, snap)| (u64_bytes(endian, xid.0), snap.encode(endian).to_vec()))
        .collect()
}

/// Encode plain `u64 -> u64` records, sorted by key.
#[must_use]
pub fn u64_entries(endian: Endian, pairs: &[(u64, u64)]) -> Vec<Entry> {
    let mut sorted = pairs.to_vec();
    sorted.sort_by_key(|(key, _)| *key);
    sorted
        .iter()
        .map(|(key, value)| (u64_bytes(endian, *key), u64_bytes(endian, *value)))
        .collect()
}

#[must_use]
pub fn u64_bytes(endian: Endian, value: u64) -> Vec<u8> {
    match endian {
        Endian::Little => value.to_le_bytes().to_vec(),
        Endian::Big => value.to_be_bytes().to_vec(),
    }
}
