//! Whole-image fixtures: a sparse block image and a container builder that
//! lays out a checkpoint, an object map, and the objects it maps.

use crate::node::{EntryLayout, TreeBuilder, omap_entries, snapshot_entries};
use crate::objects::{
    blank_superblock, checkpoint_chain, container_superblock, ephemeral_mapping, header,
    omap_object, raw_object, volume_superblock,
};
use anyhow::{Context, Result, bail, ensure};
use apfs_block::{ByteBlockSource, MemoryByteDevice};
use apfs_ondisk::omap::{OMAP_SNAPSHOT_KEY_SIZE, OMAP_SNAPSHOT_SIZE};
use apfs_ondisk::{CheckpointMapping, KvGeometry, OmapKey, OmapSnapshot, OmapValue};
use apfs_types::{
    BlockSize, Endian, OBJ_EPHEMERAL, OBJ_VIRTUAL, OBJECT_TYPE_FS, OBJECT_TYPE_INVALID,
    OBJECT_TYPE_OMAP_SNAPSHOT, OBJECT_TYPE_SPACEMAN, ObjectId, Paddr, StorageClass, Xid,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Sparse image ────────────────────────────────────────────────────────────

/// Block image assembled from individually placed objects; unset blocks
/// read as zeros.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    block_size: u32,
    block_count: u64,
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Place `bytes` at `paddr`, spilling into following blocks when longer
    /// than one block. A short final block is zero-padded.
    pub fn put(&mut self, paddr: Paddr, bytes: &[u8]) -> Result<()> {
        let block_size = self.block_size as usize;
        for (i, chunk) in bytes.chunks(block_size).enumerate() {
            let block = paddr.0 + u64::try_from(i).context("block index")?;
            ensure!(
                block < self.block_count,
                "block {block} beyond image of {} blocks",
                self.block_count
            );
            let mut padded = chunk.to_vec();
            padded.resize(block_size, 0);
            self.blocks.insert(block, padded);
        }
        Ok(())
    }

    /// Mutable access to an already placed block (for corruption tests).
    pub fn block_mut(&mut self, paddr: Paddr) -> Result<&mut Vec<u8>> {
        self.blocks
            .get_mut(&paddr.0)
            .with_context(|| format!("block {paddr} was never written"))
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        let block_size = self.block_size as usize;
        let total = usize::try_from(self.block_count)
            .ok()
            .and_then(|count| count.checked_mul(block_size))
            .context("image size overflows usize")?;
        let mut image = vec![0_u8; total];
        for (block, bytes) in self.blocks {
            let start = usize::try_from(block).context("block index")? * block_size;
            image[start..start + block_size].copy_from_slice(&bytes);
        }
        Ok(image)
    }

    pub fn into_source(self) -> Result<ByteBlockSource<MemoryByteDevice>> {
        let block_size = BlockSize::new(self.block_size)?;
        let bytes = self.into_bytes()?;
        Ok(ByteBlockSource::new(MemoryByteDevice::new(bytes), block_size)?)
    }
}

// ── Container layout ────────────────────────────────────────────────────────

pub const DESC_BASE: u64 = 1;
pub const DESC_BLOCKS: u32 = 16;
pub const DATA_BASE: u64 = DESC_BASE + DESC_BLOCKS as u64;
pub const DATA_BLOCKS: u32 = 16;

/// Where the container builder put an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedObject {
    pub oid: ObjectId,
    pub xid: Xid,
    pub paddr: Paddr,
}

/// Addresses of everything written by [`ContainerBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLayout {
    pub block_size: u32,
    pub block_count: u64,
    pub xid: Xid,
    pub omap: Paddr,
    pub omap_tree_root: Paddr,
    pub omap_tree_nodes: usize,
    pub snapshot_tree_root: Option<Paddr>,
    pub checkpoint_map_blocks: Vec<Paddr>,
    pub checkpoint_superblock: Paddr,
    pub older_checkpoint_superblock: Option<Paddr>,
    pub ephemeral: Vec<PlacedObject>,
    pub virtual_objects: Vec<PlacedObject>,
}

#[derive(Debug, Clone, Copy)]
struct VirtualSpec {
    oid: ObjectId,
    xid: Xid,
    object_type: u32,
    omap_flags: u32,
}

/// Synthesizes a small but complete container: block 0 superblock, a
/// checkpoint in the descriptor ring, ephemeral objects in the data area,
/// an object map with a physical mapping tree, and the virtual objects it
/// maps.
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    endian: Endian,
    block_size: u32,
    xid: u64,
    desc_start: u32,
    mappings_per_block: usize,
    omap_fanout: usize,
    older_checkpoint: bool,
    stale_block_zero: bool,
    ephemeral: Vec<(ObjectId, u32)>,
    virtual_objects: Vec<VirtualSpec>,
    volumes: Vec<ObjectId>,
    extra_mappings: Vec<(OmapKey, OmapValue)>,
    snapshots: Vec<(Xid, u32)>,
}

impl ContainerBuilder {
    #[must_use]
    pub fn new(endian: Endian) -> Self {
        Self {
            endian,
            block_size: 4096,
            xid: 10,
            desc_start: 0,
            mappings_per_block: 8,
            omap_fanout: 64,
            older_checkpoint: false,
            stale_block_zero: false,
            ephemeral: Vec::new(),
            virtual_objects: Vec::new(),
            volumes: Vec::new(),
            extra_mappings: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    #[must_use]
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Transaction id of the latest checkpoint.
    #[must_use]
    pub fn xid(mut self, xid: u64) -> Self {
        self.xid = xid;
        self
    }

    /// Ring slot where the latest checkpoint's first map block lives.
    #[must_use]
    pub fn desc_start(mut self, slot: u32) -> Self {
        self.desc_start = slot % DESC_BLOCKS;
        self
    }

    /// How many mappings go into each checkpoint-map block.
    #[must_use]
    pub fn mappings_per_block(mut self, count: usize) -> Self {
        self.mappings_per_block = count;
        self
    }

    #[must_use]
    pub fn omap_fanout(mut self, fanout: usize) -> Self {
        self.omap_fanout = fanout;
        self
    }

    /// Also write an older checkpoint (xid - 1) just before the latest one.
    #[must_use]
    pub fn older_checkpoint(mut self, enabled: bool) -> Self {
        self.older_checkpoint = enabled;
        self
    }

    /// Put the older checkpoint's superblock at block 0 instead of the latest.
    #[must_use]
    pub fn stale_block_zero(mut self, enabled: bool) -> Self {
        self.stale_block_zero = enabled;
        if enabled {
            self.older_checkpoint = true;
        }
        self
    }

    /// Ephemeral object of the given type, mapped by the checkpoint.
    #[must_use]
    pub fn ephemeral(mut self, oid: u64, object_type: u32) -> Self {
        self.ephemeral.push((ObjectId(oid), object_type));
        self
    }

    /// Volume superblock version; the first call per oid also lists the
    /// volume in `nx_fs_oid`.
    #[must_use]
    pub fn volume(mut self, oid: u64, xid: u64) -> Self {
        if !self.volumes.contains(&ObjectId(oid)) {
            self.volumes.push(ObjectId(oid));
        }
        self.virtual_object(oid, xid, OBJECT_TYPE_FS, 0)
    }

    /// Virtual object version with its omap entry carrying `omap_flags`.
    #[must_use]
    pub fn virtual_object(mut self, oid: u64, xid: u64, object_type: u32, omap_flags: u32) -> Self {
        self.virtual_objects.push(VirtualSpec {
            oid: ObjectId(oid),
            xid: Xid(xid),
            object_type,
            omap_flags,
        });
        self
    }

    /// Raw omap entry with no object behind it.
    #[must_use]
    pub fn mapping(mut self, key: OmapKey, value: OmapValue) -> Self {
        self.extra_mappings.push((key, value));
        self
    }

    /// Record in the omap snapshot tree.
    #[must_use]
    pub fn snapshot(mut self, xid: u64, flags: u32) -> Self {
        self.snapshots.push((Xid(xid), flags));
        self
    }

    pub fn build(&self) -> Result<ContainerImage> {
        ensure!(self.mappings_per_block > 0, "mappings_per_block must be positive");
        ensure!(self.xid > 1, "xid must leave room for an older checkpoint");
        let endian = self.endian;
        let bs = self.block_size as usize;
        if self.ephemeral.len() > DATA_BLOCKS as usize {
            bail!("at most {DATA_BLOCKS} ephemeral objects fit the data area");
        }

        let mut cursor = DATA_BASE + u64::from(DATA_BLOCKS);
        let mut pending: Vec<(Paddr, Vec<u8>)> = Vec::new();

        // Ephemeral objects in the checkpoint data area.
        let mut ephemeral = Vec::with_capacity(self.ephemeral.len());
        let mut mappings = Vec::with_capacity(self.ephemeral.len());
        for (i, (oid, object_type)) in self.ephemeral.iter().enumerate() {
            let paddr = Paddr(DATA_BASE + u64::try_from(i).context("ephemeral index")?);
            let bytes = raw_object(
                endian,
                bs,
                header(oid.0, self.xid, object_type | OBJ_EPHEMERAL, OBJECT_TYPE_INVALID),
                &oid.0.to_le_bytes(),
            )?;
            pending.push((paddr, bytes));
            mappings.push(ephemeral_mapping(*oid, *object_type, self.block_size, paddr));
            ephemeral.push(PlacedObject {
                oid: *oid,
                xid: Xid(self.xid),
                paddr,
            });
        }

        // Object map header, then its mapping tree.
        let omap_paddr = Paddr(cursor);
        cursor += 1;

        let mut virtual_objects = Vec::with_capacity(self.virtual_objects.len());
        let mut omap_records = self.extra_mappings.clone();
        let object_base = cursor + 1024;
        for (i, planned) in self.virtual_objects.iter().enumerate() {
            let paddr = Paddr(object_base + u64::try_from(i).context("object index")?);
            let bytes = if planned.object_type == OBJECT_TYPE_FS {
                let index = self
                    .volumes
                    .iter()
                    .position(|oid| *oid == planned.oid)
                    .unwrap_or(0);
                volume_superblock(
                    endian,
                    bs,
                    planned.oid,
                    planned.xid,
                    u32::try_from(index).context("volume index")?,
                )?
            } else {
                raw_object(
                    endian,
                    bs,
                    header(
                        planned.oid.0,
                        planned.xid.0,
                        planned.object_type | OBJ_VIRTUAL,
                        OBJECT_TYPE_INVALID,
                    ),
                    &planned.xid.0.to_le_bytes(),
                )?
            };
            pending.push((paddr, bytes));
            omap_records.push((
                OmapKey {
                    oid: planned.oid,
                    xid: planned.xid,
                },
                OmapValue {
                    flags: planned.omap_flags,
                    size: self.block_size,
                    paddr,
                },
            ));
            virtual_objects.push(PlacedObject {
                oid: planned.oid,
                xid: planned.xid,
                paddr,
            });
        }

        let tree = TreeBuilder::new(endian, bs, EntryLayout::Fixed(KvGeometry::OMAP))
            .storage(StorageClass::Physical)
            .xid(self.xid)
            .fanout(self.omap_fanout)
            .first_paddr(cursor)
            .build(&omap_entries(endian, &omap_records))
            .context("building omap tree")?;
        cursor += u64::try_from(tree.nodes.len()).context("node count")?;
        ensure!(cursor <= object_base, "omap tree collides with mapped objects");
        for node in &tree.nodes {
            pending.push((node.paddr, node.bytes.clone()));
        }

        let snapshot_tree = if self.snapshots.is_empty() {
            None
        } else {
            let records: Vec<(Xid, OmapSnapshot)> = self
                .snapshots
                .iter()
                .map(|(xid, flags)| {
                    (
                        *xid,
                        OmapSnapshot {
                            flags: *flags,
                            oid: ObjectId(0),
                        },
                    )
                })
                .collect();
            let geometry = KvGeometry {
                key_size: u32::try_from(OMAP_SNAPSHOT_KEY_SIZE).context("key size")?,
                value_size: u32::try_from(OMAP_SNAPSHOT_SIZE).context("value size")?,
            };
            let snaps = TreeBuilder::new(endian, bs, EntryLayout::Fixed(geometry))
                .storage(StorageClass::Physical)
                .subtype(OBJECT_TYPE_OMAP_SNAPSHOT)
                .xid(self.xid)
                .fanout(self.omap_fanout)
                .first_paddr(cursor)
                .build(&snapshot_entries(endian, &records))
                .context("building snapshot tree")?;
            cursor += u64::try_from(snaps.nodes.len()).context("node count")?;
            ensure!(cursor <= object_base, "snapshot tree collides with mapped objects");
            for node in &snaps.nodes {
                pending.push((node.paddr, node.bytes.clone()));
            }
            Some(snaps.root_paddr)
        };

        let latest_snapshot = self.snapshots.iter().map(|(xid, _)| *xid).max();
        pending.push((
            omap_paddr,
            omap_object(
                endian,
                bs,
                omap_paddr,
                self.xid,
                tree.root_paddr,
                snapshot_tree.map(|root| {
                    (
                        root,
                        u32::try_from(self.snapshots.len()).unwrap_or(u32::MAX),
                        latest_snapshot.unwrap_or(Xid(0)),
                    )
                }),
            )?,
        ));

        let block_count = object_base + u64::try_from(self.virtual_objects.len().max(1))?;

        // Latest checkpoint in the descriptor ring.
        let groups: Vec<Vec<CheckpointMapping>> = if mappings.is_empty() {
            vec![Vec::new()]
        } else {
            mappings
                .chunks(self.mappings_per_block)
                .map(<[CheckpointMapping]>::to_vec)
                .collect()
        };
        let map_blocks = u32::try_from(groups.len()).context("checkpoint block count")?;
        ensure!(
            map_blocks + 1 + if self.older_checkpoint { 2 } else { 0 } <= DESC_BLOCKS,
            "checkpoint does not fit the descriptor ring"
        );

        let mut superblock = blank_superblock(self.block_size, block_count, self.xid);
        superblock.xp_desc_blocks = DESC_BLOCKS;
        superblock.xp_data_blocks = DATA_BLOCKS;
        superblock.xp_desc_base = Paddr(DESC_BASE);
        superblock.xp_data_base = Paddr(DATA_BASE);
        superblock.xp_desc_index = self.desc_start;
        superblock.xp_desc_len = map_blocks + 1;
        superblock.xp_desc_next = (self.desc_start + map_blocks + 1) % DESC_BLOCKS;
        superblock.xp_data_index = 0;
        superblock.xp_data_len = u32::try_from(self.ephemeral.len()).context("data length")?;
        superblock.xp_data_next = superblock.xp_data_len % DATA_BLOCKS;
        superblock.spaceman_oid = self
            .ephemeral
            .iter()
            .find(|(_, object_type)| *object_type == OBJECT_TYPE_SPACEMAN)
            .map_or(ObjectId(0), |(oid, _)| *oid);
        superblock.omap_oid = omap_paddr;
        superblock.fs_oids.clone_from(&self.volumes);

        let map_paddrs: Vec<Paddr> = (0..map_blocks)
            .map(|i| superblock.checkpoint_desc_block(i))
            .collect::<Option<_>>()
            .context("descriptor ring address")?;
        let checkpoint_superblock = superblock
            .checkpoint_desc_block(map_blocks)
            .context("descriptor ring address")?;
        for (paddr, bytes) in map_paddrs.iter().zip(checkpoint_chain(
            endian, bs, self.xid, &map_paddrs, &groups, true,
        )?) {
            pending.push((*paddr, bytes));
        }
        let latest_bytes = container_superblock(endian, bs, &superblock)?;
        pending.push((checkpoint_superblock, latest_bytes.clone()));

        // Older checkpoint: one map block and a superblock in the two slots
        // preceding the latest checkpoint.
        let mut block_zero = latest_bytes;
        let mut older_checkpoint_superblock = None;
        if self.older_checkpoint {
            let older_xid = self.xid - 1;
            let map_slot = (self.desc_start + DESC_BLOCKS - 2) % DESC_BLOCKS;
            let mut older = superblock.clone();
            older.header.xid = Xid(older_xid);
            older.next_xid = Xid(self.xid);
            older.xp_desc_index = map_slot;
            older.xp_desc_len = 2;
            older.xp_desc_next = self.desc_start;
            let older_map = older.checkpoint_desc_block(0).context("descriptor ring address")?;
            let older_sb = older.checkpoint_desc_block(1).context("descriptor ring address")?;
            ensure!(
                mappings.len() <= apfs_ondisk::CheckpointMapBlock::capacity(bs),
                "older checkpoint needs a single map block"
            );
            let chain = checkpoint_chain(
                endian,
                bs,
                older_xid,
                &[older_map],
                &[mappings.clone()],
                true,
            )?;
            for bytes in chain {
                pending.push((older_map, bytes));
            }
            let older_bytes = container_superblock(endian, bs, &older)?;
            pending.push((older_sb, older_bytes.clone()));
            older_checkpoint_superblock = Some(older_sb);
            if self.stale_block_zero {
                block_zero = older_bytes;
            }
        }
        pending.push((Paddr(0), block_zero));

        let mut image = ImageBuilder::new(self.block_size, block_count);
        for (paddr, bytes) in &pending {
            image.put(*paddr, bytes)?;
        }

        Ok(ContainerImage {
            image,
            layout: ContainerLayout {
                block_size: self.block_size,
                block_count,
                xid: Xid(self.xid),
                omap: omap_paddr,
                omap_tree_root: tree.root_paddr,
                omap_tree_nodes: tree.nodes.len(),
                snapshot_tree_root: snapshot_tree,
                checkpoint_map_blocks: map_paddrs,
                checkpoint_superblock,
                older_checkpoint_superblock,
                ephemeral,
                virtual_objects,
            },
        })
    }
}

/// Output of [`ContainerBuilder::build`].
#[derive(Debug, Clone)]
pub struct ContainerImage {
    pub image: ImageBuilder,
    pub layout: ContainerLayout,
}

impl ContainerImage {
    pub fn into_source(self) -> Result<ByteBlockSource<MemoryByteDevice>> {
        self.image.into_source()
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        self.image.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_block::BlockSource;
    use apfs_ondisk::{ContainerSuperblock, verify_checksum};

    #[test]
    fn put_pads_and_bounds_checks() {
        let mut image = ImageBuilder::new(4096, 2);
        image.put(Paddr(1), &[7_u8; 10]).expect("put");
        assert!(image.put(Paddr(2), &[0_u8; 1]).is_err());
        let bytes = image.into_bytes().expect("bytes");
        assert_eq!(bytes.len(), 8192);
        assert_eq!(bytes[4096..4106], [7_u8; 10]);
        assert!(bytes[4106..].iter().all(|b| *b == 0));
    }

    #[test]
    fn container_layout_is_self_consistent() {
        let built = ContainerBuilder::new(Endian::Little)
            .ephemeral(0x400, OBJECT_TYPE_SPACEMAN)
            .volume(0x402, 5)
            .volume(0x402, 9)
            .build()
            .expect("build");
        let layout = built.layout.clone();
        assert_eq!(layout.ephemeral[0].paddr, Paddr(DATA_BASE));
        assert_eq!(layout.checkpoint_map_blocks, vec![Paddr(DESC_BASE)]);
        assert_eq!(layout.checkpoint_superblock, Paddr(DESC_BASE + 1));
        assert_eq!(layout.virtual_objects.len(), 2);

        let source = built.into_source().expect("source");
        let block0 = source.read_block(Paddr(0)).expect("block 0");
        assert!(verify_checksum(block0.as_slice(), Endian::Little));
        let sb = ContainerSuperblock::parse_from_block(block0.as_slice(), Endian::Little)
            .expect("superblock");
        assert_eq!(sb.omap_oid, layout.omap);
        assert_eq!(sb.spaceman_oid, ObjectId(0x400));
        assert_eq!(sb.volume_oids().collect::<Vec<_>>(), vec![ObjectId(0x402)]);
        assert_eq!(sb.xp_desc_len, 2);
    }

    #[test]
    fn stale_block_zero_points_at_older_checkpoint() {
        let built = ContainerBuilder::new(Endian::Big)
            .xid(20)
            .desc_start(4)
            .stale_block_zero(true)
            .build()
            .expect("build");
        let older = built.layout.older_checkpoint_superblock.expect("older");
        assert_eq!(older, Paddr(DESC_BASE + 3));
        let source = built.into_source().expect("source");
        let block0 = source.read_block(Paddr(0)).expect("block 0");
        let sb = ContainerSuperblock::parse_from_block(block0.as_slice(), Endian::Big)
            .expect("superblock");
        assert_eq!(sb.header.xid, Xid(19));
    }

    #[test]
    fn layout_serializes() {
        fn assert_serde<T: Serialize + for<'de> Deserialize<'de>>() {}
        assert_serde::<ContainerLayout>();
    }
}
