//! Object resolution across the three addressing spaces.

use crate::checkpoint::CheckpointMap;
use crate::omap::ObjectMap;
use crate::options::ResolverOptions;
use crate::verify_object;
use apfs_block::BlockSource;
use apfs_btree::{
    BTreeNavigator, KeyComparer, LoadedNode, NodeCache, NodeSource, parse_to_apfs_error,
};
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{BTreeNode, ObjectHeader, OmapValue};
use apfs_types::{
    Endian, OBJ_HEADER_SIZE, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE, ObjectId, ObjectRef, Paddr,
    StorageClass, Xid,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A verified object and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedObject {
    pub reference: ObjectRef,
    pub paddr: Paddr,
    pub header: ObjectHeader,
    /// The whole object, header included.
    pub bytes: Vec<u8>,
}

impl ResolvedObject {
    /// Bytes following the 32-byte object header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.bytes.get(OBJ_HEADER_SIZE..).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    paddr: Paddr,
    blocks: u32,
}

/// Resolves object references to verified bytes against one checkpoint.
///
/// Physical references are read as-is, virtual ones through the bound
/// [`ObjectMap`], ephemeral ones through the bound [`CheckpointMap`]. The
/// resolver is also the [`NodeSource`] for every tree it walks, so decoded
/// nodes land in one shared [`NodeCache`].
///
/// `resolve` takes `&self` and holds no lock across I/O; one resolver can
/// serve many threads when `S` allows concurrent reads.
#[derive(Debug)]
pub struct AddressResolver<S> {
    source: S,
    endian: Endian,
    options: ResolverOptions,
    cache: NodeCache,
    object_map: Option<ObjectMap>,
    checkpoint_map: Option<CheckpointMap>,
}

impl<S: BlockSource> AddressResolver<S> {
    pub fn new(source: S, endian: Endian, options: ResolverOptions) -> Self {
        let cache = NodeCache::new(options.node_cache_capacity, options.node_cache_shards);
        debug!(
            endian = ?endian,
            block_size = source.block_size(),
            block_count = source.block_count(),
            cache_capacity = options.node_cache_capacity,
            cache_shards = cache.shard_count(),
            "resolver_open"
        );
        Self {
            source,
            endian,
            options,
            cache,
            object_map: None,
            checkpoint_map: None,
        }
    }

    /// Bind the object map used for virtual references.
    #[must_use]
    pub fn with_object_map(mut self, object_map: ObjectMap) -> Self {
        self.object_map = Some(object_map.with_max_depth(self.options.max_tree_depth));
        self
    }

    /// Bind the checkpoint map used for ephemeral references.
    #[must_use]
    pub fn with_checkpoint_map(mut self, checkpoint_map: CheckpointMap) -> Self {
        self.checkpoint_map = Some(checkpoint_map);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    #[must_use]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    #[must_use]
    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    #[must_use]
    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    #[must_use]
    pub fn object_map(&self) -> Option<&ObjectMap> {
        self.object_map.as_ref()
    }

    #[must_use]
    pub fn checkpoint_map(&self) -> Option<&CheckpointMap> {
        self.checkpoint_map.as_ref()
    }

    /// Navigator over trees whose nodes this resolver can reach.
    pub fn navigator<C: KeyComparer>(&self, comparer: C) -> BTreeNavigator<&Self, C> {
        BTreeNavigator::new(self, comparer).with_max_depth(self.options.max_tree_depth)
    }

    /// Resolve `reference` to the verified bytes of the object it names.
    pub fn resolve(&self, reference: ObjectRef) -> Result<ResolvedObject> {
        let placement = self.place(reference)?;
        let bytes = self.read_placed(placement)?;
        verify_object(&bytes, self.endian, placement.paddr, &reference.to_string())?;
        let header = ObjectHeader::parse(&bytes, self.endian)
            .map_err(|e| parse_to_apfs_error(placement.paddr.0, &e))?;
        check_identity(reference, placement.paddr, &header)?;
        trace!(
            reference = %reference,
            paddr = placement.paddr.0,
            object_type = header.type_name(),
            "object_resolved"
        );
        Ok(ResolvedObject {
            reference,
            paddr: placement.paddr,
            header,
            bytes,
        })
    }

    /// The raw object-map record for `oid` at `xid`, flags included.
    ///
    /// Unlike [`resolve`](Self::resolve), a deleted mapping is returned
    /// rather than reported as absent.
    pub fn lookup_mapping(&self, oid: ObjectId, xid: Xid) -> Result<OmapValue> {
        reject_reserved(oid)?;
        self.bound_object_map()?.resolve(self, oid, xid)
    }

    fn bound_object_map(&self) -> Result<&ObjectMap> {
        self.object_map.as_ref().ok_or_else(|| {
            ApfsError::UnsupportedFeature("virtual object without an object map".to_owned())
        })
    }

    fn place(&self, reference: ObjectRef) -> Result<Placement> {
        match reference {
            ObjectRef::Physical(paddr) => {
                if paddr.0 == 0 {
                    return Err(ApfsError::ReservedObjectId { oid: 0 });
                }
                Ok(Placement { paddr, blocks: 1 })
            }
            ObjectRef::Virtual { oid, xid } => {
                let value = self.lookup_mapping(oid, xid)?;
                if value.is_deleted() {
                    return Err(ApfsError::KeyNotFound(format!(
                        "{reference} deleted at or before xid {xid}"
                    )));
                }
                if value.is_encrypted() {
                    return Err(ApfsError::UnsupportedFeature(format!(
                        "{reference} is encrypted"
                    )));
                }
                if value.has_no_header() {
                    return Err(ApfsError::UnsupportedFeature(format!(
                        "{reference} is stored without an object header"
                    )));
                }
                Ok(Placement {
                    paddr: value.paddr,
                    blocks: self.blocks_for(value.size, value.paddr)?,
                })
            }
            ObjectRef::Ephemeral(oid) => {
                reject_reserved(oid)?;
                let map = self.checkpoint_map.as_ref().ok_or_else(|| {
                    ApfsError::UnsupportedFeature(
                        "ephemeral object without a checkpoint map".to_owned(),
                    )
                })?;
                let mapping = map.resolve(&self.source, oid)?;
                Ok(Placement {
                    paddr: mapping.paddr,
                    blocks: self.blocks_for(mapping.size, mapping.paddr)?,
                })
            }
        }
    }

    fn blocks_for(&self, size: u32, paddr: Paddr) -> Result<u32> {
        let block_size = self.source.block_size();
        let blocks = size.div_ceil(block_size.max(1));
        if blocks == 0 {
            return Err(ApfsError::CorruptObject {
                block: paddr.0,
                detail: "mapped object has zero size".to_owned(),
            });
        }
        Ok(blocks)
    }

    fn read_placed(&self, placement: Placement) -> Result<Vec<u8>> {
        let buf = if placement.blocks == 1 {
            self.source.read_block(placement.paddr)?
        } else {
            self.source.read_block_range(placement.paddr, placement.blocks)?
        };
        Ok(buf.into_inner())
    }
}

/// The header must name the object that was asked for: the block
/// address for physical objects, the oid (and a version not after the
/// requested xid) otherwise.
fn check_identity(reference: ObjectRef, paddr: Paddr, header: &ObjectHeader) -> Result<()> {
    let mismatch = match reference {
        ObjectRef::Physical(expected) => (header.oid.0 != expected.0)
            .then(|| format!("header oid {} at physical block {expected}", header.oid)),
        ObjectRef::Virtual { oid, xid } => {
            if header.oid != oid {
                Some(format!("header oid {} for {reference}", header.oid))
            } else if header.xid > xid {
                Some(format!("header xid {} is newer than {reference}", header.xid))
            } else if header.storage_class() != Some(StorageClass::Virtual) {
                Some(format!("{reference} is not stored as a virtual object"))
            } else {
                None
            }
        }
        ObjectRef::Ephemeral(oid) => {
            if header.oid != oid {
                Some(format!("header oid {} for {reference}", header.oid))
            } else if header.storage_class() != Some(StorageClass::Ephemeral) {
                Some(format!("{reference} is not stored as an ephemeral object"))
            } else {
                None
            }
        }
    };
    match mismatch {
        None => Ok(()),
        Some(detail) => {
            warn!(
                block = paddr.0,
                reference = %reference,
                header_oid = header.oid.0,
                header_xid = header.xid.0,
                "object_identity_mismatch"
            );
            Err(ApfsError::CorruptObject {
                block: paddr.0,
                detail,
            })
        }
    }
}

fn reject_reserved(oid: ObjectId) -> Result<()> {
    if oid.is_reserved() {
        return Err(ApfsError::ReservedObjectId { oid: oid.0 });
    }
    Ok(())
}

impl<S: BlockSource> NodeSource for AddressResolver<S> {
    fn read_node(&self, reference: ObjectRef) -> Result<LoadedNode> {
        let placement = self.place(reference)?;
        let paddr = placement.paddr;

        if let Some(node) = self.cache.get(paddr) {
            check_identity(reference, paddr, node.object())?;
            return Ok(LoadedNode { paddr, node });
        }

        let bytes = self.read_placed(placement)?;
        verify_object(&bytes, self.endian, paddr, "B-tree node")?;
        let node =
            BTreeNode::parse(bytes, self.endian).map_err(|e| parse_to_apfs_error(paddr.0, &e))?;
        check_identity(reference, paddr, node.object())?;
        let type_code = node.object().type_code();
        if type_code != OBJECT_TYPE_BTREE && type_code != OBJECT_TYPE_BTREE_NODE {
            return Err(ApfsError::CorruptObject {
                block: paddr.0,
                detail: format!(
                    "{reference} is a {} object, not a B-tree node",
                    node.object().type_name()
                ),
            });
        }

        let node = Arc::new(node);
        self.cache.insert(paddr, Arc::clone(&node));
        Ok(LoadedNode { paddr, node })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_block::{ByteBlockSource, MemoryByteDevice};
    use apfs_harness::{ContainerBuilder, ContainerImage};
    use apfs_ondisk::ContainerSuperblock;
    use apfs_types::{OBJECT_TYPE_FS, OBJECT_TYPE_SPACEMAN};

    type MemSource = ByteBlockSource<MemoryByteDevice>;

    fn bind(built: ContainerImage, options: ResolverOptions) -> AddressResolver<MemSource> {
        let endian = Endian::Little;
        let source = built.into_source().expect("source");
        let block0 = source.read_block(Paddr(0)).expect("block 0");
        let sb = ContainerSuperblock::parse_from_block(block0.as_slice(), endian).expect("sb");
        let omap = ObjectMap::open(&source, sb.omap_oid, endian).expect("omap");
        let cpm = CheckpointMap::from_superblock(&sb, endian, None).expect("checkpoint map");
        AddressResolver::new(source, endian, options)
            .with_object_map(omap)
            .with_checkpoint_map(cpm)
    }

    fn sample() -> ContainerImage {
        ContainerBuilder::new(Endian::Little)
            .ephemeral(0x400, OBJECT_TYPE_SPACEMAN)
            .volume(0x402, 4)
            .volume(0x402, 8)
            .build()
            .expect("build")
    }

    #[test]
    fn resolves_each_storage_class() {
        let built = sample();
        let layout = built.layout.clone();
        let resolver = bind(built, ResolverOptions::default());

        let omap = resolver
            .resolve(ObjectRef::Physical(layout.omap))
            .expect("physical");
        assert_eq!(omap.paddr, layout.omap);

        let volume = resolver
            .resolve(ObjectRef::Virtual {
                oid: ObjectId(0x402),
                xid: Xid(6),
            })
            .expect("virtual");
        assert_eq!(volume.header.xid, Xid(4));
        assert_eq!(volume.header.type_code(), OBJECT_TYPE_FS);

        let spaceman = resolver
            .resolve(ObjectRef::Ephemeral(ObjectId(0x400)))
            .expect("ephemeral");
        assert_eq!(spaceman.paddr, layout.ephemeral[0].paddr);
        assert_eq!(spaceman.payload()[..8], 0x400_u64.to_le_bytes());
    }

    #[test]
    fn reserved_references_are_rejected() {
        let resolver = bind(sample(), ResolverOptions::default());
        for reference in [
            ObjectRef::Physical(Paddr(0)),
            ObjectRef::Virtual {
                oid: ObjectId(0),
                xid: Xid(1),
            },
            ObjectRef::Virtual {
                oid: ObjectId(1023),
                xid: Xid::LATEST,
            },
            ObjectRef::Ephemeral(ObjectId(1)),
        ] {
            let err = resolver.resolve(reference).unwrap_err();
            assert!(
                matches!(err, ApfsError::ReservedObjectId { .. }),
                "{reference}: {err:?}"
            );
        }
    }

    #[test]
    fn unbound_maps_are_unsupported() {
        let source = sample().into_source().expect("source");
        let resolver = AddressResolver::new(source, Endian::Little, ResolverOptions::default());
        let virtual_ref = ObjectRef::Virtual {
            oid: ObjectId(0x402),
            xid: Xid::LATEST,
        };
        assert!(matches!(
            resolver.resolve(virtual_ref).unwrap_err(),
            ApfsError::UnsupportedFeature(_)
        ));
        assert!(matches!(
            resolver
                .resolve(ObjectRef::Ephemeral(ObjectId(0x400)))
                .unwrap_err(),
            ApfsError::UnsupportedFeature(_)
        ));
    }

    #[test]
    fn physical_identity_is_checked() {
        let built = sample();
        let layout = built.layout.clone();
        let resolver = bind(built, ResolverOptions::default());
        // The volume object carries its virtual oid, not its address.
        let err = resolver
            .resolve(ObjectRef::Physical(layout.virtual_objects[0].paddr))
            .unwrap_err();
        assert!(matches!(err, ApfsError::CorruptObject { .. }));
    }

    #[test]
    fn non_node_objects_are_not_nodes() {
        let built = sample();
        let layout = built.layout.clone();
        let resolver = bind(built, ResolverOptions::default());
        let err = resolver
            .read_node(ObjectRef::Physical(layout.omap))
            .unwrap_err();
        assert!(matches!(err, ApfsError::CorruptObject { .. }));
    }

    #[test]
    fn tree_nodes_are_cached_by_address() {
        let built = sample();
        let layout = built.layout.clone();
        let resolver = bind(built, ResolverOptions::default());
        let root = ObjectRef::Physical(layout.omap_tree_root);

        let first = resolver.read_node(root).expect("first read");
        assert_eq!(resolver.cache().misses(), 1);
        let second = resolver.read_node(root).expect("second read");
        assert_eq!(resolver.cache().hits(), 1);
        assert!(Arc::ptr_eq(&first.node, &second.node));

        let uncached = bind(sample(), ResolverOptions::uncached());
        uncached.read_node(root).expect("uncached read");
        assert!(uncached.cache().is_empty());
        assert_eq!(uncached.cache().hits() + uncached.cache().misses(), 0);
    }

    #[test]
    fn lookup_mapping_exposes_raw_record() {
        let resolver = bind(sample(), ResolverOptions::default());
        let value = resolver
            .lookup_mapping(ObjectId(0x402), Xid::LATEST)
            .expect("mapping");
        assert!(!value.is_deleted());
        assert_eq!(value.size, 4096);
        let err = resolver
            .lookup_mapping(ObjectId(0x402), Xid(3))
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
