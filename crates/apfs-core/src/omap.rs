//! The container object map: `(virtual oid, xid) → physical location`.

use crate::verify_object;
use apfs_block::BlockSource;
use apfs_btree::{
    BTreeNavigator, DEFAULT_MAX_DEPTH, NodeSource, OidKeyComparer, OmapKeyComparer, SearchMode,
    parse_to_apfs_error,
};
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{OmapKey, OmapPhys, OmapSnapshot, OmapValue};
use apfs_types::{Endian, OBJECT_TYPE_OMAP, ObjectId, ObjectRef, Paddr, StorageClass, Xid};
use tracing::debug;

/// A decoded object map.
///
/// Holds only the `omap_phys` header. Tree nodes are fetched through the
/// [`NodeSource`] passed to each lookup, so the map itself does no I/O
/// after [`ObjectMap::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMap {
    paddr: Paddr,
    endian: Endian,
    phys: OmapPhys,
    max_depth: u16,
}

impl ObjectMap {
    /// Read, verify, and decode the object map stored at `paddr`.
    pub fn open<S: BlockSource + ?Sized>(source: &S, paddr: Paddr, endian: Endian) -> Result<Self> {
        if paddr.0 == 0 {
            return Err(ApfsError::ReservedObjectId { oid: 0 });
        }
        let block = source.read_block(paddr)?;
        verify_object(block.as_slice(), endian, paddr, "object map")?;
        let phys = OmapPhys::parse(block.as_slice(), endian)
            .map_err(|e| parse_to_apfs_error(paddr.0, &e))?;
        Self::from_phys(paddr, endian, phys)
    }

    /// Bind an already decoded `omap_phys` read from `paddr`.
    pub fn from_phys(paddr: Paddr, endian: Endian, phys: OmapPhys) -> Result<Self> {
        phys.header
            .expect_type(OBJECT_TYPE_OMAP)
            .map_err(|e| parse_to_apfs_error(paddr.0, &e))?;
        if phys.header.oid.0 != paddr.0 {
            return Err(ApfsError::CorruptObject {
                block: paddr.0,
                detail: format!("object map header names oid {}", phys.header.oid),
            });
        }
        if phys.tree_storage() != Some(StorageClass::Physical) {
            return Err(ApfsError::UnsupportedFeature(format!(
                "object map tree with type {:#x}",
                phys.tree_type
            )));
        }
        debug!(
            paddr = paddr.0,
            tree = phys.tree_oid.0,
            snap_count = phys.snap_count,
            most_recent_snap = phys.most_recent_snap.0,
            "omap_open"
        );
        Ok(Self {
            paddr,
            endian,
            phys,
            max_depth: DEFAULT_MAX_DEPTH,
        })
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: u16) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[must_use]
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    #[must_use]
    pub fn phys(&self) -> &OmapPhys {
        &self.phys
    }

    /// Root of the mapping tree.
    #[must_use]
    pub fn tree_root(&self) -> ObjectRef {
        ObjectRef::Physical(Paddr(self.phys.tree_oid.0))
    }

    /// Transaction of the newest snapshot, if the map records any.
    #[must_use]
    pub fn most_recent_snapshot_xid(&self) -> Option<Xid> {
        (self.phys.snap_count > 0 && self.phys.most_recent_snap.0 != 0)
            .then_some(self.phys.most_recent_snap)
    }

    /// Newest mapping of `oid` whose xid is not after `xid`.
    ///
    /// A deleted mapping is still returned; check
    /// [`OmapValue::is_deleted`]. `KeyNotFound` means no version of `oid`
    /// existed at `xid`.
    pub fn resolve<N: NodeSource + ?Sized>(
        &self,
        nodes: &N,
        oid: ObjectId,
        xid: Xid,
    ) -> Result<OmapValue> {
        let navigator = BTreeNavigator::new(nodes, OmapKeyComparer).with_max_depth(self.max_depth);
        let found = navigator.find(self.tree_root(), &OmapKey { oid, xid }, SearchMode::Versioned)?;
        let key = OmapKey::parse(&found.key, self.endian)
            .map_err(|e| parse_to_apfs_error(found.paddr.0, &e))?;
        let value = OmapValue::parse(&found.value, self.endian)
            .map_err(|e| parse_to_apfs_error(found.paddr.0, &e))?;
        debug!(
            oid = oid.0,
            xid = xid.0,
            found_xid = key.xid.0,
            paddr = value.paddr.0,
            flags = value.flags,
            "omap_resolve"
        );
        Ok(value)
    }

    /// Newest mapping of `oid` regardless of transaction.
    pub fn resolve_latest<N: NodeSource + ?Sized>(&self, nodes: &N, oid: ObjectId) -> Result<OmapValue> {
        self.resolve(nodes, oid, Xid::LATEST)
    }

    /// Every record of the snapshot tree, in xid order.
    pub fn snapshots<N: NodeSource + ?Sized>(&self, nodes: &N) -> Result<Vec<(Xid, OmapSnapshot)>> {
        if !self.phys.has_snapshot_tree() {
            return Ok(Vec::new());
        }
        if self.phys.snapshot_tree_storage() != Some(StorageClass::Physical) {
            return Err(ApfsError::UnsupportedFeature(format!(
                "object map snapshot tree with type {:#x}",
                self.phys.snapshot_tree_type
            )));
        }
        let root = ObjectRef::Physical(Paddr(self.phys.snapshot_tree_oid.0));
        let endian = self.endian;
        let navigator = BTreeNavigator::new(nodes, OidKeyComparer).with_max_depth(self.max_depth);
        let mut out = Vec::new();
        navigator.walk(root, &mut |key, value| {
            let xid = endian
                .read_u64(key, 0)
                .map_err(|e| parse_to_apfs_error(root.oid().0, &e))?;
            let snapshot = OmapSnapshot::parse(value, endian)
                .map_err(|e| parse_to_apfs_error(root.oid().0, &e))?;
            out.push((Xid(xid), snapshot));
            Ok(())
        })?;
        Ok(out)
    }
}
