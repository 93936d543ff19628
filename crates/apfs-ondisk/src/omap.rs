//! Object map (`omap_phys_t`) and the key/value records of its trees.

use crate::object::ObjectHeader;
use apfs_types::{
    Endian, OBJECT_TYPE_OMAP, ObjectId, Paddr, ParseError, StorageClass, Xid,
};
use serde::{Deserialize, Serialize};

pub const OMAP_PHYS_SIZE: usize = 88;
pub const OMAP_KEY_SIZE: usize = 16;
pub const OMAP_VAL_SIZE: usize = 16;
pub const OMAP_SNAPSHOT_SIZE: usize = 16;
/// Snapshot tree keys are a bare xid.
pub const OMAP_SNAPSHOT_KEY_SIZE: usize = 8;

// om_flags
pub const OMAP_MANUALLY_MANAGED: u32 = 0x0000_0001;
pub const OMAP_ENCRYPTING: u32 = 0x0000_0002;
pub const OMAP_DECRYPTING: u32 = 0x0000_0004;
pub const OMAP_KEYROLLING: u32 = 0x0000_0008;
pub const OMAP_CRYPTO_GENERATION: u32 = 0x0000_0010;

// ov_flags
pub const OMAP_VAL_DELETED: u32 = 0x0000_0001;
pub const OMAP_VAL_SAVED: u32 = 0x0000_0002;
pub const OMAP_VAL_ENCRYPTED: u32 = 0x0000_0004;
pub const OMAP_VAL_NOHEADER: u32 = 0x0000_0008;
pub const OMAP_VAL_CRYPTO_GENERATION: u32 = 0x0000_0010;

// oms_flags
pub const OMAP_SNAPSHOT_DELETED: u32 = 0x0000_0001;
pub const OMAP_SNAPSHOT_REVERTED: u32 = 0x0000_0002;

/// The object map object: where its two trees live and snapshot bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapPhys {
    pub header: ObjectHeader,
    pub flags: u32,
    pub snap_count: u32,
    pub tree_type: u32,
    pub snapshot_tree_type: u32,
    pub tree_oid: ObjectId,
    pub snapshot_tree_oid: ObjectId,
    pub most_recent_snap: Xid,
    pub pending_revert_min: Xid,
    pub pending_revert_max: Xid,
}

impl OmapPhys {
    pub fn parse(data: &[u8], endian: Endian) -> Result<Self, ParseError> {
        if data.len() < OMAP_PHYS_SIZE {
            return Err(ParseError::InsufficientData {
                needed: OMAP_PHYS_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }
        let header = ObjectHeader::parse(data, endian)?;
        header.expect_type(OBJECT_TYPE_OMAP)?;

        Ok(Self {
            header,
            flags: endian.read_u32(data, 0x20)?,
            snap_count: endian.read_u32(data, 0x24)?,
            tree_type: endian.read_u32(data, 0x28)?,
            snapshot_tree_type: endian.read_u32(data, 0x2C)?,
            tree_oid: ObjectId(endian.read_u64(data, 0x30)?),
            snapshot_tree_oid: ObjectId(endian.read_u64(data, 0x38)?),
            most_recent_snap: Xid(endian.read_u64(data, 0x40)?),
            pending_revert_min: Xid(endian.read_u64(data, 0x48)?),
            pending_revert_max: Xid(endian.read_u64(data, 0x50)?),
        })
    }

    pub fn encode_into(&self, out: &mut [u8], endian: Endian) -> Result<(), ParseError> {
        self.header.encode_into(out, endian)?;
        endian.put_u32(out, 0x20, self.flags)?;
        endian.put_u32(out, 0x24, self.snap_count)?;
        endian.put_u32(out, 0x28, self.tree_type)?;
        endian.put_u32(out, 0x2C, self.snapshot_tree_type)?;
        endian.put_u64(out, 0x30, self.tree_oid.0)?;
        endian.put_u64(out, 0x38, self.snapshot_tree_oid.0)?;
        endian.put_u64(out, 0x40, self.most_recent_snap.0)?;
        endian.put_u64(out, 0x48, self.pending_revert_min.0)?;
        endian.put_u64(out, 0x50, self.pending_revert_max.0)
    }

    #[must_use]
    pub fn is_manually_managed(&self) -> bool {
        self.flags & OMAP_MANUALLY_MANAGED != 0
    }

    /// Storage class of the mapping tree's nodes (physical on every known image).
    #[must_use]
    pub fn tree_storage(&self) -> Option<StorageClass> {
        StorageClass::from_type_flags(self.tree_type)
    }

    #[must_use]
    pub fn snapshot_tree_storage(&self) -> Option<StorageClass> {
        StorageClass::from_type_flags(self.snapshot_tree_type)
    }

    #[must_use]
    pub fn has_snapshot_tree(&self) -> bool {
        self.snapshot_tree_oid.0 != 0
    }

    #[must_use]
    pub fn has_pending_revert(&self) -> bool {
        self.pending_revert_min.0 != 0 || self.pending_revert_max.0 != 0
    }
}

/// `omap_key_t`; ordered by oid, then xid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OmapKey {
    pub oid: ObjectId,
    pub xid: Xid,
}

impl OmapKey {
    pub fn parse(data: &[u8], endian: Endian) -> Result<Self, ParseError> {
        Ok(Self {
            oid: ObjectId(endian.read_u64(data, 0)?),
            xid: Xid(endian.read_u64(data, 8)?),
        })
    }

    #[must_use]
    pub fn encode(&self, endian: Endian) -> [u8; OMAP_KEY_SIZE] {
        let mut out = [0_u8; OMAP_KEY_SIZE];
        let (oid, xid) = match endian {
            Endian::Little => (self.oid.0.to_le_bytes(), self.xid.0.to_le_bytes()),
            Endian::Big => (self.oid.0.to_be_bytes(), self.xid.0.to_be_bytes()),
        };
        out[..8].copy_from_slice(&oid);
        out[8..].copy_from_slice(&xid);
        out
    }
}

/// `omap_val_t`: where a version of a virtual object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OmapValue {
    pub flags: u32,
    pub size: u32,
    pub paddr: Paddr,
}

impl OmapValue {
    pub fn parse(data: &[u8], endian: Endian) -> Result<Self, ParseError> {
        Ok(Self {
            flags: endian.read_u32(data, 0)?,
            size: endian.read_u32(data, 4)?,
            paddr: Paddr(endian.read_u64(data, 8)?),
        })
    }

    #[must_use]
    pub fn encode(&self, endian: Endian) -> [u8; OMAP_VAL_SIZE] {
        let mut out = [0_u8; OMAP_VAL_SIZE];
        match endian {
            Endian::Little => {
                out[..4].copy_from_slice(&self.flags.to_le_bytes());
                out[4..8].copy_from_slice(&self.size.to_le_bytes());
                out[8..].copy_from_slice(&self.paddr.0.to_le_bytes());
            }
            Endian::Big => {
                out[..4].copy_from_slice(&self.flags.to_be_bytes());
                out[4..8].copy_from_slice(&self.size.to_be_bytes());
                out[8..].copy_from_slice(&self.paddr.0.to_be_bytes());
            }
        }
        out
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags & OMAP_VAL_DELETED != 0
    }

    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.flags & OMAP_VAL_SAVED != 0
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.flags & OMAP_VAL_ENCRYPTED != 0
    }

    #[must_use]
    pub fn has_no_header(&self) -> bool {
        self.flags & OMAP_VAL_NOHEADER != 0
    }

    #[must_use]
    pub fn has_crypto_generation(&self) -> bool {
        self.flags & OMAP_VAL_CRYPTO_GENERATION != 0
    }
}

/// `omap_snapshot_t`, keyed by xid in the snapshot tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapSnapshot {
    pub flags: u32,
    pub oid: ObjectId,
}

impl OmapSnapshot {
    pub fn parse(data: &[u8], endian: Endian) -> Result<Self, ParseError> {
        // 0x04: padding
        Ok(Self {
            flags: endian.read_u32(data, 0)?,
            oid: ObjectId(endian.read_u64(data, 8)?),
        })
    }

    #[must_use]
    pub fn encode(&self, endian: Endian) -> [u8; OMAP_SNAPSHOT_SIZE] {
        let mut out = [0_u8; OMAP_SNAPSHOT_SIZE];
        match endian {
            Endian::Little => {
                out[..4].copy_from_slice(&self.flags.to_le_bytes());
                out[8..].copy_from_slice(&self.oid.0.to_le_bytes());
            }
            Endian::Big => {
                out[..4].copy_from_slice(&self.flags.to_be_bytes());
                out[8..].copy_from_slice(&self.oid.0.to_be_bytes());
            }
        }
        out
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags & OMAP_SNAPSHOT_DELETED != 0
    }

    #[must_use]
    pub fn is_reverted(&self) -> bool {
        self.flags & OMAP_SNAPSHOT_REVERTED != 0
    }
}
