//! B-tree node (`btree_node_phys_t`) decoding.
//!
//! A node is one block: object header, node header, then the table of
//! contents (TOC), key area, free space, and value area. Root nodes end with
//! a `btree_info_t` footer that the value area stops short of.
//!
//! ```text
//! 0        32          56         56+toc.off+toc.len                 val_end   len
//! | obj hdr | node hdr | TOC ...  | keys -> | free space | <- values | [info] |
//! ```
//!
//! Keys are addressed forwards from the start of the key area, values
//! backwards from the end of the value area.

use crate::object::ObjectHeader;
use apfs_types::{Endian, ParseError};
use serde::{Deserialize, Serialize};

/// Object header plus node header: where the TOC area begins.
pub const BTREE_NODE_HEADER_SIZE: usize = 56;
pub const BTREE_INFO_SIZE: usize = 40;

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
pub const BTNODE_HASHED: u16 = 0x0008;
pub const BTNODE_NOHEADER: u16 = 0x0010;
pub const BTNODE_CHECK_KOFF_INVAL: u16 = 0x8000;

/// `btree_info_fixed_t` flags.
pub const BTREE_UINT64_KEYS: u32 = 0x0000_0001;
pub const BTREE_SEQUENTIAL_INSERT: u32 = 0x0000_0002;
pub const BTREE_ALLOW_GHOSTS: u32 = 0x0000_0004;
pub const BTREE_EPHEMERAL: u32 = 0x0000_0008;
pub const BTREE_PHYSICAL: u32 = 0x0000_0010;
pub const BTREE_NONPERSISTENT: u32 = 0x0000_0020;
pub const BTREE_KV_NONALIGNED: u32 = 0x0000_0040;
pub const BTREE_HASHED: u32 = 0x0000_0080;
pub const BTREE_NOHEADER: u32 = 0x0000_0100;

/// Value offset meaning "no value" in a TOC entry.
pub const BTOFF_INVALID: u16 = 0xFFFF;

/// Fixed-size TOC entry (`kvoff_t`).
pub const KVOFF_SIZE: usize = 4;
/// Variable-size TOC entry (`kvloc_t`).
pub const KVLOC_SIZE: usize = 8;

/// Child pointers in index nodes are always 8-byte object ids.
pub const CHILD_POINTER_SIZE: u32 = 8;

/// An `(offset, length)` pair locating a region inside a node (`nloc_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeLocation {
    pub off: u16,
    pub len: u16,
}

impl NodeLocation {
    fn parse(data: &[u8], offset: usize, endian: Endian) -> Result<Self, ParseError> {
        Ok(Self {
            off: endian.read_u16(data, offset)?,
            len: endian.read_u16(data, offset + 2)?,
        })
    }

    fn encode_into(self, out: &mut [u8], offset: usize, endian: Endian) -> Result<(), ParseError> {
        endian.put_u16(out, offset, self.off)?;
        endian.put_u16(out, offset + 2, self.len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BTreeNodeHeader {
    pub object: ObjectHeader,
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub table_space: NodeLocation,
    pub free_space: NodeLocation,
    pub key_free_list: NodeLocation,
    pub val_free_list: NodeLocation,
}

impl BTreeNodeHeader {
    pub fn parse(data: &[u8], endian: Endian) -> Result<Self, ParseError> {
        if data.len() < BTREE_NODE_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTREE_NODE_HEADER_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        Ok(Self {
            object: ObjectHeader::parse(data, endian)?,
            flags: endian.read_u16(data, 0x20)?,
            level: endian.read_u16(data, 0x22)?,
            nkeys: endian.read_u32(data, 0x24)?,
            table_space: NodeLocation::parse(data, 0x28, endian)?,
            free_space: NodeLocation::parse(data, 0x2C, endian)?,
            key_free_list: NodeLocation::parse(data, 0x30, endian)?,
            val_free_list: NodeLocation::parse(data, 0x34, endian)?,
        })
    }

    pub fn encode_into(&self, out: &mut [u8], endian: Endian) -> Result<(), ParseError> {
        self.object.encode_into(out, endian)?;
        endian.put_u16(out, 0x20, self.flags)?;
        endian.put_u16(out, 0x22, self.level)?;
        endian.put_u32(out, 0x24, self.nkeys)?;
        self.table_space.encode_into(out, 0x28, endian)?;
        self.free_space.encode_into(out, 0x2C, endian)?;
        self.key_free_list.encode_into(out, 0x30, endian)?;
        self.val_free_list.encode_into(out, 0x34, endian)
    }
}

/// `btree_info_t`: static tree geometry plus running counts, stored at the
/// tail of the root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BTreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BTreeInfo {
    /// Parse the 40-byte footer from the end of a root node block.
    pub fn parse_from_root(block: &[u8], endian: Endian) -> Result<Self, ParseError> {
        let Some(start) = block.len().checked_sub(BTREE_INFO_SIZE) else {
            return Err(ParseError::InsufficientData {
                needed: BTREE_INFO_SIZE,
                offset: 0,
                actual: block.len(),
            });
        };
        Self::parse(&block[start..], endian)
    }

    pub fn parse(data: &[u8], endian: Endian) -> Result<Self, ParseError> {
        Ok(Self {
            flags: endian.read_u32(data, 0x00)?,
            node_size: endian.read_u32(data, 0x04)?,
            key_size: endian.read_u32(data, 0x08)?,
            val_size: endian.read_u32(data, 0x0C)?,
            longest_key: endian.read_u32(data, 0x10)?,
            longest_val: endian.read_u32(data, 0x14)?,
            key_count: endian.read_u64(data, 0x18)?,
            node_count: endian.read_u64(data, 0x20)?,
        })
    }

    pub fn encode_into(&self, out: &mut [u8], endian: Endian) -> Result<(), ParseError> {
        endian.put_u32(out, 0x00, self.flags)?;
        endian.put_u32(out, 0x04, self.node_size)?;
        endian.put_u32(out, 0x08, self.key_size)?;
        endian.put_u32(out, 0x0C, self.val_size)?;
        endian.put_u32(out, 0x10, self.longest_key)?;
        endian.put_u32(out, 0x14, self.longest_val)?;
        endian.put_u64(out, 0x18, self.key_count)?;
        endian.put_u64(out, 0x20, self.node_count)
    }
}

/// Key and leaf-value sizes for trees whose nodes use fixed-size TOC entries.
///
/// Only the root carries a [`BTreeInfo`]; the geometry is taken from it once
/// and applied to every node below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvGeometry {
    pub key_size: u32,
    pub value_size: u32,
}

impl KvGeometry {
    /// Object map trees: 16-byte `omap_key_t`, 16-byte `omap_val_t`.
    pub const OMAP: Self = Self {
        key_size: 16,
        value_size: 16,
    };

    #[must_use]
    pub fn from_info(info: &BTreeInfo) -> Self {
        Self {
            key_size: info.key_size,
            value_size: info.val_size,
        }
    }

    /// Value length in a node at the given leafness.
    #[must_use]
    pub fn value_len(self, is_leaf: bool) -> u32 {
        if is_leaf {
            self.value_size
        } else {
            CHILD_POINTER_SIZE
        }
    }
}

/// One decoded table-of-contents entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TocEntry {
    /// `kvoff_t`: offsets only; lengths come from the tree's [`KvGeometry`].
    Fixed { key_off: u16, val_off: u16 },
    /// `kvloc_t`: explicit offset and length for both key and value.
    Variable { key: NodeLocation, val: NodeLocation },
}

impl TocEntry {
    fn key_range(self, geometry: Option<KvGeometry>) -> Result<(usize, usize), ParseError> {
        match self {
            Self::Fixed { key_off, .. } => {
                let geometry = geometry.ok_or(ParseError::InvalidField {
                    field: "btn_flags",
                    reason: "fixed-size node without key geometry",
                })?;
                Ok((usize::from(key_off), geometry.key_size as usize))
            }
            Self::Variable { key, .. } => Ok((usize::from(key.off), usize::from(key.len))),
        }
    }

    fn value_range(
        self,
        geometry: Option<KvGeometry>,
        is_leaf: bool,
    ) -> Result<(u16, usize), ParseError> {
        match self {
            Self::Fixed { val_off, .. } => {
                let geometry = geometry.ok_or(ParseError::InvalidField {
                    field: "btn_flags",
                    reason: "fixed-size node without value geometry",
                })?;
                Ok((val_off, geometry.value_len(is_leaf) as usize))
            }
            Self::Variable { val, .. } => Ok((val.off, usize::from(val.len))),
        }
    }
}

/// A decoded node that owns its block.
///
/// Keys and values are handed out as slices borrowed from the node, so a
/// node can be shared through an `Arc` and outlives no buffer but its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeNode {
    header: BTreeNodeHeader,
    info: Option<BTreeInfo>,
    endian: Endian,
    toc_start: usize,
    key_start: usize,
    free_start: usize,
    free_end: usize,
    val_end: usize,
    bytes: Vec<u8>,
}

impl BTreeNode {
    /// Decode a node, validating that every declared region fits the block.
    pub fn parse(bytes: Vec<u8>, endian: Endian) -> Result<Self, ParseError> {
        let header = BTreeNodeHeader::parse(&bytes, endian)?;

        let is_leaf = header.flags & BTNODE_LEAF != 0;
        if is_leaf != (header.level == 0) {
            return Err(ParseError::InvalidField {
                field: "btn_level",
                reason: "leaf flag disagrees with level",
            });
        }

        let is_root = header.flags & BTNODE_ROOT != 0;
        let (info, val_end) = if is_root {
            let info = BTreeInfo::parse_from_root(&bytes, endian)?;
            let val_end = bytes.len() - BTREE_INFO_SIZE;
            if val_end < BTREE_NODE_HEADER_SIZE {
                return Err(ParseError::InsufficientData {
                    needed: BTREE_NODE_HEADER_SIZE + BTREE_INFO_SIZE,
                    offset: 0,
                    actual: bytes.len(),
                });
            }
            (Some(info), val_end)
        } else {
            (None, bytes.len())
        };

        let toc_start = BTREE_NODE_HEADER_SIZE + usize::from(header.table_space.off);
        let key_start = toc_start + usize::from(header.table_space.len);
        if key_start > val_end {
            return Err(ParseError::InsufficientData {
                needed: usize::from(header.table_space.len),
                offset: toc_start,
                actual: val_end.saturating_sub(toc_start),
            });
        }

        let entry_size = if header.flags & BTNODE_FIXED_KV_SIZE != 0 {
            KVOFF_SIZE
        } else {
            KVLOC_SIZE
        };
        let nkeys = usize::try_from(header.nkeys)
            .map_err(|_| ParseError::IntegerConversion { field: "btn_nkeys" })?;
        let toc_needed = nkeys
            .checked_mul(entry_size)
            .ok_or(ParseError::IntegerConversion { field: "btn_nkeys" })?;
        if toc_needed > usize::from(header.table_space.len) {
            return Err(ParseError::InvalidField {
                field: "btn_table_space",
                reason: "too small for key count",
            });
        }

        let free_start = key_start + usize::from(header.free_space.off);
        let free_end = free_start + usize::from(header.free_space.len);
        if free_end > val_end {
            return Err(ParseError::InsufficientData {
                needed: usize::from(header.free_space.len),
                offset: free_start,
                actual: val_end.saturating_sub(free_start),
            });
        }

        Ok(Self {
            header,
            info,
            endian,
            toc_start,
            key_start,
            free_start,
            free_end,
            val_end,
            bytes,
        })
    }

    #[must_use]
    pub fn header(&self) -> &BTreeNodeHeader {
        &self.header
    }

    #[must_use]
    pub fn object(&self) -> &ObjectHeader {
        &self.header.object
    }

    /// The tree info footer; present only on root nodes.
    #[must_use]
    pub fn info(&self) -> Option<&BTreeInfo> {
        self.info.as_ref()
    }

    #[must_use]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    #[must_use]
    pub fn level(&self) -> u16 {
        self.header.level
    }

    #[must_use]
    pub fn key_count(&self) -> u32 {
        self.header.nkeys
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.header.flags & BTNODE_ROOT != 0
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.header.flags & BTNODE_LEAF != 0
    }

    #[must_use]
    pub fn has_fixed_kv_size(&self) -> bool {
        self.header.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    #[must_use]
    pub fn is_hashed(&self) -> bool {
        self.header.flags & BTNODE_HASHED != 0
    }

    #[must_use]
    pub fn has_header(&self) -> bool {
        self.header.flags & BTNODE_NOHEADER == 0
    }

    #[must_use]
    pub fn checks_koff_invalid(&self) -> bool {
        self.header.flags & BTNODE_CHECK_KOFF_INVAL != 0
    }

    #[must_use]
    pub fn table_of_contents(&self) -> &[u8] {
        &self.bytes[self.toc_start..self.key_start]
    }

    /// Keys in use: from the end of the TOC to the start of free space.
    #[must_use]
    pub fn key_area(&self) -> &[u8] {
        &self.bytes[self.key_start..self.free_start]
    }

    /// Values in use: from the end of free space to the value area end.
    #[must_use]
    pub fn value_area(&self) -> &[u8] {
        &self.bytes[self.free_end..self.val_end]
    }

    /// Geometry for fixed-size entries, when this node can supply it.
    #[must_use]
    pub fn geometry(&self) -> Option<KvGeometry> {
        self.info.as_ref().map(KvGeometry::from_info)
    }

    pub fn toc_entry(&self, index: u32) -> Result<TocEntry, ParseError> {
        if index >= self.header.nkeys {
            return Err(ParseError::InvalidField {
                field: "toc_index",
                reason: "index beyond key count",
            });
        }
        let idx = index as usize;
        let toc = self.table_of_contents();
        if self.has_fixed_kv_size() {
            let base = idx * KVOFF_SIZE;
            Ok(TocEntry::Fixed {
                key_off: self.endian.read_u16(toc, base)?,
                val_off: self.endian.read_u16(toc, base + 2)?,
            })
        } else {
            let base = idx * KVLOC_SIZE;
            Ok(TocEntry::Variable {
                key: NodeLocation::parse(toc, base, self.endian)?,
                val: NodeLocation::parse(toc, base + 4, self.endian)?,
            })
        }
    }

    /// Key bytes of entry `index`.
    ///
    /// `geometry` is required for fixed-size nodes and ignored otherwise.
    pub fn key_at(&self, index: u32, geometry: Option<KvGeometry>) -> Result<&[u8], ParseError> {
        let (off, len) = self.toc_entry(index)?.key_range(geometry)?;
        let start = self.key_start + off;
        let end = start + len;
        if end > self.bytes.len() {
            return Err(ParseError::InsufficientData {
                needed: len,
                offset: start,
                actual: self.bytes.len().saturating_sub(start),
            });
        }
        if end > self.val_end {
            return Err(ParseError::InvalidField {
                field: "k.off",
                reason: "key extends past key area",
            });
        }
        Ok(&self.bytes[start..end])
    }

    /// Value bytes of entry `index`; empty when the value offset is invalid.
    pub fn value_at(&self, index: u32, geometry: Option<KvGeometry>) -> Result<&[u8], ParseError> {
        let (off, len) = self
            .toc_entry(index)?
            .value_range(geometry, self.is_leaf())?;
        if off == BTOFF_INVALID {
            return Ok(&[]);
        }
        let off = usize::from(off);
        let Some(start) = self.val_end.checked_sub(off) else {
            return Err(ParseError::InvalidField {
                field: "v.off",
                reason: "value offset before node start",
            });
        };
        if start + len > self.bytes.len() {
            return Err(ParseError::InsufficientData {
                needed: len,
                offset: start,
                actual: self.bytes.len() - start,
            });
        }
        if start < self.key_start || start + len > self.val_end {
            return Err(ParseError::InvalidField {
                field: "v.off",
                reason: "value extends outside value area",
            });
        }
        Ok(&self.bytes[start..start + len])
    }

    /// Child object id stored as the value of index-node entry `index`.
    pub fn child_oid_at(&self, index: u32, geometry: Option<KvGeometry>) -> Result<u64, ParseError> {
        if self.is_leaf() {
            return Err(ParseError::InvalidField {
                field: "btn_level",
                reason: "leaf nodes have no children",
            });
        }
        let value = self.value_at(index, geometry)?;
        if value.len() != CHILD_POINTER_SIZE as usize {
            return Err(ParseError::InvalidField {
                field: "v.len",
                reason: "child pointer is not 8 bytes",
            });
        }
        self.endian.read_u64(value, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_types::{OBJ_PHYSICAL, OBJECT_TYPE_BTREE, OBJECT_TYPE_OMAP, ObjectId, Xid};

    const NODE_SIZE: usize = 4096;

    fn write_header(block: &mut [u8], flags: u16, level: u16, nkeys: u32, toc_len: u16) {
        let header = BTreeNodeHeader {
            object: ObjectHeader {
                checksum: 0,
                oid: ObjectId(77),
                xid: Xid(3),
                type_and_flags: OBJECT_TYPE_BTREE | OBJ_PHYSICAL,
                subtype: OBJECT_TYPE_OMAP,
            },
            flags,
            level,
            nkeys,
            table_space: NodeLocation { off: 0, len: toc_len },
            free_space: NodeLocation::default(),
            key_free_list: NodeLocation {
                off: BTOFF_INVALID,
                len: 0,
            },
            val_free_list: NodeLocation {
                off: BTOFF_INVALID,
                len: 0,
            },
        };
        header.encode_into(block, Endian::Little).expect("header");
    }

    fn write_info(block: &mut [u8], key_size: u32, val_size: u32) {
        let info = BTreeInfo {
            flags: BTREE_PHYSICAL,
            node_size: u32::try_from(block.len()).unwrap(),
            key_size,
            val_size,
            longest_key: key_size,
            longest_val: val_size,
            key_count: 3,
            node_count: 1,
        };
        let start = block.len() - BTREE_INFO_SIZE;
        info.encode_into(&mut block[start..], Endian::Little)
            .expect("info");
    }

    /// Root leaf, fixed 8-byte keys and values: [10, 20, 30] -> [100, 200, 300].
    fn fixed_root_leaf() -> Vec<u8> {
        let mut block = vec![0_u8; NODE_SIZE];
        let toc_len: u16 = 3 * 4;
        write_header(
            &mut block,
            BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE,
            0,
            3,
            toc_len,
        );
        write_info(&mut block, 8, 8);
        let key_start = BTREE_NODE_HEADER_SIZE + usize::from(toc_len);
        let val_end = NODE_SIZE - BTREE_INFO_SIZE;
        for (i, (key, value)) in [(10_u64, 100_u64), (20, 200), (30, 300)].iter().enumerate() {
            let koff = u16::try_from(i * 8).unwrap();
            let voff = u16::try_from((i + 1) * 8).unwrap();
            let toc = BTREE_NODE_HEADER_SIZE + i * 4;
            block[toc..toc + 2].copy_from_slice(&koff.to_le_bytes());
            block[toc + 2..toc + 4].copy_from_slice(&voff.to_le_bytes());
            let k = key_start + usize::from(koff);
            block[k..k + 8].copy_from_slice(&key.to_le_bytes());
            let v = val_end - usize::from(voff);
            block[v..v + 8].copy_from_slice(&value.to_le_bytes());
        }
        let free_off: u16 = 24;
        let free_len = u16::try_from(val_end - key_start - 24 - 24).unwrap();
        block[0x2C..0x2E].copy_from_slice(&free_off.to_le_bytes());
        block[0x2E..0x30].copy_from_slice(&free_len.to_le_bytes());
        block
    }

    #[test]
    fn parse_fixed_root_leaf() {
        let node = BTreeNode::parse(fixed_root_leaf(), Endian::Little).expect("parse");
        assert!(node.is_root());
        assert!(node.is_leaf());
        assert!(node.has_fixed_kv_size());
        assert!(!node.is_hashed());
        assert!(node.has_header());
        assert!(!node.checks_koff_invalid());
        assert_eq!(node.level(), 0);
        assert_eq!(node.key_count(), 3);
        assert_eq!(node.table_of_contents().len(), 12);
        assert_eq!(node.key_area().len(), 24);
        assert_eq!(node.value_area().len(), 24);

        let info = node.info().expect("root info");
        assert_eq!(info.key_size, 8);
        assert_eq!(info.flags, BTREE_PHYSICAL);
        let geometry = node.geometry();
        assert_eq!(
            geometry,
            Some(KvGeometry {
                key_size: 8,
                value_size: 8
            })
        );

        let key = node.key_at(1, geometry).expect("key");
        assert_eq!(u64::from_le_bytes(key.try_into().unwrap()), 20);
        let value = node.value_at(2, geometry).expect("value");
        assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), 300);
    }

    #[test]
    fn fixed_entries_need_geometry() {
        let node = BTreeNode::parse(fixed_root_leaf(), Endian::Little).expect("parse");
        let err = node.key_at(0, None).unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidField { field: "btn_flags", .. }),
            "unexpected error: {err:?}"
        );
        assert!(node.toc_entry(3).is_err());
    }

    #[test]
    fn variable_entries_use_their_own_lengths() {
        let mut block = vec![0_u8; NODE_SIZE];
        write_header(&mut block, BTNODE_LEAF, 0, 2, 16);
        let key_start = BTREE_NODE_HEADER_SIZE + 16;
        let entries: [(&[u8], &[u8]); 2] = [(b"abc", b"first"), (b"abcd", b"second!")];
        let mut koff = 0_u16;
        let mut voff = 0_u16;
        for (i, (key, value)) in entries.iter().enumerate() {
            let klen = u16::try_from(key.len()).unwrap();
            let vlen = u16::try_from(value.len()).unwrap();
            voff += vlen;
            let toc = BTREE_NODE_HEADER_SIZE + i * 8;
            block[toc..toc + 2].copy_from_slice(&koff.to_le_bytes());
            block[toc + 2..toc + 4].copy_from_slice(&klen.to_le_bytes());
            block[toc + 4..toc + 6].copy_from_slice(&voff.to_le_bytes());
            block[toc + 6..toc + 8].copy_from_slice(&vlen.to_le_bytes());
            let k = key_start + usize::from(koff);
            block[k..k + key.len()].copy_from_slice(key);
            let v = NODE_SIZE - usize::from(voff);
            block[v..v + value.len()].copy_from_slice(value);
            koff += klen;
        }

        let node = BTreeNode::parse(block, Endian::Little).expect("parse");
        assert!(!node.has_fixed_kv_size());
        assert!(node.info().is_none());
        assert_eq!(node.key_at(0, None).unwrap(), b"abc");
        assert_eq!(node.key_at(1, None).unwrap(), b"abcd");
        assert_eq!(node.value_at(0, None).unwrap(), b"first");
        assert_eq!(node.value_at(1, None).unwrap(), b"second!");
        assert!(matches!(
            node.toc_entry(1).unwrap(),
            TocEntry::Variable {
                key: NodeLocation { off: 3, len: 4 },
                ..
            }
        ));
    }

    #[test]
    fn leaf_flag_must_match_level() {
        let mut block = vec![0_u8; NODE_SIZE];
        write_header(&mut block, BTNODE_LEAF, 1, 0, 0);
        let err = BTreeNode::parse(block, Endian::Little).unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidField { field: "btn_level", .. }),
            "unexpected error: {err:?}"
        );

        let mut block = vec![0_u8; NODE_SIZE];
        write_header(&mut block, 0, 0, 0, 0);
        assert!(BTreeNode::parse(block, Endian::Little).is_err());
    }

    #[test]
    fn table_space_must_hold_every_entry() {
        let mut block = vec![0_u8; NODE_SIZE];
        write_header(&mut block, BTNODE_LEAF | BTNODE_FIXED_KV_SIZE, 0, 5, 16);
        let err = BTreeNode::parse(block, Endian::Little).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "btn_table_space",
                    ..
                }
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn oversized_regions_are_truncation() {
        let mut block = vec![0_u8; 512];
        write_header(&mut block, BTNODE_LEAF, 0, 0, 1000);
        let err = BTreeNode::parse(block, Endian::Little).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));

        let mut block = vec![0_u8; 512];
        write_header(&mut block, BTNODE_LEAF, 0, 0, 0);
        block[0x2C..0x2E].copy_from_slice(&400_u16.to_le_bytes());
        block[0x2E..0x30].copy_from_slice(&400_u16.to_le_bytes());
        let err = BTreeNode::parse(block, Endian::Little).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));

        let err = BTreeNode::parse(vec![0_u8; 40], Endian::Little).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InsufficientData {
                needed: BTREE_NODE_HEADER_SIZE,
                ..
            }
        ));
    }

    #[test]
    fn value_outside_area_is_rejected() {
        let mut block = fixed_root_leaf();
        // Point entry 0's value past the start of the node.
        let toc = BTREE_NODE_HEADER_SIZE;
        block[toc + 2..toc + 4].copy_from_slice(&0x7FFF_u16.to_le_bytes());
        let node = BTreeNode::parse(block, Endian::Little).expect("parse");
        let err = node.value_at(0, node.geometry()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "v.off", .. }));
    }

    /// One variable-size entry with the given key and value locations.
    fn single_variable_entry(key: NodeLocation, val: NodeLocation) -> BTreeNode {
        let mut block = vec![0_u8; NODE_SIZE];
        write_header(&mut block, BTNODE_LEAF, 0, 1, 8);
        let toc = BTREE_NODE_HEADER_SIZE;
        block[toc..toc + 2].copy_from_slice(&key.off.to_le_bytes());
        block[toc + 2..toc + 4].copy_from_slice(&key.len.to_le_bytes());
        block[toc + 4..toc + 6].copy_from_slice(&val.off.to_le_bytes());
        block[toc + 6..toc + 8].copy_from_slice(&val.len.to_le_bytes());
        BTreeNode::parse(block, Endian::Little).expect("parse")
    }

    #[test]
    fn entries_past_the_buffer_are_truncation() {
        let node = single_variable_entry(
            NodeLocation { off: 4000, len: 200 },
            NodeLocation { off: 10, len: 50 },
        );
        let err = node.key_at(0, None).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InsufficientData {
                    needed: 200,
                    offset: 4064,
                    actual: 32,
                }
            ),
            "unexpected error: {err:?}"
        );
        let err = node.value_at(0, None).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InsufficientData {
                    needed: 50,
                    offset: 4086,
                    actual: 10,
                }
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn key_reaching_into_the_info_footer_is_invalid() {
        let mut block = fixed_root_leaf();
        // Entry 2's key now starts inside the footer but ends within the block.
        let toc = BTREE_NODE_HEADER_SIZE + 8;
        let koff = u16::try_from(NODE_SIZE - BTREE_INFO_SIZE - (BTREE_NODE_HEADER_SIZE + 12))
            .unwrap();
        block[toc..toc + 2].copy_from_slice(&koff.to_le_bytes());
        let node = BTreeNode::parse(block, Endian::Little).expect("parse");
        let err = node.key_at(2, node.geometry()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "k.off", .. }));
    }

    #[test]
    fn index_node_child_pointers() {
        let mut block = vec![0_u8; NODE_SIZE];
        write_header(&mut block, BTNODE_FIXED_KV_SIZE, 1, 1, 4);
        let key_start = BTREE_NODE_HEADER_SIZE + 4;
        block[key_start..key_start + 8].copy_from_slice(&5_u64.to_le_bytes());
        block[BTREE_NODE_HEADER_SIZE + 2..BTREE_NODE_HEADER_SIZE + 4]
            .copy_from_slice(&8_u16.to_le_bytes());
        block[NODE_SIZE - 8..].copy_from_slice(&0x1234_u64.to_le_bytes());

        let node = BTreeNode::parse(block, Endian::Little).expect("parse");
        let geometry = Some(KvGeometry {
            key_size: 8,
            value_size: 16,
        });
        assert!(!node.is_leaf());
        // Index nodes store 8-byte child oids whatever the leaf value size.
        assert_eq!(node.child_oid_at(0, geometry).unwrap(), 0x1234);

        let leaf = BTreeNode::parse(fixed_root_leaf(), Endian::Little).expect("parse");
        assert!(leaf.child_oid_at(0, leaf.geometry()).is_err());
    }

    #[test]
    fn invalid_value_offset_reads_as_empty() {
        let mut block = fixed_root_leaf();
        let toc = BTREE_NODE_HEADER_SIZE + 4;
        block[toc + 2..toc + 4].copy_from_slice(&BTOFF_INVALID.to_le_bytes());
        let node = BTreeNode::parse(block, Endian::Little).expect("parse");
        assert!(node.value_at(1, node.geometry()).unwrap().is_empty());
    }

    #[test]
    fn big_endian_header_round_trip() {
        let mut block = vec![0_u8; NODE_SIZE];
        let header = BTreeNodeHeader {
            object: ObjectHeader {
                checksum: 0,
                oid: ObjectId(5),
                xid: Xid(6),
                type_and_flags: OBJECT_TYPE_BTREE,
                subtype: OBJECT_TYPE_OMAP,
            },
            flags: BTNODE_ROOT | BTNODE_LEAF | BTNODE_HASHED,
            level: 0,
            nkeys: 0,
            table_space: NodeLocation { off: 0, len: 8 },
            free_space: NodeLocation { off: 0, len: 100 },
            key_free_list: NodeLocation::default(),
            val_free_list: NodeLocation::default(),
        };
        header.encode_into(&mut block, Endian::Big).expect("encode");
        let node = BTreeNode::parse(block, Endian::Big).expect("parse");
        assert_eq!(*node.header(), header);
        assert!(node.is_hashed());
        assert_eq!(node.endian(), Endian::Big);
    }
}
