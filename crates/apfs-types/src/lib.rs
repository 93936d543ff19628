#![forbid(unsafe_code)]
//! Shared newtypes, on-disk constants, and bounds-checked byte readers.
//!
//! Everything here is pure data: no I/O, no allocation beyond what the
//! caller asks for. Parsers in `apfs-ondisk` build on the readers below and
//! report failures as [`ParseError`]; runtime crates convert those into
//! `apfs_error::ApfsError` at their boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// `'NXSB'` as stored in a little-endian container superblock.
pub const NX_MAGIC: u32 = 0x4253_584E;
/// `'APSB'` as stored in a little-endian volume superblock.
pub const APFS_MAGIC: u32 = 0x4253_5041;

pub const NX_MINIMUM_BLOCK_SIZE: u32 = 4096;
pub const NX_MAXIMUM_BLOCK_SIZE: u32 = 65536;
pub const NX_DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const NX_MAX_FILE_SYSTEMS: usize = 100;

/// Size of the `obj_phys_t` header that prefixes every object.
pub const OBJ_HEADER_SIZE: usize = 32;
/// Size of the Fletcher-64 checksum field at the start of the header.
pub const OBJ_CHECKSUM_SIZE: usize = 8;

// ── Object identifiers ──────────────────────────────────────────────────────

pub const OID_INVALID: u64 = 0;
pub const OID_NX_SUPERBLOCK: u64 = 1;
/// Virtual and ephemeral oids below this value are reserved.
pub const OID_RESERVED_COUNT: u64 = 1024;

// ── Object type field (`o_type`) ────────────────────────────────────────────

pub const OBJECT_TYPE_MASK: u32 = 0x0000_FFFF;
pub const OBJECT_TYPE_FLAGS_MASK: u32 = 0xFFFF_0000;
pub const OBJ_STORAGETYPE_MASK: u32 = 0xC000_0000;

pub const OBJ_VIRTUAL: u32 = 0x0000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
pub const OBJ_PHYSICAL: u32 = 0x4000_0000;
pub const OBJ_NOHEADER: u32 = 0x2000_0000;
pub const OBJ_ENCRYPTED: u32 = 0x1000_0000;
pub const OBJ_NONPERSISTENT: u32 = 0x0800_0000;

pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x0001;
pub const OBJECT_TYPE_BTREE: u32 = 0x0002;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x0003;
pub const OBJECT_TYPE_SPACEMAN: u32 = 0x0005;
pub const OBJECT_TYPE_SPACEMAN_CAB: u32 = 0x0006;
pub const OBJECT_TYPE_SPACEMAN_CIB: u32 = 0x0007;
pub const OBJECT_TYPE_SPACEMAN_BITMAP: u32 = 0x0008;
pub const OBJECT_TYPE_SPACEMAN_FREE_QUEUE: u32 = 0x0009;
pub const OBJECT_TYPE_EXTENT_LIST_TREE: u32 = 0x000A;
pub const OBJECT_TYPE_OMAP: u32 = 0x000B;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u32 = 0x000C;
pub const OBJECT_TYPE_FS: u32 = 0x000D;
pub const OBJECT_TYPE_FSTREE: u32 = 0x000E;
pub const OBJECT_TYPE_BLOCKREFTREE: u32 = 0x000F;
pub const OBJECT_TYPE_SNAPMETATREE: u32 = 0x0010;
pub const OBJECT_TYPE_NX_REAPER: u32 = 0x0011;
pub const OBJECT_TYPE_NX_REAP_LIST: u32 = 0x0012;
pub const OBJECT_TYPE_OMAP_SNAPSHOT: u32 = 0x0013;
pub const OBJECT_TYPE_EFI_JUMPSTART: u32 = 0x0014;
pub const OBJECT_TYPE_FUSION_MIDDLE_TREE: u32 = 0x0015;
pub const OBJECT_TYPE_NX_FUSION_WBC: u32 = 0x0016;
pub const OBJECT_TYPE_NX_FUSION_WBC_LIST: u32 = 0x0017;
pub const OBJECT_TYPE_ER_STATE: u32 = 0x0018;
pub const OBJECT_TYPE_GBITMAP: u32 = 0x0019;
pub const OBJECT_TYPE_GBITMAP_TREE: u32 = 0x001A;
pub const OBJECT_TYPE_GBITMAP_BLOCK: u32 = 0x001B;
pub const OBJECT_TYPE_INVALID: u32 = 0x0000;
pub const OBJECT_TYPE_TEST: u32 = 0x00FF;

/// Type names for diagnostics, indexed by the masked `o_type` value.
const OBJECT_TYPE_NAMES: &[(u32, &str)] = &[
    (OBJECT_TYPE_INVALID, "invalid"),
    (OBJECT_TYPE_NX_SUPERBLOCK, "nx_superblock"),
    (OBJECT_TYPE_BTREE, "btree"),
    (OBJECT_TYPE_BTREE_NODE, "btree_node"),
    (OBJECT_TYPE_SPACEMAN, "spaceman"),
    (OBJECT_TYPE_SPACEMAN_CAB, "spaceman_cab"),
    (OBJECT_TYPE_SPACEMAN_CIB, "spaceman_cib"),
    (OBJECT_TYPE_SPACEMAN_BITMAP, "spaceman_bitmap"),
    (OBJECT_TYPE_SPACEMAN_FREE_QUEUE, "spaceman_free_queue"),
    (OBJECT_TYPE_EXTENT_LIST_TREE, "extent_list_tree"),
    (OBJECT_TYPE_OMAP, "omap"),
    (OBJECT_TYPE_CHECKPOINT_MAP, "checkpoint_map"),
    (OBJECT_TYPE_FS, "fs"),
    (OBJECT_TYPE_FSTREE, "fstree"),
    (OBJECT_TYPE_BLOCKREFTREE, "blockreftree"),
    (OBJECT_TYPE_SNAPMETATREE, "snapmetatree"),
    (OBJECT_TYPE_NX_REAPER, "nx_reaper"),
    (OBJECT_TYPE_NX_REAP_LIST, "nx_reap_list"),
    (OBJECT_TYPE_OMAP_SNAPSHOT, "omap_snapshot"),
    (OBJECT_TYPE_EFI_JUMPSTART, "efi_jumpstart"),
    (OBJECT_TYPE_FUSION_MIDDLE_TREE, "fusion_middle_tree"),
    (OBJECT_TYPE_NX_FUSION_WBC, "nx_fusion_wbc"),
    (OBJECT_TYPE_NX_FUSION_WBC_LIST, "nx_fusion_wbc_list"),
    (OBJECT_TYPE_ER_STATE, "er_state"),
    (OBJECT_TYPE_GBITMAP, "gbitmap"),
    (OBJECT_TYPE_GBITMAP_TREE, "gbitmap_tree"),
    (OBJECT_TYPE_GBITMAP_BLOCK, "gbitmap_block"),
    (OBJECT_TYPE_TEST, "test"),
];

/// Human-readable name of an object type code (flags are masked off).
#[must_use]
pub fn object_type_name(type_and_flags: u32) -> &'static str {
    let code = type_and_flags & OBJECT_TYPE_MASK;
    OBJECT_TYPE_NAMES
        .iter()
        .find(|(known, _)| *known == code)
        .map_or("unknown", |(_, name)| name)
}

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Object identifier. Its meaning depends on the object's storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub const INVALID: Self = Self(OID_INVALID);
    pub const NX_SUPERBLOCK: Self = Self(OID_NX_SUPERBLOCK);

    /// Whether this oid falls in the reserved range for virtual/ephemeral objects.
    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 < OID_RESERVED_COUNT
    }
}

/// Transaction identifier; the version stamp of every object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid(pub u64);

impl Xid {
    /// "As of now": compares greater than or equal to every stored xid.
    pub const LATEST: Self = Self(u64::MAX);
}

/// Physical block address within the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Paddr(pub u64);

impl Paddr {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }

    /// Byte offset of this block for the given block size.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<u64> {
        block_size.block_to_byte(self)
    }
}

/// Validated container block size (power of two in 4096..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [4096, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two()
            || !(NX_MINIMUM_BLOCK_SIZE..=NX_MAXIMUM_BLOCK_SIZE).contains(&value)
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 4096..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        // 65536 always fits in usize on supported targets.
        self.0 as usize
    }

    /// Convert a block address to a byte offset, `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, block: Paddr) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }

    /// Number of whole blocks needed to hold `bytes`.
    #[must_use]
    pub fn blocks_for(self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.0))
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(NX_DEFAULT_BLOCK_SIZE)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Storage classes and object references ───────────────────────────────────

/// The three addressing spaces an oid can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    /// Located through the object map, versioned by xid.
    Virtual,
    /// Located through the current checkpoint's mapping blocks.
    Ephemeral,
    /// The oid is the block address.
    Physical,
}

impl StorageClass {
    /// Decode the storage bits of an `o_type` field.
    ///
    /// Returns `None` when both the ephemeral and physical bits are set.
    #[must_use]
    pub fn from_type_flags(type_and_flags: u32) -> Option<Self> {
        match type_and_flags & OBJ_STORAGETYPE_MASK {
            OBJ_VIRTUAL => Some(Self::Virtual),
            OBJ_EPHEMERAL => Some(Self::Ephemeral),
            OBJ_PHYSICAL => Some(Self::Physical),
            _ => None,
        }
    }
}

/// A reference to an object, tagged with the addressing space it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectRef {
    Physical(Paddr),
    Virtual { oid: ObjectId, xid: Xid },
    Ephemeral(ObjectId),
}

impl ObjectRef {
    #[must_use]
    pub fn storage_class(self) -> StorageClass {
        match self {
            Self::Physical(_) => StorageClass::Physical,
            Self::Virtual { .. } => StorageClass::Virtual,
            Self::Ephemeral(_) => StorageClass::Ephemeral,
        }
    }

    /// The raw oid carried by the reference (the block address for physical refs).
    #[must_use]
    pub fn oid(self) -> ObjectId {
        match self {
            Self::Physical(paddr) => ObjectId(paddr.0),
            Self::Virtual { oid, .. } | Self::Ephemeral(oid) => oid,
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Physical(paddr) => write!(f, "physical({paddr})"),
            Self::Virtual { oid, xid } => write!(f, "virtual({oid}@{xid})"),
            Self::Ephemeral(oid) => write!(f, "ephemeral({oid})"),
        }
    }
}

// ── Parse errors and byte readers ───────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    let actual = data.len().saturating_sub(offset);
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    read_fixed::<2>(data, offset).map(u16::from_le_bytes)
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    read_fixed::<4>(data, offset).map(u32::from_le_bytes)
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    read_fixed::<8>(data, offset).map(u64::from_le_bytes)
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    read_fixed::<2>(data, offset).map(u16::from_be_bytes)
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    read_fixed::<4>(data, offset).map(u32::from_be_bytes)
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    read_fixed::<8>(data, offset).map(u64::from_be_bytes)
}

/// Container-wide byte order, chosen once when the container is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Detect the byte order from the four magic bytes of a container superblock.
    #[must_use]
    pub fn detect(magic: [u8; 4]) -> Option<Self> {
        if u32::from_le_bytes(magic) == NX_MAGIC {
            Some(Self::Little)
        } else if u32::from_be_bytes(magic) == NX_MAGIC {
            Some(Self::Big)
        } else {
            None
        }
    }

    #[inline]
    pub fn read_u16(self, data: &[u8], offset: usize) -> Result<u16, ParseError> {
        match self {
            Self::Little => read_le_u16(data, offset),
            Self::Big => read_be_u16(data, offset),
        }
    }

    #[inline]
    pub fn read_u32(self, data: &[u8], offset: usize) -> Result<u32, ParseError> {
        match self {
            Self::Little => read_le_u32(data, offset),
            Self::Big => read_be_u32(data, offset),
        }
    }

    #[inline]
    pub fn read_u64(self, data: &[u8], offset: usize) -> Result<u64, ParseError> {
        match self {
            Self::Little => read_le_u64(data, offset),
            Self::Big => read_be_u64(data, offset),
        }
    }

    #[inline]
    pub fn put_u16(self, data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 2)?.copy_from_slice(&bytes);
        Ok(())
    }

    #[inline]
    pub fn put_u32(self, data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 4)?.copy_from_slice(&bytes);
        Ok(())
    }

    #[inline]
    pub fn put_u64(self, data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        ensure_slice_mut(data, offset, 8)?.copy_from_slice(&bytes);
        Ok(())
    }
}
