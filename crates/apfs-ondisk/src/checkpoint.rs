//! Checkpoint mapping blocks (`checkpoint_map_phys_t`).
//!
//! Each block is a flat, unordered array of ephemeral-object locations for
//! one checkpoint. Blocks follow each other in the checkpoint descriptor
//! area; the final one carries [`CHECKPOINT_MAP_LAST`].

use crate::object::ObjectHeader;
use apfs_types::{Endian, OBJECT_TYPE_CHECKPOINT_MAP, ObjectId, Paddr, ParseError};
use serde::{Deserialize, Serialize};

pub const CHECKPOINT_MAP_LAST: u32 = 0x0000_0001;
pub const CHECKPOINT_MAP_HEADER_SIZE: usize = 40;
pub const CHECKPOINT_MAPPING_SIZE: usize = 40;

/// `checkpoint_mapping_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMapping {
    pub object_type: u32,
    pub subtype: u32,
    pub size: u32,
    pub fs_oid: ObjectId,
    pub oid: ObjectId,
    pub paddr: Paddr,
}

impl CheckpointMapping {
    pub fn parse(data: &[u8], endian: Endian) -> Result<Self, ParseError> {
        Ok(Self {
            object_type: endian.read_u32(data, 0x00)?,
            subtype: endian.read_u32(data, 0x04)?,
            size: endian.read_u32(data, 0x08)?,
            // 0x0C: padding
            fs_oid: ObjectId(endian.read_u64(data, 0x10)?),
            oid: ObjectId(endian.read_u64(data, 0x18)?),
            paddr: Paddr(endian.read_u64(data, 0x20)?),
        })
    }

    pub fn encode_into(&self, out: &mut [u8], endian: Endian) -> Result<(), ParseError> {
        let actual = out.len();
        let dest = out
            .get_mut(..CHECKPOINT_MAPPING_SIZE)
            .ok_or(ParseError::InsufficientData {
                needed: CHECKPOINT_MAPPING_SIZE,
                offset: 0,
                actual,
            })?;
        dest.copy_from_slice(&self.encode(endian));
        Ok(())
    }

    #[must_use]
    pub fn encode(&self, endian: Endian) -> [u8; CHECKPOINT_MAPPING_SIZE] {
        let u32_bytes = |v: u32| match endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        let u64_bytes = |v: u64| match endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        let mut out = [0_u8; CHECKPOINT_MAPPING_SIZE];
        out[0x00..0x04].copy_from_slice(&u32_bytes(self.object_type));
        out[0x04..0x08].copy_from_slice(&u32_bytes(self.subtype));
        out[0x08..0x0C].copy_from_slice(&u32_bytes(self.size));
        out[0x10..0x18].copy_from_slice(&u64_bytes(self.fs_oid.0));
        out[0x18..0x20].copy_from_slice(&u64_bytes(self.oid.0));
        out[0x20..0x28].copy_from_slice(&u64_bytes(self.paddr.0));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMapBlock {
    pub header: ObjectHeader,
    pub flags: u32,
    pub mappings: Vec<CheckpointMapping>,
}

impl CheckpointMapBlock {
    /// Largest mapping count a block of `block_len` bytes can hold.
    #[must_use]
    pub fn capacity(block_len: usize) -> usize {
        block_len.saturating_sub(CHECKPOINT_MAP_HEADER_SIZE) / CHECKPOINT_MAPPING_SIZE
    }

    pub fn parse(block: &[u8], endian: Endian) -> Result<Self, ParseError> {
        if block.len() < CHECKPOINT_MAP_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: CHECKPOINT_MAP_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        let header = ObjectHeader::parse(block, endian)?;
        header.expect_type(OBJECT_TYPE_CHECKPOINT_MAP)?;
        let flags = endian.read_u32(block, 0x20)?;
        let count = endian.read_u32(block, 0x24)?;

        let count = usize::try_from(count)
            .map_err(|_| ParseError::IntegerConversion { field: "cpm_count" })?;
        if count > Self::capacity(block.len()) {
            return Err(ParseError::InvalidField {
                field: "cpm_count",
                reason: "exceeds block capacity",
            });
        }

        let mut mappings = Vec::with_capacity(count);
        for idx in 0..count {
            let base = CHECKPOINT_MAP_HEADER_SIZE + idx * CHECKPOINT_MAPPING_SIZE;
            mappings.push(CheckpointMapping::parse(&block[base..], endian)?);
        }

        Ok(Self {
            header,
            flags,
            mappings,
        })
    }

    /// Write header, flags, count, and mappings into `out`.
    ///
    /// The checksum field is left as given in `header`.
    pub fn encode_into(&self, out: &mut [u8], endian: Endian) -> Result<(), ParseError> {
        if self.mappings.len() > Self::capacity(out.len()) {
            return Err(ParseError::InvalidField {
                field: "cpm_count",
                reason: "exceeds block capacity",
            });
        }
        self.header.encode_into(out, endian)?;
        endian.put_u32(out, 0x20, self.flags)?;
        let count = u32::try_from(self.mappings.len())
            .map_err(|_| ParseError::IntegerConversion { field: "cpm_count" })?;
        endian.put_u32(out, 0x24, count)?;
        for (idx, mapping) in self.mappings.iter().enumerate() {
            let base = CHECKPOINT_MAP_HEADER_SIZE + idx * CHECKPOINT_MAPPING_SIZE;
            mapping.encode_into(&mut out[base..], endian)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.flags & CHECKPOINT_MAP_LAST != 0
    }

    /// Linear scan; the array is unordered.
    #[must_use]
    pub fn find(&self, oid: ObjectId) -> Option<&CheckpointMapping> {
        self.mappings.iter().find(|mapping| mapping.oid == oid)
    }
}
