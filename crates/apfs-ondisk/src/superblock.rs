//! Container superblock (`nx_superblock_t`).

use crate::object::ObjectHeader;
use apfs_types::{
    BlockSize, Endian, NX_MAGIC, NX_MAX_FILE_SYSTEMS, OBJECT_TYPE_NX_SUPERBLOCK, ObjectId, Paddr,
    ParseError, Xid, read_fixed,
};
use serde::{Deserialize, Serialize};

/// Bytes of the superblock we decode: everything up to the end of `nx_fs_oid`.
pub const NX_SUPERBLOCK_PARSED_SIZE: usize = 0xB8 + NX_MAX_FILE_SYSTEMS * 8;

/// High bit of `nx_xp_desc_blocks` / `nx_xp_data_blocks`: area is a B-tree, not a ring.
pub const NX_XP_NONCONTIGUOUS: u32 = 0x8000_0000;

pub const NX_INCOMPAT_VERSION1: u64 = 0x0000_0001;
pub const NX_INCOMPAT_VERSION2: u64 = 0x0000_0002;
pub const NX_INCOMPAT_FUSION: u64 = 0x0000_0100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSuperblock {
    pub header: ObjectHeader,
    pub block_size: u32,
    pub block_count: u64,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub uuid: [u8; 16],
    pub next_oid: ObjectId,
    pub next_xid: Xid,
    pub xp_desc_blocks: u32,
    pub xp_data_blocks: u32,
    pub xp_desc_base: Paddr,
    pub xp_data_base: Paddr,
    pub xp_desc_next: u32,
    pub xp_data_next: u32,
    pub xp_desc_index: u32,
    pub xp_desc_len: u32,
    pub xp_data_index: u32,
    pub xp_data_len: u32,
    pub spaceman_oid: ObjectId,
    /// Physical address of the container object map.
    pub omap_oid: Paddr,
    pub reaper_oid: ObjectId,
    pub test_type: u32,
    pub max_file_systems: u32,
    /// Virtual oids of volume superblocks; unused slots are zero.
    pub fs_oids: Vec<ObjectId>,
}

impl ContainerSuperblock {
    /// Work out the container byte order from the magic at offset 0x20.
    pub fn detect_endian(block: &[u8]) -> Result<Endian, ParseError> {
        let magic = read_fixed::<4>(block, 0x20)?;
        Endian::detect(magic).ok_or(ParseError::InvalidMagic {
            expected: u64::from(NX_MAGIC),
            actual: u64::from(u32::from_le_bytes(magic)),
        })
    }

    pub fn parse_from_block(block: &[u8], endian: Endian) -> Result<Self, ParseError> {
        if block.len() < NX_SUPERBLOCK_PARSED_SIZE {
            return Err(ParseError::InsufficientData {
                needed: NX_SUPERBLOCK_PARSED_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        let magic = endian.read_u32(block, 0x20)?;
        if magic != NX_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(NX_MAGIC),
                actual: u64::from(magic),
            });
        }

        let header = ObjectHeader::parse(block, endian)?;
        header.expect_type(OBJECT_TYPE_NX_SUPERBLOCK)?;

        let block_size = endian.read_u32(block, 0x24)?;
        BlockSize::new(block_size)?;

        let max_file_systems = endian.read_u32(block, 0xB4)?;
        if max_file_systems as usize > NX_MAX_FILE_SYSTEMS {
            return Err(ParseError::InvalidField {
                field: "nx_max_file_systems",
                reason: "exceeds NX_MAX_FILE_SYSTEMS",
            });
        }

        let mut fs_oids = Vec::with_capacity(NX_MAX_FILE_SYSTEMS);
        for idx in 0..NX_MAX_FILE_SYSTEMS {
            fs_oids.push(ObjectId(endian.read_u64(block, 0xB8 + idx * 8)?));
        }

        Ok(Self {
            header,
            block_size,
            block_count: endian.read_u64(block, 0x28)?,
            features: endian.read_u64(block, 0x30)?,
            readonly_compatible_features: endian.read_u64(block, 0x38)?,
            incompatible_features: endian.read_u64(block, 0x40)?,
            uuid: read_fixed::<16>(block, 0x48)?,
            next_oid: ObjectId(endian.read_u64(block, 0x58)?),
            next_xid: Xid(endian.read_u64(block, 0x60)?),
            xp_desc_blocks: endian.read_u32(block, 0x68)?,
            xp_data_blocks: endian.read_u32(block, 0x6C)?,
            xp_desc_base: Paddr(endian.read_u64(block, 0x70)?),
            xp_data_base: Paddr(endian.read_u64(block, 0x78)?),
            xp_desc_next: endian.read_u32(block, 0x80)?,
            xp_data_next: endian.read_u32(block, 0x84)?,
            xp_desc_index: endian.read_u32(block, 0x88)?,
            xp_desc_len: endian.read_u32(block, 0x8C)?,
            xp_data_index: endian.read_u32(block, 0x90)?,
            xp_data_len: endian.read_u32(block, 0x94)?,
            spaceman_oid: ObjectId(endian.read_u64(block, 0x98)?),
            omap_oid: Paddr(endian.read_u64(block, 0xA0)?),
            reaper_oid: ObjectId(endian.read_u64(block, 0xA8)?),
            test_type: endian.read_u32(block, 0xB0)?,
            max_file_systems,
            fs_oids,
        })
    }

    /// Write every decoded field back; the checksum is left as in `header`.
    pub fn encode_into(&self, out: &mut [u8], endian: Endian) -> Result<(), ParseError> {
        if self.fs_oids.len() > NX_MAX_FILE_SYSTEMS {
            return Err(ParseError::InvalidField {
                field: "nx_fs_oid",
                reason: "exceeds NX_MAX_FILE_SYSTEMS",
            });
        }
        self.header.encode_into(out, endian)?;
        endian.put_u32(out, 0x20, NX_MAGIC)?;
        endian.put_u32(out, 0x24, self.block_size)?;
        endian.put_u64(out, 0x28, self.block_count)?;
        endian.put_u64(out, 0x30, self.features)?;
        endian.put_u64(out, 0x38, self.readonly_compatible_features)?;
        endian.put_u64(out, 0x40, self.incompatible_features)?;
        let Some(uuid) = out.get_mut(0x48..0x58) else {
            return Err(ParseError::InsufficientData {
                needed: 16,
                offset: 0x48,
                actual: out.len().saturating_sub(0x48),
            });
        };
        uuid.copy_from_slice(&self.uuid);
        endian.put_u64(out, 0x58, self.next_oid.0)?;
        endian.put_u64(out, 0x60, self.next_xid.0)?;
        endian.put_u32(out, 0x68, self.xp_desc_blocks)?;
        endian.put_u32(out, 0x6C, self.xp_data_blocks)?;
        endian.put_u64(out, 0x70, self.xp_desc_base.0)?;
        endian.put_u64(out, 0x78, self.xp_data_base.0)?;
        endian.put_u32(out, 0x80, self.xp_desc_next)?;
        endian.put_u32(out, 0x84, self.xp_data_next)?;
        endian.put_u32(out, 0x88, self.xp_desc_index)?;
        endian.put_u32(out, 0x8C, self.xp_desc_len)?;
        endian.put_u32(out, 0x90, self.xp_data_index)?;
        endian.put_u32(out, 0x94, self.xp_data_len)?;
        endian.put_u64(out, 0x98, self.spaceman_oid.0)?;
        endian.put_u64(out, 0xA0, self.omap_oid.0)?;
        endian.put_u64(out, 0xA8, self.reaper_oid.0)?;
        endian.put_u32(out, 0xB0, self.test_type)?;
        endian.put_u32(out, 0xB4, self.max_file_systems)?;
        for idx in 0..NX_MAX_FILE_SYSTEMS {
            let oid = self.fs_oids.get(idx).map_or(0, |oid| oid.0);
            endian.put_u64(out, 0xB8 + idx * 8, oid)?;
        }
        Ok(())
    }

    /// Number of blocks in the checkpoint descriptor ring.
    #[must_use]
    pub fn desc_blocks(&self) -> u32 {
        self.xp_desc_blocks & !NX_XP_NONCONTIGUOUS
    }

    #[must_use]
    pub fn is_desc_contiguous(&self) -> bool {
        self.xp_desc_blocks & NX_XP_NONCONTIGUOUS == 0
    }

    /// Address of descriptor-ring slot `index`, counted from the start of the ring.
    #[must_use]
    pub fn desc_block(&self, index: u32) -> Option<Paddr> {
        let blocks = self.desc_blocks();
        if blocks == 0 {
            return None;
        }
        self.xp_desc_base.checked_add(u64::from(index % blocks))
    }

    /// Address of block `i` of this checkpoint, counted from `xp_desc_index`.
    ///
    /// The ring wraps, so block `i` lives at
    /// `base + (desc_index + i) % desc_blocks`.
    #[must_use]
    pub fn checkpoint_desc_block(&self, i: u32) -> Option<Paddr> {
        let blocks = self.desc_blocks();
        if blocks == 0 {
            return None;
        }
        let slot = (u64::from(self.xp_desc_index) + u64::from(i)) % u64::from(blocks);
        self.xp_desc_base.checked_add(slot)
    }

    /// Volume superblock oid in slot `index`, if that slot is used.
    #[must_use]
    pub fn volume_oid(&self, index: usize) -> Option<ObjectId> {
        if index >= self.max_file_systems as usize {
            return None;
        }
        self.fs_oids
            .get(index)
            .copied()
            .filter(|oid| oid.0 != 0)
    }

    /// All populated volume oids, in slot order.
    pub fn volume_oids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        (0..self.max_file_systems as usize).filter_map(|idx| self.volume_oid(idx))
    }

    #[must_use]
    pub fn is_fusion(&self) -> bool {
        self.incompatible_features & NX_INCOMPAT_FUSION != 0
    }
}
