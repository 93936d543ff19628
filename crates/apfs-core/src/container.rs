//! Container bootstrap: from the superblock to a bound resolver.

use crate::checkpoint::CheckpointMap;
use crate::omap::ObjectMap;
use crate::options::ResolverOptions;
use crate::resolver::{AddressResolver, ResolvedObject};
use crate::verify_object;
use apfs_block::{
    BlockSource, ByteBlockSource, FileByteDevice, read_container_superblock_region,
};
use apfs_btree::parse_to_apfs_error;
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{CheckpointMapping, ContainerSuperblock, ObjectHeader, OmapPhys, verify_checksum};
use apfs_types::{
    APFS_MAGIC, BlockSize, Endian, OBJ_HEADER_SIZE, OBJECT_TYPE_FS, OBJECT_TYPE_NX_SUPERBLOCK,
    ObjectRef, Paddr, Xid,
};
use std::path::Path;
use tracing::{debug, trace, warn};

/// A valid container superblock found in the checkpoint descriptor area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCandidate {
    pub paddr: Paddr,
    pub xid: Xid,
    pub superblock: ContainerSuperblock,
}

/// An opened container, bound to one checkpoint.
#[derive(Debug)]
pub struct Container<S: BlockSource> {
    superblock_paddr: Paddr,
    superblock: ContainerSuperblock,
    resolver: AddressResolver<S>,
}

impl<S: BlockSource> Container<S> {
    /// Open the checkpoint named by the superblock at block 0.
    pub fn open(source: S, options: ResolverOptions) -> Result<Self> {
        Self::open_at(source, Paddr(0), options)
    }

    /// Open the checkpoint whose superblock copy lives at `paddr`.
    ///
    /// Used to bind an older or newer checkpoint than block 0 names, for
    /// example the result of [`latest_checkpoint`](Self::latest_checkpoint).
    pub fn open_at(source: S, paddr: Paddr, options: ResolverOptions) -> Result<Self> {
        let block = source.read_block(paddr)?;
        let endian = match options.endian {
            Some(endian) => endian,
            None => ContainerSuperblock::detect_endian(block.as_slice())
                .map_err(|e| parse_to_apfs_error(paddr.0, &e))?,
        };
        verify_object(block.as_slice(), endian, paddr, "container superblock")?;
        let superblock = ContainerSuperblock::parse_from_block(block.as_slice(), endian)
            .map_err(|e| parse_to_apfs_error(paddr.0, &e))?;
        superblock
            .header
            .expect_type(OBJECT_TYPE_NX_SUPERBLOCK)
            .map_err(|e| parse_to_apfs_error(paddr.0, &e))?;
        if superblock.block_size != source.block_size() {
            return Err(ApfsError::Format(format!(
                "superblock block size {} does not match source block size {}",
                superblock.block_size,
                source.block_size()
            )));
        }

        let checkpoint_map = CheckpointMap::from_superblock(
            &superblock,
            endian,
            options.max_checkpoint_map_blocks,
        )?;
        let mut resolver =
            AddressResolver::new(source, endian, options).with_checkpoint_map(checkpoint_map);
        if superblock.omap_oid.0 != 0 {
            let omap_paddr = superblock.omap_oid;
            let object = resolver.resolve(ObjectRef::Physical(omap_paddr))?;
            let phys = OmapPhys::parse(&object.bytes, endian)
                .map_err(|e| parse_to_apfs_error(omap_paddr.0, &e))?;
            resolver = resolver.with_object_map(ObjectMap::from_phys(omap_paddr, endian, phys)?);
        }

        debug!(
            paddr = paddr.0,
            xid = superblock.header.xid.0,
            endian = ?endian,
            block_size = superblock.block_size,
            block_count = superblock.block_count,
            omap = superblock.omap_oid.0,
            volumes = superblock.volume_oids().count(),
            "container_open"
        );
        Ok(Self {
            superblock_paddr: paddr,
            superblock,
            resolver,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &ContainerSuperblock {
        &self.superblock
    }

    /// Block the bound superblock was read from.
    #[must_use]
    pub fn superblock_paddr(&self) -> Paddr {
        self.superblock_paddr
    }

    /// Transaction of the bound checkpoint.
    #[must_use]
    pub fn xid(&self) -> Xid {
        self.superblock.header.xid
    }

    #[must_use]
    pub fn endian(&self) -> Endian {
        self.resolver.endian()
    }

    #[must_use]
    pub fn resolver(&self) -> &AddressResolver<S> {
        &self.resolver
    }

    pub fn into_resolver(self) -> AddressResolver<S> {
        self.resolver
    }

    /// Scan the descriptor area for the valid superblock with the highest
    /// xid.
    ///
    /// Slots holding anything else, or a superblock that fails its
    /// checksum, are skipped. The bound checkpoint is left alone; reopen
    /// with [`open_at`](Self::open_at) to switch.
    pub fn latest_checkpoint(&self) -> Result<CheckpointCandidate> {
        let source = self.resolver.source();
        let endian = self.endian();
        let header_len = u32::try_from(OBJ_HEADER_SIZE)
            .map_err(|_| ApfsError::Format("object header size".to_owned()))?;

        let mut best: Option<CheckpointCandidate> = None;
        for slot in 0..self.superblock.desc_blocks() {
            let Some(paddr) = self.superblock.desc_block(slot) else {
                continue;
            };
            let raw = source.read_bytes(paddr, 0, header_len)?;
            let Ok(header) = ObjectHeader::parse(&raw, endian) else {
                continue;
            };
            if header.type_code() != OBJECT_TYPE_NX_SUPERBLOCK {
                continue;
            }

            let block = source.read_block(paddr)?;
            if !verify_checksum(block.as_slice(), endian) {
                warn!(block = paddr.0, xid = header.xid.0, "checkpoint_superblock_checksum");
                continue;
            }
            let superblock = match ContainerSuperblock::parse_from_block(block.as_slice(), endian) {
                Ok(superblock) => superblock,
                Err(err) => {
                    warn!(block = paddr.0, error = %err, "checkpoint_superblock_invalid");
                    continue;
                }
            };
            if superblock.block_size != self.superblock.block_size {
                continue;
            }
            trace!(paddr = paddr.0, xid = superblock.header.xid.0, "checkpoint_candidate");
            if best
                .as_ref()
                .is_none_or(|current| superblock.header.xid > current.xid)
            {
                best = Some(CheckpointCandidate {
                    paddr,
                    xid: superblock.header.xid,
                    superblock,
                });
            }
        }

        best.ok_or_else(|| ApfsError::CorruptObject {
            block: self.superblock.xp_desc_base.0,
            detail: "no valid superblock in the checkpoint descriptor area".to_owned(),
        })
    }

    /// Every ephemeral-object mapping of the bound checkpoint.
    pub fn checkpoint_mappings(&self) -> Result<Vec<CheckpointMapping>> {
        match self.resolver.checkpoint_map() {
            Some(map) => map.mappings(self.resolver.source()),
            None => Ok(Vec::new()),
        }
    }

    /// Resolve the volume superblock in `nx_fs_oid` slot `index`, as of the
    /// bound checkpoint.
    pub fn volume(&self, index: usize) -> Result<ResolvedObject> {
        let oid = self
            .superblock
            .volume_oid(index)
            .ok_or_else(|| ApfsError::KeyNotFound(format!("volume slot {index} is empty")))?;
        let object = self.resolver.resolve(ObjectRef::Virtual {
            oid,
            xid: self.xid(),
        })?;
        if object.header.type_code() != OBJECT_TYPE_FS {
            return Err(ApfsError::CorruptObject {
                block: object.paddr.0,
                detail: format!(
                    "volume {oid} is a {} object",
                    object.header.type_name()
                ),
            });
        }
        let magic = self
            .endian()
            .read_u32(&object.bytes, OBJ_HEADER_SIZE)
            .map_err(|e| parse_to_apfs_error(object.paddr.0, &e))?;
        if magic != APFS_MAGIC {
            return Err(ApfsError::Format(format!(
                "volume {oid} has magic {magic:#x}, expected {APFS_MAGIC:#x}"
            )));
        }
        Ok(object)
    }

    /// Every populated volume slot, in slot order.
    pub fn volumes(&self) -> Result<Vec<ResolvedObject>> {
        (0..self.superblock.max_file_systems as usize)
            .filter(|index| self.superblock.volume_oid(*index).is_some())
            .map(|index| self.volume(index))
            .collect()
    }
}

impl Container<ByteBlockSource<FileByteDevice>> {
    /// Open an image file, taking the block size from its superblock.
    pub fn open_file(path: impl AsRef<Path>, options: ResolverOptions) -> Result<Self> {
        let device = FileByteDevice::open(path)?;
        let region = read_container_superblock_region(&device)?;
        let endian = match options.endian {
            Some(endian) => endian,
            None => ContainerSuperblock::detect_endian(&region)
                .map_err(|e| parse_to_apfs_error(0, &e))?,
        };
        let superblock = ContainerSuperblock::parse_from_block(&region, endian)
            .map_err(|e| parse_to_apfs_error(0, &e))?;
        let block_size =
            BlockSize::new(superblock.block_size).map_err(|e| parse_to_apfs_error(0, &e))?;
        let source = ByteBlockSource::new(device, block_size)?;
        Self::open(source, options)
    }
}
