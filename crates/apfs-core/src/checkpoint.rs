//! Ephemeral-object resolution through the current checkpoint's mapping
//! blocks.

use crate::verify_object;
use apfs_block::BlockSource;
use apfs_btree::parse_to_apfs_error;
use apfs_error::{ApfsError, Result};
use apfs_ondisk::{CheckpointMapBlock, CheckpointMapping, ContainerSuperblock};
use apfs_types::{Endian, ObjectId, Paddr};
use tracing::{debug, trace};

/// The mapping-block chain of one checkpoint.
///
/// Block `i` of the chain lives in descriptor-ring slot
/// `(desc_index + i) % desc_blocks`. Blocks are read on every lookup; the
/// chain is short and only consulted for ephemeral objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMap {
    endian: Endian,
    ring_base: Paddr,
    ring_blocks: u32,
    first_slot: u32,
    max_blocks: u32,
}

impl CheckpointMap {
    /// Bind to the checkpoint described by `superblock`.
    ///
    /// `max_blocks` bounds the chain; by default the checkpoint's declared
    /// descriptor length is used.
    pub fn from_superblock(
        superblock: &ContainerSuperblock,
        endian: Endian,
        max_blocks: Option<u32>,
    ) -> Result<Self> {
        if !superblock.is_desc_contiguous() {
            return Err(ApfsError::UnsupportedFeature(
                "non-contiguous checkpoint descriptor area".to_owned(),
            ));
        }
        let ring_blocks = superblock.desc_blocks();
        if ring_blocks == 0 {
            return Err(ApfsError::CorruptObject {
                block: superblock.header.oid.0,
                detail: "checkpoint descriptor area has no blocks".to_owned(),
            });
        }
        let max_blocks = max_blocks.unwrap_or(superblock.xp_desc_len).min(ring_blocks);
        debug!(
            base = superblock.xp_desc_base.0,
            ring_blocks,
            first_slot = superblock.xp_desc_index,
            max_blocks,
            "checkpoint_map_open"
        );
        Ok(Self {
            endian,
            ring_base: superblock.xp_desc_base,
            ring_blocks,
            first_slot: superblock.xp_desc_index,
            max_blocks,
        })
    }

    /// Address of chain block `i`.
    #[must_use]
    pub fn block_address(&self, i: u32) -> Option<Paddr> {
        let slot = (u64::from(self.first_slot) + u64::from(i)) % u64::from(self.ring_blocks);
        self.ring_base.checked_add(slot)
    }

    #[must_use]
    pub fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    fn read_block<S: BlockSource + ?Sized>(
        &self,
        source: &S,
        i: u32,
    ) -> Result<(Paddr, CheckpointMapBlock)> {
        let paddr = self.block_address(i).ok_or(ApfsError::OutOfRange {
            block: self.ring_base.0,
            block_count: source.block_count(),
        })?;
        let block = source.read_block(paddr)?;
        verify_object(block.as_slice(), self.endian, paddr, "checkpoint map")?;
        let parsed = CheckpointMapBlock::parse(block.as_slice(), self.endian)
            .map_err(|e| parse_to_apfs_error(paddr.0, &e))?;
        trace!(
            paddr = paddr.0,
            index = i,
            count = parsed.mappings.len(),
            last = parsed.is_last(),
            "checkpoint_map_scan"
        );
        Ok((paddr, parsed))
    }

    /// Find the mapping for ephemeral object `oid`.
    ///
    /// Scans block after block until the oid turns up or a block flagged
    /// LAST has been searched. Running out of chain before LAST is
    /// corruption, not absence.
    pub fn resolve<S: BlockSource + ?Sized>(
        &self,
        source: &S,
        oid: ObjectId,
    ) -> Result<CheckpointMapping> {
        for i in 0..self.max_blocks {
            let (paddr, block) = self.read_block(source, i)?;
            if let Some(mapping) = block.find(oid) {
                debug!(
                    oid = oid.0,
                    paddr = mapping.paddr.0,
                    map_block = paddr.0,
                    "checkpoint_map_hit"
                );
                return Ok(*mapping);
            }
            if block.is_last() {
                return Err(ApfsError::KeyNotFound(format!(
                    "ephemeral object {oid} not in checkpoint map"
                )));
            }
        }
        Err(self.unterminated())
    }

    /// Every mapping in the chain, in on-disk order.
    pub fn mappings<S: BlockSource + ?Sized>(&self, source: &S) -> Result<Vec<CheckpointMapping>> {
        let mut out = Vec::new();
        for i in 0..self.max_blocks {
            let (_, block) = self.read_block(source, i)?;
            let last = block.is_last();
            out.extend(block.mappings);
            if last {
                return Ok(out);
            }
        }
        Err(self.unterminated())
    }

    fn unterminated(&self) -> ApfsError {
        ApfsError::CorruptObject {
            block: self.block_address(0).map_or(self.ring_base.0, |p| p.0),
            detail: format!(
                "checkpoint map chain has no LAST block within {} blocks",
                self.max_blocks
            ),
        }
    }
}
