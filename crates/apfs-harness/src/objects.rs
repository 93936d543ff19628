//! Builders for single sealed objects: raw objects, omaps, checkpoint
//! mapping chains, and container/volume superblocks.

use anyhow::{Context, Result, ensure};
use apfs_ondisk::checkpoint::CHECKPOINT_MAP_LAST;
use apfs_ondisk::{
    CheckpointMapBlock, CheckpointMapping, ContainerSuperblock, ObjectHeader, OmapPhys,
    seal_object,
};
use apfs_types::{
    APFS_MAGIC, Endian, NX_MAX_FILE_SYSTEMS, OBJ_EPHEMERAL, OBJ_HEADER_SIZE, OBJ_PHYSICAL,
    OBJ_VIRTUAL, OBJECT_TYPE_BTREE, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_FS,
    OBJECT_TYPE_INVALID, OBJECT_TYPE_NX_SUPERBLOCK, OBJECT_TYPE_OMAP, ObjectId, Paddr, Xid,
};

/// A sealed object of `size` bytes whose body (after the 32-byte header)
/// starts with `payload`.
pub fn raw_object(
    endian: Endian,
    size: usize,
    header: ObjectHeader,
    payload: &[u8],
) -> Result<Vec<u8>> {
    ensure!(
        OBJ_HEADER_SIZE + payload.len() <= size,
        "payload of {} bytes does not fit a {size}-byte object",
        payload.len()
    );
    let mut block = vec![0_u8; size];
    header.encode_into(&mut block, endian)?;
    block[OBJ_HEADER_SIZE..OBJ_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    seal_object(&mut block, endian)?;
    Ok(block)
}

#[must_use]
pub fn header(oid: u64, xid: u64, type_and_flags: u32, subtype: u32) -> ObjectHeader {
    ObjectHeader {
        checksum: 0,
        oid: ObjectId(oid),
        xid: Xid(xid),
        type_and_flags,
        subtype,
    }
}

/// Object map whose trees are physical.
pub fn omap_object(
    endian: Endian,
    block_size: usize,
    paddr: Paddr,
    xid: u64,
    tree: Paddr,
    snapshots: Option<(Paddr, u32, Xid)>,
) -> Result<Vec<u8>> {
    let (snapshot_tree_oid, snap_count, most_recent_snap) = match snapshots {
        Some((root, count, latest)) => (ObjectId(root.0), count, latest),
        None => (ObjectId(0), 0, Xid(0)),
    };
    let omap = OmapPhys {
        header: header(paddr.0, xid, OBJECT_TYPE_OMAP | OBJ_PHYSICAL, OBJECT_TYPE_INVALID),
        flags: 0,
        snap_count,
        tree_type: OBJECT_TYPE_BTREE | OBJ_PHYSICAL,
        snapshot_tree_type: OBJECT_TYPE_BTREE | OBJ_PHYSICAL,
        tree_oid: ObjectId(tree.0),
        snapshot_tree_oid,
        most_recent_snap,
        pending_revert_min: Xid(0),
        pending_revert_max: Xid(0),
    };
    let mut block = vec![0_u8; block_size];
    omap.encode_into(&mut block, endian)?;
    seal_object(&mut block, endian)?;
    Ok(block)
}

/// One checkpoint-mapping block per entry of `blocks`, placed at the
/// matching entry of `paddrs`. The final block carries the LAST flag when
/// `mark_last` is set.
pub fn checkpoint_chain(
    endian: Endian,
    block_size: usize,
    xid: u64,
    paddrs: &[Paddr],
    blocks: &[Vec<CheckpointMapping>],
    mark_last: bool,
) -> Result<Vec<Vec<u8>>> {
    ensure!(
        paddrs.len() == blocks.len(),
        "{} addresses for {} checkpoint blocks",
        paddrs.len(),
        blocks.len()
    );
    let capacity = CheckpointMapBlock::capacity(block_size);
    let mut out = Vec::with_capacity(blocks.len());
    for (idx, (paddr, mappings)) in paddrs.iter().zip(blocks).enumerate() {
        ensure!(
            mappings.len() <= capacity,
            "checkpoint block {idx} holds {} mappings, capacity is {capacity}",
            mappings.len()
        );
        let is_last = idx + 1 == blocks.len();
        let cpm = CheckpointMapBlock {
            header: header(
                paddr.0,
                xid,
                OBJECT_TYPE_CHECKPOINT_MAP | OBJ_PHYSICAL,
                OBJECT_TYPE_INVALID,
            ),
            flags: if is_last && mark_last {
                CHECKPOINT_MAP_LAST
            } else {
                0
            },
            mappings: mappings.clone(),
        };
        let mut block = vec![0_u8; block_size];
        cpm.encode_into(&mut block, endian)
            .with_context(|| format!("encoding checkpoint block {idx}"))?;
        seal_object(&mut block, endian)?;
        out.push(block);
    }
    Ok(out)
}

/// Ephemeral-object mapping as it appears in a checkpoint map.
#[must_use]
pub fn ephemeral_mapping(
    oid: ObjectId,
    object_type: u32,
    size: u32,
    paddr: Paddr,
) -> CheckpointMapping {
    CheckpointMapping {
        object_type: object_type | OBJ_EPHEMERAL,
        subtype: OBJECT_TYPE_INVALID,
        size,
        fs_oid: ObjectId(0),
        oid,
        paddr,
    }
}

/// Encode and seal a container superblock.
pub fn container_superblock(
    endian: Endian,
    block_size: usize,
    superblock: &ContainerSuperblock,
) -> Result<Vec<u8>> {
    let mut block = vec![0_u8; block_size];
    superblock.encode_into(&mut block, endian)?;
    seal_object(&mut block, endian)?;
    Ok(block)
}

/// Skeleton container superblock; callers fill in the checkpoint fields.
#[must_use]
pub fn blank_superblock(block_size: u32, block_count: u64, xid: u64) -> ContainerSuperblock {
    ContainerSuperblock {
        header: header(
            1,
            xid,
            OBJECT_TYPE_NX_SUPERBLOCK | OBJ_EPHEMERAL,
            OBJECT_TYPE_INVALID,
        ),
        block_size,
        block_count,
        features: 0,
        readonly_compatible_features: 0,
        incompatible_features: apfs_ondisk::superblock::NX_INCOMPAT_VERSION2,
        uuid: [0x5A; 16],
        next_oid: ObjectId(0x1_0000),
        next_xid: Xid(xid + 1),
        xp_desc_blocks: 0,
        xp_data_blocks: 0,
        xp_desc_base: Paddr(0),
        xp_data_base: Paddr(0),
        xp_desc_next: 0,
        xp_data_next: 0,
        xp_desc_index: 0,
        xp_desc_len: 0,
        xp_data_index: 0,
        xp_data_len: 0,
        spaceman_oid: ObjectId(0),
        omap_oid: Paddr(0),
        reaper_oid: ObjectId(0),
        test_type: 0,
        max_file_systems: u32::try_from(NX_MAX_FILE_SYSTEMS).unwrap_or(100),
        fs_oids: Vec::new(),
    }
}

/// Minimal volume superblock: header, `APSB` magic, and `apfs_fs_index`.
pub fn volume_superblock(
    endian: Endian,
    block_size: usize,
    oid: ObjectId,
    xid: Xid,
    fs_index: u32,
) -> Result<Vec<u8>> {
    let mut payload = [0_u8; 8];
    endian.put_u32(&mut payload, 0, APFS_MAGIC)?;
    endian.put_u32(&mut payload, 4, fs_index)?;
    raw_object(
        endian,
        block_size,
        header(oid.0, xid.0, OBJECT_TYPE_FS | OBJ_VIRTUAL, OBJECT_TYPE_INVALID),
        &payload,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_ondisk::verify_checksum;

    #[test]
    fn chain_marks_only_the_final_block() {
        let mapping = ephemeral_mapping(ObjectId(0x400), 5, 4096, Paddr(9));
        let blocks = checkpoint_chain(
            Endian::Little,
            4096,
            3,
            &[Paddr(1), Paddr(2)],
            &[vec![mapping], vec![]],
            true,
        )
        .expect("chain");
        let first = CheckpointMapBlock::parse(&blocks[0], Endian::Little).expect("first");
        let second = CheckpointMapBlock::parse(&blocks[1], Endian::Little).expect("second");
        assert!(!first.is_last());
        assert!(second.is_last());
        assert_eq!(first.find(ObjectId(0x400)).map(|m| m.paddr), Some(Paddr(9)));
        assert!(blocks.iter().all(|b| verify_checksum(b, Endian::Little)));
    }

    #[test]
    fn superblock_round_trips_through_parser() {
        let mut sb = blank_superblock(4096, 64, 7);
        sb.fs_oids = vec![ObjectId(0x402)];
        let block = container_superblock(Endian::Big, 4096, &sb).expect("encode");
        assert!(verify_checksum(&block, Endian::Big));
        assert_eq!(
            ContainerSuperblock::detect_endian(&block).expect("endian"),
            Endian::Big
        );
        let parsed = ContainerSuperblock::parse_from_block(&block, Endian::Big).expect("parse");
        assert_eq!(parsed.volume_oid(0), Some(ObjectId(0x402)));
        assert_eq!(parsed.header.xid, Xid(7));
    }

    #[test]
    fn payload_must_fit() {
        let err = raw_object(Endian::Little, 64, header(1, 1, 0, 0), &[0_u8; 40]).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }
}
