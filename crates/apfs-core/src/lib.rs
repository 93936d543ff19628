#![forbid(unsafe_code)]
//! Object resolution for APFS containers.
//!
//! Turns an [`ObjectRef`] (physical, virtual, or ephemeral) into the
//! checksum-verified bytes of the object it names:
//!
//! - physical references are block addresses and are read directly;
//! - virtual references go through the [`ObjectMap`], a B-tree keyed by
//!   `(oid, xid)` that picks the newest version not after the requested
//!   transaction;
//! - ephemeral references go through the [`CheckpointMap`], the flat
//!   mapping blocks of the current checkpoint.
//!
//! [`AddressResolver`] is the entry point for all three. [`Container`]
//! bootstraps one from the container superblock at block 0.
//!
//! Every path ends in Fletcher-64 verification. Nothing is retried and
//! nothing falls back to another checkpoint on its own; a caller that wants
//! an older checkpoint opens it explicitly with [`Container::open_at`].

pub mod checkpoint;
pub mod container;
pub mod omap;
pub mod options;
pub mod resolver;

pub use checkpoint::CheckpointMap;
pub use container::{CheckpointCandidate, Container};
pub use omap::ObjectMap;
pub use options::ResolverOptions;
pub use resolver::{AddressResolver, ResolvedObject};

pub use apfs_block::{
    BlockBuf, BlockSource, ByteBlockSource, ByteDevice, FileByteDevice, MemoryByteDevice,
};
pub use apfs_btree::NodeCache;
pub use apfs_error::{ApfsError, Result};
pub use apfs_ondisk::{
    CheckpointMapping, ContainerSuperblock, ObjectHeader, OmapKey, OmapSnapshot, OmapValue,
};
pub use apfs_types::{BlockSize, Endian, ObjectId, ObjectRef, Paddr, StorageClass, Xid};

use apfs_ondisk::verify_checksum;
use tracing::warn;

/// Fail with `CorruptObject` unless `bytes` carries a valid Fletcher-64
/// checksum.
pub(crate) fn verify_object(bytes: &[u8], endian: Endian, paddr: Paddr, what: &str) -> Result<()> {
    if verify_checksum(bytes, endian) {
        return Ok(());
    }
    warn!(block = paddr.0, object = what, "checksum_mismatch");
    Err(ApfsError::CorruptObject {
        block: paddr.0,
        detail: format!("{what} checksum mismatch"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_harness::{header, raw_object};

    #[test]
    fn verify_object_accepts_sealed_and_rejects_flipped() {
        let endian = Endian::Little;
        let mut bytes = raw_object(endian, 4096, header(0x500, 3, 0, 0), b"payload").expect("object");
        verify_object(&bytes, endian, Paddr(7), "test").expect("sealed object verifies");

        bytes[100] ^= 0x01;
        let err = verify_object(&bytes, endian, Paddr(7), "test").unwrap_err();
        assert!(matches!(err, ApfsError::CorruptObject { block: 7, .. }));
        assert!(err.is_corruption());
    }
}
