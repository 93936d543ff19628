#![forbid(unsafe_code)]
//! Error types for the APFS resolution engine.
//!
//! # Error Taxonomy
//!
//! Two layers, converted at crate boundaries:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `apfs-types` | Byte-level format violations found by pure decoders |
//! | Runtime | `ApfsError` | `apfs-error` (this crate) | What resolver callers see |
//!
//! ## Mapping Policy: ParseError → ApfsError
//!
//! `apfs-error` does not depend on `apfs-types`. The conversion lives in
//! `apfs-btree` and `apfs-core`, which know the physical block a decoder was
//! looking at and attach it:
//!
//! | ParseError Variant | ApfsError Variant |
//! |--------------------|-------------------|
//! | `InsufficientData` | `TruncatedData { block, detail }` |
//! | `InvalidField` | `CorruptObject { block, detail }` |
//! | `IntegerConversion` | `CorruptObject { block, detail }` |
//! | `InvalidMagic` | `Format(detail)` |
//!
//! ## Absent versus damaged
//!
//! `KeyNotFound` is an expected outcome (the object never existed, or was
//! deleted before the requested transaction). Every other non-I/O variant
//! means the image cannot be trusted along that path. [`ApfsError::is_not_found`]
//! and [`ApfsError::is_corruption`] make that split without wildcard arms, so
//! a new variant is a compile error until it is classified.
//!
//! The engine never retries. A caller that wants to try an older checkpoint
//! issues a new top-level resolution.

use thiserror::Error;

/// Unified error type for every resolution entry point.
#[derive(Debug, Error)]
pub enum ApfsError {
    /// Device-level I/O failure, passed through uninterpreted.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read addressed a block beyond the end of the device.
    #[error("block {block} out of range (device has {block_count} blocks)")]
    OutOfRange { block: u64, block_count: u64 },

    /// A structurally required field lies past the end of the buffer.
    #[error("truncated object at block {block}: {detail}")]
    TruncatedData { block: u64, detail: String },

    /// Checksum mismatch, identity mismatch, or an out-of-range field value.
    #[error("corrupt object at block {block}: {detail}")]
    CorruptObject { block: u64, detail: String },

    /// Well-formed structure, absent key.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Descent exceeded the configured depth bound (likely a cyclic tree).
    #[error("tree rooted at block {root} deeper than {limit} levels")]
    TreeTooDeep { root: u64, limit: u16 },

    /// A virtual or ephemeral oid in the reserved range, or physical address 0.
    #[error("reserved object id {oid:#x}")]
    ReservedObjectId { oid: u64 },

    /// Not an APFS container, or the container superblock is unusable.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// The image uses something this read-only engine does not handle.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
}

impl ApfsError {
    /// True when the error says the image is damaged along this path.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::TruncatedData { .. } | Self::CorruptObject { .. } | Self::TreeTooDeep { .. } => {
                true
            }
            Self::Io(_)
            | Self::OutOfRange { .. }
            | Self::KeyNotFound(_)
            | Self::ReservedObjectId { .. }
            | Self::Format(_)
            | Self::UnsupportedFeature(_) => false,
        }
    }

    /// True when the lookup was well-formed but the key is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::KeyNotFound(_) => true,
            Self::Io(_)
            | Self::OutOfRange { .. }
            | Self::TruncatedData { .. }
            | Self::CorruptObject { .. }
            | Self::TreeTooDeep { .. }
            | Self::ReservedObjectId { .. }
            | Self::Format(_)
            | Self::UnsupportedFeature(_) => false,
        }
    }
}

/// Result alias using `ApfsError`.
pub type Result<T> = std::result::Result<T, ApfsError>;
