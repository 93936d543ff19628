#![forbid(unsafe_code)]
//! Generic APFS B-tree search.
//!
//! Three layers, each usable on its own:
//!
//! - [`locate`]: binary search inside one decoded node. Keys are read
//!   lazily per probed TOC index and handed to a [`KeyComparer`], so the
//!   fixed and variable key layouts share one search routine.
//! - [`BTreeNavigator`]: root-to-leaf descent (and full ordered walks)
//!   through any [`NodeSource`], with level and depth guards against
//!   malformed or cyclic trees.
//! - [`NodeCache`]: sharded read-through cache of checksum-verified nodes
//!   keyed by physical address.
//!
//! Object resolution (turning a child oid into a block) is the node
//! source's job; this crate never touches a block device directly.

pub mod cache;
pub mod compare;
pub mod locate;
pub mod navigator;

pub use cache::NodeCache;
pub use compare::{KeyComparer, OidKeyComparer, OmapKeyComparer};
pub use locate::{SearchMode, locate};
pub use navigator::{BTreeNavigator, DEFAULT_MAX_DEPTH, FoundEntry, LoadedNode, NodeSource};

use apfs_error::ApfsError;
use apfs_types::ParseError;

/// Convert a decoder error into the runtime taxonomy, attaching the block
/// the bytes came from.
///
/// Short buffers become `TruncatedData`, bad field values become
/// `CorruptObject`, and a wrong magic number is a `Format` error.
#[must_use]
pub fn parse_to_apfs_error(block: u64, err: &ParseError) -> ApfsError {
    match err {
        ParseError::InsufficientData { .. } => ApfsError::TruncatedData {
            block,
            detail: err.to_string(),
        },
        ParseError::InvalidField { .. } | ParseError::IntegerConversion { .. } => {
            ApfsError::CorruptObject {
                block,
                detail: err.to_string(),
            }
        }
        ParseError::InvalidMagic { .. } => ApfsError::Format(format!("block {block}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_to_runtime_taxonomy() {
        let e = parse_to_apfs_error(
            7,
            &ParseError::InsufficientData {
                needed: 56,
                offset: 0,
                actual: 12,
            },
        );
        assert!(matches!(e, ApfsError::TruncatedData { block: 7, .. }));
        assert!(e.is_corruption());

        let e = parse_to_apfs_error(
            9,
            &ParseError::InvalidField {
                field: "btn_level",
                reason: "leaf flag disagrees with level",
            },
        );
        assert!(matches!(e, ApfsError::CorruptObject { block: 9, .. }));

        let e = parse_to_apfs_error(3, &ParseError::IntegerConversion { field: "v.off" });
        assert!(matches!(e, ApfsError::CorruptObject { block: 3, .. }));

        let e = parse_to_apfs_error(
            0,
            &ParseError::InvalidMagic {
                expected: 0x4253_584E,
                actual: 0,
            },
        );
        assert!(matches!(e, ApfsError::Format(_)));
        assert!(!e.is_corruption());
    }
}
