//! Binary search over a node's table of contents.

use crate::compare::KeyComparer;
use apfs_ondisk::{BTreeNode, KvGeometry};
use apfs_types::ParseError;
use std::cmp::Ordering;

/// Which entry a search accepts once the floor position is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Largest key not greater than the target. Used for child selection in
    /// index nodes and for closest-lower leaf lookups.
    Floor,
    /// Floor, except that a target above the node's last key matches
    /// nothing. The navigator applies this on the rightmost leaf so that
    /// lookups past the largest key of the tree fail.
    ClosestLower,
    /// Only a key equal to the target.
    Exact,
    /// Floor, but only if the comparer says the entry has the target's
    /// identity (same oid for omap keys).
    Versioned,
}

/// Find the TOC index of the entry matching `target` under `mode`.
///
/// Probes `O(log n)` entries, decoding only the probed keys. Returns
/// `Ok(None)` when no entry qualifies, including for an empty node. Keys
/// must be in ascending order; a node that violates this yields an
/// unspecified (but in-bounds) result rather than a panic.
pub fn locate<C>(
    node: &BTreeNode,
    geometry: Option<KvGeometry>,
    comparer: &C,
    target: &C::Target,
    mode: SearchMode,
) -> Result<Option<u32>, ParseError>
where
    C: KeyComparer + ?Sized,
{
    let endian = node.endian();
    let mut lo = 0_u32;
    let mut hi = node.key_count();

    // Invariant: keys[..lo] <= target < keys[hi..].
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let key = node.key_at(mid, geometry)?;
        match comparer.compare(key, target, endian)? {
            Ordering::Less | Ordering::Equal => lo = mid + 1,
            Ordering::Greater => hi = mid,
        }
    }

    let Some(floor) = lo.checked_sub(1) else {
        return Ok(None);
    };

    let accepted = match mode {
        SearchMode::Floor => true,
        SearchMode::ClosestLower => {
            floor + 1 < node.key_count()
                || comparer.compare(node.key_at(floor, geometry)?, target, endian)?
                    == Ordering::Equal
        }
        SearchMode::Exact => {
            comparer.compare(node.key_at(floor, geometry)?, target, endian)? == Ordering::Equal
        }
        SearchMode::Versioned => {
            comparer.same_identity(node.key_at(floor, geometry)?, target, endian)?
        }
    };
    Ok(accepted.then_some(floor))
}
