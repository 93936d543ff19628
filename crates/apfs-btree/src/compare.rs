//! Key ordering for the locator.

use apfs_ondisk::OmapKey;
use apfs_types::{Endian, ParseError};
use std::cmp::Ordering;
use std::fmt::Debug;

/// Orders raw stored key bytes against a typed search target.
///
/// The locator only ever asks "how does the key at this index compare to
/// the target", so one implementation per key encoding is enough for both
/// fixed and variable TOC layouts.
pub trait KeyComparer {
    /// Decoded form of the key being searched for.
    type Target: Debug + ?Sized;

    fn compare(
        &self,
        stored: &[u8],
        target: &Self::Target,
        endian: Endian,
    ) -> Result<Ordering, ParseError>;

    /// Whether a floor match denotes the same logical record as `target`.
    ///
    /// Used by [`SearchMode::Versioned`](crate::SearchMode::Versioned): the
    /// floor entry is only accepted when this returns true. The default
    /// requires an exact match.
    fn same_identity(
        &self,
        stored: &[u8],
        target: &Self::Target,
        endian: Endian,
    ) -> Result<bool, ParseError> {
        Ok(self.compare(stored, target, endian)? == Ordering::Equal)
    }
}

/// Plain `u64` keys: child oids, snapshot xids.
#[derive(Debug, Clone, Copy, Default)]
pub struct OidKeyComparer;

impl KeyComparer for OidKeyComparer {
    type Target = u64;

    fn compare(&self, stored: &[u8], target: &u64, endian: Endian) -> Result<Ordering, ParseError> {
        Ok(endian.read_u64(stored, 0)?.cmp(target))
    }
}

/// Composite `(oid, xid)` omap keys, ordered by oid then xid.
///
/// Two keys share an identity when their oids match, so a versioned
/// search returns the newest xid not after the target's.
#[derive(Debug, Clone, Copy, Default)]
pub struct OmapKeyComparer;

impl KeyComparer for OmapKeyComparer {
    type Target = OmapKey;

    fn compare(
        &self,
        stored: &[u8],
        target: &OmapKey,
        endian: Endian,
    ) -> Result<Ordering, ParseError> {
        Ok(OmapKey::parse(stored, endian)?.cmp(target))
    }

    fn same_identity(
        &self,
        stored: &[u8],
        target: &OmapKey,
        endian: Endian,
    ) -> Result<bool, ParseError> {
        Ok(OmapKey::parse(stored, endian)?.oid == target.oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_types::{ObjectId, Xid};

    fn omap_key(oid: u64, xid: u64) -> OmapKey {
        OmapKey {
            oid: ObjectId(oid),
            xid: Xid(xid),
        }
    }

    #[test]
    fn oid_keys_compare_numerically_in_both_orders() {
        for endian in [Endian::Little, Endian::Big] {
            let mut stored = [0_u8; 8];
            endian.put_u64(&mut stored, 0, 0x0102).unwrap();
            assert_eq!(OidKeyComparer.compare(&stored, &0x0101, endian).unwrap(), Ordering::Greater);
            assert_eq!(OidKeyComparer.compare(&stored, &0x0102, endian).unwrap(), Ordering::Equal);
            assert_eq!(OidKeyComparer.compare(&stored, &0x0201, endian).unwrap(), Ordering::Less);
        }
    }

    #[test]
    fn short_key_is_insufficient_data() {
        let err = OidKeyComparer.compare(&[1, 2, 3], &1, Endian::Little).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }

    #[test]
    fn omap_keys_order_by_oid_then_xid() {
        let endian = Endian::Little;
        let stored = omap_key(10, 5).encode(endian);
        assert_eq!(
            OmapKeyComparer.compare(&stored, &omap_key(10, 8), endian).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            OmapKeyComparer.compare(&stored, &omap_key(9, 100), endian).unwrap(),
            Ordering::Greater
        );
        assert!(OmapKeyComparer.same_identity(&stored, &omap_key(10, 1), endian).unwrap());
        assert!(!OmapKeyComparer.same_identity(&stored, &omap_key(11, 5), endian).unwrap());
    }

    #[test]
    fn default_identity_is_equality() {
        let stored = 42_u64.to_le_bytes();
        assert!(OidKeyComparer.same_identity(&stored, &42, Endian::Little).unwrap());
        assert!(!OidKeyComparer.same_identity(&stored, &41, Endian::Little).unwrap());
    }
}
