use apfs_types::{
    Endian, OBJ_CHECKSUM_SIZE, OBJ_ENCRYPTED, OBJ_HEADER_SIZE, OBJ_NOHEADER, OBJECT_TYPE_FLAGS_MASK,
    OBJECT_TYPE_MASK, ObjectId, ParseError, StorageClass, Xid, object_type_name,
};
use serde::{Deserialize, Serialize};

/// The `obj_phys_t` header that prefixes every checksummed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub checksum: u64,
    pub oid: ObjectId,
    pub xid: Xid,
    /// Type code in the low 16 bits, storage class and flags in the high 16.
    pub type_and_flags: u32,
    pub subtype: u32,
}

impl ObjectHeader {
    pub fn parse(data: &[u8], endian: Endian) -> Result<Self, ParseError> {
        if data.len() < OBJ_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: OBJ_HEADER_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        Ok(Self {
            checksum: endian.read_u64(data, 0x00)?,
            oid: ObjectId(endian.read_u64(data, 0x08)?),
            xid: Xid(endian.read_u64(data, 0x10)?),
            type_and_flags: endian.read_u32(data, 0x18)?,
            subtype: endian.read_u32(data, 0x1C)?,
        })
    }

    /// Write the header into the first 32 bytes of `out`.
    ///
    /// The checksum is written as-is; call [`seal_object`] afterwards to
    /// compute it over the finished object.
    pub fn encode_into(&self, out: &mut [u8], endian: Endian) -> Result<(), ParseError> {
        endian.put_u64(out, 0x00, self.checksum)?;
        endian.put_u64(out, 0x08, self.oid.0)?;
        endian.put_u64(out, 0x10, self.xid.0)?;
        endian.put_u32(out, 0x18, self.type_and_flags)?;
        endian.put_u32(out, 0x1C, self.subtype)
    }

    #[must_use]
    pub fn type_code(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    #[must_use]
    pub fn type_flags(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_FLAGS_MASK
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        object_type_name(self.type_and_flags)
    }

    /// `None` when both storage bits are set, which no valid object does.
    #[must_use]
    pub fn storage_class(&self) -> Option<StorageClass> {
        StorageClass::from_type_flags(self.type_and_flags)
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.type_and_flags & OBJ_ENCRYPTED != 0
    }

    #[must_use]
    pub fn has_no_header(&self) -> bool {
        self.type_and_flags & OBJ_NOHEADER != 0
    }

    /// Reject the object unless its masked type code is `expected`.
    pub fn expect_type(&self, expected: u32) -> Result<(), ParseError> {
        if self.type_code() != expected {
            return Err(ParseError::InvalidField {
                field: "o_type",
                reason: "unexpected object type",
            });
        }
        Ok(())
    }
}

// ── Fletcher-64 ─────────────────────────────────────────────────────────────

const FLETCHER_MODULUS: u64 = 0xFFFF_FFFF;

/// Fletcher-64 as APFS computes it: 32-bit words, modulus 2^32 - 1, folded
/// into the two check values stored in `o_cksum`.
///
/// A trailing partial word is zero-padded.
#[must_use]
pub fn fletcher64(data: &[u8], endian: Endian) -> u64 {
    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;

    let mut words = data.chunks_exact(4);
    for word in &mut words {
        let raw = [word[0], word[1], word[2], word[3]];
        let value = match endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        };
        sum1 = (sum1 + u64::from(value)) % FLETCHER_MODULUS;
        sum2 = (sum2 + sum1) % FLETCHER_MODULUS;
    }
    let tail = words.remainder();
    if !tail.is_empty() {
        let mut raw = [0_u8; 4];
        raw[..tail.len()].copy_from_slice(tail);
        let value = match endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        };
        sum1 = (sum1 + u64::from(value)) % FLETCHER_MODULUS;
        sum2 = (sum2 + sum1) % FLETCHER_MODULUS;
    }

    let check1 = FLETCHER_MODULUS - ((sum1 + sum2) % FLETCHER_MODULUS);
    let check2 = FLETCHER_MODULUS - ((sum1 + check1) % FLETCHER_MODULUS);
    (check2 << 32) | check1
}

/// Checksum an object as it should be stored: everything after `o_cksum`.
pub fn compute_object_checksum(object: &[u8], endian: Endian) -> Result<u64, ParseError> {
    if object.len() < OBJ_HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: OBJ_HEADER_SIZE,
            offset: 0,
            actual: object.len(),
        });
    }
    Ok(fletcher64(&object[OBJ_CHECKSUM_SIZE..], endian))
}

/// Recompute the checksum over `object[8..]` and compare with `object[0..8]`.
///
/// Objects shorter than a header never verify.
#[must_use]
pub fn verify_checksum(object: &[u8], endian: Endian) -> bool {
    let Ok(computed) = compute_object_checksum(object, endian) else {
        return false;
    };
    endian
        .read_u64(object, 0)
        .is_ok_and(|stored| stored == computed)
}

/// Compute and store the checksum of a finished object in place.
pub fn seal_object(object: &mut [u8], endian: Endian) -> Result<(), ParseError> {
    let checksum = compute_object_checksum(object, endian)?;
    endian.put_u64(object, 0, checksum)
}
