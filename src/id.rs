use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::BitXor,
};
use thiserror::Error;

/// Length of an identifier in bytes.
pub const ID_LEN: usize = 20;

/// 160-bit identifier in the DHT keyspace.
///
/// Comparison is bytewise which, for big-endian byte strings, coincides with
/// unsigned integer order. The same type doubles as the XOR distance between
/// two identifiers.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id {
    #[serde(with = "id_bytes")]
    bytes: [u8; ID_LEN],
}

impl Id {
    /// Smallest identifier (all zero bits).
    pub const MIN: Id = Id {
        bytes: [0u8; ID_LEN],
    };

    /// Largest identifier (all one bits).
    pub const MAX: Id = Id {
        bytes: [0xffu8; ID_LEN],
    };

    /// Create an identifier by SHA-1 hashing the given bytes.
    pub fn sha1(input: &[u8]) -> Self {
        let hash = Sha1::digest(input);
        Self { bytes: hash.into() }
    }

    /// Generate a fresh identifier from cryptographically random bytes.
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::sha1(&seed)
    }

    /// Sample an identifier uniformly from the inclusive range `[lo, hi]`,
    /// exact over the full 160 bits.
    ///
    /// Panics if `lo > hi`.
    pub fn random_in_range(lo: Id, hi: Id) -> Id {
        assert!(lo <= hi);

        let width = sub(hi.bytes, lo.bytes);

        // Mask the leading byte down to the smallest all-ones cover of the
        // width's leading byte, then rejection-sample `r <= width`. The mask
        // keeps the acceptance probability above one half per attempt.
        let first_nonzero = width.iter().position(|b| *b != 0);
        let mut rng = rand::thread_rng();
        let mut candidate = [0u8; ID_LEN];

        loop {
            rng.fill_bytes(&mut candidate);

            if let Some(index) = first_nonzero {
                for byte in &mut candidate[..index] {
                    *byte = 0;
                }
                candidate[index] &= mask_for(width[index]);
            } else {
                candidate = [0u8; ID_LEN];
            }

            if candidate <= width {
                break;
            }
        }

        Id {
            bytes: add(lo.bytes, candidate).0,
        }
    }

    /// Split the inclusive range `[lo, hi]` at its midpoint.
    ///
    /// Returns `(lo_right, hi_left)` where `hi_left = (lo + hi) / 2` rounded
    /// down and `lo_right = hi_left + 1`, so `[lo, hi_left]` and
    /// `[lo_right, hi]` are disjoint and together cover the original range.
    /// The arithmetic is exact 160-bit; for the degenerate range `lo == hi`
    /// the result is `(lo + 1, lo)`.
    pub fn midpoint(lo: Id, hi: Id) -> (Id, Id) {
        let (sum, carry) = add(lo.bytes, hi.bytes);
        let hi_left = Id {
            bytes: shift_right(sum, carry),
        };
        (hi_left.successor(), hi_left)
    }

    /// The next identifier in keyspace order. Wraps around at `Id::MAX`.
    pub fn successor(self) -> Id {
        let mut bytes = self.bytes;
        for byte in bytes.iter_mut().rev() {
            let (value, overflow) = byte.overflowing_add(1);
            *byte = value;
            if !overflow {
                break;
            }
        }
        Id { bytes }
    }
}

/// 160-bit add, returning the sum and the carried-out bit.
fn add(a: [u8; ID_LEN], b: [u8; ID_LEN]) -> ([u8; ID_LEN], bool) {
    let mut out = [0u8; ID_LEN];
    let mut carry = 0u16;

    for i in (0..ID_LEN).rev() {
        let sum = u16::from(a[i]) + u16::from(b[i]) + carry;
        out[i] = sum as u8;
        carry = sum >> 8;
    }

    (out, carry != 0)
}

/// Subtract `a - b`; callers guarantee `a >= b`.
fn sub(a: [u8; ID_LEN], b: [u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let mut borrow = 0i16;

    for i in (0..ID_LEN).rev() {
        let diff = i16::from(a[i]) - i16::from(b[i]) - borrow;
        out[i] = (diff & 0xff) as u8;
        borrow = i16::from(diff < 0);
    }

    out
}

/// Right shift by one bit, shifting `carry` into the top bit.
fn shift_right(value: [u8; ID_LEN], carry: bool) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let mut high_bit = u8::from(carry);

    for i in 0..ID_LEN {
        out[i] = (high_bit << 7) | (value[i] >> 1);
        high_bit = value[i] & 1;
    }

    out
}

/// Smallest all-ones byte mask covering `byte`.
fn mask_for(byte: u8) -> u8 {
    if byte == 0 {
        0
    } else {
        u8::MAX >> byte.leading_zeros()
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Id> for [u8; ID_LEN] {
    fn from(id: Id) -> [u8; ID_LEN] {
        id.bytes
    }
}

impl From<[u8; ID_LEN]> for Id {
    fn from(bytes: [u8; ID_LEN]) -> Id {
        Id { bytes }
    }
}

#[derive(Debug, Error)]
#[error("invalid identifier length")]
pub struct LengthError;

impl<'a> TryFrom<&'a [u8]> for Id {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self {
            bytes: slice.try_into().map_err(|_| LengthError)?,
        })
    }
}

impl BitXor<Id> for Id {
    type Output = Id;

    fn bitxor(mut self, rhs: Id) -> Id {
        for (dst, src) in self.bytes.iter_mut().zip(rhs.bytes.iter()) {
            *dst ^= *src;
        }

        self
    }
}

impl fmt::LowerHex for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.bytes {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

mod id_bytes {
    use super::ID_LEN;
    use serde::{
        de::{Deserialize, Deserializer, Error},
        ser::{Serialize, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::convert::TryInto;

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; ID_LEN], s: S) -> Result<S::Ok, S::Error> {
        Bytes::new(bytes.as_ref()).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; ID_LEN], D::Error> {
        let buf = ByteBuf::deserialize(d)?;
        let buf = buf.into_vec();
        let len = buf.len();

        buf.try_into().map_err(|_| {
            let expected = format!("{}", ID_LEN);
            D::Error::invalid_length(len, &expected.as_ref())
        })
    }
}

// ----------------------------------------------------------------------------//

/// Identifier of a DHT participant.
pub type NodeId = Id;

/// Identifier of an announced resource.
pub type InfoHash = Id;

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;

    fn id(bytes: [u8; ID_LEN]) -> Id {
        Id::from(bytes)
    }

    #[test]
    fn ordering_is_big_endian_unsigned() {
        let mut low = [0u8; ID_LEN];
        low[ID_LEN - 1] = 0xff;

        let mut high = [0u8; ID_LEN];
        high[0] = 1;

        assert!(id(low) < id(high));
        assert!(Id::MIN < Id::MAX);
    }

    #[test]
    fn xor_distance_is_symmetric() {
        let a = Id::random();
        let b = Id::random();

        assert_eq!(a ^ b, b ^ a);
        assert_eq!(a ^ a, Id::MIN);
    }

    #[test]
    fn midpoint_of_full_range() {
        let (lo_right, hi_left) = Id::midpoint(Id::MIN, Id::MAX);

        let mut expected_left = [0xffu8; ID_LEN];
        expected_left[0] = 0x7f;
        assert_eq!(hi_left, id(expected_left));

        let mut expected_right = [0u8; ID_LEN];
        expected_right[0] = 0x80;
        assert_eq!(lo_right, id(expected_right));
    }

    #[test]
    fn midpoint_needs_the_carry_bit() {
        // lo + hi overflows 160 bits; the carry must survive the shift.
        let mut lo = [0u8; ID_LEN];
        lo[0] = 0x80;
        let hi = [0xffu8; ID_LEN];

        let (lo_right, hi_left) = Id::midpoint(id(lo), id(hi));

        let mut expected_left = [0xffu8; ID_LEN];
        expected_left[0] = 0xbf;
        assert_eq!(hi_left, id(expected_left));
        assert_eq!(lo_right, hi_left.successor());
    }

    #[test]
    fn midpoint_of_degenerate_range() {
        let point = Id::random();
        let (lo_right, hi_left) = Id::midpoint(point, point);

        assert_eq!(hi_left, point);
        assert_eq!(lo_right, point.successor());
    }

    #[test]
    fn successor_carries_across_bytes() {
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - 1] = 0xff;
        bytes[ID_LEN - 2] = 0xff;

        let mut expected = [0u8; ID_LEN];
        expected[ID_LEN - 3] = 1;
        expected[ID_LEN - 2] = 0;
        expected[ID_LEN - 1] = 0;

        assert_eq!(id(bytes).successor(), id(expected));
    }

    #[test]
    fn random_in_range_stays_in_bounds() {
        let mut lo = [0u8; ID_LEN];
        lo[0] = 0x80;
        let mut hi = [0u8; ID_LEN];
        hi[0] = 0x80;
        hi[1] = 0x03;

        let (lo, hi) = (id(lo), id(hi));

        for _ in 0..256 {
            let sample = Id::random_in_range(lo, hi);
            assert!(lo <= sample && sample <= hi);
        }
    }

    #[test]
    fn random_in_range_degenerate() {
        let point = Id::random();
        assert_eq!(Id::random_in_range(point, point), point);
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(Id::random(), Id::random());
    }
}
