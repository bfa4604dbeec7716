//! Kademlia node Id, XOR distance and bucket placement.
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// Generate a cryptographically random Id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// XOR distance between this Id and another.
    ///
    /// Smaller values (compared as big-endian integers) are closer.
    pub fn distance(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Number of leading bits this Id shares with `other`.
    ///
    /// `0` when the very first bit differs, [ID_BITS] when both are equal.
    pub fn shared_prefix_len(&self, other: &Id) -> usize {
        bucket_index(&self.distance(other).0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

/// Bytewise XOR of two identifiers of the same length.
pub fn distance(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    if a.len() != b.len() {
        return Err(Error::IdLengthMismatch(a.len(), b.len()));
    }

    Ok(a.iter().zip(b).map(|(x, y)| x ^ y).collect())
}

/// Position of the first set bit of a distance, scanning from the most significant bit.
///
/// Returns `d.len() * 8` for an all zero distance, callers clamp it to their last bucket.
pub fn bucket_index(d: &[u8]) -> usize {
    for (i, byte) in d.iter().enumerate() {
        if *byte != 0 {
            return i * 8 + byte.leading_zeros() as usize;
        }
    }

    d.len() * 8
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = Error;

    /// Parse a 40 characters hex string.
    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidMessage("Id is not valid hex"))?;
        }

        Ok(Id(bytes))
    }
}
