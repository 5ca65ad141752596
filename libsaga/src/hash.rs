use crate::error::{SagaGenericError, SagaResult};
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Index;
use std::slice::SliceIndex;
use std::str::FromStr;

pub const OID_SIZE: usize = 32;

/// 32-byte blake3 digest identifying any persistent object
#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Copy)]
#[repr(transparent)]
pub struct Oid([u8; OID_SIZE]);

impl From<blake3::Hash> for Oid {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl Oid {
    /// the all-zero digest; marks an empty timeline tip or an absent secondary slot
    pub const ZERO: Self = Self([0; OID_SIZE]);

    #[inline]
    pub fn new(bytes: [u8; OID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> SagaResult<Self> {
        ensure!(bytes.len() == OID_SIZE, "expected {} hash bytes, found {}", OID_SIZE, bytes.len());
        let mut buf = [0; OID_SIZE];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; OID_SIZE] {
        &self.0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    #[inline]
    pub fn is_known(self) -> bool {
        self != Self::ZERO
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        self.to_hex()[0..8].to_owned()
    }

    /// split the hex form into the (directory, filename) pair used by the loose object layout
    pub fn split(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_owned(), hex[2..].to_owned())
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for Oid {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let mut bytes = [0; OID_SIZE];
        for byte in &mut bytes {
            *byte = u8::arbitrary(g);
        }
        Self(bytes)
    }
}

impl FromStr for Oid {
    type Err = SagaGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end();
        ensure!(s.len() == 2 * OID_SIZE, "creating oid with invalid hex string (incorrect length)");
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for Oid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<I> Index<I> for Oid
where
    I: SliceIndex<[u8]>,
{
    type Output = I::Output;

    fn index(&self, index: I) -> &Self::Output {
        &self.0[index]
    }
}

impl Debug for Oid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Oid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        if f.alternate() { write!(f, "{}", &hex[..8]) } else { write!(f, "{}", hex) }
    }
}

pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Oid {
    Oid::from(blake3::hash(bytes.as_ref()))
}

/// hash of two concatenated digests, used by mmr node combination
pub fn hash_pair(a: Oid, b: Oid) -> Oid {
    let mut hasher = blake3::Hasher::new();
    hasher.update(a.as_bytes());
    hasher.update(b.as_bytes());
    Oid::from(hasher.finalize())
}

/// 32-bit hash of a directory entry name, drives hamt slot selection
pub fn name_hash(name: &str) -> u32 {
    let digest = blake3::hash(name.as_bytes());
    u32::from_le_bytes(digest.as_bytes()[..4].try_into().unwrap())
}

/// incremental blake3 wrapper for checksumming streamed file content
pub struct Checksummer {
    hasher: blake3::Hasher,
}

impl Checksummer {
    pub fn new() -> Self {
        Self { hasher: blake3::Hasher::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(self) -> Oid {
        Oid::from(self.hasher.finalize())
    }
}

impl Default for Checksummer {
    fn default() -> Self {
        Self::new()
    }
}
