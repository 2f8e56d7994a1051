use crate::denc::{Denc, FixedSize};
use crate::error::DencError;
use bytes::{Buf, BufMut};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of an object identifier in bytes
pub const OBJECT_ID_SIZE: usize = 20;

/// Length of an object content digest in bytes
pub const DIGEST_SIZE: usize = 32;

/// Fixed-width opaque object identifier
///
/// Chosen by the creator, either at random or derived from content.
/// Equality is byte-wise; displayed as 40 lowercase hex digits.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_SIZE]);

impl ObjectId {
    pub const fn new(bytes: [u8; OBJECT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; OBJECT_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive an identifier from content (leading bytes of its SHA-256)
    pub fn from_content(content: &[u8]) -> Self {
        let hash = Sha256::digest(content);
        let mut bytes = [0u8; OBJECT_ID_SIZE];
        bytes.copy_from_slice(&hash[..OBJECT_ID_SIZE]);
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, DencError> {
        let bytes: [u8; OBJECT_ID_SIZE] = slice.try_into().map_err(|_| {
            DencError::InvalidData(format!(
                "Object id must be {} bytes, got {}",
                OBJECT_ID_SIZE,
                slice.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = DencError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim())
            .map_err(|e| DencError::InvalidData(format!("Invalid object id '{}': {}", s, e)))?;
        Self::from_slice(&raw)
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl Denc for ObjectId {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError> {
        self.0.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DencError> {
        Ok(Self(<[u8; OBJECT_ID_SIZE]>::decode(buf)?))
    }

    fn encoded_size(&self) -> Option<usize> {
        Some(OBJECT_ID_SIZE)
    }
}

impl FixedSize for ObjectId {
    const SIZE: usize = OBJECT_ID_SIZE;
}

/// Content digest of a sealed object (SHA-256 over data, then metadata)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    pub fn compute(data: &[u8], metadata: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.update(metadata);
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}
