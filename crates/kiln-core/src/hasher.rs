//! Kiln Hasher - BLAKE3 content identifiers
//!
//! Every fingerprint in the engine is an `ObjectId`:
//! - file contents (see `tracker`)
//! - command identities (kind + canonical parameters)
//! - output objects registered by commands

use blake3::Hasher as Blake3Hasher;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;

/// 32-byte BLAKE3 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    pub const EMPTY: ObjectId = ObjectId([0; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a buffer
    pub fn from_content(content: &[u8]) -> Self {
        Self(*blake3::hash(content).as_bytes())
    }

    /// Hash a file's content
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = fs::read(path.as_ref())?;
        Ok(Self::from_content(&content))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Self(*h.as_bytes()))
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    /// First 16 hex characters, for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        ObjectId::from_hex(&hex).ok_or_else(|| de::Error::custom(format!("invalid object id '{}'", hex)))
    }
}

/// Incremental builder for composite fingerprints
pub struct ObjectIdBuilder {
    hasher: Blake3Hasher,
}

impl ObjectIdBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Blake3Hasher::new(),
        }
    }

    /// Append a length-prefixed field so that adjacent fields cannot alias
    pub fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn finish(&self) -> ObjectId {
        ObjectId(*self.hasher.finalize().as_bytes())
    }
}

impl Default for ObjectIdBuilder {
    fn default() -> Self {
        Self::new()
    }
}
