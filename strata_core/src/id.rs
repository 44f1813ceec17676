//! Content ids using BLAKE3.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Id digest size in bytes (BLAKE3 produces 256-bit hashes).
pub const ID_SIZE: usize = 32;

/// Number of hex characters shown by [`Id::short`].
pub const SHORT_ID_LEN: usize = 8;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// BLAKE3 with 256-bit output.
    Blake3,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Blake3 => "blake3-256",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blake3-256" | "blake3" => Ok(Algorithm::Blake3),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }

    /// Returns the algorithm ID byte (for object headers).
    pub fn id(&self) -> u8 {
        match self {
            Algorithm::Blake3 => 1,
        }
    }

    /// Parse algorithm from ID byte.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Algorithm::Blake3),
            _ => Err(Error::unsupported_algorithm(format!("ID {}", id))),
        }
    }
}

/// A 32-byte content id.
///
/// Equal content always yields an equal id, so the id is both the storage key
/// and the integrity check for an object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Create an Id from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }

    /// Create an Id from a hex string (64 hex characters).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != ID_SIZE * 2 {
            return Err(Error::invalid_id(format!(
                "Expected {} hex characters, got {}",
                ID_SIZE * 2,
                hex_str.len()
            )));
        }

        let bytes =
            hex::decode(hex_str).map_err(|e| Error::invalid_id(format!("Invalid hex: {}", e)))?;

        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(&bytes);
        Ok(Id(id))
    }

    /// Convert to hex string (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The first [`SHORT_ID_LEN`] hex characters, for display.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..SHORT_ID_LEN / 2])
    }

    /// Get the first 2 hex characters (for directory sharding).
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Get the remaining 62 hex characters (for filename).
    pub fn suffix(&self) -> String {
        hex::encode(&self.0[1..])
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Hash raw bytes using BLAKE3.
    pub fn hash_bytes(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Id(*hash.as_bytes())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short())
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Id::from_hex(s)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_hello_world() {
        let id = Id::hash_bytes(b"hello world");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);

        // BLAKE3 of "hello world"
        assert_eq!(
            hex,
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
        assert_eq!(id.short(), "d74981ef");
    }

    #[test]
    fn test_id_from_hex_invalid() {
        assert!(Id::from_hex("abcd").is_err());
        assert!(Id::from_hex("").is_err());
        assert!(Id::from_hex(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_id_prefix_suffix() {
        let id = Id::hash_bytes(b"test");
        assert_eq!(id.prefix().len(), 2);
        assert_eq!(id.suffix().len(), 62);
        assert_eq!(format!("{}{}", id.prefix(), id.suffix()), id.to_hex());
    }

    #[test]
    fn test_id_serde_as_hex_string() {
        let id = Id::hash_bytes(b"serde");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));

        let parsed: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);

        assert!(serde_json::from_str::<Id>("\"not-an-id\"").is_err());
    }

    #[test]
    fn test_algorithm_conversions() {
        let algo = Algorithm::Blake3;
        assert_eq!(algo.as_str(), "blake3-256");
        assert_eq!(Algorithm::parse("blake3").unwrap(), Algorithm::Blake3);
        assert_eq!(Algorithm::from_id(1).unwrap(), Algorithm::Blake3);

        assert!(Algorithm::parse("unknown").is_err());
        assert!(Algorithm::from_id(99).is_err());
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Hashing the same data always produces the same id
        #[test]
        fn prop_id_deterministic(data: Vec<u8>) {
            prop_assert_eq!(Id::hash_bytes(&data), Id::hash_bytes(&data));
        }

        /// Hex parsing accepts exactly what to_hex produces
        #[test]
        fn prop_hex_roundtrip(bytes in prop::array::uniform32(any::<u8>())) {
            let id = Id::from_bytes(bytes);
            prop_assert_eq!(Id::from_hex(&id.to_hex())?, id);
        }

        /// The short form is always a prefix of the full hex
        #[test]
        fn prop_short_is_prefix(bytes in prop::array::uniform32(any::<u8>())) {
            let id = Id::from_bytes(bytes);
            prop_assert!(id.to_hex().starts_with(&id.short()));
        }
    }
}
