//! Object classes and the binary object header.
//!
//! Objects in a [`LocalStore`](crate::LocalStore) are stored with a 16-byte
//! header followed by the payload:
//!
//! ```text
//! 0x00  4   "STRA" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   class: 1=blob, 2=tree, 3=snapshot
//! 0x06  1   algo: 1=blake3-256
//! 0x07  1   compression: 0=none, 1=zstd
//! 0x08  8   payload_len (u64 LE) - stored (possibly compressed) size
//! 0x10  ... payload
//! ```

use crate::error::{Error, Result};
use crate::id::Algorithm;
use std::fmt;

/// Magic bytes at the start of every object file.
pub const MAGIC: &[u8; 4] = b"STRA";

/// Current object format version.
pub const VERSION: u8 = 1;

/// Size of the object header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Object classes sharing one id namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectClass {
    /// A chunk of file content.
    Blob = 1,
    /// An encoded [`Tree`](crate::Tree).
    Tree = 2,
    /// An encoded [`Snapshot`](crate::Snapshot).
    Snapshot = 3,
}

impl ObjectClass {
    /// All classes, in byte order.
    pub const ALL: [ObjectClass; 3] = [ObjectClass::Blob, ObjectClass::Tree, ObjectClass::Snapshot];

    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ObjectClass::Blob),
            2 => Ok(ObjectClass::Tree),
            3 => Ok(ObjectClass::Snapshot),
            _ => Err(Error::invalid_object_type(
                "blob, tree or snapshot",
                format!("class byte {}", value),
            )),
        }
    }

    /// Get the string name of this class (also its directory name on disk).
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Blob => "blob",
            ObjectClass::Tree => "tree",
            ObjectClass::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstandard compression.
    Zstd = 1,
}

impl CompressionType {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            _ => Err(Error::compression(format!(
                "Invalid compression type: {}",
                value
            ))),
        }
    }
}

/// A 16-byte object header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Object format version.
    pub version: u8,
    /// Object class.
    pub class: ObjectClass,
    /// Hash algorithm used.
    pub algorithm: Algorithm,
    /// Compression type.
    pub compression: CompressionType,
    /// Length of the payload in bytes (compressed size if compressed).
    pub payload_len: u64,
}

impl ObjectHeader {
    /// Create a new object header.
    pub fn new(
        class: ObjectClass,
        algorithm: Algorithm,
        compression: CompressionType,
        payload_len: u64,
    ) -> Self {
        Self {
            version: VERSION,
            class,
            algorithm,
            compression,
            payload_len,
        }
    }

    /// Encode the header to a 16-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = self.version;
        buf[5] = self.class.to_u8();
        buf[6] = self.algorithm.id();
        buf[7] = self.compression.to_u8();
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode a header from the first 16 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::invalid_object_type(
                "object header",
                format!("{} bytes (expected {})", buf.len(), HEADER_SIZE),
            ));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::invalid_object_type(
                "object header",
                format!("magic {:?}", &buf[0..4]),
            ));
        }

        let version = buf[4];
        if version != VERSION {
            return Err(Error::invalid_object_type(
                format!("object version {}", VERSION),
                format!("version {}", version),
            ));
        }

        let class = ObjectClass::from_u8(buf[5])?;
        let algorithm = Algorithm::from_id(buf[6])?;
        let compression = CompressionType::from_u8(buf[7])?;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);
        let payload_len = u64::from_le_bytes(len_bytes);

        Ok(Self {
            version,
            class,
            algorithm,
            compression,
            payload_len,
        })
    }
}
