//! Directory-backed content store.

use super::ContentStore;
use crate::error::{Error, Result};
use crate::id::{Algorithm, Id};
use crate::object::{CompressionType, HEADER_SIZE, ObjectClass, ObjectHeader};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Compression threshold: blobs >= 4KB are compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

/// A content-addressed store rooted at a local directory.
///
/// Layout:
/// - `config` with format version and algorithm
/// - `objects/{class}/{xx}/{62 hex}` for every stored object
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    algorithm: Algorithm,
}

impl LocalStore {
    /// Initialize a new store at the given path.
    pub fn init<P: AsRef<Path>>(root: P, algorithm: Algorithm) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if root.join("config").exists() {
            return Err(Error::invalid_store(&root, "store already initialized"));
        }

        fs::create_dir_all(&root)?;

        for class in ObjectClass::ALL {
            fs::create_dir_all(root.join("objects").join(class.as_str()))?;
        }

        let config_content = format!("version=1\nalgo={}\n", algorithm.as_str());
        fs::write(root.join("config"), config_content)?;

        debug!(root = %root.display(), algo = algorithm.as_str(), "initialized store");

        Ok(Self { root, algorithm })
    }

    /// Open an existing store at the given path.
    ///
    /// Validates the store structure and reads the configuration.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            return Err(Error::invalid_store(&root, "directory does not exist"));
        }

        let config_path = root.join("config");
        if !config_path.exists() {
            return Err(Error::invalid_store(&root, "config file not found"));
        }

        let config_content = fs::read_to_string(&config_path)?;
        let algorithm = Self::parse_config(&root, &config_content)?;

        for class in ObjectClass::ALL {
            if !root.join("objects").join(class.as_str()).exists() {
                return Err(Error::invalid_store(
                    &root,
                    format!("objects/{} directory missing", class),
                ));
            }
        }

        Ok(Self { root, algorithm })
    }

    /// Parse the config file to extract the algorithm.
    fn parse_config(root: &Path, content: &str) -> Result<Algorithm> {
        let mut version = None;
        let mut algo = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_store(
                root,
                format!("unsupported config version: {:?}", version),
            ));
        }

        let algo_str = algo.ok_or_else(|| Error::invalid_store(root, "missing algo in config"))?;
        Algorithm::parse(algo_str)
    }

    /// Get the path to an object file.
    ///
    /// Returns: `objects/{class}/{prefix}/{suffix}`
    pub fn object_path(&self, class: ObjectClass, id: &Id) -> PathBuf {
        self.class_dir(class).join(id.prefix()).join(id.suffix())
    }

    fn class_dir(&self, class: ObjectClass) -> PathBuf {
        self.root.join("objects").join(class.as_str())
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the algorithm used by this store.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Write an object atomically using tempfile.
    fn write_object_atomic(&self, path: &Path, header: &ObjectHeader, payload: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid_store(&self.root, "object path has no parent"))?;
        fs::create_dir_all(parent)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(&header.encode())?;
        temp_file.write_all(payload)?;
        temp_file.flush()?;
        temp_file.persist(path)?;

        Ok(())
    }

    /// Read and decode a whole object file, checking header and length.
    fn read_object(&self, class: ObjectClass, id: &Id) -> Result<(PathBuf, Vec<u8>)> {
        let path = self.object_path(class, id);

        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::object_not_found(class, id.to_hex()));
            }
            Err(e) => return Err(Error::io_at(&path, e)),
        };

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = ObjectHeader::decode(&header_buf)?;

        if header.class != class {
            return Err(Error::invalid_object_type(class.as_str(), header.class.as_str()));
        }

        let mut stored = Vec::new();
        file.read_to_end(&mut stored)?;

        if stored.len() as u64 != header.payload_len {
            return Err(Error::corrupted_object(
                &path,
                format!(
                    "Payload length mismatch: expected {}, got {}",
                    header.payload_len,
                    stored.len()
                ),
            ));
        }

        let payload = match header.compression {
            CompressionType::None => stored,
            CompressionType::Zstd => decompress_zstd(&stored)?,
        };

        Ok((path, payload))
    }
}

impl ContentStore for LocalStore {
    fn put(&self, class: ObjectClass, data: &[u8]) -> Result<Id> {
        let id = Id::hash_bytes(data);

        let path = self.object_path(class, &id);
        if path.exists() {
            trace!(%class, id = %id.short(), "object already present");
            return Ok(id);
        }

        // Only blobs are worth compressing; trees and snapshots stay readable.
        let (payload, compression) =
            if class == ObjectClass::Blob && data.len() >= COMPRESSION_THRESHOLD {
                (compress_zstd(data)?, CompressionType::Zstd)
            } else {
                (data.to_vec(), CompressionType::None)
            };

        let header = ObjectHeader::new(class, self.algorithm, compression, payload.len() as u64);
        self.write_object_atomic(&path, &header, &payload)?;

        trace!(%class, id = %id.short(), len = data.len(), "stored object");
        Ok(id)
    }

    fn get(&self, class: ObjectClass, id: &Id) -> Result<Vec<u8>> {
        let (path, payload) = self.read_object(class, id)?;

        let computed = Id::hash_bytes(&payload);
        if computed != *id {
            return Err(Error::corrupted_object(
                &path,
                format!("Id mismatch: expected {}, got {}", id, computed),
            ));
        }

        Ok(payload)
    }

    fn has(&self, class: ObjectClass, id: &Id) -> Result<bool> {
        Ok(self.object_path(class, id).exists())
    }

    fn list(&self, class: ObjectClass) -> Result<Vec<Id>> {
        let mut ids = Vec::new();

        for shard in fs::read_dir(self.class_dir(class))? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();

            for object in fs::read_dir(shard.path())? {
                let object = object?;
                let name = object.file_name().to_string_lossy().into_owned();
                // Skips leftover temp files from interrupted writes.
                if let Ok(id) = Id::from_hex(&format!("{}{}", prefix, name)) {
                    ids.push(id);
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Compress data using zstd.
fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 3) // Level 3 = fast compression
        .map_err(|e| Error::compression(format!("zstd compression failed: {}", e)))
}

/// Decompress data using zstd.
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data)
        .map_err(|e| Error::compression(format!("zstd decompression failed: {}", e)))
}
