//! # Strata Core
//!
//! A deduplicating, content-addressed backup engine.
//!
//! A directory is scanned into a [`Tree`], archived into a content store as
//! chunked blobs plus one tree object per directory, and recorded as an
//! immutable [`Snapshot`]. Every object is keyed by the BLAKE3 digest of its
//! bytes, so identical content is stored once across files and snapshots.
//!
//! ## Features
//!
//! - Content-defined chunking with FastCDC
//! - Parent-snapshot diffing: unchanged files reuse their stored content
//! - Restore with filters and missing-parent recovery
//! - Pluggable error policies and throttled progress reporting
//!
//! ## Example
//!
//! ```no_run
//! use strata_core::{Algorithm, Archiver, LocalStore, Progress, Restorer, Scanner};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = LocalStore::init("./my-repo", Algorithm::Blake3)?;
//!
//! // Scan and archive a directory
//! let source = Path::new("./my-data");
//! let tree = Scanner::new(Progress::disabled()).scan(source)?;
//! let (_, snapshot) = Archiver::new(&store, Progress::disabled()).snapshot(source, tree, None)?;
//! println!("saved snapshot {}", snapshot.short());
//!
//! // Restore it elsewhere
//! Restorer::new(&store, &snapshot)?.restore_to(Path::new("./restored"))?;
//! # Ok(())
//! # }
//! ```

mod archiver;
mod chunking;
mod error;
mod id;
mod object;
mod policy;
mod progress;
mod restorer;
mod scanner;
mod snapshot;
mod store;
mod tree;

pub use archiver::Archiver;
pub use chunking::{Chunk, Chunker, ChunkerConfig};
pub use error::{Error, Result};
pub use id::{Algorithm, Id, SHORT_ID_LEN};
pub use object::{CompressionType, ObjectClass, ObjectHeader};
pub use policy::{
    AbortOnError, AcceptAll, ChangeDetector, ContinueOnError, ErrorHandler, MetadataDetector,
    RestoreFilter, ScanFilter,
};
pub use progress::{NoProgress, Progress, ProgressSink, Throughput};
pub use restorer::Restorer;
pub use scanner::Scanner;
pub use snapshot::{Snapshot, find_snapshot, latest_snapshot_of, list_snapshots};
pub use store::{ContentStore, LocalStore, MemoryStore, min_prefix_len, resolve_prefix_in};
pub use tree::{Node, NodeType, Stat, Tree, TreeMap};
