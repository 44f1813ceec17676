//! Pluggable policies for the scanner, archiver and restorer.
//!
//! Each policy is a single-method trait with a default implementation.
//! Closures of the matching shape implement the traits too, so callers can
//! write `archiver.with_error_handler(|path, node, err| ...)`.

use crate::error::{Error, Result};
use crate::tree::Node;
use std::fs::Metadata;
use std::path::Path;
use tracing::warn;

/// Decides what happens when a single item fails.
///
/// Returning `Ok(())` skips the item and continues the walk; returning an
/// error aborts the walk and hands that error to the caller.
pub trait ErrorHandler {
    /// Handle the failure `err` for the item at `path`.
    fn handle(&self, path: &Path, node: Option<&Node>, err: Error) -> Result<()>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&Path, Option<&Node>, Error) -> Result<()>,
{
    fn handle(&self, path: &Path, node: Option<&Node>, err: Error) -> Result<()> {
        self(path, node, err)
    }
}

/// Abort on the first failure. The default everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnError;

impl ErrorHandler for AbortOnError {
    fn handle(&self, _path: &Path, _node: Option<&Node>, err: Error) -> Result<()> {
        Err(err)
    }
}

/// Log the failure and carry on with the next item.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueOnError;

impl ErrorHandler for ContinueOnError {
    fn handle(&self, path: &Path, _node: Option<&Node>, err: Error) -> Result<()> {
        warn!(path = %path.display(), error = %err, "skipping item");
        Ok(())
    }
}

/// Decides which filesystem entries the scanner includes.
///
/// Rejecting a directory also excludes everything below it.
pub trait ScanFilter: Send + Sync {
    /// Whether to include the entry at `path`.
    fn include(&self, path: &Path, metadata: &Metadata) -> bool;
}

impl<F> ScanFilter for F
where
    F: Fn(&Path, &Metadata) -> bool + Send + Sync,
{
    fn include(&self, path: &Path, metadata: &Metadata) -> bool {
        self(path, metadata)
    }
}

/// Decides which nodes the restorer materializes.
///
/// Rejecting a dir node skips its whole subtree.
pub trait RestoreFilter {
    /// Whether to restore `node` from `source` (its original location) to `dest`.
    fn accept(&self, source: &Path, dest: &Path, node: &Node) -> bool;
}

impl<F> RestoreFilter for F
where
    F: Fn(&Path, &Path, &Node) -> bool,
{
    fn accept(&self, source: &Path, dest: &Path, node: &Node) -> bool {
        self(source, dest, node)
    }
}

/// Accept everything. Default filter for scanner and restorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ScanFilter for AcceptAll {
    fn include(&self, _path: &Path, _metadata: &Metadata) -> bool {
        true
    }
}

impl RestoreFilter for AcceptAll {
    fn accept(&self, _source: &Path, _dest: &Path, _node: &Node) -> bool {
        true
    }
}

/// Decides whether a node from a parent snapshot still describes the
/// current filesystem entry, so its stored content can be reused.
///
/// A wrong "unchanged" answer makes the new snapshot point at stale content,
/// so implementations must err towards "changed".
pub trait ChangeDetector {
    /// True if `current` can reuse the content recorded in `previous`.
    fn unchanged(&self, previous: &Node, current: &Node) -> bool;
}

/// Treat equal name, type, size, mtime and link target as unchanged content.
///
/// This trusts the filesystem's mtime. Content modified without an mtime or
/// size change (clock skew, tools that restore timestamps) goes unnoticed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataDetector;

impl ChangeDetector for MetadataDetector {
    fn unchanged(&self, previous: &Node, current: &Node) -> bool {
        previous.name == current.name
            && previous.node_type == current.node_type
            && previous.size == current.size
            && previous.mtime == current.mtime
            && previous.link_target == current.link_target
    }
}
