//! Restoring snapshots onto the filesystem.

use crate::error::{Error, Result};
use crate::id::Id;
use crate::object::ObjectClass;
use crate::policy::{AbortOnError, AcceptAll, ErrorHandler, RestoreFilter};
use crate::snapshot::Snapshot;
use crate::store::ContentStore;
use crate::tree::{Node, NodeType, Tree, TreeMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Remaining entries of one directory being restored.
struct Frame {
    /// Path of the directory relative to the restore root.
    rel: PathBuf,
    pending: std::vec::IntoIter<Node>,
    /// Destination and node of the directory, for metadata applied on exit.
    dir: Option<(PathBuf, Node)>,
}

/// Materializes a stored snapshot below a destination directory.
pub struct Restorer<S: ContentStore> {
    store: S,
    snapshot: Snapshot,
    error: Box<dyn ErrorHandler>,
    filter: Box<dyn RestoreFilter>,
}

impl<S: ContentStore> Restorer<S> {
    /// Load snapshot `id` from `store` for restoring.
    pub fn new(store: S, id: &Id) -> Result<Self> {
        let snapshot = Snapshot::load(&store, id)?;
        Ok(Self {
            store,
            snapshot,
            error: Box::new(AbortOnError),
            filter: Box::new(AcceptAll),
        })
    }

    /// Route per-item failures to `handler` instead of aborting.
    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error = Box::new(handler);
        self
    }

    /// Only restore nodes accepted by `filter`.
    pub fn with_filter(mut self, filter: impl RestoreFilter + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    /// The snapshot being restored.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Restore the snapshot below `dst`.
    ///
    /// The snapshot's top-level entry is recreated as `dst/<name>`. Missing
    /// parents of `dst` are created on demand.
    pub fn restore_to(&self, dst: &Path) -> Result<()> {
        let root = match Tree::load(&self.store, &self.snapshot.tree) {
            Ok(tree) => tree,
            Err(err) => return self.error.handle(dst, None, err),
        };

        let source_base = self
            .snapshot
            .dir
            .parent()
            .unwrap_or(&self.snapshot.dir)
            .to_path_buf();

        let mut trees = TreeMap::new();
        let mut stack = vec![Frame {
            rel: PathBuf::new(),
            pending: root.nodes.into_iter(),
            dir: None,
        }];

        while let Some(frame) = stack.last_mut() {
            let Some(node) = frame.pending.next() else {
                if let Some((dest, dir)) = stack.pop().and_then(|f| f.dir) {
                    if let Err(err) = apply_dir_metadata(&dest, &dir) {
                        self.error.handle(&dest, Some(&dir), err)?;
                    }
                }
                continue;
            };

            let rel = frame.rel.join(&node.name);
            let dest = dst.join(&rel);
            let source = source_base.join(&rel);

            if !self.filter.accept(&source, &dest, &node) {
                trace!(path = %dest.display(), "filtered out");
                continue;
            }

            let subtree = match (node.node_type, node.subtree) {
                (NodeType::Dir, Some(id)) => Some(id),
                (NodeType::Dir, None) => {
                    let err = Error::structural(format!(
                        "Dir {} has no subtree id",
                        source.display()
                    ));
                    self.error.handle(&dest, Some(&node), err)?;
                    continue;
                }
                _ => None,
            };

            if let Err(err) = self.create_with_retry(&node, &dest) {
                self.error.handle(&dest, Some(&node), err)?;
                continue;
            }

            let Some(subtree) = subtree else {
                continue;
            };
            match self.load_subtree(&mut trees, &subtree) {
                Ok(nodes) => stack.push(Frame {
                    rel,
                    pending: nodes.into_iter(),
                    dir: Some((dest, node)),
                }),
                Err(err) => self.error.handle(&dest, Some(&node), err)?,
            }
        }

        debug!(snapshot = %self.snapshot.tree.short(), dst = %dst.display(), "restore finished");
        Ok(())
    }

    fn load_subtree(&self, trees: &mut TreeMap, id: &Id) -> Result<Vec<Node>> {
        if !trees.contains(id) {
            trees.insert(*id, Tree::load(&self.store, id)?);
        }
        Ok(trees.find(id)?.nodes.clone())
    }

    /// Create `node` at `dest`, creating missing parents once if needed.
    fn create_with_retry(&self, node: &Node, dest: &Path) -> Result<()> {
        match self.create_node(node, dest) {
            Err(err) if err.is_not_found_io() => {
                if let Some(parent) = dest.parent() {
                    create_parents(parent)?;
                    debug!(path = %parent.display(), "created missing parent");
                }
                self.create_node(node, dest)
            }
            other => other,
        }
    }

    fn create_node(&self, node: &Node, dest: &Path) -> Result<()> {
        match node.node_type {
            NodeType::File => self.create_file(node, dest),
            NodeType::Dir => match fs::create_dir(dest) {
                Ok(()) => apply_ownership(dest, node),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dest.is_dir() => {
                    apply_ownership(dest, node)
                }
                Err(e) => Err(Error::io_at(dest, e)),
            },
            NodeType::Symlink => {
                let target = node.link_target.as_deref().ok_or_else(|| {
                    Error::structural(format!("Symlink {:?} has no target", node.name))
                })?;
                create_symlink(target, dest)?;
                apply_ownership(dest, node)
            }
        }
    }

    fn create_file(&self, node: &Node, dest: &Path) -> Result<()> {
        let content = node.content.as_ref().ok_or_else(|| {
            Error::structural(format!("File {:?} has no content list", node.name))
        })?;

        let mut file = File::create(dest).map_err(|e| Error::io_at(dest, e))?;
        for id in content {
            let data = self.store.get(ObjectClass::Blob, id)?;
            file.write_all(&data).map_err(|e| Error::io_at(dest, e))?;
        }
        file.set_modified(system_time(node.mtime))
            .map_err(|e| Error::io_at(dest, e))?;
        drop(file);

        apply_ownership(dest, node)?;
        set_mode(dest, node.mode)
    }
}

/// Mode and mtime of a directory, applied once all its entries exist.
fn apply_dir_metadata(dest: &Path, node: &Node) -> Result<()> {
    let dir = File::open(dest).map_err(|e| Error::io_at(dest, e))?;
    dir.set_modified(system_time(node.mtime))
        .map_err(|e| Error::io_at(dest, e))?;
    drop(dir);
    set_mode(dest, node.mode)
}

fn system_time(nanos: i64) -> SystemTime {
    let offset = Duration::from_nanos(nanos.unsigned_abs());
    if nanos >= 0 {
        UNIX_EPOCH + offset
    } else {
        UNIX_EPOCH - offset
    }
}

#[cfg(unix)]
fn create_parents(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|e| Error::io_at(path, e))
}

#[cfg(not(unix))]
fn create_parents(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io_at(path, e))
}

#[cfg(unix)]
fn create_symlink(target: &str, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dest).map_err(|e| Error::io_at(dest, e))
}

#[cfg(not(unix))]
fn create_symlink(_target: &str, dest: &Path) -> Result<()> {
    Err(Error::invalid_node(format!(
        "Symlinks are not supported on this platform: {}",
        dest.display()
    )))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| Error::io_at(path, e))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut permissions = fs::metadata(path)
        .map_err(|e| Error::io_at(path, e))?
        .permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, permissions).map_err(|e| Error::io_at(path, e))
}

/// Restore uid and gid without following symlinks. Unprivileged users can
/// only keep their own ownership, so a refusal is not an error.
#[cfg(unix)]
fn apply_ownership(path: &Path, node: &Node) -> Result<()> {
    match std::os::unix::fs::lchown(path, Some(node.uid), Some(node.gid)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!(path = %path.display(), uid = node.uid, gid = node.gid, "ownership not restored");
            Ok(())
        }
        Err(e) => Err(Error::io_at(path, e)),
    }
}

#[cfg(not(unix))]
fn apply_ownership(_path: &Path, _node: &Node) -> Result<()> {
    Ok(())
}
