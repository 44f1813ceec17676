//! Archiving scanned trees into snapshots.
//!
//! The archiver takes the skeletal tree produced by the [`Scanner`] and walks
//! it bottom-up: file content is chunked and stored as blobs, then each
//! directory's tree is stored once all of its entries are final. Content is
//! addressed by id, so unchanged files and directories converge to objects
//! that are already present and are not written again.
//!
//! [`Scanner`]: crate::scanner::Scanner

use crate::chunking::{Chunker, ChunkerConfig};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::object::ObjectClass;
use crate::policy::{AbortOnError, ChangeDetector, ErrorHandler};
use crate::progress::Progress;
use crate::snapshot::Snapshot;
use crate::store::ContentStore;
use crate::tree::{Node, NodeType, Stat, Tree};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

impl Tree {
    /// Reuse content recorded in `parent` for every node `detector` reports as
    /// unchanged. Returns the number of files whose content was reused.
    ///
    /// Nodes are matched by name. Directories present on both sides are
    /// descended into; a parent subtree that is not in memory is loaded from
    /// `store`.
    pub fn copy_from<S: ContentStore + ?Sized>(
        &mut self,
        parent: &Tree,
        store: &S,
        detector: &dyn ChangeDetector,
    ) -> Result<usize> {
        let mut reused = 0;
        self.copy_matching(parent, store, detector, &mut reused)?;
        debug!(reused, "reused content from parent tree");
        Ok(reused)
    }

    fn copy_matching<S: ContentStore + ?Sized>(
        &mut self,
        parent: &Tree,
        store: &S,
        detector: &dyn ChangeDetector,
        reused: &mut usize,
    ) -> Result<()> {
        for node in &mut self.nodes {
            let Some(old) = parent.find(&node.name) else {
                continue;
            };

            if node.is_dir() {
                let Some(children) = node.children.as_mut() else {
                    continue;
                };
                if !old.is_dir() {
                    continue;
                }
                match (&old.children, old.subtree) {
                    (Some(old_children), _) => {
                        children.copy_matching(old_children, store, detector, reused)?
                    }
                    (None, Some(id)) => {
                        let loaded = Tree::load(store, &id)?;
                        children.copy_matching(&loaded, store, detector, reused)?
                    }
                    (None, None) => {
                        return Err(Error::structural(format!(
                            "Parent dir {:?} has no subtree id",
                            old.name
                        )));
                    }
                }
            } else if node.content.is_none()
                && old.content.is_some()
                && detector.unchanged(old, node)
            {
                node.content = old.content.clone();
                *reused += 1;
            }
        }
        Ok(())
    }
}

/// Failures while archiving a single file.
enum Failure {
    /// The file could not be read; handed to the error handler.
    Item(Error),
    /// The store failed; ends the walk.
    Store(Error),
}

struct Frame {
    path: PathBuf,
    pending: std::vec::IntoIter<Node>,
    done: Vec<Node>,
    dir: Option<Node>,
}

/// Persists trees and file content into a store and records snapshots.
pub struct Archiver<S: ContentStore> {
    store: S,
    progress: Progress,
    error: Box<dyn ErrorHandler>,
    chunker: ChunkerConfig,
}

impl<S: ContentStore> Archiver<S> {
    /// Create an archiver writing to `store`.
    pub fn new(store: S, progress: Progress) -> Self {
        Self {
            store,
            progress,
            error: Box::new(AbortOnError),
            chunker: ChunkerConfig::default(),
        }
    }

    /// Route per-file failures to `handler` instead of aborting.
    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error = Box::new(handler);
        self
    }

    /// Use custom chunk sizes.
    pub fn with_chunker(mut self, config: ChunkerConfig) -> Self {
        self.chunker = config;
        self
    }

    /// The store objects are written to.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Archive `tree`, scanned from `target`, and store a snapshot of it.
    ///
    /// Returns the finalized tree, with every dir node's `subtree` and every
    /// file node's `content` set, and the new snapshot's id.
    pub fn snapshot(&self, target: &Path, tree: Tree, parent: Option<Id>) -> Result<(Tree, Id)> {
        let target = fs::canonicalize(target).map_err(|e| Error::io_at(target, e))?;

        self.progress.start();
        let result = self.archive(&target, tree);
        self.progress.done();
        let tree = result?;

        let root = tree.save(&self.store)?;
        let mut snapshot = Snapshot::new(root, target.clone(), tree.stat());
        snapshot.parent = parent;
        let id = snapshot.save(&self.store)?;

        debug!(snapshot = %id.short(), tree = %root.short(), stat = ?snapshot.stat, "snapshot saved");
        Ok((tree, id))
    }

    /// Post-order walk finalizing every node. Paths are resolved against the
    /// directory containing `target`, since the tree's single root node is
    /// `target` itself.
    fn archive(&self, target: &Path, tree: Tree) -> Result<Tree> {
        let base = target.parent().unwrap_or(target).to_path_buf();
        let mut current = Frame {
            path: base,
            pending: tree.nodes.into_iter(),
            done: Vec::new(),
            dir: None,
        };
        let mut ancestors: Vec<Frame> = Vec::new();

        loop {
            let Some(mut node) = current.pending.next() else {
                let tree = Tree::from_nodes(current.done)?;
                let (Some(mut parent), Some(mut dir)) = (ancestors.pop(), current.dir) else {
                    return Ok(tree);
                };

                dir.subtree = Some(tree.save(&self.store)?);
                dir.children = Some(tree);
                self.progress.report(Stat::of_node(&dir));
                parent.done.push(dir);
                current = parent;
                continue;
            };

            let path = current.path.join(&node.name);
            match node.node_type {
                NodeType::Dir => match node.children.take() {
                    Some(children) => {
                        let parent = std::mem::replace(
                            &mut current,
                            Frame {
                                path,
                                pending: children.nodes.into_iter(),
                                done: Vec::new(),
                                dir: Some(node),
                            },
                        );
                        ancestors.push(parent);
                    }
                    None if node.subtree.is_some() => {
                        trace!(path = %path.display(), "dir already stored");
                        current.done.push(node);
                    }
                    None => {
                        return Err(Error::structural(format!(
                            "Dir {} has neither children nor a subtree id",
                            path.display()
                        )));
                    }
                },
                NodeType::File if node.content.is_none() => {
                    match self.save_file(&path, &mut node) {
                        Ok(()) => {
                            self.progress.report(Stat::of_node(&node));
                            current.done.push(node);
                        }
                        Err(Failure::Item(err)) => {
                            self.error.handle(&path, Some(&node), err)?;
                            debug!(path = %path.display(), "dropped unreadable file");
                        }
                        Err(Failure::Store(err)) => return Err(err),
                    }
                }
                NodeType::File => current.done.push(node),
                NodeType::Symlink => {
                    self.progress.report(Stat::of_node(&node));
                    current.done.push(node);
                }
            }
        }
    }

    /// Chunk the file at `path` and attach its blob ids to `node`.
    fn save_file(&self, path: &Path, node: &mut Node) -> std::result::Result<(), Failure> {
        let file = File::open(path).map_err(|e| Failure::Item(Error::io_at(path, e)))?;

        let mut content = Vec::new();
        let mut size = 0u64;
        for chunk in Chunker::new(BufReader::new(file), &self.chunker) {
            let chunk = chunk.map_err(|e| Failure::Item(at_path(path, e)))?;
            size += chunk.data.len() as u64;

            if !self
                .store
                .has(ObjectClass::Blob, &chunk.id)
                .map_err(Failure::Store)?
            {
                self.store
                    .put(ObjectClass::Blob, &chunk.data)
                    .map_err(Failure::Store)?;
            }
            content.push(chunk.id);
        }

        if size != node.size {
            warn!(
                path = %path.display(),
                scanned = node.size,
                read = size,
                "file changed size during backup"
            );
            node.size = size;
        }
        node.content = Some(content);
        Ok(())
    }
}

fn at_path(path: &Path, err: Error) -> Error {
    match err {
        Error::Io { source } => Error::io_at(path, source),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MetadataDetector;
    use crate::scanner::Scanner;
    use crate::store::MemoryStore;
    use crate::progress::ProgressSink;
    use parking_lot::Mutex;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Wraps a store and records every put.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        puts: Mutex<Vec<(ObjectClass, Id)>>,
    }

    impl ContentStore for RecordingStore {
        fn put(&self, class: ObjectClass, data: &[u8]) -> Result<Id> {
            let id = self.inner.put(class, data)?;
            self.puts.lock().push((class, id));
            Ok(id)
        }

        fn get(&self, class: ObjectClass, id: &Id) -> Result<Vec<u8>> {
            self.inner.get(class, id)
        }

        fn has(&self, class: ObjectClass, id: &Id) -> Result<bool> {
            self.inner.has(class, id)
        }

        fn list(&self, class: ObjectClass) -> Result<Vec<Id>> {
            self.inner.list(class)
        }
    }

    fn small_chunks() -> ChunkerConfig {
        ChunkerConfig {
            min_size: 1024,
            avg_size: 4096,
            max_size: 16 * 1024,
        }
    }

    fn sample_dir() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), b"alpha").unwrap();
        fs::write(src.join("b.txt"), b"bravo").unwrap();
        fs::write(src.join("empty"), b"").unwrap();
        fs::write(src.join("sub/copy.txt"), b"alpha").unwrap();
        let big: Vec<u8> = (0..64 * 1024).map(|i| ((i * 17) % 251) as u8).collect();
        fs::write(src.join("sub/big.bin"), big).unwrap();
        temp_dir
    }

    fn scan(path: &Path) -> Tree {
        Scanner::new(Progress::disabled()).scan(path).unwrap()
    }

    fn read_content<C: ContentStore + ?Sized>(store: &C, node: &Node) -> Vec<u8> {
        let mut data = Vec::new();
        for id in node.content.as_ref().unwrap() {
            data.extend(store.get(ObjectClass::Blob, id).unwrap());
        }
        data
    }

    #[test]
    fn test_snapshot_finalizes_tree() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let store = MemoryStore::new();
        let archiver = Archiver::new(&store, Progress::disabled()).with_chunker(small_chunks());

        let (tree, id) = archiver.snapshot(&src, scan(&src), None).unwrap();

        let root = &tree.nodes[0];
        assert!(root.subtree.is_some());
        let children = root.children.as_ref().unwrap();
        assert_eq!(read_content(&store, children.find("a.txt").unwrap()), b"alpha");
        assert_eq!(children.find("empty").unwrap().content, Some(vec![]));

        let sub = children.find("sub").unwrap().children.as_ref().unwrap();
        let big = sub.find("big.bin").unwrap();
        assert!(big.content.as_ref().unwrap().len() > 1);
        assert_eq!(read_content(&store, big), fs::read(src.join("sub/big.bin")).unwrap());

        let snapshot = Snapshot::load(&store, &id).unwrap();
        assert_eq!(snapshot.dir, fs::canonicalize(&src).unwrap());
        assert_eq!(snapshot.parent, None);
        assert_eq!(snapshot.stat, tree.stat());
        assert_eq!(snapshot.stat.files, 5);
        assert_eq!(snapshot.stat.dirs, 2);

        // The stored tree loads back to the finalized one.
        assert_eq!(Tree::load_recursive(&store, &snapshot.tree).unwrap(), tree);
    }

    #[test]
    fn test_identical_content_stored_once() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let store = RecordingStore::default();
        let archiver = Archiver::new(&store, Progress::disabled()).with_chunker(small_chunks());

        archiver.snapshot(&src, scan(&src), None).unwrap();
        archiver.snapshot(&src, scan(&src), None).unwrap();

        let puts = store.puts.lock();
        let blob_puts: Vec<&Id> = puts
            .iter()
            .filter(|(class, _)| *class == ObjectClass::Blob)
            .map(|(_, id)| id)
            .collect();

        // "alpha" appears twice on disk and every file was read twice, but
        // each blob went to the store exactly once.
        let unique: std::collections::BTreeSet<&Id> = blob_puts.iter().copied().collect();
        assert_eq!(unique.len(), blob_puts.len());
        assert_eq!(store.inner.len(ObjectClass::Blob), blob_puts.len());
    }

    #[test]
    fn test_unchanged_rerun_writes_only_snapshot() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let store = MemoryStore::new();
        let archiver = Archiver::new(&store, Progress::disabled());

        let (first, first_id) = archiver.snapshot(&src, scan(&src), None).unwrap();
        let writes = store.writes();

        let mut tree = scan(&src);
        let reused = tree.copy_from(&first, &store, &MetadataDetector).unwrap();
        assert_eq!(reused, 5);
        assert_eq!(tree.stat_todo().files, 0);

        let (second, second_id) = archiver.snapshot(&src, tree, Some(first_id)).unwrap();
        assert_eq!(second.nodes[0].subtree, first.nodes[0].subtree);
        assert_eq!(store.writes(), writes + 1);
        assert_eq!(Snapshot::load(&store, &second_id).unwrap().parent, Some(first_id));
    }

    #[test]
    fn test_each_snapshot_reports_its_own_totals() {
        #[derive(Default)]
        struct Finished(Mutex<Vec<Stat>>);

        impl ProgressSink for Arc<Finished> {
            fn done(&self, stat: &Stat, _elapsed: Duration) {
                self.0.lock().push(*stat);
            }
        }

        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let store = MemoryStore::new();
        let finished = Arc::new(Finished::default());
        let progress = Progress::new(Duration::from_secs(3600), Arc::clone(&finished));
        let archiver = Archiver::new(&store, progress);

        archiver.snapshot(&src, scan(&src), None).unwrap();
        archiver.snapshot(&src, scan(&src), None).unwrap();

        let totals = finished.0.lock().clone();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0], totals[1]);
        assert_eq!(totals[0].files, 5);
    }

    #[test]
    fn test_copy_from_skips_changed_files() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let store = MemoryStore::new();
        let archiver = Archiver::new(&store, Progress::disabled());
        let (first, _) = archiver.snapshot(&src, scan(&src), None).unwrap();

        fs::write(src.join("b.txt"), b"bravo, changed").unwrap();
        fs::write(src.join("new.txt"), b"new").unwrap();

        let mut tree = scan(&src);
        let reused = tree.copy_from(&first, &store, &MetadataDetector).unwrap();
        assert_eq!(reused, 4);

        let children = tree.nodes[0].children.as_ref().unwrap();
        assert!(children.find("b.txt").unwrap().content.is_none());
        assert!(children.find("new.txt").unwrap().content.is_none());
        assert!(children.find("a.txt").unwrap().content.is_some());
    }

    #[test]
    fn test_copy_from_loads_parent_subtrees() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let store = MemoryStore::new();
        let archiver = Archiver::new(&store, Progress::disabled());
        let (_, id) = archiver.snapshot(&src, scan(&src), None).unwrap();

        // Only the root tree is loaded; everything below comes from the store.
        let parent = Tree::load(&store, &Snapshot::load(&store, &id).unwrap().tree).unwrap();
        assert!(parent.nodes[0].children.is_none());

        let mut tree = scan(&src);
        assert_eq!(tree.copy_from(&parent, &store, &MetadataDetector).unwrap(), 5);
    }

    #[test]
    fn test_abort_on_error_by_default() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let tree = scan(&src);
        fs::remove_file(src.join("a.txt")).unwrap();

        let store = MemoryStore::new();
        let archiver = Archiver::new(&store, Progress::disabled());
        let err = archiver.snapshot(&src, tree, None).unwrap_err();

        assert!(err.is_not_found_io());
        // Walk stopped at the first entry: later files were never stored.
        assert!(!store.has(ObjectClass::Blob, &Id::hash_bytes(b"bravo")).unwrap());
        assert_eq!(store.len(ObjectClass::Snapshot), 0);
    }

    #[test]
    fn test_error_handler_drops_failed_files() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let tree = scan(&src);
        fs::remove_file(src.join("a.txt")).unwrap();

        let failed = Rc::new(RefCell::new(Vec::new()));
        let failed_by_handler = Rc::clone(&failed);
        let handler = move |path: &Path, node: Option<&Node>, _: Error| -> Result<()> {
            assert_eq!(node.map(|n| n.name.as_str()), Some("a.txt"));
            failed_by_handler.borrow_mut().push(path.to_path_buf());
            Ok(())
        };

        let store = MemoryStore::new();
        let archiver = Archiver::new(&store, Progress::disabled()).with_error_handler(handler);
        let (tree, id) = archiver.snapshot(&src, tree, None).unwrap();

        assert_eq!(
            *failed.borrow(),
            vec![fs::canonicalize(&src).unwrap().join("a.txt")]
        );
        let children = tree.nodes[0].children.as_ref().unwrap();
        assert!(children.find("a.txt").is_none());
        assert!(children.find("b.txt").is_some());
        assert_eq!(Snapshot::load(&store, &id).unwrap().stat.files, 4);
    }

    #[test]
    fn test_size_follows_bytes_read() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let tree = scan(&src);
        fs::write(src.join("a.txt"), b"alpha plus more").unwrap();

        let store = MemoryStore::new();
        let (tree, _) = Archiver::new(&store, Progress::disabled())
            .snapshot(&src, tree, None)
            .unwrap();

        let a = tree.nodes[0].children.as_ref().unwrap().find("a.txt").unwrap();
        assert_eq!(a.size, 15);
        assert_eq!(read_content(&store, a), b"alpha plus more");
    }

    #[test]
    fn test_dir_without_children_or_subtree_is_structural() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let mut tree = scan(&src);
        if let Some(sub) = tree.nodes[0]
            .children
            .as_mut()
            .and_then(|c| c.find_mut("sub"))
        {
            sub.children = None;
        }

        let store = MemoryStore::new();
        let err = Archiver::new(&store, Progress::disabled())
            .snapshot(&src, tree, None)
            .unwrap_err();
        assert!(err.is_structural());
    }
}
