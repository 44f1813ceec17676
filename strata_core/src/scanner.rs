//! Filesystem scanning into a skeletal tree.

use crate::error::{Error, Result};
use crate::policy::{AbortOnError, AcceptAll, ErrorHandler, ScanFilter};
use crate::progress::Progress;
use crate::tree::{Node, Stat, Tree};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Walks a path and builds the skeletal [`Tree`] the archiver works from.
///
/// No file content is read. The result contains one node for the scanned
/// path itself; dir nodes carry their `children`.
pub struct Scanner {
    progress: Progress,
    filter: Arc<dyn ScanFilter>,
    error: Box<dyn ErrorHandler>,
}

impl Scanner {
    /// Create a scanner reporting to `progress`.
    pub fn new(progress: Progress) -> Self {
        Self {
            progress,
            filter: Arc::new(AcceptAll),
            error: Box::new(AbortOnError),
        }
    }

    /// Only include entries accepted by `filter`.
    pub fn with_filter(mut self, filter: impl ScanFilter + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// Route unreadable entries to `handler` instead of aborting.
    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error = Box::new(handler);
        self
    }

    /// Scan `path`.
    ///
    /// Entries are visited depth-first, sorted by file name within each
    /// directory. Symlinks are recorded, not followed.
    pub fn scan(&self, path: &Path) -> Result<Tree> {
        let root = fs::canonicalize(path).map_err(|e| Error::io_at(path, e))?;
        if root.file_name().is_none() {
            return Err(Error::invalid_node(format!(
                "Cannot scan {}: path has no final component",
                root.display()
            )));
        }

        self.progress.start();
        let result = self.walk(&root);
        self.progress.force();
        self.progress.done();

        let tree = result?;
        debug!(path = %root.display(), stat = ?tree.stat(), "scan finished");
        Ok(tree)
    }

    fn walk(&self, root: &Path) -> Result<Tree> {
        let filter = Arc::clone(&self.filter);
        let walker = ignore::WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                entry.depth() == 0
                    || entry
                        .metadata()
                        .map(|m| filter.include(entry.path(), &m))
                        .unwrap_or(true)
            })
            .build();

        // stack[d] is the open directory at depth d and the nodes found in it so far.
        let mut stack: Vec<OpenDir> = Vec::new();
        let mut top: Option<Node> = None;
        let mut skipped: Option<PathBuf> = None;

        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    let path = error_path(&err).unwrap_or_else(|| root.to_path_buf());
                    self.error.handle(&path, None, err.into())?;
                    // A dir is yielded before it is read, so a failed read
                    // leaves its node open on the stack.
                    if discard_open_dir(&mut stack, &path) {
                        debug!(path = %path.display(), "dropped unreadable dir");
                    }
                    skipped = Some(path);
                    continue;
                }
            };

            let path = entry.path();
            if skipped.as_deref().is_some_and(|s| path.starts_with(s)) {
                trace!(path = %path.display(), "below skipped entry");
                continue;
            }

            let depth = entry.depth();
            while stack.len() > depth {
                close_dir(&mut stack, &mut top)?;
            }

            let node = match entry_node(&entry) {
                Ok(node) => node,
                Err(err) => {
                    self.error.handle(path, None, err)?;
                    skipped = Some(path.to_path_buf());
                    continue;
                }
            };

            self.progress.report(Stat::of_node(&node));

            if node.is_dir() {
                stack.push(OpenDir {
                    path: path.to_path_buf(),
                    node,
                    nodes: Vec::new(),
                });
            } else if let Some(open) = stack.last_mut() {
                open.nodes.push(node);
            } else {
                top = Some(node);
            }
        }

        while !stack.is_empty() {
            close_dir(&mut stack, &mut top)?;
        }

        Tree::from_nodes(top.into_iter().collect())
    }
}

/// A directory whose entries are still being collected.
struct OpenDir {
    path: PathBuf,
    node: Node,
    nodes: Vec<Node>,
}

/// Finish the innermost open directory and attach it to its parent.
fn close_dir(stack: &mut Vec<OpenDir>, top: &mut Option<Node>) -> Result<()> {
    let Some(OpenDir {
        node: mut dir,
        nodes,
        ..
    }) = stack.pop()
    else {
        return Ok(());
    };
    dir.children = Some(Tree::from_nodes(nodes)?);

    match stack.last_mut() {
        Some(open) => open.nodes.push(dir),
        None => *top = Some(dir),
    }
    Ok(())
}

/// Drop the innermost open directory if it is `path`. Returns true if one
/// was dropped.
fn discard_open_dir(stack: &mut Vec<OpenDir>, path: &Path) -> bool {
    if stack.last().is_some_and(|open| open.path == path) {
        stack.pop();
        true
    } else {
        false
    }
}

fn entry_node(entry: &ignore::DirEntry) -> Result<Node> {
    let path = entry.path();
    let metadata = fs::symlink_metadata(path).map_err(|e| Error::io_at(path, e))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invalid_node(format!("Invalid filename: {}", path.display())))?
        .to_string();

    Node::from_metadata(name, path, &metadata)
}

/// The path an `ignore` walk error refers to, if it carries one.
fn error_path(err: &ignore::Error) -> Option<PathBuf> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.clone()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        ignore::Error::Loop { child, .. } => Some(child.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeType;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn sample_dir() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("sub/deeper")).unwrap();
        fs::write(src.join("b.txt"), b"bbbb").unwrap();
        fs::write(src.join("a.txt"), b"aa").unwrap();
        fs::write(src.join("sub/c.txt"), b"cccccc").unwrap();
        fs::write(src.join("sub/deeper/d.txt"), b"d").unwrap();
        temp_dir
    }

    #[test]
    fn test_scan_builds_nested_tree() {
        let temp_dir = sample_dir();
        let tree = Scanner::new(Progress::disabled())
            .scan(&temp_dir.path().join("src"))
            .unwrap();

        assert_eq!(tree.len(), 1);
        let root = &tree.nodes[0];
        assert_eq!(root.name, "src");
        assert_eq!(root.node_type, NodeType::Dir);

        let children = root.children.as_ref().unwrap();
        let names: Vec<&str> = children.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

        let sub = children.find("sub").unwrap().children.as_ref().unwrap();
        let deeper = sub.find("deeper").unwrap().children.as_ref().unwrap();
        assert_eq!(deeper.nodes[0].name, "d.txt");

        assert_eq!(
            tree.stat_todo(),
            Stat {
                files: 4,
                dirs: 3,
                bytes: 13
            }
        );
    }

    #[test]
    fn test_scan_single_file() {
        let temp_dir = sample_dir();
        let tree = Scanner::new(Progress::disabled())
            .scan(&temp_dir.path().join("src/a.txt"))
            .unwrap();

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.nodes[0].name, "a.txt");
        assert_eq!(tree.nodes[0].size, 2);
        assert!(tree.nodes[0].content.is_none());
    }

    #[test]
    fn test_scan_order_is_stable() {
        let temp_dir = sample_dir();
        let scanner = || Scanner::new(Progress::disabled());
        let first = scanner().scan(&temp_dir.path().join("src")).unwrap();
        let second = scanner().scan(&temp_dir.path().join("src")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_filter_prunes_directories() {
        let temp_dir = sample_dir();
        let tree = Scanner::new(Progress::disabled())
            .with_filter(|path: &Path, _: &fs::Metadata| !path.ends_with("sub"))
            .scan(&temp_dir.path().join("src"))
            .unwrap();

        let children = tree.nodes[0].children.as_ref().unwrap();
        assert!(children.find("sub").is_none());
        assert_eq!(tree.stat().files, 2);
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_are_recorded_not_followed() {
        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        std::os::unix::fs::symlink("sub", src.join("link")).unwrap();

        let tree = Scanner::new(Progress::disabled()).scan(&src).unwrap();
        let link = tree.nodes[0].children.as_ref().unwrap().find("link").unwrap();

        assert_eq!(link.node_type, NodeType::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("sub"));
        assert!(link.children.is_none());
    }

    #[test]
    fn test_scan_missing_path_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = Scanner::new(Progress::disabled()).scan(&temp_dir.path().join("nope"));
        assert!(result.is_err());
    }

    #[test]
    fn test_progress_counts_every_entry() {
        use crate::progress::ProgressSink;
        use std::time::Duration;

        struct Last(Arc<parking_lot::Mutex<Option<Stat>>>);
        impl ProgressSink for Last {
            fn done(&self, stat: &Stat, _elapsed: Duration) {
                *self.0.lock() = Some(*stat);
            }
        }

        let temp_dir = sample_dir();
        let last = Arc::new(parking_lot::Mutex::new(None));
        let progress = Progress::new(Duration::from_secs(1), Last(Arc::clone(&last)));
        Scanner::new(progress)
            .scan(&temp_dir.path().join("src"))
            .unwrap();

        let stat = (*last.lock()).unwrap();
        assert_eq!(stat.dirs, 3);
        assert_eq!(stat.files, 4);
        assert_eq!(stat.bytes, 13);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_error_handler_skips_unnameable_entries() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let bad = src.join(OsStr::from_bytes(b"bad\xff"));
        fs::create_dir(&bad).unwrap();
        fs::write(bad.join("inside.txt"), b"x").unwrap();

        // Default policy aborts.
        assert!(Scanner::new(Progress::disabled()).scan(&src).is_err());

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_by_handler = Rc::clone(&seen);
        let handler = move |path: &Path, _: Option<&Node>, _: Error| -> Result<()> {
            seen_by_handler.borrow_mut().push(path.to_path_buf());
            Ok(())
        };

        let tree = Scanner::new(Progress::disabled())
            .with_error_handler(handler)
            .scan(&src)
            .unwrap();

        // The entry and everything below it are left out.
        assert_eq!(*seen.borrow(), vec![bad]);
        assert_eq!(tree.stat().files, 4);
        assert_eq!(tree.stat().dirs, 3);
    }

    #[test]
    fn test_discard_open_dir_only_drops_matching_top() {
        let open = |path: &str| OpenDir {
            path: PathBuf::from(path),
            node: Node::dir(Path::new(path).file_name().unwrap().to_str().unwrap()).unwrap(),
            nodes: Vec::new(),
        };
        let mut stack = vec![open("/src"), open("/src/locked")];

        assert!(!discard_open_dir(&mut stack, Path::new("/src")));
        assert!(!discard_open_dir(&mut stack, Path::new("/src/other")));
        assert_eq!(stack.len(), 2);

        assert!(discard_open_dir(&mut stack, Path::new("/src/locked")));
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].path, PathBuf::from("/src"));

        let mut top = None;
        close_dir(&mut stack, &mut top).unwrap();
        assert!(top.unwrap().children.unwrap().is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_unreadable_dir_is_left_out() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = sample_dir();
        let src = temp_dir.path().join("src");
        let locked = src.join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("secret.txt"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users read through the mode bits; nothing to check then.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_by_handler = Rc::clone(&seen);
        let handler = move |path: &Path, _: Option<&Node>, _: Error| -> Result<()> {
            seen_by_handler.borrow_mut().push(path.to_path_buf());
            Ok(())
        };
        let result = Scanner::new(Progress::disabled())
            .with_error_handler(handler)
            .scan(&src);
        let aborted = Scanner::new(Progress::disabled()).scan(&src);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let tree = result.unwrap();
        assert!(aborted.is_err());
        assert_eq!(*seen.borrow(), vec![locked]);

        let root = tree.nodes[0].children.as_ref().unwrap();
        assert!(root.find("locked").is_none());
        assert_eq!(tree.stat().dirs, 3);
        assert_eq!(tree.stat().files, 4);
    }
}
