//! Trees, nodes and aggregate statistics.
//!
//! A [`Tree`] is the ordered listing of one directory. Trees are stored as
//! compact JSON with a fixed field order, so a logically identical tree always
//! encodes to identical bytes and therefore to the same [`Id`].

use crate::error::{Error, Result};
use crate::id::Id;
use crate::object::ObjectClass;
use crate::store::ContentStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of filesystem entry a node describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// A regular file.
    File,
    /// A directory.
    Dir,
    /// A symbolic link.
    Symlink,
}

impl NodeType {
    /// Get the string name of this node type.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::File => "file",
            NodeType::Dir => "dir",
            NodeType::Symlink => "symlink",
        }
    }
}

/// One filesystem entry within a [`Tree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Entry name, unique within its tree.
    pub name: String,
    /// Entry kind.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// POSIX permission bits.
    pub mode: u32,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime: i64,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Size in bytes (files only, 0 otherwise).
    pub size: u64,
    /// Blob ids whose concatenation is the file content.
    ///
    /// `None` until the archiver has stored (or reused) the content; an empty
    /// file ends up with `Some(vec![])`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<Id>>,
    /// Symlink target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Id of the child tree (dirs only, required once finalized).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<Id>,
    /// In-memory child tree of a dir node. Never serialized.
    #[serde(skip)]
    pub children: Option<Tree>,
}

impl Node {
    fn bare(name: String, node_type: NodeType) -> Result<Self> {
        validate_name(&name)?;
        Ok(Self {
            name,
            node_type,
            mode: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
            size: 0,
            content: None,
            link_target: None,
            subtree: None,
            children: None,
        })
    }

    /// Create a file node with the given size and no content yet.
    pub fn file(name: impl Into<String>, size: u64) -> Result<Self> {
        let mut node = Self::bare(name.into(), NodeType::File)?;
        node.size = size;
        node.mode = 0o644;
        Ok(node)
    }

    /// Create a dir node with an empty in-memory child tree.
    pub fn dir(name: impl Into<String>) -> Result<Self> {
        let mut node = Self::bare(name.into(), NodeType::Dir)?;
        node.mode = 0o755;
        node.children = Some(Tree::new());
        Ok(node)
    }

    /// Create a symlink node pointing at `target`.
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        let mut node = Self::bare(name.into(), NodeType::Symlink)?;
        node.mode = 0o777;
        node.link_target = Some(target.into());
        Ok(node)
    }

    /// Build a node from `lstat` metadata of `path`.
    ///
    /// Symlinks are recorded with their target, never followed. Dir nodes get
    /// an empty child tree that the caller fills in.
    pub fn from_metadata(name: String, path: &Path, metadata: &fs::Metadata) -> Result<Self> {
        let file_type = metadata.file_type();

        let mut node = if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| Error::io_at(path, e))?;
            Self::symlink(name, target.to_string_lossy().into_owned())?
        } else if file_type.is_dir() {
            Self::dir(name)?
        } else if file_type.is_file() {
            Self::file(name, metadata.len())?
        } else {
            return Err(Error::invalid_node(format!(
                "Unsupported file type: {}",
                path.display()
            )));
        };

        node.mode = file_mode(metadata);
        node.mtime = mtime_nanos(metadata);
        let (uid, gid) = ownership(metadata);
        node.uid = uid;
        node.gid = gid;

        Ok(node)
    }

    /// True for a dir node.
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Dir
    }
}

/// Reject names that cannot be a single path component.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_node("Name cannot be empty"));
    }
    if name == "." || name == ".." {
        return Err(Error::invalid_node(format!("Name cannot be {:?}", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::invalid_node(format!(
            "Name cannot contain '/' or null bytes: {:?}",
            name
        )));
    }
    Ok(())
}

/// Get the permission bits from metadata.
#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Get the permission bits from metadata (Windows fallback).
#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn ownership(metadata: &fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn ownership(_metadata: &fs::Metadata) -> (u32, u32) {
    (0, 0)
}

fn mtime_nanos(metadata: &fs::Metadata) -> i64 {
    metadata.modified().map(nanos_since_epoch).unwrap_or(0)
}

/// Signed nanoseconds since the Unix epoch, saturating at the `i64` range.
fn nanos_since_epoch(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|n| -n)
            .unwrap_or(i64::MIN),
    }
}

/// Counters describing an amount of filesystem content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Regular files and symlinks.
    pub files: u64,
    /// Directories.
    pub dirs: u64,
    /// File content bytes.
    pub bytes: u64,
}

impl Stat {
    /// Counters contributed by a single node.
    pub fn of_node(node: &Node) -> Self {
        match node.node_type {
            NodeType::Dir => Stat {
                dirs: 1,
                ..Stat::default()
            },
            NodeType::File => Stat {
                files: 1,
                bytes: node.size,
                ..Stat::default()
            },
            NodeType::Symlink => Stat {
                files: 1,
                ..Stat::default()
            },
        }
    }

    /// Add another set of counters.
    pub fn add(&mut self, other: Stat) {
        self.files += other.files;
        self.dirs += other.dirs;
        self.bytes += other.bytes;
    }

    /// Files plus directories.
    pub fn items(&self) -> u64 {
        self.files + self.dirs
    }
}

impl std::ops::AddAssign for Stat {
    fn add_assign(&mut self, other: Stat) {
        self.add(other);
    }
}

/// An ordered listing of one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Entries in scan order.
    pub nodes: Vec<Node>,
}

impl Tree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from nodes, keeping their order. Duplicate names are rejected.
    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(Error::invalid_node(format!(
                    "Duplicate name in tree: {}",
                    node.name
                )));
            }
        }
        Ok(Self { nodes })
    }

    /// Append a node. Duplicate names are rejected.
    pub fn push(&mut self, node: Node) -> Result<()> {
        if self.find(&node.name).is_some() {
            return Err(Error::invalid_node(format!(
                "Duplicate name in tree: {}",
                node.name
            )));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Node with the given name.
    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Mutable node with the given name.
    pub fn find_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    /// Number of direct entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Encode to the stable storage format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the storage format.
    ///
    /// Stored names are checked like freshly built ones: each must be a
    /// single path component and unique within the tree.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let tree: Tree = serde_json::from_slice(data)?;
        for node in &tree.nodes {
            validate_name(&node.name)?;
        }
        Tree::from_nodes(tree.nodes)
    }

    /// Persist this tree (not its children) and return its id.
    ///
    /// Every dir node must already carry its subtree id.
    pub fn save<S: ContentStore + ?Sized>(&self, store: &S) -> Result<Id> {
        if let Some(node) = self.nodes.iter().find(|n| n.is_dir() && n.subtree.is_none()) {
            return Err(Error::structural(format!(
                "Dir {:?} has no subtree id",
                node.name
            )));
        }
        store.put(ObjectClass::Tree, &self.encode()?)
    }

    /// Load a single tree; dir nodes come back without `children`.
    pub fn load<S: ContentStore + ?Sized>(store: &S, id: &Id) -> Result<Self> {
        let data = store.get(ObjectClass::Tree, id)?;
        Self::decode(&data)
    }

    /// Load a tree and every subtree below it, filling in `children`.
    pub fn load_recursive<S: ContentStore + ?Sized>(store: &S, id: &Id) -> Result<Self> {
        struct Frame {
            pending: std::vec::IntoIter<Node>,
            done: Vec<Node>,
            dir: Option<Node>,
        }

        let root = Self::load(store, id)?;
        let mut current = Frame {
            pending: root.nodes.into_iter(),
            done: Vec::new(),
            dir: None,
        };
        let mut ancestors: Vec<Frame> = Vec::new();

        loop {
            match current.pending.next() {
                Some(node) if node.is_dir() => {
                    let subtree = node.subtree.ok_or_else(|| {
                        Error::structural(format!("Dir {:?} has no subtree id", node.name))
                    })?;
                    let child = Self::load(store, &subtree)?;
                    let parent = std::mem::replace(
                        &mut current,
                        Frame {
                            pending: child.nodes.into_iter(),
                            done: Vec::new(),
                            dir: Some(node),
                        },
                    );
                    ancestors.push(parent);
                }
                Some(node) => current.done.push(node),
                None => {
                    let tree = Tree {
                        nodes: current.done,
                    };
                    let (Some(mut parent), Some(mut dir)) = (ancestors.pop(), current.dir) else {
                        return Ok(tree);
                    };
                    dir.children = Some(tree);
                    parent.done.push(dir);
                    current = parent;
                }
            }
        }
    }

    /// Total content reachable through in-memory children.
    pub fn stat(&self) -> Stat {
        self.accumulate(|_| true)
    }

    /// Work the archiver still has to do: every dir and symlink, and every
    /// file whose content is not attached yet.
    pub fn stat_todo(&self) -> Stat {
        self.accumulate(|node| node.node_type != NodeType::File || node.content.is_none())
    }

    fn accumulate(&self, include: impl Fn(&Node) -> bool) -> Stat {
        let mut stat = Stat::default();
        let mut stack = vec![self];

        while let Some(tree) = stack.pop() {
            for node in &tree.nodes {
                if include(node) {
                    stat += Stat::of_node(node);
                }
                if let Some(children) = &node.children {
                    stack.push(children);
                }
            }
        }

        stat
    }
}

/// Cache of decoded subtrees, keyed by their id.
#[derive(Debug, Default)]
pub struct TreeMap {
    trees: HashMap<Id, Tree>,
}

impl TreeMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the tree stored under `id`.
    pub fn insert(&mut self, id: Id, tree: Tree) {
        self.trees.insert(id, tree);
    }

    /// The tree for `id`, or [`Error::TreeNotInMap`] if it was never inserted.
    pub fn find(&self, id: &Id) -> Result<&Tree> {
        self.trees
            .get(id)
            .ok_or_else(|| Error::tree_not_in_map(id.to_hex()))
    }

    /// Whether `id` was inserted.
    pub fn contains(&self, id: &Id) -> bool {
        self.trees.contains_key(id)
    }

    /// Number of trees held.
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    /// True if nothing was inserted.
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}
