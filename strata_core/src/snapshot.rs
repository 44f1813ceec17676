//! Snapshot records.

use crate::error::Result;
use crate::id::Id;
use crate::object::ObjectClass;
use crate::store::ContentStore;
use crate::tree::Stat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One archived state of a directory. Never changed once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Root tree id.
    pub tree: Id,
    /// Absolute path that was archived.
    pub dir: PathBuf,
    /// Creation time.
    pub time: DateTime<Utc>,
    /// Snapshot this one was diffed against, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    /// Totals of the archived tree.
    pub stat: Stat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Snapshot {
    /// New snapshot of `dir` taken now. The host name comes from the system,
    /// the user name from the environment, each when available.
    pub fn new(tree: Id, dir: impl Into<PathBuf>, stat: Stat) -> Self {
        Self {
            tree,
            dir: dir.into(),
            time: Utc::now(),
            parent: None,
            stat,
            hostname: host_name(),
            username: env_value(&["USER", "USERNAME", "LOGNAME"]),
        }
    }

    /// Store the snapshot and return its id.
    pub fn save<S: ContentStore + ?Sized>(&self, store: &S) -> Result<Id> {
        let data = serde_json::to_vec(self)?;
        store.put(ObjectClass::Snapshot, &data)
    }

    /// Load the snapshot `id`.
    pub fn load<S: ContentStore + ?Sized>(store: &S, id: &Id) -> Result<Self> {
        let data = store.get(ObjectClass::Snapshot, id)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

fn host_name() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .and_then(non_empty)
}

fn env_value(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find_map(non_empty)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Resolve a snapshot id from an unambiguous hex prefix.
pub fn find_snapshot<S: ContentStore + ?Sized>(store: &S, prefix: &str) -> Result<Id> {
    store.resolve_prefix(ObjectClass::Snapshot, prefix)
}

/// Every stored snapshot with its id, oldest first.
pub fn list_snapshots<S: ContentStore + ?Sized>(store: &S) -> Result<Vec<(Id, Snapshot)>> {
    let mut snapshots = store
        .list(ObjectClass::Snapshot)?
        .into_iter()
        .map(|id| Snapshot::load(store, &id).map(|sn| (id, sn)))
        .collect::<Result<Vec<_>>>()?;

    snapshots.sort_by(|(a_id, a), (b_id, b)| a.time.cmp(&b.time).then(a_id.cmp(b_id)));
    Ok(snapshots)
}

/// The most recent snapshot of `dir`, for use as a parent.
pub fn latest_snapshot_of<S: ContentStore + ?Sized>(
    store: &S,
    dir: &std::path::Path,
) -> Result<Option<Id>> {
    Ok(list_snapshots(store)?
        .into_iter()
        .rev()
        .find(|(_, sn)| sn.dir == dir)
        .map(|(id, _)| id))
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}",
            self.time.format("%Y-%m-%d %H:%M:%S"),
            self.dir.display()
        )
    }
}
