//! Content-addressed object storage.
//!
//! The engine only ever talks to a store through [`ContentStore`]. Two
//! implementations ship with the crate: [`LocalStore`], a sharded directory
//! on disk, and [`MemoryStore`], an in-process map.

mod local;
mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

use crate::error::{Error, Result};
use crate::id::{ID_SIZE, Id};
use crate::object::ObjectClass;

/// A deduplicating store keyed by the id of each object's content.
///
/// Putting content that is already present is a no-op that returns the same id.
pub trait ContentStore {
    /// Store `data` under `class` and return its id.
    fn put(&self, class: ObjectClass, data: &[u8]) -> Result<Id>;

    /// Fetch the object `id` of `class`, verifying its content against the id.
    fn get(&self, class: ObjectClass, id: &Id) -> Result<Vec<u8>>;

    /// Whether the object `id` of `class` exists.
    fn has(&self, class: ObjectClass, id: &Id) -> Result<bool>;

    /// All ids stored under `class`, sorted.
    fn list(&self, class: ObjectClass) -> Result<Vec<Id>>;

    /// Resolve an unambiguous hex prefix to a full id within `class`.
    fn resolve_prefix(&self, class: ObjectClass, prefix: &str) -> Result<Id> {
        resolve_prefix_in(class, prefix, self.list(class)?)
    }
}

impl<S: ContentStore + ?Sized> ContentStore for &S {
    fn put(&self, class: ObjectClass, data: &[u8]) -> Result<Id> {
        (**self).put(class, data)
    }

    fn get(&self, class: ObjectClass, id: &Id) -> Result<Vec<u8>> {
        (**self).get(class, id)
    }

    fn has(&self, class: ObjectClass, id: &Id) -> Result<bool> {
        (**self).has(class, id)
    }

    fn list(&self, class: ObjectClass) -> Result<Vec<Id>> {
        (**self).list(class)
    }

    fn resolve_prefix(&self, class: ObjectClass, prefix: &str) -> Result<Id> {
        (**self).resolve_prefix(class, prefix)
    }
}

/// Pick the single id among `ids` whose hex form starts with `prefix`.
pub fn resolve_prefix_in<I>(class: ObjectClass, prefix: &str, ids: I) -> Result<Id>
where
    I: IntoIterator<Item = Id>,
{
    let prefix = prefix.trim().to_ascii_lowercase();

    if prefix.is_empty() {
        return Err(Error::invalid_id("Id prefix cannot be empty"));
    }
    if prefix.len() > ID_SIZE * 2 {
        return Err(Error::invalid_id(format!(
            "Id prefix too long: {} characters (max {})",
            prefix.len(),
            ID_SIZE * 2
        )));
    }
    if !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::invalid_id(format!(
            "Id prefix is not hex: {}",
            prefix
        )));
    }

    let mut found: Option<Id> = None;
    for id in ids {
        if !id.to_hex().starts_with(&prefix) {
            continue;
        }
        match found {
            Some(existing) if existing != id => return Err(Error::ambiguous_id(class, prefix)),
            _ => found = Some(id),
        }
    }

    found.ok_or_else(|| Error::object_not_found(class, prefix))
}

/// Shortest hex prefix length that keeps every id in `ids` distinct.
///
/// Never shorter than 4 characters; an empty or single-element set yields 4.
pub fn min_prefix_len(ids: &[Id]) -> usize {
    const MIN_LEN: usize = 4;

    let mut hexes: Vec<String> = ids.iter().map(Id::to_hex).collect();
    hexes.sort();
    hexes.dedup();

    let shared = hexes
        .windows(2)
        .map(|pair| {
            pair[0]
                .bytes()
                .zip(pair[1].bytes())
                .take_while(|(a, b)| a == b)
                .count()
        })
        .max()
        .unwrap_or(0);

    (shared + 1).clamp(MIN_LEN, ID_SIZE * 2)
}
