//! In-memory content store.

use super::ContentStore;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::object::ObjectClass;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A content store that keeps every object in process memory.
///
/// Besides embedding, it is what the test suites run the engine against: it
/// also counts how many objects were actually written.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<(ObjectClass, Id), Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects stored under `class`.
    pub fn len(&self, class: ObjectClass) -> usize {
        self.objects
            .read()
            .keys()
            .filter(|(c, _)| *c == class)
            .count()
    }

    /// True if no object of any class is stored.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Number of puts that actually wrote a new object.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Overwrite an object's bytes without re-keying it. Test hook for
    /// simulating storage corruption.
    pub fn corrupt(&self, class: ObjectClass, id: &Id, data: Vec<u8>) {
        self.objects.write().insert((class, *id), data);
    }
}

impl ContentStore for MemoryStore {
    fn put(&self, class: ObjectClass, data: &[u8]) -> Result<Id> {
        let id = Id::hash_bytes(data);

        let mut objects = self.objects.write();
        if !objects.contains_key(&(class, id)) {
            objects.insert((class, id), data.to_vec());
            self.writes.fetch_add(1, Ordering::Relaxed);
        }

        Ok(id)
    }

    fn get(&self, class: ObjectClass, id: &Id) -> Result<Vec<u8>> {
        let objects = self.objects.read();
        let data = objects
            .get(&(class, *id))
            .ok_or_else(|| Error::object_not_found(class, id.to_hex()))?;

        let computed = Id::hash_bytes(data);
        if computed != *id {
            return Err(Error::corrupted_object(
                format!("memory:{}/{}", class, id),
                format!("Id mismatch: expected {}, got {}", id, computed),
            ));
        }

        Ok(data.clone())
    }

    fn has(&self, class: ObjectClass, id: &Id) -> Result<bool> {
        Ok(self.objects.read().contains_key(&(class, *id)))
    }

    fn list(&self, class: ObjectClass) -> Result<Vec<Id>> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|(c, _)| *c == class)
            .map(|(_, id)| *id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_single_copy() {
        let store = MemoryStore::new();

        let id1 = store.put(ObjectClass::Blob, b"same bytes").unwrap();
        let id2 = store.put(ObjectClass::Blob, b"same bytes").unwrap();

        assert_eq!(id1, id2);
        assert_eq!(store.len(ObjectClass::Blob), 1);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_get_missing_and_corrupt() {
        let store = MemoryStore::new();
        let id = Id::hash_bytes(b"nothing here");

        assert!(matches!(
            store.get(ObjectClass::Blob, &id).unwrap_err(),
            Error::ObjectNotFound { .. }
        ));

        let id = store.put(ObjectClass::Blob, b"original").unwrap();
        store.corrupt(ObjectClass::Blob, &id, b"tampered".to_vec());
        assert!(matches!(
            store.get(ObjectClass::Blob, &id).unwrap_err(),
            Error::CorruptedObject { .. }
        ));
    }

    #[test]
    fn test_list_is_per_class() {
        let store = MemoryStore::new();
        let blob = store.put(ObjectClass::Blob, b"a").unwrap();
        let tree = store.put(ObjectClass::Tree, b"b").unwrap();

        assert_eq!(store.list(ObjectClass::Blob).unwrap(), vec![blob]);
        assert_eq!(store.list(ObjectClass::Tree).unwrap(), vec![tree]);
        assert!(store.list(ObjectClass::Snapshot).unwrap().is_empty());
        assert!(!store.is_empty());
    }
}
