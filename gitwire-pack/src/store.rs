//! The pluggable object-store boundary the parser writes through.

use crate::ObjectKind;
use gitwire_hash::{hash_object, ObjectId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The error type store implementations report.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Access to the destination object database.
///
/// The parser treats the store as append-only: it inserts and reads, never
/// deletes. Implementations must make `insert` safe to call concurrently
/// with reads and other inserts; the parser does not re-implement that
/// guarantee.
pub trait ObjectStore {
    /// `true` if an object with this id exists.
    fn has(&self, id: &ObjectId) -> Result<bool, StoreError>;

    /// Load an object's kind and bytes, or `None` if absent.
    fn open(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>, StoreError>;

    /// Insert an object, returning its id.
    ///
    /// Inserting bytes that already exist under the same id is a no-op.
    fn insert(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId, StoreError>;
}

/// A validation hook applied to every decoded object before insertion.
pub trait ObjectChecker {
    /// Reject the object by returning an error message.
    fn check(&self, kind: ObjectKind, data: &[u8]) -> Result<(), String>;
}

/// A checker that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ObjectChecker for AcceptAll {
    fn check(&self, _kind: ObjectKind, _data: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

/// An in-memory object store.
///
/// Primarily a test backend, but also the natural staging area for callers
/// that quarantine incoming objects before promoting them.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    objects: Arc<Mutex<HashMap<ObjectId, (ObjectKind, Vec<u8>)>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of objects currently held.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("poisoned").len()
    }

    /// `true` if the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All ids currently held, in unspecified order.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.lock().expect("poisoned").keys().copied().collect()
    }
}

impl ObjectStore for MemoryStore {
    fn has(&self, id: &ObjectId) -> Result<bool, StoreError> {
        Ok(self.objects.lock().expect("poisoned").contains_key(id))
    }

    fn open(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>, StoreError> {
        Ok(self.objects.lock().expect("poisoned").get(id).cloned())
    }

    fn insert(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId, StoreError> {
        let id = hash_object(kind.as_str(), data);
        self.objects
            .lock()
            .expect("poisoned")
            .entry(id)
            .or_insert_with(|| (kind, data.to_vec()));
        Ok(id)
    }
}
