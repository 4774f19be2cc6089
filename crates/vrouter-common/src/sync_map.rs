//! Keyed index that never creates entries behind the caller's back.
//!
//! Flow lookups must distinguish "no such classification" from "new
//! classification". `SyncMap` keeps every creating operation explicit:
//! - `get()` / `get_mut()` return `Option`
//! - `try_insert()` refuses to overwrite
//! - `insert()` is the one deliberate create-or-replace path

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Errors of the explicit `SyncMap` operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncMapError {
    #[error("Key already present")]
    KeyExists,
}

/// A map wrapper whose lookups never insert.
///
/// # Example
///
/// ```
/// use vrouter_common::SyncMap;
///
/// let mut map: SyncMap<String, i32> = SyncMap::new();
/// assert!(map.get("missing").is_none());
/// assert!(map.is_empty());
///
/// map.try_insert("key".to_string(), 42).unwrap();
/// assert!(map.try_insert("key".to_string(), 7).is_err());
/// assert_eq!(map.get("key"), Some(&42));
/// ```
#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.contains_key(key)
    }

    /// Looks up `key`. Never creates an entry.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.get(key)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.get_mut(key)
    }

    /// Inserts a new entry, failing if the key is already present.
    pub fn try_insert(&mut self, key: K, value: V) -> Result<&mut V, SyncMapError> {
        match self.inner.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => Err(SyncMapError::KeyExists),
            std::collections::hash_map::Entry::Vacant(slot) => Ok(slot.insert(value)),
        }
    }

    /// Inserts or replaces an entry, returning the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
