//! Adapter implementation of [`std::collections::BTreeMap`].
//!
//! Keys are ordered, so prefix listing is a range scan and the returned keys are in
//! lexicographic order. This is the backend of choice for the proxy server.
//!
//! ## Configuration Format
//!
//! ### [`Mutex`]-based:
//!
//! ``` toml
//! [store]
//! name = "mutex_btreemap"
//! ```
//!
//! ### [`RwLock`]-based:
//! ``` toml
//! [store]
//! name = "rwlock_btreemap"
//! ```

use crate::stores::*;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

type BaseBTreeMap = BTreeMap<Box<[u8]>, Box<[u8]>>;

fn list_prefix(map: &BaseBTreeMap, prefix: &[u8]) -> Vec<Box<[u8]>> {
    map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect()
}

#[derive(Clone)]
pub struct MutexBTreeMap(Arc<Mutex<BaseBTreeMap>>);

impl MutexBTreeMap {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(BaseBTreeMap::new())))
    }

    pub fn new_benchkvstore(_opt: &toml::Table) -> BenchKVStore {
        BenchKVStore::from_store(Self::new())
    }
}

impl Default for MutexBTreeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl KVStore for MutexBTreeMap {
    fn handle(&self) -> Box<dyn KVStoreHandle> {
        Box::new(self.clone())
    }
}

impl KVStoreHandle for MutexBTreeMap {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.0.lock().insert(key.into(), value.into());
    }

    fn get(&mut self, key: &[u8]) -> Option<Box<[u8]>> {
        self.0.lock().get(key).cloned()
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.lock().remove(key);
    }

    fn list(&mut self, prefix: &[u8]) -> Vec<Box<[u8]>> {
        list_prefix(&self.0.lock(), prefix)
    }
}

inventory::submit! {
    Registry::new("mutex_btreemap", MutexBTreeMap::new_benchkvstore)
}

#[derive(Clone)]
pub struct RwLockBTreeMap(Arc<RwLock<BaseBTreeMap>>);

impl RwLockBTreeMap {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(BaseBTreeMap::new())))
    }

    pub fn new_benchkvstore(_opt: &toml::Table) -> BenchKVStore {
        BenchKVStore::from_store(Self::new())
    }
}

impl Default for RwLockBTreeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl KVStore for RwLockBTreeMap {
    fn handle(&self) -> Box<dyn KVStoreHandle> {
        Box::new(self.clone())
    }
}

impl KVStoreHandle for RwLockBTreeMap {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.0.write().insert(key.into(), value.into());
    }

    fn get(&mut self, key: &[u8]) -> Option<Box<[u8]>> {
        self.0.read().get(key).cloned()
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.write().remove(key);
    }

    fn list(&mut self, prefix: &[u8]) -> Vec<Box<[u8]>> {
        list_prefix(&self.0.read(), prefix)
    }
}

inventory::submit! {
    Registry::new("rwlock_btreemap", RwLockBTreeMap::new_benchkvstore)
}
