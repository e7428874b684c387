//! Adapter implementation of [`hashbrown::HashMap`]. Internally sharded.
//!
//! Prefix listing scans every shard, so it is linear in the total number of keys. This is fine
//! for the partition sizes the NoSQL adapter allows but makes these backends a poor fit for
//! large object listings.
//!
//! ## Configuration Format
//!
//! ### [`Mutex`]-based:
//!
//! ``` toml
//! [store]
//! name = "mutex_hashmap"
//! shards = ... # number of shards
//! ```
//!
//! ### [`RwLock`]-based:
//! ``` toml
//! [store]
//! name = "rwlock_hashmap"
//! shards = ... # number of shards
//! ```

use crate::stores::{BenchKVStore, Registry};
use crate::*;
use ::hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHasher;
use serde::Deserialize;
use std::hash::Hasher;
use std::sync::Arc;

/// Calculate the [`u64`] hash value of a given key using [`FxHasher`].
pub fn hash(key: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    hasher.finish()
}

pub fn shard(key: &[u8], nr_shards: usize) -> usize {
    let hash = hash(key);
    usize::try_from(hash % nr_shards as u64).unwrap()
}

/// A wrapper around raw [`HashMap`] with variable-sized keys and values.
///
/// It is used as the building block of the sharded backends. Note that this is not [`KVStore`].
pub type BaseHashMap = HashMap<Box<[u8]>, Box<[u8]>>;

// {{{ mutex_hashmap

#[derive(Clone)]
pub struct MutexHashMap {
    nr_shards: usize,
    shards: Arc<Vec<Mutex<BaseHashMap>>>,
}

#[derive(Deserialize)]
pub struct MutexHashMapOpt {
    pub shards: usize,
}

impl MutexHashMap {
    pub fn new(opt: &MutexHashMapOpt) -> Self {
        let nr_shards = opt.shards;
        let mut shards = Vec::<Mutex<BaseHashMap>>::with_capacity(nr_shards);
        for _ in 0..nr_shards {
            shards.push(Mutex::new(BaseHashMap::new()));
        }
        let shards = Arc::new(shards);
        Self { nr_shards, shards }
    }

    pub fn new_benchkvstore(opt: &toml::Table) -> BenchKVStore {
        let opt: MutexHashMapOpt = opt.clone().try_into().unwrap();
        BenchKVStore::from_store(Self::new(&opt))
    }
}

impl KVStore for MutexHashMap {
    fn handle(&self) -> Box<dyn KVStoreHandle> {
        Box::new(self.clone())
    }
}

impl KVStoreHandle for MutexHashMap {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        let sid = shard(key, self.nr_shards);
        self.shards[sid].lock().insert(key.into(), value.into());
    }

    fn get(&mut self, key: &[u8]) -> Option<Box<[u8]>> {
        let sid = shard(key, self.nr_shards);
        self.shards[sid].lock().get(key).cloned()
    }

    fn delete(&mut self, key: &[u8]) {
        let sid = shard(key, self.nr_shards);
        self.shards[sid].lock().remove(key);
    }

    fn list(&mut self, prefix: &[u8]) -> Vec<Box<[u8]>> {
        let mut keys = Vec::new();
        for s in self.shards.iter() {
            for k in s.lock().keys() {
                if k.starts_with(prefix) {
                    keys.push(k.clone());
                }
            }
        }
        keys
    }
}

inventory::submit! {
    Registry::new("mutex_hashmap", MutexHashMap::new_benchkvstore)
}

// }}} mutex_hashmap

// {{{ rwlock_hashmap

#[derive(Clone)]
pub struct RwLockHashMap {
    pub nr_shards: usize,
    shards: Arc<Vec<RwLock<BaseHashMap>>>,
}

#[derive(Deserialize)]
pub struct RwLockHashMapOpt {
    pub shards: usize,
}

impl RwLockHashMap {
    pub fn new(opt: &RwLockHashMapOpt) -> Self {
        let nr_shards = opt.shards;
        let mut shards = Vec::<RwLock<BaseHashMap>>::with_capacity(nr_shards);
        for _ in 0..nr_shards {
            shards.push(RwLock::new(BaseHashMap::new()));
        }
        let shards = Arc::new(shards);
        Self { nr_shards, shards }
    }

    pub fn new_benchkvstore(opt: &toml::Table) -> BenchKVStore {
        let opt: RwLockHashMapOpt = opt.clone().try_into().unwrap();
        BenchKVStore::from_store(Self::new(&opt))
    }
}

impl KVStore for RwLockHashMap {
    fn handle(&self) -> Box<dyn KVStoreHandle> {
        Box::new(self.clone())
    }
}

impl KVStoreHandle for RwLockHashMap {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        let sid = shard(key, self.nr_shards);
        self.shards[sid].write().insert(key.into(), value.into());
    }

    fn get(&mut self, key: &[u8]) -> Option<Box<[u8]>> {
        let sid = shard(key, self.nr_shards);
        self.shards[sid].read().get(key).cloned()
    }

    fn delete(&mut self, key: &[u8]) {
        let sid = shard(key, self.nr_shards);
        self.shards[sid].write().remove(key);
    }

    fn list(&mut self, prefix: &[u8]) -> Vec<Box<[u8]>> {
        let mut keys = Vec::new();
        for s in self.shards.iter() {
            for k in s.read().keys() {
                if k.starts_with(prefix) {
                    keys.push(k.clone());
                }
            }
        }
        keys
    }
}

inventory::submit! {
    Registry::new("rwlock_hashmap", RwLockHashMap::new_benchkvstore)
}

// }}} rwlock_hashmap
