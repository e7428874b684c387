//! Adapters for built-in and external key-value backends.
//!
//! A key-value backend is what the proxy server and the direct storage/NoSQL adapters run on top
//! of. It stands in for the provider-side binding (an object bucket or a single-partition NoSQL
//! table) when benchmarks are exercised locally.
//!
//! ## Built-in Backends
//!
//! The usage of built-in backends can be found in the module-level documentations of
//! [`mod@hashmap`] and [`mod@btreemap`].
//!
//! ## Registering New Backends
//!
//! When users would like to dynamically register new backends from their own crate, they first
//! need to implement [`KVStore`]/[`KVStoreHandle`] for the store. Then, they need to create a
//! constructor function with a signature of `fn(&toml::Table) -> BenchKVStore`.
//!
//! The final step is to register the backend's constructor (along with its name) using
//! [`inventory`]. A minimal example would be: `inventory::submit! { Registry::new("name",
//! constructor_fn) };`.
//!
//! The source code of the built-in backends provides good examples of this process.

use crate::*;
use hashbrown::HashMap;
use log::debug;
use std::sync::Arc;
use toml::Table;

/// A created key-value backend that is ready to serve handles. Cloning is shallow; clones refer
/// to the same backend.
#[derive(Clone)]
pub struct BenchKVStore(Arc<Box<dyn KVStore>>);

impl BenchKVStore {
    pub fn from_store(store: impl KVStore) -> Self {
        Self(Arc::new(Box::new(store)))
    }

    /// Create a per-thread handle to the backend.
    pub fn handle(&self) -> Box<dyn KVStoreHandle> {
        self.0.handle()
    }
}

/// The centralized registry that maps the name of a key-value backend to its constructor
/// function.
///
/// A user-defined backend can use the [`inventory::submit!`] macro to register its own
/// constructor to be used with the benchmark framework.
pub struct Registry<'a> {
    pub(crate) name: &'a str,
    constructor: fn(&Table) -> BenchKVStore,
}

impl<'a> Registry<'a> {
    pub const fn new(name: &'a str, constructor: fn(&Table) -> BenchKVStore) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(Registry<'static>);

/// An aggregated option that can be parsed from a TOML string. It contains all necessary
/// parameters for each type of backend to be created.
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct BenchKVStoreOpt {
    name: String,
    #[serde(flatten)]
    opt: Table,
}

impl BenchKVStore {
    pub(crate) fn new(opt: &BenchKVStoreOpt) -> BenchKVStore {
        // construct the lookup table.. this will be done every time
        let mut registered: HashMap<&'static str, fn(&Table) -> BenchKVStore> = HashMap::new();
        for r in inventory::iter::<Registry> {
            debug!("Adding supported backend: {}", r.name);
            assert!(registered.insert(r.name, r.constructor).is_none()); // no existing name
        }
        let f = registered.get(opt.name.as_str()).unwrap_or_else(|| {
            panic!("backend {} not found in registry", opt.name);
        });
        f(&opt.opt)
    }
}

pub mod btreemap;
pub mod hashmap;
