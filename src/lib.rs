#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A benchmark harness for serverless functions, with proxied storage and NoSQL access for the
//! benchmark code under test.
//!
//! `faasbench` drives a deployed function over HTTP, normalizes each response into a per-invocation
//! measurement record, and aggregates a batch of records into summary statistics including derived
//! billing quantities. The details of a benchmark are defined in the TOML format, such as the
//! number of worker threads, the number of invocations, and the payload sent on each request.
//!
//! Alongside the invocation driver, the crate implements the data-plane clients a benchmark
//! function uses while it executes: a blob storage client and a composite-key NoSQL client. Both
//! come in two flavors behind one interface: a *direct* adapter that talks to a local key-value
//! backend, and a *proxy* adapter that forwards every call as an HTTP request to the worker that
//! holds the real bindings. The serving side of that proxy protocol is also included, so a full
//! round trip can be run on a single machine.
//!
//! Key-value backends are black boxes created dynamically from a TOML table and dispatched through
//! a registry; new backends can be registered from other crates by implementing [`KVStore`] and
//! submitting a constructor with [`inventory`]. See the module-level rustdocs:
//!
//! - [`mod@bench`] for the config format of an invocation benchmark.
//! - [`mod@stores`] for the config format of a built-in key-value backend.
//! - [`cmdline()`] for the usage of the default command line interface.

use serde::{Deserialize, Serialize};

/// A synchronous, thread-safe key-value backend.
///
/// This trait is used for owned backends, with which a per-thread handle can be created. A backend
/// stores a single type of key/value pair: variable-sized byte arrays on the heap.
pub trait KVStore: Send + Sync + 'static {
    /// Create a handle that can be referenced by different threads in the system.
    /// For most backends, this can just be done using an Arc.
    fn handle(&self) -> Box<dyn KVStoreHandle>;
}

/// A per-thread handle that references a [`KVStore`].
///
/// The handle is the real object that exposes the key-value interface.
pub trait KVStoreHandle {
    /// Adding a new key-value pair or blindly overwriting an existing key's value.
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Retrieving the value of a key if it exists.
    fn get(&mut self, key: &[u8]) -> Option<Box<[u8]>>;

    /// Removing a key. Removing an absent key is a no-op.
    fn delete(&mut self, key: &[u8]);

    /// Enumerating all keys that start with the given prefix.
    ///
    /// Ordered backends return keys in lexicographic order; unordered backends make no ordering
    /// guarantee.
    fn list(&mut self, prefix: &[u8]) -> Vec<Box<[u8]>>;
}

/// The error type for storage, NoSQL, and invocation operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A client was used before its endpoint/binding was configured. Fatal, no retry.
    #[error("storage not initialized: {0}")]
    Config(String),

    /// An object was absent on a read path that distinguishes missing from failed (e.g., a proxy
    /// download that returned 404). Plain key-value reads signal absence with `None` instead.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A network failure or a non-2xx response from a proxy or provider call.
    #[error("{op} failed: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A prefix query returned more secondary keys than the configured cap. This signals a
    /// violated modeling assumption (a partition scan), not a recoverable condition.
    #[error("query returned {returned} keys under one primary key, cap is {cap}")]
    QueryBound { returned: usize, cap: usize },
}

impl Error {
    pub(crate) fn transport(
        op: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Transport {
            op,
            source: Box::new(source),
        }
    }

    pub(crate) fn transport_msg(op: &'static str, msg: impl Into<String>) -> Self {
        Error::Transport {
            op,
            source: msg.into().into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The body of a `POST /nosql/{op}` proxy request.
///
/// All operations share one shape; fields that an operation does not use are omitted from the
/// serialized body. Keys are `[field_name, value]` pairs.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NosqlRequest {
    pub table_name: String,

    pub primary_key: (String, String),

    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_key: Option<(String, String)>,

    /// Only for `query`: the field name of the secondary key to enumerate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_key_name: Option<String>,

    /// Only for `insert`/`update`. A stored value may itself be JSON `null`, so an absent field
    /// and a present-but-null field must stay distinguishable on the wire.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub data: Option<serde_json::Value>,
}

/// Deserialize a present field into `Some`, keeping `null` as `Some(Value::Null)`. With
/// `#[serde(default)]`, only an absent field maps to `None`.
fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Response body of `POST /nosql/get`: `data` is `null` when the key is absent. A stored JSON
/// `null` therefore reads back as absent over the proxy; only `query` (and the direct adapter)
/// can observe a stored `null` as such.
#[derive(Serialize, Deserialize, Debug)]
pub struct NosqlGetResponse {
    pub data: Option<serde_json::Value>,
}

/// Response body of `POST /nosql/query`.
#[derive(Serialize, Deserialize, Debug)]
pub struct NosqlQueryResponse {
    pub items: Vec<serde_json::Value>,
}

/// Response body of `POST /r2/upload`: the final key actually used for the object, which carries
/// a uniquifying suffix and may differ from the requested key.
#[derive(Serialize, Deserialize, Debug)]
pub struct UploadResponse {
    pub key: String,
}

/// One entry in a `GET /r2/list` response.
#[derive(Serialize, Deserialize, Debug)]
pub struct ListedObject {
    pub key: String,
}

/// Response body of `GET /r2/list`.
#[derive(Serialize, Deserialize, Debug)]
pub struct ListResponse {
    pub objects: Vec<ListedObject>,
}

/// Error body returned by the proxy server on a failed request.
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorBody {
    pub error: String,
}

/// Pin the current thread to a core. The index wraps around the available cores, so worker
/// counts larger than the machine are still valid.
pub(crate) fn pin_core(index: usize) {
    if let Some(cores) = core_affinity::get_core_ids() {
        let core = cores[index % cores.len()];
        if !core_affinity::set_for_current(core) {
            log::warn!("failed to pin thread to core {:?}", core);
        }
    }
}

pub mod bench;
mod cmdline;
pub mod metrics;
pub mod nosql;
pub mod server;
pub mod storage;
pub mod stores;
pub mod trigger;

pub use cmdline::cmdline;

pub extern crate inventory;
pub extern crate toml;
