//! A composite-key NoSQL client over a single-key binary key-value backend.
//!
//! A logical record is addressed by a `(table, primary_key, secondary_key)` triple where both
//! keys are `(field_name, value)` pairs. The triple is flattened into one string key, encoded so
//! that the primary-key portion is an unambiguous prefix of every full key sharing that primary
//! key. This supports the one non-point operation of the interface: enumerating all secondary
//! keys under a primary key.
//!
//! The client comes in two flavors behind the [`NoSql`] trait, chosen once at construction:
//!
//! - [`DirectNoSql`] operates on a local [`KVStoreHandle`] binding.
//! - [`ProxyNoSql`] forwards every operation as a `POST /nosql/{op}` request to a worker URL
//!   that holds the real binding (for benchmark code running in a decoupled container).
//!
//! Values are arbitrary JSON, serialized with [`serde_json`]; nested structures round-trip
//! exactly, including a stored top-level `null`. One wire limitation: the proxy get response
//! encodes absence as `null`, so a stored `null` reads back as absent through [`ProxyNoSql`]'s
//! `get` (a `query` still reports it). Inserts and updates have identical overwrite semantics;
//! there is no merge.

use crate::storage::USER_AGENT;
use crate::*;
use log::debug;

/// Default upper bound on the number of secondary keys one `query` may touch.
///
/// The bound exists to catch accidental full-partition scans, so exceeding it is a hard error
/// ([`Error::QueryBound`]) rather than a truncation.
pub const DEFAULT_QUERY_CAP: usize = 100;

/// Flatten a `(primary, secondary)` composite key into a single string key.
///
/// The encoding is `"(pf,pv)+(sf,sv)"`. A delimiter follows every component immediately, so a
/// partial key for primary value `"ab"` can never prefix-match a key with primary value `"abc"`.
/// Embedded `,`, `)` or `+` characters in field names or values are not escaped; such values can
/// alias and are outside the supported key space. This matches the on-wire format of existing
/// deployments and deliberately stays unescaped.
pub fn make_key(primary: (&str, &str), secondary: (&str, &str)) -> String {
    format!(
        "({},{})+({},{})",
        primary.0, primary.1, secondary.0, secondary.1
    )
}

/// The string prefix shared by all keys under one primary key, up to and including the opening
/// of the secondary tuple.
pub fn make_partial_key(primary: (&str, &str), secondary_name: &str) -> String {
    format!("({},{})+({},", primary.0, primary.1, secondary_name)
}

fn table_key(table: &str, key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(table.len() + 1 + key.len());
    k.extend_from_slice(table.as_bytes());
    k.push(b'/');
    k.extend_from_slice(key.as_bytes());
    k
}

/// The composite-key NoSQL interface.
///
/// Reads report a missing key as `None`/empty, never as an error. Writes are full overwrites.
pub trait NoSql {
    /// Store `data` under the composite key. Blindly overwrites an existing record.
    fn insert(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
        data: &serde_json::Value,
    ) -> Result<()>;

    /// Identical contract to [`NoSql::insert`]; kept as a separate operation for parity with the
    /// proxy protocol.
    fn update(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
        data: &serde_json::Value,
    ) -> Result<()>;

    /// Fetch the record at the composite key, or `None` when absent.
    fn get(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
    ) -> Result<Option<serde_json::Value>>;

    /// Enumerate all records under one primary key.
    ///
    /// This query must involve the primary key: it never scans across partitions, and it fails
    /// with [`Error::QueryBound`] when the partition holds more secondary keys than the cap.
    fn query(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary_name: &str,
    ) -> Result<Vec<serde_json::Value>>;

    /// Remove the record at the composite key. Removing an absent record succeeds silently.
    fn delete(&mut self, table: &str, primary: (&str, &str), secondary: (&str, &str))
        -> Result<()>;
}

// {{{ direct

/// [`NoSql`] over a local key-value binding.
pub struct DirectNoSql {
    handle: Box<dyn KVStoreHandle>,
    query_cap: usize,
}

impl DirectNoSql {
    pub fn new(handle: Box<dyn KVStoreHandle>) -> Self {
        Self::with_query_cap(handle, DEFAULT_QUERY_CAP)
    }

    pub fn with_query_cap(handle: Box<dyn KVStoreHandle>, query_cap: usize) -> Self {
        Self { handle, query_cap }
    }
}

impl NoSql for DirectNoSql {
    fn insert(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
        data: &serde_json::Value,
    ) -> Result<()> {
        let key = table_key(table, &make_key(primary, secondary));
        let value = serde_json::to_vec(data).map_err(|e| Error::transport("nosql insert", e))?;
        self.handle.put(&key, &value);
        Ok(())
    }

    fn update(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
        data: &serde_json::Value,
    ) -> Result<()> {
        self.insert(table, primary, secondary, data)
    }

    fn get(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
    ) -> Result<Option<serde_json::Value>> {
        let key = table_key(table, &make_key(primary, secondary));
        match self.handle.get(&key) {
            Some(bytes) => {
                let value =
                    serde_json::from_slice(&bytes).map_err(|e| Error::transport("nosql get", e))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn query(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary_name: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let prefix = table_key(table, &make_partial_key(primary, secondary_name));
        let keys = self.handle.list(&prefix);
        if keys.len() > self.query_cap {
            return Err(Error::QueryBound {
                returned: keys.len(),
                cap: self.query_cap,
            });
        }
        debug!(
            "nosql query on table {} matched {} secondary keys",
            table,
            keys.len()
        );
        let mut items = Vec::with_capacity(keys.len());
        for key in keys.iter() {
            // a key may vanish between list and get; absence is not an error
            if let Some(bytes) = self.handle.get(key) {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::transport("nosql query", e))?;
                items.push(value);
            }
        }
        Ok(items)
    }

    fn delete(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
    ) -> Result<()> {
        let key = table_key(table, &make_key(primary, secondary));
        self.handle.delete(&key);
        Ok(())
    }
}

// }}} direct

// {{{ proxy

/// [`NoSql`] that forwards every operation to the worker holding the real binding.
///
/// The query cap is enforced by the serving side; a violation surfaces here as a failed request.
pub struct ProxyNoSql {
    base: String,
    client: reqwest::blocking::Client,
}

impl ProxyNoSql {
    /// Create a proxy client against a worker base URL, typically taken from the request header
    /// the orchestrating worker injects. A missing URL fails fast before any network call.
    pub fn new(worker_url: Option<&str>) -> Result<Self> {
        let base = worker_url
            .ok_or_else(|| Error::Config("worker URL not set - cannot access NoSQL".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::transport("nosql client init", e))?;
        Ok(Self { base, client })
    }

    fn call(
        &self,
        endpoint: &'static str,
        op: &'static str,
        body: &NosqlRequest,
    ) -> Result<reqwest::blocking::Response> {
        let url = format!("{}/nosql/{}", self.base, endpoint);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| Error::transport(op, e))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let reason = match resp.json::<ErrorBody>() {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(Error::transport_msg(op, reason))
    }

    fn request(
        table: &str,
        primary: (&str, &str),
        secondary: Option<(&str, &str)>,
        secondary_name: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> NosqlRequest {
        NosqlRequest {
            table_name: table.to_string(),
            primary_key: (primary.0.to_string(), primary.1.to_string()),
            secondary_key: secondary.map(|(f, v)| (f.to_string(), v.to_string())),
            secondary_key_name: secondary_name.map(|n| n.to_string()),
            data: data.cloned(),
        }
    }
}

impl NoSql for ProxyNoSql {
    fn insert(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
        data: &serde_json::Value,
    ) -> Result<()> {
        let body = Self::request(table, primary, Some(secondary), None, Some(data));
        self.call("insert", "nosql insert", &body).map(|_| ())
    }

    fn update(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
        data: &serde_json::Value,
    ) -> Result<()> {
        let body = Self::request(table, primary, Some(secondary), None, Some(data));
        self.call("update", "nosql update", &body).map(|_| ())
    }

    fn get(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
    ) -> Result<Option<serde_json::Value>> {
        let body = Self::request(table, primary, Some(secondary), None, None);
        let resp = self.call("get", "nosql get", &body)?;
        let parsed: NosqlGetResponse = resp
            .json()
            .map_err(|e| Error::transport("nosql get", e))?;
        Ok(parsed.data)
    }

    fn query(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary_name: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let body = Self::request(table, primary, None, Some(secondary_name), None);
        let resp = self.call("query", "nosql query", &body)?;
        let parsed: NosqlQueryResponse = resp
            .json()
            .map_err(|e| Error::transport("nosql query", e))?;
        Ok(parsed.items)
    }

    fn delete(
        &mut self,
        table: &str,
        primary: (&str, &str),
        secondary: (&str, &str),
    ) -> Result<()> {
        let body = Self::request(table, primary, Some(secondary), None, None);
        self.call("delete", "nosql delete", &body).map(|_| ())
    }
}

// }}} proxy
