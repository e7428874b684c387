//! A blob storage client for benchmark code, with collision-avoiding upload keys.
//!
//! Objects are byte blobs addressed by a `(bucket, key)` pair. Upload keys are made unique at
//! upload time by inserting a random token before the file extension, so two concurrent uploads
//! of the same logical name never collide; the final key actually used is returned to the caller
//! and must be used for subsequent lookups.
//!
//! Like the NoSQL client, the storage client comes in two flavors behind the [`BlobStorage`]
//! trait, chosen once at construction:
//!
//! - [`DirectStorage`] operates on a local [`KVStoreHandle`] binding.
//! - [`ProxyStorage`] forwards every operation as an HTTP request (`/r2/upload`, `/r2/download`,
//!   `/r2/list`) to a worker URL that holds the real binding.
//!
//! The two flavors intentionally differ on one read path: a direct download of an absent key
//! yields an empty byte vector so callers can treat "missing" as "empty", while the proxy maps
//! the server's 404 to [`Error::NotFound`]. Both behaviors are deliberate.

use crate::*;
use log::debug;
use std::fs;
use std::path::Path;

/// Stable agent string sent on every proxy-mode request; some origin servers reject anonymous
/// agents.
pub const USER_AGENT: &str =
    "faasbench/0.1 (https://github.com/faasbench/faasbench) FaaS Benchmark Suite";

/// Insert a short random token between the stem and the extension of `name`.
///
/// `report.csv` becomes `report.1a2b3c4d.csv`; a name without an extension gets the token
/// appended after a dot.
pub fn unique_name(name: &str) -> String {
    let base_start = name.rfind('/').map_or(0, |s| s + 1);
    let (stem, extension) = match name.rfind('.') {
        Some(idx) if idx > base_start => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("{}.{}{}", stem, &token[..8], extension)
}

/// The blob storage interface.
///
/// `data` arguments are raw bytes; string content goes through as UTF-8 bytes.
pub trait BlobStorage {
    /// Store `data` under a uniquified version of `key` and return the final key used.
    fn upload_stream(&mut self, bucket: &str, key: &str, data: &[u8]) -> Result<String>;

    /// Fetch the raw bytes at `key`. See the module docs for the absent-key behavior of each
    /// implementation.
    fn download_stream(&mut self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Enumerate keys under `prefix`. A single listing call: if the backing store paginates
    /// beyond its first page (e.g., 1000 entries), later pages are not covered.
    fn list(&mut self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Upload a local file; returns the final (uniquified) key so callers can record it.
    fn upload(&mut self, bucket: &str, key: &str, path: &Path) -> Result<String> {
        let data = fs::read(path).map_err(|e| Error::transport("storage upload", e))?;
        self.upload_stream(bucket, key, &data)
    }

    /// Download an object to a local file, creating parent directories as needed.
    fn download(&mut self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let data = self.download_stream(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::transport("storage download", e))?;
        }
        fs::write(path, data).map_err(|e| Error::transport("storage download", e))
    }

    /// Download every object under `prefix` into `local_dir`, recreating the key structure
    /// below the prefix as a directory tree.
    fn download_directory(&mut self, bucket: &str, prefix: &str, local_dir: &Path) -> Result<()> {
        fs::create_dir_all(local_dir).map_err(|e| Error::transport("storage list", e))?;
        let keys = self.list(bucket, prefix)?;
        debug!("found {} objects with prefix {}", keys.len(), prefix);
        for key in keys.iter() {
            let relative = if !prefix.is_empty() && key.starts_with(prefix) {
                key[prefix.len()..].trim_start_matches('/')
            } else {
                key.as_str()
            };
            self.download(bucket, key, &local_dir.join(relative))?;
        }
        Ok(())
    }
}

fn bucket_key(bucket: &str, key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(bucket.len() + 1 + key.len());
    k.extend_from_slice(bucket.as_bytes());
    k.push(b'/');
    k.extend_from_slice(key.as_bytes());
    k
}

// {{{ direct

/// [`BlobStorage`] over a local key-value binding.
pub struct DirectStorage {
    handle: Box<dyn KVStoreHandle>,
}

impl DirectStorage {
    pub fn new(handle: Box<dyn KVStoreHandle>) -> Self {
        Self { handle }
    }

    /// Store with the exact key, bypassing uniquification. The serving side of the proxy
    /// protocol uses this, since the proxy client already uniquified the key.
    pub(crate) fn put_exact(&mut self, bucket: &str, key: &str, data: &[u8]) {
        self.handle.put(&bucket_key(bucket, key), data);
    }

    /// Fetch distinguishing absence, for callers that must map missing to an HTTP 404.
    pub(crate) fn get_exact(&mut self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.handle.get(&bucket_key(bucket, key)).map(|b| b.into())
    }
}

impl BlobStorage for DirectStorage {
    fn upload_stream(&mut self, bucket: &str, key: &str, data: &[u8]) -> Result<String> {
        let unique_key = unique_name(key);
        self.put_exact(bucket, &unique_key, data);
        Ok(unique_key)
    }

    fn download_stream(&mut self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        // missing reads as empty, so callers need no absent-key special case
        Ok(self.get_exact(bucket, key).unwrap_or_default())
    }

    fn list(&mut self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let scoped = bucket_key(bucket, prefix);
        let mut keys = Vec::new();
        for k in self.handle.list(&scoped) {
            let key = std::str::from_utf8(&k[bucket.len() + 1..])
                .map_err(|e| Error::transport("storage list", e))?;
            keys.push(key.to_string());
        }
        Ok(keys)
    }
}

// }}} direct

// {{{ proxy

/// [`BlobStorage`] that forwards every operation to the worker holding the real binding.
pub struct ProxyStorage {
    base: String,
    client: reqwest::blocking::Client,
}

impl ProxyStorage {
    /// Create a proxy client against a worker base URL, typically taken from the request header
    /// the orchestrating worker injects. A missing URL fails fast before any network call.
    pub fn new(worker_url: Option<&str>) -> Result<Self> {
        let base = worker_url
            .ok_or_else(|| Error::Config("worker URL not set - cannot access storage".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::transport("storage client init", e))?;
        Ok(Self { base, client })
    }

    fn fail(op: &'static str, resp: reqwest::blocking::Response) -> Error {
        let status = resp.status();
        let reason = match resp.json::<ErrorBody>() {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Error::transport_msg(op, reason)
    }
}

impl BlobStorage for ProxyStorage {
    fn upload_stream(&mut self, bucket: &str, key: &str, data: &[u8]) -> Result<String> {
        let unique_key = unique_name(key);
        let url = format!("{}/r2/upload", self.base);
        let resp = self
            .client
            .post(&url)
            .query(&[("bucket", bucket), ("key", &unique_key)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .map_err(|e| Error::transport("storage upload", e))?;
        if !resp.status().is_success() {
            return Err(Self::fail("storage upload", resp));
        }
        let parsed: UploadResponse = resp
            .json()
            .map_err(|e| Error::transport("storage upload", e))?;
        Ok(parsed.key)
    }

    fn download_stream(&mut self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = format!("{}/r2/download", self.base);
        let resp = self
            .client
            .get(&url)
            .query(&[("bucket", bucket), ("key", key)])
            .send()
            .map_err(|e| Error::transport("storage download", e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Self::fail("storage download", resp));
        }
        let bytes = resp
            .bytes()
            .map_err(|e| Error::transport("storage download", e))?;
        Ok(bytes.to_vec())
    }

    fn list(&mut self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/r2/list", self.base);
        let resp = self
            .client
            .get(&url)
            .query(&[("bucket", bucket), ("prefix", prefix)])
            .send()
            .map_err(|e| Error::transport("storage list", e))?;
        if !resp.status().is_success() {
            return Err(Self::fail("storage list", resp));
        }
        let parsed: ListResponse = resp.json().map_err(|e| Error::transport("storage list", e))?;
        Ok(parsed.objects.into_iter().map(|o| o.key).collect())
    }
}

// }}} proxy

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::btreemap::MutexBTreeMap;
    use crate::KVStore;
    use std::io::Write;

    #[test]
    fn unique_name_keeps_stem_and_extension() {
        let name = unique_name("report.csv");
        assert!(name.starts_with("report."));
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "report.".len() + 8 + ".csv".len());
    }

    #[test]
    fn unique_name_without_extension() {
        let name = unique_name("archive");
        assert!(name.starts_with("archive."));
        assert_eq!(name.len(), "archive.".len() + 8);
    }

    #[test]
    fn unique_name_only_touches_basename() {
        let name = unique_name("dir.v2/report.csv");
        assert!(name.starts_with("dir.v2/report."));
        assert!(name.ends_with(".csv"));
    }

    #[test]
    fn unique_uploads_do_not_collide() {
        let store = MutexBTreeMap::new();
        let mut ds = DirectStorage::new(store.handle());
        let k1 = ds.upload_stream("bkt", "report.csv", b"first").unwrap();
        let k2 = ds.upload_stream("bkt", "report.csv", b"second").unwrap();
        assert_ne!(k1, k2);
        assert_eq!(ds.download_stream("bkt", &k1).unwrap(), b"first");
        assert_eq!(ds.download_stream("bkt", &k2).unwrap(), b"second");
    }

    #[test]
    fn direct_missing_download_is_empty() {
        let store = MutexBTreeMap::new();
        let mut ds = DirectStorage::new(store.handle());
        assert_eq!(ds.download_stream("bkt", "nonexistent-key").unwrap(), b"");
    }

    #[test]
    fn file_round_trip() {
        let store = MutexBTreeMap::new();
        let mut ds = DirectStorage::new(store.handle());
        let dir = tempfile::tempdir().unwrap();

        let src = dir.path().join("input.bin");
        let mut f = std::fs::File::create(&src).unwrap();
        f.write_all(b"payload bytes").unwrap();
        drop(f);

        let key = ds.upload("bkt", "input.bin", &src).unwrap();
        let dst = dir.path().join("out/copy.bin");
        ds.download("bkt", &key, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload bytes");
    }

    #[test]
    fn download_directory_recreates_tree() {
        let store = MutexBTreeMap::new();
        let mut seeder = DirectStorage::new(store.handle());
        seeder.put_exact("bkt", "data/a.txt", b"aaa");
        seeder.put_exact("bkt", "data/sub/b.txt", b"bbb");
        seeder.put_exact("bkt", "other/c.txt", b"ccc");

        let mut ds = DirectStorage::new(store.handle());
        let dir = tempfile::tempdir().unwrap();
        ds.download_directory("bkt", "data", dir.path()).unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(dir.path().join("sub/b.txt")).unwrap(), b"bbb");
        assert!(!dir.path().join("c.txt").exists());
    }

    #[test]
    fn proxy_requires_worker_url() {
        assert!(matches!(ProxyStorage::new(None), Err(Error::Config(_))));
    }
}
