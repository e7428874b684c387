//! The edge-worker stand-in: an HTTP proxy server over a key-value backend.
//!
//! This serves the same protocol a managing edge worker exposes to containerized benchmark
//! code: `/r2/*` blob operations, `/nosql/*` composite-key operations and a `/health` probe.
//! Handlers delegate to [`DirectStorage`] and [`DirectNoSql`] over the configured backend, so
//! the proxy clients in [`crate::storage`] and [`crate::nosql`] can be exercised against it
//! end to end.
//!
//! The listener is shared and non-blocking. Every worker polls it opportunistically and
//! dispatches accepted connections round-robin over `mpsc` channels. Each worker runs its own
//! mio event loop and owns its connections exclusively, so no connection state is shared
//! between threads. HTTP/1.1 requests are framed manually from a per-connection byte buffer
//! (request line, headers, `Content-Length` body); connections are keep-alive until the peer
//! closes.
//!
//! ## Configuration
//!
//! ```toml
//! [store]
//! name = "rwlock_hashmap"
//! shards = 64
//! ```

use crate::nosql::{DirectNoSql, NoSql};
use crate::storage::{BlobStorage, DirectStorage};
use crate::stores::{BenchKVStore, BenchKVStoreOpt};
use crate::{ErrorBody, ListResponse, ListedObject, NosqlRequest, UploadResponse};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use hashbrown::HashMap;
use log::{debug, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde::Deserialize;
use serde_json::json;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

const POLLING_TIMEOUT: Option<Duration> = Some(Duration::new(0, 0));

enum WorkerMsg {
    NewConnection(StdTcpStream, SocketAddr),
    Terminate,
}

// {{{ http framing

/// One parsed request. Query parameters are percent-decoded.
struct HttpRequest {
    method: String,
    path: String,
    params: HashMap<String, String>,
    body: Vec<u8>,
}

enum Parse {
    /// Not enough bytes buffered yet.
    Incomplete,
    /// Structurally invalid; the connection should be dropped.
    Bad,
    Complete(HttpRequest),
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    u8::from_str_radix(std::str::from_utf8(h).ok()?, 16).ok()
                });
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(percent_decode(k), percent_decode(v));
    }
    params
}

/// Try to frame one request off the front of `buf`, consuming its bytes on success. The buffer
/// may hold a partial request or more than one pipelined request.
fn parse_request(buf: &mut Vec<u8>) -> Parse {
    let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Parse::Incomplete;
    };
    let head = match std::str::from_utf8(&buf[..header_end]) {
        Ok(head) => head,
        Err(_) => return Parse::Bad,
    };
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Parse::Bad;
    };
    if method.is_empty() || target.is_empty() {
        return Parse::Bad;
    }
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let total = header_end + 4 + content_length;
    if buf.len() < total {
        return Parse::Incomplete;
    }
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let request = HttpRequest {
        method: method.to_string(),
        path: percent_decode(path),
        params: parse_query(query),
        body: buf[header_end + 4..total].to_vec(),
    };
    buf.drain(..total);
    Parse::Complete(request)
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn http_response(status: u16, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        status,
        status_reason(status),
        content_type,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

fn json_response(status: u16, body: &serde_json::Value) -> Vec<u8> {
    http_response(status, "application/json", body.to_string().as_bytes())
}

fn error_response(status: u16, message: impl Into<String>) -> Vec<u8> {
    let body = ErrorBody {
        error: message.into(),
    };
    json_response(status, &json!(body))
}

// }}}

// {{{ routing

/// Per-worker handler state: direct adapters over worker-owned handles to the shared store.
struct Handlers {
    storage: DirectStorage,
    nosql: DirectNoSql,
}

impl Handlers {
    fn new(store: &BenchKVStore) -> Self {
        Self {
            storage: DirectStorage::new(store.handle()),
            nosql: DirectNoSql::new(store.handle()),
        }
    }

    fn serve(&mut self, request: &HttpRequest) -> Vec<u8> {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/health") => json_response(200, &json!({})),
            ("POST", "/r2/upload") => self.r2_upload(request),
            ("GET", "/r2/download") => self.r2_download(request),
            ("GET", "/r2/list") => self.r2_list(request),
            ("POST", "/nosql/insert") => self.nosql_write(request, false),
            ("POST", "/nosql/update") => self.nosql_write(request, true),
            ("POST", "/nosql/get") => self.nosql_get(request),
            ("POST", "/nosql/query") => self.nosql_query(request),
            ("POST", "/nosql/delete") => self.nosql_delete(request),
            _ => error_response(404, format!("no such endpoint: {}", request.path)),
        }
    }

    fn bucket_key<'a>(request: &'a HttpRequest) -> Option<(&'a str, &'a str)> {
        let bucket = request.params.get("bucket")?;
        let key = request.params.get("key")?;
        Some((bucket, key))
    }

    fn r2_upload(&mut self, request: &HttpRequest) -> Vec<u8> {
        let Some((bucket, key)) = Self::bucket_key(request) else {
            return error_response(400, "missing bucket or key");
        };
        // the proxy client already uniquified the key, store it as-is
        self.storage.put_exact(bucket, key, &request.body);
        json_response(
            200,
            &json!(UploadResponse {
                key: key.to_string()
            }),
        )
    }

    fn r2_download(&mut self, request: &HttpRequest) -> Vec<u8> {
        let Some((bucket, key)) = Self::bucket_key(request) else {
            return error_response(400, "missing bucket or key");
        };
        match self.storage.get_exact(bucket, key) {
            Some(data) => http_response(200, "application/octet-stream", &data),
            None => error_response(404, format!("object not found: {}", key)),
        }
    }

    fn r2_list(&mut self, request: &HttpRequest) -> Vec<u8> {
        let Some(bucket) = request.params.get("bucket") else {
            return error_response(400, "missing bucket");
        };
        let prefix = request.params.get("prefix").map(String::as_str).unwrap_or("");
        match self.storage.list(bucket, prefix) {
            Ok(keys) => {
                let objects = keys
                    .into_iter()
                    .map(|key| ListedObject { key })
                    .collect::<Vec<_>>();
                json_response(200, &json!(ListResponse { objects }))
            }
            Err(e) => error_response(500, e.to_string()),
        }
    }

    fn parse_nosql(request: &HttpRequest) -> Result<NosqlRequest, Vec<u8>> {
        serde_json::from_slice::<NosqlRequest>(&request.body)
            .map_err(|e| error_response(400, format!("malformed request body: {}", e)))
    }

    fn nosql_write(&mut self, request: &HttpRequest, update: bool) -> Vec<u8> {
        let body = match Self::parse_nosql(request) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let (Some(secondary), Some(data)) = (&body.secondary_key, &body.data) else {
            return error_response(400, "missing secondary_key or data");
        };
        let primary = (body.primary_key.0.as_str(), body.primary_key.1.as_str());
        let secondary = (secondary.0.as_str(), secondary.1.as_str());
        let outcome = if update {
            self.nosql.update(&body.table_name, primary, secondary, data)
        } else {
            self.nosql.insert(&body.table_name, primary, secondary, data)
        };
        match outcome {
            Ok(()) => json_response(200, &json!({})),
            Err(e) => error_response(500, e.to_string()),
        }
    }

    fn nosql_get(&mut self, request: &HttpRequest) -> Vec<u8> {
        let body = match Self::parse_nosql(request) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let Some(secondary) = &body.secondary_key else {
            return error_response(400, "missing secondary_key");
        };
        let primary = (body.primary_key.0.as_str(), body.primary_key.1.as_str());
        let secondary = (secondary.0.as_str(), secondary.1.as_str());
        match self.nosql.get(&body.table_name, primary, secondary) {
            Ok(data) => json_response(200, &json!({ "data": data })),
            Err(e) => error_response(500, e.to_string()),
        }
    }

    fn nosql_query(&mut self, request: &HttpRequest) -> Vec<u8> {
        let body = match Self::parse_nosql(request) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let Some(secondary_name) = &body.secondary_key_name else {
            return error_response(400, "missing secondary_key_name");
        };
        let primary = (body.primary_key.0.as_str(), body.primary_key.1.as_str());
        match self.nosql.query(&body.table_name, primary, secondary_name) {
            Ok(items) => json_response(200, &json!({ "items": items })),
            // includes cap violations, which the client must see as a hard failure
            Err(e) => error_response(500, e.to_string()),
        }
    }

    fn nosql_delete(&mut self, request: &HttpRequest) -> Vec<u8> {
        let body = match Self::parse_nosql(request) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let Some(secondary) = &body.secondary_key else {
            return error_response(400, "missing secondary_key");
        };
        let primary = (body.primary_key.0.as_str(), body.primary_key.1.as_str());
        let secondary = (secondary.0.as_str(), secondary.1.as_str());
        match self.nosql.delete(&body.table_name, primary, secondary) {
            Ok(()) => json_response(200, &json!({})),
            Err(e) => error_response(500, e.to_string()),
        }
    }
}

// }}}

// {{{ event loop

struct Connection {
    stream: TcpStream,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
        }
    }

    /// Drain the socket into the read buffer. Returns false when the peer has closed.
    fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.rbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }

    /// Write as much pending response data as the socket accepts. Returns false on a fatal
    /// write error.
    fn flush_pending(&mut self) -> bool {
        while !self.wbuf.is_empty() {
            match self.stream.write(&self.wbuf) {
                Ok(0) => return false,
                Ok(n) => {
                    self.wbuf.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
        true
    }
}

type ConnectionMap = HashMap<Token, Connection>;

fn new_listener(host: &str, port: &str, nonblocking: bool) -> TcpListener {
    let addr: String = "".to_string() + host + ":" + port;
    let listener = TcpListener::bind(&addr).unwrap_or_else(|e| {
        panic!("Server fails to bind address {}: {}", &addr, e);
    });
    assert!(listener.set_nonblocking(nonblocking).is_ok());
    listener
}

/// Serve every complete request currently buffered on one connection. One readable event may
/// carry multiple pipelined requests, so the buffer is drained until it holds at most a
/// partial request.
fn serve_buffered(worker_id: usize, connection: &mut Connection, handlers: &mut Handlers) -> bool {
    loop {
        match parse_request(&mut connection.rbuf) {
            Parse::Incomplete => return true,
            Parse::Bad => {
                warn!("Server worker {} drops a malformed connection", worker_id);
                return false;
            }
            Parse::Complete(request) => {
                debug!(
                    "Server worker {} serves {} {}",
                    worker_id, request.method, request.path
                );
                let response = handlers.serve(&request);
                connection.wbuf.extend_from_slice(&response);
            }
        }
    }
}

fn server_worker_main(
    worker_id: usize,
    poll: &mut Poll,
    events: &mut Events,
    connections: &mut ConnectionMap,
    handlers: &mut Handlers,
) {
    for (_, connection) in connections.iter_mut() {
        assert!(connection.flush_pending());
    }
    assert!(poll.poll(events, POLLING_TIMEOUT).is_ok());
    for event in events.iter() {
        let token = event.token();
        assert_ne!(token, Token(0));
        if event.is_read_closed() || event.is_write_closed() {
            assert!(connections.remove(&token).is_some());
        } else if event.is_error() {
            panic!("Server worker {} receives error event", worker_id);
        } else if event.is_readable() {
            let Some(connection) = connections.get_mut(&token) else {
                panic!("Server worker {} receives non-exist event", worker_id);
            };
            let alive = connection.fill()
                && serve_buffered(worker_id, connection, handlers)
                && connection.flush_pending();
            if !alive {
                connections.remove(&token);
            }
        }
    }
}

fn server_worker_check_msg(
    listener: &Arc<TcpListener>,
    rx: &Receiver<WorkerMsg>,
    txs: &Vec<Sender<WorkerMsg>>,
    counter: &Arc<AtomicUsize>,
    nr_workers: usize,
) -> Option<WorkerMsg> {
    if let Ok((s, addr)) = listener.accept() {
        let w = counter.fetch_add(1, Ordering::AcqRel) % nr_workers;
        debug!("New connection dispatched to worker {}", w);
        assert!(txs[w].send(WorkerMsg::NewConnection(s, addr)).is_ok());
    }
    if let Ok(msg) = rx.try_recv() {
        return Some(msg);
    }
    None
}

fn server_worker_new_connection(stream: StdTcpStream, addr: SocketAddr, poll: &Poll) -> (Token, Connection) {
    assert!(stream.set_nonblocking(true).is_ok());
    let mut stream = TcpStream::from_std(stream);
    let token = Token(addr.port().into());
    assert!(poll
        .registry()
        .register(&mut stream, token, Interest::READABLE)
        .is_ok());
    (token, Connection::new(stream))
}

fn server_worker(
    store: BenchKVStore,
    worker_id: usize,
    listener: Arc<TcpListener>,
    rx: Receiver<WorkerMsg>,
    txs: Vec<Sender<WorkerMsg>>,
    nr_workers: usize,
    counter: Arc<AtomicUsize>,
) {
    crate::pin_core(worker_id);

    let mut events = Events::with_capacity(1024);
    let mut connections = ConnectionMap::new();
    let mut poll = Poll::new().unwrap();
    let mut handlers = Handlers::new(&store);
    debug!("Server worker {} is ready", worker_id);

    loop {
        if let Some(msg) = server_worker_check_msg(&listener, &rx, &txs, &counter, nr_workers) {
            match msg {
                WorkerMsg::Terminate => {
                    debug!("Server worker {} terminates", worker_id);
                    break;
                }
                WorkerMsg::NewConnection(s, addr) => {
                    let (token, connection) = server_worker_new_connection(s, addr, &poll);
                    connections.insert(token, connection);
                }
            }
        }
        server_worker_main(
            worker_id,
            &mut poll,
            &mut events,
            &mut connections,
            &mut handlers,
        );
        std::thread::yield_now();
    }
}

/// Run the proxy server until a message arrives on `stop_rx`. Workers are joined before the
/// graceful-shutdown acknowledgement is sent on `grace_tx`.
pub fn server(
    store: BenchKVStore,
    host: &str,
    port: &str,
    nr_workers: usize,
    stop_rx: Receiver<()>,
    grace_tx: Sender<()>,
) {
    let listener = Arc::new(new_listener(host, port, true));

    let mut senders = Vec::<Sender<WorkerMsg>>::with_capacity(nr_workers);
    let mut receivers = Vec::<Receiver<WorkerMsg>>::with_capacity(nr_workers);
    for _ in 0..nr_workers {
        let (tx, rx) = channel();
        senders.push(tx);
        receivers.push(rx);
    }
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..nr_workers {
        let store = store.clone();
        let listener = listener.clone();
        let txs: Vec<Sender<WorkerMsg>> = senders.iter().cloned().collect();
        let rx = receivers.pop().unwrap(); // guaranteed to succeed
        let counter = counter.clone();
        let handle = std::thread::spawn(move || {
            server_worker(store, i, listener, rx, txs, nr_workers, counter);
        });
        handles.push(handle);
    }

    loop {
        if let Ok(_) = stop_rx.try_recv() {
            break;
        }
        std::thread::yield_now();
    }
    for tx in senders.iter() {
        assert!(tx.send(WorkerMsg::Terminate).is_ok());
    }
    while let Some(handle) = handles.pop() {
        assert!(handle.join().is_ok());
    }
    assert!(grace_tx.send(()).is_ok());
}

// }}}

#[derive(Deserialize, Debug)]
struct ServerStoreOpt {
    store: BenchKVStoreOpt,
}

pub fn init(text: &str) -> BenchKVStore {
    let opt: ServerStoreOpt = Figment::new()
        .merge(Toml::string(&text))
        .merge(Env::raw())
        .extract()
        .unwrap();
    BenchKVStore::new(&opt.store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nosql::ProxyNoSql;
    use crate::storage::ProxyStorage;
    use crate::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::time::Duration;

    static PORT: AtomicU32 = AtomicU32::new(9500);

    fn addr() -> (String, String, String) {
        let host = "127.0.0.1".to_string();
        let port = PORT.fetch_add(1, Ordering::AcqRel).to_string();
        let url = format!("http://{}:{}", host, port);
        (host, port, url)
    }

    fn server_run(host: &str, port: &str, nr_workers: usize) -> (Sender<()>, Receiver<()>) {
        let _ = env_logger::try_init();
        let store = init("[store]\nname = \"rwlock_hashmap\"\nshards = 64\n");
        let (host, port) = (host.to_string(), port.to_string());
        let (stop_tx, stop_rx) = channel();
        let (grace_tx, grace_rx) = channel();
        let _ = std::thread::spawn(move || {
            server(store, &host, &port, nr_workers, stop_rx, grace_tx);
        });
        std::thread::sleep(Duration::from_millis(500));
        (stop_tx, grace_rx)
    }

    fn shutdown(stop_tx: Sender<()>, grace_rx: Receiver<()>) {
        assert!(stop_tx.send(()).is_ok());
        assert!(grace_rx.recv().is_ok());
    }

    #[test]
    fn storage_round_trip_over_proxy() {
        let (host, port, url) = addr();
        let (stop_tx, grace_rx) = server_run(&host, &port, 2);
        let mut storage = ProxyStorage::new(Some(&url)).unwrap();

        let key = storage
            .upload_stream("experiments", "results.json", b"{\"n\": 1}")
            .unwrap();
        assert_ne!(key, "results.json");
        assert_eq!(storage.download_stream("experiments", &key).unwrap(), b"{\"n\": 1}");

        let keys = storage.list("experiments", "results").unwrap();
        assert_eq!(keys, vec![key]);
        assert!(storage.list("experiments", "other").unwrap().is_empty());

        shutdown(stop_tx, grace_rx);
    }

    #[test]
    fn proxy_download_of_absent_key_is_not_found() {
        let (host, port, url) = addr();
        let (stop_tx, grace_rx) = server_run(&host, &port, 2);
        let mut storage = ProxyStorage::new(Some(&url)).unwrap();

        match storage.download_stream("experiments", "nonexistent-key") {
            Err(Error::NotFound(key)) => assert_eq!(key, "nonexistent-key"),
            other => panic!("expected NotFound, got {:?}", other.map(|v| v.len())),
        }

        shutdown(stop_tx, grace_rx);
    }

    #[test]
    fn nosql_round_trip_over_proxy() {
        let (host, port, url) = addr();
        let (stop_tx, grace_rx) = server_run(&host, &port, 2);
        let mut nosql = ProxyNoSql::new(Some(&url)).unwrap();

        let data = json!({"throughput": 120.5, "tags": ["a", "b"]});
        nosql
            .insert("runs", ("exp", "e1"), ("run", "r1"), &data)
            .unwrap();
        nosql
            .insert("runs", ("exp", "e1"), ("run", "r2"), &json!({"throughput": 90.0}))
            .unwrap();

        assert_eq!(
            nosql.get("runs", ("exp", "e1"), ("run", "r1")).unwrap(),
            Some(data)
        );
        assert_eq!(nosql.get("runs", ("exp", "e2"), ("run", "r1")).unwrap(), None);

        let items = nosql.query("runs", ("exp", "e1"), "run").unwrap();
        assert_eq!(items.len(), 2);

        nosql.delete("runs", ("exp", "e1"), ("run", "r1")).unwrap();
        assert_eq!(nosql.get("runs", ("exp", "e1"), ("run", "r1")).unwrap(), None);
        // deleting an absent record succeeds silently
        nosql.delete("runs", ("exp", "e1"), ("run", "r1")).unwrap();

        shutdown(stop_tx, grace_rx);
    }

    #[test]
    fn null_value_survives_proxy_insert() {
        let (host, port, url) = addr();
        let (stop_tx, grace_rx) = server_run(&host, &port, 2);
        let mut nosql = ProxyNoSql::new(Some(&url)).unwrap();

        nosql
            .insert("t", ("p", "1"), ("s", "1"), &serde_json::Value::Null)
            .unwrap();
        nosql
            .update("t", ("p", "1"), ("s", "1"), &serde_json::Value::Null)
            .unwrap();
        let items = nosql.query("t", ("p", "1"), "s").unwrap();
        assert_eq!(items, vec![serde_json::Value::Null]);
        // the get wire shape encodes absence as null, so a stored null reads back as absent
        assert_eq!(nosql.get("t", ("p", "1"), ("s", "1")).unwrap(), None);

        shutdown(stop_tx, grace_rx);
    }

    #[test]
    fn query_cap_violation_surfaces_over_proxy() {
        let (host, port, url) = addr();
        let (stop_tx, grace_rx) = server_run(&host, &port, 2);
        let mut nosql = ProxyNoSql::new(Some(&url)).unwrap();

        for i in 0..101 {
            nosql
                .insert("runs", ("exp", "big"), ("run", &format!("r{:03}", i)), &json!(i))
                .unwrap();
        }
        let err = nosql.query("runs", ("exp", "big"), "run").unwrap_err();
        assert!(err.to_string().contains("cap"), "unexpected error: {}", err);

        shutdown(stop_tx, grace_rx);
    }

    #[test]
    fn health_and_unknown_routes() {
        let (host, port, url) = addr();
        let (stop_tx, grace_rx) = server_run(&host, &port, 2);
        let client = reqwest::blocking::Client::new();

        let response = client.get(format!("{}/health", url)).send().unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let response = client.get(format!("{}/r2/nope", url)).send().unwrap();
        assert_eq!(response.status().as_u16(), 404);

        shutdown(stop_tx, grace_rx);
    }

    #[test]
    fn multiple_clients_share_the_store() {
        let (host, port, url) = addr();
        let (stop_tx, grace_rx) = server_run(&host, &port, 4);

        let mut writer = ProxyNoSql::new(Some(&url)).unwrap();
        let mut reader = ProxyNoSql::new(Some(&url)).unwrap();
        writer
            .insert("t", ("id", "x"), ("k", "1"), &json!("shared"))
            .unwrap();
        assert_eq!(
            reader.get("t", ("id", "x"), ("k", "1")).unwrap(),
            Some(json!("shared"))
        );

        shutdown(stop_tx, grace_rx);
    }

    #[test]
    fn percent_decoding_of_query_params() {
        let (host, port, url) = addr();
        let (stop_tx, grace_rx) = server_run(&host, &port, 2);
        let mut storage = ProxyStorage::new(Some(&url)).unwrap();

        // reqwest percent-encodes the space in the key
        let key = storage.upload_stream("bucket", "my file.txt", b"x").unwrap();
        assert!(key.starts_with("my file."), "unexpected key: {}", key);
        assert_eq!(storage.download_stream("bucket", &key).unwrap(), b"x");

        shutdown(stop_tx, grace_rx);
    }
}
