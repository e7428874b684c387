//! HTTP invocation trigger.
//!
//! [`HttpTrigger`] performs one synchronous POST against a deployed worker and normalizes the
//! JSON response envelope into an [`InvocationResult`]. The envelope carries a benchmark-defined
//! `result` object with an optional `measurement` block; every measurement field is
//! independently optional and the absence of one never blocks extraction of the others.
//!
//! A failed or timed-out invocation still yields a record, with `error` set, so a batch always
//! contains exactly one record per dispatched invocation.
//!
//! The trigger is cheap to clone (the underlying connection pool is shared), so a benchmark
//! worker pool hands each thread its own clone.
//!
//! ## Configuration
//!
//! ```toml
//! [trigger]
//! url = "https://function.example.workers.dev"
//! invoke_timeout = 300
//! probe_timeout = 10
//! ```
//!
//! `invoke_timeout` (seconds) bounds the main invocation call and is unset by default, since a
//! long-running benchmark function may legitimately hold the request open. `probe_timeout`
//! bounds each readiness probe and defaults to 10 seconds.

use crate::metrics::InvocationResult;
use crate::storage::USER_AGENT;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::sync::mpsc::{channel, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout knobs for [`HttpTrigger`].
#[derive(Clone, Copy, Debug)]
pub struct TriggerOpt {
    /// Bound on the main invocation call. `None` means unbounded.
    pub invoke_timeout: Option<Duration>,
    /// Bound on each `/health` readiness probe.
    pub probe_timeout: Duration,
}

impl Default for TriggerOpt {
    fn default() -> Self {
        Self {
            invoke_timeout: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Invokes a deployed worker over HTTP and normalizes its responses.
#[derive(Clone)]
pub struct HttpTrigger {
    url: String,
    probe_timeout: Duration,
    client: reqwest::blocking::Client,
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A microsecond field with a millisecond fallback, tolerating integer or float JSON numbers.
fn us_field(measurement: &Value, us_key: &str, ms_key: &str) -> Option<u64> {
    if let Some(us) = measurement.get(us_key).and_then(Value::as_f64) {
        return Some(us.round() as u64);
    }
    measurement
        .get(ms_key)
        .and_then(Value::as_f64)
        .map(|ms| (ms * 1000.0).round() as u64)
}

impl HttpTrigger {
    pub fn new(url: impl Into<String>, opt: TriggerOpt) -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(opt.invoke_timeout)
            .build()
            .expect("http client init failed");
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            probe_timeout: opt.probe_timeout,
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One blocking invocation. Always returns a record; transport errors, non-2xx statuses and
    /// malformed bodies set `error` instead of being raised.
    pub fn sync_invoke(&self, payload: &Value) -> InvocationResult {
        let mut result = InvocationResult::empty(Uuid::new_v4().to_string());
        debug!("invoking {} request {}", self.url, result.request_id);

        result.client_times.begin = unix_now();
        let response = self.client.post(&self.url).json(payload).send();
        result.client_times.end = unix_now();

        match response {
            Err(e) => {
                warn!("invocation {} failed: {}", result.request_id, e);
                result.error = Some(format!("invocation failed: {}", e));
            }
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().unwrap_or_default();
                    warn!("invocation {} returned {}", result.request_id, status);
                    result.error = Some(format!("invocation returned {}: {}", status, body));
                } else {
                    match response.json::<Value>() {
                        Ok(envelope) => self.extract(&mut result, envelope),
                        Err(e) => {
                            result.error = Some(format!("malformed response body: {}", e));
                        }
                    }
                }
            }
        }
        result
    }

    /// Populate normalized fields from a parsed envelope. The envelope itself is retained
    /// verbatim in `raw_output`.
    fn extract(&self, result: &mut InvocationResult, envelope: Value) {
        if let Some(id) = envelope.get("request_id").and_then(Value::as_str) {
            result.provider_request_id = Some(id.to_string());
        }
        if let Some(cold) = envelope.get("is_cold").and_then(Value::as_bool) {
            result.stats.cold_start = cold;
        }
        let measurement = envelope
            .pointer("/result/measurement")
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(execution) = us_field(&measurement, "cpu_time_us", "cpu_time_ms") {
            result.provider_times.execution = execution;
        }
        if let Some(wall) = us_field(&measurement, "wall_time_us", "wall_time_ms") {
            result.benchmark_time = wall;
        }
        if let Some(cold) = measurement.get("is_cold").and_then(Value::as_bool) {
            result.stats.cold_start = cold;
        }
        if let Some(mb) = measurement.get("memory_used_mb").and_then(Value::as_f64) {
            result.stats.memory_used = Some(mb);
        }
        result.raw_output = envelope;
    }

    /// Run the invocation on a worker thread. The provider has no native asynchronous wire
    /// operation, so this is a thread wrapper around [`Self::sync_invoke`].
    pub fn async_invoke(&self, payload: Value) -> PendingInvocation {
        let trigger = self.clone();
        let (tx, rx) = channel();
        let handle = thread::spawn(move || {
            let _ = tx.send(trigger.sync_invoke(&payload));
        });
        PendingInvocation { rx, handle }
    }

    /// Poll `GET /health` until the worker reports ready (200) or `max_wait` elapses. A 503
    /// means the backing resources are still provisioning.
    pub fn wait_ready(&self, max_wait: Duration, interval: Duration) -> bool {
        let url = format!("{}/health", self.url);
        let deadline = SystemTime::now() + max_wait;
        loop {
            match self.client.get(&url).timeout(self.probe_timeout).send() {
                Ok(response) if response.status().is_success() => {
                    info!("{} is ready", self.url);
                    return true;
                }
                Ok(response) => {
                    let status = response.status();
                    let reason = response
                        .json::<Value>()
                        .ok()
                        .and_then(|b| b.get("error").and_then(Value::as_str).map(String::from))
                        .unwrap_or_default();
                    debug!("{} not ready yet: {} {}", self.url, status, reason);
                }
                Err(e) => {
                    debug!("{} not reachable yet: {}", self.url, e);
                }
            }
            if SystemTime::now() >= deadline {
                warn!("{} did not become ready within {:?}", self.url, max_wait);
                return false;
            }
            thread::sleep(interval);
        }
    }
}

/// Handle to an in-flight [`HttpTrigger::async_invoke`].
pub struct PendingInvocation {
    rx: Receiver<InvocationResult>,
    handle: JoinHandle<()>,
}

impl PendingInvocation {
    /// Block until the invocation completes.
    pub fn wait(self) -> InvocationResult {
        let result = self
            .rx
            .recv()
            .expect("invocation worker exited without a result");
        let _ = self.handle.join();
        result
    }
}

/// The `[trigger]` section of a configuration file. Timeouts are in seconds.
#[derive(Deserialize, Clone, Debug)]
pub struct TriggerToml {
    pub url: String,
    pub invoke_timeout: Option<u64>,
    pub probe_timeout: Option<u64>,
}

impl TriggerToml {
    pub fn build(&self) -> HttpTrigger {
        let opt = TriggerOpt {
            invoke_timeout: self.invoke_timeout.map(Duration::from_secs),
            probe_timeout: self
                .probe_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
        };
        HttpTrigger::new(self.url.clone(), opt)
    }
}

#[derive(Deserialize)]
struct TriggerConfig {
    trigger: TriggerToml,
}

/// Build an [`HttpTrigger`] from a TOML config string, with environment overrides applied.
pub fn init(text: &str) -> HttpTrigger {
    let config: TriggerConfig = Figment::new()
        .merge(Toml::string(text))
        .merge(Env::raw())
        .extract()
        .unwrap();
    config.trigger.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicU16, Ordering};

    static PORT: AtomicU16 = AtomicU16::new(9200);

    fn drain_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + len {
                    break;
                }
            }
        }
        buf
    }

    /// Serves one canned response per expected connection, then exits.
    fn canned_server(port: u16, responses: Vec<(u16, String)>) -> thread::JoinHandle<()> {
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        thread::spawn(move || {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let _ = drain_request(&mut stream);
                let reason = match status {
                    200 => "OK",
                    503 => "Service Unavailable",
                    _ => "Error",
                };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).unwrap();
            }
        })
    }

    fn trigger_on(port: u16) -> HttpTrigger {
        HttpTrigger::new(format!("http://127.0.0.1:{}", port), TriggerOpt::default())
    }

    #[test]
    fn sync_invoke_extracts_measurement_fields() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let envelope = json!({
            "begin": 1000.0, "end": 1002.5,
            "request_id": "req-123",
            "is_cold": true,
            "result": {
                "output": {"status": "ok"},
                "measurement": {
                    "cpu_time_us": 1500,
                    "wall_time_us": 2500,
                    "memory_used_mb": 45.5
                }
            }
        });
        let server = canned_server(port, vec![(200, envelope.to_string())]);
        let result = trigger_on(port).sync_invoke(&json!({"size": 1}));
        server.join().unwrap();

        assert!(result.error.is_none());
        assert_eq!(result.provider_request_id.as_deref(), Some("req-123"));
        // the local id stays the batch key and is never replaced by the echoed one
        assert_ne!(result.request_id, "req-123");
        assert!(result.stats.cold_start);
        assert_eq!(result.provider_times.execution, 1500);
        assert_eq!(result.benchmark_time, 2500);
        assert_eq!(result.stats.memory_used, Some(45.5));
        assert!(result.client_times.end >= result.client_times.begin);
        // envelope retained verbatim
        assert_eq!(result.raw_output, envelope);
    }

    #[test]
    fn millisecond_fields_are_scaled_when_microseconds_absent() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let envelope = json!({
            "begin": 0.0, "end": 0.0, "request_id": "r", "is_cold": false,
            "result": {"output": null, "measurement": {
                "cpu_time_ms": 3, "wall_time_ms": 4.5
            }}
        });
        let server = canned_server(port, vec![(200, envelope.to_string())]);
        let result = trigger_on(port).sync_invoke(&json!({}));
        server.join().unwrap();

        assert_eq!(result.provider_times.execution, 3000);
        assert_eq!(result.benchmark_time, 4500);
    }

    #[test]
    fn measurement_fields_are_independently_optional() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let envelope = json!({
            "begin": 0.0, "end": 0.0, "request_id": "r", "is_cold": false,
            "result": {"output": null, "measurement": {"wall_time_us": 700}}
        });
        let server = canned_server(port, vec![(200, envelope.to_string())]);
        let result = trigger_on(port).sync_invoke(&json!({}));
        server.join().unwrap();

        assert!(result.error.is_none());
        assert_eq!(result.benchmark_time, 700);
        assert_eq!(result.provider_times.execution, 0);
        assert_eq!(result.stats.memory_used, None);
    }

    #[test]
    fn missing_measurement_block_is_not_an_error() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let envelope = json!({
            "begin": 0.0, "end": 0.0, "request_id": "r", "is_cold": false,
            "result": {"output": 42}
        });
        let server = canned_server(port, vec![(200, envelope.to_string())]);
        let result = trigger_on(port).sync_invoke(&json!({}));
        server.join().unwrap();

        assert!(result.error.is_none());
        assert_eq!(result.provider_times.execution, 0);
    }

    #[test]
    fn non_success_status_yields_error_record() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let server = canned_server(port, vec![(500, "{\"error\": \"boom\"}".to_string())]);
        let result = trigger_on(port).sync_invoke(&json!({}));
        server.join().unwrap();

        let error = result.error.unwrap();
        assert!(error.contains("500"), "unexpected error: {}", error);
    }

    #[test]
    fn unreachable_target_yields_error_record() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let result = trigger_on(port).sync_invoke(&json!({}));
        assert!(result.error.is_some());
        assert!(result.client_times.end >= result.client_times.begin);
    }

    #[test]
    fn async_invoke_completes_on_worker_thread() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let envelope = json!({
            "begin": 0.0, "end": 0.0, "request_id": "async-1", "is_cold": false,
            "result": {"output": null}
        });
        let server = canned_server(port, vec![(200, envelope.to_string())]);
        let pending = trigger_on(port).async_invoke(json!({}));
        let result = pending.wait();
        server.join().unwrap();
        assert_eq!(result.provider_request_id.as_deref(), Some("async-1"));
    }

    #[test]
    fn echoed_request_ids_cannot_collapse_records() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let envelope = json!({
            "begin": 0.0, "end": 0.0, "request_id": "constant", "is_cold": false,
            "result": {"output": null}
        });
        let server = canned_server(
            port,
            vec![(200, envelope.to_string()), (200, envelope.to_string())],
        );
        let trigger = trigger_on(port);
        let first = trigger.sync_invoke(&json!({}));
        let second = trigger.sync_invoke(&json!({}));
        server.join().unwrap();

        assert_eq!(first.provider_request_id.as_deref(), Some("constant"));
        assert_eq!(second.provider_request_id.as_deref(), Some("constant"));
        assert_ne!(first.request_id, second.request_id);
    }

    #[test]
    fn wait_ready_polls_until_healthy() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let server = canned_server(
            port,
            vec![
                (503, "{\"error\": \"provisioning\"}".to_string()),
                (503, "{\"error\": \"provisioning\"}".to_string()),
                (200, "{}".to_string()),
            ],
        );
        let ready = trigger_on(port)
            .wait_ready(Duration::from_secs(10), Duration::from_millis(10));
        server.join().unwrap();
        assert!(ready);
    }

    #[test]
    fn wait_ready_gives_up_after_max_wait() {
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        let ready = trigger_on(port)
            .wait_ready(Duration::from_millis(50), Duration::from_millis(10));
        assert!(!ready);
    }

    #[test]
    fn init_reads_timeouts_from_config() {
        let opt = "[trigger]\nurl = \"http://127.0.0.1:1/\"\ninvoke_timeout = 30\n";
        let trigger = init(opt);
        assert_eq!(trigger.url(), "http://127.0.0.1:1");
    }
}
