//! Per-invocation measurement records and the batch aggregation engine.
//!
//! Each invocation of the function under test produces one [`InvocationResult`]. The record is
//! populated incrementally while the HTTP response is parsed and is immutable once handed to the
//! aggregation stage, so a batch of records can be produced by independent worker threads
//! without shared state.
//!
//! [`aggregate`] reduces a batch into a [`MetricsSummary`] and, as a side effect, backfills the
//! derived billing fields onto each record. Metric fields are independently optional: a zero or
//! unset value means "not measured" and is excluded from the sample set, never averaged in as
//! zero.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wall-clock timestamps captured by the calling harness, in seconds since the epoch.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct ClientTimes {
    pub begin: f64,
    pub end: f64,
}

/// Time attributed to the platform/runtime, in microseconds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct ProviderTimes {
    pub execution: u64,
    pub initialization: u64,
}

/// Cold-start classification and observed memory.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct InvocationStats {
    pub cold_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<f64>,
}

/// Derived billing quantities. `gb_seconds` is in integer micro-GB-seconds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct BillingInfo {
    pub memory: u64,
    pub billed_time: u64,
    pub gb_seconds: u64,
}

/// One record per benchmark invocation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InvocationResult {
    /// Locally generated, unique per dispatched invocation. Batch aggregation keys on this, so
    /// a function echoing a constant id cannot collapse records.
    pub request_id: String,
    /// The request id the function itself reported, when it echoed one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_request_id: Option<String>,
    pub client_times: ClientTimes,
    pub provider_times: ProviderTimes,
    /// Self-reported wall time from inside the invoked function, in microseconds.
    pub benchmark_time: u64,
    pub stats: InvocationStats,
    pub billing: BillingInfo,
    /// The echoed result and measurement block, preserved verbatim for debugging and for fields
    /// the normalization does not cover.
    pub raw_output: serde_json::Value,
    /// Set when the invocation failed (network error, non-2xx, malformed body). A failed record
    /// still counts toward the batch total so aggregation stays consistent with the number of
    /// dispatched invocations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvocationResult {
    /// A fresh record for a dispatched invocation, before any response fields are known.
    pub fn empty(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            provider_request_id: None,
            client_times: ClientTimes::default(),
            provider_times: ProviderTimes::default(),
            benchmark_time: 0,
            stats: InvocationStats::default(),
            billing: BillingInfo::default(),
            raw_output: serde_json::Value::Null,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Fixed per-platform resource assumptions used for billing derivation.
///
/// Billed memory is the platform's fixed allocation, not the observed usage; observed memory is
/// not billed.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct BillingModel {
    pub memory_mb: u64,
}

impl Default for BillingModel {
    fn default() -> Self {
        // Cloudflare Workers: fixed 128 MB per isolate
        Self { memory_mb: 128 }
    }
}

impl BillingModel {
    /// Micro-GB-seconds billed for the given CPU time:
    /// `round((memory_mb / 1024) * (execution_us / 1_000_000) * 1_000_000)`.
    pub fn gb_seconds(&self, execution_us: u64) -> u64 {
        let gb_seconds = (self.memory_mb as f64 / 1024.0) * (execution_us as f64 / 1_000_000.0);
        (gb_seconds * 1_000_000.0).round() as u64
    }
}

/// Distribution of an integer-valued metric (times, in microseconds). `avg` uses integer
/// division over the sample set.
#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct TimeStats {
    pub avg: u64,
    pub min: u64,
    pub max: u64,
    pub n: usize,
}

/// Distribution of a float-valued metric (memory, in MB).
#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct MemoryStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub n: usize,
}

/// Aggregate over a batch of [`InvocationResult`]s.
///
/// `cold + warm + failed == total` always holds; for a failure-free batch this reduces to
/// `cold + warm == total`. A metric block is absent when no record carried a positive sample for
/// it.
#[derive(Serialize, Clone, Debug, Default)]
pub struct MetricsSummary {
    pub total: usize,
    pub cold: usize,
    pub warm: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_time_us: Option<TimeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_time_us: Option<TimeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<MemoryStats>,
}

fn time_stats(samples: &[u64]) -> Option<TimeStats> {
    if samples.is_empty() {
        return None;
    }
    let sum: u64 = samples.iter().sum();
    Some(TimeStats {
        avg: sum / samples.len() as u64,
        min: *samples.iter().min().unwrap(),
        max: *samples.iter().max().unwrap(),
        n: samples.len(),
    })
}

fn memory_stats(samples: &[f64]) -> Option<MemoryStats> {
    if samples.is_empty() {
        return None;
    }
    let sum: f64 = samples.iter().sum();
    Some(MemoryStats {
        avg: sum / samples.len() as f64,
        min: samples.iter().cloned().fold(f64::INFINITY, f64::min),
        max: samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        n: samples.len(),
    })
}

/// Reduce a request-id-keyed batch into a [`MetricsSummary`], backfilling billing fields on each
/// record with a positive provider execution time.
///
/// An empty batch yields a summary with zero counts and no metric blocks. Missing or
/// non-positive metric values are excluded from the sample sets. The reduction never fails for
/// absent fields; absence is normal here.
pub fn aggregate(
    requests: &mut BTreeMap<String, InvocationResult>,
    billing: &BillingModel,
) -> MetricsSummary {
    let mut summary = MetricsSummary {
        total: requests.len(),
        ..Default::default()
    };

    let mut cpu_times = Vec::new();
    let mut wall_times = Vec::new();
    let mut memory = Vec::new();

    for result in requests.values_mut() {
        if result.is_failed() {
            // counts toward total only; no cold/warm classification, no samples
            summary.failed += 1;
            continue;
        }
        if result.stats.cold_start {
            summary.cold += 1;
        } else {
            summary.warm += 1;
        }
        if result.provider_times.execution > 0 {
            cpu_times.push(result.provider_times.execution);
            result.billing.memory = billing.memory_mb;
            result.billing.billed_time = result.provider_times.execution;
            result.billing.gb_seconds = billing.gb_seconds(result.provider_times.execution);
        }
        if result.benchmark_time > 0 {
            wall_times.push(result.benchmark_time);
        }
        match result.stats.memory_used {
            Some(mb) if mb > 0.0 => memory.push(mb),
            _ => {}
        }
    }

    summary.cpu_time_us = time_stats(&cpu_times);
    summary.wall_time_us = time_stats(&wall_times);
    summary.memory_mb = memory_stats(&memory);
    summary
}
