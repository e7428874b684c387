//! The core benchmark functionality.
//!
//! A benchmark here is a group of invocation runs, named **phases**. Users can provide one or
//! multiple phases that will be run sequentially against the same deployed function, each with
//! different configurations.
//!
//! ## Configuration Format
//!
//! A benchmark configuration file is formatted in TOML. It consists of a `[trigger]` section
//! naming the invocation target, the definition of multiple phases, each in a dictionary named
//! `benchmark`, and an optional `[global]` section whose values fill in fields a phase leaves
//! unset. Phases are organized in an array, so each phase starts with `[[benchmark]]`.
//!
//! ```toml
//! [trigger]
//! url = "https://function.example.workers.dev"
//!
//! [global]
//! threads = 4
//! report = "all"
//!
//! [[benchmark]]
//! repeat = 3
//! timeout = 10.0
//! payload = { size = 1024 }
//!
//! [[benchmark]]
//! ops = 100
//! ```
//!
//! Available options and their usage can be found in [`BenchmarkOpt`] and [`GlobalOpt`].
//! Options in the `[global]` section can be overwritten via environment variables without
//! changing the TOML file.
//!
//! ## Output Format
//!
//! All outputs are in plain text, one record per line, easy to process with shell tools.
//! Throughput lines follow:
//!
//! ```txt
//! phase <p> repeat <r> duration <d> elapsed <e> total <o> tput <t>
//! ```
//!
//! where `<r>` is `finish .` for the aggregated line of a whole phase, `<o>` is the number of
//! invocations and `<t>` the invocations per second. When `latency` is enabled, the finish line
//! carries client-side round-trip percentiles (`min_us`, `max_us`, `avg_us`, `p50_us`,
//! `p95_us`, `p99_us`, `p999_us`), and with `cdf` also the full distribution as
//! `cdf_us percentile` pairs.
//!
//! After the finish line, the phase prints its aggregated invocation metrics:
//!
//! ```txt
//! phase 0 invocations 300 cold 12 warm 288 failed 0
//! phase 0 cpu_time_us avg 1520 min 900 max 4100 n 300
//! phase 0 wall_time_us avg 2210 min 1100 max 5800 n 300
//! phase 0 memory_mb avg 44.8 min 41.0 max 52.3 n 300
//! phase 0 gb_seconds_total 57000
//! ```
//!
//! Metric lines appear only for metrics the function actually reported.

use crate::metrics::{self, BillingModel, InvocationResult};
use crate::trigger::{HttpTrigger, TriggerToml};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use hdrhistogram::Histogram;
use log::debug;
use parking_lot::Mutex;
use quanta::Instant;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

// {{{ benchmark

/// Length determines when a benchmark phase should stop.
#[derive(Clone, Debug, PartialEq)]
enum Length {
    /// Each worker thread syncs after a timeout (e.g., 10s).
    Timeout(Duration),
    /// Each worker thread syncs after a number of invocations.
    Count(u64),
}

/// How the results are printed out.
/// "hidden": no results
/// "repeat": only each repeat's own metrics
/// "finish": only the finish metrics
/// "all": equals to repeat + finish
#[derive(Debug, PartialEq)]
enum ReportMode {
    Hidden,
    Repeat,
    Finish,
    All,
}

/// The configuration of a single benchmark phase deserialized from a TOML string.
///
/// The fields are optional to ease parsing from TOML, as there can be global parameters that
/// are set for them.
#[derive(Deserialize, Clone, Debug)]
pub struct BenchmarkOpt {
    /// Number of threads that issue invocations in this phase.
    ///
    /// Default: 1.
    pub threads: Option<usize>,

    /// How many times this phase will be repeated. This option is useful when user would like
    /// to plot the performance trend over time in the same benchmark.
    ///
    /// Default: 1.
    pub repeat: Option<usize>,

    /// How long one repeat will run, unit is seconds. If this option is specified, the `ops`
    /// option will be ignored.
    ///
    /// Note: one of `timeout` and `ops` must be given, as an invocation stream has no natural
    /// exhaustion point.
    pub timeout: Option<f32>,

    /// How many invocations each worker will issue per repeat. Only used if `timeout` is not
    /// given.
    pub ops: Option<u64>,

    /// Report mode:
    ///
    /// - "hidden": not reported.
    /// - "repeat": after each repeat, the metrics for that repeat is printed.
    /// - "finish": after all repeats are finished, the metrics of the whole phase is printed.
    /// - "all": equals to "repeat" + "finish".
    pub report: Option<String>,

    /// Whether or not to record client-side round-trip latency. Since measuring time is of
    /// extra cost, enabling latency measurement may affect the throughput metrics.
    ///
    /// Default: false.
    pub latency: Option<bool>,

    /// Whether or not to print out latency CDF at the end of the phase. If this is set to
    /// `true`, `latency` must also be set to `true`.
    ///
    /// Default: false.
    pub cdf: Option<bool>,

    /// The fixed memory allocation assumed for billing, in MB.
    ///
    /// Default: 128.
    pub memory_mb: Option<u64>,

    /// The JSON payload POSTed on every invocation, written as an inline TOML table.
    ///
    /// Default: an empty object.
    pub payload: Option<toml::Table>,
}

impl BenchmarkOpt {
    /// Internal function called after all global options are applied and when all the options
    /// are set. This will test if the opt can be a valid benchmark phase.
    fn sanity(&self) {
        // these must be present, so `unwrap` won't panic.
        assert!(
            *self.threads.as_ref().unwrap() > 0,
            "threads should be positive if given"
        );
        assert!(
            *self.repeat.as_ref().unwrap() > 0,
            "repeat should be positive if given"
        );
        match self.report.as_ref().unwrap().as_str() {
            "hidden" | "repeat" | "finish" | "all" => {}
            _ => panic!("report mode should be one of: hidden, repeat, finish, all"),
        }
        if let Some(true) = self.cdf {
            assert!(
                *self.latency.as_ref().unwrap(),
                "when cdf is true, latency must also be true"
            );
        }
    }
}

/// The configuration of a benchmark phase, parsed from user's input.
#[derive(Debug, PartialEq)]
pub struct Benchmark {
    threads: usize,
    repeat: usize,
    len: Length,
    report: ReportMode,
    latency: bool,
    cdf: bool,
    billing: BillingModel,
    payload: serde_json::Value,
}

impl Benchmark {
    /// The constructor of Benchmark expects all fields have their values, the struct should
    /// contain either its own parameters, or carry the default parameters.
    fn new(opt: &BenchmarkOpt) -> Self {
        opt.sanity();
        let threads = opt.threads.unwrap();
        let repeat = opt.repeat.unwrap();
        let len = if let Some(t) = opt.timeout {
            assert!(
                opt.ops.is_none(),
                "timeout and ops cannot be provided at the same time"
            );
            Length::Timeout(Duration::from_secs_f32(t))
        } else if let Some(c) = opt.ops {
            Length::Count(c)
        } else {
            panic!("either timeout or ops must be given for an invocation benchmark");
        };
        let report = match opt.report.as_ref().unwrap().as_str() {
            "hidden" => ReportMode::Hidden,
            "repeat" => ReportMode::Repeat,
            "finish" => ReportMode::Finish,
            "all" => ReportMode::All,
            _ => panic!("Invalid report mode provided"),
        };
        let latency = opt.latency.unwrap();
        let cdf = opt.cdf.unwrap();
        let billing = match opt.memory_mb {
            Some(memory_mb) => BillingModel { memory_mb },
            None => BillingModel::default(),
        };
        let payload = match &opt.payload {
            Some(table) => {
                serde_json::to_value(table).expect("payload must be representable as JSON")
            }
            None => serde_json::json!({}),
        };
        Self {
            threads,
            repeat,
            len,
            report,
            latency,
            cdf,
            billing,
            payload,
        }
    }
}

// }}} benchmark

// {{{ benchmarkgroup

/// The global options that go to the `[global]` section.
///
/// They will override missing fields in each `[[benchmark]]` section, if the corresponding
/// option is missing. For the usage of each option, please refer to [`BenchmarkOpt`].
#[derive(Deserialize, Clone, Debug, Default)]
pub struct GlobalOpt {
    pub threads: Option<usize>,
    pub repeat: Option<usize>,
    pub report: Option<String>,
    pub latency: Option<bool>,
    pub cdf: Option<bool>,
    pub memory_mb: Option<u64>,
    pub payload: Option<toml::Table>,
}

impl GlobalOpt {
    fn apply(&self, opt: &mut BenchmarkOpt) {
        opt.threads = opt.threads.or_else(|| Some(self.threads.unwrap_or(1)));
        opt.repeat = opt.repeat.or_else(|| Some(self.repeat.unwrap_or(1)));
        opt.report = opt
            .report
            .clone()
            .or_else(|| Some(self.report.clone().unwrap_or("all".to_string())));
        opt.latency = opt
            .latency
            .or_else(|| Some(self.latency.unwrap_or(false)));
        opt.cdf = opt.cdf.or_else(|| Some(self.cdf.unwrap_or(false)));
        opt.memory_mb = opt.memory_mb.or(self.memory_mb);
        opt.payload = opt.payload.clone().or_else(|| self.payload.clone());
    }
}

/// The configuration of a group of benchmark phase(s). It has a global option that could
/// possibly override phase-local options.
#[derive(Deserialize, Clone, Debug)]
struct BenchmarkGroupOpt {
    /// The invocation target
    trigger: TriggerToml,

    /// Global parameters (optional)
    global: Option<GlobalOpt>,

    /// Array of the parameters of consisting phase(s)
    benchmark: Vec<BenchmarkOpt>,
}

// }}} benchmarkgroup

// {{{ bencher

pub fn init(text: &str) -> (HttpTrigger, Vec<Arc<Benchmark>>) {
    let opt: BenchmarkGroupOpt = Figment::new()
        .merge(Toml::string(text))
        .merge(Env::raw())
        .extract()
        .unwrap();
    debug!(
        "Creating benchmark group with the following configurations: {:?}",
        opt
    );
    let global = opt.global.clone().unwrap_or_default();
    let mut bopts: Vec<BenchmarkOpt> = opt.benchmark.iter().map(|o| o.clone()).collect();
    for bopt in bopts.iter_mut() {
        global.apply(bopt);
    }
    debug!("Global options applied to benchmarks: {:?}", bopts);
    let trigger = opt.trigger.build();
    let phases = bopts
        .into_iter()
        .map(|o| Arc::new(Benchmark::new(&o)))
        .collect();
    (trigger, phases)
}

fn bench_phase_should_break(len: &Length, count: u64, start: &Instant) -> bool {
    match len {
        Length::Count(c) => {
            if count == *c {
                return true;
            }
        }
        Length::Timeout(duration) => {
            // one invocation is a full network round trip, so check every time
            if Instant::now().duration_since(*start) >= *duration {
                return true;
            }
        }
    }
    false
}

/// A per-worker counter for each repeat in the same phase. Using [`AtomicU64`] here makes the
/// measurement `Sync` + `Send` so it can be freely accessed by different threads (mainly by the
/// thread that aggregates the overall measurement).
struct Counter(AtomicU64);

impl Counter {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn read(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn reference(&self) -> &mut u64 {
        // SAFETY: the reference is only written by the worker thread that owns this counter
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// A per-worker round-trip latency collector, shared among all repeats of a phase. It is only
/// merged at the end of a whole phase.
struct Latency {
    /// Latency histogram in ns, scaled to us when printed
    hdr: Histogram<u64>,
}

impl Latency {
    fn new() -> Self {
        let hdr = Histogram::new(3).unwrap();
        Self { hdr }
    }

    fn record(&mut self, duration: Duration) {
        let ns = duration.as_nanos() as u64;
        assert!(self.hdr.record(ns).is_ok());
    }

    fn merge(&mut self, other: &Latency) {
        assert!(self.hdr.add(&other.hdr).is_ok());
    }
}

/// The main metrics for each worker thread in the same phase.
struct Measurement {
    /// Per-repeat counters. This value is actively updated by the worker and loosely evaluated
    /// by the main thread.
    counters: Vec<Counter>,

    /// Per-worker latency metrics, updated by the worker if latency needs to be checked.
    latency: Mutex<Latency>,

    /// Every invocation record the worker produced, across all repeats. Stashed once before the
    /// final sync and aggregated by thread 0.
    results: Mutex<Vec<InvocationResult>>,

    /// The duration of each repeat that is measured by the corresponding worker thread. It is
    /// only updated once after a repeat is really done. In a time-limited run, the master
    /// thread will try to access the duration. If an entry exists, the thread has finished
    /// execution, so the master will directly use the time duration observed by the worker. If
    /// an entry is not here, the time will be observed by the master.
    durations: Vec<Mutex<Option<Duration>>>,
}

impl Measurement {
    fn new(repeat: usize) -> Self {
        let counters = (0..repeat).into_iter().map(|_| Counter::new()).collect();
        let latency = Mutex::new(Latency::new());
        let results = Mutex::new(Vec::new());
        let durations = (0..repeat).into_iter().map(|_| Mutex::new(None)).collect();
        Self {
            counters,
            latency,
            results,
            durations,
        }
    }
}

struct WorkerContext {
    /// The benchmark phase that the current work is referring to
    benchmark: Arc<Benchmark>,

    /// The very beginning of all phases in a group, for calculating elapsed timestamp
    since: Instant,

    /// The current phase of this benchmark in the group
    phase: usize,

    /// The measurement of all worker threads. One worker typically only needs to refer to one
    /// of them, and thread 0 will aggregate the metrics and make an output
    measurements: Vec<Arc<Measurement>>,

    /// Barrier that syncs all workers
    barrier: Arc<Barrier>,

    /// `(worker_id, nr_threads)` pair, used to determine the identity of a worker
    thread_info: (usize, usize),
}

fn bench_stat_repeat(
    benchmark: &Arc<Benchmark>,
    phase: usize,
    repeat: usize,
    since: Instant,
    start: Instant,
    end: Instant,
    thread_info: (usize, usize),
    measurements: &Vec<Arc<Measurement>>,
) {
    assert!(thread_info.0 == 0);
    let mut throughput = 0.0f64;
    let mut total = 0u64;
    for i in 0..thread_info.1 {
        let d = match *measurements[i].durations[repeat].lock() {
            Some(d) => d,
            None => {
                // only applies to time-limited phases
                assert!(matches!(benchmark.len, Length::Timeout(_)));
                start.elapsed()
            }
        };
        let ops = measurements[i].counters[repeat].read();
        let tput = ops as f64 / d.as_secs_f64();
        total += ops;
        throughput += tput;
    }

    let duration = (end - start).as_secs_f64();
    let elapsed = (end - since).as_secs_f64();

    if benchmark.report == ReportMode::Repeat || benchmark.report == ReportMode::All {
        println!(
            "phase {} repeat {} duration {:.2} elapsed {:.2} total {} tput {:.2}",
            phase, repeat, duration, elapsed, total, throughput,
        );
    }
}

fn bench_stat_final(
    benchmark: &Arc<Benchmark>,
    phase: usize,
    since: Instant,
    start: Instant,
    end: Instant,
    thread_info: (usize, usize),
    measurements: &Vec<Arc<Measurement>>,
) {
    assert!(thread_info.0 == 0);
    let mut total = 0u64;
    let mut latency = Latency::new();
    let mut requests = BTreeMap::new();
    for i in 0..thread_info.1 {
        for j in 0..benchmark.repeat {
            let ops = measurements[i].counters[j].read();
            total += ops;
        }
        latency.merge(&measurements[i].latency.lock());
        for result in measurements[i].results.lock().drain(..) {
            requests.insert(result.request_id.clone(), result);
        }
    }

    let summary = metrics::aggregate(&mut requests, &benchmark.billing);
    let gb_seconds_total: u64 = requests.values().map(|r| r.billing.gb_seconds).sum();

    let duration = (end - start).as_secs_f64();
    let elapsed = (end - since).as_secs_f64();

    let throughput = total as f64 / duration;

    if benchmark.report == ReportMode::Finish || benchmark.report == ReportMode::All {
        print!(
            "phase {} finish . duration {:.2} elapsed {:.2} total {} tput {:.2}",
            phase, duration, elapsed, total, throughput,
        );
        if benchmark.latency {
            print!(" ");
            assert_eq!(total, latency.hdr.len());
            let hdr = &latency.hdr;
            print!(
                "min_us {:.2} max_us {:.2} avg_us {:.2} \
                 p50_us {:.2} p95_us {:.2} p99_us {:.2} p999_us {:.2}",
                hdr.min() as f64 / 1000.0,
                hdr.max() as f64 / 1000.0,
                hdr.mean() / 1000.0,
                hdr.value_at_quantile(0.50) as f64 / 1000.0,
                hdr.value_at_quantile(0.95) as f64 / 1000.0,
                hdr.value_at_quantile(0.99) as f64 / 1000.0,
                hdr.value_at_quantile(0.999) as f64 / 1000.0,
            );
            if benchmark.cdf {
                print!(" cdf_us percentile ");
                let mut cdf = 0;
                for v in latency.hdr.iter_linear(1000) {
                    let ns = v.value_iterated_to();
                    let us = (ns + 1) / 1000;
                    cdf += v.count_since_last_iteration();
                    print!("{} {:.2}", us, cdf as f64 * 100.0 / total as f64);
                    if ns >= hdr.max() {
                        break;
                    }
                    print!(" ");
                }
                assert_eq!(cdf, total);
            }
        }
        println!();

        println!(
            "phase {} invocations {} cold {} warm {} failed {}",
            phase, summary.total, summary.cold, summary.warm, summary.failed,
        );
        if let Some(cpu) = summary.cpu_time_us {
            println!(
                "phase {} cpu_time_us avg {} min {} max {} n {}",
                phase, cpu.avg, cpu.min, cpu.max, cpu.n,
            );
        }
        if let Some(wall) = summary.wall_time_us {
            println!(
                "phase {} wall_time_us avg {} min {} max {} n {}",
                phase, wall.avg, wall.min, wall.max, wall.n,
            );
        }
        if let Some(memory) = summary.memory_mb {
            println!(
                "phase {} memory_mb avg {:.1} min {:.1} max {:.1} n {}",
                phase, memory.avg, memory.min, memory.max, memory.n,
            );
        }
        println!("phase {} gb_seconds_total {}", phase, gb_seconds_total);
    }
}

fn bench_worker(trigger: HttpTrigger, context: WorkerContext) {
    let WorkerContext {
        benchmark,
        since,
        phase,
        measurements,
        barrier,
        thread_info,
    } = context;

    let id = thread_info.0;
    crate::pin_core(id);

    // if record latency, take the lock guard of the latency counter until all repeats are done
    let mut latency = match benchmark.latency {
        true => Some(measurements[id].latency.lock()),
        false => None,
    };

    let latency_tick = match latency {
        Some(_) => || Some(Instant::now()),
        None => || None,
    };

    let mut collected = Vec::new();
    let start = Instant::now(); // for thread 0
    for i in 0..benchmark.repeat {
        let counter = measurements[id].counters[i].reference();
        // start the phase at roughly the same time
        barrier.wait();
        let start = Instant::now();
        loop {
            let op_start = latency_tick();
            let result = trigger.sync_invoke(&benchmark.payload);
            let op_end = latency_tick();
            if let Some(ref mut l) = latency {
                l.record(op_end.unwrap() - op_start.unwrap());
            }
            collected.push(result);
            *counter += 1;
            if bench_phase_should_break(&benchmark.len, *counter, &start) {
                break;
            }
        }

        // after the execution, counter is up-to-date, so it's time to update duration
        let end = Instant::now();
        *measurements[id].durations[i].lock() = Some(end.duration_since(start.clone()));

        // for non time-limited phases, sync first to make sure that all threads have finished
        // if a phase is time limited, loosely evaluate the metrics
        if !matches!(benchmark.len, Length::Timeout(_)) {
            barrier.wait();
        }

        // master is 0, it will aggregate data and print info inside this call
        if id == 0 {
            bench_stat_repeat(
                &benchmark,
                phase,
                i,
                since,
                start,
                end,
                thread_info,
                &measurements,
            );
        }
    }

    drop(latency);
    measurements[id].results.lock().append(&mut collected);

    // every thread will sync on this
    barrier.wait();

    if id == 0 {
        let end = Instant::now();
        bench_stat_final(
            &benchmark,
            phase,
            since,
            start,
            end,
            thread_info,
            &measurements,
        );
    }
}

fn bench_phase(
    trigger: &HttpTrigger,
    benchmark: Arc<Benchmark>,
    phase: usize,
    since: Arc<Instant>,
) {
    let barrier = Arc::new(Barrier::new(benchmark.threads));
    let measurements: Vec<Arc<Measurement>> = (0..benchmark.threads)
        .map(|_| Arc::new(Measurement::new(benchmark.repeat)))
        .collect();
    let mut handles = Vec::new();
    for t in 0..benchmark.threads {
        let trigger = trigger.clone();
        let benchmark = benchmark.clone();
        let barrier = barrier.clone();
        let thread_info = (t, benchmark.threads);
        let context = WorkerContext {
            benchmark,
            phase,
            measurements: measurements.clone(),
            barrier,
            since: *since,
            thread_info,
        };
        let handle = std::thread::spawn(move || {
            bench_worker(trigger, context);
        });
        handles.push(handle);
    }

    while let Some(handle) = handles.pop() {
        assert!(handle.join().is_ok());
    }
}

/// Run all phases sequentially against the same trigger.
pub fn bench(trigger: &HttpTrigger, phases: &Vec<Arc<Benchmark>>) {
    debug!("Running invocation bencher against {}", trigger.url());
    let start = Arc::new(Instant::now());
    for (i, p) in phases.iter().enumerate() {
        bench_phase(trigger, p.clone(), i, start.clone());
    }
}

// }}} bencher

// {{{ tests

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicU16, Ordering};
    use uuid::Uuid;

    static PORT: AtomicU16 = AtomicU16::new(9700);

    #[test]
    fn global_options_are_applied() {
        let opt = r#"
            [trigger]
            url = "http://127.0.0.1:1"

            [global]
            threads = 8
            repeat = 10
            report = "finish"
            latency = true
            cdf = true
            memory_mb = 256
            payload = { size = 64 }

            [[benchmark]]
            timeout = 10.0
        "#;

        let (_, bg) = init(opt);
        assert_eq!(bg.len(), 1);

        let benchmark = Benchmark {
            threads: 8,
            repeat: 10,
            report: ReportMode::Finish,
            latency: true,
            cdf: true,
            billing: BillingModel { memory_mb: 256 },
            payload: json!({"size": 64}),
            len: Length::Timeout(Duration::from_secs_f32(10.0)),
        };

        assert_eq!(*bg[0], benchmark)
    }

    #[test]
    fn global_options_defaults_are_applied() {
        let opt = r#"
            [trigger]
            url = "http://127.0.0.1:1"

            [[benchmark]]
            ops = 100
        "#;

        let (_, bg) = init(opt);
        assert_eq!(bg.len(), 1);

        let benchmark = Benchmark {
            threads: 1,
            repeat: 1,
            report: ReportMode::All,
            latency: false,
            cdf: false,
            billing: BillingModel::default(),
            payload: json!({}),
            len: Length::Count(100),
        };

        assert_eq!(*bg[0], benchmark)
    }

    #[test]
    fn phase_options_override_global() {
        let opt = r#"
            [trigger]
            url = "http://127.0.0.1:1"

            [global]
            threads = 8
            payload = { size = 64 }

            [[benchmark]]
            threads = 2
            ops = 10
            payload = { size = 1024, mode = "read" }

            [[benchmark]]
            ops = 20
        "#;

        let (_, bg) = init(opt);
        assert_eq!(bg.len(), 2);
        assert_eq!(bg[0].threads, 2);
        assert_eq!(bg[0].payload, json!({"size": 1024, "mode": "read"}));
        assert_eq!(bg[1].threads, 8);
        assert_eq!(bg[1].payload, json!({"size": 64}));
    }

    #[test]
    #[should_panic(expected = "should be positive")]
    fn invalid_threads() {
        let opt = r#"
            [trigger]
            url = "http://127.0.0.1:1"

            [[benchmark]]
            threads = 0
            timeout = 1.0
        "#;

        let (_, _) = init(opt);
    }

    #[test]
    #[should_panic(expected = "should be positive")]
    fn invalid_repeat() {
        let opt = r#"
            [trigger]
            url = "http://127.0.0.1:1"

            [[benchmark]]
            repeat = 0
            timeout = 1.0
        "#;

        let (_, _) = init(opt);
    }

    #[test]
    #[should_panic(expected = "report mode should be one of")]
    fn invalid_report() {
        let opt = r#"
            [trigger]
            url = "http://127.0.0.1:1"

            [[benchmark]]
            timeout = 1.0
            report = "alll"
        "#;

        let (_, _) = init(opt);
    }

    #[test]
    #[should_panic(expected = "cannot be provided at the same time")]
    fn invalid_length() {
        let opt = r#"
            [trigger]
            url = "http://127.0.0.1:1"

            [[benchmark]]
            timeout = 1.0
            ops = 1000
        "#;

        let (_, _) = init(opt);
    }

    #[test]
    #[should_panic(expected = "either timeout or ops")]
    fn missing_length() {
        let opt = r#"
            [trigger]
            url = "http://127.0.0.1:1"

            [[benchmark]]
            threads = 1
        "#;

        let (_, _) = init(opt);
    }

    #[test]
    #[should_panic(expected = "latency must also be true")]
    fn invalid_latency() {
        let opt = r#"
            [trigger]
            url = "http://127.0.0.1:1"

            [[benchmark]]
            timeout = 1.0
            cdf = true
        "#;

        let (_, _) = init(opt);
    }

    fn read_request(stream: &mut TcpStream) -> bool {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return false,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + len {
                    return true;
                }
            }
        }
    }

    /// A keep-alive echo function: every invocation answers with a fresh envelope. The first
    /// request on each connection reports a cold start.
    fn envelope_server(port: u16) {
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                std::thread::spawn(move || {
                    let mut served = 0u64;
                    while read_request(&mut stream) {
                        let envelope = json!({
                            "begin": 0.0, "end": 0.002,
                            "request_id": Uuid::new_v4().to_string(),
                            "is_cold": served == 0,
                            "result": {
                                "output": {"ok": true},
                                "measurement": {
                                    "cpu_time_us": 800,
                                    "wall_time_us": 2000,
                                    "memory_used_mb": 40.0
                                }
                            }
                        })
                        .to_string();
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                             Content-Length: {}\r\n\r\n{}",
                            envelope.len(),
                            envelope
                        );
                        if stream.write_all(response.as_bytes()).is_err() {
                            break;
                        }
                        served += 1;
                    }
                });
            }
        });
    }

    #[test]
    fn count_phase_runs_to_completion() {
        let _ = env_logger::try_init();
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        envelope_server(port);
        let opt = format!(
            r#"
            [trigger]
            url = "http://127.0.0.1:{}"

            [global]
            report = "hidden"

            [[benchmark]]
            threads = 2
            repeat = 2
            ops = 5
            latency = true
            "#,
            port
        );
        let (trigger, phases) = init(&opt);
        bench(&trigger, &phases);
    }

    #[test]
    fn timeout_phase_runs_to_completion() {
        let _ = env_logger::try_init();
        let port = PORT.fetch_add(1, Ordering::AcqRel);
        envelope_server(port);
        let opt = format!(
            r#"
            [trigger]
            url = "http://127.0.0.1:{}"

            [[benchmark]]
            threads = 2
            timeout = 0.5
            report = "hidden"
            "#,
            port
        );
        let (trigger, phases) = init(&opt);
        bench(&trigger, &phases);
    }
}

// }}} tests
