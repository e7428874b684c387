use crate::stores::Registry;
use clap::ValueHint::FilePath;
use clap::{Args, Parser, Subcommand};
use log::debug;
use std::fs::read_to_string;
use std::sync::mpsc::channel;

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(short = 'b')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the benchmark's TOML config file")]
    benchmark_config: String,
}

#[derive(Args, Debug)]
struct ServerArgs {
    #[arg(short = 'a', default_value = "0.0.0.0")]
    #[arg(help = "Bind address")]
    host: String,

    #[arg(short = 'p', default_value = "9000")]
    #[arg(help = "Bind port")]
    port: String,

    #[arg(short = 's')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the key-value store's TOML config file")]
    store_config: String,

    #[arg(short = 'n', default_value_t = 1)]
    #[arg(help = "Number of worker threads")]
    workers: usize,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run an invocation benchmark")]
    Bench(BenchArgs),
    #[command(about = "Start a storage/NoSQL proxy server")]
    Server(ServerArgs),
    #[command(about = "List all registered key-value stores")]
    List,
}

fn bench_cli(args: &BenchArgs) {
    let opt: String = read_to_string(args.benchmark_config.as_str()).unwrap();

    let (trigger, phases) = crate::bench::init(&opt);
    crate::bench::bench(&trigger, &phases);
}

fn server_cli(args: &ServerArgs) {
    let host = &args.host;
    let port = &args.port;
    let nr_workers = args.workers;

    let opt: String = read_to_string(args.store_config.as_str()).unwrap();
    let store = crate::server::init(&opt);

    let (stop_tx, stop_rx) = channel();
    let (grace_tx, grace_rx) = channel();

    ctrlc::set_handler(move || {
        assert!(stop_tx.send(()).is_ok());
        debug!("SIGINT received and stop message sent to server");
    })
    .expect("Error setting Ctrl-C handler for server");

    crate::server::server(store, host, port, nr_workers, stop_rx, grace_tx);

    assert!(grace_rx.recv().is_ok());
    debug!("All server threads have been shut down gracefully, exit");
}

fn list_cli() {
    for r in inventory::iter::<Registry> {
        println!("Registered store: {}", r.name);
    }
}

/// The default command line interface.
///
/// This function is public and can be called in a different crate. For example, one can
/// integrate their own key-value backend by registering its constructor, and calling this
/// function produces a binary with the same usage as the one in this crate.
///
/// ## Usage
///
/// To get the usage of the command line interface, users can run:
///
/// ```bash
/// faasbench -h
/// ```
///
/// The interface supports three modes, `bench`, `server` and `list`.
///
/// ### Benchmark Mode
///
/// Usage:
///
/// ```bash
/// faasbench bench -b <BENCH_CONFIG>
/// ```
///
/// Where `BENCH_CONFIG` is the path to the benchmark configuration file, holding the
/// `[trigger]` section along with the phase definitions. For its format, you can refer to the
/// documentations of [`crate::trigger`] and [`crate::bench`].
///
/// ### Server mode
///
/// Usage:
///
/// ```bash
/// faasbench server -s <STORE_CONFIG> -a <HOST> -p <PORT> -n <WORKERS>
/// ```
///
/// Where `STORE_CONFIG` is the path of the key-value store configuration file. Its format is
/// documented in [`crate::stores`].
///
/// The default `HOST` and `PORT` are `0.0.0.0` and `9000`. By default, the server will spawn
/// one worker thread only for incoming connections. You can adjust the number of worker
/// threads by specifying `-n`.
///
/// ### List mode
///
/// Usage:
/// ``` bash
/// faasbench list
/// ```
///
/// This command lists all registered key-value backends' names.

pub fn cmdline() {
    env_logger::init();
    let cli = Cli::parse();
    debug!("Starting faasbench with args: {:?}", cli);
    match cli.command {
        Commands::Bench(args) => bench_cli(&args),
        Commands::Server(args) => server_cli(&args),
        Commands::List => list_cli(),
    }
}
