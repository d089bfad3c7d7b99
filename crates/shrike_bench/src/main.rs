//! Shrike benchmark CLI.
//!
//! Usage:
//!   shrike -b mem -c workload.toml --create --load --execute
//!   shrike -b mem -c workload.toml --execute --export json

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use shrike_common::config::WorkloadConfiguration;
use shrike_common::observability::init_tracing;
use shrike_harness::memdb::MemBenchmark;
use shrike_harness::{BenchmarkResults, Driver, DriverOptions};

#[derive(Parser, Debug)]
#[command(
    name = "shrike",
    about = "Multi-DBMS OLTP/OLAP benchmark harness",
    version
)]
struct Cli {
    /// Benchmark module to run.
    #[arg(short = 'b', long = "bench", default_value = "mem")]
    bench: String,

    /// Workload configuration file (TOML).
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Create the benchmark schema.
    #[arg(long)]
    create: bool,

    /// Bulk-load initial data.
    #[arg(long)]
    load: bool,

    /// Rows to load with --load.
    #[arg(long, default_value_t = 10_000)]
    rows: u64,

    /// Execute the workload.
    #[arg(long)]
    execute: bool,

    /// Export format: text | csv | json
    #[arg(long, default_value = "text")]
    export: String,

    /// Live throughput sampling interval in milliseconds (0 disables).
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let text = fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config {}", cli.config.display()))?;
    let config = WorkloadConfiguration::from_toml(&text)
        .with_context(|| format!("parsing config {}", cli.config.display()))?;

    match cli.bench.as_str() {
        "mem" => run_mem(&cli, config),
        other => bail!("unknown benchmark module '{other}' (available: mem)"),
    }
}

fn run_mem(cli: &Cli, config: WorkloadConfiguration) -> Result<()> {
    let module = Arc::new(MemBenchmark::new(config));

    if cli.create {
        module.create();
        info!("schema created");
    }
    if cli.load {
        module.load(cli.rows);
        info!(rows = cli.rows, "initial data loaded");
    }
    if cli.execute {
        let options = DriverOptions {
            monitor_interval: (cli.interval_ms > 0)
                .then(|| Duration::from_millis(cli.interval_ms)),
        };
        let results = Driver::with_options(module, options).run()?;
        print_results(&results, &cli.export);
    }
    Ok(())
}

fn print_results(r: &BenchmarkResults, format: &str) {
    match format {
        "csv" => print_csv(r),
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(&r.to_json()).expect("serialize results")
        ),
        _ => print_text(r),
    }
}

fn print_text(r: &BenchmarkResults) {
    let lat = r.latency_summary();
    println!("═══════════════════════════════════════════════");
    println!("  Benchmark results");
    println!("═══════════════════════════════════════════════");
    println!("  Elapsed:           {} ms", r.elapsed.as_millis());
    println!("  Measured requests: {}", r.measured_requests());
    println!("  Completed work:    {}", r.completed_work);
    println!("  Throughput:        {:.1} req/s", r.requests_per_sec());
    println!("  ─── Outcomes ───");
    for txn in r.success.keys() {
        println!("  {:<20} ok={}", txn.name(), r.success.get(txn));
    }
    for txn in r.abort.keys() {
        println!("  {:<20} aborted={}", txn.name(), r.abort.get(txn));
    }
    for txn in r.retry.keys() {
        println!("  {:<20} retried={}", txn.name(), r.retry.get(txn));
    }
    for txn in r.errors.keys() {
        println!("  {:<20} errors={}", txn.name(), r.errors.get(txn));
    }
    for (txn, messages) in &r.abort_messages {
        for (msg, n) in messages.iter() {
            println!("  {:<20} abort[{msg}]={n}", txn.name());
        }
    }
    println!("  ─── Latency (µs) ───");
    println!("  p50={}  p95={}  p99={}  p999={}  max={}  (n={})",
        lat.p50_us, lat.p95_us, lat.p99_us, lat.p999_us, lat.max_us, lat.count,
    );
    println!();
}

fn print_csv(r: &BenchmarkResults) {
    let lat = r.latency_summary();
    println!(
        "elapsed_ms,measured_requests,completed_work,req_per_sec,success,abort,retry,errors,p50_us,p95_us,p99_us,p999_us,max_us"
    );
    println!(
        "{},{},{},{:.1},{},{},{},{},{},{},{},{},{}",
        r.elapsed.as_millis(),
        r.measured_requests(),
        r.completed_work,
        r.requests_per_sec(),
        r.success.total(),
        r.abort.total(),
        r.retry.total(),
        r.errors.total(),
        lat.p50_us,
        lat.p95_us,
        lat.p99_us,
        lat.p999_us,
        lat.max_us,
    );
}
