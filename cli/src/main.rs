//! parcel CLI — watch request coalescing against a simulated downstream.
//!
//! Usage:
//! ```bash
//! # 200 callers, parcels of up to 16, ship after 5ms of quiet
//! parcel simulate --requests 200 --max-batch 16 --idle-ms 5
//!
//! # Same, but every shipment fails, and print stats as JSON
//! parcel simulate --requests 50 --fail --json
//! ```

use std::env;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use parcel_core::telemetry::{init_tracing, LogConfig};
use parcel_core::{
    CancellationToken, CoalescerConfig, Entry, FireAndForgetBatcher, ParcelError, RequestBatcher,
    Shipper, StatsSnapshot,
};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "simulate" => cmd_simulate(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("parcel {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("parcel {}", env!("CARGO_PKG_VERSION"));
    println!("Coalesce concurrent requests into batched shipments\n");
    println!("USAGE:");
    println!("    parcel <COMMAND>\n");
    println!("COMMANDS:");
    println!("    simulate   Drive a coalescer with concurrent callers");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("SIMULATE FLAGS:");
    println!("    --requests <N>      Number of callers             [default: 100]");
    println!("    --max-batch <M>     Parcel size threshold         [default: 10]");
    println!("    --idle-ms <T>       Idle ship timeout in ms       [default: 5]");
    println!("    --max-age-ms <A>    Hard cap on parcel age in ms  [default: none]");
    println!("    --latency-ms <L>    Simulated downstream latency  [default: 20]");
    println!("    --spread-ms <S>     Stagger callers over S ms     [default: 50]");
    println!("    --log <LEVEL>       Log level                     [default: warn]");
    println!("    --fail              Every shipment fails");
    println!("    --fire-and-forget   Use the completion-only façade");
    println!("    --json              Print final statistics as JSON");
}

struct SimOptions {
    requests: u64,
    max_batch: usize,
    idle: Duration,
    max_age: Option<Duration>,
    latency: Duration,
    spread: Duration,
    fail: bool,
    fire_and_forget: bool,
    json: bool,
}

impl SimOptions {
    fn parse(args: &[String]) -> Result<Self, String> {
        Ok(Self {
            requests: parse_num(args, "--requests")?.unwrap_or(100),
            max_batch: parse_num(args, "--max-batch")?.unwrap_or(10),
            idle: Duration::from_millis(parse_num(args, "--idle-ms")?.unwrap_or(5)),
            max_age: parse_num(args, "--max-age-ms")?.map(Duration::from_millis),
            latency: Duration::from_millis(parse_num(args, "--latency-ms")?.unwrap_or(20)),
            spread: Duration::from_millis(parse_num(args, "--spread-ms")?.unwrap_or(50)),
            fail: has_flag(args, "--fail"),
            fire_and_forget: has_flag(args, "--fire-and-forget"),
            json: has_flag(args, "--json"),
        })
    }

    fn config(&self) -> CoalescerConfig {
        let config = CoalescerConfig::new("simulate", self.max_batch, self.idle);
        match self.max_age {
            Some(age) => config.with_max_batch_age(age),
            None => config,
        }
    }

    /// When the `i`-th caller submits, relative to the start.
    fn offset(&self, i: u64) -> Duration {
        if self.requests <= 1 {
            return Duration::ZERO;
        }
        self.spread.mul_f64(i as f64 / (self.requests - 1) as f64)
    }
}

/// Downstream stand-in: sleeps for `latency`, then answers or fails.
struct SimulatedDownstream {
    latency: Duration,
    fail: bool,
    started: Instant,
    shipments: AtomicU64,
}

impl SimulatedDownstream {
    async fn deliver(&self, size: usize) -> Result<(), ParcelError> {
        let n = self.shipments.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.latency).await;
        println!(
            "  shipment #{n:<4} size={size:<5} at +{}ms",
            self.started.elapsed().as_millis()
        );
        if self.fail {
            return Err(ParcelError::shipment_msg("simulated downstream failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Shipper<u64, u64> for SimulatedDownstream {
    async fn ship(
        &self,
        parcel: &[Entry<u64, u64>],
        _cancel: &CancellationToken,
    ) -> Result<(), ParcelError> {
        self.deliver(parcel.len()).await?;
        for entry in parcel {
            entry.resolve(entry.payload() * entry.payload());
        }
        Ok(())
    }
}

#[async_trait]
impl Shipper<u64, ()> for SimulatedDownstream {
    async fn ship(
        &self,
        parcel: &[Entry<u64, ()>],
        _cancel: &CancellationToken,
    ) -> Result<(), ParcelError> {
        self.deliver(parcel.len()).await
    }
}

async fn cmd_simulate(args: &[String]) -> Result<(), String> {
    let opts = SimOptions::parse(args)?;
    let level = parse_flag(args, "--log").unwrap_or_else(|| "warn".into());
    init_tracing(&LogConfig {
        level,
        ..Default::default()
    });

    let downstream = Arc::new(SimulatedDownstream {
        latency: opts.latency,
        fail: opts.fail,
        started: Instant::now(),
        shipments: AtomicU64::new(0),
    });

    println!(
        "Simulating {} callers (max_batch={}, idle={}ms, latency={}ms)...",
        opts.requests,
        opts.max_batch,
        opts.idle.as_millis(),
        opts.latency.as_millis()
    );
    let start = Instant::now();

    let (ok, failed, stats) = if opts.fire_and_forget {
        let batcher = FireAndForgetBatcher::<u64>::new(opts.config(), downstream)
            .map_err(|e| e.to_string())?;
        let callers = (0..opts.requests).map(|i| {
            let batcher = batcher.clone();
            let delay = opts.offset(i);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                batcher.submit(i, &CancellationToken::new()).await.is_ok()
            })
        });
        let (ok, failed) = tally(join_all(callers).await);
        (ok, failed, batcher.coalescer().stats())
    } else {
        let batcher = RequestBatcher::<u64, u64>::new(opts.config(), downstream)
            .map_err(|e| e.to_string())?;
        let callers = (0..opts.requests).map(|i| {
            let batcher = batcher.clone();
            let delay = opts.offset(i);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                matches!(batcher.call(i).await, Ok(v) if v == i * i)
            })
        });
        let (ok, failed) = tally(join_all(callers).await);
        (ok, failed, batcher.coalescer().stats())
    };

    tracing::info!(shipments = stats.shipments, ok, failed, "simulation finished");
    println!(
        "\nDone in {}ms: {ok} ok, {failed} failed",
        start.elapsed().as_millis()
    );
    print_stats(&stats, opts.json)
}

fn tally(joined: Vec<Result<bool, tokio::task::JoinError>>) -> (u64, u64) {
    joined.into_iter().fold((0, 0), |(ok, failed), r| match r {
        Ok(true) => (ok + 1, failed),
        _ => (ok, failed + 1),
    })
}

fn print_stats(stats: &StatsSnapshot, json: bool) -> Result<(), String> {
    if json {
        let out = serde_json::to_string_pretty(stats).map_err(|e| e.to_string())?;
        println!("{out}");
        return Ok(());
    }
    println!("  shipments        {}", stats.shipments);
    println!("  mean parcel      {:.1}", stats.mean_parcel_size());
    println!("  largest parcel   {}", stats.largest_parcel);
    println!(
        "  triggers         full={} idle={} age={} cancelled={}",
        stats.full_triggered, stats.idle_triggered, stats.age_triggered, stats.cancel_triggered
    );
    println!("  failed shipments {}", stats.failed_shipments);
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}

fn parse_num<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>, String> {
    parse_flag(args, flag)
        .map(|v| v.parse::<T>().map_err(|_| format!("{flag} expects a number, got '{v}'")))
        .transpose()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
