//! batchq - run a simulated bulk property-lookup batch through the queue.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use batchq_core::config::load_options;
use batchq_core::logging::{LogFormat, init_tracing};
use batchq_core::{BatchQueue, ProcessError, Processor};
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(name = "batchq", about = "Bounded-concurrency batch lookup demo", long_about = None)]
struct Cli {
    /// Queue options file (TOML / JSON / YAML). `BATCHQ_*` env vars override it.
    #[clap(long, env = "BATCHQ_CONFIG")]
    config: Option<PathBuf>,

    /// Number of properties to look up.
    #[clap(long, default_value_t = 25)]
    items: usize,

    /// Override `concurrency`.
    #[clap(long)]
    concurrency: Option<usize>,

    /// Override `retry_attempts`.
    #[clap(long)]
    retry_attempts: Option<u32>,

    /// Override `retry_delay_ms`.
    #[clap(long)]
    retry_delay_ms: Option<u64>,

    /// Probability that one lookup attempt fails transiently.
    #[clap(long, default_value_t = 0.2)]
    failure_rate: f64,

    /// Every n-th address is malformed and fails permanently (0 disables).
    #[clap(long, default_value_t = 13)]
    malformed_every: usize,

    /// Simulated lookup latency range, in milliseconds.
    #[clap(long, default_value_t = 50)]
    min_latency_ms: u64,
    #[clap(long, default_value_t = 250)]
    max_latency_ms: u64,

    /// Emit logs as JSON.
    #[clap(long)]
    json_logs: bool,
}

#[derive(Debug, Clone)]
struct Address {
    line: String,
    malformed: bool,
}

#[derive(Debug, Serialize)]
struct Valuation {
    address: String,
    estimate: u64,
}

/// Stand-in for the remote valuation endpoint: random latency, transient
/// failures at `failure_rate`, permanent failure for malformed addresses.
struct PropertyLookup {
    failure_rate: f64,
    latency_ms: (u64, u64),
}

#[async_trait]
impl Processor<Address, Valuation> for PropertyLookup {
    async fn process(&self, item: Address) -> Result<Valuation, ProcessError> {
        if item.malformed {
            return Err(ProcessError::permanent(format!(
                "could not geocode {:?}",
                item.line
            )));
        }

        // ThreadRng は Send ではないので await の前に捨てる
        let (latency, roll, estimate) = {
            let mut rng = rand::thread_rng();
            let (lo, hi) = self.latency_ms;
            (
                rng.gen_range(lo..=hi.max(lo)),
                rng.r#gen::<f64>(),
                rng.gen_range(150_000..=1_200_000),
            )
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if roll < self.failure_rate {
            return Err(ProcessError::transient(format!(
                "valuation api timed out after {latency}ms"
            )));
        }
        Ok(Valuation {
            address: item.line,
            estimate,
        })
    }
}

fn addresses(n: usize, malformed_every: usize) -> Vec<Address> {
    (1..=n)
        .map(|i| Address {
            line: format!("{} Market St, Unit {}", 100 + i, i),
            malformed: malformed_every != 0 && i % malformed_every == 0,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(format, "info");

    let mut options = load_options(cli.config.as_deref()).context("loading queue options")?;
    if let Some(c) = cli.concurrency {
        options.concurrency = c;
    }
    if let Some(r) = cli.retry_attempts {
        options.retry_attempts = r;
    }
    if let Some(ms) = cli.retry_delay_ms {
        options.retry_delay = Duration::from_millis(ms);
    }
    info!(?options, items = cli.items, "starting batch");

    let lookup = PropertyLookup {
        failure_rate: cli.failure_rate.clamp(0.0, 1.0),
        latency_ms: (cli.min_latency_ms, cli.max_latency_ms),
    };

    let queue = BatchQueue::<Address, Valuation>::builder(lookup)
        .options(options)
        .on_progress(|done, total| println!("[{done}/{total}] done"))
        .on_item_error(|item: &Address, err: &ProcessError| {
            eprintln!("failed: {} ({}: {err})", item.line, err.kind())
        })
        .build()
        .context("building queue")?;

    // Ctrl-C は協調キャンセル: 実行中の lookup は最後まで走らせる
    let cancel_handle = queue.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_handle.cancel();
        }
    });

    queue.add(addresses(cli.items, cli.malformed_every)).await;
    let report = queue.start().await.context("running batch")?;

    let finished = queue.drain_finished().await?;
    let mut valuations: Vec<&Valuation> = finished
        .iter()
        .filter_map(|f| f.outcome.as_ref().ok())
        .collect();
    valuations.sort_by(|a, b| b.estimate.cmp(&a.estimate));

    let summary = serde_json::json!({
        "report": report,
        "top_valuations": valuations.iter().take(5).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
