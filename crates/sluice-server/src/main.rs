//! Sluice standalone node engine

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sluice_core::config::EngineConfig;
use sluice_core::expr::{col, lit};
use sluice_core::plan::{QueryBuilder, QueryPlan};
use sluice_core::runtime::{ExecutableQueryPlan, NodeEngine};
use sluice_core::sink::{FormatKind, SinkDescriptor};
use sluice_core::types::{DataType, Field, Schema, Value};
use sluice_core::window::{
    TimeCharacteristic, WatermarkStrategy, WindowAggregation, WindowDefinition, WindowType,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Records per submitted batch.
const BATCH: u64 = 256;

/// Sluice - streaming query engine node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "sluice.toml")]
    config: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Synthetic records fed to the demo query
    #[arg(long, default_value_t = 10_000)]
    records: u64,

    /// Worker threads (overrides the configuration file)
    #[arg(long)]
    workers: Option<usize>,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let path = Path::new(&args.config);
    let mut config = if path.exists() {
        EngineConfig::load(path).with_context(|| format!("failed to load {}", args.config))?
    } else {
        info!(path = %args.config, "config file not found, using defaults");
        EngineConfig::default()
    };
    if let Some(workers) = args.workers {
        config.number_of_workers = workers;
    }
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

/// cars → watermarks → speed > 50 → per car, 1s tumbling sum/count/avg → CSV on stdout.
fn demo_plan(engine: &NodeEngine) -> Result<QueryPlan> {
    let cars = Arc::new(Schema::new(vec![
        Field::new("ts", DataType::int64()),
        Field::new("id", DataType::uint32()),
        Field::new("speed", DataType::int32()),
    ])?);
    let window = WindowDefinition::new(WindowType::tumbling(1000), TimeCharacteristic::event_time("ts"))
        .aggregate(WindowAggregation::sum("speed"))
        .aggregate(WindowAggregation::count())
        .aggregate(WindowAggregation::avg("speed"));
    let plan = QueryBuilder::from_source(engine.ids(), "cars", cars)
        .assign_watermarks(WatermarkStrategy::event_time("ts", 0))
        .filter(col("speed").gt(lit(50)))
        .key_by(["id"])
        .window(window)
        .sink(SinkDescriptor::print(FormatKind::Csv))
        .build()?;
    Ok(plan)
}

/// Ten cars, one report every 10ms of event time.
fn car(i: u64) -> Vec<Value> {
    let ts = i64::try_from(i.saturating_mul(10)).unwrap_or(i64::MAX);
    let speed = i64::try_from((i * 37) % 120).unwrap_or_default();
    vec![Value::Int(ts), Value::UInt(i % 10), Value::Int(speed)]
}

/// Submits `records` synthetic cars and a closing watermark. Returns the
/// number of records sent before `cancel` was raised.
fn feed(query: &ExecutableQueryPlan, records: u64, cancel: &AtomicBool) -> Result<u64> {
    let mut sent = 0;
    while sent < records {
        if cancel.load(Ordering::Relaxed) {
            return Ok(sent);
        }
        let end = (sent + BATCH).min(records);
        let batch: Vec<_> = (sent..end).map(car).collect();
        query.submit_records("cars", &batch)?;
        sent = end;
    }
    let last = i64::try_from(records.saturating_mul(10)).context("too many records")?;
    query.inject_watermark("cars", last.saturating_add(1000))?;
    Ok(sent)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("sluice_core={0},sluice_server={0}", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting sluice node engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config);

    let config = load_config(&args)?;
    let engine = NodeEngine::new(config).context("failed to start node engine")?;
    let compiled = engine
        .compile(demo_plan(&engine)?)
        .context("failed to compile demo query")?;
    let id = engine.deploy(&compiled)?;
    engine.start(id)?;
    let query = engine.query(id)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let feeder = {
        let query = query.clone();
        let cancel = Arc::clone(&cancel);
        let records = args.records;
        tokio::task::spawn_blocking(move || feed(&query, records, &cancel))
    };

    tokio::select! {
        result = feeder => {
            let sent = result.context("feeder panicked")??;
            info!(sent, "all records submitted");
            let drain = query.clone();
            let idle = tokio::task::spawn_blocking(move || drain.wait_idle(Duration::from_secs(30)))
                .await
                .context("drain panicked")?;
            if !idle {
                warn!("query still busy after 30s, stopping anyway");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            cancel.store(true, Ordering::Relaxed);
        }
    }

    engine.undeploy(id);
    let stats = query.statistics();
    info!(
        buffers = stats.buffers_submitted,
        processed = stats.tasks_processed,
        failed = stats.tasks_failed,
        discarded = stats.tasks_discarded,
        "query finished"
    );
    engine.shutdown();
    Ok(())
}
