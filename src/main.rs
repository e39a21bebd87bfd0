use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use blockledger::block::first_broken_link;
use blockledger::config::LedgerConfig;
use blockledger::ledger::{rebuild_index, LedgerReader};
use blockledger::pipeline::{spawn_pipeline, LogWriter};
use blockledger::store::{seed_simulation_keys, SledStore};
use blockledger::{Blockchain, Payload, SubPayload};
use clap::Parser;
use rand::Rng;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Feeds simulated transactions through the ledger and audits the result.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Optional TOML config file
    #[clap(long, value_parser, default_value = "ledger.toml")]
    config: PathBuf,
    /// Number of transactions to submit
    #[clap(long, value_parser, default_value_t = 10)]
    transactions: u64,
    /// Delay between submissions
    #[clap(long, value_parser, default_value_t = 1000)]
    interval_ms: u64,
    /// Declare version 2.0 on every Nth transaction so it fails validation
    #[clap(long, value_parser)]
    stale_every: Option<u64>,
    #[clap(long, value_parser)]
    block_capacity: Option<usize>,
    #[clap(long, value_parser)]
    log_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = LedgerConfig::load(Some(args.config.as_path()))?;
    if let Some(capacity) = args.block_capacity {
        config.block_capacity = capacity;
    }
    if let Some(path) = args.log_path {
        config.log_path = path;
    }
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Arc::new(SledStore::open(&config.store_path)?);
    seed_simulation_keys(store.as_ref(), config.seed_keys)?;

    let index = rebuild_index(&config.log_path)?;
    if !index.is_empty() {
        warn!(records = index.len(), "ledger already holds blocks from an earlier run");
    }
    let writer = LogWriter::open(&config.log_path)?;
    info!(path = %writer.path().display(), capacity = config.block_capacity, "ledger opened");

    let (handoff, pipeline) = spawn_pipeline(writer, index, &config);
    let mut chain = Blockchain::new(store, handoff, &config);

    for i in 1..=args.transactions {
        let ver = match args.stale_every {
            Some(n) if n > 0 && i % n == 0 => 2.0,
            _ => 1.0,
        };
        let val: u32 = rand::thread_rng().gen_range(1..1000);
        let mut payload = Payload::new();
        payload.insert(format!("SIM{i}"), SubPayload::new(ver).with_field("val", val));

        let outcome = chain.add_transaction(payload).await?;
        if !outcome.committed.is_empty() {
            info!(committed = ?outcome.committed, "blocks committed");
        }
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }

    chain.shutdown().await?;
    let index = pipeline.index();
    let report = pipeline.join().await?;
    if !report.unpersisted.is_empty() || !chain.unhanded_blocks().is_empty() {
        error!(
            unpersisted = ?report.unpersisted,
            unhanded = ?chain.unhanded_blocks(),
            "committed blocks missing from ledger"
        );
    }

    let reader = LedgerReader::new(&config.log_path).with_index(index);
    let blocks = reader.fetch_all_blocks();
    for block in &blocks {
        info!(
            block_number = block.block_number,
            transactions = block.transactions.len(),
            valid = block.valid_transactions().count(),
            hash = %block.block_hash,
            "ledger block"
        );
    }
    match first_broken_link(&blocks)? {
        None => info!(blocks = blocks.len(), "hash chain verified"),
        Some(block_number) => warn!(block_number, "hash chain broken"),
    }

    Ok(())
}
