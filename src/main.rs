//! Drip simulation driver.
//!
//! Runs the whole protocol against the in-memory store: a persister follows
//! a collection while a writer mutates it, a reader copies a subset and then
//! replays the log, and the cleaner trims what the reader no longer needs.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use drip::prelude::*;
use drip::store::SourceStore;
use futures::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SOURCE: &str = "orders";

#[derive(Parser, Debug)]
#[command(name = "drip")]
#[command(about = "Simulate Drip persistence, copy and replay on an in-memory store")]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy a subset while it is being written, then replay what changed
    Sync {
        /// Documents in the collection before the copy starts
        #[arg(long, default_value_t = 20)]
        documents: i64,
        /// Documents per copy batch
        #[arg(long, default_value_t = 5)]
        batch_size: usize,
        /// Writes applied while the copy runs
        #[arg(long, default_value_t = 6)]
        writes: i64,
        /// Change feed wait per persister cycle, in milliseconds
        #[arg(long, default_value_t = 50)]
        max_await_ms: u64,
    },
    /// Persist a stream of writes and expire all but the newest entry
    Retention {
        /// Writes to persist before cleaning
        #[arg(long, default_value_t = 10)]
        writes: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "drip={0},drip_persist={0},drip_sync={0},drip_compaction={0}",
                    cli.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Sync {
            documents,
            batch_size,
            writes,
            max_await_ms,
        } => run_sync(documents, batch_size, writes, max_await_ms).await,
        Commands::Retention { writes } => run_retention(writes).await,
    }
}

async fn run_sync(documents: i64, batch_size: usize, writes: i64, max_await_ms: u64) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    for id in 0..documents {
        store.insert(SOURCE, json!({"_id": id, "a": id % 2}))?;
    }

    let config = PersisterConfigBuilder::new().max_await(max_await_ms).build();
    let persister = run_persister(store.clone(), SOURCE, config);
    tokio::time::sleep(Duration::from_millis(max_await_ms)).await;

    let rule = Rule::matching(json!({"a": 0}));
    let mut copy = drip_cc(store.clone(), SOURCE, rule.clone(), None, CopyConfig { batch_size });
    let mut start = None;
    let mut copied = 0usize;
    let mut write = 0i64;
    while let Some(item) = copy.try_next().await? {
        match item {
            CcItem::Start { cea_cursor, cluster_time } => {
                info!(cluster_time = %cluster_time, "Copy started");
                start = Some(cea_cursor);
            }
            CcItem::Batch { documents, cluster_time, .. } => {
                copied += documents.len();
                info!(documents = documents.len(), cluster_time = %cluster_time, "Copied batch");
            }
        }
        // Keep writing while the copy is in progress.
        if write < writes {
            let id = write % documents.max(1);
            store.update(SOURCE, id, UpdateDescription::new().set("a", json!((id + 1) % 2)))?;
            write += 1;
        }
    }
    while write < writes {
        store.insert(SOURCE, json!({"_id": documents + write, "a": 0}))?;
        write += 1;
    }
    // Moves the gate past the last write above.
    store.insert(SOURCE, json!({"_id": "fence", "a": -1}))?;
    tokio::time::sleep(Duration::from_millis(max_await_ms * 4)).await;

    let start = start.ok_or_else(|| anyhow::anyhow!("copy produced no start marker"))?;
    let events: Vec<CsEvent> =
        drip_cea_resume(store.clone(), SOURCE, start, CeaRule::symmetric(rule))
            .try_collect()
            .await?;
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }

    let summary = persister.stop().await?;
    info!(
        copied,
        replayed = events.len(),
        persisted = summary.events_written,
        batches = summary.batches_written,
        "Sync finished"
    );
    Ok(())
}

async fn run_retention(writes: i64) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.create_collection(SOURCE);
    let persister = run_persister(
        store.clone(),
        SOURCE,
        PersisterConfigBuilder::new().max_await(20).build(),
    );
    tokio::time::sleep(Duration::from_millis(40)).await;

    for id in 0..writes {
        store.insert(SOURCE, json!({"_id": id}))?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = persister.stop().await?;
    info!(persisted = summary.events_written, "Persister stopped");

    let until = Utc::now() + chrono::Duration::seconds(1);
    let outcome = expire_pcs_events(&*store, SOURCE, until).await?;
    let id = store.collection_id(SOURCE).await?;
    println!("{:?}", outcome);
    println!("retained entries: {}", store.log_len(SOURCE));

    if let CleanupOutcome::Expired { boundary, .. } = outcome {
        let stale = CeaCursor::new(id, boundary.key);
        match drip_cea_resume(store.clone(), SOURCE, stale, CeaRule::default())
            .try_collect::<Vec<_>>()
            .await
        {
            Err(err) => println!(
                "stale cursor rejected: {} (copy required: {})",
                err,
                err.requires_copy()
            ),
            Ok(events) => println!("stale cursor unexpectedly replayed {} events", events.len()),
        }
    }
    Ok(())
}
