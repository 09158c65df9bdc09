// SPDX-License-Identifier: Apache-2.0

//! A thin CLI front-end for exercising the engine against a local payload
//! file end to end. Illustrative only: real callers (an updater daemon,
//! an IPC service) drive `ab_update_engine`'s modules directly, with their
//! own notion of where partitions live and how boot slots are flipped.

use ab_update_engine::bootctl::FakeBootControl;
use ab_update_engine::config::EngineConfig;
use ab_update_engine::executor::InMemoryPartition;
use ab_update_engine::hardware::FixedHardware;
use ab_update_engine::performer::{CancelToken, DeltaPerformer, PartitionHandle, PartitionOpener};
use ab_update_engine::prefs::MemoryStore;
use ab_update_engine::snapshot::SnapshotController;
use anyhow::{Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Parser)]
#[command(about = "Applies an A/B OTA payload against in-memory partitions for local testing")]
struct Args {
    /// Path to a `payload.bin` file.
    payload_path: PathBuf,

    /// Target boot slot to activate on success.
    #[arg(long, default_value_t = 1)]
    target_slot: u32,

    /// Disable signature requirements (for unsigned dev payloads).
    #[arg(long)]
    insecure: bool,
}

/// Every partition lives in memory, sized lazily on first open. Good
/// enough for local smoke-testing a payload; a device integration swaps
/// this for a `FileBackedPartition` opener over `/dev/block/by-name/*`.
struct InMemoryOpener {
    partitions: Mutex<HashMap<String, InMemoryPartition>>,
}

#[async_trait::async_trait]
impl PartitionOpener for InMemoryOpener {
    async fn open(&self, partition_name: &str) -> ab_update_engine::performer::Result<Box<dyn PartitionHandle>> {
        let mut guard = self.partitions.lock().unwrap();
        let partition = guard
            .entry(partition_name.to_string())
            .or_insert_with(|| InMemoryPartition::new(4096, 4096));
        Ok(Box::new(InMemoryPartition {
            blocks: partition.blocks.clone(),
            block_size: partition.block_size,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let payload_bytes = tokio::fs::read(&args.payload_path)
        .await
        .with_context(|| format!("reading {}", args.payload_path.display()))?;
    let expected_hash = Sha256::digest(&payload_bytes).to_vec();

    let config = EngineConfig {
        require_signatures: !args.insecure,
        ..Default::default()
    };
    let hardware = FixedHardware::new(0, false);
    let prefs = MemoryStore::new();
    let bootctl = FakeBootControl::new(2, 0);
    let opener = InMemoryOpener {
        partitions: Mutex::new(HashMap::new()),
    };
    let snapshot = SnapshotController::new(&prefs, false);
    let performer = DeltaPerformer::new(
        &config,
        &hardware,
        &prefs,
        &opener,
        &bootctl,
        None,
        None,
        CancelToken::new(),
    );

    tracing::info!(path = %args.payload_path.display(), "applying payload");
    let outcome = performer
        .run(
            std::io::Cursor::new(payload_bytes),
            &snapshot,
            args.target_slot,
            &expected_hash,
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    tracing::info!(
        partitions = outcome.partitions_applied,
        operations = outcome.operations_applied,
        active_slot = bootctl.active_slot(),
        "update applied"
    );

    Ok(())
}
