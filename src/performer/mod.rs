//! Delta Performer (C6): the orchestrating state machine that drives the
//! Payload Parser (C2), Operation Executor (C3), Verity Writer (C4),
//! checkpointing through the Preference Store (C1), the Snapshot
//! Controller (C5), and finally the Boot-Slot Coordinator (C7) through one
//! complete update application.
//!
//! Grounded on the teacher's `payload_dumper.rs::process_payload`, which is
//! likewise the single function tying header parsing, per-operation
//! dispatch, and progress reporting together — generalized here from "dump
//! every partition to a file on disk" to "apply every partition against
//! whatever `PartitionOpener` the caller supplies, resuming from a
//! checkpoint if one exists".
//!
//! Verity/FEC bytes are fed from a per-partition read-back through the
//! `SourceReader` once every operation has been applied, rather than from
//! the operation's decompressed bytes as they come off the Executor: the
//! Executor already owns and discards that buffer per operation, and
//! re-reading the (much cheaper to re-read than to re-derive) written
//! extent avoids threading a second buffer through every dispatch arm just
//! to feed a writer most operations in most partitions never even use.

use crate::config::EngineConfig;
use crate::error::ErrorCode;
use crate::executor::{self, SourceReader, TargetWriter};
use crate::hardware::HardwareInterface;
use crate::payload::{ParsedManifest, PayloadParser, PublicKeyVerifier};
use crate::prefs::PreferenceStore;
use crate::proto::{Extent, PartitionUpdate, partition_update::HashTreeAlgorithm};
use crate::snapshot::{OperationHint, SnapshotController, SnapshotState};
use crate::verity::VerityWriter;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncRead;

pub type Result<T> = std::result::Result<T, ErrorCode>;

const KEY_PARTITION_INDEX: &str = "performer/partition_index";
const KEY_OP_INDEX: &str = "performer/op_index";
const KEY_STATE: &str = "performer/state";
const KEY_PAYLOAD_HASH: &str = "performer/payload_hash";
const KEY_NEXT_DATA_OFFSET: &str = "performer/next_data_offset";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformerState {
    Beginning,
    InitialMetadata,
    ApplyingOperations,
    WritingVerity,
    Finalizing,
    Done,
}

impl PerformerState {
    fn as_str(self) -> &'static str {
        match self {
            PerformerState::Beginning => "beginning",
            PerformerState::InitialMetadata => "initial_metadata",
            PerformerState::ApplyingOperations => "applying_operations",
            PerformerState::WritingVerity => "writing_verity",
            PerformerState::Finalizing => "finalizing",
            PerformerState::Done => "done",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "beginning" => PerformerState::Beginning,
            "initial_metadata" => PerformerState::InitialMetadata,
            "applying_operations" => PerformerState::ApplyingOperations,
            "writing_verity" => PerformerState::WritingVerity,
            "finalizing" => PerformerState::Finalizing,
            "done" => PerformerState::Done,
            _ => return None,
        })
    }
}

/// A handle that can both be written to and read back from, which is what
/// every partition target needs during an update: writes from operations,
/// reads back for post-write hash checks and verity/FEC source bytes.
pub trait PartitionHandle: TargetWriter + SourceReader + Send {}
impl<T: TargetWriter + SourceReader + Send> PartitionHandle for T {}

#[async_trait::async_trait]
pub trait PartitionOpener: Send + Sync {
    async fn open(&self, partition_name: &str) -> Result<Box<dyn PartitionHandle>>;
}

/// Cooperative cancellation: checked between operations, never mid-write,
/// so a cancellation always lands on an operation boundary the checkpoint
/// can resume from cleanly.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct PerformerOutcome {
    pub partitions_applied: usize,
    pub operations_applied: usize,
}

pub struct DeltaPerformer<'a> {
    config: &'a EngineConfig,
    hardware: &'a dyn HardwareInterface,
    prefs: &'a dyn PreferenceStore,
    opener: &'a dyn PartitionOpener,
    bootctl: &'a dyn crate::bootctl::BootControl,
    metadata_verifier: Option<&'a PublicKeyVerifier>,
    payload_verifier: Option<&'a PublicKeyVerifier>,
    cancel: CancelToken,
}

impl<'a> DeltaPerformer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a EngineConfig,
        hardware: &'a dyn HardwareInterface,
        prefs: &'a dyn PreferenceStore,
        opener: &'a dyn PartitionOpener,
        bootctl: &'a dyn crate::bootctl::BootControl,
        metadata_verifier: Option<&'a PublicKeyVerifier>,
        payload_verifier: Option<&'a PublicKeyVerifier>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            hardware,
            prefs,
            opener,
            bootctl,
            metadata_verifier,
            payload_verifier,
            cancel,
        }
    }

    fn state(&self) -> PerformerState {
        self.prefs
            .get_string(KEY_STATE)
            .ok()
            .flatten()
            .and_then(|s| PerformerState::parse(&s))
            .unwrap_or(PerformerState::Beginning)
    }

    fn set_state(&self, state: PerformerState) -> Result<()> {
        self.prefs.set_string(KEY_STATE, state.as_str())
    }

    pub fn current_state(&self) -> PerformerState {
        self.state()
    }

    /// Reads the persisted checkpoint record: `(partition_index, op_index,
    /// payload_hash, next_data_offset)`. `payload_hash` is `None` when no
    /// checkpoint has ever been written.
    fn checkpoint(&self) -> (usize, usize, Option<Vec<u8>>, u64) {
        let partition_index = self.prefs.get_int64(KEY_PARTITION_INDEX).ok().flatten().unwrap_or(0);
        let op_index = self.prefs.get_int64(KEY_OP_INDEX).ok().flatten().unwrap_or(0);
        let next_data_offset = self.prefs.get_int64(KEY_NEXT_DATA_OFFSET).ok().flatten().unwrap_or(0);
        let payload_hash = self
            .prefs
            .get_string(KEY_PAYLOAD_HASH)
            .ok()
            .flatten()
            .and_then(|s| hex::decode(s).ok());
        (
            partition_index.max(0) as usize,
            op_index.max(0) as usize,
            payload_hash,
            next_data_offset.max(0) as u64,
        )
    }

    fn save_checkpoint(
        &self,
        partition_index: usize,
        op_index: usize,
        payload_hash: &[u8],
        next_data_offset: u64,
    ) -> Result<()> {
        let mut txn = self.prefs.begin_transaction()?;
        txn.set_int64(KEY_PARTITION_INDEX, partition_index as i64)?;
        txn.set_int64(KEY_OP_INDEX, op_index as i64)?;
        txn.set_string(KEY_PAYLOAD_HASH, &hex::encode(payload_hash))?;
        txn.set_int64(KEY_NEXT_DATA_OFFSET, next_data_offset as i64)?;
        txn.submit()
    }

    fn clear_checkpoint(&self) -> Result<()> {
        let _ = self.prefs.delete(KEY_PARTITION_INDEX);
        let _ = self.prefs.delete(KEY_OP_INDEX);
        let _ = self.prefs.delete(KEY_STATE);
        let _ = self.prefs.delete(KEY_PAYLOAD_HASH);
        let _ = self.prefs.delete(KEY_NEXT_DATA_OFFSET);
        Ok(())
    }

    /// Runs the whole payload to completion (or up to a cancellation or
    /// error), resuming from whatever checkpoint the preference store
    /// holds. `target_slot` is the slot this payload is being written into;
    /// on success it becomes the active boot slot.
    pub async fn run<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        snapshot: &SnapshotController<'_>,
        target_slot: u32,
        expected_payload_hash: &[u8],
    ) -> Result<PerformerOutcome> {
        let mut parser = PayloadParser::new(reader);
        // `next_data_offset` was persisted alongside the indices but, since
        // the fast-forward below recomputes it as the running total of
        // every skipped operation's `data_length`, it's only needed here
        // as a value to re-derive, not to seed an accumulator with.
        let (stored_partition, stored_op, stored_hash, _) = self.checkpoint();

        // Only honor a checkpoint written against this exact payload; a
        // checkpoint from a different descriptor (or none at all) starts
        // from scratch rather than fast-forwarding against the wrong
        // manifest's operation boundaries.
        let (resume_partition, resume_op) = match stored_hash {
            Some(hash) if hash == expected_payload_hash => (stored_partition, stored_op),
            Some(_) => {
                self.clear_checkpoint()?;
                (0, 0)
            }
            None => (0, 0),
        };
        let mut next_data_offset = 0u64;

        self.set_state(PerformerState::Beginning)?;
        let ParsedManifest { manifest, .. } = parser
            .parse_header_and_manifest(self.config, self.hardware, self.metadata_verifier)
            .await?;

        self.set_state(PerformerState::InitialMetadata)?;
        if snapshot.state() == SnapshotState::Idle {
            snapshot.prepare_partitions_for_update(&manifest)?;
        }
        if snapshot.state() == SnapshotState::Prepared {
            snapshot.begin_writing()?;
        }

        // Fast-forward the stream through every already-applied
        // operation's blob bytes, so the running payload hash still covers
        // them even though we don't rewrite them.
        for partition in &manifest.partitions[..resume_partition.min(manifest.partitions.len())] {
            for op in &partition.operations {
                let len = op.data_length.unwrap_or(0);
                parser.skip_hashed(len).await?;
                next_data_offset += len;
            }
        }
        if let Some(partition) = manifest.partitions.get(resume_partition) {
            for op in &partition.operations[..resume_op.min(partition.operations.len())] {
                let len = op.data_length.unwrap_or(0);
                parser.skip_hashed(len).await?;
                next_data_offset += len;
            }
        }

        self.set_state(PerformerState::ApplyingOperations)?;
        let mut operations_applied = 0usize;
        let mut partitions_applied = 0usize;

        for (partition_index, partition) in manifest.partitions.iter().enumerate() {
            if partition_index < resume_partition {
                continue;
            }
            let start_op = if partition_index == resume_partition { resume_op } else { 0 };
            // C5 owns the mapping from a manifest partition name to the
            // actual (possibly snapshot-backed) device it should be
            // written through.
            let device = snapshot.get_partition_device(&partition.partition_name)?;
            let mut handle = self.opener.open(&device).await?;

            for (op_index, op) in partition.operations.iter().enumerate() {
                if op_index < start_op {
                    continue;
                }
                if self.cancel.is_cancelled() {
                    self.save_checkpoint(partition_index, op_index, expected_payload_hash, next_data_offset)?;
                    return Err(ErrorCode::UserCanceled);
                }

                let hint = snapshot.optimize_operation(op);
                let data_length = op.data_length.unwrap_or(0);
                match hint {
                    OperationHint::Skip => {
                        parser.skip_hashed(data_length).await?;
                    }
                    OperationHint::Apply => {
                        let blob = if data_length > 0 {
                            Some(parser.read_operation_blob(data_length).await?)
                        } else {
                            None
                        };
                        let mut source_handle = if !op.src_extents.is_empty() {
                            Some(self.opener.open(&device).await?)
                        } else {
                            None
                        };
                        let source: Option<&mut dyn SourceReader> = match &mut source_handle {
                            Some(h) => Some(&mut **h),
                            None => None,
                        };
                        executor::apply_operation(
                            op_index,
                            op,
                            blob.as_deref(),
                            manifest.block_size().into(),
                            source,
                            &mut *handle,
                        )
                        .await?;
                    }
                }

                next_data_offset += data_length;
                operations_applied += 1;
                self.save_checkpoint(partition_index, op_index + 1, expected_payload_hash, next_data_offset)?;
            }

            self.write_verity_and_fec(partition, manifest.block_size(), &mut *handle).await?;
            self.verify_partition_hash(partition, manifest.block_size(), &mut *handle).await?;
            partitions_applied += 1;
            self.save_checkpoint(partition_index + 1, 0, expected_payload_hash, next_data_offset)?;
        }

        self.set_state(PerformerState::Finalizing)?;
        let payload_signature_len = manifest.signatures_size.unwrap_or(0);
        parser
            .finish(
                payload_signature_len,
                self.payload_verifier,
                self.config.require_signatures,
                expected_payload_hash,
            )
            .await?;

        snapshot.finish_update()?;
        self.bootctl
            .set_active_boot_slot(target_slot)
            .map_err(|_| ErrorCode::KernelDeviceOpenError)?;

        self.set_state(PerformerState::Done)?;
        self.clear_checkpoint()?;

        Ok(PerformerOutcome {
            partitions_applied,
            operations_applied,
        })
    }

    async fn write_verity_and_fec(
        &self,
        partition: &PartitionUpdate,
        manifest_block_size: u32,
        handle: &mut dyn PartitionHandle,
    ) -> Result<()> {
        let (Some(data_extent), Some(tree_extent)) =
            (&partition.hash_tree_data_extent, &partition.hash_tree_extent)
        else {
            return Ok(());
        };
        if partition.hash_tree_algorithm() != HashTreeAlgorithm::Sha256 {
            return Err(ErrorCode::VerityCalculationError(
                "only the SHA-256 hash-tree algorithm is supported".to_string(),
            ));
        }
        self.set_state(PerformerState::WritingVerity)?;

        let block_size = manifest_block_size as u64;
        let data_bytes = handle.read_extents(std::slice::from_ref(data_extent), block_size).await?;
        let salt = partition.hash_tree_salt.clone().unwrap_or_default();

        let mut writer = VerityWriter::new(data_extent.blocks(), block_size, salt, partition.fec_roots);
        writer.update(0, &data_bytes)?;
        // First call only builds the tree: `fec_source` isn't set yet, so
        // this returns before touching FEC even when `fec_roots` is set.
        writer.incremental_finalize(1)?;
        let tree = writer
            .verity_tree()
            .ok_or_else(|| ErrorCode::VerityCalculationError("hash tree did not finalize".to_string()))?;
        let tree_bytes = tree.to_bytes();
        handle
            .write_extents(std::slice::from_ref(tree_extent), block_size, &tree_bytes)
            .await?;

        if let (Some(fec_data_extent), Some(fec_extent)) = (&partition.fec_data_extent, &partition.fec_extent) {
            let union = handle
                .read_extents(std::slice::from_ref(fec_data_extent), block_size)
                .await?;
            writer.begin_fec(union);
            while !writer.incremental_finalize(64)? {}
            let fec_bytes = writer.fec_bytes();
            handle
                .write_extents(std::slice::from_ref(fec_extent), block_size, &fec_bytes)
                .await?;
        }

        Ok(())
    }

    async fn verify_partition_hash(
        &self,
        partition: &PartitionUpdate,
        manifest_block_size: u32,
        handle: &mut dyn PartitionHandle,
    ) -> Result<()> {
        let Some(info) = partition.new_partition_info.as_ref() else {
            return Ok(());
        };
        let Some(expected) = info.hash.as_ref() else {
            return Ok(());
        };
        let block_size = manifest_block_size as u64;

        // `new_partition_info.hash` covers the whole partition image —
        // data blocks plus, for a verity-bearing partition, the hash-tree
        // and FEC regions `write_verity_and_fec` just wrote, which lie
        // outside every operation's `dst_extents`. Read back the full
        // image by block count rather than just the operation
        // destinations, which for a verity partition cover only the data
        // prefix. Fall back to the `dst_extents` union when the manifest
        // doesn't carry a partition size to compute that from.
        let extents: Vec<Extent> = match info.size {
            Some(size) if size > 0 => vec![Extent {
                start_block: Some(0),
                num_blocks: Some(size.div_ceil(block_size.max(1))),
            }],
            _ => partition.operations.iter().flat_map(|op| op.dst_extents.clone()).collect(),
        };
        if extents.is_empty() {
            return Ok(());
        }
        let data = handle.read_extents(&extents, block_size).await?;
        let actual = Sha256::digest(&data);
        if actual.as_slice() != expected.as_slice() {
            return Err(ErrorCode::NewRootfsVerificationError(partition.partition_name.clone()));
        }
        Ok(())
    }
}
