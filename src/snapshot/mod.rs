//! Dynamic Partition / Snapshot Controller (C5): tracks the super-partition
//! group budget across an update, decides whether an operation can be
//! skipped under copy-on-write snapshotting, and drives the
//! prepare → write → finish → merge lifecycle.
//!
//! Persistence is grounded on the same mechanism as everything else that
//! must survive a restart: the C1 `PreferenceStore`, under the `snapshot/`
//! namespace, the way `bootctl`'s active-slot bookkeeping and the
//! performer's operation cursor both persist through it too.

use crate::error::ErrorCode;
use crate::prefs::PreferenceStore;
use crate::proto::{
    DeltaArchiveManifest, InstallOperation, extent_list_blocks, install_operation::Type as OpType,
};
use std::collections::HashMap;

pub type Result<T> = std::result::Result<T, ErrorCode>;

const KEY_STATE: &str = "snapshot/state";
const KEY_RETROFIT: &str = "snapshot/retrofit";
const KEY_PARTITIONS: &str = "snapshot/partitions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Idle,
    Prepared,
    Writing,
    Finished,
    Merging,
    Cancelled,
}

impl SnapshotState {
    fn as_str(self) -> &'static str {
        match self {
            SnapshotState::Idle => "idle",
            SnapshotState::Prepared => "prepared",
            SnapshotState::Writing => "writing",
            SnapshotState::Finished => "finished",
            SnapshotState::Merging => "merging",
            SnapshotState::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "idle" => SnapshotState::Idle,
            "prepared" => SnapshotState::Prepared,
            "writing" => SnapshotState::Writing,
            "finished" => SnapshotState::Finished,
            "merging" => SnapshotState::Merging,
            "cancelled" => SnapshotState::Cancelled,
            _ => return None,
        })
    }

    /// Spec's lifecycle: `Idle -> Prepared -> Writing -> Finished ->
    /// (Merging -> Idle) | (Cancelled -> Idle)`, plus cancellation being
    /// reachable from any in-progress state.
    fn can_transition_to(self, next: SnapshotState) -> bool {
        use SnapshotState::*;
        matches!(
            (self, next),
            (Idle, Prepared)
                | (Prepared, Writing)
                | (Prepared, Cancelled)
                | (Writing, Finished)
                | (Writing, Cancelled)
                | (Finished, Merging)
                | (Finished, Cancelled)
                | (Merging, Idle)
                | (Cancelled, Idle)
        )
    }
}

/// Whether an operation still needs to be executed against the target
/// extents, or can be skipped because snapshotting already makes it a
/// no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationHint {
    Apply,
    Skip,
}

pub struct SnapshotController<'a> {
    prefs: &'a dyn PreferenceStore,
    retrofit: bool,
}

impl<'a> SnapshotController<'a> {
    /// `retrofit` marks a device whose super partition was added after
    /// launch (A/B retrofit), which spec §5 calls out as a distinct
    /// capability flag: retrofit devices cannot snapshot in place and
    /// always report every `SOURCE_COPY` as `Apply`.
    pub fn new(prefs: &'a dyn PreferenceStore, retrofit: bool) -> Self {
        Self { prefs, retrofit }
    }

    pub fn state(&self) -> SnapshotState {
        self.prefs
            .get_string(KEY_STATE)
            .ok()
            .flatten()
            .and_then(|s| SnapshotState::parse(&s))
            .unwrap_or(SnapshotState::Idle)
    }

    pub fn is_retrofit(&self) -> bool {
        self.retrofit
    }

    fn transition(&self, next: SnapshotState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(ErrorCode::DeviceCorrupted(format!(
                "invalid snapshot transition {:?} -> {:?}",
                current, next
            )));
        }
        self.prefs.set_string(KEY_STATE, next.as_str())
    }

    /// Validates that every dynamic-partition group's member partitions fit
    /// within the group's declared `size` budget, then moves `Idle ->
    /// Prepared` and persists the partition-name roster so a restart can
    /// recover the scope of an in-progress update.
    pub fn prepare_partitions_for_update(&self, manifest: &DeltaArchiveManifest) -> Result<()> {
        let Some(dynamic) = manifest.dynamic_partition_metadata.as_ref() else {
            self.transition(SnapshotState::Prepared)?;
            return Ok(());
        };

        let sizes: HashMap<&str, u64> = manifest
            .partitions
            .iter()
            .filter_map(|p| {
                p.new_partition_info
                    .as_ref()
                    .and_then(|info| info.size)
                    .map(|size| (p.partition_name.as_str(), size))
            })
            .collect();

        for group in &dynamic.groups {
            let used: u64 = group
                .partition_names
                .iter()
                .filter_map(|name| sizes.get(name.as_str()))
                .sum();
            let budget = group.size.unwrap_or(0);
            if used > budget {
                return Err(ErrorCode::NotEnoughSpace {
                    needed: used,
                    available: budget,
                });
            }
        }

        let roster = manifest
            .partitions
            .iter()
            .map(|p| p.partition_name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.prefs.set_string(KEY_PARTITIONS, &roster)?;
        self.prefs.set_bool(KEY_RETROFIT, self.retrofit)?;
        self.transition(SnapshotState::Prepared)
    }

    pub fn begin_writing(&self) -> Result<()> {
        self.transition(SnapshotState::Writing)
    }

    /// The device node (or, in this environment, its synthetic path) a
    /// `TargetWriter`/`SourceReader` should open for `partition_name`.
    /// Real device-mapper snapshot naming isn't reproducible outside a
    /// booted device, so this returns the plain mapper-style path real
    /// builds resolve to; a test harness substitutes its own paths.
    pub fn get_partition_device(&self, partition_name: &str) -> Result<String> {
        let roster = self.prefs.get_string(KEY_PARTITIONS)?.unwrap_or_default();
        if !roster.split(',').any(|n| n == partition_name) {
            return Err(ErrorCode::InstallDeviceOpenError(partition_name.to_string()));
        }
        Ok(format!("/dev/block/mapper/{partition_name}"))
    }

    /// `SOURCE_COPY` is a no-op under snapshotting when the source and
    /// destination extents cover the same blocks in the same order: the COW
    /// layer already sees that data through the snapshot, so the Executor
    /// can skip the copy entirely. Every other operation, and every
    /// `SOURCE_COPY` on a retrofit device (no snapshot to ride on), must
    /// still be applied.
    pub fn optimize_operation(&self, op: &InstallOperation) -> OperationHint {
        if self.retrofit {
            return OperationHint::Apply;
        }
        if op.r#type() != OpType::SourceCopy {
            return OperationHint::Apply;
        }
        if op.src_extents.len() != op.dst_extents.len() {
            return OperationHint::Apply;
        }
        let same = op.src_extents.iter().zip(op.dst_extents.iter()).all(|(s, d)| {
            s.start() == d.start() && s.blocks() == d.blocks()
        });
        if same && extent_list_blocks(&op.src_extents) > 0 {
            OperationHint::Skip
        } else {
            OperationHint::Apply
        }
    }

    pub fn finish_update(&self) -> Result<()> {
        self.transition(SnapshotState::Finished)
    }

    pub fn cancel_update(&self) -> Result<()> {
        self.transition(SnapshotState::Cancelled)?;
        self.prefs.delete(KEY_PARTITIONS)?;
        self.transition(SnapshotState::Idle)
    }

    /// Drives the COW merge to completion. There's no real device-mapper
    /// merge target in this environment to poll, so this reports the
    /// operation count as the unit of progress and completes in one call;
    /// a platform integration would instead poll `dm-snapshot`'s merge
    /// percentage and call this repeatedly.
    pub fn merge_snapshots(&self, manifest: &DeltaArchiveManifest) -> Result<usize> {
        self.transition(SnapshotState::Merging)?;
        let merge_op_count: usize = manifest
            .partitions
            .iter()
            .map(|p| p.merge_operations.len())
            .sum();
        self.prefs.delete(KEY_PARTITIONS)?;
        self.transition(SnapshotState::Idle)?;
        Ok(merge_op_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::MemoryStore;
    use crate::proto::{
        DynamicPartitionGroup, DynamicPartitionMetadata, Extent, PartitionInfo, PartitionUpdate,
    };

    fn manifest_with_group(budget: u64, sizes: &[(&str, u64)]) -> DeltaArchiveManifest {
        let partitions = sizes
            .iter()
            .map(|(name, size)| PartitionUpdate {
                partition_name: name.to_string(),
                new_partition_info: Some(PartitionInfo {
                    size: Some(*size),
                    hash: None,
                }),
                ..Default::default()
            })
            .collect();
        DeltaArchiveManifest {
            dynamic_partition_metadata: Some(DynamicPartitionMetadata {
                groups: vec![DynamicPartitionGroup {
                    name: "group_a".to_string(),
                    size: Some(budget),
                    partition_names: sizes.iter().map(|(n, _)| n.to_string()).collect(),
                }],
                ..Default::default()
            }),
            partitions,
            ..Default::default()
        }
    }

    #[test]
    fn prepare_rejects_over_budget_group() {
        let store = MemoryStore::new();
        let controller = SnapshotController::new(&store, false);
        let manifest = manifest_with_group(100, &[("system", 60), ("vendor", 60)]);
        let err = controller.prepare_partitions_for_update(&manifest).unwrap_err();
        assert!(matches!(err, ErrorCode::NotEnoughSpace { .. }));
        assert_eq!(controller.state(), SnapshotState::Idle);
    }

    #[test]
    fn full_lifecycle_round_trips_through_idle() {
        let store = MemoryStore::new();
        let controller = SnapshotController::new(&store, false);
        let manifest = manifest_with_group(200, &[("system", 60), ("vendor", 60)]);

        controller.prepare_partitions_for_update(&manifest).unwrap();
        assert_eq!(controller.state(), SnapshotState::Prepared);
        assert_eq!(
            controller.get_partition_device("system").unwrap(),
            "/dev/block/mapper/system"
        );

        controller.begin_writing().unwrap();
        controller.finish_update().unwrap();
        assert_eq!(controller.state(), SnapshotState::Finished);

        let merged = controller.merge_snapshots(&manifest).unwrap();
        assert_eq!(merged, 0);
        assert_eq!(controller.state(), SnapshotState::Idle);
    }

    #[test]
    fn cancel_returns_to_idle_from_writing() {
        let store = MemoryStore::new();
        let controller = SnapshotController::new(&store, false);
        let manifest = manifest_with_group(200, &[("system", 60)]);
        controller.prepare_partitions_for_update(&manifest).unwrap();
        controller.begin_writing().unwrap();
        controller.cancel_update().unwrap();
        assert_eq!(controller.state(), SnapshotState::Idle);
        assert!(controller.get_partition_device("system").is_err());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let store = MemoryStore::new();
        let controller = SnapshotController::new(&store, false);
        let err = controller.begin_writing().unwrap_err();
        assert!(matches!(err, ErrorCode::DeviceCorrupted(_)));
    }

    #[test]
    fn identity_source_copy_is_skipped_under_snapshot() {
        let store = MemoryStore::new();
        let controller = SnapshotController::new(&store, false);
        let op = InstallOperation {
            r#type: OpType::SourceCopy as i32,
            src_extents: vec![Extent {
                start_block: Some(10),
                num_blocks: Some(4),
            }],
            dst_extents: vec![Extent {
                start_block: Some(10),
                num_blocks: Some(4),
            }],
            ..Default::default()
        };
        assert_eq!(controller.optimize_operation(&op), OperationHint::Skip);
    }

    #[test]
    fn source_copy_with_moved_blocks_still_applies() {
        let store = MemoryStore::new();
        let controller = SnapshotController::new(&store, false);
        let op = InstallOperation {
            r#type: OpType::SourceCopy as i32,
            src_extents: vec![Extent {
                start_block: Some(10),
                num_blocks: Some(4),
            }],
            dst_extents: vec![Extent {
                start_block: Some(20),
                num_blocks: Some(4),
            }],
            ..Default::default()
        };
        assert_eq!(controller.optimize_operation(&op), OperationHint::Apply);
    }

    #[test]
    fn retrofit_devices_never_skip_source_copy() {
        let store = MemoryStore::new();
        let controller = SnapshotController::new(&store, true);
        let op = InstallOperation {
            r#type: OpType::SourceCopy as i32,
            src_extents: vec![Extent {
                start_block: Some(10),
                num_blocks: Some(4),
            }],
            dst_extents: vec![Extent {
                start_block: Some(10),
                num_blocks: Some(4),
            }],
            ..Default::default()
        };
        assert_eq!(controller.optimize_operation(&op), OperationHint::Apply);
    }
}
