//! Centralized tuning knobs and the database configuration the supervisor
//! bootstraps against.
//!
//! Keeping every timeout, retry budget, and parallelism limit in one place
//! makes it clear which subsystems share behaviour and gives tests a single
//! struct to override.

use crate::ids::DcId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Priority of a relocation scheduled to recover an in-flight move.
pub const PRIORITY_RECOVER_MOVE: i32 = 110;
/// Priority of a relocation repairing an under/over-replicated shard.
pub const PRIORITY_TEAM_UNHEALTHY: i32 = 700;
/// Priority of a relocation realigning a shard split across range overrides.
pub const PRIORITY_SPLIT_SHARD: i32 = 950;

#[derive(Clone, Debug)]
pub struct DistributorKnobs {
    /// How many in-flight moves a previous generation may leave behind; used
    /// by tests sizing resume scenarios and by the queue consumer.
    pub move_keys_parallelism: usize,
    /// Over-replicated shards tolerated before large-team recovery marks
    /// further shards unhealthy. Zero disables large-team recovery.
    pub max_shards_on_large_teams: usize,
    /// Whether shard location metadata carries physical-shard encoding.
    pub shard_encode_location_metadata: bool,
    /// Whether the physical-shard collection (and its monitor) is kept.
    pub enable_physical_shard: bool,
    /// Servers younger than this are not wiggled unless wrongly configured.
    pub wiggle_min_server_age: Duration,
    /// Smoothing factor for wiggle/round duration averages.
    pub wiggle_smoothing_alpha: f64,
    /// Maximum audit generations before an audit is marked `Failed`.
    pub audit_retry_count_max: u32,
    /// Pause between audit generations on retry.
    pub audit_retry_backoff: Duration,
    /// Spacing between scheduling audit children, to avoid request bursts.
    pub audit_child_spacing: Duration,
    /// Sustained-failure bound on a single storage-server audit RPC.
    pub audit_sustained_failure_timeout: Duration,
    /// Bound on one whole snapshot orchestration.
    pub snap_create_max_timeout: Duration,
    /// How long a finished snapshot result is retained for replay.
    pub snap_minimum_time_gap: Duration,
    /// Retries for a snapshot RPC that may or may not have been delivered.
    pub snap_network_retry_limit: usize,
    /// Base backoff for those retries; doubled per attempt.
    pub snap_retry_backoff: Duration,
    /// Storage-worker failures tolerated during a snapshot, before team-size
    /// and missing-worker adjustments.
    pub max_storage_snapshot_fault_tolerance: usize,
    /// Coordinator failures tolerated during a snapshot.
    pub max_coordinator_snapshot_fault_tolerance: usize,
    /// Cadence of move-keys lock validation.
    pub move_keys_lock_poll_interval: Duration,
    /// Cadence of the physical-shard status monitor.
    pub physical_shard_metrics_delay: Duration,
    /// Data-move tombstones cleared per transaction by the background sweep.
    pub tombstone_clear_batch: usize,
    /// Attempts for a durable-gateway transaction hitting conflicts.
    pub gateway_retry_limit: usize,
    /// Base backoff between gateway retries; grows exponentially.
    pub gateway_retry_backoff: Duration,
}

impl Default for DistributorKnobs {
    fn default() -> Self {
        Self {
            move_keys_parallelism: 20,
            max_shards_on_large_teams: 100,
            shard_encode_location_metadata: true,
            enable_physical_shard: false,
            wiggle_min_server_age: Duration::from_secs(21 * 24 * 3600),
            wiggle_smoothing_alpha: 0.3,
            audit_retry_count_max: 600,
            audit_retry_backoff: Duration::from_millis(100),
            audit_child_spacing: Duration::from_millis(100),
            audit_sustained_failure_timeout: Duration::from_secs(2),
            snap_create_max_timeout: Duration::from_secs(180),
            snap_minimum_time_gap: Duration::from_secs(5),
            snap_network_retry_limit: 10,
            snap_retry_backoff: Duration::from_millis(100),
            max_storage_snapshot_fault_tolerance: 1,
            max_coordinator_snapshot_fault_tolerance: 1,
            move_keys_lock_poll_interval: Duration::from_secs(5),
            physical_shard_metrics_delay: Duration::from_secs(30),
            tombstone_clear_batch: 100,
            gateway_retry_limit: 10,
            gateway_retry_backoff: Duration::from_millis(20),
        }
    }
}

impl DistributorKnobs {
    /// Large-team recovery emits relocations for unhealthy and split
    /// sub-ranges during resume.
    pub fn large_teams_enabled(&self) -> bool {
        self.max_shards_on_large_teams > 0
    }
}

/// One configured region; the first region is primary, the second remote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub dc_id: DcId,
}

/// The durable database configuration read at bootstrap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub storage_team_size: usize,
    pub usable_regions: usize,
    pub regions: Vec<RegionConfig>,
}

impl DatabaseConfig {
    pub fn single_region(team_size: usize) -> Self {
        DatabaseConfig { storage_team_size: team_size, usable_regions: 1, regions: Vec::new() }
    }

    pub fn primary_dc(&self) -> Option<DcId> {
        self.regions.first().map(|r| r.dc_id.clone())
    }

    pub fn remote_dc(&self) -> Option<DcId> {
        self.regions.get(1).map(|r| r.dc_id.clone())
    }

    pub fn multi_region(&self) -> bool {
        self.usable_regions > 1
    }
}
