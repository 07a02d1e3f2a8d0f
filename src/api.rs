//! Typed request surface of the distributor's router, plus reply payloads.

use crate::audit::state::AuditType;
use crate::cluster::StorageServerInfo;
use crate::collab::{ShardMetric, WiggleState};
use crate::error::Result;
use crate::ids::{Address, AuditId, ServerId, SnapUid};
use crate::keyspace::KeyRange;
use std::time::Duration;
use tokio::sync::oneshot;

/// Well-known identity the blob migrator registers under; only it may ask
/// for blob-restore preparation.
pub const BLOB_MIGRATOR_ID: ServerId = ServerId(0x626d);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricsReply {
    List(Vec<ShardMetric>),
    MedianShardSize(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobRestoreReply {
    Success,
    ConflictBlobRestore,
    ConflictSnapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WigglerRegionState {
    pub state: WiggleState,
    pub last_state_change: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct WigglerStateReply {
    pub primary: Option<WigglerRegionState>,
    pub remote: Option<WigglerRegionState>,
}

/// Requests served by the supervisor's router.
pub enum DistributorRequest {
    /// Clean shutdown of the distributor role.
    Halt { requester: ServerId, reply: oneshot::Sender<()> },
    /// Per-shard metrics, or just the median shard size.
    Metrics {
        keys: KeyRange,
        shard_limit: usize,
        mid_only: bool,
        reply: oneshot::Sender<Result<MetricsReply>>,
    },
    /// Coordinated cluster snapshot, deduplicated on `uid`.
    Snapshot { uid: SnapUid, payload: String, reply: oneshot::Sender<Result<()>> },
    /// Whether excluding the given addresses keeps enough healthy teams.
    ExclusionSafetyCheck { exclusions: Vec<Address>, reply: oneshot::Sender<Result<bool>> },
    /// Per-region storage wiggler status.
    WigglerState { reply: oneshot::Sender<WigglerStateReply> },
    /// Starts (or joins) a storage audit.
    TriggerAudit {
        audit_type: AuditType,
        range: KeyRange,
        reply: oneshot::Sender<Result<AuditId>>,
    },
    /// Tenants exceeding their storage quota, when tenant-aware.
    TenantsOverQuota { reply: oneshot::Sender<Vec<u64>> },
    /// Idempotent blob-restore preparation.
    PrepareBlobRestore {
        ssi: StorageServerInfo,
        keys: KeyRange,
        requester: ServerId,
        reply: oneshot::Sender<Result<BlobRestoreReply>>,
    },
}

/// Median shard size by partial selection around the middle element; an
/// empty vector reads as zero.
pub fn median_shard_size(mut metrics: Vec<ShardMetric>) -> i64 {
    if metrics.is_empty() {
        return 0;
    }
    let mid = metrics.len() / 2;
    metrics.select_nth_unstable_by(mid, |a, b| a.shard_bytes.cmp(&b.shard_bytes));
    metrics[mid].shard_bytes
}
