//! Cluster-level data distribution supervisor for a replicated
//! transactional key-value store.
//!
//! The supervisor reconstructs shard placement from durable metadata under
//! the move-keys lock, replays in-flight work onto the relocation bus,
//! supervises storage audits and coordinated snapshots, and serves the
//! distributor's administrative request surface.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod api;
pub mod audit;
pub mod bus;
pub mod cluster;
pub mod collab;
pub mod config;
pub mod enabled;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod initial;
pub mod keyspace;
pub mod physical;
pub mod resume;
pub mod shard;
pub mod shards_affected;
pub mod snapshot;
pub mod supervisor;
pub mod telemetry;
pub mod util;
pub mod wiggle;

pub use api::{
    median_shard_size, BlobRestoreReply, DistributorRequest, MetricsReply, WigglerRegionState,
    WigglerStateReply, BLOB_MIGRATOR_ID,
};
pub use audit::state::{AuditPhase, AuditRequest, AuditState, AuditType};
pub use audit::{AuditEngine, DdAudit};
pub use bus::{channel as relocation_channel, yield_bridge, RelocationReceiver, RelocationSender};
pub use cluster::{ClusterInterface, RangeLocations, StorageServerInfo, WorkerInfo, WorkerRole};
pub use collab::{
    MetricsListRequest, QueueContext, ShardMetric, Subsystems, TeamCollectionHandle, TeamContext,
    TenantCache, TrackerContext, WiggleState,
};
pub use config::{
    DatabaseConfig, DistributorKnobs, RegionConfig, PRIORITY_RECOVER_MOVE, PRIORITY_SPLIT_SHARD,
    PRIORITY_TEAM_UNHEALTHY,
};
pub use enabled::{DdEnabledState, Owner};
pub use error::{DistributorError, Result};
pub use gateway::{DurableGateway, MoveKeysLock, TxnProcessor};
pub use ids::{Address, AuditId, DcId, MoveId, ServerId, SnapUid};
pub use initial::{InitialDistribution, RangeOverride};
pub use keyspace::{Key, KeyRange};
pub use physical::PhysicalShardCollection;
pub use resume::{resume_relocations, ResumeContext};
pub use shard::{DataMove, DataMoveMeta, MoveReason, RelocateShard, ShardDescriptor};
pub use shards_affected::{ShardsAffectedMap, Team};
pub use snapshot::{ResultLedger, SnapshotOrchestrator};
pub use supervisor::Supervisor;
pub use telemetry::{MetricsRegistry, MetricsSnapshot};
pub use util::{Gate, PinFuture, TaskGroup};
pub use wiggle::{ServerMetadata, StoreKind, WiggleEngine, WiggleError, WiggleMetrics};
