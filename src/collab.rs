//! Contracts for the external subsystems a generation runs alongside: the
//! shard tracker, the relocation queue, and the per-region team
//! collections. The supervisor only knows these interfaces; production
//! implementations live outside this crate and tests supply doubles.

use crate::bus::{RelocationReceiver, RelocationSender};
use crate::error::Result;
use crate::gateway::MoveKeysLock;
use crate::ids::ServerId;
use crate::initial::InitialDistribution;
use crate::keyspace::KeyRange;
use crate::shards_affected::ShardsAffectedMap;
use crate::util::{Gate, PinFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Size metrics for one tracked shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardMetric {
    pub keys: KeyRange,
    pub shard_bytes: i64,
}

/// Metrics query forwarded from the router to the tracker.
pub struct MetricsListRequest {
    pub keys: KeyRange,
    pub shard_limit: usize,
    pub reply: oneshot::Sender<Result<Vec<ShardMetric>>>,
}

/// Wiggler lifecycle state reported per region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WiggleState {
    Invalid,
    Run,
    Pause,
}

/// Query surface of a running team collection; the supervisor holds a weak
/// handle that is absent before the generation finishes wiring.
pub trait TeamCollectionHandle: Send + Sync {
    fn team_count(&self) -> usize;
    /// A random healthy team that does not contain `exclude`, used to host
    /// ranges dropped from a failed server.
    fn random_healthy_team(&self, exclude: ServerId) -> Vec<ServerId>;
    fn exclusion_safety_check(&self, excluded: Vec<ServerId>) -> bool;
    fn wiggler_state(&self) -> (WiggleState, Duration);
}

pub struct TrackerContext {
    pub initial: Arc<InitialDistribution>,
    pub output: RelocationSender,
    pub shards_affected: Arc<ShardsAffectedMap>,
    pub ready: Gate,
    pub metrics_requests: mpsc::UnboundedReceiver<MetricsListRequest>,
}

pub struct QueueContext {
    pub input: RelocationReceiver,
    pub lock: MoveKeysLock,
    pub team_size: usize,
    pub single_region_team_size: usize,
}

pub struct TeamContext {
    pub primary: bool,
    pub initial: Arc<InitialDistribution>,
    pub output: RelocationSender,
    pub ready: Gate,
}

/// Tenant ids over their storage quota, when the deployment is
/// tenant-aware.
pub trait TenantCache: Send + Sync {
    fn tenants_over_quota(&self) -> Vec<u64>;
    /// Long-running quota/usage monitors for the generation to supervise.
    fn run_monitors(&self) -> PinFuture<Result<()>>;
}

/// Factory the supervisor uses to start the external subsystems of one
/// generation. Each `run_*` future lives for the generation and resolves
/// only with an error (or cancellation); a clean return is treated as
/// abnormal by the generation loop. A team collection that resolves
/// `RemoveFailedServer` asks the supervisor to run the failed-server
/// cleanup path.
pub trait Subsystems: Send + Sync {
    fn run_tracker(&self, ctx: TrackerContext) -> PinFuture<Result<()>>;
    fn run_queue(&self, ctx: QueueContext) -> PinFuture<Result<()>>;
    fn run_team_collection(&self, ctx: TeamContext) -> PinFuture<Result<()>>;
    /// The live handle for the given region, once its collection has
    /// started; `None` before the generation boundary.
    fn team_handle(&self, primary: bool) -> Option<Arc<dyn TeamCollectionHandle>>;
    fn tenant_cache(&self) -> Option<Arc<dyn TenantCache>>;
}
