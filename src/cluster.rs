//! The cluster RPC surface the audit engine and snapshot orchestrator
//! drive: worker enumeration, tlog pop control, snapshot and audit fan-out.
//!
//! Everything here is a capability trait; production wiring and the test
//! doubles both implement it.

use crate::audit::state::{AuditRequest, AuditState};
use crate::error::Result;
use crate::ids::{Address, DcId, ServerId, SnapUid};
use crate::keyspace::KeyRange;
use crate::util::PinFuture;
use serde::{Deserialize, Serialize};

/// One storage server as seen in the durable server list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerInfo {
    pub id: ServerId,
    pub address: Address,
    pub secondary_address: Option<Address>,
    pub dc: Option<DcId>,
    /// Testing storage servers are excluded from audit consistency checks.
    pub is_tss: bool,
}

/// A stateful worker process reachable for snapshot RPCs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: ServerId,
    pub address: Address,
}

/// The role a snapshot RPC addresses on a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerRole {
    Storage,
    Tlog,
    Coordinator,
}

impl WorkerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::Storage => "storage",
            WorkerRole::Tlog => "tlog",
            WorkerRole::Coordinator => "coord",
        }
    }
}

/// Hosting servers of one sub-range, primary region first.
#[derive(Clone, Debug)]
pub struct RangeLocations {
    pub range: KeyRange,
    pub primary: Vec<StorageServerInfo>,
    pub remotes: Vec<(DcId, Vec<StorageServerInfo>)>,
}

pub trait ClusterInterface: Send + Sync {
    fn storage_servers(&self) -> PinFuture<Result<Vec<StorageServerInfo>>>;
    fn workers(&self) -> PinFuture<Result<Vec<WorkerInfo>>>;
    fn local_tlogs(&self) -> PinFuture<Result<Vec<Address>>>;
    fn coordinators(&self) -> PinFuture<Result<Vec<Address>>>;
    fn master_dc(&self) -> PinFuture<Result<Option<DcId>>>;
    fn disable_tlog_pop(&self, tlog: Address, uid: SnapUid) -> PinFuture<Result<()>>;
    fn enable_tlog_pop(&self, tlog: Address, uid: SnapUid) -> PinFuture<Result<()>>;
    /// Sends one snapshot RPC; implementations may fail with
    /// `RequestMaybeDelivered`, which the orchestrator retries with the
    /// same uid so the worker sees an idempotent request.
    fn snapshot_worker(
        &self,
        worker: Address,
        role: WorkerRole,
        uid: SnapUid,
        payload: String,
    ) -> PinFuture<Result<()>>;
    /// Runs one audit request on a storage server and returns the audit
    /// state the server recorded.
    fn audit_storage(&self, server: ServerId, request: AuditRequest) -> PinFuture<Result<AuditState>>;
    /// Resolves `range` to its hosting servers, possibly partially; callers
    /// advance a cursor over the returned sub-ranges.
    fn source_server_interfaces_for_range(
        &self,
        range: KeyRange,
    ) -> PinFuture<Result<Vec<RangeLocations>>>;
    /// Resolves when a database recovery begins; snapshots cannot survive
    /// one. Implementations without recovery signalling never resolve.
    fn on_recovery_change(&self) -> PinFuture<()>;
    /// Registers the blob-migrator pseudo storage server and prepares the
    /// restore key range.
    fn prepare_blob_restore(
        &self,
        ssi: StorageServerInfo,
        keys: KeyRange,
        requester: ServerId,
    ) -> PinFuture<Result<()>>;
}
