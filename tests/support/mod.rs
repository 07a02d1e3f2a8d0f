//! In-memory doubles for the txn processor, the cluster RPC surface, and
//! the external subsystems.
#![allow(dead_code)]

use parking_lot::Mutex;
use shardherd::{
    Address, AuditId, AuditPhase, AuditRequest, AuditState, AuditType, ClusterInterface,
    DatabaseConfig, DcId, DistributorError, InitialDistribution, MoveId,
    MoveKeysLock, PinFuture, QueueContext, RangeLocations, RelocateShard, Result, ServerId,
    ShardMetric, SnapUid, StorageServerInfo, Subsystems, TeamCollectionHandle, TeamContext,
    TenantCache, TrackerContext, TxnProcessor, WiggleMetrics, WiggleState, WorkerInfo, WorkerRole,
};
use shardherd::{Key, KeyRange};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

pub fn boxed<F, T>(future: F) -> PinFuture<T>
where
    F: Future<Output = T> + Send + 'static,
{
    Box::pin(future)
}

pub fn range(begin: &str, end: &str) -> KeyRange {
    KeyRange::new(Key::from(begin), Key::from(end))
}

/// Polls `predicate` until it holds or the deadline passes.
pub async fn wait_until(predicate: impl Fn() -> bool, deadline: Duration) {
    let start = std::time::Instant::now();
    while !predicate() {
        if start.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------
// Txn processor double
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AuditQueryBehavior {
    /// One Invalid sub-state covering the whole requested range.
    Normal,
    /// Never resolves; keeps the audit running.
    Hang,
}

pub struct MockTxn {
    pub config: Mutex<DatabaseConfig>,
    pub initial: Mutex<InitialDistribution>,
    enabled: watch::Sender<bool>,
    pub lose_lock: Mutex<bool>,
    pub take_lock_count: Mutex<usize>,
    pub config_change: Arc<Notify>,
    pub audit_store: Mutex<HashMap<(AuditType, AuditId), AuditState>>,
    next_audit_id: Mutex<u64>,
    pub audit_query_behavior: Mutex<AuditQueryBehavior>,
    pub cleared_tombstones: Mutex<Vec<Vec<MoveId>>>,
    pub fail_clear_tombstones: Mutex<bool>,
    pub write_recovery_history: Mutex<Vec<bool>>,
    pub removed_keys: Mutex<Vec<(ServerId, Vec<ServerId>)>>,
    pub removed_servers: Mutex<Vec<ServerId>>,
    pub wiggle_metrics: Mutex<HashMap<bool, WiggleMetrics>>,
    pub replica_keys_updates: Mutex<usize>,
}

impl MockTxn {
    pub fn new(config: DatabaseConfig, initial: InitialDistribution) -> Arc<Self> {
        let (enabled, _) = watch::channel(true);
        Arc::new(MockTxn {
            config: Mutex::new(config),
            initial: Mutex::new(initial),
            enabled,
            lose_lock: Mutex::new(false),
            take_lock_count: Mutex::new(0),
            config_change: Arc::new(Notify::new()),
            audit_store: Mutex::new(HashMap::new()),
            next_audit_id: Mutex::new(0),
            audit_query_behavior: Mutex::new(AuditQueryBehavior::Normal),
            cleared_tombstones: Mutex::new(Vec::new()),
            fail_clear_tombstones: Mutex::new(false),
            write_recovery_history: Mutex::new(Vec::new()),
            removed_keys: Mutex::new(Vec::new()),
            removed_servers: Mutex::new(Vec::new()),
            wiggle_metrics: Mutex::new(HashMap::new()),
            replica_keys_updates: Mutex::new(0),
        })
    }

    pub fn set_enabled(&self, value: bool) {
        self.enabled.send_replace(value);
    }

    pub fn durable_audit(&self, audit_type: AuditType, id: AuditId) -> Option<AuditState> {
        self.audit_store.lock().get(&(audit_type, id)).cloned()
    }

    fn progress_states(&self, audit_type: AuditType, id: AuditId, range: KeyRange) -> PinFuture<Result<Vec<AuditState>>> {
        let behavior = *self.audit_query_behavior.lock();
        boxed(async move {
            if behavior == AuditQueryBehavior::Hang {
                std::future::pending::<()>().await;
            }
            Ok(vec![AuditState { id, audit_type, range, phase: AuditPhase::Invalid }])
        })
    }
}

impl TxnProcessor for MockTxn {
    fn take_move_keys_lock(&self, owner: ServerId) -> PinFuture<Result<MoveKeysLock>> {
        let mut count = self.take_lock_count.lock();
        *count += 1;
        let lock = MoveKeysLock { my_owner: owner.0, prev_owner: 0, prev_write: *count as u64 };
        boxed(async move { Ok(lock) })
    }

    fn poll_move_keys_lock(&self, _lock: MoveKeysLock) -> PinFuture<Result<()>> {
        let lost = *self.lose_lock.lock();
        boxed(async move {
            if lost {
                Err(DistributorError::MoveKeysConflict)
            } else {
                Ok(())
            }
        })
    }

    fn database_configuration(&self) -> PinFuture<Result<DatabaseConfig>> {
        let config = self.config.lock().clone();
        boxed(async move { Ok(config) })
    }

    fn update_replica_keys(
        &self,
        _primary: Option<DcId>,
        _remote: Option<DcId>,
        _config: DatabaseConfig,
    ) -> PinFuture<Result<()>> {
        *self.replica_keys_updates.lock() += 1;
        boxed(async move { Ok(()) })
    }

    fn initial_distribution(
        &self,
        _lock: MoveKeysLock,
        _remote_dcs: Vec<DcId>,
    ) -> PinFuture<Result<InitialDistribution>> {
        let initial = self.initial.lock().clone();
        boxed(async move { Ok(initial) })
    }

    fn is_distribution_enabled(&self) -> PinFuture<Result<bool>> {
        let enabled = *self.enabled.borrow();
        boxed(async move { Ok(enabled) })
    }

    fn wait_distribution_enabled(&self) -> PinFuture<Result<()>> {
        let mut rx = self.enabled.subscribe();
        boxed(async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return Err(DistributorError::BrokenPromise);
                }
            }
            Ok(())
        })
    }

    fn watch_config_change(&self) -> PinFuture<Result<()>> {
        let notify = self.config_change.clone();
        boxed(async move {
            notify.notified().await;
            Ok(())
        })
    }

    fn remove_keys_from_failed_server(
        &self,
        server: ServerId,
        backup_team: Vec<ServerId>,
        _lock: MoveKeysLock,
    ) -> PinFuture<Result<()>> {
        self.removed_keys.lock().push((server, backup_team));
        boxed(async move { Ok(()) })
    }

    fn remove_storage_server(
        &self,
        server: ServerId,
        _tss_pair: Option<ServerId>,
        _lock: MoveKeysLock,
    ) -> PinFuture<Result<()>> {
        self.removed_servers.lock().push(server);
        boxed(async move { Ok(()) })
    }

    fn persist_audit_state(&self, state: AuditState, _lock: MoveKeysLock) -> PinFuture<Result<()>> {
        // Round-trip through the wire encoding, as the real gateway does.
        let bytes = serde_json::to_vec(&state).unwrap();
        let state: AuditState = serde_json::from_slice(&bytes).unwrap();
        self.audit_store.lock().insert((state.audit_type, state.id), state);
        boxed(async move { Ok(()) })
    }

    fn persist_new_audit_state(
        &self,
        mut state: AuditState,
        _lock: MoveKeysLock,
    ) -> PinFuture<Result<AuditId>> {
        let mut next = self.next_audit_id.lock();
        *next += 1;
        let id = AuditId(*next);
        state.id = id;
        self.audit_store.lock().insert((state.audit_type, id), state);
        boxed(async move { Ok(id) })
    }

    fn audit_states_by_range(
        &self,
        audit_type: AuditType,
        id: AuditId,
        range: KeyRange,
    ) -> PinFuture<Result<Vec<AuditState>>> {
        self.progress_states(audit_type, id, range)
    }

    fn audit_states_by_server(
        &self,
        audit_type: AuditType,
        id: AuditId,
        _server: ServerId,
        range: KeyRange,
    ) -> PinFuture<Result<Vec<AuditState>>> {
        self.progress_states(audit_type, id, range)
    }

    fn clear_data_moves(&self, ids: Vec<MoveId>) -> PinFuture<Result<()>> {
        let fail = *self.fail_clear_tombstones.lock();
        if !fail {
            self.cleared_tombstones.lock().push(ids);
        }
        boxed(async move {
            if fail {
                Err(DistributorError::OperationFailed)
            } else {
                Ok(())
            }
        })
    }

    fn set_write_recovery_flag(&self, enabled: bool) -> PinFuture<Result<()>> {
        self.write_recovery_history.lock().push(enabled);
        boxed(async move { Ok(()) })
    }

    fn load_wiggle_metrics(&self, primary: bool) -> PinFuture<Result<WiggleMetrics>> {
        let metrics = self.wiggle_metrics.lock().get(&primary).cloned().unwrap_or_default();
        boxed(async move { Ok(metrics) })
    }

    fn store_wiggle_metrics(&self, primary: bool, metrics: WiggleMetrics) -> PinFuture<Result<()>> {
        self.wiggle_metrics.lock().insert(primary, metrics);
        boxed(async move { Ok(()) })
    }
}

// ---------------------------------------------------------------------
// Cluster double
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AuditRpcBehavior {
    Succeed,
    /// The server reports a data-level inconsistency.
    Inconsistent,
    /// Retryable failure at the audit level.
    Fail,
    Hang,
}

pub struct MockCluster {
    pub storage: Mutex<Vec<StorageServerInfo>>,
    pub workers: Mutex<Vec<WorkerInfo>>,
    pub tlogs: Mutex<Vec<Address>>,
    pub coordinators: Mutex<Vec<Address>>,
    pub master_dc: Mutex<Option<DcId>>,
    pub range_primary: Mutex<Vec<StorageServerInfo>>,
    pub range_remotes: Mutex<Vec<(DcId, Vec<StorageServerInfo>)>>,
    pub audit_behavior: Mutex<AuditRpcBehavior>,
    pub audit_calls: Mutex<Vec<(ServerId, AuditRequest)>>,
    pub snap_calls: Mutex<Vec<(Address, WorkerRole, SnapUid)>>,
    pub fail_snap: Mutex<HashSet<(Address, WorkerRole)>>,
    pub maybe_delivered: Mutex<HashMap<Address, usize>>,
    pub hang_roles: Mutex<HashSet<WorkerRole>>,
    pub fail_disable_pop: Mutex<bool>,
    /// true = pops enabled.
    pub pop_state: Mutex<HashMap<Address, bool>>,
    pub blob_restores: Mutex<Vec<(ServerId, KeyRange)>>,
    pub recovery: Arc<Notify>,
}

impl Default for MockCluster {
    fn default() -> Self {
        MockCluster {
            storage: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            tlogs: Mutex::new(Vec::new()),
            coordinators: Mutex::new(Vec::new()),
            master_dc: Mutex::new(None),
            range_primary: Mutex::new(Vec::new()),
            range_remotes: Mutex::new(Vec::new()),
            audit_behavior: Mutex::new(AuditRpcBehavior::Succeed),
            audit_calls: Mutex::new(Vec::new()),
            snap_calls: Mutex::new(Vec::new()),
            fail_snap: Mutex::new(HashSet::new()),
            maybe_delivered: Mutex::new(HashMap::new()),
            hang_roles: Mutex::new(HashSet::new()),
            fail_disable_pop: Mutex::new(false),
            pop_state: Mutex::new(HashMap::new()),
            blob_restores: Mutex::new(Vec::new()),
            recovery: Arc::new(Notify::new()),
        }
    }
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(MockCluster::default())
    }

    pub fn audit_call_count(&self) -> usize {
        self.audit_calls.lock().len()
    }

    pub fn snap_calls_for_role(&self, role: WorkerRole) -> Vec<(Address, SnapUid)> {
        self.snap_calls
            .lock()
            .iter()
            .filter(|(_, r, _)| *r == role)
            .map(|(a, _, u)| (*a, *u))
            .collect()
    }

    pub fn all_pops_enabled(&self) -> bool {
        self.pop_state.lock().values().all(|enabled| *enabled)
    }
}

pub fn server(id: u64, address: u64) -> StorageServerInfo {
    StorageServerInfo {
        id: ServerId(id),
        address: Address(address),
        secondary_address: None,
        dc: None,
        is_tss: false,
    }
}

impl ClusterInterface for MockCluster {
    fn storage_servers(&self) -> PinFuture<Result<Vec<StorageServerInfo>>> {
        let servers = self.storage.lock().clone();
        boxed(async move { Ok(servers) })
    }

    fn workers(&self) -> PinFuture<Result<Vec<WorkerInfo>>> {
        let workers = self.workers.lock().clone();
        boxed(async move { Ok(workers) })
    }

    fn local_tlogs(&self) -> PinFuture<Result<Vec<Address>>> {
        let tlogs = self.tlogs.lock().clone();
        boxed(async move { Ok(tlogs) })
    }

    fn coordinators(&self) -> PinFuture<Result<Vec<Address>>> {
        let coordinators = self.coordinators.lock().clone();
        boxed(async move { Ok(coordinators) })
    }

    fn master_dc(&self) -> PinFuture<Result<Option<DcId>>> {
        let dc = self.master_dc.lock().clone();
        boxed(async move { Ok(dc) })
    }

    fn disable_tlog_pop(&self, tlog: Address, _uid: SnapUid) -> PinFuture<Result<()>> {
        let fail = *self.fail_disable_pop.lock();
        if !fail {
            self.pop_state.lock().insert(tlog, false);
        }
        boxed(async move {
            if fail {
                Err(DistributorError::OperationFailed)
            } else {
                Ok(())
            }
        })
    }

    fn enable_tlog_pop(&self, tlog: Address, _uid: SnapUid) -> PinFuture<Result<()>> {
        self.pop_state.lock().insert(tlog, true);
        boxed(async move { Ok(()) })
    }

    fn snapshot_worker(
        &self,
        worker: Address,
        role: WorkerRole,
        uid: SnapUid,
        _payload: String,
    ) -> PinFuture<Result<()>> {
        self.snap_calls.lock().push((worker, role, uid));
        {
            let mut maybe = self.maybe_delivered.lock();
            if let Some(remaining) = maybe.get_mut(&worker) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return boxed(async move { Err(DistributorError::RequestMaybeDelivered) });
                }
            }
        }
        let hang = self.hang_roles.lock().contains(&role);
        let fail = self.fail_snap.lock().contains(&(worker, role));
        boxed(async move {
            if hang {
                std::future::pending::<()>().await;
            }
            if fail {
                Err(DistributorError::OperationFailed)
            } else {
                Ok(())
            }
        })
    }

    fn audit_storage(
        &self,
        server: ServerId,
        request: AuditRequest,
    ) -> PinFuture<Result<AuditState>> {
        let behavior = *self.audit_behavior.lock();
        self.audit_calls.lock().push((server, request.clone()));
        boxed(async move {
            match behavior {
                AuditRpcBehavior::Succeed => Ok(AuditState {
                    id: request.id,
                    audit_type: request.audit_type,
                    range: request.range,
                    phase: AuditPhase::Complete,
                }),
                AuditRpcBehavior::Inconsistent => Err(DistributorError::AuditStorageError),
                AuditRpcBehavior::Fail => Err(DistributorError::OperationFailed),
                AuditRpcBehavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        })
    }

    fn source_server_interfaces_for_range(
        &self,
        range: KeyRange,
    ) -> PinFuture<Result<Vec<RangeLocations>>> {
        let primary = self.range_primary.lock().clone();
        let remotes = self.range_remotes.lock().clone();
        boxed(async move { Ok(vec![RangeLocations { range, primary, remotes }]) })
    }

    fn on_recovery_change(&self) -> PinFuture<()> {
        let recovery = self.recovery.clone();
        boxed(async move {
            recovery.notified().await;
        })
    }

    fn prepare_blob_restore(
        &self,
        _ssi: StorageServerInfo,
        keys: KeyRange,
        requester: ServerId,
    ) -> PinFuture<Result<()>> {
        self.blob_restores.lock().push((requester, keys));
        // Keep the enablement latch observably held while the generation
        // tears down, as the real preparation transactions would.
        boxed(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------
// Subsystem doubles
// ---------------------------------------------------------------------

pub struct StubTeamCollection {
    pub team_count: Mutex<usize>,
    pub healthy_team: Mutex<Vec<ServerId>>,
    pub safety_verdict: Mutex<bool>,
    pub safety_queries: Mutex<Vec<Vec<ServerId>>>,
    pub wiggle: Mutex<(WiggleState, Duration)>,
}

impl Default for StubTeamCollection {
    fn default() -> Self {
        StubTeamCollection {
            team_count: Mutex::new(2),
            healthy_team: Mutex::new(vec![ServerId(1), ServerId(2)]),
            safety_verdict: Mutex::new(true),
            safety_queries: Mutex::new(Vec::new()),
            wiggle: Mutex::new((WiggleState::Run, Duration::from_secs(1))),
        }
    }
}

impl TeamCollectionHandle for StubTeamCollection {
    fn team_count(&self) -> usize {
        *self.team_count.lock()
    }

    fn random_healthy_team(&self, exclude: ServerId) -> Vec<ServerId> {
        self.healthy_team.lock().iter().copied().filter(|id| *id != exclude).collect()
    }

    fn exclusion_safety_check(&self, excluded: Vec<ServerId>) -> bool {
        self.safety_queries.lock().push(excluded);
        *self.safety_verdict.lock()
    }

    fn wiggler_state(&self) -> (WiggleState, Duration) {
        *self.wiggle.lock()
    }
}

pub struct StubTenantCache {
    pub over_quota: Mutex<Vec<u64>>,
}

impl TenantCache for StubTenantCache {
    fn tenants_over_quota(&self) -> Vec<u64> {
        self.over_quota.lock().clone()
    }

    fn run_monitors(&self) -> PinFuture<Result<()>> {
        boxed(async move {
            std::future::pending::<()>().await;
            Ok(())
        })
    }
}

pub struct StubSubsystems {
    pub team: Arc<StubTeamCollection>,
    pub remote_team: Mutex<Option<Arc<StubTeamCollection>>>,
    pub shard_metrics: Arc<Mutex<Vec<ShardMetric>>>,
    pub relocations: Arc<Mutex<Vec<RelocateShard>>>,
    pub fail_primary_team_with: Arc<Mutex<Option<DistributorError>>>,
    pub tenants: Mutex<Option<Arc<StubTenantCache>>>,
    pub tracker_runs: Mutex<usize>,
}

impl Default for StubSubsystems {
    fn default() -> Self {
        StubSubsystems {
            team: Arc::new(StubTeamCollection::default()),
            remote_team: Mutex::new(None),
            shard_metrics: Arc::new(Mutex::new(Vec::new())),
            relocations: Arc::new(Mutex::new(Vec::new())),
            fail_primary_team_with: Arc::new(Mutex::new(None)),
            tenants: Mutex::new(None),
            tracker_runs: Mutex::new(0),
        }
    }
}

impl StubSubsystems {
    pub fn new() -> Arc<Self> {
        Arc::new(StubSubsystems::default())
    }

    pub fn relocation_log(&self) -> Vec<RelocateShard> {
        self.relocations.lock().clone()
    }
}

impl Subsystems for StubSubsystems {
    fn run_tracker(&self, ctx: TrackerContext) -> PinFuture<Result<()>> {
        *self.tracker_runs.lock() += 1;
        let metrics = self.shard_metrics.clone();
        boxed(async move {
            let mut ctx = ctx;
            ctx.ready.wait().await;
            while let Some(request) = ctx.metrics_requests.recv().await {
                let list: Vec<ShardMetric> = metrics
                    .lock()
                    .iter()
                    .filter(|metric| metric.keys.overlaps(&request.keys))
                    .take(request.shard_limit)
                    .cloned()
                    .collect();
                let _ = request.reply.send(Ok(list));
            }
            std::future::pending::<()>().await;
            Ok(())
        })
    }

    fn run_queue(&self, ctx: QueueContext) -> PinFuture<Result<()>> {
        let sink = self.relocations.clone();
        boxed(async move {
            let mut ctx = ctx;
            while let Some(item) = ctx.input.recv().await {
                sink.lock().push(item);
            }
            std::future::pending::<()>().await;
            Ok(())
        })
    }

    fn run_team_collection(&self, ctx: TeamContext) -> PinFuture<Result<()>> {
        let failure = self.fail_primary_team_with.clone();
        boxed(async move {
            ctx.ready.wait().await;
            if ctx.primary {
                let pending_failure = failure.lock().take();
                if let Some(err) = pending_failure {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    drop(ctx);
                    return Err(err);
                }
            }
            let _ctx = ctx;
            std::future::pending::<()>().await;
            Ok(())
        })
    }

    fn team_handle(&self, primary: bool) -> Option<Arc<dyn TeamCollectionHandle>> {
        if primary {
            Some(self.team.clone() as Arc<dyn TeamCollectionHandle>)
        } else {
            self.remote_team.lock().clone().map(|t| t as Arc<dyn TeamCollectionHandle>)
        }
    }

    fn tenant_cache(&self) -> Option<Arc<dyn TenantCache>> {
        self.tenants.lock().clone().map(|t| t as Arc<dyn TenantCache>)
    }
}
