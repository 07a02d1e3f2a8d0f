//! Snapshot orchestrator: the two-phase fan-out that quiesces tlogs,
//! snapshots storage, tlog, and coordinator workers, and resumes tlogs.
//!
//! The orchestrator is idempotent at two levels: a finished request's
//! result is replayed from a retention ledger, and an in-flight request
//! coalesces duplicates with the same payload. Snapshot RPCs reuse the
//! same uid across retries so workers see an idempotent request.

use crate::cluster::{ClusterInterface, WorkerInfo, WorkerRole};
use crate::config::DistributorKnobs;
use crate::enabled::{DdEnabledState, Owner};
use crate::error::{DistributorError, Result};
use crate::gateway::DurableGateway;
use crate::ids::{Address, SnapUid};
use crate::util::TaskGroup;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Finished-request results retained for replay, evicted after the
/// configured retention.
pub struct ResultLedger<T: Clone> {
    entries: HashMap<SnapUid, LedgerRecord<T>>,
    retention: Duration,
}

struct LedgerRecord<T: Clone> {
    response: T,
    stored_at: Instant,
}

impl<T: Clone> ResultLedger<T> {
    pub fn new(retention: Duration) -> Self {
        ResultLedger { entries: HashMap::new(), retention }
    }

    pub fn record(&mut self, key: SnapUid, response: T, now: Instant) {
        self.entries.insert(key, LedgerRecord { response, stored_at: now });
        self.evict(now);
    }

    pub fn get(&mut self, key: &SnapUid, now: Instant) -> Option<T> {
        self.evict(now);
        self.entries.get(key).map(|record| record.response.clone())
    }

    fn evict(&mut self, now: Instant) {
        self.entries
            .retain(|_, record| now.saturating_duration_since(record.stored_at) < self.retention);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct InFlightSnap {
    payload: String,
    replies: Vec<oneshot::Sender<Result<()>>>,
}

pub struct SnapshotOrchestrator {
    cluster: Arc<dyn ClusterInterface>,
    gateway: Arc<DurableGateway>,
    enabled: Arc<DdEnabledState>,
    knobs: Arc<DistributorKnobs>,
    in_flight: Mutex<HashMap<SnapUid, InFlightSnap>>,
    results: Mutex<ResultLedger<Result<()>>>,
}

impl SnapshotOrchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterInterface>,
        gateway: Arc<DurableGateway>,
        enabled: Arc<DdEnabledState>,
        knobs: Arc<DistributorKnobs>,
    ) -> Self {
        let retention = knobs.snap_minimum_time_gap;
        SnapshotOrchestrator {
            cluster,
            gateway,
            enabled,
            knobs,
            in_flight: Mutex::new(HashMap::new()),
            results: Mutex::new(ResultLedger::new(retention)),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Accepts one snapshot request. Finished uids replay their retained
    /// result; an in-flight uid coalesces when payloads match and is
    /// rejected as a duplicate when they differ; otherwise the
    /// orchestration starts on `tasks`.
    pub fn submit(
        self: &Arc<Self>,
        uid: SnapUid,
        payload: String,
        reply: oneshot::Sender<Result<()>>,
        tasks: &TaskGroup,
    ) {
        if let Some(result) = self.results.lock().get(&uid, Instant::now()) {
            info!("event=snapshot_replay_finished snap_uid={uid}");
            let _ = reply.send(result);
            return;
        }
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(entry) = in_flight.get_mut(&uid) {
                if entry.payload != payload {
                    info!("event=snapshot_duplicate_rejected snap_uid={uid}");
                    let _ = reply.send(Err(DistributorError::DuplicateSnapshotRequest));
                } else {
                    info!("event=snapshot_coalesced snap_uid={uid}");
                    entry.replies.push(reply);
                }
                return;
            }
            in_flight.insert(uid, InFlightSnap { payload: payload.clone(), replies: vec![reply] });
        }
        let orchestrator = self.clone();
        tasks.spawn(async move {
            orchestrator.run_snapshot(uid, payload).await;
        });
    }

    async fn run_snapshot(self: Arc<Self>, uid: SnapUid, payload: String) {
        let result = self.snap_create(uid, payload).await;
        match &result {
            Ok(()) => info!("event=snapshot_success snap_uid={uid}"),
            Err(err) => warn!("event=snapshot_failed snap_uid={uid} error={err}"),
        }
        let replies =
            self.in_flight.lock().remove(&uid).map(|entry| entry.replies).unwrap_or_default();
        for reply in replies {
            let _ = reply.send(result.clone());
        }
        self.results.lock().record(uid, result, Instant::now());
    }

    /// Holds the distributor-enabled latch across the orchestration and
    /// races it against recovery and the global timeout.
    async fn snap_create(&self, uid: SnapUid, payload: String) -> Result<()> {
        if !self.enabled.try_set_snapshot(uid) {
            warn!("event=snapshot_latch_unavailable snap_uid={uid}");
            return Err(DistributorError::OperationFailed);
        }
        let result = tokio::select! {
            core = self.snap_create_core(uid, &payload) => core,
            _ = self.cluster.on_recovery_change() => {
                warn!("event=snapshot_recovery_started snap_uid={uid}");
                Err(DistributorError::SnapWithRecoveryUnsupported)
            }
            _ = sleep(self.knobs.snap_create_max_timeout) => {
                warn!("event=snapshot_timed_out snap_uid={uid}");
                Err(DistributorError::TimedOut)
            }
        };
        if !self.enabled.try_set_enabled(Owner::Snapshot(uid)) {
            warn!("event=snapshot_latch_release_failed snap_uid={uid}");
        }
        result
    }

    async fn snap_create_core(&self, uid: SnapUid, payload: &str) -> Result<()> {
        self.gateway.set_write_recovery_flag(true).await?;
        info!("event=snapshot_enter snap_uid={uid}");
        let fan_out = self.snap_fan_out(uid, payload).await;
        if let Err(err) = fan_out {
            // The tlogs must never be left with pops disabled, whatever
            // else went wrong after quiescing them.
            if matches!(
                err,
                DistributorError::SnapStorageFailed
                    | DistributorError::SnapTlogFailed
                    | DistributorError::SnapDisableTlogPopFailed
                    | DistributorError::Cancelled
            ) {
                self.enable_tlog_pops_best_effort(uid).await;
            }
            return Err(err);
        }
        self.gateway.set_write_recovery_flag(false).await?;
        Ok(())
    }

    async fn snap_fan_out(&self, uid: SnapUid, payload: &str) -> Result<()> {
        let tlogs = self.cluster.local_tlogs().await?;

        let mut disable_pops = Vec::new();
        for tlog in tlogs.iter().copied() {
            let cluster = self.cluster.clone();
            disable_pops.push(tokio::spawn(async move {
                cluster
                    .disable_tlog_pop(tlog, uid)
                    .await
                    .map_err(|_| DistributorError::SnapDisableTlogPopFailed)
            }));
        }
        wait_for_most(disable_pops, 0, DistributorError::SnapDisableTlogPopFailed).await?;
        info!("event=snapshot_tlog_pops_disabled snap_uid={uid} tlogs={}", tlogs.len());

        let (workers, storage_fault_tolerance) = self.stateful_workers(&tlogs).await?;
        info!(
            "event=snapshot_stateful_workers snap_uid={uid} workers={} storage_fault_tolerance={storage_fault_tolerance}",
            workers.len()
        );

        // Storage must be snapshotted before any tlog.
        let storage_snaps = self.send_role_snaps(&workers, WorkerRole::Storage, uid, payload);
        wait_for_most(storage_snaps, storage_fault_tolerance, DistributorError::SnapStorageFailed)
            .await?;
        info!("event=snapshot_storage_done snap_uid={uid}");

        let tlog_snaps = self.send_role_snaps(&workers, WorkerRole::Tlog, uid, payload);
        wait_for_most(tlog_snaps, 0, DistributorError::SnapTlogFailed).await?;
        info!("event=snapshot_tlog_done snap_uid={uid}");

        let mut enable_pops = Vec::new();
        for tlog in tlogs.iter().copied() {
            let cluster = self.cluster.clone();
            enable_pops.push(tokio::spawn(async move {
                cluster
                    .enable_tlog_pop(tlog, uid)
                    .await
                    .map_err(|_| DistributorError::SnapEnableTlogPopFailed)
            }));
        }
        wait_for_most(enable_pops, 0, DistributorError::SnapEnableTlogPopFailed).await?;
        info!("event=snapshot_tlog_pops_enabled snap_uid={uid}");

        let coord_snaps = self.send_role_snaps(&workers, WorkerRole::Coordinator, uid, payload);
        let coord_count = coord_snaps.len();
        let coord_fault_tolerance = (coord_count / 2)
            .saturating_sub(1)
            .min(self.knobs.max_coordinator_snapshot_fault_tolerance);
        wait_for_most(coord_snaps, coord_fault_tolerance, DistributorError::SnapCoordFailed)
            .await?;
        info!("event=snapshot_coord_done snap_uid={uid} coordinators={coord_count}");
        Ok(())
    }

    /// Computes the stateful worker set (storage filtered to the master
    /// region when single-region, plus local tlogs and coordinators) and
    /// the storage fault tolerance left after missing workers.
    async fn stateful_workers(
        &self,
        tlogs: &[Address],
    ) -> Result<(HashMap<Address, (WorkerInfo, BTreeSet<WorkerRole>)>, usize)> {
        let config = self.gateway.load_configuration().await?;
        let storage = self.cluster.storage_servers().await?;
        let worker_list = self.cluster.workers().await?;
        let master_dc = self.cluster.master_dc().await?;
        let coordinators = self.cluster.coordinators().await?;

        let workers: HashMap<Address, WorkerInfo> =
            worker_list.into_iter().map(|w| (w.address, w)).collect();
        let mut result: HashMap<Address, (WorkerInfo, BTreeSet<WorkerRole>)> = HashMap::new();
        let mut add_role = |result: &mut HashMap<Address, (WorkerInfo, BTreeSet<WorkerRole>)>,
                            worker: &WorkerInfo,
                            role: WorkerRole| {
            result
                .entry(worker.address)
                .or_insert_with(|| (worker.clone(), BTreeSet::new()))
                .1
                .insert(role);
        };

        let mut storage_failures = 0usize;
        for server in &storage {
            if config.usable_regions == 1 || server.dc == master_dc {
                match workers.get(&server.address) {
                    Some(worker) => add_role(&mut result, worker, WorkerRole::Storage),
                    None => {
                        warn!(
                            "event=snapshot_missing_storage_worker server={} address={}",
                            server.id, server.address
                        );
                        storage_failures += 1;
                    }
                }
            }
        }
        let tolerance_budget = self
            .knobs
            .max_storage_snapshot_fault_tolerance
            .min(config.storage_team_size.saturating_sub(1));
        if storage_failures > tolerance_budget {
            return Err(DistributorError::SnapStorageFailed);
        }
        let storage_fault_tolerance = tolerance_budget - storage_failures;

        for tlog in tlogs {
            match workers.get(tlog) {
                Some(worker) => add_role(&mut result, worker, WorkerRole::Tlog),
                None => {
                    warn!("event=snapshot_missing_tlog_worker address={tlog}");
                    return Err(DistributorError::SnapTlogFailed);
                }
            }
        }

        for coordinator in coordinators {
            if let Some(worker) = workers.get(&coordinator) {
                add_role(&mut result, worker, WorkerRole::Coordinator);
            }
        }

        Ok((result, storage_fault_tolerance))
    }

    fn send_role_snaps(
        &self,
        workers: &HashMap<Address, (WorkerInfo, BTreeSet<WorkerRole>)>,
        role: WorkerRole,
        uid: SnapUid,
        payload: &str,
    ) -> Vec<JoinHandle<Result<()>>> {
        let mut handles = Vec::new();
        for (worker, roles) in workers.values() {
            if !roles.contains(&role) {
                continue;
            }
            let cluster = self.cluster.clone();
            let address = worker.address;
            let payload = payload.to_string();
            let retry_limit = self.knobs.snap_network_retry_limit;
            let base_backoff = self.knobs.snap_retry_backoff;
            handles.push(tokio::spawn(async move {
                try_send_snap(cluster, address, role, uid, payload, retry_limit, base_backoff).await
            }));
        }
        handles
    }

    /// Best-effort pop re-enable after a failed fan-out; errors ignored.
    async fn enable_tlog_pops_best_effort(&self, uid: SnapUid) {
        let tlogs = match self.cluster.local_tlogs().await {
            Ok(tlogs) => tlogs,
            Err(err) => {
                warn!("event=snapshot_enable_pop_recovery_failed snap_uid={uid} error={err}");
                return;
            }
        };
        for tlog in tlogs {
            if let Err(err) = self.cluster.enable_tlog_pop(tlog, uid).await {
                warn!(
                    "event=snapshot_enable_pop_ignored_failure snap_uid={uid} tlog={tlog} error={err}"
                );
            }
        }
    }
}

/// Sends one snapshot RPC, retrying maybe-delivered failures with
/// exponential backoff and the same uid so the worker side stays
/// idempotent.
async fn try_send_snap(
    cluster: Arc<dyn ClusterInterface>,
    worker: Address,
    role: WorkerRole,
    uid: SnapUid,
    payload: String,
    retry_limit: usize,
    base_backoff: Duration,
) -> Result<()> {
    let mut backoff = base_backoff;
    let mut attempts = 0usize;
    loop {
        match cluster.snapshot_worker(worker, role, uid, payload.clone()).await {
            Ok(()) => return Ok(()),
            Err(DistributorError::RequestMaybeDelivered) if attempts < retry_limit => {
                attempts += 1;
                warn!(
                    "event=snapshot_rpc_retry worker={worker} role={} attempts={attempts}",
                    role.as_str()
                );
                sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(err) => {
                warn!(
                    "event=snapshot_rpc_failed worker={worker} role={} error={err}",
                    role.as_str()
                );
                return Err(err);
            }
        }
    }
}

/// Awaits every request, tolerating up to `tolerance` failures.
async fn wait_for_most(
    handles: Vec<JoinHandle<Result<()>>>,
    tolerance: usize,
    error: DistributorError,
) -> Result<()> {
    let mut failures = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => failures += 1,
        }
    }
    if failures > tolerance {
        Err(error)
    } else {
        Ok(())
    }
}
