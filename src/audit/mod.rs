//! Storage-audit engine.
//!
//! Launches, partitions, dispatches, retries, and finalizes storage audits.
//! One live audit is a [`DdAudit`]: its durable core state plus the task
//! group running its workers. The engine keeps the runtime map keyed by
//! `(type, id)`; every entry is non-terminal, and at most one audit per
//! type runs at a time.

pub mod state;

use crate::cluster::{ClusterInterface, RangeLocations, StorageServerInfo};
use crate::config::DistributorKnobs;
use crate::error::{DistributorError, Result};
use crate::gateway::DurableGateway;
use crate::ids::{AuditId, ServerId};
use crate::initial::InitialDistribution;
use crate::keyspace::KeyRange;
use crate::util::{Gate, TaskGroup};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use state::{AuditPhase, AuditRequest, AuditState, AuditType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// One live audit: durable core state plus its running task group.
pub struct DdAudit {
    core: Mutex<AuditState>,
    tasks: TaskGroup,
    found_error: AtomicBool,
    any_child_failed: AtomicBool,
    retry_count: AtomicU32,
    cancelled: AtomicBool,
    root: Mutex<Option<JoinHandle<()>>>,
}

impl DdAudit {
    fn new(core: AuditState, retry_count: u32) -> Self {
        DdAudit {
            core: Mutex::new(core),
            tasks: TaskGroup::new(),
            found_error: AtomicBool::new(false),
            any_child_failed: AtomicBool::new(false),
            retry_count: AtomicU32::new(retry_count),
            cancelled: AtomicBool::new(false),
            root: Mutex::new(None),
        }
    }

    pub fn core_state(&self) -> AuditState {
        self.core.lock().clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancels the root activity and every child atomically.
    pub fn cancel(&self) {
        if let Some(root) = self.root.lock().take() {
            root.abort();
        }
        self.tasks.abort_all();
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

pub struct AuditEngine {
    distributor_id: ServerId,
    knobs: Arc<DistributorKnobs>,
    gateway: Arc<DurableGateway>,
    cluster: Arc<dyn ClusterInterface>,
    audits: Mutex<HashMap<(AuditType, AuditId), Arc<DdAudit>>>,
    initialized: Gate,
    audit_initialized: Gate,
}

impl AuditEngine {
    pub fn new(
        distributor_id: ServerId,
        knobs: Arc<DistributorKnobs>,
        gateway: Arc<DurableGateway>,
        cluster: Arc<dyn ClusterInterface>,
    ) -> Self {
        AuditEngine {
            distributor_id,
            knobs,
            gateway,
            cluster,
            audits: Mutex::new(HashMap::new()),
            initialized: Gate::new(),
            audit_initialized: Gate::new(),
        }
    }

    /// The generation-readiness gate shared with the supervisor; audits
    /// launch only after it opens.
    pub fn initialized_gate(&self) -> Gate {
        self.initialized.clone()
    }

    pub fn audit_initialized_gate(&self) -> Gate {
        self.audit_initialized.clone()
    }

    /// Re-arms both gates and cancels any leftover runtime audits at the
    /// start of a generation.
    pub fn begin_generation(&self) {
        self.initialized.close();
        self.audit_initialized.close();
        self.cancel_all();
    }

    pub fn cancel_all(&self) {
        let drained: Vec<Arc<DdAudit>> = self.audits.lock().drain().map(|(_, a)| a).collect();
        if !drained.is_empty() {
            debug!("event=audit_cancel_all count={}", drained.len());
        }
        for audit in drained {
            audit.cancel();
        }
    }

    pub fn audit_count(&self) -> usize {
        self.audits.lock().len()
    }

    pub fn running_audit(&self, audit_type: AuditType, id: AuditId) -> Option<Arc<DdAudit>> {
        self.audits.lock().get(&(audit_type, id)).cloned()
    }

    fn remove_audit(&self, audit_type: AuditType, id: AuditId) {
        self.audits.lock().remove(&(audit_type, id));
        debug!("event=audit_map_remove audit_type={audit_type} audit_id={id}");
    }

    /// Resumes every durable `Running` audit and opens the audit gate.
    /// Pre-existing runtime audits are cancelled first.
    pub fn resume(self: &Arc<Self>, initial: &InitialDistribution) {
        self.cancel_all();
        for audit_state in &initial.audit_states {
            if audit_state.phase.is_terminal() {
                continue;
            }
            debug_assert_eq!(audit_state.phase, AuditPhase::Running);
            if let Err(err) = self.run_audit(audit_state.clone(), 0) {
                warn!(
                    "event=audit_resume_failed audit_id={} audit_type={} error={err}",
                    audit_state.id, audit_state.audit_type
                );
            }
        }
        self.audit_initialized.open();
        info!(
            "event=audit_resume_done distributor={} resumed={}",
            self.distributor_id,
            self.audit_count()
        );
    }

    /// The only entry point that starts an audit generation: validates the
    /// state, registers the runtime audit, and schedules its core task.
    pub fn run_audit(self: &Arc<Self>, state: AuditState, retry_count: u32) -> Result<()> {
        if state.range.is_empty() {
            return Err(DistributorError::internal("audit range must not be empty"));
        }
        if state.phase != AuditPhase::Running {
            return Err(DistributorError::internal("audit must start in the running phase"));
        }
        let key = (state.audit_type, state.id);
        let audit = Arc::new(DdAudit::new(state, retry_count));
        {
            let mut audits = self.audits.lock();
            if audits.contains_key(&key) {
                return Err(DistributorError::internal(format!(
                    "audit {} of type {} is already registered",
                    key.1, key.0
                )));
            }
            audits.insert(key, audit.clone());
        }
        debug!(
            "event=audit_run audit_type={} audit_id={} retry_count={retry_count}",
            key.0, key.1
        );
        let engine = self.clone();
        let handle = tokio::spawn(audit_core(engine, audit.clone()));
        *audit.root.lock() = Some(handle);
        Ok(())
    }

    /// Launch protocol: reuse the unique running audit of this type whose
    /// range contains the request, or persist and start a fresh one.
    pub async fn launch(self: &Arc<Self>, range: KeyRange, audit_type: AuditType) -> Result<AuditId> {
        self.initialized.wait().await;
        self.audit_initialized.wait().await;

        let existing_of_type: Vec<Arc<DdAudit>> = {
            let audits = self.audits.lock();
            audits
                .iter()
                .filter(|((ty, _), _)| *ty == audit_type)
                .map(|(_, audit)| audit.clone())
                .collect()
        };
        if !existing_of_type.is_empty() {
            for audit in &existing_of_type {
                let core = audit.core_state();
                if core.range.contains_range(&range) && core.phase == AuditPhase::Running {
                    info!(
                        "event=audit_launch_existing audit_type={audit_type} audit_id={}",
                        core.id
                    );
                    return Ok(core.id);
                }
            }
            // Only one concurrent audit of a given type is allowed.
            return Err(DistributorError::AuditExceededRequestLimit);
        }

        let mut state = AuditState::new(audit_type, range.clone());
        state.phase = AuditPhase::Running;
        // Persistence is the commit point; a crash after the commit but
        // before registration is recovered by the resume path.
        let id = self.gateway.persist_new_audit_state(state.clone()).await?;
        state.id = id;
        info!("event=audit_launch_new audit_type={audit_type} audit_id={id} range={range}");
        self.run_audit(state, 0)?;
        Ok(id)
    }

    /// Serves a trigger request: retries failed launches with a short
    /// backoff, mapping terminal outcomes onto the RPC error kinds.
    pub async fn trigger(self: &Arc<Self>, audit_type: AuditType, range: KeyRange) -> Result<AuditId> {
        let mut retries = 0u32;
        loop {
            match self.launch(range.clone(), audit_type).await {
                Ok(id) => return Ok(id),
                Err(DistributorError::Cancelled) => return Err(DistributorError::BrokenPromise),
                Err(DistributorError::NotImplemented) => {
                    return Err(DistributorError::NotImplemented)
                }
                Err(err) if retries < self.knobs.audit_retry_count_max => {
                    retries += 1;
                    debug!(
                        "event=audit_trigger_retry audit_type={audit_type} retries={retries} error={err}"
                    );
                    sleep(self.knobs.audit_retry_backoff).await;
                }
                Err(err) => {
                    info!("event=audit_trigger_exhausted audit_type={audit_type} error={err}");
                    return Err(DistributorError::AuditStorageFailed);
                }
            }
        }
    }

    async fn fail_audit(&self, audit: &Arc<DdAudit>) {
        let state = {
            let mut core = audit.core.lock();
            core.phase = AuditPhase::Failed;
            core.clone()
        };
        if let Err(err) = self.gateway.persist_audit_state(state.clone()).await {
            // The durable state stays Running: a zombie the next
            // generation's resume path picks up.
            warn!(
                "event=audit_fail_persist_error audit_id={} audit_type={} error={err}",
                state.id, state.audit_type
            );
        } else {
            info!("event=audit_failed audit_id={} audit_type={}", state.id, state.audit_type);
        }
        self.remove_audit(state.audit_type, state.id);
    }
}

/// Supervises one audit generation: dispatches workers, aggregates their
/// verdicts, persists the final phase, and schedules retries.
async fn audit_core(engine: Arc<AuditEngine>, audit: Arc<DdAudit>) {
    let core = audit.core_state();
    info!(
        "event=audit_core_scheduled audit_id={} audit_type={} range={} retry_count={}",
        core.id,
        core.audit_type,
        core.range,
        audit.retry_count()
    );
    match audit_core_inner(&engine, &audit).await {
        Ok(()) => {
            info!("event=audit_core_end audit_id={} audit_type={}", core.id, core.audit_type);
        }
        Err(err) => handle_core_error(&engine, &audit, err).await,
    }
}

async fn audit_core_inner(engine: &Arc<AuditEngine>, audit: &Arc<DdAudit>) -> Result<()> {
    dispatch(engine, audit);
    audit.tasks.wait_idle().await;

    if audit.found_error.load(Ordering::SeqCst) {
        audit.core.lock().phase = AuditPhase::Error;
    } else if audit.any_child_failed.swap(false, Ordering::SeqCst) {
        // A child failure must not blindly rerun workers mid-generation;
        // the whole generation retries instead.
        return Err(DistributorError::Retry);
    } else {
        audit.core.lock().phase = AuditPhase::Complete;
    }

    let state = audit.core_state();
    engine.gateway.persist_audit_state(state.clone()).await?;
    engine.remove_audit(state.audit_type, state.id);
    Ok(())
}

async fn handle_core_error(engine: &Arc<AuditEngine>, audit: &Arc<DdAudit>, err: DistributorError) {
    let core = audit.core_state();
    debug!(
        "event=audit_core_error audit_id={} audit_type={} retry_count={} error={err}",
        core.id,
        core.audit_type,
        audit.retry_count()
    );
    match err {
        DistributorError::Cancelled | DistributorError::MoveKeysConflict => {
            // The generation is going away; leave teardown to the
            // supervisor's cancel path.
            warn!(
                "event=audit_core_abandoned audit_id={} audit_type={} error={err}",
                core.id, core.audit_type
            );
        }
        DistributorError::NotImplemented => engine.fail_audit(audit).await,
        _ if audit.retry_count() < engine.knobs.audit_retry_count_max => {
            let next_retry = audit.retry_count() + 1;
            audit.tasks.abort_all();
            sleep(engine.knobs.audit_retry_backoff).await;
            engine.remove_audit(core.audit_type, core.id);
            let mut state = core;
            state.phase = AuditPhase::Running;
            if let Err(err) = engine.run_audit(state, next_retry) {
                warn!("event=audit_retry_respawn_failed error={err}");
            }
        }
        _ => engine.fail_audit(audit).await,
    }
}

/// Decides which dispatch walks the audit, by type.
fn dispatch(engine: &Arc<AuditEngine>, audit: &Arc<DdAudit>) {
    let core = audit.core_state();
    let engine = engine.clone();
    let audit_ref = audit.clone();
    match core.audit_type {
        AuditType::ServerShard => {
            audit.tasks.spawn(async move {
                audit_all_storage_servers(engine, audit_ref, KeyRange::entire()).await;
            });
        }
        AuditType::LocationMetadata => {
            audit.tasks.spawn(async move {
                make_progress_on_range(engine, audit_ref, KeyRange::entire()).await;
            });
        }
        AuditType::Ha | AuditType::Replica => {
            audit.tasks.spawn(async move {
                make_progress_on_range(engine, audit_ref, core.range).await;
            });
        }
    }
}

/// Schedules a by-server progress walker on every storage server, spacing
/// the scheduling to avoid request bursts. TSS processes are skipped.
async fn audit_all_storage_servers(engine: Arc<AuditEngine>, audit: Arc<DdAudit>, range: KeyRange) {
    let result = async {
        let servers = engine.cluster.storage_servers().await?;
        for server in servers {
            if server.is_tss {
                continue;
            }
            let engine_ref = engine.clone();
            let audit_ref = audit.clone();
            let server_range = range.clone();
            audit.tasks.spawn(async move {
                make_progress_on_server(engine_ref, audit_ref, server_range, server).await;
            });
            sleep(engine.knobs.audit_child_spacing).await;
        }
        Ok::<(), DistributorError>(())
    }
    .await;
    if let Err(err) = result {
        warn!("event=audit_enumerate_servers_failed error={err}");
        audit.any_child_failed.store(true, Ordering::SeqCst);
    }
}

/// Walks `[range.begin, range.end)` through the by-server progress index,
/// dispatching an audit RPC for every sub-range with no progress yet.
async fn make_progress_on_server(
    engine: Arc<AuditEngine>,
    audit: Arc<DdAudit>,
    range: KeyRange,
    server: StorageServerInfo,
) {
    if let Err(err) = progress_on_server_inner(&engine, &audit, &range, &server).await {
        warn!(
            "event=audit_progress_on_server_failed server={} error={err}",
            server.id
        );
        audit.any_child_failed.store(true, Ordering::SeqCst);
    }
}

async fn progress_on_server_inner(
    engine: &Arc<AuditEngine>,
    audit: &Arc<DdAudit>,
    range: &KeyRange,
    server: &StorageServerInfo,
) -> Result<()> {
    let core = audit.core_state();
    let mut begin = range.begin.clone();
    let mut total = 0u64;
    let mut completed = 0u64;
    while begin < range.end {
        let current = KeyRange::new(begin.clone(), range.end.clone());
        let states = engine
            .gateway
            .audit_states_by_server(core.audit_type, core.id, server.id, current)
            .await?;
        let Some(last) = states.last() else {
            return Err(DistributorError::internal("audit progress index returned no ranges"));
        };
        begin = last.range.end.clone();
        for sub_state in states {
            total += 1;
            match sub_state.phase {
                AuditPhase::Complete => completed += 1,
                AuditPhase::Error => {
                    completed += 1;
                    audit.found_error.store(true, Ordering::SeqCst);
                }
                AuditPhase::Invalid => {
                    let request = AuditRequest {
                        id: core.id,
                        range: sub_state.range,
                        audit_type: core.audit_type,
                        target_servers: Vec::new(),
                    };
                    let engine_ref = engine.clone();
                    let audit_ref = audit.clone();
                    let target = server.clone();
                    audit.tasks.spawn(async move {
                        do_audit_on_storage_server(engine_ref, audit_ref, target, request).await;
                    });
                }
                AuditPhase::Running | AuditPhase::Failed => {
                    // The launch/resume protocol never persists these in
                    // the progress index.
                    return Err(DistributorError::internal(
                        "unexpected running/failed phase in audit progress index",
                    ));
                }
            }
        }
        sleep(engine.knobs.audit_child_spacing).await;
    }
    info!(
        "event=audit_progress_on_server_done audit_id={} server={} total={total} completed={completed}",
        core.id, server.id
    );
    Ok(())
}

/// Walks `[range.begin, range.end)` through the by-range progress index,
/// scheduling unattempted sub-ranges on their hosting servers.
async fn make_progress_on_range(engine: Arc<AuditEngine>, audit: Arc<DdAudit>, range: KeyRange) {
    if let Err(err) = progress_on_range_inner(&engine, &audit, &range).await {
        warn!("event=audit_progress_on_range_failed error={err}");
        audit.any_child_failed.store(true, Ordering::SeqCst);
    }
}

async fn progress_on_range_inner(
    engine: &Arc<AuditEngine>,
    audit: &Arc<DdAudit>,
    range: &KeyRange,
) -> Result<()> {
    let core = audit.core_state();
    let mut begin = range.begin.clone();
    let mut total = 0u64;
    let mut completed = 0u64;
    while begin < range.end {
        let current = KeyRange::new(begin.clone(), range.end.clone());
        let states =
            engine.gateway.audit_states_by_range(core.audit_type, core.id, current).await?;
        let Some(last) = states.last() else {
            return Err(DistributorError::internal("audit progress index returned no ranges"));
        };
        begin = last.range.end.clone();
        for sub_state in states {
            total += 1;
            match sub_state.phase {
                AuditPhase::Complete => completed += 1,
                AuditPhase::Error => {
                    completed += 1;
                    audit.found_error.store(true, Ordering::SeqCst);
                }
                AuditPhase::Invalid => {
                    let engine_ref = engine.clone();
                    let audit_ref = audit.clone();
                    audit.tasks.spawn(async move {
                        schedule_on_range(engine_ref, audit_ref, sub_state.range).await;
                    });
                }
                AuditPhase::Running | AuditPhase::Failed => {
                    return Err(DistributorError::internal(
                        "unexpected running/failed phase in audit progress index",
                    ));
                }
            }
        }
        sleep(engine.knobs.audit_child_spacing).await;
    }
    info!(
        "event=audit_progress_on_range_done audit_id={} total={total} completed={completed}",
        core.id
    );
    Ok(())
}

/// Partitions `range` by range ownership and dispatches one audit RPC per
/// sub-range, choosing targets per audit type.
async fn schedule_on_range(engine: Arc<AuditEngine>, audit: Arc<DdAudit>, range: KeyRange) {
    if let Err(err) = schedule_on_range_inner(&engine, &audit, &range).await {
        warn!("event=audit_schedule_on_range_failed range={range} error={err}");
        audit.any_child_failed.store(true, Ordering::SeqCst);
    }
}

fn pick_random<'a>(servers: &'a [StorageServerInfo]) -> &'a StorageServerInfo {
    let index = rand::thread_rng().gen_range(0..servers.len());
    &servers[index]
}

async fn schedule_on_range_inner(
    engine: &Arc<AuditEngine>,
    audit: &Arc<DdAudit>,
    range: &KeyRange,
) -> Result<()> {
    let core = audit.core_state();
    let mut begin = range.begin.clone();
    let mut dispatched = 0u64;
    'walk: while begin < range.end {
        let current = KeyRange::new(begin.clone(), range.end.clone());
        let locations = engine.cluster.source_server_interfaces_for_range(current).await?;
        if locations.is_empty() {
            return Err(DistributorError::internal("no source servers known for audit range"));
        }
        for location in locations {
            if location.primary.is_empty() {
                return Err(DistributorError::internal("range location without primary servers"));
            }
            let mut request = AuditRequest {
                id: core.id,
                range: location.range.clone(),
                audit_type: core.audit_type,
                target_servers: Vec::new(),
            };
            let target = match core.audit_type {
                AuditType::Ha => {
                    if location.remotes.is_empty() {
                        info!(
                            "event=audit_schedule_skip reason=single_replica audit_id={} range={}",
                            core.id, location.range
                        );
                        break 'walk;
                    }
                    let target = pick_random(&location.primary).clone();
                    for (_dc, servers) in &location.remotes {
                        if !servers.is_empty() {
                            request.target_servers.push(pick_random(servers).id);
                        }
                    }
                    target
                }
                AuditType::Replica => {
                    // Replica comparison stays within the primary region.
                    if location.primary.len() < 2 {
                        info!(
                            "event=audit_schedule_skip reason=single_replica audit_id={} range={}",
                            core.id, location.range
                        );
                        break 'walk;
                    }
                    let index = rand::thread_rng().gen_range(0..location.primary.len());
                    for (peer_index, peer) in location.primary.iter().enumerate() {
                        if peer_index != index {
                            request.target_servers.push(peer.id);
                        }
                    }
                    location.primary[index].clone()
                }
                AuditType::LocationMetadata => pick_random(&location.primary).clone(),
                AuditType::ServerShard => {
                    return Err(DistributorError::internal(
                        "server-shard audits dispatch by server, not by range",
                    ));
                }
            };
            dispatched += 1;
            let engine_ref = engine.clone();
            let audit_ref = audit.clone();
            audit.tasks.spawn(async move {
                do_audit_on_storage_server(engine_ref, audit_ref, target, request).await;
            });
            begin = location.range.end.clone();
            sleep(engine.knobs.audit_child_spacing).await;
        }
    }
    debug!(
        "event=audit_schedule_on_range_done audit_id={} range={range} dispatched={dispatched}",
        core.id
    );
    Ok(())
}

/// The single interface to a storage server for all audit types. A data
/// inconsistency reported by the server marks the audit errored; any other
/// failure marks the generation for retry.
async fn do_audit_on_storage_server(
    engine: Arc<AuditEngine>,
    audit: Arc<DdAudit>,
    target: StorageServerInfo,
    request: AuditRequest,
) {
    debug!(
        "event=audit_rpc_begin audit_id={} server={} range={}",
        request.id, target.id, request.range
    );
    let rpc = engine.cluster.audit_storage(target.id, request.clone());
    match timeout(engine.knobs.audit_sustained_failure_timeout, rpc).await {
        Ok(Ok(_state)) => {
            debug!(
                "event=audit_rpc_end audit_id={} server={} range={}",
                request.id, target.id, request.range
            );
        }
        Ok(Err(DistributorError::AuditStorageError)) => {
            warn!(
                "event=audit_rpc_inconsistency audit_id={} server={} range={}",
                request.id, target.id, request.range
            );
            audit.found_error.store(true, Ordering::SeqCst);
        }
        Ok(Err(DistributorError::Cancelled)) => {}
        Ok(Err(err)) => {
            info!(
                "event=audit_rpc_failed audit_id={} server={} error={err}",
                request.id, target.id
            );
            audit.any_child_failed.store(true, Ordering::SeqCst);
        }
        Err(_elapsed) => {
            info!(
                "event=audit_rpc_timeout audit_id={} server={}",
                request.id, target.id
            );
            audit.any_child_failed.store(true, Ordering::SeqCst);
        }
    }
}
