//! The distributor supervisor: bootstrap state machine, generation wiring,
//! fatal-set error classification, and the request router.
//!
//! One *generation* is the inner task tree between two bootstraps: lock
//! poller, config watch, tracker, queue, team collections, yield bridge,
//! and optional monitors. Any subordinate ending, for any reason, tears
//! the generation down; the classification decides whether to re-bootstrap
//! or to surface the error.

use crate::api::{
    median_shard_size, BlobRestoreReply, DistributorRequest, MetricsReply, WigglerRegionState,
    WigglerStateReply, BLOB_MIGRATOR_ID,
};
use crate::audit::AuditEngine;
use crate::bus;
use crate::cluster::{ClusterInterface, StorageServerInfo};
use crate::collab::{
    MetricsListRequest, QueueContext, Subsystems, TeamContext, TrackerContext,
};
use crate::config::{DatabaseConfig, DistributorKnobs};
use crate::enabled::{DdEnabledState, Owner};
use crate::error::{DistributorError, Result};
use crate::gateway::{DurableGateway, TxnProcessor};
use crate::ids::{Address, ServerId};
use crate::initial::InitialDistribution;
use crate::keyspace::KeyRange;
use crate::physical::PhysicalShardCollection;
use crate::resume::{resume_relocations, ResumeContext};
use crate::shards_affected::ShardsAffectedMap;
use crate::snapshot::SnapshotOrchestrator;
use crate::telemetry::{MetricsRegistry, MetricsSnapshot};
use crate::util::TaskGroup;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::sleep;

pub struct Supervisor {
    id: ServerId,
    knobs: Arc<DistributorKnobs>,
    gateway: Arc<DurableGateway>,
    cluster: Arc<dyn ClusterInterface>,
    subsystems: Arc<dyn Subsystems>,
    enabled: Arc<DdEnabledState>,
    audits: Arc<AuditEngine>,
    snapshots: Arc<SnapshotOrchestrator>,
    telemetry: Mutex<MetricsRegistry>,
    metrics_requests: Mutex<Option<mpsc::UnboundedSender<MetricsListRequest>>>,
    shards_affected: Mutex<Option<Arc<ShardsAffectedMap>>>,
    local_config_change: Notify,
}

impl Supervisor {
    pub fn new(
        id: ServerId,
        knobs: Arc<DistributorKnobs>,
        processor: Arc<dyn TxnProcessor>,
        cluster: Arc<dyn ClusterInterface>,
        subsystems: Arc<dyn Subsystems>,
    ) -> Arc<Self> {
        let gateway = Arc::new(DurableGateway::new(processor, &knobs));
        let enabled = Arc::new(DdEnabledState::new());
        let audits =
            Arc::new(AuditEngine::new(id, knobs.clone(), gateway.clone(), cluster.clone()));
        let snapshots = Arc::new(SnapshotOrchestrator::new(
            cluster.clone(),
            gateway.clone(),
            enabled.clone(),
            knobs.clone(),
        ));
        Arc::new(Supervisor {
            id,
            knobs,
            gateway,
            cluster,
            subsystems,
            enabled,
            audits,
            snapshots,
            telemetry: Mutex::new(MetricsRegistry::new()),
            metrics_requests: Mutex::new(None),
            shards_affected: Mutex::new(None),
            local_config_change: Notify::new(),
        })
    }

    pub fn audits(&self) -> &Arc<AuditEngine> {
        &self.audits
    }

    pub fn enabled(&self) -> &Arc<DdEnabledState> {
        &self.enabled
    }

    pub fn gateway(&self) -> &Arc<DurableGateway> {
        &self.gateway
    }

    pub fn telemetry_snapshot(&self) -> MetricsSnapshot {
        self.telemetry.lock().snapshot()
    }

    /// Serves requests while supervising the distribution loop. Returns
    /// once halted, the request stream closes, or the loop dies with an
    /// error outside the normal distributor set.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<DistributorRequest>,
    ) -> Result<()> {
        info!("event=distributor_running distributor={}", self.id);
        let service = TaskGroup::new();
        let mut distributor = tokio::spawn(Self::data_distribution(self.clone()));
        let outcome = loop {
            tokio::select! {
                joined = &mut distributor => {
                    let err = match joined {
                        Ok(Ok(())) => {
                            DistributorError::internal("distribution loop returned unexpectedly")
                        }
                        Ok(Err(err)) => err,
                        Err(join_err) if join_err.is_cancelled() => DistributorError::Cancelled,
                        Err(_) => DistributorError::internal("distribution loop panicked"),
                    };
                    break Err(err);
                }
                request = requests.recv() => match request {
                    None => break Ok(()),
                    Some(DistributorRequest::Halt { requester, reply }) => {
                        let _ = reply.send(());
                        info!("event=distributor_halted requester={requester}");
                        break Ok(());
                    }
                    Some(request) => self.handle_request(request, &service),
                }
            }
        };
        distributor.abort();
        service.abort_all();
        self.audits.cancel_all();
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_normal_distributor_error() => {
                info!("event=distributor_died distributor={} error={err}", self.id);
                Ok(())
            }
            Err(err) => {
                warn!("event=distributor_error distributor={} error={err}", self.id);
                Err(err)
            }
        }
    }

    fn handle_request(self: &Arc<Self>, request: DistributorRequest, service: &TaskGroup) {
        match request {
            DistributorRequest::Halt { .. } => unreachable!("halt is handled by the router loop"),
            DistributorRequest::Metrics { keys, shard_limit, mid_only, reply } => {
                let forward = self.metrics_requests.lock().clone();
                let Some(forward) = forward else {
                    let _ = reply.send(Err(DistributorError::BrokenPromise));
                    return;
                };
                let (tx, rx) = tokio::sync::oneshot::channel();
                if forward.send(MetricsListRequest { keys, shard_limit, reply: tx }).is_err() {
                    let _ = reply.send(Err(DistributorError::BrokenPromise));
                    return;
                }
                service.spawn(async move {
                    let result = match rx.await {
                        Ok(Ok(metrics)) => Ok(if mid_only {
                            MetricsReply::MedianShardSize(median_shard_size(metrics))
                        } else {
                            MetricsReply::List(metrics)
                        }),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(DistributorError::BrokenPromise),
                    };
                    let _ = reply.send(result);
                });
            }
            DistributorRequest::Snapshot { uid, payload, reply } => {
                self.snapshots.submit(uid, payload, reply, service);
            }
            DistributorRequest::ExclusionSafetyCheck { exclusions, reply } => {
                let supervisor = self.clone();
                service.spawn(async move {
                    let _ = reply.send(supervisor.exclusion_safety_check(exclusions).await);
                });
            }
            DistributorRequest::WigglerState { reply } => {
                let _ = reply.send(self.wiggler_states());
            }
            DistributorRequest::TriggerAudit { audit_type, range, reply } => {
                let audits = self.audits.clone();
                service.spawn(async move {
                    let _ = reply.send(audits.trigger(audit_type, range).await);
                });
            }
            DistributorRequest::TenantsOverQuota { reply } => {
                let tenants = self
                    .subsystems
                    .tenant_cache()
                    .map(|cache| cache.tenants_over_quota())
                    .unwrap_or_default();
                let _ = reply.send(tenants);
            }
            DistributorRequest::PrepareBlobRestore { ssi, keys, requester, reply } => {
                self.handle_prepare_blob_restore(ssi, keys, requester, reply, service);
            }
        }
    }

    async fn exclusion_safety_check(&self, exclusions: Vec<Address>) -> Result<bool> {
        let servers = self.cluster.storage_servers().await?;
        let Some(team_collection) = self.subsystems.team_handle(true) else {
            info!("event=exclusion_check_no_team_collection");
            return Ok(false);
        };
        // With a single team, excluding anything can strand team building.
        if team_collection.team_count() <= 1 {
            info!("event=exclusion_check_not_enough_teams");
            return Ok(false);
        }
        let mut excluded = Vec::new();
        for server in &servers {
            let hit = exclusions
                .iter()
                .any(|excl| *excl == server.address || Some(*excl) == server.secondary_address);
            if hit {
                excluded.push(server.id);
            }
        }
        Ok(team_collection.exclusion_safety_check(excluded))
    }

    fn wiggler_states(&self) -> WigglerStateReply {
        let region_state = |primary: bool| {
            self.subsystems.team_handle(primary).map(|handle| {
                let (state, last_state_change) = handle.wiggler_state();
                WigglerRegionState { state, last_state_change }
            })
        };
        WigglerStateReply { primary: region_state(true), remote: region_state(false) }
    }

    fn handle_prepare_blob_restore(
        self: &Arc<Self>,
        ssi: StorageServerInfo,
        keys: KeyRange,
        requester: ServerId,
        reply: tokio::sync::oneshot::Sender<Result<BlobRestoreReply>>,
        service: &TaskGroup,
    ) {
        let supervisor = self.clone();
        service.spawn(async move {
            if ssi.id != BLOB_MIGRATOR_ID {
                let _ = reply.send(Err(DistributorError::OperationFailed));
                return;
            }
            supervisor.audits.initialized_gate().wait().await;
            // The migrator sends at-least-once; a repeat from the owner
            // that is already preparing is absorbed, and the original
            // request's reply carries the outcome.
            if supervisor.enabled.same_blob_restore_owner(requester) {
                info!("event=blob_restore_repeat_absorbed requester={requester}");
                return;
            }
            if !supervisor.enabled.try_set_blob_restore(requester) {
                let reason = if supervisor.enabled.is_blob_restore_preparing() {
                    BlobRestoreReply::ConflictBlobRestore
                } else {
                    BlobRestoreReply::ConflictSnapshot
                };
                let _ = reply.send(Ok(reason));
                return;
            }
            // Force the inner components to reload metadata before the
            // migrator starts moving data.
            supervisor.local_config_change.notify_waiters();
            let result = supervisor.cluster.prepare_blob_restore(ssi, keys, requester).await;
            match result {
                Ok(()) => {
                    info!("event=blob_restore_prepared requester={requester}");
                    let _ = reply.send(Ok(BlobRestoreReply::Success));
                }
                Err(err) => {
                    warn!("event=blob_restore_prepare_failed requester={requester} error={err}");
                    let _ = reply.send(Err(err));
                }
            }
            if !supervisor.enabled.try_set_enabled(Owner::BlobRestore(requester)) {
                warn!("event=blob_restore_latch_release_failed requester={requester}");
            }
        });
    }

    /// The bootstrap loop: block until enabled, take the lock, load state,
    /// run one generation, classify its death, repeat.
    async fn data_distribution(self: Arc<Self>) -> Result<()> {
        loop {
            let (config, initial) = loop {
                self.gateway.wait_distribution_enabled().await?;
                // The durable flag may race the in-memory latch held by a
                // snapshot or blob-restore preparation.
                if !self.enabled.is_enabled() {
                    sleep(self.knobs.move_keys_lock_poll_interval).await;
                    continue;
                }
                info!("event=distribution_enabled distributor={}", self.id);
                self.gateway.take_lock(self.id).await?;
                let config = self.gateway.load_configuration().await?;
                if config.storage_team_size == 0 {
                    return Err(DistributorError::internal("storage team size must be positive"));
                }
                let primary = config.primary_dc();
                let remote = config.remote_dc();
                self.gateway.update_replica_keys(primary, remote.clone(), &config).await?;
                let remote_dcs = if config.multi_region() {
                    remote.into_iter().collect()
                } else {
                    Vec::new()
                };
                let mut initial = self.gateway.load_initial_distribution(remote_dcs).await?;
                self.log_initial(&initial);
                if initial.mode && self.enabled.is_enabled() {
                    initial.validate_data_moves();
                    break (config, initial);
                }
                info!("event=distribution_disabled distributor={}", self.id);
                self.telemetry.lock().zero_movement_tables(config.multi_region());
                // Wait out a brief durable/in-memory disagreement before
                // re-reading the flag.
                sleep(self.knobs.move_keys_lock_poll_interval).await;
            };

            let result = self.run_generation(&config, Arc::new(initial)).await;
            let err = result.expect_err_or_internal();
            match self.classify_generation_error(err).await? {
                GenerationOutcome::Rebootstrap => continue,
            }
        }
    }

    async fn classify_generation_error(&self, err: DistributorError) -> Result<GenerationOutcome> {
        match err {
            DistributorError::Cancelled => {
                // Synchronous cleanup: async teardown after cancellation
                // would race the next owner of the shard map.
                if let Some(map) = self.shards_affected.lock().take() {
                    map.clear();
                }
                Err(DistributorError::Cancelled)
            }
            DistributorError::RemoveFailedServer(server) => {
                info!("event=remove_failed_server server={server}");
                let mut backup_team = self
                    .subsystems
                    .team_handle(true)
                    .map(|handle| handle.random_healthy_team(server))
                    .unwrap_or_default();
                if let Some(remote) = self.subsystems.team_handle(false) {
                    backup_team.extend(remote.random_healthy_team(server));
                }
                self.gateway.remove_keys_from_failed_server(server, backup_team).await?;
                self.gateway.remove_storage_server(server, None).await?;
                Ok(GenerationOutcome::Rebootstrap)
            }
            DistributorError::MoveKeysConflict | DistributorError::DdConfigChanged => {
                let still_enabled =
                    self.gateway.is_distribution_enabled().await? && self.enabled.is_enabled();
                info!(
                    "event=generation_ended error={err} durably_enabled={still_enabled}"
                );
                if still_enabled {
                    Err(err)
                } else {
                    Ok(GenerationOutcome::Rebootstrap)
                }
            }
            other => Err(other),
        }
    }

    /// Wires and supervises one generation; always resolves to an error.
    async fn run_generation(
        self: &Arc<Self>,
        config: &DatabaseConfig,
        initial: Arc<InitialDistribution>,
    ) -> Result<()> {
        self.audits.begin_generation();
        let initialized = self.audits.initialized_gate();

        let (producer_tx, producer_rx) = bus::channel();
        let (consumer_tx, consumer_rx) = bus::channel();
        let shards_affected = Arc::new(ShardsAffectedMap::new());
        *self.shards_affected.lock() = Some(shards_affected.clone());
        let physical = (self.knobs.shard_encode_location_metadata
            && self.knobs.enable_physical_shard)
            .then(|| Arc::new(PhysicalShardCollection::new()));
        let background = TaskGroup::new();

        let resume_ctx = ResumeContext {
            knobs: self.knobs.clone(),
            config: config.clone(),
            shards_affected: shards_affected.clone(),
            physical: physical.clone(),
            output: producer_tx.clone(),
            gateway: self.gateway.clone(),
            background: background.clone(),
        };
        resume_relocations(&resume_ctx, &initial).await?;
        self.audits.resume(&initial);

        let mut subordinates: JoinSet<Result<()>> = JoinSet::new();

        {
            let gateway = self.gateway.clone();
            let interval = self.knobs.move_keys_lock_poll_interval;
            subordinates.spawn(async move {
                loop {
                    sleep(interval).await;
                    gateway.poll_lock().await?;
                }
            });
        }
        {
            let gateway = self.gateway.clone();
            let supervisor = self.clone();
            subordinates.spawn(async move {
                tokio::select! {
                    watched = gateway.watch_config_change() => watched?,
                    _ = supervisor.local_config_change.notified() => {}
                }
                Err(DistributorError::DdConfigChanged)
            });
        }

        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        *self.metrics_requests.lock() = Some(metrics_tx);

        subordinates.spawn(self.subsystems.run_tracker(TrackerContext {
            initial: initial.clone(),
            output: producer_tx.clone(),
            shards_affected: shards_affected.clone(),
            ready: initialized.clone(),
            metrics_requests: metrics_rx,
        }));

        let team_size = if config.multi_region() {
            2 * config.storage_team_size
        } else {
            config.storage_team_size
        };
        subordinates.spawn(self.subsystems.run_queue(QueueContext {
            input: consumer_rx,
            lock: self.gateway.lock()?,
            team_size,
            single_region_team_size: config.storage_team_size,
        }));

        subordinates.spawn(self.subsystems.run_team_collection(TeamContext {
            primary: true,
            initial: initial.clone(),
            output: producer_tx.clone(),
            ready: initialized.clone(),
        }));
        if config.multi_region() {
            subordinates.spawn(self.subsystems.run_team_collection(TeamContext {
                primary: false,
                initial: initial.clone(),
                output: producer_tx.clone(),
                ready: initialized.clone(),
            }));
        }

        if let Some(cache) = self.subsystems.tenant_cache() {
            subordinates.spawn(cache.run_monitors());
        }

        subordinates.spawn(bus::yield_bridge(producer_rx, consumer_tx));

        if let Some(physical) = physical {
            let cadence = self.knobs.physical_shard_metrics_delay;
            subordinates.spawn(PhysicalShardCollection::monitor(physical, cadence));
        }

        initialized.open();
        info!(
            "event=generation_running distributor={} shards={} audits={}",
            self.id,
            initial.shard_count(),
            self.audits.audit_count()
        );

        let err = match subordinates.join_next().await {
            None => DistributorError::internal("generation had no subordinates"),
            Some(Ok(Ok(()))) => {
                DistributorError::internal("generation subordinate returned unexpectedly")
            }
            Some(Ok(Err(err))) => err,
            Some(Err(join_err)) if join_err.is_cancelled() => DistributorError::Cancelled,
            Some(Err(_)) => DistributorError::internal("generation subordinate panicked"),
        };
        warn!("event=generation_teardown distributor={} error={err}", self.id);
        subordinates.abort_all();
        background.abort_all();
        *self.metrics_requests.lock() = None;
        Err(err)
    }

    fn log_initial(&self, initial: &InitialDistribution) {
        if initial.shards.len() > 1 {
            let last = &initial.shards[initial.shards.len() - 2];
            let sentinel = &initial.shards[initial.shards.len() - 1];
            info!(
                "event=initial_distribution shards={} last_begin={} end={} data_moves={} audits={}",
                initial.shard_count(),
                last.key,
                sentinel.key,
                initial.data_moves.len(),
                initial.audit_states.len()
            );
        } else {
            info!("event=initial_distribution shards=0");
        }
    }
}

enum GenerationOutcome {
    Rebootstrap,
}

trait ExpectErr {
    fn expect_err_or_internal(self) -> DistributorError;
}

impl ExpectErr for Result<()> {
    fn expect_err_or_internal(self) -> DistributorError {
        match self {
            Ok(()) => DistributorError::internal("generation resolved without an error"),
            Err(err) => err,
        }
    }
}
