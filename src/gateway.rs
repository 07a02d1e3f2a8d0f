//! Durable-metadata access for the supervisor.
//!
//! All reads and writes of distributor-owned system metadata go through the
//! [`DurableGateway`], which carries the move-keys lock and retries
//! transaction conflicts with bounded backoff. Lock loss always surfaces as
//! [`DistributorError::MoveKeysConflict`] and is never retried here.

use crate::audit::state::{AuditState, AuditType};
use crate::config::{DatabaseConfig, DistributorKnobs};
use crate::error::{DistributorError, Result};
use crate::ids::{AuditId, DcId, MoveId, ServerId};
use crate::initial::InitialDistribution;
use crate::keyspace::KeyRange;
use crate::util::retry::BackoffPolicy;
use crate::util::PinFuture;
use crate::wiggle::WiggleMetrics;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::time::sleep;

/// Fenced single-writer token; any durable shard-placement mutation must
/// carry it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveKeysLock {
    pub my_owner: u64,
    pub prev_owner: u64,
    pub prev_write: u64,
}

/// Capability over the transactional KV layer. Calls are transactional with
/// read-your-writes; implementations report conflicts as
/// [`DistributorError::TransactionConflict`] and lock loss as
/// [`DistributorError::MoveKeysConflict`].
pub trait TxnProcessor: Send + Sync {
    fn take_move_keys_lock(&self, owner: ServerId) -> PinFuture<Result<MoveKeysLock>>;
    fn poll_move_keys_lock(&self, lock: MoveKeysLock) -> PinFuture<Result<()>>;
    fn database_configuration(&self) -> PinFuture<Result<DatabaseConfig>>;
    fn update_replica_keys(
        &self,
        primary: Option<DcId>,
        remote: Option<DcId>,
        config: DatabaseConfig,
    ) -> PinFuture<Result<()>>;
    fn initial_distribution(
        &self,
        lock: MoveKeysLock,
        remote_dcs: Vec<DcId>,
    ) -> PinFuture<Result<InitialDistribution>>;
    fn is_distribution_enabled(&self) -> PinFuture<Result<bool>>;
    /// Resolves once the durable distributor-enabled flag becomes true.
    fn wait_distribution_enabled(&self) -> PinFuture<Result<()>>;
    /// Resolves when the distributor configuration changes durably.
    fn watch_config_change(&self) -> PinFuture<Result<()>>;
    fn remove_keys_from_failed_server(
        &self,
        server: ServerId,
        backup_team: Vec<ServerId>,
        lock: MoveKeysLock,
    ) -> PinFuture<Result<()>>;
    fn remove_storage_server(
        &self,
        server: ServerId,
        tss_pair: Option<ServerId>,
        lock: MoveKeysLock,
    ) -> PinFuture<Result<()>>;
    fn persist_audit_state(&self, state: AuditState, lock: MoveKeysLock) -> PinFuture<Result<()>>;
    /// Persists a fresh audit state and allocates its id; this is the
    /// commit point of an audit launch.
    fn persist_new_audit_state(
        &self,
        state: AuditState,
        lock: MoveKeysLock,
    ) -> PinFuture<Result<AuditId>>;
    fn audit_states_by_range(
        &self,
        audit_type: AuditType,
        id: AuditId,
        range: KeyRange,
    ) -> PinFuture<Result<Vec<AuditState>>>;
    fn audit_states_by_server(
        &self,
        audit_type: AuditType,
        id: AuditId,
        server: ServerId,
        range: KeyRange,
    ) -> PinFuture<Result<Vec<AuditState>>>;
    /// Clears the given data-move tombstones in one system-priority
    /// transaction.
    fn clear_data_moves(&self, ids: Vec<MoveId>) -> PinFuture<Result<()>>;
    fn set_write_recovery_flag(&self, enabled: bool) -> PinFuture<Result<()>>;
    fn load_wiggle_metrics(&self, primary: bool) -> PinFuture<Result<WiggleMetrics>>;
    fn store_wiggle_metrics(&self, primary: bool, metrics: WiggleMetrics) -> PinFuture<Result<()>>;
}

pub struct DurableGateway {
    processor: Arc<dyn TxnProcessor>,
    lock: Mutex<Option<MoveKeysLock>>,
    backoff: BackoffPolicy,
}

impl DurableGateway {
    pub fn new(processor: Arc<dyn TxnProcessor>, knobs: &DistributorKnobs) -> Self {
        DurableGateway {
            processor,
            lock: Mutex::new(None),
            backoff: BackoffPolicy::exponential(knobs.gateway_retry_limit, knobs.gateway_retry_backoff)
                .with_jitter(0.2),
        }
    }

    /// Takes the cluster-wide move-keys lock and pins it for subsequent
    /// mutations through this gateway.
    pub async fn take_lock(&self, owner: ServerId) -> Result<MoveKeysLock> {
        let lock = self
            .with_conflict_retry(|| self.processor.take_move_keys_lock(owner))
            .await?;
        *self.lock.lock() = Some(lock);
        debug!("event=move_keys_lock_taken owner={owner}");
        Ok(lock)
    }

    /// The currently held lock; a gateway without one cannot mutate.
    pub fn lock(&self) -> Result<MoveKeysLock> {
        (*self.lock.lock()).ok_or_else(|| DistributorError::internal("move-keys lock not taken"))
    }

    pub async fn poll_lock(&self) -> Result<()> {
        let lock = self.lock()?;
        self.processor.poll_move_keys_lock(lock).await
    }

    pub async fn load_configuration(&self) -> Result<DatabaseConfig> {
        self.with_conflict_retry(|| self.processor.database_configuration()).await
    }

    pub async fn update_replica_keys(
        &self,
        primary: Option<DcId>,
        remote: Option<DcId>,
        config: &DatabaseConfig,
    ) -> Result<()> {
        self.with_conflict_retry(|| {
            self.processor.update_replica_keys(primary.clone(), remote.clone(), config.clone())
        })
        .await
    }

    pub async fn load_initial_distribution(
        &self,
        remote_dcs: Vec<DcId>,
    ) -> Result<InitialDistribution> {
        let lock = self.lock()?;
        self.with_conflict_retry(|| self.processor.initial_distribution(lock, remote_dcs.clone()))
            .await
    }

    pub async fn is_distribution_enabled(&self) -> Result<bool> {
        self.with_conflict_retry(|| self.processor.is_distribution_enabled()).await
    }

    pub async fn wait_distribution_enabled(&self) -> Result<()> {
        self.processor.wait_distribution_enabled().await
    }

    pub async fn watch_config_change(&self) -> Result<()> {
        self.processor.watch_config_change().await
    }

    pub async fn remove_keys_from_failed_server(
        &self,
        server: ServerId,
        backup_team: Vec<ServerId>,
    ) -> Result<()> {
        let lock = self.lock()?;
        self.with_conflict_retry(|| {
            self.processor.remove_keys_from_failed_server(server, backup_team.clone(), lock)
        })
        .await
    }

    pub async fn remove_storage_server(
        &self,
        server: ServerId,
        tss_pair: Option<ServerId>,
    ) -> Result<()> {
        let lock = self.lock()?;
        self.with_conflict_retry(|| self.processor.remove_storage_server(server, tss_pair, lock))
            .await
    }

    pub async fn persist_audit_state(&self, state: AuditState) -> Result<()> {
        let lock = self.lock()?;
        self.with_conflict_retry(|| self.processor.persist_audit_state(state.clone(), lock)).await
    }

    pub async fn persist_new_audit_state(&self, state: AuditState) -> Result<AuditId> {
        let lock = self.lock()?;
        self.with_conflict_retry(|| self.processor.persist_new_audit_state(state.clone(), lock))
            .await
    }

    pub async fn audit_states_by_range(
        &self,
        audit_type: AuditType,
        id: AuditId,
        range: KeyRange,
    ) -> Result<Vec<AuditState>> {
        self.with_conflict_retry(|| {
            self.processor.audit_states_by_range(audit_type, id, range.clone())
        })
        .await
    }

    pub async fn audit_states_by_server(
        &self,
        audit_type: AuditType,
        id: AuditId,
        server: ServerId,
        range: KeyRange,
    ) -> Result<Vec<AuditState>> {
        self.with_conflict_retry(|| {
            self.processor.audit_states_by_server(audit_type, id, server, range.clone())
        })
        .await
    }

    pub async fn clear_data_moves(&self, ids: Vec<MoveId>) -> Result<()> {
        self.with_conflict_retry(|| self.processor.clear_data_moves(ids.clone())).await
    }

    pub async fn set_write_recovery_flag(&self, enabled: bool) -> Result<()> {
        self.with_conflict_retry(|| self.processor.set_write_recovery_flag(enabled)).await
    }

    pub async fn load_wiggle_metrics(&self, primary: bool) -> Result<WiggleMetrics> {
        self.with_conflict_retry(|| self.processor.load_wiggle_metrics(primary)).await
    }

    pub async fn store_wiggle_metrics(&self, primary: bool, metrics: WiggleMetrics) -> Result<()> {
        self.with_conflict_retry(|| self.processor.store_wiggle_metrics(primary, metrics.clone()))
            .await
    }

    /// Runs an idempotent transaction, retrying conflicts with bounded
    /// backoff. Every other error passes through untouched.
    async fn with_conflict_retry<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut handle = self.backoff.handle();
        loop {
            match call().await {
                Err(DistributorError::TransactionConflict) => match handle.next_delay() {
                    Some(delay) => {
                        debug!(
                            "event=gateway_conflict_retry attempt={} delay_ms={}",
                            handle.attempts(),
                            delay.as_millis()
                        );
                        sleep(delay).await;
                    }
                    None => return Err(DistributorError::TransactionConflict),
                },
                other => return other,
            }
        }
    }
}
