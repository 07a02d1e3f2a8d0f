mod support;

use shardherd::{
    AuditEngine, AuditId, AuditPhase, AuditState, AuditType, DatabaseConfig, DistributorError,
    DistributorKnobs, DurableGateway, InitialDistribution, DcId, ServerId,
};
use std::sync::Arc;
use std::time::Duration;
use support::{
    range, server, wait_until, AuditQueryBehavior, AuditRpcBehavior, MockCluster, MockTxn,
};

fn fast_knobs() -> DistributorKnobs {
    let mut knobs = DistributorKnobs::default();
    knobs.audit_retry_count_max = 3;
    knobs.audit_retry_backoff = Duration::from_millis(1);
    knobs.audit_child_spacing = Duration::from_millis(1);
    knobs.audit_sustained_failure_timeout = Duration::from_millis(100);
    knobs
}

struct Harness {
    engine: Arc<AuditEngine>,
    txn: Arc<MockTxn>,
    cluster: Arc<MockCluster>,
}

async fn harness() -> Harness {
    let txn = MockTxn::new(DatabaseConfig::single_region(2), InitialDistribution::empty());
    let cluster = MockCluster::new();
    *cluster.range_primary.lock() = vec![server(1, 101), server(2, 102)];
    let knobs = Arc::new(fast_knobs());
    let gateway = Arc::new(DurableGateway::new(txn.clone(), &knobs));
    gateway.take_lock(ServerId(99)).await.unwrap();
    let engine = Arc::new(AuditEngine::new(ServerId(99), knobs, gateway, cluster.clone()));
    engine.initialized_gate().open();
    engine.resume(&InitialDistribution::empty());
    Harness { engine, txn, cluster }
}

#[tokio::test]
async fn launch_runs_to_completion_and_persists_the_phase() {
    let h = harness().await;
    let id = h.engine.trigger(AuditType::Replica, range("a", "z")).await.unwrap();

    let engine = h.engine.clone();
    wait_until(move || engine.audit_count() == 0, Duration::from_secs(5)).await;

    let durable = h.txn.durable_audit(AuditType::Replica, id).unwrap();
    assert_eq!(durable.phase, AuditPhase::Complete);
    assert_eq!(durable.range, range("a", "z"));

    // One replica comparison: a target plus its single primary peer.
    let calls = h.cluster.audit_calls.lock().clone();
    assert_eq!(calls.len(), 1);
    let (target, request) = &calls[0];
    assert_eq!(request.target_servers.len(), 1);
    assert_ne!(request.target_servers[0], *target);
}

#[tokio::test]
async fn trigger_joins_a_running_audit_whose_range_contains_the_request() {
    let h = harness().await;
    *h.txn.audit_query_behavior.lock() = AuditQueryBehavior::Hang;

    let id = h.engine.trigger(AuditType::Ha, range("a", "z")).await.unwrap();
    assert_eq!(h.engine.audit_count(), 1);

    let joined = h.engine.trigger(AuditType::Ha, range("c", "d")).await.unwrap();
    assert_eq!(joined, id);
    assert_eq!(h.engine.audit_count(), 1, "no second audit may start");
}

#[tokio::test]
async fn uncontained_request_against_a_running_audit_exhausts_retries() {
    let h = harness().await;
    *h.txn.audit_query_behavior.lock() = AuditQueryBehavior::Hang;

    let id = h.engine.trigger(AuditType::Ha, range("a", "z")).await.unwrap();
    let err = h.engine.trigger(AuditType::Ha, range("x", "zz")).await.unwrap_err();
    assert_eq!(err, DistributorError::AuditStorageFailed);

    // A different audit type is unaffected by the per-type limit.
    let other = h.engine.trigger(AuditType::Replica, range("a", "z")).await.unwrap();
    assert_ne!(other, id);
    assert_eq!(h.engine.audit_count(), 2);
}

#[tokio::test]
async fn child_failures_retry_until_the_audit_is_marked_failed() {
    let h = harness().await;
    *h.cluster.audit_behavior.lock() = AuditRpcBehavior::Fail;

    let id = h.engine.trigger(AuditType::Replica, range("a", "z")).await.unwrap();

    let engine = h.engine.clone();
    wait_until(move || engine.audit_count() == 0, Duration::from_secs(5)).await;

    let durable = h.txn.durable_audit(AuditType::Replica, id).unwrap();
    assert_eq!(durable.phase, AuditPhase::Failed);
    // One RPC per generation: the initial run plus three retries.
    assert_eq!(h.cluster.audit_call_count(), 4);
}

#[tokio::test]
async fn data_inconsistency_finishes_the_audit_in_the_error_phase() {
    let h = harness().await;
    *h.cluster.audit_behavior.lock() = AuditRpcBehavior::Inconsistent;

    let id = h.engine.trigger(AuditType::Replica, range("a", "z")).await.unwrap();

    let engine = h.engine.clone();
    wait_until(move || engine.audit_count() == 0, Duration::from_secs(5)).await;

    let durable = h.txn.durable_audit(AuditType::Replica, id).unwrap();
    assert_eq!(durable.phase, AuditPhase::Error);
    assert_eq!(h.cluster.audit_call_count(), 1, "a data error is terminal, not retried");
}

#[tokio::test]
async fn resume_restarts_running_audits_and_skips_terminal_states() {
    let txn = MockTxn::new(DatabaseConfig::single_region(2), InitialDistribution::empty());
    let cluster = MockCluster::new();
    *txn.audit_query_behavior.lock() = AuditQueryBehavior::Hang;
    let knobs = Arc::new(fast_knobs());
    let gateway = Arc::new(DurableGateway::new(txn.clone(), &knobs));
    gateway.take_lock(ServerId(99)).await.unwrap();
    let engine = Arc::new(AuditEngine::new(ServerId(99), knobs, gateway, cluster));

    let mut initial = InitialDistribution::empty();
    initial.audit_states = vec![
        AuditState {
            id: AuditId(5),
            audit_type: AuditType::Ha,
            range: range("a", "z"),
            phase: AuditPhase::Running,
        },
        AuditState {
            id: AuditId(6),
            audit_type: AuditType::Replica,
            range: range("a", "z"),
            phase: AuditPhase::Complete,
        },
    ];

    engine.begin_generation();
    engine.initialized_gate().open();
    engine.resume(&initial);

    assert!(engine.audit_initialized_gate().is_open());
    assert_eq!(engine.audit_count(), 1);
    assert!(engine.running_audit(AuditType::Ha, AuditId(5)).is_some());
    assert!(engine.running_audit(AuditType::Replica, AuditId(6)).is_none());
}

#[tokio::test]
async fn server_shard_audit_walks_every_server_but_tss() {
    let h = harness().await;
    let mut tss = server(3, 103);
    tss.is_tss = true;
    *h.cluster.storage.lock() = vec![server(1, 101), server(2, 102), tss];

    let id = h.engine.trigger(AuditType::ServerShard, range("a", "z")).await.unwrap();

    let engine = h.engine.clone();
    wait_until(move || engine.audit_count() == 0, Duration::from_secs(5)).await;

    let durable = h.txn.durable_audit(AuditType::ServerShard, id).unwrap();
    assert_eq!(durable.phase, AuditPhase::Complete);

    let mut audited: Vec<ServerId> =
        h.cluster.audit_calls.lock().iter().map(|(server, _)| *server).collect();
    audited.sort();
    assert_eq!(audited, vec![ServerId(1), ServerId(2)]);
}

#[tokio::test]
async fn ha_audit_targets_one_primary_and_one_server_per_remote_region() {
    let h = harness().await;
    *h.cluster.range_remotes.lock() =
        vec![(DcId::new("east"), vec![server(11, 201), server(12, 202)])];

    let id = h.engine.trigger(AuditType::Ha, range("a", "z")).await.unwrap();

    let engine = h.engine.clone();
    wait_until(move || engine.audit_count() == 0, Duration::from_secs(5)).await;

    assert_eq!(h.txn.durable_audit(AuditType::Ha, id).unwrap().phase, AuditPhase::Complete);
    let calls = h.cluster.audit_calls.lock().clone();
    assert_eq!(calls.len(), 1);
    let (target, request) = &calls[0];
    assert!(matches!(target, ServerId(1) | ServerId(2)), "target comes from the primary region");
    assert_eq!(request.target_servers.len(), 1);
    assert!(matches!(request.target_servers[0], ServerId(11) | ServerId(12)));
}

#[tokio::test]
async fn single_replica_ranges_are_skipped_not_failed() {
    let h = harness().await;
    // HA audit without a remote region: nothing to compare against.
    let ha_id = h.engine.trigger(AuditType::Ha, range("a", "z")).await.unwrap();
    // Replica audit with a single primary server: same.
    *h.cluster.range_primary.lock() = vec![server(1, 101)];
    let replica_id = h.engine.trigger(AuditType::Replica, range("a", "z")).await.unwrap();

    let engine = h.engine.clone();
    wait_until(move || engine.audit_count() == 0, Duration::from_secs(5)).await;

    assert_eq!(h.txn.durable_audit(AuditType::Ha, ha_id).unwrap().phase, AuditPhase::Complete);
    assert_eq!(
        h.txn.durable_audit(AuditType::Replica, replica_id).unwrap().phase,
        AuditPhase::Complete
    );
    assert_eq!(h.cluster.audit_call_count(), 0);
}

#[tokio::test]
async fn cancel_all_aborts_and_empties_the_runtime_map() {
    let h = harness().await;
    *h.txn.audit_query_behavior.lock() = AuditQueryBehavior::Hang;
    let id = h.engine.trigger(AuditType::LocationMetadata, range("a", "z")).await.unwrap();
    let audit = h.engine.running_audit(AuditType::LocationMetadata, id).unwrap();

    h.engine.cancel_all();
    assert!(audit.is_cancelled());
    assert_eq!(h.engine.audit_count(), 0);
    // The durable record still says Running; the next resume owns it.
    assert_eq!(
        h.txn.durable_audit(AuditType::LocationMetadata, id).unwrap().phase,
        AuditPhase::Running
    );
}
