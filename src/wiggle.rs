//! Storage-wiggle priority engine.
//!
//! An ordered queue of storage servers eligible for rolling replacement.
//! Wrongly-configured servers come first; within the same flag, older
//! servers come first. A server appears at most once.

use crate::config::DistributorKnobs;
use crate::error::Result;
use crate::gateway::DurableGateway;
use crate::ids::ServerId;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Storage-engine flavour recorded at server registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreKind {
    SsdBtree,
    SsdRocksDb,
    Memory,
}

/// Ordering key of the wiggle queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Registration time, as an offset on the engine's monotonic clock.
    pub created_at: Duration,
    pub store_kind: StoreKind,
    pub wrong_configured: bool,
}

impl ServerMetadata {
    pub fn new(created_at: Duration, store_kind: StoreKind, wrong_configured: bool) -> Self {
        ServerMetadata { created_at, store_kind, wrong_configured }
    }
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct WiggleKey {
    // false sorts first, so wrongly-configured servers lead the queue.
    right_configured: bool,
    created_at: Duration,
}

impl WiggleKey {
    fn of(meta: &ServerMetadata) -> Self {
        WiggleKey { right_configured: !meta.wrong_configured, created_at: meta.created_at }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WiggleError {
    #[error("server {0} is already queued for wiggle")]
    AlreadyQueued(ServerId),
    #[error("server {0} is not queued for wiggle")]
    NotQueued(ServerId),
}

/// Exponentially-smoothed wiggle statistics, persisted per region through
/// the durable gateway.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WiggleMetrics {
    pub last_wiggle_start: Option<Duration>,
    pub last_wiggle_finish: Option<Duration>,
    pub last_round_start: Option<Duration>,
    pub last_round_finish: Option<Duration>,
    pub finished_wiggles: u64,
    pub finished_rounds: u64,
    pub smoothed_wiggle_seconds: f64,
    pub smoothed_round_seconds: f64,
}

pub struct WiggleEngine {
    queue: BTreeSet<(WiggleKey, ServerId)>,
    members: HashMap<ServerId, ServerMetadata>,
    metrics: WiggleMetrics,
    min_server_age: Duration,
    smoothing_alpha: f64,
}

impl WiggleEngine {
    pub fn new(knobs: &DistributorKnobs) -> Self {
        WiggleEngine {
            queue: BTreeSet::new(),
            members: HashMap::new(),
            metrics: WiggleMetrics::default(),
            min_server_age: knobs.wiggle_min_server_age,
            smoothing_alpha: knobs.wiggle_smoothing_alpha,
        }
    }

    /// Queues a newly registered server. Fails if already present.
    pub fn add(&mut self, server: ServerId, meta: ServerMetadata) -> std::result::Result<(), WiggleError> {
        if self.members.contains_key(&server) {
            return Err(WiggleError::AlreadyQueued(server));
        }
        self.queue.insert((WiggleKey::of(&meta), server));
        self.members.insert(server, meta);
        Ok(())
    }

    /// Drops a server; no-op when absent (it may have been popped already).
    pub fn remove(&mut self, server: ServerId) {
        if let Some(meta) = self.members.remove(&server) {
            self.queue.remove(&(WiggleKey::of(&meta), server));
        }
    }

    /// Re-keys a queued server in place; no-op when the key is unchanged.
    pub fn update(&mut self, server: ServerId, meta: ServerMetadata) -> std::result::Result<(), WiggleError> {
        let current = self.members.get(&server).ok_or(WiggleError::NotQueued(server))?;
        if WiggleKey::of(current) == WiggleKey::of(&meta) {
            self.members.insert(server, meta);
            return Ok(());
        }
        self.queue.remove(&(WiggleKey::of(current), server));
        self.queue.insert((WiggleKey::of(&meta), server));
        self.members.insert(server, meta);
        Ok(())
    }

    pub fn contains(&self, server: ServerId) -> bool {
        self.members.contains_key(&server)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn necessary(&self, meta: &ServerMetadata, now: Duration) -> bool {
        meta.wrong_configured
            || now.saturating_sub(meta.created_at) > self.min_server_age
    }

    /// Pops and returns the minimum-keyed server. With `necessary_only`,
    /// a head that is neither wrongly configured nor past the minimum age
    /// leaves the queue untouched and yields nothing.
    pub fn next(&mut self, necessary_only: bool, now: Duration) -> Option<ServerId> {
        let (key, server) = self.queue.first()?.clone();
        let meta = self.members.get(&server)?;
        if necessary_only && !self.necessary(meta, now) {
            return None;
        }
        self.queue.remove(&(key, server));
        self.members.remove(&server);
        Some(server)
    }

    /// A round was closed (or never opened) and can start again.
    fn should_start_new_round(&self) -> bool {
        match (self.metrics.last_round_start, self.metrics.last_round_finish) {
            (None, _) => true,
            (Some(start), Some(finish)) => finish >= start,
            (Some(_), None) => false,
        }
    }

    /// The round finishes when the queue first re-empties after its start.
    fn should_finish_round(&self) -> bool {
        if !self.queue.is_empty() {
            return false;
        }
        match (self.metrics.last_round_start, self.metrics.last_round_finish) {
            (Some(start), Some(finish)) => start > finish,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Stamps the start of one server's wiggle, opening a new round when
    /// the previous one has closed.
    pub fn start_wiggle(&mut self, now: Duration) {
        self.metrics.last_wiggle_start = Some(now);
        if self.should_start_new_round() {
            self.metrics.last_round_start = Some(now);
            info!("event=wiggle_round_start at_secs={}", now.as_secs_f64());
        }
    }

    /// Stamps the finish of one server's wiggle and, when the queue has
    /// drained, closes the round.
    pub fn finish_wiggle(&mut self, now: Duration) {
        self.metrics.last_wiggle_finish = Some(now);
        self.metrics.finished_wiggles += 1;
        if let Some(start) = self.metrics.last_wiggle_start {
            let duration = now.saturating_sub(start).as_secs_f64();
            self.metrics.smoothed_wiggle_seconds = smooth(
                self.metrics.smoothed_wiggle_seconds,
                duration,
                self.smoothing_alpha,
            );
        }
        if self.should_finish_round() {
            self.metrics.last_round_finish = Some(now);
            self.metrics.finished_rounds += 1;
            if let Some(start) = self.metrics.last_round_start {
                let duration = now.saturating_sub(start).as_secs_f64();
                self.metrics.smoothed_round_seconds = smooth(
                    self.metrics.smoothed_round_seconds,
                    duration,
                    self.smoothing_alpha,
                );
            }
            info!(
                "event=wiggle_round_finish finished_rounds={} smoothed_round_secs={:.3}",
                self.metrics.finished_rounds, self.metrics.smoothed_round_seconds
            );
        }
    }

    pub fn metrics(&self) -> &WiggleMetrics {
        &self.metrics
    }

    /// Zeroes the statistics and persists the reset.
    pub async fn reset_stats(&mut self, gateway: &DurableGateway, primary: bool) -> Result<()> {
        self.metrics = WiggleMetrics::default();
        gateway.store_wiggle_metrics(primary, self.metrics.clone()).await
    }

    /// Reloads persisted statistics into the engine.
    pub async fn restore_stats(&mut self, gateway: &DurableGateway, primary: bool) -> Result<()> {
        self.metrics = gateway.load_wiggle_metrics(primary).await?;
        Ok(())
    }

    /// Persists the current statistics.
    pub async fn persist_stats(&self, gateway: &DurableGateway, primary: bool) -> Result<()> {
        gateway.store_wiggle_metrics(primary, self.metrics.clone()).await
    }
}

fn smooth(current: f64, sample: f64, alpha: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        current + (sample - current) * alpha
    }
}
