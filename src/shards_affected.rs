//! The shards-affected map: the unit-of-tracking registry shared between
//! the resume engine, the tracker, and the team collections.
//!
//! The map records which team(s) currently host each defined range and
//! which ranges need their tracker restarted after a restored data move.
//! It is mutated only from the supervisor's task tree.

use crate::ids::ServerId;
use crate::keyspace::{Key, KeyRange};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// An ordered replica group hosting a range in one region.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Team {
    pub servers: Vec<ServerId>,
    pub primary: bool,
}

impl Team {
    pub fn primary(servers: Vec<ServerId>) -> Self {
        Team { servers, primary: true }
    }

    pub fn remote(servers: Vec<ServerId>) -> Self {
        Team { servers, primary: false }
    }
}

#[derive(Default)]
struct Inner {
    // Keyed by range begin; ranges are kept disjoint by construction.
    shards: BTreeMap<Key, (KeyRange, Vec<Team>)>,
    restart_requests: Vec<KeyRange>,
}

/// Shared handle to the map.
#[derive(Default)]
pub struct ShardsAffectedMap {
    inner: Mutex<Inner>,
}

impl ShardsAffectedMap {
    pub fn new() -> Self {
        ShardsAffectedMap::default()
    }

    /// Registers a range as a tracked unit.
    pub fn define_shard(&self, range: KeyRange) {
        let mut inner = self.inner.lock();
        inner.shards.insert(range.begin.clone(), (range, Vec::new()));
    }

    /// Records the teams currently hosting a defined range.
    pub fn move_shard(&self, range: &KeyRange, teams: Vec<Team>) {
        let mut inner = self.inner.lock();
        if let Some((_, entry)) = inner.shards.get_mut(&range.begin) {
            *entry = teams;
        } else {
            inner.shards.insert(range.begin.clone(), (range.clone(), teams));
        }
    }

    /// Asks the tracker to restart its watch on `range` (used when a
    /// restored data move spans previously merged shards).
    pub fn request_tracker_restart(&self, range: KeyRange) {
        self.inner.lock().restart_requests.push(range);
    }

    pub fn teams_for(&self, begin: &Key) -> Option<Vec<Team>> {
        self.inner.lock().shards.get(begin).map(|(_, teams)| teams.clone())
    }

    pub fn defined_ranges(&self) -> Vec<KeyRange> {
        self.inner.lock().shards.values().map(|(range, _)| range.clone()).collect()
    }

    pub fn restart_requests(&self) -> Vec<KeyRange> {
        self.inner.lock().restart_requests.clone()
    }

    pub fn shard_count(&self) -> usize {
        self.inner.lock().shards.len()
    }

    /// Drops all tracked state; called synchronously when a generation is
    /// cancelled.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.shards.clear();
        inner.restart_requests.clear();
    }
}
