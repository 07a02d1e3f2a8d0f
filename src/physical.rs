//! Physical-shard bookkeeping, kept only when location metadata carries the
//! physical-shard encoding.

use crate::ids::MoveId;
use crate::keyspace::KeyRange;
use crate::shards_affected::Team;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
struct PhysicalShardEntry {
    ranges: Vec<KeyRange>,
    teams: Vec<Team>,
}

#[derive(Default)]
pub struct PhysicalShardCollection {
    shards: Mutex<HashMap<MoveId, PhysicalShardEntry>>,
}

impl PhysicalShardCollection {
    pub fn new() -> Self {
        PhysicalShardCollection::default()
    }

    /// Seeds one physical shard from the initial distribution.
    pub fn init_shard(&self, id: MoveId, range: KeyRange, teams: Vec<Team>) {
        let mut shards = self.shards.lock();
        let entry = shards
            .entry(id)
            .or_insert_with(|| PhysicalShardEntry { ranges: Vec::new(), teams });
        entry.ranges.push(range);
    }

    pub fn remove_range(&self, id: MoveId, range: &KeyRange) {
        if let Some(entry) = self.shards.lock().get_mut(&id) {
            entry.ranges.retain(|r| r != range);
        }
    }

    pub fn len(&self) -> usize {
        self.shards.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.lock().is_empty()
    }

    fn clean_up(&self) -> usize {
        let mut shards = self.shards.lock();
        let before = shards.len();
        shards.retain(|_, entry| !entry.ranges.is_empty());
        before - shards.len()
    }

    fn log_status(&self) {
        let shards = self.shards.lock();
        let ranges: usize = shards.values().map(|entry| entry.ranges.len()).sum();
        info!("event=physical_shard_status shards={} ranges={}", shards.len(), ranges);
    }

    /// Periodically drops empty physical shards and logs collection status.
    pub async fn monitor(collection: Arc<Self>, cadence: Duration) -> crate::error::Result<()> {
        loop {
            let removed = collection.clean_up();
            if removed > 0 {
                debug!("event=physical_shard_cleanup removed={removed}");
            }
            collection.log_status();
            tokio::time::sleep(cadence).await;
        }
    }
}
