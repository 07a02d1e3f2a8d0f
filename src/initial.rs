//! The one-shot snapshot of durable placement state a bootstrap loads to
//! reconstruct the supervisor's in-memory world.

use crate::audit::state::AuditState;
use crate::ids::MoveId;
use crate::keyspace::{Key, KeyRange};
use crate::shard::{DataMove, ShardDescriptor};
use serde::{Deserialize, Serialize};

/// A per-range replication override configured by an operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeOverride {
    pub range: KeyRange,
    pub replication_factor: Option<usize>,
}

/// Produced once per bootstrap by the txn processor. After the resume
/// engine and the initial trackers consume it, references may be dropped.
#[derive(Clone)]
pub struct InitialDistribution {
    /// Whether data distribution is durably enabled.
    pub mode: bool,
    /// Ordered shard descriptors; the last entry is the end-key sentinel.
    pub shards: Vec<ShardDescriptor>,
    /// Persisted data moves, ordered and disjoint by range.
    pub data_moves: Vec<(KeyRange, DataMove)>,
    /// Durable audit states to resume.
    pub audit_states: Vec<AuditState>,
    /// Finished data-move ids whose metadata should be swept.
    pub tombstones_to_clean: Vec<MoveId>,
    /// Operator range overrides, ordered and non-overlapping.
    pub range_overrides: Vec<RangeOverride>,
}

impl InitialDistribution {
    /// An empty, enabled distribution covering the whole keyspace.
    pub fn empty() -> Self {
        InitialDistribution {
            mode: true,
            shards: vec![ShardDescriptor::sentinel(Key::max())],
            data_moves: Vec::new(),
            audit_states: Vec::new(),
            tombstones_to_clean: Vec::new(),
            range_overrides: Vec::new(),
        }
    }

    /// Number of real shards (excluding the sentinel).
    pub fn shard_count(&self) -> usize {
        self.shards.len().saturating_sub(1)
    }

    pub fn override_containing(&self, key: &Key) -> Option<&RangeOverride> {
        self.range_overrides.iter().find(|o| o.range.contains_key(key))
    }

    /// Cross-checks every persisted data move against the shards it covers,
    /// cancelling moves whose shard-side state no longer matches. Runs once
    /// after load, before the resume engine replays moves.
    pub fn validate_data_moves(&mut self) {
        for window in self.shards.windows(2) {
            let shard = &window[0];
            let range = KeyRange::new(shard.key.clone(), window[1].key.clone());
            for (move_range, data_move) in &mut self.data_moves {
                if move_range.overlaps(&range) {
                    data_move.validate_shard(shard, &range);
                }
            }
        }
    }
}
