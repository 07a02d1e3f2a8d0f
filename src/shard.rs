//! Shard placement records, data-move plans, and the relocation work item
//! the supervisor hands to the queue.

use crate::config::{PRIORITY_RECOVER_MOVE, PRIORITY_SPLIT_SHARD, PRIORITY_TEAM_UNHEALTHY};
use crate::ids::{MoveId, ServerId};
use crate::keyspace::{Key, KeyRange};
use log::error;
use serde::{Deserialize, Serialize};

/// One contiguous key range's current source and (optional) destination
/// replica sets. `key` is the range begin; the next descriptor's `key`
/// delimits the end, so a shard list always carries a trailing sentinel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub key: Key,
    pub primary_src: Vec<ServerId>,
    pub remote_src: Vec<ServerId>,
    pub primary_dest: Vec<ServerId>,
    pub remote_dest: Vec<ServerId>,
    pub src_id: MoveId,
    pub dest_id: MoveId,
    pub has_dest: bool,
}

impl ShardDescriptor {
    /// A sentinel descriptor marking the end key of the last shard.
    pub fn sentinel(key: Key) -> Self {
        ShardDescriptor {
            key,
            primary_src: Vec::new(),
            remote_src: Vec::new(),
            primary_dest: Vec::new(),
            remote_dest: Vec::new(),
            src_id: MoveId::ANONYMOUS,
            dest_id: MoveId::ANONYMOUS,
            has_dest: false,
        }
    }
}

/// Durable metadata of a data-move plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMoveMeta {
    pub id: MoveId,
    pub ranges: Vec<KeyRange>,
}

/// An in-flight or persisted plan to move one or more ranges to the given
/// destination teams.
#[derive(Clone, Debug)]
pub struct DataMove {
    pub meta: DataMoveMeta,
    pub primary_dest: Vec<ServerId>,
    pub remote_dest: Vec<ServerId>,
    pub valid: bool,
    pub cancelled: bool,
}

impl DataMove {
    pub fn new(meta: DataMoveMeta, primary_dest: Vec<ServerId>, remote_dest: Vec<ServerId>) -> Self {
        DataMove { meta, primary_dest, remote_dest, valid: true, cancelled: false }
    }

    /// Cross-checks this move against a shard it is supposed to cover.
    /// Any mismatch marks the move cancelled so the resume path schedules a
    /// cancel relocation instead of restoring it.
    pub fn validate_shard(&mut self, shard: &ShardDescriptor, range: &KeyRange) {
        if !self.valid {
            if shard.has_dest && !shard.dest_id.is_anonymous() {
                error!(
                    "event=data_move_validation reason=data_move_missing range={} dest_id={}",
                    range, shard.dest_id
                );
            }
            return;
        }
        debug_assert!(
            !self.meta.ranges.is_empty() && self.meta.ranges[0].contains_range(range),
            "valid data move must cover the shard range"
        );
        if !shard.has_dest {
            error!(
                "event=data_move_validation reason=shard_missing_dest range={} move_id={}",
                range, self.meta.id
            );
            self.cancelled = true;
            return;
        }
        if shard.dest_id != self.meta.id {
            error!(
                "event=data_move_validation reason=move_id_mismatch range={} move_id={} shard_dest_id={}",
                range, self.meta.id, shard.dest_id
            );
            self.cancelled = true;
            return;
        }
        let includes =
            |dest: &[ServerId], of: &[ServerId]| of.iter().all(|server| dest.contains(server));
        if !includes(&self.primary_dest, &shard.primary_dest)
            || !includes(&self.remote_dest, &shard.remote_dest)
        {
            error!(
                "event=data_move_validation reason=dest_team_mismatch range={} move_id={}",
                range, self.meta.id
            );
            self.cancelled = true;
        }
    }
}

/// Why a relocation was scheduled; fixes its queue priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveReason {
    RecoverMove,
    TeamUnhealthy,
    SplitShard,
}

impl MoveReason {
    pub fn priority(self) -> i32 {
        match self {
            MoveReason::RecoverMove => PRIORITY_RECOVER_MOVE,
            MoveReason::TeamUnhealthy => PRIORITY_TEAM_UNHEALTHY,
            MoveReason::SplitShard => PRIORITY_SPLIT_SHARD,
        }
    }
}

/// A unit of relocation work, produced by the supervisor and consumed by
/// the queue over the relocation bus.
#[derive(Clone, Debug)]
pub struct RelocateShard {
    pub keys: KeyRange,
    pub reason: MoveReason,
    pub priority: i32,
    pub data_move_id: MoveId,
    pub data_move: Option<DataMove>,
    pub cancelled: bool,
}

impl RelocateShard {
    pub fn new(keys: KeyRange, reason: MoveReason) -> Self {
        RelocateShard {
            keys,
            reason,
            priority: reason.priority(),
            data_move_id: MoveId::ANONYMOUS,
            data_move: None,
            cancelled: false,
        }
    }

    /// A restored relocation resumes a persisted data move; it always
    /// carries the move's non-anonymous id.
    pub fn is_restore(&self) -> bool {
        self.data_move.is_some()
    }
}
