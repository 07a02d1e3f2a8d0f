//! Durable storage-audit state, persisted across distributor restarts.

use crate::ids::{AuditId, ServerId};
use crate::keyspace::KeyRange;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum AuditType {
    /// Cross-region replica comparison.
    Ha,
    /// Replica comparison within the primary region.
    Replica,
    /// Location metadata vs. actually hosted ranges.
    LocationMetadata,
    /// Per-server shard assignment consistency.
    ServerShard,
}

impl fmt::Display for AuditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditType::Ha => "ha",
            AuditType::Replica => "replica",
            AuditType::LocationMetadata => "location_metadata",
            AuditType::ServerShard => "server_shard",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum AuditPhase {
    /// No progress recorded yet for a sub-range.
    Invalid,
    Running,
    Complete,
    /// Completed and found a data-level inconsistency.
    Error,
    /// Gave up after exhausting retries.
    Failed,
}

impl AuditPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, AuditPhase::Complete | AuditPhase::Error | AuditPhase::Failed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditState {
    pub id: AuditId,
    pub audit_type: AuditType,
    pub range: KeyRange,
    pub phase: AuditPhase,
}

impl AuditState {
    pub fn new(audit_type: AuditType, range: KeyRange) -> Self {
        AuditState { id: AuditId::default(), audit_type, range, phase: AuditPhase::Invalid }
    }
}

/// RPC payload asking one storage server to audit a sub-range, comparing
/// itself against `target_servers` where the audit type requires peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRequest {
    pub id: AuditId,
    pub range: KeyRange,
    pub audit_type: AuditType,
    pub target_servers: Vec<ServerId>,
}
