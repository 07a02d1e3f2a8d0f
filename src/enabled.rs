//! Process-wide distributor enablement latch.
//!
//! Snapshot and blob-restore preparation both need exclusive ownership of
//! the distributor: while either is preparing, shard movement must not run.
//! Transitions are compare-and-set on the `(mode, owner)` pair; only the
//! owner that disabled the distributor may re-enable it.

use crate::ids::{ServerId, SnapUid};
use parking_lot::Mutex;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Mode {
    Enabled,
    SnapshotPreparing(SnapUid),
    BlobRestorePreparing(ServerId),
}

/// Token identifying which operation disabled the distributor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Owner {
    Snapshot(SnapUid),
    BlobRestore(ServerId),
}

pub struct DdEnabledState {
    mode: Mutex<Mode>,
}

impl Default for DdEnabledState {
    fn default() -> Self {
        DdEnabledState::new()
    }
}

impl DdEnabledState {
    pub fn new() -> Self {
        DdEnabledState { mode: Mutex::new(Mode::Enabled) }
    }

    pub fn is_enabled(&self) -> bool {
        *self.mode.lock() == Mode::Enabled
    }

    pub fn is_snapshot_preparing(&self) -> bool {
        matches!(*self.mode.lock(), Mode::SnapshotPreparing(_))
    }

    pub fn is_blob_restore_preparing(&self) -> bool {
        matches!(*self.mode.lock(), Mode::BlobRestorePreparing(_))
    }

    /// True when the blob-restore latch is held by `requester`.
    pub fn same_blob_restore_owner(&self, requester: ServerId) -> bool {
        *self.mode.lock() == Mode::BlobRestorePreparing(requester)
    }

    /// Claims the latch for a snapshot. Fails if any owner already holds it.
    pub fn try_set_snapshot(&self, uid: SnapUid) -> bool {
        let mut mode = self.mode.lock();
        if *mode != Mode::Enabled {
            return false;
        }
        *mode = Mode::SnapshotPreparing(uid);
        true
    }

    /// Claims the latch for blob-restore preparation.
    pub fn try_set_blob_restore(&self, requester: ServerId) -> bool {
        let mut mode = self.mode.lock();
        if *mode != Mode::Enabled {
            return false;
        }
        *mode = Mode::BlobRestorePreparing(requester);
        true
    }

    /// Releases the latch. Only the owner that claimed it may release; a
    /// release while already enabled succeeds (the latch is idempotent in
    /// that direction).
    pub fn try_set_enabled(&self, owner: Owner) -> bool {
        let mut mode = self.mode.lock();
        let matches_owner = match (*mode, owner) {
            (Mode::Enabled, _) => true,
            (Mode::SnapshotPreparing(held), Owner::Snapshot(uid)) => held == uid,
            (Mode::BlobRestorePreparing(held), Owner::BlobRestore(id)) => held == id,
            _ => false,
        };
        if matches_owner {
            *mode = Mode::Enabled;
        }
        matches_owner
    }
}

impl fmt::Debug for DdEnabledState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DdEnabledState({:?})", *self.mode.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_owner_is_rejected() {
        let state = DdEnabledState::new();
        assert!(state.try_set_snapshot(SnapUid(1)));
        assert!(!state.try_set_snapshot(SnapUid(2)));
        assert!(!state.try_set_blob_restore(ServerId(3)));
        assert!(state.is_snapshot_preparing());
    }

    #[test]
    fn only_the_owner_re_enables() {
        let state = DdEnabledState::new();
        assert!(state.try_set_blob_restore(ServerId(7)));
        assert!(!state.try_set_enabled(Owner::Snapshot(SnapUid(7))));
        assert!(!state.try_set_enabled(Owner::BlobRestore(ServerId(8))));
        assert!(state.try_set_enabled(Owner::BlobRestore(ServerId(7))));
        assert!(state.is_enabled());
    }

    #[test]
    fn enabling_while_enabled_is_idempotent() {
        let state = DdEnabledState::new();
        assert!(state.try_set_enabled(Owner::Snapshot(SnapUid(1))));
        assert!(state.is_enabled());
    }
}
