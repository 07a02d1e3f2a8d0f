//! Identifier newtypes shared across the distributor.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// A fresh, non-zero random id.
            pub fn random() -> Self {
                $name(rand::thread_rng().gen_range(1..=u64::MAX))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{:016x}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

id_type!(
    /// A storage server (or distributor process) identity.
    ServerId,
    "ss-"
);
id_type!(
    /// A data-move plan identity. `MoveId::ANONYMOUS` marks a move whose
    /// destination has not been assigned yet.
    MoveId,
    "mv-"
);
id_type!(
    /// A durable storage-audit identity, allocated by the txn processor.
    AuditId,
    "audit-"
);
id_type!(
    /// A cluster snapshot identity, chosen by the requester.
    SnapUid,
    "snap-"
);

impl MoveId {
    pub const ANONYMOUS: MoveId = MoveId(0);

    pub fn is_anonymous(self) -> bool {
        self == MoveId::ANONYMOUS
    }
}

/// A datacenter (region) identity.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DcId(pub String);

impl DcId {
    pub fn new(name: impl Into<String>) -> Self {
        DcId(name.into())
    }
}

impl fmt::Debug for DcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc:{}", self.0)
    }
}

impl fmt::Display for DcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A process network address. Storage servers may expose a secondary
/// address; exclusion checks match either.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u64);

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr:{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
