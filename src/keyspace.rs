//! Keys and key ranges. Shards are half-open ranges over the total keyspace
//! `[Key::MIN, Key::MAX)`; consecutive shard boundaries tile it exactly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque, byte-ordered key. The empty key is the minimum; the single
/// byte `0xff` is the exclusive upper sentinel of the user keyspace.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    pub const fn new(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }

    /// The minimum key (empty byte string).
    pub fn min() -> Self {
        Key(Vec::new())
    }

    /// The exclusive end of the total keyspace.
    pub fn max() -> Self {
        Key(vec![0xff])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_min(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Key {
    fn from(value: &[u8]) -> Self {
        Key(value.to_vec())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k`")?;
        for byte in &self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        write!(f, "`")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A half-open key range `[begin, end)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: Key, end: Key) -> Self {
        KeyRange { begin, end }
    }

    /// The total keyspace `[Key::MIN, Key::MAX)`.
    pub fn entire() -> Self {
        KeyRange { begin: Key::min(), end: Key::max() }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        *key >= self.begin && *key < self.end
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.begin >= self.begin && other.end <= self.end
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Splits `self` at every boundary strictly inside it, in order.
    /// `boundaries` must be sorted ascending. Always returns at least one
    /// sub-range; the sub-ranges tile `self` exactly.
    pub fn split_at(&self, boundaries: &[Key]) -> Vec<KeyRange> {
        let mut pieces = Vec::new();
        let mut begin = self.begin.clone();
        for boundary in boundaries {
            if *boundary <= begin {
                continue;
            }
            if *boundary >= self.end {
                break;
            }
            pieces.push(KeyRange::new(begin.clone(), boundary.clone()));
            begin = boundary.clone();
        }
        pieces.push(KeyRange::new(begin, self.end.clone()));
        pieces
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {})", self.begin, self.end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {})", self.begin, self.end)
    }
}
