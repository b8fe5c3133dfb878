//! Total order over change-log entries.
//!
//! Every entry in a Persisted Change Stream is positioned by an [`OrderKey`]:
//! the store-supplied [`ClusterTime`] first, and a byte-comparable
//! [`EntryId`] to break ties between entries committed at the same cluster
//! time (for example the several writes of one multi-document transaction).
//!
//! Wall-clock time never takes part in this order.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::{Generator, Ulid};

/// Logical/hybrid timestamp handed out by the backing store.
///
/// `t` is the seconds component and `i` the increment within that second.
/// Derived ordering compares `t` first, then `i`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterTime {
    pub t: u32,
    pub i: u32,
}

impl ClusterTime {
    /// The smallest cluster time.
    pub const ZERO: ClusterTime = ClusterTime { t: 0, i: 0 };

    pub const fn new(t: u32, i: u32) -> Self {
        Self { t, i }
    }

    /// The cluster time immediately before this one, saturating at zero.
    pub fn predecessor(&self) -> Self {
        if self.i > 0 {
            Self::new(self.t, self.i - 1)
        } else if self.t > 0 {
            Self::new(self.t - 1, u32::MAX)
        } else {
            Self::ZERO
        }
    }
}

impl fmt::Display for ClusterTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.t, self.i)
    }
}

/// Globally unique, fixed-width entry identifier.
///
/// Backed by a ULID; comparison is unsigned lexicographic over the 16
/// big-endian bytes, which is exactly the numeric order of the inner `u128`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Ulid);

impl EntryId {
    /// The all-zero id. Never assigned to a real entry.
    pub const MIN: EntryId = EntryId(Ulid(0));

    /// The all-ones id.
    pub const MAX: EntryId = EntryId(Ulid(u128::MAX));

    /// A fresh random id. Use [`EntryIdGenerator`] when several ids minted in
    /// the same millisecond must keep their creation order.
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Raw big-endian bytes.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }

    /// Parse the canonical 26-character string form.
    pub fn parse(s: &str) -> Option<Self> {
        Ulid::from_string(s).ok().map(Self)
    }

    fn predecessor(&self) -> Option<Self> {
        self.0 .0.checked_sub(1).map(|raw| Self(Ulid(raw)))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mints strictly increasing entry ids.
///
/// Ids generated within the same millisecond increment the random part, so
/// entries sharing a cluster time keep the order in which they were minted.
pub struct EntryIdGenerator {
    inner: Generator,
}

impl fmt::Debug for EntryIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryIdGenerator").finish_non_exhaustive()
    }
}

impl Default for EntryIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryIdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Generator::new(),
        }
    }

    /// Returns `None` only when the random component would overflow within a
    /// single millisecond.
    pub fn next_id(&mut self) -> Option<EntryId> {
        self.inner.generate().ok().map(EntryId)
    }
}

/// Position of an entry in the change log: `(cluster_time, entry_id)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    #[serde(rename = "ct")]
    pub cluster_time: ClusterTime,
    #[serde(rename = "id")]
    pub entry_id: EntryId,
}

impl OrderKey {
    pub const MIN: OrderKey = OrderKey {
        cluster_time: ClusterTime::ZERO,
        entry_id: EntryId::MIN,
    };

    pub const fn new(cluster_time: ClusterTime, entry_id: EntryId) -> Self {
        Self {
            cluster_time,
            entry_id,
        }
    }

    /// A key that sorts before every real entry committed at `cluster_time`.
    pub const fn lower_bound(cluster_time: ClusterTime) -> Self {
        Self::new(cluster_time, EntryId::MIN)
    }

    /// The key immediately preceding this one in key space.
    ///
    /// Used to turn an inclusive starting entry into an exclusive cursor.
    pub fn just_before(&self) -> Self {
        match self.entry_id.predecessor() {
            Some(id) => Self::new(self.cluster_time, id),
            None if *self == Self::MIN => Self::MIN,
            None => Self::new(self.cluster_time.predecessor(), EntryId::MAX),
        }
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_time, self.entry_id)
    }
}

/// Anything positioned in the change-log order.
pub trait Sequenced {
    fn order_key(&self) -> OrderKey;
}

impl Sequenced for OrderKey {
    fn order_key(&self) -> OrderKey {
        *self
    }
}
