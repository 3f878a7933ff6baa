//! Partition identity
//!
//! Every thread carries a thread partition id (whose work it is physically
//! doing) and an engine partition id (on whose behalf). The two reserved
//! values are distinct variants rather than magic integers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Raw id reserved for the shared multi-partition (replicated) context.
pub const MP_PARTITION_RAW: i32 = 16383;

/// Raw id reported when a thread has no partition assigned.
pub const UNASSIGNED_PARTITION_RAW: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PartitionId {
    /// A regular site
    Site(i32),
    /// The shared replicated-memory context
    Mp,
    /// No partition assigned yet (fresh threads, test contexts)
    Unassigned,
}

impl PartitionId {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            MP_PARTITION_RAW => PartitionId::Mp,
            r if r < 0 => PartitionId::Unassigned,
            r => PartitionId::Site(r),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            PartitionId::Site(id) => id,
            PartitionId::Mp => MP_PARTITION_RAW,
            PartitionId::Unassigned => UNASSIGNED_PARTITION_RAW,
        }
    }

    pub fn is_mp(self) -> bool {
        self == PartitionId::Mp
    }

    pub fn is_site(self) -> bool {
        matches!(self, PartitionId::Site(_))
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        PartitionId::Unassigned
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionId::Site(id) => write!(f, "{}", id),
            PartitionId::Mp => write!(f, "mp({})", MP_PARTITION_RAW),
            PartitionId::Unassigned => write!(f, "unassigned"),
        }
    }
}

/// Shared, swappable partition id cell.
///
/// The engine partition id travels with a [`PoolLocals`](super::PoolLocals)
/// bundle, so a thread that adopts another context also adopts its id.
#[derive(Debug)]
pub struct PartitionCell(AtomicI32);

impl PartitionCell {
    pub fn new(id: PartitionId) -> Self {
        Self(AtomicI32::new(id.as_raw()))
    }

    pub fn get(&self) -> PartitionId {
        PartitionId::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, id: PartitionId) {
        self.0.store(id.as_raw(), Ordering::Release);
    }
}
