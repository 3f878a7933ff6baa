//! Allocation tracking for exact-sized objects
//!
//! When enabled, every exact-sized allocation is recorded under the memory
//! context that produced it. Frees through a different context, double hand
//! outs and leftovers at context teardown are all reported.

use super::partition::PartitionId;
use crate::error::{MemoryError, Result};
use dashmap::DashMap;
use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use tracing::error;

#[derive(Debug, Default)]
struct ContextAllocations {
    by_size: HashMap<usize, HashSet<usize>>,
}

/// Live exact-sized allocations, keyed by memory-context id.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    contexts: DashMap<u64, ContextAllocations>,
}

lazy_static! {
    static ref TRACKER: AllocationTracker = AllocationTracker::default();
}

impl AllocationTracker {
    /// Process-wide tracker shared by every context.
    pub fn global() -> &'static AllocationTracker {
        &TRACKER
    }

    pub fn record_alloc(
        &self,
        context: u64,
        partition: PartitionId,
        size: usize,
        addr: usize,
    ) -> Result<()> {
        let mut entry = self.contexts.entry(context).or_default();
        if !entry.by_size.entry(size).or_default().insert(addr) {
            error!(addr, size, %partition, "Pointer handed out twice");
            return Err(MemoryError::DoubleAllocation { addr, partition });
        }
        Ok(())
    }

    pub fn record_free(
        &self,
        context: u64,
        partition: PartitionId,
        size: usize,
        addr: usize,
    ) -> Result<()> {
        let removed = self
            .contexts
            .get_mut(&context)
            .and_then(|mut entry| entry.by_size.get_mut(&size).map(|set| set.remove(&addr)))
            .unwrap_or(false);
        if removed {
            return Ok(());
        }

        let owner = self
            .contexts
            .iter()
            .find(|entry| {
                entry
                    .by_size
                    .get(&size)
                    .map_or(false, |set| set.contains(&addr))
            })
            .map(|entry| *entry.key());
        error!(
            addr,
            size,
            %partition,
            allocating_context = ?owner,
            "Deallocated data pointer in wrong context"
        );
        Err(MemoryError::ForeignPointer {
            addr,
            size,
            partition,
        })
    }

    /// Forgets `context` and returns whatever it still had outstanding.
    pub fn drain_context(&self, context: u64) -> Vec<(usize, usize)> {
        let mut leaked: Vec<(usize, usize)> = self
            .contexts
            .remove(&context)
            .map(|(_, allocations)| {
                allocations
                    .by_size
                    .into_iter()
                    .flat_map(|(size, addrs)| addrs.into_iter().map(move |addr| (size, addr)))
                    .collect()
            })
            .unwrap_or_default();
        leaked.sort_unstable();
        leaked
    }

    pub fn outstanding(&self, context: u64) -> usize {
        self.contexts
            .get(&context)
            .map_or(0, |entry| entry.by_size.values().map(HashSet::len).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_allocation_is_reported() {
        let tracker = AllocationTracker::default();
        tracker.record_alloc(1, PartitionId::Site(0), 16, 0x1000).unwrap();
        assert_eq!(
            tracker.record_alloc(1, PartitionId::Site(0), 16, 0x1000),
            Err(MemoryError::DoubleAllocation {
                addr: 0x1000,
                partition: PartitionId::Site(0)
            })
        );
    }

    #[test]
    fn test_free_through_other_context_is_foreign() {
        let tracker = AllocationTracker::default();
        tracker.record_alloc(1, PartitionId::Site(0), 32, 0x2000).unwrap();
        let err = tracker
            .record_free(2, PartitionId::Site(1), 32, 0x2000)
            .unwrap_err();
        assert!(matches!(err, MemoryError::ForeignPointer { size: 32, .. }));
        tracker.record_free(1, PartitionId::Site(0), 32, 0x2000).unwrap();
        assert_eq!(tracker.outstanding(1), 0);
    }

    #[test]
    fn test_drain_reports_leftovers() {
        let tracker = AllocationTracker::default();
        tracker.record_alloc(5, PartitionId::Mp, 8, 0x30).unwrap();
        tracker.record_alloc(5, PartitionId::Mp, 64, 0x10).unwrap();
        assert_eq!(tracker.drain_context(5), vec![(8, 0x30), (64, 0x10)]);
        assert!(tracker.drain_context(5).is_empty());
    }
}
