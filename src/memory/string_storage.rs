//! Size-class registry for relocatable allocations

use super::compacting_pool::CompactingStringPool;
use super::size_class::elements_per_buffer;
use std::collections::HashMap;
use tracing::debug;

/// Maps a rounded allocation size to the pool serving it. Pools are created
/// lazily and live as long as the owning memory context.
#[derive(Debug)]
pub struct CompactingStringStorage {
    pools: HashMap<usize, CompactingStringPool>,
    buffer_bytes: usize,
}

impl CompactingStringStorage {
    pub fn new(buffer_bytes: usize) -> Self {
        Self {
            pools: HashMap::new(),
            buffer_bytes,
        }
    }

    /// Pool for `alloc_size`, created on first use.
    pub fn pool_for_size(&mut self, alloc_size: usize) -> &mut CompactingStringPool {
        let buffer_bytes = self.buffer_bytes;
        self.pools.entry(alloc_size).or_insert_with(|| {
            let per_buffer = elements_per_buffer(alloc_size, buffer_bytes);
            debug!(
                alloc_size,
                elements_per_buffer = per_buffer,
                "Creating relocatable pool"
            );
            CompactingStringPool::new(alloc_size, per_buffer)
        })
    }

    /// Pool for `alloc_size` if one was ever created.
    pub fn existing_pool(&mut self, alloc_size: usize) -> Option<&mut CompactingStringPool> {
        self.pools.get_mut(&alloc_size)
    }

    pub fn existing_pool_ref(&self, alloc_size: usize) -> Option<&CompactingStringPool> {
        self.pools.get(&alloc_size)
    }

    /// Sum of every pool's raw footprint.
    pub fn bytes_allocated(&self) -> usize {
        self.pools.values().map(CompactingStringPool::bytes_allocated).sum()
    }

    /// Live allocations across all size classes.
    pub fn live_count(&self) -> usize {
        self.pools.values().map(CompactingStringPool::count).sum()
    }

    pub fn size_classes(&self) -> usize {
        self.pools.len()
    }
}
