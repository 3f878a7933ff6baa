//! Allocators and per-thread memory contexts
//!
//! - [`ContiguousAllocator`] / [`NodeArena`]: fixed-size slots reclaimed from the tail
//! - [`CompactingPool`] / [`CompactingStringPool`]: relocating pools bound to one [`Referrer`]
//! - [`CompactingStringStorage`]: relocatable size classes of one context
//! - [`ExactSizePools`]: fixed-size objects, one pool per size
//! - [`ThreadLocalPool`] / [`PoolLocals`]: the calling thread's memory context

pub mod compacting_pool;
pub mod contiguous;
pub mod exact_pool;
pub mod partition;
pub mod size_class;
pub mod string_storage;
pub mod thread_local_pool;
pub mod tracking;

pub use compacting_pool::{CompactingPool, CompactingStringPool, Referrer};
pub use contiguous::{ContiguousAllocator, NodeArena, NIL};
pub use exact_pool::{ExactSizePools, PoolForObjectSize};
pub use partition::{PartitionId, MP_PARTITION_RAW, UNASSIGNED_PARTITION_RAW};
pub use size_class::{allocation_size_for_object, MAX_ALLOCATION, POOLED_MAX_VALUE_LENGTH};
pub use string_storage::CompactingStringStorage;
pub use thread_local_pool::{PoolLocals, Relocatable, ThreadLocalPool};
pub use tracking::AllocationTracker;
