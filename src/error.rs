//! Memory core error types
//!
//! Nothing at this layer is recoverable: every variant describes a caller
//! bug. Inner layers still return [`Result`] so the condition can be
//! inspected, and the public static entry points route it through [`fatal`].

use crate::memory::partition::PartitionId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Attempted to allocate an object larger than the 1 MB limit. Requested size was {requested}")]
    ObjectTooLarge { requested: usize },

    #[error("Attempted to free an object of an unrecognized size. Requested size was {alloc_size}")]
    UnknownRelocatableSize { alloc_size: usize },

    #[error("String of {len} bytes does not fit a {capacity}-byte pooled element")]
    StringTooLong { len: usize, capacity: usize },

    #[error("Failed to locate an allocated object of size {size} to free it")]
    UnknownExactSize { size: usize },

    #[error("Deallocated data pointer {addr:#x} of size {size} in wrong context (partition {partition})")]
    ForeignPointer {
        addr: usize,
        size: usize,
        partition: PartitionId,
    },

    #[error("Referrer for slot {slot} does not belong to this pool")]
    ForeignReferrer { slot: usize },

    #[error("Previously allocated pointer {addr:#x} is being allocated a second time (partition {partition})")]
    DoubleAllocation { addr: usize, partition: PartitionId },

    #[error("{count} allocation(s) leaked by partition {partition}")]
    Leak { partition: PartitionId, count: usize },

    #[error("No memory context is installed on this thread")]
    NoThreadContext,

    #[error("Memory context misuse: {0}")]
    ContextMisuse(String),

    #[error("Barrier misuse: {0}")]
    BarrierMisuse(String),

    #[error("Structure invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Logs `err` with the calling thread's partition identity and panics.
///
/// This is the single exit point for the fail-fast policy; it never returns.
#[track_caller]
pub fn fatal(err: MemoryError) -> ! {
    let thread = std::thread::current();
    tracing::error!(
        thread = thread.name().unwrap_or("<unnamed>"),
        thread_partition = %crate::memory::ThreadLocalPool::thread_partition_id_checked(),
        engine_partition = %crate::memory::ThreadLocalPool::engine_partition_id_checked(),
        "fatal memory error: {}",
        err
    );
    panic!("{}", err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = MemoryError::ObjectTooLarge { requested: 2_000_000 };
        assert_eq!(
            err.to_string(),
            "Attempted to allocate an object larger than the 1 MB limit. Requested size was 2000000"
        );

        let err = MemoryError::Leak {
            partition: PartitionId::Site(3),
            count: 2,
        };
        assert!(err.to_string().contains("partition 3"));
    }

    #[test]
    #[should_panic(expected = "Barrier misuse: re-entered")]
    fn test_fatal_panics_with_display_text() {
        fatal(MemoryError::BarrierMisuse("re-entered".to_string()));
    }
}
