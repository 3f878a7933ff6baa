//! Relocating pools on top of [`ContiguousAllocator`]
//!
//! Every live allocation is bound to exactly one [`Referrer`]. Freeing an
//! interior slot copies the last slot into the hole and retargets the moved
//! slot's referrer, so the pool stays packed and only ever shrinks from the
//! tail.
//!
//! ```text
//! slot: [ back-reference (8) | element bytes ... ]
//!             │
//!             └─→ Referrer cell (slot index), rewritten on relocation
//! ```

use super::contiguous::ContiguousAllocator;
use super::size_class::{FIXED_OVERHEAD_PER_ENTRY, OBJECT_LENGTH_LENGTH};
use crate::error::{fatal, MemoryError, Result};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

/// The one external handle to a relocatable allocation.
///
/// Not `Clone`: relocation rewrites exactly one referrer, so a second copy
/// would silently point at another object after the next compaction.
pub struct Referrer {
    slot: Arc<AtomicU32>,
}

impl Referrer {
    /// Current slot index of the allocation.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot.load(Ordering::Acquire) as usize
    }
}

impl fmt::Debug for Referrer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Referrer(slot={})", self.slot())
    }
}

/// Fixed-size relocating pool.
pub struct CompactingPool {
    allocator: ContiguousAllocator,
    element_size: usize,
}

impl CompactingPool {
    /// Pool of `element_size`-byte elements; each slot also carries the
    /// referrer back-reference.
    pub fn new(element_size: usize, elements_per_buffer: usize) -> Self {
        Self {
            allocator: ContiguousAllocator::new(
                element_size + FIXED_OVERHEAD_PER_ENTRY,
                elements_per_buffer,
            ),
            element_size,
        }
    }

    /// Allocates a zeroed element and binds it to a fresh referrer.
    pub fn malloc(&mut self) -> Referrer {
        let index = self.allocator.alloc();
        let cell = Arc::new(AtomicU32::new(index as u32));
        let back = Arc::into_raw(Arc::clone(&cell)) as usize as u64;

        let slot = self.allocator.slot_mut(index);
        slot[..FIXED_OVERHEAD_PER_ENTRY].copy_from_slice(&back.to_ne_bytes());
        slot[FIXED_OVERHEAD_PER_ENTRY..].fill(0);

        Referrer { slot: cell }
    }

    /// Releases the element behind `referrer`, relocating the last element
    /// into its slot when needed.
    pub fn free(&mut self, referrer: Referrer) -> Result<()> {
        let hole = referrer.slot();
        if hole >= self.allocator.count()
            || self.back_reference(hole) != Arc::as_ptr(&referrer.slot)
        {
            return Err(MemoryError::ForeignReferrer { slot: hole });
        }

        // SAFETY: the back-reference was produced by Arc::into_raw in malloc
        // and is released exactly once, here.
        drop(unsafe { Arc::from_raw(self.back_reference(hole)) });

        let last = self.allocator.count() - 1;
        if hole != last {
            self.allocator.copy_slot(last, hole);
            let moved = self.back_reference(hole);
            // SAFETY: the moved slot's back-reference still owns a strong count
            unsafe { (*moved).store(hole as u32, Ordering::Release) };
            metrics::counter!(crate::telemetry::RELOCATIONS_TOTAL).increment(1);
            trace!(from = last, to = hole, "Relocated compacting pool element");
        }
        self.allocator.trim();
        Ok(())
    }

    fn back_reference(&self, index: usize) -> *const AtomicU32 {
        let mut raw = [0u8; FIXED_OVERHEAD_PER_ENTRY];
        raw.copy_from_slice(&self.allocator.slot(index)[..FIXED_OVERHEAD_PER_ENTRY]);
        u64::from_ne_bytes(raw) as usize as *const AtomicU32
    }

    /// Element bytes behind `referrer`.
    pub fn payload(&self, referrer: &Referrer) -> &[u8] {
        &self.allocator.slot(referrer.slot())[FIXED_OVERHEAD_PER_ENTRY..]
    }

    pub fn payload_mut(&mut self, referrer: &Referrer) -> &mut [u8] {
        &mut self.allocator.slot_mut(referrer.slot())[FIXED_OVERHEAD_PER_ENTRY..]
    }

    /// Raw footprint of the backing allocator, at buffer granularity.
    pub fn bytes_allocated(&self) -> usize {
        self.allocator.bytes_allocated()
    }

    pub fn count(&self) -> usize {
        self.allocator.count()
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn buffer_count(&self) -> usize {
        self.allocator.buffer_count()
    }
}

impl Drop for CompactingPool {
    fn drop(&mut self) {
        for index in 0..self.allocator.count() {
            // SAFETY: each live slot owns one strong count from malloc
            drop(unsafe { Arc::from_raw(self.back_reference(index)) });
        }
    }
}

impl fmt::Debug for CompactingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactingPool")
            .field("element_size", &self.element_size)
            .field("allocator", &self.allocator)
            .finish()
    }
}

/// Relocating pool of length-prefixed byte strings.
///
/// The first four bytes of each element hold the requested length; that
/// header is all the thread-local pool needs to find the size class again
/// on free.
#[derive(Debug)]
pub struct CompactingStringPool {
    pool: CompactingPool,
}

impl CompactingStringPool {
    pub fn new(alloc_size: usize, elements_per_buffer: usize) -> Self {
        Self {
            pool: CompactingPool::new(alloc_size, elements_per_buffer),
        }
    }

    /// Maximum string length an element can hold.
    pub fn capacity(&self) -> usize {
        self.pool.element_size() - OBJECT_LENGTH_LENGTH
    }

    /// Allocates a zeroed string of `len` bytes.
    pub fn malloc(&mut self, len: usize) -> Referrer {
        if len > self.capacity() {
            fatal(MemoryError::StringTooLong {
                len,
                capacity: self.capacity(),
            });
        }
        let referrer = self.pool.malloc();
        self.pool.payload_mut(&referrer)[..OBJECT_LENGTH_LENGTH]
            .copy_from_slice(&(len as i32).to_le_bytes());
        referrer
    }

    pub fn free(&mut self, referrer: Referrer) -> Result<()> {
        self.pool.free(referrer)
    }

    /// Length recorded in the size header.
    pub fn sized_len(&self, referrer: &Referrer) -> usize {
        let mut raw = [0u8; OBJECT_LENGTH_LENGTH];
        raw.copy_from_slice(&self.pool.payload(referrer)[..OBJECT_LENGTH_LENGTH]);
        i32::from_le_bytes(raw) as usize
    }

    pub fn data(&self, referrer: &Referrer) -> &[u8] {
        let len = self.sized_len(referrer);
        &self.pool.payload(referrer)[OBJECT_LENGTH_LENGTH..OBJECT_LENGTH_LENGTH + len]
    }

    pub fn data_mut(&mut self, referrer: &Referrer) -> &mut [u8] {
        let len = self.sized_len(referrer);
        &mut self.pool.payload_mut(referrer)[OBJECT_LENGTH_LENGTH..OBJECT_LENGTH_LENGTH + len]
    }

    pub fn bytes_allocated(&self) -> usize {
        self.pool.bytes_allocated()
    }

    pub fn count(&self) -> usize {
        self.pool.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(pool: &mut CompactingPool, referrer: &Referrer, byte: u8) {
        pool.payload_mut(referrer).fill(byte);
    }

    #[test]
    fn test_free_of_interior_slot_relocates_the_last() {
        let mut pool = CompactingPool::new(17, 7);
        let referrers: Vec<Referrer> = (0..8u8)
            .map(|i| {
                let r = pool.malloc();
                fill(&mut pool, &r, i + 1);
                r
            })
            .collect();
        assert_eq!(pool.buffer_count(), 2);

        let mut referrers = referrers.into_iter();
        let first = referrers.next().unwrap();
        let second = referrers.next().unwrap();
        let third = referrers.next().unwrap();
        let rest: Vec<Referrer> = referrers.collect();
        let third_slot = third.slot();

        pool.free(third).unwrap();

        assert_eq!(pool.count(), 7);
        assert_eq!(pool.bytes_allocated(), 7 * (17 + FIXED_OVERHEAD_PER_ENTRY));
        // the former 8th object now lives in the freed slot
        let eighth = rest.last().unwrap();
        assert_eq!(eighth.slot(), third_slot);
        assert!(pool.payload(eighth).iter().all(|&b| b == 8));

        assert!(pool.payload(&first).iter().all(|&b| b == 1));
        assert!(pool.payload(&second).iter().all(|&b| b == 2));
        for (offset, r) in rest.iter().enumerate() {
            let expected = offset as u8 + 4;
            assert!(pool.payload(r).iter().all(|&b| b == expected));
        }
    }

    #[test]
    fn test_free_of_last_slot_does_not_relocate() {
        let mut pool = CompactingPool::new(8, 4);
        let a = pool.malloc();
        let b = pool.malloc();
        pool.free(b).unwrap();
        assert_eq!(a.slot(), 0);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_foreign_referrer_is_rejected() {
        let mut ours = CompactingPool::new(8, 4);
        let mut theirs = CompactingPool::new(8, 4);
        let _keep = ours.malloc();
        let foreign = theirs.malloc();
        assert_eq!(
            ours.free(foreign),
            Err(MemoryError::ForeignReferrer { slot: 0 })
        );
    }

    #[test]
    fn test_string_pool_keeps_length_header() {
        let mut pool = CompactingStringPool::new(32, 4);
        assert_eq!(pool.capacity(), 28);
        let hello = pool.malloc(5);
        pool.data_mut(&hello).copy_from_slice(b"hello");
        let world = pool.malloc(11);
        pool.data_mut(&world).copy_from_slice(b"big world!!");

        pool.free(hello).unwrap();
        assert_eq!(world.slot(), 0);
        assert_eq!(pool.sized_len(&world), 11);
        assert_eq!(pool.data(&world), b"big world!!");
    }

    #[test]
    #[should_panic(expected = "String of 29 bytes does not fit a 28-byte pooled element")]
    fn test_string_longer_than_the_element_is_fatal() {
        let mut pool = CompactingStringPool::new(32, 4);
        pool.malloc(29);
    }
}
