//! Size-class rounding for relocatable allocations
//!
//! A request is padded with the per-entry overhead and rounded up to the next
//! power of two, or to three quarters of it when that still fits. That gives
//! two classes per octave: 16, 24, 32, 48, 64, 96, ...

use crate::error::{MemoryError, Result};

/// Largest payload the relocatable pools accept.
pub const POOLED_MAX_VALUE_LENGTH: usize = 1024 * 1024;

/// Length prefix stored in front of every relocatable payload.
pub const OBJECT_LENGTH_LENGTH: usize = 4;

/// Referrer back-reference kept in every relocatable slot.
pub const FIXED_OVERHEAD_PER_ENTRY: usize = 8;

/// Hard ceiling on a rounded allocation.
pub const MAX_ALLOCATION: usize =
    POOLED_MAX_VALUE_LENGTH + OBJECT_LENGTH_LENGTH + FIXED_OVERHEAD_PER_ENTRY;

/// Rounded allocation size for a relocatable object of `length` bytes.
pub fn allocation_size_for_object(length: usize) -> Result<usize> {
    let length_to_fit = length
        .checked_add(OBJECT_LENGTH_LENGTH + FIXED_OVERHEAD_PER_ENTRY)
        .ok_or(MemoryError::ObjectTooLarge { requested: length })?;

    let mut target = length_to_fit.next_power_of_two();
    let three_quarters = target - (target >> 2);
    if length_to_fit < three_quarters {
        target = three_quarters;
    }

    if target <= MAX_ALLOCATION {
        Ok(target)
    } else if length_to_fit <= MAX_ALLOCATION {
        Ok(MAX_ALLOCATION)
    } else {
        Err(MemoryError::ObjectTooLarge { requested: length })
    }
}

/// Number of slots a relocatable pool of `alloc_size` puts in each buffer.
pub fn elements_per_buffer(alloc_size: usize, buffer_bytes: usize) -> usize {
    ((buffer_bytes - 1) / alloc_size) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_sizes_alternate_between_power_and_three_quarters() {
        // 0 + 12 overhead = 12, exactly three quarters of 16
        assert_eq!(allocation_size_for_object(0).unwrap(), 16);
        assert_eq!(allocation_size_for_object(1).unwrap(), 16);
        assert_eq!(allocation_size_for_object(4).unwrap(), 16);
        assert_eq!(allocation_size_for_object(5).unwrap(), 24);
        assert_eq!(allocation_size_for_object(11).unwrap(), 24);
        // 24 is not strictly below three quarters of 32
        assert_eq!(allocation_size_for_object(12).unwrap(), 32);
        assert_eq!(allocation_size_for_object(13).unwrap(), 32);
        assert_eq!(allocation_size_for_object(100).unwrap(), 128);
        assert_eq!(allocation_size_for_object(83).unwrap(), 96);
    }

    #[test]
    fn test_rounding_is_monotonic_and_covers_the_request() {
        let mut previous = 0;
        let mut length = 0;
        while length <= POOLED_MAX_VALUE_LENGTH {
            let size = allocation_size_for_object(length).unwrap();
            assert!(size >= previous, "not monotonic at {}", length);
            assert!(size >= length + OBJECT_LENGTH_LENGTH + FIXED_OVERHEAD_PER_ENTRY);
            assert!(size <= MAX_ALLOCATION);
            previous = size;
            length += if length < 4096 { 1 } else { 997 };
        }
    }

    #[test]
    fn test_clamps_to_maximum() {
        assert_eq!(
            allocation_size_for_object(POOLED_MAX_VALUE_LENGTH).unwrap(),
            MAX_ALLOCATION
        );
        assert_eq!(allocation_size_for_object(800 * 1024).unwrap(), 1024 * 1024);
        assert_eq!(
            allocation_size_for_object(1024 * 1024 - 11).unwrap(),
            MAX_ALLOCATION
        );
    }

    #[test]
    fn test_rejects_oversized_objects() {
        let err = allocation_size_for_object(POOLED_MAX_VALUE_LENGTH + 1).unwrap_err();
        assert_eq!(
            err,
            MemoryError::ObjectTooLarge {
                requested: POOLED_MAX_VALUE_LENGTH + 1
            }
        );
        assert!(allocation_size_for_object(usize::MAX).is_err());
    }

    #[test]
    fn test_elements_per_buffer_covers_two_megabytes() {
        assert_eq!(elements_per_buffer(16, 2 * 1024 * 1024), 131072);
        assert_eq!(elements_per_buffer(24, 2 * 1024 * 1024), 87382);
        assert_eq!(elements_per_buffer(MAX_ALLOCATION, 2 * 1024 * 1024), 2);
    }
}
