//! Contiguous slab allocator
//!
//! Fixed-size slots packed into a chain of fixed-capacity buffers. Slots are
//! handed out and reclaimed strictly at the logical end of the packed
//! sequence, so a free never leaves a hole behind: callers that want to
//! release an interior slot first copy the last slot into it and then trim.
//!
//! ```text
//! buffers: [ 0 1 2 3 ] [ 4 5 6 7 ] [ 8 9 . . ]
//!                                        ^ last()
//! cached:  none | one empty buffer kept after draining to zero
//! ```

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

/// Minimum alignment of every buffer.
const BUFFER_ALIGN: usize = 8;

/// One fixed-capacity block of slots.
struct Buffer {
    data: NonNull<u8>,
    layout: Layout,
}

impl Buffer {
    fn new(layout: Layout) -> Self {
        // SAFETY: layout has a non-zero size (checked by ContiguousAllocator::new)
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(data) => Self { data, layout },
            // Running out of memory here is not recoverable.
            None => alloc::handle_alloc_error(layout),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // SAFETY: data was allocated with exactly this layout
        unsafe { alloc::dealloc(self.data.as_ptr(), self.layout) }
    }
}

/// Fixed-size slot allocator with last-in-first-out reclamation.
pub struct ContiguousAllocator {
    element_size: usize,
    elements_per_buffer: usize,
    layout: Layout,
    /// Buffer chain, oldest first; the last entry is the active head.
    buffers: Vec<Buffer>,
    /// One empty buffer kept across a drain-to-empty/refill cycle.
    cached: Option<Buffer>,
    count: usize,
}

// SAFETY: the allocator exclusively owns its buffers; shared access only
// hands out reads.
unsafe impl Send for ContiguousAllocator {}
unsafe impl Sync for ContiguousAllocator {}

impl ContiguousAllocator {
    /// Creates an allocator of `element_size`-byte slots, grouped
    /// `elements_per_buffer` to a buffer.
    pub fn new(element_size: usize, elements_per_buffer: usize) -> Self {
        Self::with_alignment(element_size, elements_per_buffer, BUFFER_ALIGN)
    }

    /// Same as [`ContiguousAllocator::new`] with a stricter buffer alignment.
    pub fn with_alignment(element_size: usize, elements_per_buffer: usize, align: usize) -> Self {
        assert!(element_size > 0, "element_size must be greater than 0");
        assert!(elements_per_buffer > 0, "elements_per_buffer must be greater than 0");
        let layout = Layout::from_size_align(
            element_size * elements_per_buffer,
            align.max(BUFFER_ALIGN),
        )
        .unwrap_or_else(|e| panic!("invalid contiguous buffer layout: {}", e));

        Self {
            element_size,
            elements_per_buffer,
            layout,
            buffers: Vec::new(),
            cached: None,
            count: 0,
        }
    }

    /// Allocates a slot at the end of the packed sequence and returns its index.
    ///
    /// The slot contents are uninitialized.
    pub fn alloc(&mut self) -> usize {
        if self.count == self.buffers.len() * self.elements_per_buffer {
            let buffer = match self.cached.take() {
                Some(buffer) => buffer,
                None => Buffer::new(self.layout),
            };
            self.buffers.push(buffer);
        }
        self.count += 1;
        self.count - 1
    }

    /// Index of the logical last slot, if any.
    #[inline]
    pub fn last(&self) -> Option<usize> {
        self.count.checked_sub(1)
    }

    /// Releases the last slot. Never moves data.
    pub fn trim(&mut self) {
        assert!(self.count > 0, "trim on an empty contiguous allocator");
        self.count -= 1;

        if self.count % self.elements_per_buffer == 0 {
            if let Some(buffer) = self.buffers.pop() {
                if self.buffers.is_empty() {
                    self.cached = Some(buffer);
                }
            }
        }
    }

    /// Raw address of slot `index`.
    pub fn slot_ptr(&self, index: usize) -> NonNull<u8> {
        assert!(
            index < self.count,
            "slot {} out of range (count {})",
            index,
            self.count
        );
        let buffer = &self.buffers[index / self.elements_per_buffer];
        let offset = (index % self.elements_per_buffer) * self.element_size;
        // SAFETY: offset is within the buffer's layout
        unsafe { NonNull::new_unchecked(buffer.data.as_ptr().add(offset)) }
    }

    /// Bytes of slot `index`.
    pub fn slot(&self, index: usize) -> &[u8] {
        let ptr = self.slot_ptr(index);
        // SAFETY: the slot is element_size bytes inside a live buffer
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.element_size) }
    }

    /// Mutable bytes of slot `index`.
    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let ptr = self.slot_ptr(index);
        // SAFETY: unique borrow of self; the slot is element_size bytes
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.element_size) }
    }

    /// Copies the bytes of slot `from` over slot `to`.
    pub fn copy_slot(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        let src = self.slot_ptr(from);
        let dst = self.slot_ptr(to);
        // SAFETY: distinct slots never overlap
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), self.element_size) }
    }

    /// Number of live slots.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    #[inline]
    pub fn elements_per_buffer(&self) -> usize {
        self.elements_per_buffer
    }

    /// Buffers in the live chain (the cached spare is not counted).
    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn has_cached_buffer(&self) -> bool {
        self.cached.is_some()
    }

    /// Raw footprint of the live chain, at buffer granularity.
    pub fn bytes_allocated(&self) -> usize {
        self.buffers.len() * self.layout.size()
    }
}

impl fmt::Debug for ContiguousAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContiguousAllocator")
            .field("element_size", &self.element_size)
            .field("elements_per_buffer", &self.elements_per_buffer)
            .field("count", &self.count)
            .field("buffers", &self.buffers.len())
            .field("cached", &self.cached.is_some())
            .finish()
    }
}

/// Sentinel index meaning "no node".
pub const NIL: u32 = u32::MAX;

/// Typed node storage on top of a [`ContiguousAllocator`].
///
/// Nodes are addressed by index. Removal is always "move the last node into
/// the hole, then trim", and reports which index moved so the owner can
/// retarget its links.
pub struct NodeArena<T> {
    raw: ContiguousAllocator,
    _marker: PhantomData<T>,
}

// SAFETY: NodeArena owns its nodes exactly like a Vec<T> would.
unsafe impl<T: Send> Send for NodeArena<T> {}
unsafe impl<T: Sync> Sync for NodeArena<T> {}

impl<T> NodeArena<T> {
    pub fn new(nodes_per_buffer: usize) -> Self {
        assert!(mem::size_of::<T>() > 0, "zero-sized nodes are not supported");
        Self {
            raw: ContiguousAllocator::with_alignment(
                mem::size_of::<T>(),
                nodes_per_buffer,
                mem::align_of::<T>(),
            ),
            _marker: PhantomData,
        }
    }

    /// Stores `value` in a new slot at the end and returns its index.
    pub fn alloc(&mut self, value: T) -> u32 {
        let index = self.raw.alloc();
        assert!(index < NIL as usize, "node arena exhausted");
        // SAFETY: fresh slot, correctly sized and aligned for T
        unsafe { ptr::write(self.raw.slot_ptr(index).as_ptr() as *mut T, value) };
        index as u32
    }

    #[inline]
    pub fn get(&self, index: u32) -> &T {
        // SAFETY: slot_ptr bounds-checks; every live slot holds an initialized T
        unsafe { &*(self.raw.slot_ptr(index as usize).as_ptr() as *const T) }
    }

    #[inline]
    pub fn get_mut(&mut self, index: u32) -> &mut T {
        // SAFETY: as in get, plus the unique borrow of self
        unsafe { &mut *(self.raw.slot_ptr(index as usize).as_ptr() as *mut T) }
    }

    /// Two distinct nodes, both mutable.
    pub fn get_pair_mut(&mut self, a: u32, b: u32) -> (&mut T, &mut T) {
        assert_ne!(a, b, "get_pair_mut needs distinct nodes");
        let pa = self.raw.slot_ptr(a as usize).as_ptr() as *mut T;
        let pb = self.raw.slot_ptr(b as usize).as_ptr() as *mut T;
        // SAFETY: distinct slots never alias
        unsafe { (&mut *pa, &mut *pb) }
    }

    #[inline]
    pub fn last(&self) -> Option<u32> {
        self.raw.last().map(|i| i as u32)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.raw.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.count() == 0
    }

    /// Removes node `hole`, filling it with the last node.
    ///
    /// Returns the removed value and, when a node was moved, the index it
    /// used to live at.
    pub fn swap_remove(&mut self, hole: u32) -> (T, Option<u32>) {
        let last = self.len() - 1;
        let hole_ptr = self.raw.slot_ptr(hole as usize).as_ptr() as *mut T;
        // SAFETY: hole is live; ownership moves out and the slot is either
        // overwritten or trimmed below
        let removed = unsafe { ptr::read(hole_ptr) };
        let moved = if hole as usize != last {
            let last_ptr = self.raw.slot_ptr(last).as_ptr() as *const T;
            // SAFETY: distinct slots; the last slot is trimmed right after
            unsafe { ptr::copy_nonoverlapping(last_ptr, hole_ptr, 1) };
            Some(last as u32)
        } else {
            None
        };
        self.raw.trim();
        (removed, moved)
    }

    pub fn bytes_allocated(&self) -> usize {
        self.raw.bytes_allocated()
    }

    pub fn buffer_count(&self) -> usize {
        self.raw.buffer_count()
    }
}

impl<T> Drop for NodeArena<T> {
    fn drop(&mut self) {
        if mem::needs_drop::<T>() {
            for index in 0..self.raw.count() {
                // SAFETY: every live slot holds an initialized T, dropped once
                unsafe { ptr::drop_in_place(self.raw.slot_ptr(index).as_ptr() as *mut T) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_alloc_fills_buffers_in_order() {
        let mut alloc = ContiguousAllocator::new(16, 4);
        for expected in 0..9 {
            assert_eq!(alloc.alloc(), expected);
        }
        assert_eq!(alloc.count(), 9);
        assert_eq!(alloc.buffer_count(), 3);
        assert_eq!(alloc.last(), Some(8));
        assert_eq!(alloc.bytes_allocated(), 3 * 4 * 16);
    }

    #[test]
    fn test_trim_releases_emptied_buffers_and_caches_the_last() {
        let mut alloc = ContiguousAllocator::new(8, 2);
        for _ in 0..5 {
            alloc.alloc();
        }
        assert_eq!(alloc.buffer_count(), 3);

        alloc.trim(); // 4 live, third buffer freed
        assert_eq!(alloc.buffer_count(), 2);
        assert!(!alloc.has_cached_buffer());

        for _ in 0..4 {
            alloc.trim();
        }
        assert_eq!(alloc.count(), 0);
        assert_eq!(alloc.buffer_count(), 0);
        assert!(alloc.has_cached_buffer());
        assert_eq!(alloc.bytes_allocated(), 0);

        // refill reuses the spare
        alloc.alloc();
        assert!(!alloc.has_cached_buffer());
        assert_eq!(alloc.buffer_count(), 1);
    }

    #[test]
    fn test_copy_slot_moves_bytes() {
        let mut alloc = ContiguousAllocator::new(4, 3);
        let a = alloc.alloc();
        let b = alloc.alloc();
        alloc.slot_mut(a).copy_from_slice(&[1, 2, 3, 4]);
        alloc.slot_mut(b).copy_from_slice(&[9, 9, 9, 9]);
        alloc.copy_slot(b, a);
        assert_eq!(alloc.slot(a), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_buffer_count_tracks_live_slots() {
        let per = 7;
        let mut alloc = ContiguousAllocator::new(3, per);
        let mut live = 0usize;
        for round in 0..200usize {
            if round % 3 == 2 && live > 0 {
                alloc.trim();
                live -= 1;
            } else {
                alloc.alloc();
                live += 1;
            }
            assert_eq!(alloc.buffer_count(), (live + per - 1) / per);
        }
    }

    #[test]
    fn test_node_arena_swap_remove_reports_moved_index() {
        let mut arena: NodeArena<(u64, String)> = NodeArena::new(2);
        for i in 0..5u64 {
            arena.alloc((i, format!("n{}", i)));
        }

        let (removed, moved) = arena.swap_remove(1);
        assert_eq!(removed.0, 1);
        assert_eq!(moved, Some(4));
        assert_eq!(arena.get(1).1, "n4");
        assert_eq!(arena.len(), 4);

        let (removed, moved) = arena.swap_remove(3);
        assert_eq!(removed.0, 3);
        assert_eq!(moved, None);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_node_arena_drops_remaining_nodes() {
        let marker = Rc::new(());
        {
            let mut arena = NodeArena::new(3);
            for _ in 0..7 {
                arena.alloc(Rc::clone(&marker));
            }
            let (removed, _) = arena.swap_remove(0);
            drop(removed);
            assert_eq!(Rc::strong_count(&marker), 7);
        }
        assert_eq!(Rc::strong_count(&marker), 1);
    }
}
