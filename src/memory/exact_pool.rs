//! Exact-size object pools
//!
//! One simple segregated-storage pool per object size. Blocks are carved into
//! chunks and threaded onto a free list; a block is never returned until the
//! pool itself is dropped. Growth starts at 32 chunks and doubles, but the
//! owner caps it so each pool grows in roughly `block_bytes` steps (or two
//! objects at a time for large objects) and reported memory keeps tracking
//! resident memory.

use super::ThreadLocalPool;
use crate::error::{MemoryError, Result};
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use tracing::{debug, trace};

const CHUNK_ALIGN: usize = 16;
const INITIAL_NEXT_SIZE: usize = 32;

struct Block {
    data: NonNull<u8>,
    layout: Layout,
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: allocated in PoolForObjectSize::grow with this layout
        unsafe { alloc::dealloc(self.data.as_ptr(), self.layout) }
    }
}

/// Pool handing out chunks of one fixed size.
pub struct PoolForObjectSize {
    object_size: usize,
    chunk_size: usize,
    next_size: usize,
    blocks: Vec<Block>,
    free: Vec<NonNull<u8>>,
    live: usize,
}

// SAFETY: the pool exclusively owns its blocks; chunk pointers are only
// handed to the single context that owns the pool.
unsafe impl Send for PoolForObjectSize {}

impl PoolForObjectSize {
    pub fn new(object_size: usize) -> Self {
        assert!(object_size > 0, "object_size must be greater than 0");
        let chunk_size = (object_size + mem::size_of::<usize>() - 1) / mem::size_of::<usize>()
            * mem::size_of::<usize>();
        Self {
            object_size,
            chunk_size,
            next_size: INITIAL_NEXT_SIZE,
            blocks: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn next_size(&self) -> usize {
        self.next_size
    }

    /// Caps the next growth step to `block_bytes`, or two chunks once the
    /// object reaches `large_object_bytes`.
    pub fn cap_growth(&mut self, block_bytes: usize, large_object_bytes: usize) {
        if self.next_size * self.chunk_size > block_bytes {
            self.next_size = if self.object_size >= large_object_bytes {
                2
            } else {
                (block_bytes / self.chunk_size).max(1)
            };
        }
    }

    /// Hands out one chunk. Also returns the bytes reserved by a new block,
    /// or zero when the free list had room.
    pub fn malloc(&mut self) -> (NonNull<u8>, usize) {
        let grown = if self.free.is_empty() { self.grow() } else { 0 };
        let chunk = match self.free.pop() {
            Some(chunk) => chunk,
            None => unreachable!("pool grew without producing chunks"),
        };
        self.live += 1;
        (chunk, grown)
    }

    /// Returns `chunk` to the free list.
    pub fn free(&mut self, chunk: NonNull<u8>) -> Result<()> {
        if !self.owns(chunk) || self.live == 0 {
            return Err(MemoryError::ForeignPointer {
                addr: chunk.as_ptr() as usize,
                size: self.object_size,
                partition: ThreadLocalPool::engine_partition_id_checked(),
            });
        }
        self.live -= 1;
        self.free.push(chunk);
        Ok(())
    }

    /// Whether `chunk` lies inside one of this pool's blocks.
    pub fn owns(&self, chunk: NonNull<u8>) -> bool {
        let addr = chunk.as_ptr() as usize;
        self.blocks.iter().any(|block| {
            let start = block.data.as_ptr() as usize;
            addr >= start && addr < start + block.layout.size()
        })
    }

    fn grow(&mut self) -> usize {
        let layout = Layout::from_size_align(self.next_size * self.chunk_size, CHUNK_ALIGN)
            .unwrap_or_else(|e| panic!("invalid exact pool block layout: {}", e));
        // SAFETY: non-zero size, object_size > 0 and next_size >= 1
        let ptr = unsafe { alloc::alloc(layout) };
        let data = match NonNull::new(ptr) {
            Some(data) => data,
            None => alloc::handle_alloc_error(layout),
        };

        for i in (0..self.next_size).rev() {
            // SAFETY: i * chunk_size is inside the block
            self.free
                .push(unsafe { NonNull::new_unchecked(data.as_ptr().add(i * self.chunk_size)) });
        }
        trace!(
            object_size = self.object_size,
            chunks = self.next_size,
            "Exact pool grew"
        );
        self.blocks.push(Block { data, layout });
        self.next_size *= 2;
        layout.size() + mem::size_of::<usize>()
    }

    /// Chunks currently handed out.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn reserved_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.layout.size()).sum()
    }
}

impl fmt::Debug for PoolForObjectSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolForObjectSize")
            .field("object_size", &self.object_size)
            .field("chunk_size", &self.chunk_size)
            .field("next_size", &self.next_size)
            .field("blocks", &self.blocks.len())
            .field("live", &self.live)
            .finish()
    }
}

/// Per-context registry of exact-size pools, keyed by object size.
#[derive(Debug)]
pub struct ExactSizePools {
    pools: HashMap<usize, PoolForObjectSize>,
    block_bytes: usize,
    large_object_bytes: usize,
}

impl ExactSizePools {
    pub fn new(block_bytes: usize, large_object_bytes: usize) -> Self {
        Self {
            pools: HashMap::new(),
            block_bytes,
            large_object_bytes,
        }
    }

    /// Allocates one object of `size` bytes. The second value is the number
    /// of bytes newly reserved from the system.
    pub fn allocate(&mut self, size: usize) -> (NonNull<u8>, usize) {
        let (block_bytes, large_object_bytes) = (self.block_bytes, self.large_object_bytes);
        let pool = self.pools.entry(size).or_insert_with(|| {
            debug!(object_size = size, "Creating exact-size pool");
            PoolForObjectSize::new(size)
        });
        pool.cap_growth(block_bytes, large_object_bytes);
        pool.malloc()
    }

    pub fn free(&mut self, size: usize, chunk: NonNull<u8>) -> Result<()> {
        match self.pools.get_mut(&size) {
            Some(pool) => pool.free(chunk),
            None => Err(MemoryError::UnknownExactSize { size }),
        }
    }

    pub fn pool(&self, size: usize) -> Option<&PoolForObjectSize> {
        self.pools.get(&size)
    }

    /// Objects handed out across every size.
    pub fn live_count(&self) -> usize {
        self.pools.values().map(PoolForObjectSize::live).sum()
    }

    pub fn reserved_bytes(&self) -> usize {
        self.pools.values().map(PoolForObjectSize::reserved_bytes).sum()
    }
}
