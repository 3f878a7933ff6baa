//! Per-thread memory context
//!
//! A thread's memory context is one [`PoolLocals`] bundle: the exact-size
//! pools, the relocatable size classes, the running byte counter and the
//! engine partition id. [`ThreadLocalPool`] handles refcount the context of
//! the thread they are created on; the static entry points always act on
//! whatever context is current for the calling thread.
//!
//! Contexts can be swapped. `push_thread_locals` saves the current context
//! and adopts another one; `pop_thread_locals` and
//! `restore_home_thread_locals` undo that. This is how a site thread borrows
//! the shared MP context or a sibling site's context.

use super::partition::{PartitionCell, PartitionId};
use super::exact_pool::ExactSizePools;
use super::compacting_pool::Referrer;
use super::size_class::allocation_size_for_object;
use super::string_storage::CompactingStringStorage;
use super::tracking::AllocationTracker;
use crate::config::MemoryConfig;
use crate::error::{fatal, MemoryError, Result};
use crate::sync::SynchronizedThreadLock;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

struct PoolContext {
    id: u64,
    refcount: AtomicUsize,
    exact: Mutex<ExactSizePools>,
    strings: Mutex<CompactingStringStorage>,
    allocated: AtomicUsize,
    engine_partition: PartitionCell,
    track_allocations: bool,
}

/// One complete memory context. Cloning shares the context.
#[derive(Clone)]
pub struct PoolLocals(Arc<PoolContext>);

impl PoolLocals {
    /// A fresh, unreferenced context sized by `config`.
    pub fn new(config: &MemoryConfig) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(context = id, "Creating memory context");
        Self(Arc::new(PoolContext {
            id,
            refcount: AtomicUsize::new(0),
            exact: Mutex::new(ExactSizePools::new(
                config.exact_pool_block_bytes,
                config.exact_pool_large_object_bytes,
            )),
            strings: Mutex::new(CompactingStringStorage::new(config.relocatable_buffer_bytes)),
            allocated: AtomicUsize::new(0),
            engine_partition: PartitionCell::new(PartitionId::Unassigned),
            track_allocations: config.track_allocations,
        }))
    }

    /// The calling thread's current context.
    pub fn current() -> Option<Self> {
        STATE.with(|state| state.borrow().current.clone())
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn engine_partition_id(&self) -> PartitionId {
        self.0.engine_partition.get()
    }

    pub fn set_engine_partition_id(&self, id: PartitionId) {
        self.0.engine_partition.set(id);
    }

    pub fn same_context(&self, other: &PoolLocals) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Takes one reference on the context; returns the new count.
    pub fn retain(&self) -> usize {
        self.0.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one reference; returns the remaining count.
    pub fn release(&self) -> usize {
        let previous = self.0.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "memory context refcount underflow");
        previous.saturating_sub(1)
    }

    pub fn refcount(&self) -> usize {
        self.0.refcount.load(Ordering::Acquire)
    }

    /// Bytes reserved by the exact-size pools.
    pub fn allocated_bytes(&self) -> usize {
        self.0.allocated.load(Ordering::Relaxed)
    }

    /// Exact-size reservations plus every relocatable pool's footprint.
    pub fn pool_allocation_size(&self) -> usize {
        self.allocated_bytes() + self.0.strings.lock().bytes_allocated()
    }

    pub fn live_exact_objects(&self) -> usize {
        self.0.exact.lock().live_count()
    }

    pub fn live_relocatable_objects(&self) -> usize {
        self.0.strings.lock().live_count()
    }

    pub fn allocate_exact(&self, size: usize) -> Result<NonNull<u8>> {
        let (chunk, grown) = self.0.exact.lock().allocate(size);
        if grown > 0 {
            self.0.allocated.fetch_add(grown, Ordering::Relaxed);
        }
        if self.0.track_allocations {
            AllocationTracker::global().record_alloc(
                self.id(),
                self.engine_partition_id(),
                size,
                chunk.as_ptr() as usize,
            )?;
        }
        trace!(size, addr = ?chunk, context = self.id(), "Allocated exact-sized object");
        Ok(chunk)
    }

    pub fn free_exact(&self, size: usize, chunk: NonNull<u8>) -> Result<()> {
        if self.0.track_allocations {
            AllocationTracker::global().record_free(
                self.id(),
                self.engine_partition_id(),
                size,
                chunk.as_ptr() as usize,
            )?;
        }
        trace!(size, addr = ?chunk, context = self.id(), "Freeing exact-sized object");
        self.0.exact.lock().free(size, chunk)
    }

    pub fn allocate_relocatable(&self, len: usize) -> Result<Relocatable> {
        let alloc_size = allocation_size_for_object(len)?;
        let referrer = self.0.strings.lock().pool_for_size(alloc_size).malloc(len);
        trace!(len, alloc_size, context = self.id(), "Allocated relocatable object");
        Ok(Relocatable { referrer, len })
    }

    pub fn free_relocatable(&self, object: Relocatable) -> Result<()> {
        let alloc_size = allocation_size_for_object(object.len)?;
        let mut strings = self.0.strings.lock();
        match strings.existing_pool(alloc_size) {
            Some(pool) => pool.free(object.referrer),
            None => {
                error!(
                    alloc_size,
                    partition = %self.engine_partition_id(),
                    "Deallocated relocatable object in wrong context"
                );
                Err(MemoryError::UnknownRelocatableSize { alloc_size })
            }
        }
    }

    pub fn with_relocatable<R>(&self, object: &Relocatable, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let alloc_size = allocation_size_for_object(object.len)?;
        let strings = self.0.strings.lock();
        let pool = strings
            .existing_pool_ref(alloc_size)
            .ok_or(MemoryError::UnknownRelocatableSize { alloc_size })?;
        debug_assert_eq!(pool.sized_len(&object.referrer), object.len);
        Ok(f(pool.data(&object.referrer)))
    }

    pub fn with_relocatable_mut<R>(
        &self,
        object: &Relocatable,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let alloc_size = allocation_size_for_object(object.len)?;
        let mut strings = self.0.strings.lock();
        let pool = strings
            .existing_pool(alloc_size)
            .ok_or(MemoryError::UnknownRelocatableSize { alloc_size })?;
        Ok(f(pool.data_mut(&object.referrer)))
    }

    /// Reports and forgets every tracked allocation still outstanding.
    pub fn check_leaks(&self) -> Result<()> {
        let leaked = AllocationTracker::global().drain_context(self.id());
        if leaked.is_empty() {
            return Ok(());
        }
        let partition = self.engine_partition_id();
        for (size, addr) in &leaked {
            error!(addr = *addr, size = *size, %partition, "Missing deallocation");
        }
        Err(MemoryError::Leak {
            partition,
            count: leaked.len(),
        })
    }
}

impl fmt::Debug for PoolLocals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLocals")
            .field("id", &self.id())
            .field("engine_partition", &self.engine_partition_id())
            .field("refcount", &self.refcount())
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

/// Handle to a relocatable allocation.
///
/// Carries the requested length, which is all that is needed to find the
/// size class again on free. The bytes are reached through the owning
/// context because they may move on any free in the same size class.
#[derive(Debug)]
pub struct Relocatable {
    referrer: Referrer,
    len: usize,
}

impl Relocatable {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current slot inside the size-class pool.
    pub fn slot(&self) -> usize {
        self.referrer.slot()
    }
}

#[derive(Default)]
struct ThreadState {
    current: Option<PoolLocals>,
    saved: Vec<PoolLocals>,
    thread_partition: Option<PartitionId>,
    lock: Option<Arc<SynchronizedThreadLock>>,
}

thread_local! {
    static STATE: RefCell<ThreadState> = RefCell::new(ThreadState::default());
}

/// Refcounted handle on the calling thread's memory context.
///
/// The first handle on a thread creates the context; dropping the last one
/// checks it for leaks, destroys it and notifies the bound
/// [`SynchronizedThreadLock`].
pub struct ThreadLocalPool {
    allocating_engine: PartitionId,
    _not_send: PhantomData<*const ()>,
}

impl ThreadLocalPool {
    pub fn new() -> Self {
        let allocating_engine = STATE.with(|state| {
            let mut state = state.borrow_mut();
            match &state.current {
                Some(locals) => {
                    let count = locals.retain();
                    trace!(
                        count,
                        engine_partition = %locals.engine_partition_id(),
                        "Incremented memory context refcount"
                    );
                    locals.engine_partition_id()
                }
                None => {
                    let locals = PoolLocals::new(&MemoryConfig::current());
                    locals.retain();
                    state.current = Some(locals);
                    state.thread_partition = Some(PartitionId::Unassigned);
                    PartitionId::Unassigned
                }
            }
        });
        Self {
            allocating_engine,
            _not_send: PhantomData,
        }
    }

    // ----- exact-sized objects -----

    pub fn allocate_exact_sized_object(size: usize) -> NonNull<u8> {
        Self::try_allocate_exact_sized_object(size).unwrap_or_else(|e| fatal(e))
    }

    pub fn try_allocate_exact_sized_object(size: usize) -> Result<NonNull<u8>> {
        Self::current()?.allocate_exact(size)
    }

    pub fn free_exact_sized_object(size: usize, object: NonNull<u8>) {
        Self::try_free_exact_sized_object(size, object).unwrap_or_else(|e| fatal(e))
    }

    pub fn try_free_exact_sized_object(size: usize, object: NonNull<u8>) -> Result<()> {
        Self::current()?.free_exact(size, object)
    }

    // ----- relocatable objects -----

    pub fn allocate_relocatable(len: usize) -> Relocatable {
        Self::try_allocate_relocatable(len).unwrap_or_else(|e| fatal(e))
    }

    pub fn try_allocate_relocatable(len: usize) -> Result<Relocatable> {
        Self::current()?.allocate_relocatable(len)
    }

    pub fn free_relocatable(object: Relocatable) {
        Self::try_free_relocatable(object).unwrap_or_else(|e| fatal(e))
    }

    pub fn try_free_relocatable(object: Relocatable) -> Result<()> {
        Self::current()?.free_relocatable(object)
    }

    /// Rounded size class of `object`.
    pub fn allocation_size_for_relocatable(object: &Relocatable) -> usize {
        allocation_size_for_object(object.len).unwrap_or_else(|e| fatal(e))
    }

    /// Runs `f` over the object's bytes. The size class stays locked while
    /// `f` runs, so `f` must not allocate from the same context.
    pub fn with_relocatable<R>(object: &Relocatable, f: impl FnOnce(&[u8]) -> R) -> R {
        Self::current()
            .and_then(|locals| locals.with_relocatable(object, f))
            .unwrap_or_else(|e| fatal(e))
    }

    pub fn with_relocatable_mut<R>(object: &Relocatable, f: impl FnOnce(&mut [u8]) -> R) -> R {
        Self::current()
            .and_then(|locals| locals.with_relocatable_mut(object, f))
            .unwrap_or_else(|e| fatal(e))
    }

    /// Bytes held by the current context. The lowest site also accounts for
    /// the shared MP context.
    pub fn pool_allocation_size() -> usize {
        Self::try_pool_allocation_size().unwrap_or_else(|e| fatal(e))
    }

    pub fn try_pool_allocation_size() -> Result<usize> {
        let locals = Self::current()?;
        let mut bytes = locals.pool_allocation_size();
        if let Some(lock) = Self::bound_lock() {
            if lock.is_lowest_site_context() {
                if let Some(mp) = lock.mp_engine() {
                    if !mp.locals.same_context(&locals) {
                        bytes += mp.locals.pool_allocation_size();
                    }
                }
            }
        }
        Ok(bytes)
    }

    // ----- partition identity -----

    /// Sets both the thread and the engine partition id.
    pub fn set_partition_ids(id: PartitionId) {
        let result: Result<()> = STATE.with(|state| {
            let mut state = state.borrow_mut();
            let locals = state.current.as_ref().ok_or(MemoryError::NoThreadContext)?;
            locals.set_engine_partition_id(id);
            state.thread_partition = Some(id);
            Ok(())
        });
        result.unwrap_or_else(|e| fatal(e))
    }

    pub fn thread_partition_id() -> PartitionId {
        STATE
            .with(|state| state.borrow().thread_partition)
            .unwrap_or_else(|| fatal(MemoryError::NoThreadContext))
    }

    pub fn engine_partition_id() -> PartitionId {
        Self::current()
            .map(|locals| locals.engine_partition_id())
            .unwrap_or_else(|e| fatal(e))
    }

    /// Thread partition id, or `Unassigned` when the thread has no context.
    pub fn thread_partition_id_checked() -> PartitionId {
        STATE
            .try_with(|state| state.try_borrow().ok().and_then(|s| s.thread_partition))
            .ok()
            .flatten()
            .unwrap_or(PartitionId::Unassigned)
    }

    /// Engine partition id, or `Unassigned` when the thread has no context.
    pub fn engine_partition_id_checked() -> PartitionId {
        STATE
            .try_with(|state| {
                state
                    .try_borrow()
                    .ok()
                    .and_then(|s| s.current.as_ref().map(PoolLocals::engine_partition_id))
            })
            .ok()
            .flatten()
            .unwrap_or(PartitionId::Unassigned)
    }

    // ----- context swapping -----

    /// Replaces the calling thread's context with `locals`.
    pub fn assign_thread_locals(locals: PoolLocals) {
        Self::try_assign_thread_locals(locals).unwrap_or_else(|e| fatal(e))
    }

    pub fn try_assign_thread_locals(locals: PoolLocals) -> Result<()> {
        STATE.with(|state| {
            let mut state = state.borrow_mut();
            if state.thread_partition == Some(PartitionId::Mp) {
                return Err(MemoryError::ContextMisuse(
                    "cannot reassign the memory context of the MP thread".to_string(),
                ));
            }
            debug!(
                context = locals.id(),
                engine_partition = %locals.engine_partition_id(),
                "Assigning thread memory context"
            );
            state.current = Some(locals);
            Ok(())
        })
    }

    /// Saves the current context and adopts `locals`.
    pub fn push_thread_locals(locals: PoolLocals) -> Result<()> {
        STATE.with(|state| {
            let mut state = state.borrow_mut();
            if state.thread_partition == Some(PartitionId::Mp) {
                return Err(MemoryError::ContextMisuse(
                    "cannot swap the memory context of the MP thread".to_string(),
                ));
            }
            let previous = state.current.replace(locals).ok_or(MemoryError::NoThreadContext)?;
            trace!(
                from = previous.id(),
                depth = state.saved.len() + 1,
                "Pushed thread memory context"
            );
            state.saved.push(previous);
            Ok(())
        })
    }

    /// Returns to the context saved by the matching push.
    pub fn pop_thread_locals() -> Result<()> {
        STATE.with(|state| {
            let mut state = state.borrow_mut();
            let previous = state.saved.pop().ok_or_else(|| {
                MemoryError::ContextMisuse("no saved memory context to return to".to_string())
            })?;
            state.current = Some(previous);
            Ok(())
        })
    }

    /// Drops every saved context and returns to the one the thread started
    /// from. A thread that never swapped is left alone.
    pub fn restore_home_thread_locals() {
        STATE.with(|state| {
            let mut state = state.borrow_mut();
            if !state.saved.is_empty() {
                let home = state.saved.swap_remove(0);
                state.saved.clear();
                state.current = Some(home);
            }
        })
    }

    /// Number of contexts saved beneath the current one.
    pub fn context_depth() -> usize {
        STATE.with(|state| state.borrow().saved.len())
    }

    pub fn current_locals() -> Option<PoolLocals> {
        PoolLocals::current()
    }

    fn current() -> Result<PoolLocals> {
        PoolLocals::current().ok_or(MemoryError::NoThreadContext)
    }

    // ----- coordination binding -----

    pub(crate) fn bind_lock(lock: Arc<SynchronizedThreadLock>) {
        STATE.with(|state| state.borrow_mut().lock = Some(lock));
    }

    pub fn bound_lock() -> Option<Arc<SynchronizedThreadLock>> {
        STATE.with(|state| state.borrow().lock.clone())
    }

    // ----- test support -----

    /// Forgets every piece of thread state without tearing anything down.
    pub fn reset_state_for_test() {
        STATE.with(|state| *state.borrow_mut() = ThreadState::default());
    }

    pub fn thread_partition_id_for_test() -> Option<PartitionId> {
        STATE.with(|state| state.borrow().thread_partition)
    }

    pub fn set_thread_partition_id_for_test(id: Option<PartitionId>) {
        STATE.with(|state| state.borrow_mut().thread_partition = id);
    }
}

impl Default for ThreadLocalPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadLocalPool {
    fn drop(&mut self) {
        let teardown = STATE.with(|state| {
            let mut state = state.borrow_mut();
            let locals = match state.current.clone() {
                Some(locals) => locals,
                None => {
                    error!("Failed to find memory context");
                    debug_assert!(false, "ThreadLocalPool dropped without a context");
                    return None;
                }
            };

            let engine = locals.engine_partition_id();
            if self.allocating_engine != PartitionId::Unassigned && engine != self.allocating_engine {
                error!(
                    allocating_engine = %self.allocating_engine,
                    engine_partition = %engine,
                    "Unmatched memory context release"
                );
            }

            if locals.release() > 0 {
                return None;
            }
            let thread_partition = state.thread_partition.take().unwrap_or_default();
            state.current = None;
            state.saved.clear();
            debug!(
                context = locals.id(),
                %thread_partition,
                "Destroying thread memory context"
            );
            Some((locals, thread_partition, state.lock.clone()))
        });

        if let Some((locals, thread_partition, lock)) = teardown {
            if let Err(err) = locals.check_leaks() {
                if cfg!(debug_assertions) && !std::thread::panicking() {
                    fatal(err);
                }
            }
            if let Some(lock) = lock {
                lock.reset_memory(thread_partition);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_thread<F: FnOnce() + Send + 'static>(f: F) {
        std::thread::spawn(f).join().unwrap();
    }

    #[test]
    fn test_handles_share_one_context() {
        fresh_thread(|| {
            assert!(PoolLocals::current().is_none());
            let first = ThreadLocalPool::new();
            let id = PoolLocals::current().unwrap().id();
            let second = ThreadLocalPool::new();
            assert_eq!(PoolLocals::current().unwrap().id(), id);
            assert_eq!(PoolLocals::current().unwrap().refcount(), 2);
            drop(second);
            assert!(PoolLocals::current().is_some());
            drop(first);
            assert!(PoolLocals::current().is_none());
        });
    }

    #[test]
    fn test_exact_objects_round_trip() {
        fresh_thread(|| {
            let _pool = ThreadLocalPool::new();
            let a = ThreadLocalPool::allocate_exact_sized_object(40);
            let b = ThreadLocalPool::allocate_exact_sized_object(40);
            assert_ne!(a, b);
            assert!(ThreadLocalPool::pool_allocation_size() >= 32 * 40);
            ThreadLocalPool::free_exact_sized_object(40, a);
            ThreadLocalPool::free_exact_sized_object(40, b);
            assert_eq!(PoolLocals::current().unwrap().live_exact_objects(), 0);
        });
    }

    #[test]
    fn test_free_of_unknown_size_fails() {
        fresh_thread(|| {
            let _pool = ThreadLocalPool::new();
            let a = ThreadLocalPool::allocate_exact_sized_object(24);
            let err = ThreadLocalPool::try_free_exact_sized_object(48, a).unwrap_err();
            assert!(matches!(
                err,
                MemoryError::UnknownExactSize { size: 48 } | MemoryError::ForeignPointer { .. }
            ));
            ThreadLocalPool::free_exact_sized_object(24, a);
        });
    }

    #[test]
    fn test_relocatable_objects_survive_compaction() {
        fresh_thread(|| {
            let _pool = ThreadLocalPool::new();
            let mut objects: Vec<(u8, Relocatable)> = (0..10u8)
                .map(|i| {
                    let object = ThreadLocalPool::allocate_relocatable(20);
                    ThreadLocalPool::with_relocatable_mut(&object, |bytes| bytes.fill(i));
                    (i, object)
                })
                .collect();
            let (_, second) = objects.remove(1);
            ThreadLocalPool::free_relocatable(second);
            // the last object moved into slot 1
            assert_eq!(objects.last().unwrap().1.slot(), 1);
            for (i, object) in objects {
                ThreadLocalPool::with_relocatable(&object, |bytes| {
                    assert_eq!(bytes.len(), 20);
                    assert!(bytes.iter().all(|&b| b == i));
                });
                ThreadLocalPool::free_relocatable(object);
            }
            assert_eq!(PoolLocals::current().unwrap().live_relocatable_objects(), 0);
        });
    }

    #[test]
    fn test_relocatable_size_class() {
        fresh_thread(|| {
            let _pool = ThreadLocalPool::new();
            let object = ThreadLocalPool::allocate_relocatable(100);
            assert_eq!(ThreadLocalPool::allocation_size_for_relocatable(&object), 128);
            ThreadLocalPool::free_relocatable(object);
        });
    }

    #[test]
    fn test_oversized_relocatable_is_rejected() {
        fresh_thread(|| {
            let _pool = ThreadLocalPool::new();
            assert!(matches!(
                ThreadLocalPool::try_allocate_relocatable(2 * 1024 * 1024),
                Err(MemoryError::ObjectTooLarge { .. })
            ));
        });
    }

    #[test]
    fn test_partition_ids_follow_the_context() {
        fresh_thread(|| {
            assert_eq!(ThreadLocalPool::thread_partition_id_checked(), PartitionId::Unassigned);
            let _pool = ThreadLocalPool::new();
            ThreadLocalPool::set_partition_ids(PartitionId::Site(4));
            assert_eq!(ThreadLocalPool::thread_partition_id(), PartitionId::Site(4));
            assert_eq!(ThreadLocalPool::engine_partition_id(), PartitionId::Site(4));

            let other = PoolLocals::new(&MemoryConfig::default());
            other.set_engine_partition_id(PartitionId::Site(9));
            ThreadLocalPool::push_thread_locals(other).unwrap();
            assert_eq!(ThreadLocalPool::thread_partition_id(), PartitionId::Site(4));
            assert_eq!(ThreadLocalPool::engine_partition_id(), PartitionId::Site(9));
            assert_eq!(ThreadLocalPool::context_depth(), 1);

            ThreadLocalPool::restore_home_thread_locals();
            assert_eq!(ThreadLocalPool::engine_partition_id(), PartitionId::Site(4));
            assert!(ThreadLocalPool::pop_thread_locals().is_err());
        });
    }

    #[test]
    fn test_mp_thread_cannot_be_reassigned() {
        fresh_thread(|| {
            let _pool = ThreadLocalPool::new();
            ThreadLocalPool::set_partition_ids(PartitionId::Mp);
            let other = PoolLocals::new(&MemoryConfig::default());
            assert!(matches!(
                ThreadLocalPool::try_assign_thread_locals(other),
                Err(MemoryError::ContextMisuse(_))
            ));
        });
    }

    #[test]
    fn test_free_through_another_context_is_caught() {
        fresh_thread(|| {
            let mut config = MemoryConfig::default();
            config.track_allocations = true;
            let home = PoolLocals::new(&config);
            let other = PoolLocals::new(&config);
            let chunk = home.allocate_exact(16).unwrap();
            assert!(matches!(
                other.free_exact(16, chunk),
                Err(MemoryError::ForeignPointer { .. })
            ));
            home.free_exact(16, chunk).unwrap();
            assert!(home.check_leaks().is_ok());
        });
    }

    #[test]
    fn test_leaks_are_reported() {
        let mut config = MemoryConfig::default();
        config.track_allocations = true;
        let locals = PoolLocals::new(&config);
        locals.set_engine_partition_id(PartitionId::Site(2));
        let _leaked = locals.allocate_exact(8).unwrap();
        assert_eq!(
            locals.check_leaks(),
            Err(MemoryError::Leak {
                partition: PartitionId::Site(2),
                count: 1
            })
        );
    }

    #[test]
    fn test_reset_state_for_test_forgets_context() {
        fresh_thread(|| {
            let pool = ThreadLocalPool::new();
            ThreadLocalPool::set_partition_ids(PartitionId::Site(1));
            ThreadLocalPool::reset_state_for_test();
            assert_eq!(ThreadLocalPool::thread_partition_id_for_test(), None);
            ThreadLocalPool::set_thread_partition_id_for_test(Some(PartitionId::Site(7)));
            assert_eq!(ThreadLocalPool::thread_partition_id_checked(), PartitionId::Site(7));
            std::mem::forget(pool);
        });
    }
}
