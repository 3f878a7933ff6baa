//! Scope guards over [`SynchronizedThreadLock`]

use super::thread_lock::SynchronizedThreadLock;

/// Runs the enclosing scope in the MP memory context.
#[must_use = "the MP context is left as soon as the guard is dropped"]
pub struct ExecuteWithMpMemory<'a> {
    lock: &'a SynchronizedThreadLock,
}

impl<'a> ExecuteWithMpMemory<'a> {
    pub fn new(lock: &'a SynchronizedThreadLock) -> Self {
        lock.assume_mp_memory_context();
        Self { lock }
    }
}

impl Drop for ExecuteWithMpMemory<'_> {
    fn drop(&mut self) {
        self.lock.assume_local_site_context();
    }
}

/// [`ExecuteWithMpMemory`] when `needed`, a no-op otherwise.
#[must_use = "the MP context is left as soon as the guard is dropped"]
pub struct ConditionalExecuteWithMpMemory<'a> {
    lock: Option<&'a SynchronizedThreadLock>,
}

impl<'a> ConditionalExecuteWithMpMemory<'a> {
    pub fn new(lock: &'a SynchronizedThreadLock, needed: bool) -> Self {
        if needed {
            lock.assume_mp_memory_context();
        }
        Self {
            lock: needed.then_some(lock),
        }
    }
}

impl Drop for ConditionalExecuteWithMpMemory<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.assume_local_site_context();
        }
    }
}

/// Steps out of the MP context for the enclosing scope when `needed`.
#[must_use = "the MP context is re-entered as soon as the guard is dropped"]
pub struct ConditionalExecuteOutsideMpMemory<'a> {
    lock: Option<&'a SynchronizedThreadLock>,
}

impl<'a> ConditionalExecuteOutsideMpMemory<'a> {
    pub fn new(lock: &'a SynchronizedThreadLock, needed: bool) -> Self {
        if needed {
            lock.assume_local_site_context();
        }
        Self {
            lock: needed.then_some(lock),
        }
    }
}

impl Drop for ConditionalExecuteOutsideMpMemory<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.assume_mp_memory_context();
        }
    }
}

/// One barrier round: every site arrives, and only the lowest site runs the
/// guarded scope, inside MP memory. Dropping the guard on the lowest site
/// releases the others.
#[must_use = "the barrier round ends as soon as the guard is dropped"]
pub struct ConditionalSynchronizedExecuteWithMpMemory<'a> {
    lock: &'a SynchronizedThreadLock,
    synchronized: bool,
    ok_to_execute: bool,
}

impl<'a> ConditionalSynchronizedExecuteWithMpMemory<'a> {
    pub fn new(
        lock: &'a SynchronizedThreadLock,
        need_mp_memory_on_lowest_thread: bool,
        is_lowest_site: bool,
    ) -> Self {
        let ok_to_execute = if need_mp_memory_on_lowest_thread {
            let elected = lock.count_down_global_txn_start_count(is_lowest_site);
            if elected {
                lock.assume_mp_memory_context();
            }
            elected
        } else {
            true
        };
        Self {
            lock,
            synchronized: need_mp_memory_on_lowest_thread,
            ok_to_execute,
        }
    }

    pub fn ok_to_execute(&self) -> bool {
        self.ok_to_execute
    }
}

impl Drop for ConditionalSynchronizedExecuteWithMpMemory<'_> {
    fn drop(&mut self) {
        if self.synchronized && self.ok_to_execute {
            self.lock.assume_local_site_context();
            self.lock.signal_lowest_site_finished();
        }
    }
}

/// Holds the replicated-resource lock for the enclosing scope.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ScopedReplicatedResourceLock<'a> {
    lock: &'a SynchronizedThreadLock,
}

impl<'a> ScopedReplicatedResourceLock<'a> {
    pub fn new(lock: &'a SynchronizedThreadLock) -> Self {
        lock.lock_replicated_resource();
        Self { lock }
    }
}

impl Drop for ScopedReplicatedResourceLock<'_> {
    fn drop(&mut self) {
        self.lock.unlock_replicated_resource();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PartitionId, ThreadLocalPool};
    use crate::sync::{EngineLocals, SiteContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_conditional_guards_only_swap_when_needed() {
        std::thread::spawn(|| {
            let lock = SynchronizedThreadLock::create();
            let _pool = ThreadLocalPool::new();
            ThreadLocalPool::set_partition_ids(PartitionId::Site(1));
            lock.init(1, EngineLocals::current(SiteContext::new(PartitionId::Site(1))));

            let _replicated = ScopedReplicatedResourceLock::new(&lock);
            {
                let _noop = ConditionalExecuteWithMpMemory::new(&lock, false);
                assert!(!lock.using_mp_memory());
            }
            {
                let _mp = ConditionalExecuteWithMpMemory::new(&lock, true);
                assert!(lock.using_mp_memory());
                {
                    let _outside = ConditionalExecuteOutsideMpMemory::new(&lock, true);
                    assert_eq!(ThreadLocalPool::engine_partition_id(), PartitionId::Site(1));
                }
                assert!(lock.using_mp_memory());
            }
            assert!(!lock.using_mp_memory());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_synchronized_guard_elects_the_lowest_site() {
        let sites = 3;
        let lock = SynchronizedThreadLock::create();
        let ready = Arc::new(std::sync::Barrier::new(sites));
        let executed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..sites as i32)
            .map(|id| {
                let lock = Arc::clone(&lock);
                let ready = Arc::clone(&ready);
                let executed = Arc::clone(&executed);
                std::thread::spawn(move || {
                    let _pool = ThreadLocalPool::new();
                    ThreadLocalPool::set_partition_ids(PartitionId::Site(id));
                    lock.init(sites, EngineLocals::current(SiteContext::new(PartitionId::Site(id))));
                    ready.wait();

                    for _ in 0..5 {
                        let guard = ConditionalSynchronizedExecuteWithMpMemory::new(&lock, true, id == 0);
                        if guard.ok_to_execute() {
                            assert_eq!(id, 0);
                            assert!(lock.using_mp_memory());
                            assert!(lock.is_in_single_thread_mode());
                            executed.fetch_add(1, Ordering::SeqCst);
                        } else {
                            assert!(!lock.using_mp_memory());
                        }
                    }
                    // keep every site registered until all rounds are done
                    ready.wait();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(executed.load(Ordering::SeqCst), 5);
        assert!(lock.mp_engine().is_none());
    }
}
