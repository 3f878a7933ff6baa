//! Cross-site coordination for replicated memory
//!
//! One [`SynchronizedThreadLock`] is shared by every site thread of a host.
//! It keeps the memory context of each active and deactivated site plus the
//! shared MP context, lets a thread borrow one of those contexts, elects the
//! lowest site through the countdown barrier, and mirrors undo actions of
//! replicated changes onto every site.

use super::barrier::CountdownBarrier;
use super::context::EngineLocals;
use crate::config::MemoryConfig;
use crate::error::{fatal, MemoryError, Result};
use crate::memory::{PartitionId, PoolLocals, ThreadLocalPool};
use crate::undo::{
    SynchronizedDummyUndoReleaseAction, SynchronizedUndoReleaseAction, UndoQuantum,
    UndoQuantumReleaseInterest, UndoReleaseAction,
};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};

/// Release interests of a replicated table: the real one goes with the
/// real action, the placeholder with every dummy.
#[derive(Clone)]
pub struct ReplicatedInterests {
    pub real: Arc<dyn UndoQuantumReleaseInterest>,
    pub dummy: Arc<dyn UndoQuantumReleaseInterest>,
}

#[derive(Default)]
struct EngineRegistry {
    active: BTreeMap<PartitionId, EngineLocals>,
    inactive: BTreeMap<PartitionId, EngineLocals>,
    mp_engine: Option<EngineLocals>,
    sites_per_host: usize,
}

impl EngineRegistry {
    fn lowest_site(&self) -> Option<PartitionId> {
        self.active.keys().copied().find(|p| p.is_site())
    }
}

pub struct SynchronizedThreadLock {
    engines: Mutex<EngineRegistry>,
    barrier: CountdownBarrier,
    replicated_holder: Mutex<Option<ThreadId>>,
    replicated_released: Condvar,
}

impl SynchronizedThreadLock {
    pub fn create() -> Arc<Self> {
        debug!("Creating synchronized thread lock");
        Arc::new(Self {
            engines: Mutex::new(EngineRegistry::default()),
            barrier: CountdownBarrier::new(1),
            replicated_holder: Mutex::new(None),
            replicated_released: Condvar::new(),
        })
    }

    /// Forgets every registered site and releases the MP context.
    pub fn destroy(&self) {
        let mp = {
            let mut engines = self.engines.lock();
            engines.active.clear();
            engines.inactive.clear();
            engines.mp_engine.take()
        };
        if let Some(mp) = mp {
            self.release_mp_engine(mp);
        }
        debug!("Destroyed synchronized thread lock");
    }

    /// Registers the calling site. The first site to arrive also creates
    /// the MP memory context.
    pub fn init(self: &Arc<Self>, sites_per_host: usize, engine: EngineLocals) {
        ThreadLocalPool::bind_lock(Arc::clone(self));
        let partition = engine.partition_id();
        {
            let mut engines = self.engines.lock();
            if partition.is_mp() {
                match engines.mp_engine.as_mut() {
                    Some(mp) => mp.context = engine.context,
                    None => {
                        engine.locals.retain();
                        engines.mp_engine = Some(engine);
                    }
                }
            } else {
                if engines.mp_engine.is_none() {
                    let locals = PoolLocals::new(&MemoryConfig::current());
                    locals.set_engine_partition_id(PartitionId::Mp);
                    locals.retain();
                    info!(context = locals.id(), "Created MP memory context");
                    engines.mp_engine = Some(EngineLocals::new(locals, None));
                }
                engines.inactive.remove(&partition);
                engines.active.insert(partition, engine);
            }
            engines.sites_per_host = sites_per_host;
        }
        self.barrier
            .set_sites_per_host(sites_per_host)
            .unwrap_or_else(|e| fatal(e));
        debug!(%partition, sites_per_host, "Initialized site");
    }

    /// Forgets `partition` once its memory context is gone. Resetting the MP
    /// partition only drops its executor context; the MP memory context is
    /// released once no site is registered.
    pub fn reset_memory(&self, partition: PartitionId) {
        let mp = {
            let mut engines = self.engines.lock();
            if partition.is_mp() {
                if let Some(mp) = engines.mp_engine.as_mut() {
                    mp.context = None;
                }
            } else {
                engines.active.remove(&partition);
                engines.inactive.remove(&partition);
            }
            if engines.active.is_empty() && engines.inactive.is_empty() {
                engines.mp_engine.take()
            } else {
                None
            }
        };
        debug!(%partition, "Reset site memory");
        if let Some(mp) = mp {
            self.release_mp_engine(mp);
        }
    }

    fn release_mp_engine(&self, mp: EngineLocals) {
        if mp.locals.release() > 0 {
            return;
        }
        info!(context = mp.locals.id(), "Releasing MP memory context");
        if let Err(err) = mp.locals.check_leaks() {
            error!(error = %err, "MP memory context leaked allocations");
            if cfg!(debug_assertions) && !thread::panicking() {
                fatal(err);
            }
        }
    }

    pub fn update_site_per_host(&self, sites_per_host: usize) {
        self.engines.lock().sites_per_host = sites_per_host;
        self.barrier
            .set_sites_per_host(sites_per_host)
            .unwrap_or_else(|e| fatal(e));
    }

    pub fn deactive_engine_locals(&self, partition: PartitionId) {
        let mut engines = self.engines.lock();
        match engines.active.remove(&partition) {
            Some(engine) => {
                engines.inactive.insert(partition, engine);
                debug!(%partition, "Deactivated site");
            }
            None => warn!(%partition, "Deactivating a site that is not active"),
        }
    }

    pub fn mp_engine(&self) -> Option<EngineLocals> {
        self.engines.lock().mp_engine.clone()
    }

    pub fn active_partitions(&self) -> Vec<PartitionId> {
        self.engines.lock().active.keys().copied().collect()
    }

    pub fn lowest_site(&self) -> Option<PartitionId> {
        self.engines.lock().lowest_site()
    }

    pub fn sites_per_host(&self) -> usize {
        self.engines.lock().sites_per_host
    }

    // ----- context queries -----

    pub fn is_in_single_thread_mode(&self) -> bool {
        self.barrier.is_single_thread_mode()
    }

    pub fn using_mp_memory(&self) -> bool {
        ThreadLocalPool::engine_partition_id_checked().is_mp()
    }

    pub fn is_in_local_engine_context(&self) -> bool {
        ThreadLocalPool::engine_partition_id_checked() == ThreadLocalPool::thread_partition_id_checked()
    }

    pub fn is_lowest_site_context(&self) -> bool {
        let engine = ThreadLocalPool::engine_partition_id_checked();
        engine.is_site() && self.lowest_site() == Some(engine)
    }

    // ----- context swaps -----

    pub fn assume_mp_memory_context(&self) {
        self.try_assume_mp_memory_context()
            .unwrap_or_else(|e| fatal(e))
    }

    pub fn try_assume_mp_memory_context(&self) -> Result<()> {
        debug_assert!(
            self.is_in_single_thread_mode() || self.is_holding_resource_lock(),
            "MP memory is only reachable in single-thread mode or under the replicated lock"
        );
        if self.using_mp_memory() {
            return Err(MemoryError::ContextMisuse(
                "already in the MP memory context".to_string(),
            ));
        }
        let mp = self.mp_engine().ok_or_else(|| {
            MemoryError::ContextMisuse("no MP memory context exists".to_string())
        })?;
        ThreadLocalPool::push_thread_locals(mp.locals)?;
        debug!(thread_partition = %ThreadLocalPool::thread_partition_id_checked(), "Assumed MP memory context");
        Ok(())
    }

    /// Returns the calling thread to its own site context.
    pub fn assume_local_site_context(&self) {
        ThreadLocalPool::restore_home_thread_locals();
        debug!(
            engine_partition = %ThreadLocalPool::engine_partition_id_checked(),
            "Assumed local site context"
        );
    }

    pub fn assume_lowest_site_context(&self) {
        self.try_assume_lowest_site_context()
            .unwrap_or_else(|e| fatal(e))
    }

    pub fn try_assume_lowest_site_context(&self) -> Result<()> {
        let lowest = {
            let engines = self.engines.lock();
            engines
                .lowest_site()
                .and_then(|p| engines.active.get(&p).cloned())
        };
        let lowest = lowest
            .ok_or_else(|| MemoryError::ContextMisuse("no active site".to_string()))?;
        ThreadLocalPool::push_thread_locals(lowest.locals)
    }

    pub fn assume_specific_site_context(&self, partition: PartitionId) {
        self.try_assume_specific_site_context(partition)
            .unwrap_or_else(|e| fatal(e))
    }

    pub fn try_assume_specific_site_context(&self, partition: PartitionId) -> Result<()> {
        let engine = {
            let engines = self.engines.lock();
            engines
                .active
                .get(&partition)
                .or_else(|| engines.inactive.get(&partition))
                .cloned()
        };
        let engine = engine.ok_or_else(|| {
            MemoryError::ContextMisuse(format!("no memory context for partition {}", partition))
        })?;
        ThreadLocalPool::push_thread_locals(engine.locals)
    }

    // ----- barrier -----

    /// Arrives at the barrier; see [`CountdownBarrier::count_down`].
    pub fn count_down_global_txn_start_count(&self, lowest_site: bool) -> bool {
        self.barrier
            .count_down(lowest_site)
            .unwrap_or_else(|e| fatal(e))
    }

    pub fn signal_lowest_site_finished(&self) {
        self.barrier
            .signal_finished()
            .unwrap_or_else(|e| fatal(e));
        metrics::counter!(crate::telemetry::MP_ROUNDS_TOTAL).increment(1);
    }

    pub fn barrier(&self) -> &CountdownBarrier {
        &self.barrier
    }

    // ----- replicated resource lock -----

    pub fn lock_replicated_resource(&self) {
        debug_assert!(
            !self.using_mp_memory(),
            "lock the replicated resource before switching to MP memory"
        );
        self.acquire_replicated();
    }

    pub fn unlock_replicated_resource(&self) {
        self.release_replicated();
    }

    /// Variant used while sites are still initializing.
    pub fn lock_replicated_resource_for_init(&self) {
        self.acquire_replicated();
    }

    pub fn unlock_replicated_resource_for_init(&self) {
        self.release_replicated();
    }

    pub fn is_holding_resource_lock(&self) -> bool {
        *self.replicated_holder.lock() == Some(thread::current().id())
    }

    fn acquire_replicated(&self) {
        let me = thread::current().id();
        let mut holder = self.replicated_holder.lock();
        debug_assert!(*holder != Some(me), "replicated resource lock is not reentrant");
        while holder.is_some() {
            self.replicated_released.wait(&mut holder);
        }
        *holder = Some(me);
    }

    fn release_replicated(&self) {
        let mut holder = self.replicated_holder.lock();
        debug_assert_eq!(
            *holder,
            Some(thread::current().id()),
            "replicated resource lock released by a thread that does not hold it"
        );
        *holder = None;
        self.replicated_released.notify_one();
    }

    // ----- undo mirroring -----

    /// Registers `action` on `quantum`. A synchronized action is registered
    /// for real on `quantum` and as a placeholder on the current quantum of
    /// every other active site.
    pub fn add_undo_action(
        self: &Arc<Self>,
        synchronized: bool,
        quantum: &Arc<UndoQuantum>,
        action: Box<dyn UndoReleaseAction>,
        interests: Option<ReplicatedInterests>,
    ) {
        if !synchronized {
            quantum.register_undo_action(action, interests.map(|i| i.real));
            return;
        }
        let (real, dummy) = match interests {
            Some(i) => (Some(i.real), Some(i.dummy)),
            None => (None, None),
        };
        self.register_mirrored(quantum, action, real, dummy);
    }

    /// Like [`add_undo_action`], for truncating a replicated table. Only the
    /// real action carries the truncated table's release interest.
    ///
    /// [`add_undo_action`]: SynchronizedThreadLock::add_undo_action
    pub fn add_truncate_undo_action(
        self: &Arc<Self>,
        synchronized: bool,
        quantum: &Arc<UndoQuantum>,
        action: Box<dyn UndoReleaseAction>,
        deleted_table: Option<Arc<dyn UndoQuantumReleaseInterest>>,
    ) {
        if !synchronized {
            quantum.register_undo_action(action, deleted_table);
            return;
        }
        self.register_mirrored(quantum, action, deleted_table, None);
    }

    fn register_mirrored(
        self: &Arc<Self>,
        quantum: &Arc<UndoQuantum>,
        action: Box<dyn UndoReleaseAction>,
        real_interest: Option<Arc<dyn UndoQuantumReleaseInterest>>,
        dummy_interest: Option<Arc<dyn UndoQuantumReleaseInterest>>,
    ) {
        debug_assert!(
            self.is_in_single_thread_mode() || self.is_holding_resource_lock(),
            "synchronized undo actions are registered by the elected site"
        );
        // usually called from inside MP memory, so take the lock directly
        let _guard = if self.is_holding_resource_lock() {
            None
        } else {
            self.acquire_replicated();
            Some(HeldReplicated(self))
        };

        let kind = action.synchronization();
        let contexts: Vec<_> = self
            .engines
            .lock()
            .active
            .values()
            .filter_map(|engine| engine.context.clone())
            .collect();

        let mut action = Some(action);
        let mut real_interest = real_interest;
        for context in contexts {
            let current = match context.current_undo_quantum() {
                Some(current) => current,
                None => {
                    warn!(partition = %context.partition_id(), "Site has no undo quantum for a synchronized action");
                    continue;
                }
            };
            if Arc::ptr_eq(&current, quantum) {
                if let Some(action) = action.take() {
                    current.register_undo_action(
                        Box::new(SynchronizedUndoReleaseAction::new(action, Arc::clone(self))),
                        real_interest.take(),
                    );
                }
            } else {
                current.register_undo_action(
                    Box::new(SynchronizedDummyUndoReleaseAction::new(kind, Arc::clone(self))),
                    dummy_interest.clone(),
                );
            }
        }

        // the quantum does not belong to a registered site
        if let Some(action) = action {
            quantum.register_undo_action(
                Box::new(SynchronizedUndoReleaseAction::new(action, Arc::clone(self))),
                real_interest,
            );
        }
    }
}

struct HeldReplicated<'a>(&'a SynchronizedThreadLock);

impl Drop for HeldReplicated<'_> {
    fn drop(&mut self) {
        self.0.release_replicated();
    }
}

impl fmt::Debug for SynchronizedThreadLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engines = self.engines.lock();
        f.debug_struct("SynchronizedThreadLock")
            .field("active", &engines.active.keys().collect::<Vec<_>>())
            .field("inactive", &engines.inactive.keys().collect::<Vec<_>>())
            .field("has_mp_engine", &engines.mp_engine.is_some())
            .field("sites_per_host", &engines.sites_per_host)
            .field("barrier", &self.barrier.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{ExecuteWithMpMemory, SiteContext};
    use crate::undo::FnUndoAction;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start_site(lock: &Arc<SynchronizedThreadLock>, id: i32, sites: usize) -> (ThreadLocalPool, Arc<SiteContext>) {
        let pool = ThreadLocalPool::new();
        ThreadLocalPool::set_partition_ids(PartitionId::Site(id));
        let site = SiteContext::new(PartitionId::Site(id));
        lock.init(sites, EngineLocals::current(site.clone()));
        (pool, site)
    }

    #[test]
    fn test_first_site_creates_mp_context() {
        std::thread::spawn(|| {
            let lock = SynchronizedThreadLock::create();
            assert!(lock.mp_engine().is_none());
            let (pool, _site) = start_site(&lock, 0, 1);
            let mp = lock.mp_engine().unwrap();
            assert_eq!(mp.partition_id(), PartitionId::Mp);
            assert_eq!(lock.lowest_site(), Some(PartitionId::Site(0)));
            assert!(lock.is_lowest_site_context());
            assert!(lock.is_in_local_engine_context());

            drop(pool);
            assert!(lock.mp_engine().is_none());
            assert!(lock.active_partitions().is_empty());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_mp_context_swap_under_replicated_lock() {
        std::thread::spawn(|| {
            let lock = SynchronizedThreadLock::create();
            let (_pool, _site) = start_site(&lock, 3, 1);

            lock.lock_replicated_resource();
            assert!(lock.is_holding_resource_lock());
            {
                let _mp = ExecuteWithMpMemory::new(&lock);
                assert!(lock.using_mp_memory());
                assert!(!lock.is_in_local_engine_context());
                let object = ThreadLocalPool::allocate_relocatable(64);
                ThreadLocalPool::free_relocatable(object);
                assert!(matches!(
                    lock.try_assume_mp_memory_context(),
                    Err(MemoryError::ContextMisuse(_))
                ));
            }
            lock.unlock_replicated_resource();
            assert!(!lock.using_mp_memory());
            assert_eq!(ThreadLocalPool::engine_partition_id(), PartitionId::Site(3));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_lowest_site_accounts_for_mp_memory() {
        std::thread::spawn(|| {
            let lock = SynchronizedThreadLock::create();
            let (_pool, _site) = start_site(&lock, 0, 1);
            let before = ThreadLocalPool::pool_allocation_size();

            lock.lock_replicated_resource();
            lock.assume_mp_memory_context();
            let object = ThreadLocalPool::allocate_relocatable(1000);
            lock.assume_local_site_context();
            lock.unlock_replicated_resource();

            assert!(ThreadLocalPool::pool_allocation_size() > before);
            let mp = lock.mp_engine().unwrap();
            mp.locals.free_relocatable(object).unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_deactivated_site_stays_reachable() {
        std::thread::spawn(|| {
            let lock = SynchronizedThreadLock::create();
            let (_pool, _site) = start_site(&lock, 5, 1);
            lock.deactive_engine_locals(PartitionId::Site(5));
            assert!(lock.active_partitions().is_empty());
            assert!(lock.mp_engine().is_some());

            lock.assume_specific_site_context(PartitionId::Site(5));
            assert_eq!(ThreadLocalPool::engine_partition_id(), PartitionId::Site(5));
            lock.assume_local_site_context();
            assert!(lock.try_assume_specific_site_context(PartitionId::Site(6)).is_err());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_unsynchronized_action_goes_to_the_given_quantum_only() {
        std::thread::spawn(|| {
            let lock = SynchronizedThreadLock::create();
            let (_pool, site) = start_site(&lock, 0, 1);
            let quantum = site.begin_undo_quantum(1);
            let undone = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&undone);
            lock.add_undo_action(
                false,
                &quantum,
                Box::new(FnUndoAction::new(
                    move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                    || {},
                )),
                None,
            );
            assert_eq!(quantum.action_count(), 1);
            site.undo(1);
            assert_eq!(undone.load(Ordering::SeqCst), 1);
        })
        .join()
        .unwrap();
    }

    struct CountingInterest(AtomicUsize);

    impl UndoQuantumReleaseInterest for CountingInterest {
        fn notify_quantum_release(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_truncate_action_carries_the_table_interest() {
        std::thread::spawn(|| {
            let lock = SynchronizedThreadLock::create();
            let (_pool, site) = start_site(&lock, 0, 2);
            lock.update_site_per_host(1);
            assert_eq!(lock.sites_per_host(), 1);
            assert_eq!(lock.barrier().sites_per_host(), 1);

            let quantum = site.begin_undo_quantum(1);
            let table = Arc::new(CountingInterest(AtomicUsize::new(0)));
            let interest: Arc<dyn UndoQuantumReleaseInterest> = table.clone();
            let released = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&released);

            lock.lock_replicated_resource_for_init();
            lock.add_truncate_undo_action(
                true,
                &quantum,
                Box::new(FnUndoAction::new(
                    || {},
                    move || {
                        assert!(ThreadLocalPool::engine_partition_id().is_mp());
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                )),
                Some(interest),
            );
            lock.unlock_replicated_resource_for_init();
            assert_eq!(quantum.action_count(), 1);

            site.release(1);
            assert_eq!(released.load(Ordering::SeqCst), 1);
            assert_eq!(table.0.load(Ordering::SeqCst), 1);
            assert_eq!(ThreadLocalPool::engine_partition_id(), PartitionId::Site(0));
        })
        .join()
        .unwrap();
    }
}
