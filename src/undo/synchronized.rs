//! Undo actions mirrored across every site
//!
//! A change to replicated state is made once, by the lowest site inside the
//! MP memory context, but every site's undo log must see an action at the
//! same position. The lowest site gets the real action wrapped so that it
//! waits for every sibling at the barrier before running; the siblings get a
//! placeholder that only arrives at the barrier.

use super::action::{Synchronization, UndoReleaseAction};
use crate::sync::{ExecuteWithMpMemory, SynchronizedThreadLock};
use std::sync::Arc;
use tracing::trace;

fn run_on_lowest_site(lock: &SynchronizedThreadLock, what: &str, f: impl FnOnce()) {
    if lock.count_down_global_txn_start_count(true) {
        trace!(what, "Running synchronized action in MP memory");
        {
            let _mp = ExecuteWithMpMemory::new(lock);
            f();
        }
        lock.signal_lowest_site_finished();
    }
}

/// Real action of a replicated change, registered on the lowest site.
pub struct SynchronizedUndoReleaseAction {
    action: Box<dyn UndoReleaseAction>,
    synchronization: Synchronization,
    lock: Arc<SynchronizedThreadLock>,
}

impl SynchronizedUndoReleaseAction {
    pub fn new(action: Box<dyn UndoReleaseAction>, lock: Arc<SynchronizedThreadLock>) -> Self {
        Self {
            synchronization: action.synchronization(),
            action,
            lock,
        }
    }
}

impl UndoReleaseAction for SynchronizedUndoReleaseAction {
    fn undo(&mut self) {
        match self.synchronization {
            Synchronization::UndoAndRelease | Synchronization::UndoOnly => {
                let action = &mut self.action;
                run_on_lowest_site(&self.lock, "undo", || action.undo());
            }
            Synchronization::ReleaseOnly => self.action.undo(),
        }
    }

    fn release(&mut self) {
        match self.synchronization {
            Synchronization::UndoAndRelease | Synchronization::ReleaseOnly => {
                let action = &mut self.action;
                run_on_lowest_site(&self.lock, "release", || action.release());
            }
            Synchronization::UndoOnly => self.action.release(),
        }
    }

    fn synchronization(&self) -> Synchronization {
        self.synchronization
    }
}

/// Placeholder registered on every site but the lowest.
pub struct SynchronizedDummyUndoReleaseAction {
    synchronization: Synchronization,
    lock: Arc<SynchronizedThreadLock>,
}

impl SynchronizedDummyUndoReleaseAction {
    pub fn new(synchronization: Synchronization, lock: Arc<SynchronizedThreadLock>) -> Self {
        Self {
            synchronization,
            lock,
        }
    }
}

impl UndoReleaseAction for SynchronizedDummyUndoReleaseAction {
    fn undo(&mut self) {
        if self.synchronization != Synchronization::ReleaseOnly {
            self.lock.count_down_global_txn_start_count(false);
        }
    }

    fn release(&mut self) {
        if self.synchronization != Synchronization::UndoOnly {
            self.lock.count_down_global_txn_start_count(false);
        }
    }

    fn synchronization(&self) -> Synchronization {
        self.synchronization
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PartitionId, ThreadLocalPool};
    use crate::sync::{EngineLocals, SiteContext};
    use crate::undo::action::FnUndoAction;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_site_real_action_runs_in_mp_memory() {
        std::thread::spawn(|| {
            let lock = SynchronizedThreadLock::create();
            let _pool = ThreadLocalPool::new();
            ThreadLocalPool::set_partition_ids(PartitionId::Site(0));
            let site = SiteContext::new(PartitionId::Site(0));
            lock.init(1, EngineLocals::current(site.clone()));

            let seen = Arc::new(AtomicUsize::new(0));
            let seen_in_undo = Arc::clone(&seen);
            let action = FnUndoAction::new(
                move || {
                    assert_eq!(ThreadLocalPool::engine_partition_id(), PartitionId::Mp);
                    seen_in_undo.fetch_add(1, Ordering::SeqCst);
                },
                || {},
            )
            .with_synchronization(Synchronization::UndoOnly);
            let mut real = SynchronizedUndoReleaseAction::new(Box::new(action), Arc::clone(&lock));

            real.undo();
            real.release();
            assert_eq!(seen.load(Ordering::SeqCst), 1);
            assert_eq!(ThreadLocalPool::engine_partition_id(), PartitionId::Site(0));
            assert!(!lock.is_in_single_thread_mode());
        })
        .join()
        .unwrap();
    }
}
