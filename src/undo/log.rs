//! Per-site undo log

use super::action::UndoQuantumReleaseInterest;
use super::quantum::{UndoDataPool, UndoQuantum};
use crate::config::MemoryConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Ordered undo quanta of one site, oldest first.
#[derive(Debug)]
pub struct UndoLog {
    quanta: VecDeque<Arc<UndoQuantum>>,
    cached_pools: Vec<UndoDataPool>,
    cache_limit: usize,
    last_undo_token: i64,
    last_release_token: i64,
}

impl UndoLog {
    pub fn new(cache_limit: usize) -> Self {
        Self {
            quanta: VecDeque::new(),
            cached_pools: Vec::new(),
            cache_limit,
            last_undo_token: i64::MIN,
            last_release_token: i64::MIN,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.undo_pool_cache_limit)
    }

    /// Opens the quantum for `token`. Tokens must strictly increase.
    pub fn generate_undo_quantum(&mut self, token: i64) -> Arc<UndoQuantum> {
        debug_assert!(
            token > self.last_undo_token && token > self.last_release_token,
            "undo token {} is not newer than {}",
            token,
            self.last_undo_token.max(self.last_release_token)
        );
        let pool = self.cached_pools.pop().unwrap_or_default();
        let quantum = Arc::new(UndoQuantum::new(token, pool));
        self.quanta.push_back(Arc::clone(&quantum));
        self.last_undo_token = token;
        trace!(token, pending = self.quanta.len(), "Generated undo quantum");
        quantum
    }

    /// Rolls back every quantum with a token at or above `token`, newest
    /// first.
    pub fn undo(&mut self, token: i64) {
        while let Some(quantum) = self.quanta.back() {
            if quantum.token() < token {
                break;
            }
            let quantum = match self.quanta.pop_back() {
                Some(quantum) => quantum,
                None => break,
            };
            debug!(token = quantum.token(), "Undoing quantum");
            let pool = quantum.undo();
            self.recycle(pool);
        }
    }

    /// Releases every quantum with a token at or below `token`, oldest
    /// first.
    ///
    /// Release interests are collected over the whole window: each is
    /// notified once, and an interest cancelled anywhere in the window is
    /// not notified at all.
    pub fn release(&mut self, token: i64) {
        debug_assert!(
            token > self.last_release_token,
            "release token {} already released",
            token
        );
        self.last_release_token = token;

        let mut interests: Vec<Arc<dyn UndoQuantumReleaseInterest>> = Vec::new();
        let mut cancelled: Vec<Arc<dyn UndoQuantumReleaseInterest>> = Vec::new();
        while let Some(quantum) = self.quanta.front() {
            if quantum.token() > token {
                break;
            }
            let quantum = match self.quanta.pop_front() {
                Some(quantum) => quantum,
                None => break,
            };
            trace!(token = quantum.token(), "Releasing quantum");
            let (pool, registered, withdrawn) = quantum.release();
            for interest in registered {
                if !interests.iter().any(|i| Arc::ptr_eq(i, &interest)) {
                    interests.push(interest);
                }
            }
            cancelled.extend(withdrawn);
            self.recycle(pool);
        }

        interests.retain(|i| !cancelled.iter().any(|c| Arc::ptr_eq(c, i)));
        for interest in &interests {
            interest.notify_quantum_release();
        }
        for interest in &interests {
            interest.finalize_release();
        }
    }

    fn recycle(&mut self, mut pool: UndoDataPool) {
        pool.purge();
        if self.cached_pools.len() < self.cache_limit {
            self.cached_pools.push(pool);
        }
    }

    /// Pending quanta.
    pub fn size(&self) -> usize {
        self.quanta.len()
    }

    /// Token of the most recently generated quantum.
    pub fn last_undo_token(&self) -> i64 {
        self.last_undo_token
    }

    pub fn cached_pool_count(&self) -> usize {
        self.cached_pools.len()
    }

    pub fn newest_quantum(&self) -> Option<Arc<UndoQuantum>> {
        self.quanta.back().cloned()
    }
}
