//! Undo quanta: the actions of one transaction token

use super::action::{UndoQuantumReleaseInterest, UndoReleaseAction};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Scratch storage for undo data, purged and recycled with its quantum.
#[derive(Debug, Default)]
pub struct UndoDataPool {
    bytes: Vec<u8>,
    allocations: usize,
}

impl UndoDataPool {
    /// Copies `data` into the pool and returns where it landed.
    pub fn store(&mut self, data: &[u8]) -> Range<usize> {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(data);
        self.allocations += 1;
        start..self.bytes.len()
    }

    pub fn get(&self, range: Range<usize>) -> &[u8] {
        &self.bytes[range]
    }

    /// Drops the contents but keeps the capacity.
    pub fn purge(&mut self) {
        self.bytes.clear();
        self.allocations = 0;
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }
}

struct QuantumState {
    actions: Vec<Box<dyn UndoReleaseAction>>,
    interests: Vec<Arc<dyn UndoQuantumReleaseInterest>>,
    cancelled: Vec<Arc<dyn UndoQuantumReleaseInterest>>,
    data: UndoDataPool,
}

/// The undo actions registered for one token.
///
/// Shared behind an `Arc`: the lowest site registers placeholder actions on
/// every sibling's current quantum while they are parked at the barrier.
pub struct UndoQuantum {
    token: i64,
    state: Mutex<QuantumState>,
}

fn same_interest(
    a: &Arc<dyn UndoQuantumReleaseInterest>,
    b: &Arc<dyn UndoQuantumReleaseInterest>,
) -> bool {
    Arc::ptr_eq(a, b)
}

impl UndoQuantum {
    pub(crate) fn new(token: i64, data: UndoDataPool) -> Self {
        Self {
            token,
            state: Mutex::new(QuantumState {
                actions: Vec::new(),
                interests: Vec::new(),
                cancelled: Vec::new(),
                data,
            }),
        }
    }

    #[inline]
    pub fn token(&self) -> i64 {
        self.token
    }

    /// Appends `action`; `interest`, if given, is notified on release.
    pub fn register_undo_action(
        &self,
        action: Box<dyn UndoReleaseAction>,
        interest: Option<Arc<dyn UndoQuantumReleaseInterest>>,
    ) {
        let mut state = self.state.lock();
        state.actions.push(action);
        if let Some(interest) = interest {
            Self::add_interest(&mut state, interest);
        }
    }

    pub fn register_release_interest(&self, interest: Arc<dyn UndoQuantumReleaseInterest>) {
        Self::add_interest(&mut self.state.lock(), interest);
    }

    /// Withdraws an interest; it will not be notified for this window.
    pub fn cancel_release_interest(&self, interest: Arc<dyn UndoQuantumReleaseInterest>) {
        let mut state = self.state.lock();
        state.interests.retain(|existing| !same_interest(existing, &interest));
        if !state.cancelled.iter().any(|c| same_interest(c, &interest)) {
            state.cancelled.push(interest);
        }
    }

    fn add_interest(state: &mut QuantumState, interest: Arc<dyn UndoQuantumReleaseInterest>) {
        if !state.interests.iter().any(|i| same_interest(i, &interest)) {
            state.interests.push(interest);
        }
    }

    pub fn action_count(&self) -> usize {
        self.state.lock().actions.len()
    }

    pub fn with_data_pool<R>(&self, f: impl FnOnce(&mut UndoDataPool) -> R) -> R {
        f(&mut self.state.lock().data)
    }

    /// Runs every action's undo, newest first. The quantum lock is not held
    /// while actions run, since synchronized actions park at the barrier.
    pub(crate) fn undo(&self) -> UndoDataPool {
        let (actions, data) = {
            let mut state = self.state.lock();
            state.interests.clear();
            state.cancelled.clear();
            (
                std::mem::take(&mut state.actions),
                std::mem::take(&mut state.data),
            )
        };
        for mut action in actions.into_iter().rev() {
            action.undo();
        }
        data
    }

    /// Runs every action's release in registration order and hands back
    /// the interests and cancellations of this quantum.
    #[allow(clippy::type_complexity)]
    pub(crate) fn release(
        &self,
    ) -> (
        UndoDataPool,
        Vec<Arc<dyn UndoQuantumReleaseInterest>>,
        Vec<Arc<dyn UndoQuantumReleaseInterest>>,
    ) {
        let (actions, data, interests, cancelled) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.actions),
                std::mem::take(&mut state.data),
                std::mem::take(&mut state.interests),
                std::mem::take(&mut state.cancelled),
            )
        };
        for mut action in actions {
            action.release();
        }
        (data, interests, cancelled)
    }
}

impl fmt::Debug for UndoQuantum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UndoQuantum")
            .field("token", &self.token)
            .field("actions", &state.actions.len())
            .field("interests", &state.interests.len())
            .finish()
    }
}
