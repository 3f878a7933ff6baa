//! Single-use, auto-resetting countdown barrier
//!
//! Every site thread arrives once per coordinated round. The lowest site
//! waits until all siblings have arrived, runs alone ("single-thread mode"),
//! then releases everyone. A thread that arrives while the previous round is
//! still being released waits for that release to finish first.
//!
//! ```text
//! Idle ──arrive──> Counting ──last arrival──> Executing ──signal──> Releasing ──all woke──> Idle
//! ```

use crate::error::{MemoryError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    Idle,
    Counting,
    Executing,
    Releasing,
}

impl fmt::Display for BarrierPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierPhase::Idle => write!(f, "idle"),
            BarrierPhase::Counting => write!(f, "counting"),
            BarrierPhase::Executing => write!(f, "executing"),
            BarrierPhase::Releasing => write!(f, "releasing"),
        }
    }
}

#[derive(Debug)]
struct BarrierState {
    phase: BarrierPhase,
    sites_per_host: usize,
    countdown: usize,
    generation: u64,
    lowest_arrived: bool,
    /// Waiters that have not yet observed the current release.
    unreleased: usize,
}

#[derive(Debug)]
pub struct CountdownBarrier {
    state: Mutex<BarrierState>,
    lowest_wake: Condvar,
    release: Condvar,
}

impl CountdownBarrier {
    pub fn new(sites_per_host: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                phase: BarrierPhase::Idle,
                sites_per_host,
                countdown: sites_per_host,
                generation: 0,
                lowest_arrived: false,
                unreleased: 0,
            }),
            lowest_wake: Condvar::new(),
            release: Condvar::new(),
        }
    }

    /// Changes the participant count. Only legal between rounds.
    pub fn set_sites_per_host(&self, sites: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase != BarrierPhase::Idle {
            return Err(MemoryError::BarrierMisuse(format!(
                "cannot resize while {}",
                state.phase
            )));
        }
        state.sites_per_host = sites;
        state.countdown = sites;
        Ok(())
    }

    /// Arrives at the barrier.
    ///
    /// The lowest site returns `true` once every sibling has arrived and is
    /// then the only thread running until [`signal_finished`]. Every other
    /// site blocks until that signal and returns `false`.
    ///
    /// [`signal_finished`]: CountdownBarrier::signal_finished
    pub fn count_down(&self, lowest_site: bool) -> Result<bool> {
        let mut state = self.state.lock();
        while state.phase == BarrierPhase::Releasing {
            self.release.wait(&mut state);
        }
        if state.phase == BarrierPhase::Executing {
            return Err(MemoryError::BarrierMisuse(
                "arrived while the lowest site is executing".to_string(),
            ));
        }
        if state.countdown == 0 {
            return Err(MemoryError::BarrierMisuse(format!(
                "more arrivals than the {} configured sites",
                state.sites_per_host
            )));
        }
        if lowest_site && state.lowest_arrived {
            return Err(MemoryError::BarrierMisuse(
                "lowest site arrived twice in one round".to_string(),
            ));
        }

        state.phase = BarrierPhase::Counting;
        state.countdown -= 1;
        let generation = state.generation;
        trace!(lowest_site, remaining = state.countdown, generation, "Barrier arrival");

        if lowest_site {
            state.lowest_arrived = true;
            while state.countdown > 0 {
                self.lowest_wake.wait(&mut state);
            }
            state.phase = BarrierPhase::Executing;
            debug!(generation, "Entering single-thread mode");
            Ok(true)
        } else {
            if state.countdown == 0 {
                self.lowest_wake.notify_all();
            }
            while state.generation == generation {
                self.release.wait(&mut state);
            }
            state.unreleased -= 1;
            if state.unreleased == 0 {
                state.phase = BarrierPhase::Idle;
                self.release.notify_all();
            }
            Ok(false)
        }
    }

    /// Ends the round started by the lowest site's `count_down`.
    pub fn signal_finished(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase != BarrierPhase::Executing {
            return Err(MemoryError::BarrierMisuse(format!(
                "signalled finished while {}",
                state.phase
            )));
        }
        state.countdown = state.sites_per_host;
        state.lowest_arrived = false;
        state.generation += 1;
        state.unreleased = state.sites_per_host - 1;
        state.phase = if state.unreleased == 0 {
            BarrierPhase::Idle
        } else {
            BarrierPhase::Releasing
        };
        debug!(generation = state.generation, "Leaving single-thread mode");
        self.release.notify_all();
        Ok(())
    }

    pub fn is_single_thread_mode(&self) -> bool {
        self.state.lock().phase == BarrierPhase::Executing
    }

    pub fn phase(&self) -> BarrierPhase {
        self.state.lock().phase
    }

    pub fn countdown(&self) -> usize {
        self.state.lock().countdown
    }

    pub fn sites_per_host(&self) -> usize {
        self.state.lock().sites_per_host
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_site_round_does_not_block() {
        let barrier = CountdownBarrier::new(1);
        assert!(barrier.count_down(true).unwrap());
        assert!(barrier.is_single_thread_mode());
        barrier.signal_finished().unwrap();
        assert_eq!(barrier.phase(), BarrierPhase::Idle);
        assert_eq!(barrier.countdown(), 1);
    }

    #[test]
    fn test_exactly_one_thread_executes_per_round() {
        let sites = 4;
        let barrier = CountdownBarrier::new(sites);
        let executed = AtomicUsize::new(0);
        let released = AtomicUsize::new(0);

        for round in 0..20 {
            std::thread::scope(|scope| {
                for site in 0..sites {
                    let barrier = &barrier;
                    let executed = &executed;
                    let released = &released;
                    scope.spawn(move || {
                        if barrier.count_down(site == 0).unwrap() {
                            // all siblings are parked
                            assert_eq!(released.load(Ordering::SeqCst), round * (sites - 1));
                            executed.fetch_add(1, Ordering::SeqCst);
                            barrier.signal_finished().unwrap();
                        } else {
                            assert_eq!(executed.load(Ordering::SeqCst), round + 1);
                            released.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });
            assert_eq!(barrier.countdown(), sites);
            assert_eq!(barrier.phase(), BarrierPhase::Idle);
        }
        assert_eq!(executed.load(Ordering::SeqCst), 20);
        assert_eq!(barrier.generation(), 20);
    }

    #[test]
    fn test_signal_without_round_is_misuse() {
        let barrier = CountdownBarrier::new(2);
        assert!(matches!(
            barrier.signal_finished(),
            Err(MemoryError::BarrierMisuse(_))
        ));
    }

    #[test]
    fn test_resize_between_rounds() {
        let barrier = CountdownBarrier::new(2);
        barrier.set_sites_per_host(1).unwrap();
        assert!(barrier.count_down(true).unwrap());
        assert!(barrier.set_sites_per_host(3).is_err());
        barrier.signal_finished().unwrap();
    }
}
