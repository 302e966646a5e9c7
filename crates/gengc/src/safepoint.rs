//! Stop-the-world safepoint protocol
//!
//! Every mutator thread registers once and polls at allocation and store
//! sites. A thread that needs a collection calls
//! [`Safepoint::stop_the_world`], which raises the request flag and blocks
//! until every other registered thread is parked in [`Safepoint::poll`].
//! Dropping the returned guard resumes them.
//!
//! Only one pause is active at a time. A second requester parks like any
//! other mutator and takes its turn once the first pause ends.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::roots::MutatorId;

#[derive(Debug, Default)]
struct SafepointState {
    registered: usize,
    parked: usize,
    active: bool,
    /// Bumped when a pause ends
    epoch: u64,
    next_id: u32,
}

/// Safepoint coordinator shared by all mutators of a heap
#[derive(Debug, Default)]
pub struct Safepoint {
    /// Polled on the fast path without taking the lock
    requested: CachePadded<AtomicBool>,
    state: Mutex<SafepointState>,
    /// Signalled when a pause ends
    resumed: Condvar,
    /// Signalled when a thread parks or leaves
    parked: Condvar,
}

impl Safepoint {
    /// Create a coordinator with no registered threads
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread. Blocks while a pause is in progress.
    pub fn register(&self) -> MutatorId {
        let mut state = self.state.lock();
        while state.active {
            self.resumed.wait(&mut state);
        }
        state.registered += 1;
        let id = MutatorId(state.next_id);
        state.next_id += 1;

        #[cfg(feature = "gc_logging")]
        tracing::trace!(target: "gengc::gc", %id, registered = state.registered, "mutator registered");

        id
    }

    /// Deregister a thread. A pause waiting for it stops waiting.
    pub fn deregister(&self, id: MutatorId) {
        let mut state = self.state.lock();
        state.registered = state.registered.saturating_sub(1);
        self.parked.notify_all();

        #[cfg(feature = "gc_logging")]
        tracing::trace!(target: "gengc::gc", %id, registered = state.registered, "mutator deregistered");
        #[cfg(not(feature = "gc_logging"))]
        let _ = id;
    }

    /// Whether a pause has been requested
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Park here if a pause is requested, until it ends
    #[inline]
    pub fn poll(&self) {
        if self.is_requested() {
            let mut state = self.state.lock();
            self.park(&mut state);
        }
    }

    /// Number of pauses completed
    pub fn pauses(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Number of registered threads
    pub fn registered(&self) -> usize {
        self.state.lock().registered
    }

    /// Park through every active pause
    fn park(&self, state: &mut MutexGuard<'_, SafepointState>) {
        while state.active {
            let epoch = state.epoch;
            state.parked += 1;
            self.parked.notify_all();
            while state.epoch == epoch {
                self.resumed.wait(state);
            }
        }
    }

    /// Stop every other registered thread at a safepoint.
    ///
    /// The caller must be registered and must not hold any lock another
    /// mutator needs to reach its next poll.
    pub fn stop_the_world(&self) -> SafepointGuard<'_> {
        let mut state = self.state.lock();
        self.park(&mut state);

        state.active = true;
        self.requested.store(true, Ordering::Release);

        #[cfg(feature = "gc_logging")]
        tracing::trace!(
            target: "gengc::gc",
            registered = state.registered,
            parked = state.parked,
            "stop-the-world requested"
        );

        while state.parked + 1 < state.registered {
            self.parked.wait(&mut state);
        }
        SafepointGuard { safepoint: self }
    }
}

/// An active pause. Dropping it resumes every parked thread.
#[must_use = "the world restarts as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SafepointGuard<'a> {
    safepoint: &'a Safepoint,
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.safepoint.state.lock();
        state.active = false;
        state.parked = 0;
        state.epoch += 1;
        self.safepoint.requested.store(false, Ordering::Release);
        self.safepoint.resumed.notify_all();

        #[cfg(feature = "gc_logging")]
        tracing::trace!(target: "gengc::gc", epoch = state.epoch, "world resumed");
    }
}
