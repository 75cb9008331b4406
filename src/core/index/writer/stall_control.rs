// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::Result;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Controls the health status of a `DocumentsWriter` sessions. This struct
/// is used to block incoming indexing threads if flushing is significantly
/// slower than indexing. If flushing is significantly slower than indexing
/// the net memory used within a writer session can increase very quickly
/// and easily exceed the available memory.
///
/// The `DocumentsWriterFlushControl` decides when the session is stalled,
/// this gate only parks the producers until it reports healthy again.
pub struct DocumentsWriterStallControl {
    lock: Mutex<StallState>,
    cond: Condvar,
    stalled: AtomicBool,
}

#[derive(Default)]
struct StallState {
    num_waiting: u32,
    was_stalled: bool,
    waiting: HashMap<ThreadId, bool>,
}

impl Default for DocumentsWriterStallControl {
    fn default() -> Self {
        DocumentsWriterStallControl {
            lock: Mutex::new(StallState::default()),
            cond: Condvar::new(),
            stalled: AtomicBool::new(false),
        }
    }
}

impl DocumentsWriterStallControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, StallState> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update the stalled flag status. Releases all threads waiting on
    /// `wait_if_stalled` whenever the flag changes.
    pub fn update_stalled(&self, stalled: bool) {
        let mut guard = self.lock_state();
        if self.stalled.load(Ordering::Acquire) != stalled {
            self.stalled.store(stalled, Ordering::Release);
            if stalled {
                guard.was_stalled = true;
            }
            self.cond.notify_all();
        }
    }

    /// Blocks if documents writing is currently in a stalled state.
    pub fn wait_if_stalled(&self) -> Result<()> {
        if self.stalled.load(Ordering::Acquire) {
            let mut guard = self.lock.lock()?;
            if self.stalled.load(Ordering::Acquire) {
                // don't loop here, higher level logic will re-stall!
                Self::inc_waiters(&mut guard);
                // just wait for up to 1 second here, and let caller re-stall
                // if it's still needed:
                let (mut guard, _) = self.cond.wait_timeout(guard, Duration::new(1, 0))?;
                Self::decr_waiters(&mut guard);
            }
        }
        Ok(())
    }

    fn inc_waiters(state: &mut StallState) {
        state.num_waiting += 1;
        let v = state.waiting.insert(thread::current().id(), true);
        debug_assert!(v.is_none());
    }

    fn decr_waiters(state: &mut StallState) {
        debug_assert!(state.num_waiting > 0);
        let v = state.waiting.remove(&thread::current().id());
        debug_assert!(v.is_some());
        state.num_waiting -= 1;
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn has_blocked(&self) -> bool {
        self.lock_state().num_waiting > 0
    }

    pub fn is_healthy(&self) -> bool {
        !self.stalled.load(Ordering::Acquire)
    }

    pub fn is_thread_queued(&self, t: &ThreadId) -> bool {
        self.lock_state().waiting.contains_key(t)
    }

    pub fn was_stalled(&self) -> bool {
        self.lock_state().was_stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_healthy() {
        let ctrl = DocumentsWriterStallControl::new();
        ctrl.update_stalled(false);
        assert!(ctrl.is_healthy());
        assert!(!ctrl.was_stalled());
        // not stalled, returns right away
        ctrl.wait_if_stalled().unwrap();
        assert!(!ctrl.has_blocked());
    }

    #[test]
    fn test_release_waiters() {
        let ctrl = Arc::new(DocumentsWriterStallControl::new());
        ctrl.update_stalled(true);
        assert!(ctrl.any_stalled_threads());
        assert!(ctrl.was_stalled());

        let mut waiters = vec![];
        for _ in 0..3 {
            let ctrl = Arc::clone(&ctrl);
            waiters.push(thread::spawn(move || {
                let start = Instant::now();
                ctrl.wait_if_stalled().unwrap();
                start.elapsed()
            }));
        }

        let start = Instant::now();
        while !ctrl.has_blocked() && start.elapsed() < Duration::from_secs(5) {
            thread::yield_now();
        }
        ctrl.update_stalled(false);
        assert!(ctrl.is_healthy());
        for waiter in waiters {
            assert!(waiter.join().unwrap() < Duration::from_secs(5));
        }
        assert!(!ctrl.has_blocked());
        assert!(!ctrl.is_thread_queued(&thread::current().id()));
        assert!(ctrl.was_stalled());
    }

    #[test]
    fn test_wait_times_out() {
        let ctrl = DocumentsWriterStallControl::new();
        ctrl.update_stalled(true);
        // nobody releases us, the wait gives up on its own
        ctrl.wait_if_stalled().unwrap();
        assert!(!ctrl.is_healthy());
        assert!(!ctrl.has_blocked());
    }
}
