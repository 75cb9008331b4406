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

use crate::core::index::writer::{
    DocConsumer, DocumentsWriterDeleteQueue, DocumentsWriterPerThread,
    DocumentsWriterPerThreadPool, DocumentsWriterStallControl, FlushPolicy, IndexWriterConfig,
    ThreadState, ThreadStateHandle,
};
use crate::error::Result;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// This struct controls `DocumentsWriterPerThread` flushing during
/// indexing. It tracks the memory consumption per
/// `DocumentsWriterPerThread` and uses a configured `FlushPolicy` to
/// decide if a `DocumentsWriterPerThread` must flush.
///
/// In addition to the `FlushPolicy` the flush control might set certain
/// `DocumentsWriterPerThread` as flush pending iff a
/// `DocumentsWriterPerThread` exceeds the
/// `IndexWriterConfig#per_thread_hard_limit` to prevent address space
/// exhaustion.
///
/// Every writer lives in exactly one place at a time: its `ThreadState`,
/// the blocked flushes, the flush queue or the hands of a flushing thread
/// (recorded in the flushing writers). Writers only move between them by
/// value while the control is locked.
///
/// Lock order: a `ThreadState` lock is always taken before the control
/// lock. While the control is locked other states are only `try_lock`ed.
pub struct DocumentsWriterFlushControl<C: DocConsumer> {
    lock: Mutex<FlushControlInner<C>>,
    cond: Condvar,
    hard_max_bytes_per_dwpt: u64,
    flush_deletes: AtomicBool,
    stall_control: DocumentsWriterStallControl,
    per_thread_pool: Arc<DocumentsWriterPerThreadPool<C>>,
    flush_policy: Arc<dyn FlushPolicy<C>>,
    config: Arc<IndexWriterConfig>,
}

struct FlushControlInner<C: DocConsumer> {
    active_bytes: u64,
    flush_bytes: u64,
    num_pending: usize,
    full_flush: bool,
    flush_queue: VecDeque<DocumentsWriterPerThread<C>>,
    // only for safety reasons if a DWPT is close to the RAM limit
    blocked_flushes: Vec<BlockedFlush<C>>,
    // key is segment_name of the DocumentsWriterPerThread
    flushing_writers: HashMap<String, u64>,
    full_flush_buffer: Vec<DocumentsWriterPerThread<C>>,
    // all new DWPT are bound to this queue, replaced on each full flush
    delete_queue: Arc<DocumentsWriterDeleteQueue>,
    closed: bool,
}

struct BlockedFlush<C: DocConsumer> {
    dwpt: DocumentsWriterPerThread<C>,
    bytes: u64,
}

impl<C: DocConsumer> BlockedFlush<C> {
    fn new(dwpt: DocumentsWriterPerThread<C>, bytes: u64) -> Self {
        BlockedFlush { dwpt, bytes }
    }
}

impl<C: DocConsumer> DocumentsWriterFlushControl<C> {
    pub fn new(
        config: Arc<IndexWriterConfig>,
        flush_policy: Arc<dyn FlushPolicy<C>>,
        per_thread_pool: Arc<DocumentsWriterPerThreadPool<C>>,
    ) -> Self {
        let hard_max_bytes_per_dwpt = config.per_thread_hard_limit();
        let inner = FlushControlInner {
            active_bytes: 0,
            flush_bytes: 0,
            num_pending: 0,
            full_flush: false,
            flush_queue: VecDeque::new(),
            blocked_flushes: vec![],
            flushing_writers: HashMap::new(),
            full_flush_buffer: vec![],
            delete_queue: Arc::new(DocumentsWriterDeleteQueue::default()),
            closed: false,
        };
        DocumentsWriterFlushControl {
            lock: Mutex::new(inner),
            cond: Condvar::new(),
            hard_max_bytes_per_dwpt,
            flush_deletes: AtomicBool::new(false),
            stall_control: DocumentsWriterStallControl::new(),
            per_thread_pool,
            flush_policy,
            config,
        }
    }

    /// Locks the control. The bookkeeping is only ever changed as a whole
    /// so a poisoned lock still guards consistent counters.
    pub fn lock(&self) -> LockedFlushControl<'_, C> {
        LockedFlushControl {
            control: self,
            inner: self.lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn per_thread_pool(&self) -> &Arc<DocumentsWriterPerThreadPool<C>> {
        &self.per_thread_pool
    }

    pub fn config(&self) -> &Arc<IndexWriterConfig> {
        &self.config
    }

    pub fn stall_control(&self) -> &DocumentsWriterStallControl {
        &self.stall_control
    }

    pub fn hard_max_bytes_per_dwpt(&self) -> u64 {
        self.hard_max_bytes_per_dwpt
    }

    /// Accounts the bytes of the document just added to the state and runs
    /// the flush policy. Returns a writer the calling thread must flush, if
    /// any. The caller must hold the lock of `per_thread`.
    pub fn do_after_document(
        &self,
        per_thread: &mut ThreadState<C>,
        is_update: bool,
    ) -> Option<DocumentsWriterPerThread<C>> {
        let mut locked = self.lock();
        let res = locked.process_after_document(per_thread, is_update);
        locked.update_stall_state();
        res
    }

    /// Sets flush pending state on the given `ThreadState`. The state must
    /// not be pending yet.
    pub fn set_flush_pending(&self, per_thread: &mut ThreadState<C>) {
        let mut locked = self.lock();
        locked.set_flush_pending(per_thread);
        locked.update_stall_state();
    }

    pub fn try_checkout_for_flush(
        &self,
        per_thread: &mut ThreadState<C>,
    ) -> Option<DocumentsWriterPerThread<C>> {
        self.lock().try_checkout_for_flush(per_thread)
    }

    /// Called once a checked out writer is flushed or given up. Wakes all
    /// threads waiting for flushes to finish.
    pub fn do_after_flush(&self, dwpt: DocumentsWriterPerThread<C>) {
        self.lock().do_after_flush(dwpt);
    }

    pub fn do_on_delete(&self) {
        let mut locked = self.lock();
        // pass None this is a global delete no update
        self.flush_policy.on_delete(&mut locked, None);
    }

    /// Takes the writer of an aborted state out of the accounting and out
    /// of the state. The returned writer is stale.
    pub fn do_on_abort(&self, state: &mut ThreadState<C>) -> Option<DocumentsWriterPerThread<C>> {
        let mut locked = self.lock();
        let dwpt = locked.discard_state(state);
        locked.update_stall_state();
        dwpt
    }

    /// Returns the next writer to flush: the head of the flush queue, or
    /// outside a full flush any pending writer whose state is not locked
    /// right now. Never blocks on a `ThreadState`.
    pub fn next_pending_flush(&self) -> Option<DocumentsWriterPerThread<C>> {
        let (num_pending, full_flush) = {
            let mut locked = self.lock();
            if let Some(dwpt) = locked.inner.flush_queue.pop_front() {
                locked.update_stall_state();
                return Some(dwpt);
            }
            (locked.inner.num_pending, locked.inner.full_flush)
        };

        // don't check if we are doing a full flush
        if num_pending > 0 && !full_flush {
            for state in self.per_thread_pool.thread_states() {
                if let Ok(mut guard) = state.try_lock() {
                    if guard.flush_pending() {
                        if let Some(dwpt) = self.try_checkout_for_flush(&mut guard) {
                            return Some(dwpt);
                        }
                    }
                }
            }
        }
        None
    }

    /// Hands out a `ThreadState` for indexing. A state whose writer is
    /// bound to an old delete queue generation is enrolled in the running
    /// full flush first, the caller then gets a fresh state.
    pub fn obtain_and_lock(&self) -> Result<ThreadStateHandle<C>> {
        let per_thread = self.per_thread_pool.get_and_lock()?;
        {
            let mut guard = per_thread
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let generation = self.lock().inner.delete_queue.generation;
            if guard.inited() && guard.dwpt.as_ref().map(|d| d.generation()) != Some(generation)
            {
                // There is a flush-all in process and this DWPT is now
                // stale, enroll it for flush and try for another DWPT:
                self.add_flushable_state(&mut guard);
            }
        }
        Ok(per_thread)
    }

    /// Starts a full flush: installs a new delete queue generation and
    /// moves every writer of the old generation into the flush queue.
    /// Returns the sequence number the full flush is assigned and the
    /// delete queue it flushes.
    pub fn mark_for_full_flush(&self) -> Result<(u64, Arc<DocumentsWriterDeleteQueue>)> {
        let (seq_no, flushing_queue) = {
            let mut locked = self.lock();
            debug_assert!(!locked.inner.full_flush, "called DWFC#mark_for_full_flush() while full flush is still running");
            debug_assert!(locked.inner.full_flush_buffer.is_empty());
            locked.inner.full_flush = true;
            let flushing_queue = Arc::clone(&locked.inner.delete_queue);
            // Insert a gap in seq_no of current active thread count, in the
            // worst case each of those threads now have one operation in
            // flight. It's fine if we have some sequence numbers that were
            // never assigned:
            let seq_no = flushing_queue.last_sequence_number()
                + self.per_thread_pool.active_thread_state_count() as u64
                + 2;
            flushing_queue.set_max_seq_no(seq_no + 1);
            // all subsequent DWPT will use this queue until we do another
            // full flush
            locked.inner.delete_queue = Arc::new(DocumentsWriterDeleteQueue::with_generation(
                flushing_queue.generation + 1,
                seq_no + 1,
            ));
            (seq_no, flushing_queue)
        };
        debug!(
            "DWFC: mark for full flush of generation {}",
            flushing_queue.generation
        );

        for next in self.per_thread_pool.thread_states() {
            let mut guard = next.lock()?;
            if !guard.inited() {
                if guard.is_active() && self.is_closed() {
                    self.per_thread_pool.deactivate_thread_state(&mut guard);
                }
                continue;
            }
            if guard.dwpt.as_ref().map(|d| d.generation()) != Some(flushing_queue.generation) {
                // this one is already a new DWPT
                continue;
            }
            self.add_flushable_state(&mut guard);
        }

        {
            // move all DWPT that were concurrently marked as pending and
            // moved to blocked over to the flush queue, indexing is not
            // blocked while we mark the states above.
            let mut locked = self.lock();
            locked.prune_blocked_queue(flushing_queue.generation);
            let full_flush_buffer = mem::replace(&mut locked.inner.full_flush_buffer, vec![]);
            locked.inner.flush_queue.extend(full_flush_buffer);
            locked.update_stall_state();
        }
        Ok((seq_no, flushing_queue))
    }

    /// Enrolls the writer of the given state into the running full flush,
    /// or discards it if it buffers no documents.
    pub fn add_flushable_state(&self, per_thread: &mut ThreadState<C>) {
        debug_assert!(per_thread.inited());
        if let Some(dwpt) = &per_thread.dwpt {
            debug!("DWFC: add_flushable_state for {}", dwpt.segment_name);
        }
        let mut locked = self.lock();
        debug_assert!(locked.inner.full_flush);
        if per_thread.num_docs_in_ram() > 0 {
            if !per_thread.flush_pending() {
                locked.set_flush_pending(per_thread);
            }
            let flushing_dwpt = locked.internal_try_checkout_for_flush(per_thread);
            debug_assert!(flushing_dwpt.is_some());
            if let Some(dwpt) = flushing_dwpt {
                locked.inner.full_flush_buffer.push(dwpt);
            }
        } else if let Some(dwpt) = locked.discard_state(per_thread) {
            // make this state inactive
            self.per_thread_pool.recycle(dwpt);
        }
        locked.update_stall_state();
    }

    /// Ends a successful full flush. Writers that were blocked while it ran
    /// become regular queued flushes.
    pub fn finish_full_flush(&self) {
        let mut locked = self.lock();
        debug_assert!(locked.inner.full_flush);
        debug_assert!(locked.inner.flush_queue.is_empty());
        debug_assert!(locked.inner.flushing_writers.is_empty());

        if !locked.inner.blocked_flushes.is_empty() {
            let generation = locked.inner.delete_queue.generation;
            debug_assert!(locked
                .inner
                .blocked_flushes
                .iter()
                .all(|bf| bf.dwpt.generation() == generation));
            locked.prune_blocked_queue(generation);
            debug_assert!(locked.inner.blocked_flushes.is_empty());
        }
        locked.inner.full_flush = false;
        locked.update_stall_state();
    }

    /// Aborts a failed full flush, see `abort_pending_flushes`.
    pub fn abort_full_flushes(&self, new_files: &mut HashSet<String>) -> u32 {
        let mut locked = self.lock();
        let aborted = locked.abort_pending_flushes(new_files);
        locked.inner.full_flush = false;
        aborted
    }

    /// Aborts every queued and blocked writer. A writer whose abort fails is
    /// still taken out of the accounting. Files the aborted writers created
    /// are added to `new_files`. Returns the number of aborted documents.
    pub fn abort_pending_flushes(&self, new_files: &mut HashSet<String>) -> u32 {
        self.lock().abort_pending_flushes(new_files)
    }

    /// Blocks until no checked out writer is flushing anymore.
    pub fn wait_for_flush(&self) -> Result<()> {
        let mut guard = self.lock.lock()?;
        while !guard.flushing_writers.is_empty() {
            guard = self.cond.wait(guard)?;
        }
        Ok(())
    }

    /// This method will block if too many DWPT are currently flushing and no
    /// checked out DWPT are available
    pub fn wait_if_stalled(&self) -> Result<()> {
        self.stall_control.wait_if_stalled()
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stall_control.any_stalled_threads()
    }

    /// Set by `DocumentsWriter` to signal that no new DWPT should be
    /// released after close.
    pub fn set_closed(&self) {
        let mut locked = self.lock();
        locked.inner.closed = true;
        self.per_thread_pool.deactivate_unreleased_states();
        locked.update_stall_state();
    }

    pub fn get_and_reset_apply_all_deletes(&self) -> bool {
        self.flush_deletes.swap(false, Ordering::AcqRel)
    }

    pub fn set_apply_all_deletes(&self) {
        self.flush_deletes.store(true, Ordering::Release)
    }

    pub fn delete_queue(&self) -> Arc<DocumentsWriterDeleteQueue> {
        Arc::clone(&self.lock().inner.delete_queue)
    }

    pub fn num_global_term_deletes(&self) -> usize {
        self.lock().num_global_term_deletes()
    }

    pub fn delete_bytes_used(&self) -> u64 {
        self.lock().delete_bytes_used()
    }

    pub fn active_bytes(&self) -> u64 {
        self.lock().inner.active_bytes
    }

    pub fn flush_bytes(&self) -> u64 {
        self.lock().inner.flush_bytes
    }

    pub fn net_bytes(&self) -> u64 {
        self.lock().net_bytes()
    }

    pub fn num_pending(&self) -> usize {
        self.lock().inner.num_pending
    }

    pub fn num_queued_flushes(&self) -> usize {
        self.lock().inner.flush_queue.len()
    }

    pub fn num_blocked_flushes(&self) -> usize {
        self.lock().inner.blocked_flushes.len()
    }

    pub fn num_flushing_dwpt(&self) -> usize {
        self.lock().inner.flushing_writers.len()
    }

    pub fn is_full_flush(&self) -> bool {
        self.lock().inner.full_flush
    }

    pub fn is_closed(&self) -> bool {
        self.lock().inner.closed
    }
}

impl<C: DocConsumer> fmt::Display for DocumentsWriterFlushControl<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let locked = self.lock();
        write!(
            f,
            "DocumentsWriterFlushControl [active_bytes={}, flush_bytes={}, num_pending={}, \
             queued={}, blocked={}, flushing={}, full_flush={}]",
            locked.inner.active_bytes,
            locked.inner.flush_bytes,
            locked.inner.num_pending,
            locked.inner.flush_queue.len(),
            locked.inner.blocked_flushes.len(),
            locked.inner.flushing_writers.len(),
            locked.inner.full_flush
        )
    }
}

/// The `DocumentsWriterFlushControl` while its lock is held. This is the
/// view `FlushPolicy` implementations get, anything done through it is
/// atomic with regards to other indexing threads.
pub struct LockedFlushControl<'a, C: DocConsumer> {
    control: &'a DocumentsWriterFlushControl<C>,
    inner: MutexGuard<'a, FlushControlInner<C>>,
}

impl<'a, C: DocConsumer> LockedFlushControl<'a, C> {
    pub fn active_bytes(&self) -> u64 {
        self.inner.active_bytes
    }

    pub fn flush_bytes(&self) -> u64 {
        self.inner.flush_bytes
    }

    pub fn net_bytes(&self) -> u64 {
        self.inner.active_bytes + self.inner.flush_bytes
    }

    pub fn num_pending(&self) -> usize {
        self.inner.num_pending
    }

    pub fn is_full_flush(&self) -> bool {
        self.inner.full_flush
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.control.config
    }

    pub fn per_thread_pool(&self) -> &DocumentsWriterPerThreadPool<C> {
        &self.control.per_thread_pool
    }

    pub fn num_global_term_deletes(&self) -> usize {
        self.inner.delete_queue.num_global_term_deletes()
    }

    pub fn delete_bytes_used(&self) -> u64 {
        self.inner.delete_queue.ram_bytes_used()
    }

    pub fn set_apply_all_deletes(&self) {
        self.control.set_apply_all_deletes();
    }

    /// Moves the bytes of the given state from the active to the flush
    /// bytes and marks it pending. States without documents are left
    /// alone. Must be called at most once per state between checkouts.
    pub fn set_flush_pending(&mut self, per_thread: &mut ThreadState<C>) {
        debug_assert!(
            !per_thread.flush_pending(),
            "set_flush_pending on an already pending state"
        );
        if per_thread.flush_pending() {
            return;
        }
        if per_thread.num_docs_in_ram() > 0 {
            per_thread.flush_pending = true;
            let bytes = per_thread.bytes_used;
            self.inner.flush_bytes += bytes;
            debug_assert!(self.inner.active_bytes >= bytes);
            self.inner.active_bytes = self.inner.active_bytes.saturating_sub(bytes);
            self.inner.num_pending += 1;
        }
        // don't assert on num_docs since we could hit an abort while
        // selecting that dwpt for flushing
    }

    fn process_after_document(
        &mut self,
        per_thread: &mut ThreadState<C>,
        is_update: bool,
    ) -> Option<DocumentsWriterPerThread<C>> {
        self.commit_per_thread_bytes(per_thread);
        if !per_thread.flush_pending() {
            let control = self.control;
            if is_update {
                control.flush_policy.on_update(self, per_thread);
            } else {
                control.flush_policy.on_insert(self, per_thread);
            }
            if !per_thread.flush_pending() && per_thread.bytes_used > control.hard_max_bytes_per_dwpt
            {
                // Safety check to prevent a single DWPT exceeding its RAM
                // limit, whatever the policy decided
                debug!(
                    "DWFC: force flush pending for {} bytes above hard limit {}",
                    per_thread.bytes_used, control.hard_max_bytes_per_dwpt
                );
                self.set_flush_pending(per_thread);
            }
        }
        if self.inner.full_flush {
            if per_thread.flush_pending() {
                self.checkout_and_block(per_thread);
                self.inner.flush_queue.pop_front()
            } else {
                None
            }
        } else {
            self.try_checkout_for_flush(per_thread)
        }
    }

    fn commit_per_thread_bytes(&mut self, per_thread: &mut ThreadState<C>) {
        let new_bytes = per_thread.dwpt.as_ref().map_or(0, |d| d.bytes_used());
        let old_bytes = per_thread.bytes_used;
        per_thread.bytes_used = new_bytes;

        // We need to differentiate here if we are pending since
        // set_flush_pending moves the per_thread memory to the flush_bytes
        // and we could be set to pending during a delete
        let counter = if per_thread.flush_pending() {
            &mut self.inner.flush_bytes
        } else {
            &mut self.inner.active_bytes
        };
        debug_assert!(*counter >= old_bytes);
        *counter = counter.saturating_sub(old_bytes) + new_bytes;
    }

    /// Subtracts the last known bytes of the state from the counter holding
    /// them and takes its writer out.
    fn discard_state(&mut self, state: &mut ThreadState<C>) -> Option<DocumentsWriterPerThread<C>> {
        let bytes = state.bytes_used;
        if state.flush_pending() {
            debug_assert!(self.inner.flush_bytes >= bytes);
            self.inner.flush_bytes = self.inner.flush_bytes.saturating_sub(bytes);
            debug_assert!(self.inner.num_pending > 0);
            self.inner.num_pending = self.inner.num_pending.saturating_sub(1);
        } else {
            debug_assert!(self.inner.active_bytes >= bytes);
            self.inner.active_bytes = self.inner.active_bytes.saturating_sub(bytes);
        }
        // Take it out of the loop this DWPT is stale
        let closed = self.inner.closed;
        self.control.per_thread_pool.reset(state, closed)
    }

    fn try_checkout_for_flush(
        &mut self,
        per_thread: &mut ThreadState<C>,
    ) -> Option<DocumentsWriterPerThread<C>> {
        if per_thread.flush_pending() {
            self.internal_try_checkout_for_flush(per_thread)
        } else {
            None
        }
    }

    fn checkout_and_block(&mut self, per_thread: &mut ThreadState<C>) {
        debug_assert!(per_thread.flush_pending(), "can not block non-pending threadstate");
        debug_assert!(self.inner.full_flush, "can not block if fullFlush == false");
        let bytes = per_thread.bytes_used;
        let closed = self.inner.closed;
        if let Some(dwpt) = self.control.per_thread_pool.reset(per_thread, closed) {
            self.inner.num_pending -= 1;
            debug!(
                "DWFC: block flush of {} until the full flush is done",
                dwpt.segment_name
            );
            self.inner
                .blocked_flushes
                .push(BlockedFlush::new(dwpt, bytes));
        }
    }

    fn internal_try_checkout_for_flush(
        &mut self,
        per_thread: &mut ThreadState<C>,
    ) -> Option<DocumentsWriterPerThread<C>> {
        debug_assert!(per_thread.flush_pending());
        // We are pending so all memory is already moved to flush_bytes
        let bytes = per_thread.bytes_used;
        let closed = self.inner.closed;
        let res = self
            .control
            .per_thread_pool
            .reset(per_thread, closed)
            .map(|dwpt| {
                debug_assert!(!self.inner.flushing_writers.contains_key(&dwpt.segment_name));
                self.inner
                    .flushing_writers
                    .insert(dwpt.segment_name.clone(), bytes);
                self.inner.num_pending -= 1;
                dwpt
            });
        self.update_stall_state();
        res
    }

    /// Prunes the blocked queue by moving all DWPT that are associated
    /// with the given generation to the flush queue.
    fn prune_blocked_queue(&mut self, flushing_generation: u64) {
        let blocked = mem::replace(&mut self.inner.blocked_flushes, vec![]);
        let (pruned, kept): (Vec<_>, Vec<_>) = blocked
            .into_iter()
            .partition(|bf| bf.dwpt.generation() == flushing_generation);
        self.inner.blocked_flushes = kept;
        for blocked_flush in pruned {
            debug_assert!(!self
                .inner
                .flushing_writers
                .contains_key(&blocked_flush.dwpt.segment_name));
            // Record the flushing DWPT to reduce flush_bytes in do_after_flush
            self.inner
                .flushing_writers
                .insert(blocked_flush.dwpt.segment_name.clone(), blocked_flush.bytes);
            // don't decr pending here - it's already done when DWPT is blocked
            self.inner.flush_queue.push_back(blocked_flush.dwpt);
        }
    }

    fn do_after_flush(&mut self, dwpt: DocumentsWriterPerThread<C>) {
        debug_assert!(self.inner.flushing_writers.contains_key(&dwpt.segment_name));
        if let Some(bytes) = self.inner.flushing_writers.remove(&dwpt.segment_name) {
            debug_assert!(self.inner.flush_bytes >= bytes);
            self.inner.flush_bytes = self.inner.flush_bytes.saturating_sub(bytes);
        }
        self.control.per_thread_pool.recycle(dwpt);
        self.update_stall_state();
        self.control.cond.notify_all();
    }

    fn abort_pending_flushes(&mut self, new_files: &mut HashSet<String>) -> u32 {
        let mut aborted_docs = 0;
        let flush_queue = mem::replace(&mut self.inner.flush_queue, VecDeque::new());
        for mut dwpt in flush_queue {
            aborted_docs += dwpt.num_docs_in_ram;
            if let Err(e) = dwpt.abort(new_files) {
                // ignore - keep on aborting the flush queue
                warn!("DWFC: abort of queued {} failed: {:?}", dwpt.segment_name, e);
            }
            self.do_after_flush(dwpt);
        }

        let blocked_flushes = mem::replace(&mut self.inner.blocked_flushes, vec![]);
        for mut blocked_flush in blocked_flushes {
            self.inner
                .flushing_writers
                .insert(blocked_flush.dwpt.segment_name.clone(), blocked_flush.bytes);
            aborted_docs += blocked_flush.dwpt.num_docs_in_ram;
            if let Err(e) = blocked_flush.dwpt.abort(new_files) {
                // ignore - keep on aborting the blocked queue
                warn!(
                    "DWFC: abort of blocked {} failed: {:?}",
                    blocked_flush.dwpt.segment_name, e
                );
            }
            self.do_after_flush(blocked_flush.dwpt);
        }
        self.update_stall_state();
        aborted_docs
    }

    fn stall_limit_bytes(&self) -> u64 {
        if self.control.config.flush_on_ram() {
            self.control.config.ram_buffer_size().saturating_mul(2)
        } else {
            i64::max_value() as u64
        }
    }

    fn update_stall_state(&mut self) -> bool {
        let limit = self.stall_limit_bytes();
        // we block indexing threads if net byte grows due to slow flushes
        // yet, for small ram buffers and large documents we can easily
        // reach the limit without any ongoing flushes. we need to ensure
        // that we don't stall/block if an ongoing or pending flush can
        // not free up enough memory to release the stall lock.
        let stall = self.net_bytes() > limit
            && self.inner.active_bytes < limit
            && !self.inner.closed;
        self.control.stall_control.update_stalled(stall);
        stall
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::writer::doc_consumer::mock::*;
    use crate::core::index::writer::{FlushByCountsPolicy, FlushByRamOrCountsPolicy};

    use std::sync::atomic::Ordering;

    const MB: u64 = 1024 * 1024;

    struct NeverFlushPolicy;

    impl<C: DocConsumer> FlushPolicy<C> for NeverFlushPolicy {
        fn on_delete(&self, _control: &mut LockedFlushControl<C>, _state: Option<&mut ThreadState<C>>) {}

        fn on_insert(&self, _control: &mut LockedFlushControl<C>, _state: &mut ThreadState<C>) {}
    }

    type Control = DocumentsWriterFlushControl<MockDocConsumer>;

    fn new_control(config: IndexWriterConfig, policy: &str) -> Control {
        let config = Arc::new(config);
        let pool = Arc::new(DocumentsWriterPerThreadPool::new(config.max_thread_states));
        let policy: Arc<dyn FlushPolicy<MockDocConsumer>> = match policy {
            "ram" => Arc::new(FlushByRamOrCountsPolicy::new(Arc::clone(&config))),
            "counts" => Arc::new(FlushByCountsPolicy::new(Arc::clone(&config))),
            _ => Arc::new(NeverFlushPolicy),
        };
        DocumentsWriterFlushControl::new(config, policy, pool)
    }

    fn ensure_dwpt(
        control: &Control,
        state: &mut ThreadState<MockDocConsumer>,
        settings: &Arc<MockSettings>,
        name: &str,
    ) {
        if !state.inited() {
            state.dwpt = Some(DocumentsWriterPerThread::new(
                name.into(),
                MockDocConsumer::new(name, Arc::clone(settings)),
                control.delete_queue(),
            ));
        }
    }

    fn add_doc(
        control: &Control,
        handle: &ThreadStateHandle<MockDocConsumer>,
        settings: &Arc<MockSettings>,
        name: &str,
        bytes: u64,
    ) -> Option<DocumentsWriterPerThread<MockDocConsumer>> {
        let mut state = handle.state.lock().unwrap();
        ensure_dwpt(control, &mut state, settings, name);
        state
            .dwpt
            .as_mut()
            .unwrap()
            .update_document(&MockDoc::new(bytes), None)
            .unwrap();
        control.do_after_document(&mut state, false)
    }

    #[test]
    fn test_hard_limit_forces_pending() {
        let mut config = IndexWriterConfig::default();
        config
            .set_ram_buffer_size_mb(-1.0)
            .unwrap()
            .set_per_thread_hard_limit_mb(1)
            .unwrap();
        let control = new_control(config, "never");
        let settings = Arc::new(MockSettings::default());
        let handle = control.per_thread_pool().get_and_lock().unwrap();

        assert!(add_doc(&control, &handle, &settings, "_0", MB / 2).is_none());
        assert_eq!(control.active_bytes(), MB / 2);

        // 1.5 MB buffered, the policy declines but the hard limit does not
        let dwpt = add_doc(&control, &handle, &settings, "_0", MB).unwrap();
        assert_eq!(dwpt.num_docs_in_ram, 2);
        assert_eq!(control.active_bytes(), 0);
        assert_eq!(control.flush_bytes(), MB + MB / 2);
        assert_eq!(control.num_pending(), 0);
        assert_eq!(control.num_flushing_dwpt(), 1);

        control.do_after_flush(dwpt);
        assert_eq!(control.net_bytes(), 0);
        assert_eq!(control.num_flushing_dwpt(), 0);
    }

    #[test]
    fn test_no_auto_flush() {
        let mut config = IndexWriterConfig::default();
        config.set_ram_buffer_size_mb(-1.0).unwrap();
        let control = new_control(config, "ram");
        let settings = Arc::new(MockSettings::default());
        let handle = control.per_thread_pool().get_and_lock().unwrap();

        for _ in 0..1000 {
            assert!(add_doc(&control, &handle, &settings, "_0", 10 * 1024).is_none());
            assert!(!control.any_stalled_threads());
        }
        assert_eq!(control.active_bytes(), 1000 * 10 * 1024);
        assert_eq!(control.num_pending(), 0);
        assert!(control.next_pending_flush().is_none());
        assert!(!control.stall_control().was_stalled());
    }

    #[test]
    fn test_stall_until_flush_completes() {
        let mut config = IndexWriterConfig::default();
        config.set_ram_buffer_size_mb(1.0).unwrap();
        let control = new_control(config, "ram");
        let settings = Arc::new(MockSettings::default());
        let pool = control.per_thread_pool();
        let h0 = pool.get_and_lock().unwrap();
        let h1 = pool.get_and_lock().unwrap();

        let flushing = add_doc(&control, &h0, &settings, "_0", MB + MB / 2).unwrap();
        assert!(!control.any_stalled_threads());
        assert_eq!(control.flush_bytes(), MB + MB / 2);

        // net 2.4 MB is above twice the buffer while active bytes are below it
        assert!(add_doc(&control, &h1, &settings, "_1", 900 * 1024).is_none());
        assert!(control.net_bytes() > 2 * MB);
        assert!(control.any_stalled_threads());
        assert!(control.stall_control().was_stalled());

        control.do_after_flush(flushing);
        assert!(!control.any_stalled_threads());
        assert_eq!(control.net_bytes(), 900 * 1024);
    }

    #[test]
    fn test_no_stall_when_flushing_cannot_help() {
        let mut config = IndexWriterConfig::default();
        config.set_ram_buffer_size_mb(1.0).unwrap();
        let control = new_control(config, "never");
        let settings = Arc::new(MockSettings::default());
        let handle = control.per_thread_pool().get_and_lock().unwrap();

        // a single oversized writer: above the limit, but all of it active
        assert!(add_doc(&control, &handle, &settings, "_0", 3 * MB).is_none());
        assert!(control.net_bytes() > 2 * MB);
        assert!(!control.any_stalled_threads());

        control.set_flush_pending(&mut handle.state.lock().unwrap());
        // all bytes pending, nothing active: stalled until the flush is done
        assert!(control.any_stalled_threads());
        control.set_closed();
        assert!(!control.any_stalled_threads());
    }

    #[test]
    fn test_huge_ram_buffer_saturates_stall_limit() {
        let mut config = IndexWriterConfig::default();
        config.set_ram_buffer_size_mb(1e13).unwrap();
        let control = new_control(config, "ram");
        let settings = Arc::new(MockSettings::default());
        let handle = control.per_thread_pool().get_and_lock().unwrap();

        assert_eq!(control.lock().stall_limit_bytes(), u64::max_value());
        assert!(add_doc(&control, &handle, &settings, "_0", 10).is_none());
        assert_eq!(control.active_bytes(), 10);
        assert!(!control.any_stalled_threads());
    }

    #[test]
    fn test_full_flush_flushes_every_writer_once() {
        let control = new_control(IndexWriterConfig::default(), "never");
        let settings = Arc::new(MockSettings::default());
        let pool = control.per_thread_pool();
        let h0 = pool.get_and_lock().unwrap();
        let h1 = pool.get_and_lock().unwrap();
        let h2 = pool.get_and_lock().unwrap();

        add_doc(&control, &h0, &settings, "_0", 1000);
        add_doc(&control, &h0, &settings, "_0", 1000);
        add_doc(&control, &h1, &settings, "_1", 3000);
        // an initialized writer without documents
        ensure_dwpt(&control, &mut h2.state.lock().unwrap(), &settings, "_2");
        let old_generation = control.delete_queue().generation;

        let (seq_no, flushing_queue) = control.mark_for_full_flush().unwrap();
        assert_eq!(flushing_queue.generation, old_generation);
        assert_eq!(control.delete_queue().generation, old_generation + 1);
        assert!(control.delete_queue().last_sequence_number() >= seq_no);
        assert!(control.is_full_flush());
        assert_eq!(control.num_queued_flushes(), 2);
        assert_eq!(control.num_flushing_dwpt(), 2);
        assert_eq!(control.flush_bytes(), 5000);
        assert_eq!(control.active_bytes(), 0);
        // the empty writer is discarded without flushing
        assert!(!h2.state.lock().unwrap().inited());
        assert!(!h0.state.lock().unwrap().inited());

        let mut flushed = vec![];
        while let Some(dwpt) = control.next_pending_flush() {
            flushed.push(dwpt.segment_name.clone());
            control.do_after_flush(dwpt);
        }
        flushed.sort();
        assert_eq!(flushed, vec!["_0".to_string(), "_1".to_string()]);
        control.wait_for_flush().unwrap();

        control.finish_full_flush();
        assert!(!control.is_full_flush());
        assert_eq!(control.net_bytes(), 0);
        assert_eq!(control.num_pending(), 0);
    }

    #[test]
    fn test_blocked_flush_during_full_flush() {
        let mut config = IndexWriterConfig::default();
        config.set_max_buffered_docs(2).unwrap();
        let control = new_control(config, "counts");
        let settings = Arc::new(MockSettings::default());
        let pool = control.per_thread_pool();
        let h0 = pool.get_and_lock().unwrap();
        let h1 = pool.get_and_lock().unwrap();

        assert!(add_doc(&control, &h0, &settings, "_0", 100).is_none());
        control.mark_for_full_flush().unwrap();
        assert_eq!(control.num_queued_flushes(), 1);

        // a writer of the new generation turns pending while the full flush
        // runs: it is blocked and the caller helps with the queued flush
        assert!(add_doc(&control, &h1, &settings, "_1", 200).is_none());
        let queued = add_doc(&control, &h1, &settings, "_1", 200).unwrap();
        assert_eq!(queued.segment_name, "_0");
        assert_eq!(control.num_blocked_flushes(), 1);
        assert_eq!(control.num_queued_flushes(), 0);
        assert_eq!(control.num_pending(), 0);
        assert_eq!(control.flush_bytes(), 500);
        assert!(control.next_pending_flush().is_none());

        control.do_after_flush(queued);
        control.finish_full_flush();
        assert_eq!(control.num_blocked_flushes(), 0);
        assert_eq!(control.num_queued_flushes(), 1);

        let blocked = control.next_pending_flush().unwrap();
        assert_eq!(blocked.segment_name, "_1");
        assert_eq!(blocked.num_docs_in_ram, 2);
        control.do_after_flush(blocked);
        assert_eq!(control.net_bytes(), 0);
    }

    #[test]
    fn test_abort_pending_flushes_with_failing_aborts() {
        let control = new_control(IndexWriterConfig::default(), "never");
        let settings = Arc::new(MockSettings::default());
        settings.fail_on_abort.store(true, Ordering::Release);
        let pool = control.per_thread_pool();
        let handles: Vec<_> = (0..7).map(|_| pool.get_and_lock().unwrap()).collect();

        for h in &handles[..5] {
            add_doc(&control, h, &settings, &format!("_{}", h.index), 1000);
        }
        control.mark_for_full_flush().unwrap();
        assert_eq!(control.num_queued_flushes(), 5);

        // two writers of the new generation get blocked, each handing one
        // queued flush to its thread
        let mut helping = vec![];
        for h in &handles[5..] {
            let name = format!("_{}", h.index);
            assert!(add_doc(&control, h, &settings, &name, 2000).is_none());
            let mut state = h.state.lock().unwrap();
            control.set_flush_pending(&mut state);
            helping.push(control.do_after_document(&mut state, false).unwrap());
        }
        assert_eq!(control.num_queued_flushes(), 3);
        assert_eq!(control.num_blocked_flushes(), 2);
        assert_eq!(control.flush_bytes(), 9000);
        for dwpt in helping {
            control.do_after_flush(dwpt);
        }
        assert_eq!(control.flush_bytes(), 7000);

        let mut files = HashSet::new();
        assert_eq!(control.abort_full_flushes(&mut files), 5);
        assert_eq!(settings.aborted_segments.load(Ordering::Acquire), 5);
        assert_eq!(files.len(), 5);
        assert_eq!(control.num_queued_flushes(), 0);
        assert_eq!(control.num_blocked_flushes(), 0);
        assert!(!control.is_full_flush());
        assert_eq!(control.flush_bytes(), 0);
        assert_eq!(control.num_flushing_dwpt(), 0);
        assert!(!control.any_stalled_threads());
    }

    #[test]
    fn test_abort_pending_flushes_after_full_flush() {
        let control = new_control(IndexWriterConfig::default(), "never");
        let settings = Arc::new(MockSettings::default());
        let pool = control.per_thread_pool();
        let h0 = pool.get_and_lock().unwrap();
        let h1 = pool.get_and_lock().unwrap();

        add_doc(&control, &h0, &settings, "_0", 100);
        control.mark_for_full_flush().unwrap();
        assert!(add_doc(&control, &h1, &settings, "_1", 200).is_none());
        assert!(add_doc(&control, &h1, &settings, "_1", 300).is_none());
        let queued = {
            let mut state = h1.state.lock().unwrap();
            control.set_flush_pending(&mut state);
            control.do_after_document(&mut state, false).unwrap()
        };
        assert_eq!(queued.segment_name, "_0");
        control.do_after_flush(queued);
        control.finish_full_flush();

        // the blocked writer now waits in the ready queue of a regular flush
        assert!(!control.is_full_flush());
        assert_eq!(control.num_queued_flushes(), 1);
        assert_eq!(control.num_blocked_flushes(), 0);
        assert_eq!(control.flush_bytes(), 500);

        let mut files = HashSet::new();
        assert_eq!(control.abort_pending_flushes(&mut files), 2);
        assert!(files.contains("_1.tmp"));
        assert_eq!(settings.aborted_segments.load(Ordering::Acquire), 1);
        assert_eq!(control.num_queued_flushes(), 0);
        assert_eq!(control.flush_bytes(), 0);
        assert_eq!(control.num_flushing_dwpt(), 0);
        assert!(!control.is_full_flush());
        assert!(control.next_pending_flush().is_none());
        control.wait_for_flush().unwrap();
    }

    #[test]
    fn test_do_on_abort() {
        let control = new_control(IndexWriterConfig::default(), "never");
        let settings = Arc::new(MockSettings::default());
        let pool = control.per_thread_pool();
        let h0 = pool.get_and_lock().unwrap();
        let h1 = pool.get_and_lock().unwrap();
        add_doc(&control, &h0, &settings, "_0", 1000);
        add_doc(&control, &h1, &settings, "_1", 3000);
        control.set_flush_pending(&mut h1.state.lock().unwrap());
        assert_eq!(control.num_pending(), 1);

        let stale = control.do_on_abort(&mut h1.state.lock().unwrap()).unwrap();
        assert_eq!(stale.segment_name, "_1");
        assert_eq!(control.num_pending(), 0);
        assert_eq!(control.flush_bytes(), 0);

        assert!(control.do_on_abort(&mut h0.state.lock().unwrap()).is_some());
        assert_eq!(control.active_bytes(), 0);
        assert!(control.next_pending_flush().is_none());
    }

    #[test]
    fn test_obtain_and_lock_enrolls_stale_writer() {
        let control = new_control(IndexWriterConfig::default(), "never");
        let settings = Arc::new(MockSettings::default());
        let handle = control.obtain_and_lock().unwrap();
        add_doc(&control, &handle, &settings, "_0", 1000);
        control.per_thread_pool().release(handle);

        // simulate a full flush whose scan has not reached the state yet
        control.lock().inner.full_flush = true;
        let new_queue = Arc::new(DocumentsWriterDeleteQueue::with_generation(1, 100));
        control.lock().inner.delete_queue = new_queue;

        let handle = control.obtain_and_lock().unwrap();
        assert!(!handle.state.lock().unwrap().inited());
        assert_eq!(control.lock().inner.full_flush_buffer.len(), 1);
        assert_eq!(control.flush_bytes(), 1000);
        assert_eq!(control.active_bytes(), 0);
        control.per_thread_pool().release(handle);
    }

    #[test]
    fn test_display() {
        let control = new_control(IndexWriterConfig::default(), "never");
        let text = format!("{}", control);
        assert!(text.contains("active_bytes=0"));
        assert!(text.contains("full_flush=false"));
    }
}
