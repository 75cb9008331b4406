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

use crate::core::doc::Term;
use crate::core::index::writer::{
    BufferedUpdates, DeleteSlice, DocConsumer, DocumentsWriterDeleteQueue,
    FrozenBufferedUpdates, SegmentWriteState,
};
use crate::core::util::DocId;
use crate::error::{ErrorKind::AlreadyClosed, Result};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

pub struct DocumentsWriterPerThread<C: DocConsumer> {
    // current segment we are working on
    pub segment_name: String,
    consumer: C,
    pending_updates: BufferedUpdates,
    // true if we aborted
    aborted: bool,
    pub num_docs_in_ram: u32,
    pub delete_queue: Arc<DocumentsWriterDeleteQueue>,
    delete_slice: DeleteSlice,
    pub files_to_delete: HashSet<String>,
}

impl<C: DocConsumer> DocumentsWriterPerThread<C> {
    pub fn new(
        segment_name: String,
        consumer: C,
        delete_queue: Arc<DocumentsWriterDeleteQueue>,
    ) -> Self {
        let delete_slice = delete_queue.new_slice();
        DocumentsWriterPerThread {
            pending_updates: BufferedUpdates::new(segment_name.clone()),
            segment_name,
            consumer,
            aborted: false,
            num_docs_in_ram: 0,
            delete_queue,
            delete_slice,
            files_to_delete: HashSet::new(),
        }
    }

    /// RAM held by the buffered documents and the segment private deletes.
    pub fn bytes_used(&self) -> u64 {
        self.consumer.bytes_used() + self.pending_updates.bytes_used() as u64
    }

    pub fn generation(&self) -> u64 {
        self.delete_queue.generation
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn num_delete_terms(&self) -> usize {
        self.pending_updates.num_term_deletes
    }

    pub fn update_document(&mut self, doc: &C::Doc, del_term: Option<Term>) -> Result<u64> {
        let doc_id = self.num_docs_in_ram as DocId;
        // Even on error, the document is still added (but marked deleted)
        if let Err(e) = self.consumer.process_document(doc_id, doc) {
            error!("DWPT: process document failed: {:?}", e);
            if e.is_aborting() {
                self.abort_after_error();
                return Err(e);
            }
            self.delete_doc_id(doc_id);
            self.num_docs_in_ram += 1;
            return Err(e);
        }
        Ok(self.finish_document(del_term))
    }

    /// Adds a block of documents atomically, either all of them are live
    /// after the call or all of them are marked deleted.
    pub fn update_documents(&mut self, docs: &[C::Doc], del_term: Option<Term>) -> Result<u64> {
        let mut doc_count = 0;
        let mut all_docs_indexed = false;

        let res = self.do_update_documents(docs, del_term, &mut doc_count, &mut all_docs_indexed);
        if let Err(e) = &res {
            if e.is_aborting() {
                error!("DWPT: process document block failed: {:?}", e);
                self.abort_after_error();
            }
        }
        if !all_docs_indexed && !self.aborted {
            // go and mark all docs from this block as deleted
            let mut doc_id = self.num_docs_in_ram as DocId - 1;
            let end_doc_id = doc_id - doc_count;
            while doc_id > end_doc_id {
                self.delete_doc_id(doc_id);
                doc_id -= 1;
            }
        }
        res
    }

    fn do_update_documents(
        &mut self,
        docs: &[C::Doc],
        del_term: Option<Term>,
        doc_count: &mut DocId,
        all_docs_indexed: &mut bool,
    ) -> Result<u64> {
        for doc in docs {
            let doc_id = self.num_docs_in_ram as DocId;
            *doc_count += 1;
            let res = self.consumer.process_document(doc_id, doc);
            // Incr here because finish_document will not be called
            self.num_docs_in_ram += 1;
            res?;
        }
        *all_docs_indexed = true;

        // Apply del_term only after all indexing has succeeded, but apply it
        // only to docs prior to when this batch started:
        let doc_id_upto = self.num_docs_in_ram as DocId - *doc_count;
        let seq_no = if let Some(del_term) = del_term {
            let seq = self
                .delete_queue
                .add_term_to_slice(del_term, &mut self.delete_slice);
            self.delete_slice
                .apply(&mut self.pending_updates, doc_id_upto);
            seq
        } else {
            let (seq, changed) = self.delete_queue.update_slice(&mut self.delete_slice);
            if changed {
                self.delete_slice
                    .apply(&mut self.pending_updates, doc_id_upto);
            } else {
                self.delete_slice.reset();
            }
            seq
        };
        Ok(seq_no)
    }

    // Buffer a specific docID for deletion. Currently only used when we hit
    // an error when adding a document.
    fn delete_doc_id(&mut self, doc_id_upto: DocId) {
        self.pending_updates.add_doc_id(doc_id_upto);
        // NOTE: we do not trigger flush here. A writer whose every doc fails
        // only grows by its deleted doc ids.
    }

    fn finish_document(&mut self, del_term: Option<Term>) -> u64 {
        // here we actually finish the document in two steps:
        // 1. push the delete into the queue and update our slice
        // 2. increment the DWPT private document id.
        //
        // the updated slice we get from 1. holds all the deletes that have
        // occurred since we updated the slice the last time.
        let mut apply_slice = self.num_docs_in_ram > 0;
        let seq_no = if let Some(del_term) = del_term {
            self.delete_queue
                .add_term_to_slice(del_term, &mut self.delete_slice)
        } else {
            let (seq, apply) = self.delete_queue.update_slice(&mut self.delete_slice);
            apply_slice = apply;
            seq
        };
        if apply_slice {
            self.delete_slice
                .apply(&mut self.pending_updates, self.num_docs_in_ram as DocId);
        } else {
            self.delete_slice.reset();
        }
        self.num_docs_in_ram += 1;
        seq_no
    }

    /// Prepares this DWPT for flushing. This method will freeze and return
    /// the `DocumentsWriterDeleteQueue`s global buffer and apply all pending
    /// deletes to this DWPT.
    pub fn prepare_flush(&mut self) -> Result<FrozenBufferedUpdates> {
        debug_assert!(self.num_docs_in_ram > 0);

        let frozen_updates = self
            .delete_queue
            .freeze_global_buffer(Some(&mut self.delete_slice))?;
        // apply all deletes before we flush and release the delete slice
        self.delete_slice
            .apply(&mut self.pending_updates, self.num_docs_in_ram as DocId);
        debug_assert!(self.delete_slice.is_empty());
        Ok(frozen_updates)
    }

    /// Flush all pending docs to a new segment
    pub fn flush(&mut self) -> Result<Option<FlushedSegment>> {
        debug_assert!(self.num_docs_in_ram > 0);
        debug_assert!(self.delete_slice.is_empty());

        if self.aborted {
            debug!("DWPT: flush: skip because aborting is set.");
            return Ok(None);
        }

        let res = {
            let mut flush_state = SegmentWriteState::new(
                &self.segment_name,
                self.num_docs_in_ram,
                &self.pending_updates,
            );
            // Apply delete-by-docID now, they only happen when an error is hit
            // processing that doc
            flush_state.del_count_on_flush = self.pending_updates.deleted_doc_ids.len() as u32;

            debug!(
                "DWPT: flush postings as segment '{}' num_docs={}",
                flush_state.segment_name, self.num_docs_in_ram
            );
            self.consumer
                .flush(&mut flush_state)
                .map(|()| (flush_state.del_count_on_flush, flush_state.files))
        };

        match res {
            Ok((del_count, files)) => {
                self.pending_updates.deleted_doc_ids.clear();
                let segment_updates = if self.pending_updates.any() {
                    Some(FrozenBufferedUpdates::new(
                        &self.pending_updates,
                        self.generation(),
                        true,
                    ))
                } else {
                    None
                };
                self.pending_updates.clear();
                Ok(Some(FlushedSegment {
                    segment_name: self.segment_name.clone(),
                    generation: self.generation(),
                    num_docs: self.num_docs_in_ram,
                    del_count,
                    files,
                    segment_updates,
                }))
            }
            Err(e) => {
                self.abort_after_error();
                Err(e)
            }
        }
    }

    // Discards the buffered docs after a failure, the created files end up
    // in `files_to_delete`.
    fn abort_after_error(&mut self) {
        let mut files = mem::replace(&mut self.files_to_delete, HashSet::new());
        if let Err(abort_err) = self.abort(&mut files) {
            error!(
                "DWPT: abort after failure of '{}' failed: {:?}",
                self.segment_name, abort_err
            );
        }
        self.files_to_delete = files;
    }

    /// Called if we hit an error at a bad time (when updating the index
    /// files) and must discard all currently buffered docs. The files the
    /// consumer created so far are added to `created_files`, even if the
    /// consumer fails to abort.
    pub fn abort(&mut self, created_files: &mut HashSet<String>) -> Result<()> {
        self.aborted = true;
        debug!("DWPT: now abort '{}'", self.segment_name);

        created_files.extend(self.consumer.created_files());
        let res = self.consumer.abort();
        self.pending_updates.clear();
        debug!("DWPT: done abort");
        res
    }
}

impl<C: DocConsumer> fmt::Debug for DocumentsWriterPerThread<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DocumentsWriterPerThread")
            .field("segment", &self.segment_name)
            .field("num_docs_in_ram", &self.num_docs_in_ram)
            .field("generation", &self.generation())
            .field("aborted", &self.aborted)
            .finish()
    }
}

/// A segment written by a `DocumentsWriterPerThread`, ready to be published.
#[derive(Debug)]
pub struct FlushedSegment {
    pub segment_name: String,
    pub generation: u64,
    pub num_docs: u32,
    pub del_count: u32,
    pub files: HashSet<String>,
    pub segment_updates: Option<FrozenBufferedUpdates>,
}

/// `DocumentsWriterPerThreadPool` controls `ThreadState` instances
/// and their thread assignments during indexing. Each `ThreadState` holds
/// a reference to a `DocumentsWriterPerThread` that is once a
/// `ThreadState` is obtained from the pool exclusively used for indexing a
/// single document by the obtaining thread. Each indexing thread must obtain
/// such a `ThreadState` to make progress. A thread gets the same state it
/// used last time if that one is free.
///
/// Once a `DocumentsWriterPerThread` is selected for flush the thread pool
/// is reusing the flushing `DocumentsWriterPerThread`s ThreadState with a
/// new `DocumentsWriterPerThread` instance.
pub struct DocumentsWriterPerThreadPool<C: DocConsumer> {
    inner: Mutex<PoolInner<C>>,
    cond: Condvar,
    max_thread_states: usize,
}

struct PoolInner<C: DocConsumer> {
    thread_states: Vec<Arc<Mutex<ThreadState<C>>>>,
    // valid thread_state index in `self.thread_states`
    free_list: Vec<usize>,
    affinity: HashMap<ThreadId, usize>,
    closed: bool,
}

impl<C: DocConsumer> DocumentsWriterPerThreadPool<C> {
    pub fn new(max_thread_states: usize) -> Self {
        debug_assert!(max_thread_states > 0);
        let inner = PoolInner {
            thread_states: vec![],
            free_list: Vec::with_capacity(max_thread_states),
            affinity: HashMap::new(),
            closed: false,
        };
        DocumentsWriterPerThreadPool {
            inner: Mutex::new(inner),
            cond: Condvar::new(),
            max_thread_states,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, PoolInner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_thread_states(&self) -> usize {
        self.max_thread_states
    }

    /// Returns the active number of `ThreadState` instances.
    pub fn active_thread_state_count(&self) -> usize {
        self.lock_inner().thread_states.len()
    }

    pub fn get_thread_state(&self, i: usize) -> Arc<Mutex<ThreadState<C>>> {
        let guard = self.lock_inner();
        debug_assert!(i < guard.thread_states.len());
        Arc::clone(&guard.thread_states[i])
    }

    /// Snapshot of all states in ascending index order.
    pub fn thread_states(&self) -> Vec<Arc<Mutex<ThreadState<C>>>> {
        self.lock_inner().thread_states.clone()
    }

    /// Hands a state out to the calling thread exclusively, blocking until
    /// one is released if all `max_thread_states` states are in use.
    pub fn get_and_lock(&self) -> Result<ThreadStateHandle<C>> {
        let thread = thread::current().id();
        let mut guard = self.inner.lock()?;
        loop {
            if guard.closed {
                bail!(AlreadyClosed(
                    "this DocumentsWriterPerThreadPool is closed".into()
                ));
            }
            if let Some(&idx) = guard.affinity.get(&thread) {
                if let Some(pos) = guard.free_list.iter().position(|&i| i == idx) {
                    guard.free_list.swap_remove(pos);
                    return Ok(ThreadStateHandle::new(&guard.thread_states[idx], idx));
                }
            }
            if let Some(idx) = guard.free_list.pop() {
                guard.affinity.insert(thread, idx);
                return Ok(ThreadStateHandle::new(&guard.thread_states[idx], idx));
            }
            if guard.thread_states.len() < self.max_thread_states {
                let idx = guard.thread_states.len();
                guard
                    .thread_states
                    .push(Arc::new(Mutex::new(ThreadState::new(idx))));
                guard.affinity.insert(thread, idx);
                return Ok(ThreadStateHandle::new(&guard.thread_states[idx], idx));
            }
            guard = self.cond.wait(guard)?;
        }
    }

    pub fn release(&self, state: ThreadStateHandle<C>) {
        let mut guard = self.lock_inner();
        debug_assert!(!guard.free_list.contains(&state.index));
        guard.free_list.push(state.index);
        self.cond.notify_one();
    }

    /// Takes the writer out of the state and makes the state reusable, or
    /// inactive if the writer is closing.
    pub fn reset(
        &self,
        thread_state: &mut ThreadState<C>,
        closed: bool,
    ) -> Option<DocumentsWriterPerThread<C>> {
        if closed {
            thread_state.deactivate()
        } else {
            thread_state.reset()
        }
    }

    pub fn recycle(&self, _dwpt: DocumentsWriterPerThread<C>) {
        // do nothing
    }

    /// Closes the pool: threads waiting for a state fail with
    /// `AlreadyClosed` and free states without a writer are deactivated.
    pub fn deactivate_unreleased_states(&self) {
        let mut guard = self.lock_inner();
        guard.closed = true;
        for &idx in &guard.free_list {
            if let Ok(mut state) = guard.thread_states[idx].try_lock() {
                if !state.inited() {
                    state.deactivate();
                }
            }
        }
        self.cond.notify_all();
    }

    pub fn deactivate_thread_state(&self, thread_state: &mut ThreadState<C>) {
        debug_assert!(thread_state.is_active());
        thread_state.deactivate();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_inner().closed
    }
}

/// A `ThreadState` handed out by `DocumentsWriterPerThreadPool::get_and_lock`.
/// The holder is the only indexing thread using the state until it gives
/// the handle back with `release`.
pub struct ThreadStateHandle<C: DocConsumer> {
    pub state: Arc<Mutex<ThreadState<C>>>,
    pub index: usize,
}

impl<C: DocConsumer> ThreadStateHandle<C> {
    fn new(state: &Arc<Mutex<ThreadState<C>>>, index: usize) -> Self {
        ThreadStateHandle {
            state: Arc::clone(state),
            index,
        }
    }
}

/// `ThreadState` references and guards a `DocumentsWriterPerThread`
/// instance that is used during indexing to build a in-memory index
/// segment. `ThreadState` also holds all flush related per-thread
/// data controlled by `DocumentsWriterFlushControl`.
pub struct ThreadState<C: DocConsumer> {
    pub dwpt: Option<DocumentsWriterPerThread<C>>,
    // write access guarded by DocumentsWriterFlushControl
    pub(crate) flush_pending: bool,
    // bytes of the dwpt last accounted by DocumentsWriterFlushControl
    pub(crate) bytes_used: u64,
    // set by DocumentsWriter after each indexing op finishes
    last_seq_no: u64,
    active: bool,
    // index in DocumentsWriterPerThreadPool
    index: usize,
}

impl<C: DocConsumer> ThreadState<C> {
    fn new(index: usize) -> Self {
        ThreadState {
            dwpt: None,
            flush_pending: false,
            bytes_used: 0,
            last_seq_no: 0,
            active: true,
            index,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    pub fn inited(&self) -> bool {
        self.dwpt.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn num_docs_in_ram(&self) -> u32 {
        self.dwpt.as_ref().map_or(0, |d| d.num_docs_in_ram)
    }

    pub fn set_last_seq_no(&mut self, seq_no: u64) {
        self.last_seq_no = seq_no;
    }

    pub fn last_seq_no(&self) -> u64 {
        self.last_seq_no
    }

    fn reset(&mut self) -> Option<DocumentsWriterPerThread<C>> {
        self.bytes_used = 0;
        self.flush_pending = false;
        self.dwpt.take()
    }

    fn deactivate(&mut self) -> Option<DocumentsWriterPerThread<C>> {
        self.active = false;
        self.reset()
    }
}
