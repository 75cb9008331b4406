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
    ConsumerFactory, DocConsumer, DocumentsWriterFlushControl, DocumentsWriterPerThread,
    DocumentsWriterPerThreadPool, FlushByRamOrCountsPolicy, FlushPolicy, FlushedSegment,
    FrozenBufferedUpdates, IndexWriterConfig, ThreadState,
};
use crate::error::{ErrorKind::AlreadyClosed, Result};

use crossbeam::queue::SegQueue;

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex, PoisonError};

///
// This class accepts multiple added documents and hands them to the
// per-thread indexing chains.
//
// Each added document is passed to the `DocConsumer` of a
// `DocumentsWriterPerThread`, which buffers it in RAM.
//
// Once we have used our allowed RAM buffer, or the number
// of added docs is large enough (in the case we are
// flushing by doc count instead of RAM usage), the flush
// control marks a writer pending and the indexing thread
// that finds it flushes it into a segment.
//
// Threads:
//
// Multiple threads are allowed into update_document at once.
// There is an initial synchronized call to obtain_and_lock
// which allocates a ThreadState for this thread.  The same
// thread will get the same ThreadState over time (thread
// affinity) so that if there are consistent patterns (for
// example each thread is indexing a different content
// source) then we make better use of RAM.  Then
// process_document is called on that ThreadState without
// synchronization (most of the "heavy lifting" is in this
// call).  Finally do_after_document accounts the bytes.
//
// When flush is called we mark every writer of the current
// delete queue generation for flushing and flush them all,
// while other threads keep adding documents to writers of
// the next generation.
//
// Errors:
//
// A document that fails in the consumer is marked deleted
// so that the document is always atomically ("all or none")
// added. Only a writer that aborted itself is discarded.
//
pub struct DocumentsWriter<C: DocConsumer> {
    lock: Mutex<()>,
    // serializes full flushes and abort
    full_flush_lock: Mutex<()>,
    closed: AtomicBool,
    num_docs_in_ram: AtomicU32,
    segment_counter: AtomicU64,
    last_seq_no: AtomicU64,
    // we preserve changes during a full flush since the caller might not
    // take the flushed segments before we release all changes.
    pending_changes_in_current_full_flush: AtomicBool,
    per_thread_pool: Arc<DocumentsWriterPerThreadPool<C>>,
    flush_control: DocumentsWriterFlushControl<C>,
    config: Arc<IndexWriterConfig>,
    consumer_factory: ConsumerFactory<C>,
    events: SegQueue<WriterEvent>,
    flushed_segments: SegQueue<FlushedSegment>,
    frozen_updates: SegQueue<FrozenBufferedUpdates>,
}

impl<C: DocConsumer> DocumentsWriter<C> {
    /// Creates a writer flushing by `FlushByRamOrCountsPolicy`.
    pub fn new(config: IndexWriterConfig, consumer_factory: ConsumerFactory<C>) -> Result<Self> {
        let config = Arc::new(config);
        let policy = Arc::new(FlushByRamOrCountsPolicy::new(Arc::clone(&config)));
        Self::with_flush_policy(config, policy, consumer_factory)
    }

    pub fn with_flush_policy(
        config: Arc<IndexWriterConfig>,
        flush_policy: Arc<dyn FlushPolicy<C>>,
        consumer_factory: ConsumerFactory<C>,
    ) -> Result<Self> {
        config.validate()?;
        let per_thread_pool = Arc::new(DocumentsWriterPerThreadPool::new(
            config.max_thread_states,
        ));
        let flush_control = DocumentsWriterFlushControl::new(
            Arc::clone(&config),
            flush_policy,
            Arc::clone(&per_thread_pool),
        );
        Ok(DocumentsWriter {
            lock: Mutex::new(()),
            full_flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            num_docs_in_ram: AtomicU32::new(0),
            segment_counter: AtomicU64::new(0),
            last_seq_no: AtomicU64::new(0),
            pending_changes_in_current_full_flush: AtomicBool::new(false),
            per_thread_pool,
            flush_control,
            config,
            consumer_factory,
            events: SegQueue::new(),
            flushed_segments: SegQueue::new(),
            frozen_updates: SegQueue::new(),
        })
    }

    pub fn flush_control(&self) -> &DocumentsWriterFlushControl<C> {
        &self.flush_control
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.config
    }

    /// Adds a document, deleting all documents matching `del_term` first if
    /// given. Returns the sequence number of the operation and whether
    /// events were queued that the caller should process.
    pub fn update_document(&self, doc: &C::Doc, del_term: Option<Term>) -> Result<(u64, bool)> {
        let is_update = del_term.is_some();
        self.update(is_update, |dwpt| dwpt.update_document(doc, del_term))
    }

    /// Adds a block of documents that is flushed into the same segment with
    /// consecutive doc ids.
    pub fn update_documents(
        &self,
        docs: &[C::Doc],
        del_term: Option<Term>,
    ) -> Result<(u64, bool)> {
        let is_update = del_term.is_some();
        self.update(is_update, |dwpt| dwpt.update_documents(docs, del_term))
    }

    fn update<F>(&self, is_update: bool, op: F) -> Result<(u64, bool)>
    where
        F: FnOnce(&mut DocumentsWriterPerThread<C>) -> Result<u64>,
    {
        let mut has_event = self.pre_update()?;

        let per_thread = self.flush_control.obtain_and_lock()?;
        let res = {
            let mut guard = per_thread
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.do_update(&mut guard, is_update, op)
        };
        self.per_thread_pool.release(per_thread);

        let (seq_no, flushing_dwpt) = res?;
        has_event = self.post_update(flushing_dwpt, has_event)?;
        self.last_seq_no.fetch_max(seq_no, AcqRel);
        Ok((seq_no, has_event))
    }

    fn do_update<F>(
        &self,
        per_thread: &mut ThreadState<C>,
        is_update: bool,
        op: F,
    ) -> Result<(u64, Option<DocumentsWriterPerThread<C>>)>
    where
        F: FnOnce(&mut DocumentsWriterPerThread<C>) -> Result<u64>,
    {
        // This must happen after we've pulled the ThreadState because close
        // deactivates all states that are not in use:
        self.ensure_open()?;
        let dwpt = self.ensure_inited(per_thread)?;
        let dwpt_num_docs = dwpt.num_docs_in_ram;

        let res = op(dwpt);
        let num_docs_in_ram = dwpt.num_docs_in_ram;
        let aborted = dwpt.is_aborted();

        // We don't know whether the document actually
        // counted as being indexed, so we must subtract here to
        // accumulate our separate counter:
        self.num_docs_in_ram
            .fetch_add(num_docs_in_ram - dwpt_num_docs, AcqRel);
        if aborted {
            if let Some(mut dwpt) = self.flush_control.do_on_abort(per_thread) {
                debug!("DW: discard aborted writer {}", dwpt.segment_name);
                self.subtract_flushed_num_docs(dwpt.num_docs_in_ram);
                let files = mem::replace(&mut dwpt.files_to_delete, HashSet::new());
                if !files.is_empty() {
                    self.put_event(WriterEvent::DeleteNewFiles(files));
                }
                self.per_thread_pool.recycle(dwpt);
            }
        }
        let seq_no = res?;

        let flushing_dwpt = self.flush_control.do_after_document(per_thread, is_update);
        debug_assert!(seq_no > per_thread.last_seq_no());
        per_thread.set_last_seq_no(seq_no);
        Ok((seq_no, flushing_dwpt))
    }

    fn pre_update(&self) -> Result<bool> {
        self.ensure_open()?;
        let mut has_events = false;
        if self.flush_control.any_stalled_threads() || self.flush_control.num_queued_flushes() > 0
        {
            // Help out flushing any queued DWPTs so we can un-stall:
            loop {
                // Try pick up pending threads here if possible
                while let Some(flushing_dwpt) = self.flush_control.next_pending_flush() {
                    // Don't push the delete here since the update could fail!
                    has_events |= self.do_flush(flushing_dwpt)?;
                }
                // block if stalled
                self.flush_control.wait_if_stalled()?;
                if self.flush_control.num_queued_flushes() == 0 {
                    break;
                }
            }
        }
        Ok(has_events)
    }

    fn post_update(
        &self,
        flushing_dwpt: Option<DocumentsWriterPerThread<C>>,
        mut has_events: bool,
    ) -> Result<bool> {
        has_events |= self.apply_all_deletes_local()?;
        if let Some(dwpt) = flushing_dwpt {
            has_events |= self.do_flush(dwpt)?;
        } else if let Some(dwpt) = self.flush_control.next_pending_flush() {
            has_events |= self.do_flush(dwpt)?;
        }
        Ok(has_events)
    }

    fn ensure_inited<'s>(
        &self,
        state: &'s mut ThreadState<C>,
    ) -> Result<&'s mut DocumentsWriterPerThread<C>> {
        let dwpt = match state.dwpt.take() {
            Some(dwpt) => dwpt,
            None => {
                let segment_name = self.new_segment_name();
                let consumer = (self.consumer_factory)(&segment_name)?;
                DocumentsWriterPerThread::new(
                    segment_name,
                    consumer,
                    self.flush_control.delete_queue(),
                )
            }
        };
        Ok(state.dwpt.get_or_insert(dwpt))
    }

    fn new_segment_name(&self) -> String {
        segment_name(self.segment_counter.fetch_add(1, AcqRel))
    }

    /// Buffers deletes of all documents matching the given terms.
    pub fn delete_terms(&self, terms: Vec<Term>) -> Result<(u64, bool)> {
        let seq_no = {
            let _l = self.lock.lock()?;
            let seq_no = self.flush_control.delete_queue().add_delete_terms(terms);
            self.flush_control.do_on_delete();
            seq_no
        };
        let applied = self.apply_all_deletes_local()?;
        self.last_seq_no.fetch_max(seq_no, AcqRel);
        Ok((seq_no, applied))
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs_in_ram.load(Acquire)
    }

    pub fn last_seq_no(&self) -> u64 {
        self.last_seq_no.load(Acquire)
    }

    fn apply_all_deletes_local(&self) -> Result<bool> {
        if self.flush_control.get_and_reset_apply_all_deletes() {
            if !self.flush_control.is_full_flush() {
                let frozen = self
                    .flush_control
                    .delete_queue()
                    .freeze_global_buffer(None)?;
                self.put_frozen_updates(frozen);
            }
            self.put_event(WriterEvent::ApplyDeletes);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn put_event(&self, event: WriterEvent) {
        self.events.push(event);
    }

    fn put_frozen_updates(&self, frozen: FrozenBufferedUpdates) {
        if frozen.any() {
            debug!("DW: publish frozen global deletes {}", frozen);
            self.frozen_updates.push(frozen);
        }
    }

    /// Drains the events queued since the last call.
    pub fn take_events(&self) -> Vec<WriterEvent> {
        drain(&self.events)
    }

    /// Drains the segments flushed since the last call.
    pub fn take_flushed_segments(&self) -> Vec<FlushedSegment> {
        drain(&self.flushed_segments)
    }

    /// Drains the global delete packets frozen since the last call. They
    /// apply to every segment flushed before them.
    pub fn take_frozen_updates(&self) -> Vec<FrozenBufferedUpdates> {
        drain(&self.frozen_updates)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Acquire) {
            bail!(AlreadyClosed("this DocumentsWriter is closed".into()));
        }
        Ok(())
    }

    /// Called if we hit an error at a bad time (when updating the index
    /// files) and must discard all currently buffered docs. This resets our
    /// state, discarding any docs added since last flush. Returns how many
    /// documents were aborted.
    pub fn abort(&self) -> Result<u32> {
        let _f = self.full_flush_lock.lock()?;
        let _l = self.lock.lock()?;
        debug!("DW: start to abort");

        let delete_queue = self.flush_control.delete_queue();
        delete_queue.clear()?;
        let mut new_files = HashSet::new();
        let mut aborted_doc_count = 0;
        for i in 0..self.per_thread_pool.active_thread_state_count() {
            let per_thread = self.per_thread_pool.get_thread_state(i);
            let mut guard = per_thread.lock()?;
            aborted_doc_count += self.abort_thread_state(&mut guard, &mut new_files);
        }
        // jump over any possible in flight ops:
        let jump = self.per_thread_pool.active_thread_state_count() + 1;
        delete_queue.skip_sequence_number(jump as u64);

        let aborted_flushes = self.flush_control.abort_pending_flushes(&mut new_files);
        self.subtract_flushed_num_docs(aborted_flushes);
        aborted_doc_count += aborted_flushes;
        self.flush_control.wait_for_flush()?;
        if !new_files.is_empty() {
            self.put_event(WriterEvent::DeleteNewFiles(new_files));
        }
        debug!("DW: done abort, aborted {} docs", aborted_doc_count);
        Ok(aborted_doc_count)
    }

    /// Returns how many documents were aborted.
    fn abort_thread_state(
        &self,
        per_thread: &mut ThreadState<C>,
        new_files: &mut HashSet<String>,
    ) -> u32 {
        match self.flush_control.do_on_abort(per_thread) {
            Some(mut dwpt) => {
                let aborted_doc_count = dwpt.num_docs_in_ram;
                self.subtract_flushed_num_docs(aborted_doc_count);
                if let Err(e) = dwpt.abort(new_files) {
                    warn!("DW: abort of {} failed: {:?}", dwpt.segment_name, e);
                }
                self.per_thread_pool.recycle(dwpt);
                aborted_doc_count
            }
            None => 0,
        }
    }

    fn do_flush(&self, dwpt: DocumentsWriterPerThread<C>) -> Result<bool> {
        let mut has_events = false;
        let mut next = Some(dwpt);
        while let Some(mut dwpt) = next {
            has_events = true;
            let res = self.flush_dwpt(&mut dwpt);
            // the writer is done, whether it flushed or not
            self.flush_control.do_after_flush(dwpt);
            res?;
            next = self.flush_control.next_pending_flush();
        }
        if has_events {
            self.put_event(WriterEvent::MergePending);
        }

        // If deletes alone are consuming > 1/2 our RAM
        // buffer, force them all to apply now. This is to
        // prevent too-frequent flushing of a long tail of
        // tiny segments:
        if self.config.flush_on_ram()
            && self.flush_control.delete_bytes_used() > self.config.ram_buffer_size() / 2
        {
            has_events = true;
            if !self.apply_all_deletes_local()? {
                debug!(
                    "DW: force apply deletes bytes_used={} vs ram_buffer={}",
                    self.flush_control.delete_bytes_used(),
                    self.config.ram_buffer_size()
                );
                self.put_event(WriterEvent::ApplyDeletes);
            }
        }
        Ok(has_events)
    }

    fn flush_dwpt(&self, dwpt: &mut DocumentsWriterPerThread<C>) -> Result<()> {
        // The global deletes frozen here mark the point in time this DWPT
        // was taken out of rotation, they do not apply to its documents.
        let res = match dwpt.prepare_flush() {
            Ok(frozen) => {
                self.put_frozen_updates(frozen);
                dwpt.flush()
            }
            Err(e) => Err(e),
        };

        self.subtract_flushed_num_docs(dwpt.num_docs_in_ram);
        if !dwpt.files_to_delete.is_empty() {
            let files_to_delete = mem::replace(&mut dwpt.files_to_delete, HashSet::new());
            self.put_event(WriterEvent::DeleteNewFiles(files_to_delete));
        }
        match res {
            Ok(Some(segment)) => {
                debug!(
                    "DW: flushed segment {} with {} docs",
                    segment.segment_name, segment.num_docs
                );
                self.flushed_segments.push(segment);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                error!("DW: flush of {} failed: {:?}", dwpt.segment_name, e);
                self.put_event(WriterEvent::FlushFailed(dwpt.segment_name.clone()));
                Err(e)
            }
        }
    }

    pub fn any_changes(&self) -> bool {
        // changes are either in a DWPT or in the delete queue.
        // yet if we currently flush deletes and / or dwpt there
        // could be a window where all changes are in the sinks
        // before they are taken by the caller.
        self.num_docs_in_ram.load(Acquire) > 0
            || self.flush_control.delete_queue().any_changes()
            || !self.flushed_segments.is_empty()
            || !self.frozen_updates.is_empty()
            || self.pending_changes_in_current_full_flush.load(Acquire)
    }

    fn subtract_flushed_num_docs(&self, num_flushed: u32) {
        debug_assert!(self.num_docs_in_ram.load(Acquire) >= num_flushed);
        self.num_docs_in_ram.fetch_sub(num_flushed, AcqRel);
    }

    /// Flushes all writers of the current delete queue generation. This is
    /// a two stage operation, the caller must call `finish_full_flush`
    /// afterwards whatever the outcome. Use `flush` to get both stages
    /// serialized with other full flushes.
    pub fn flush_all_threads(&self) -> Result<(bool, u64)> {
        debug!("DW: start full flush");

        let (seq_no, flushing_queue) = {
            let _l = self.lock.lock()?;
            self.pending_changes_in_current_full_flush
                .store(self.any_changes(), Release);
            self.flush_control.mark_for_full_flush()?
        };

        let mut anything_flushed = false;
        while let Some(flushing_dwpt) = self.flush_control.next_pending_flush() {
            // Help out with flushing:
            anything_flushed |= self.do_flush(flushing_dwpt)?;
        }
        // If a concurrent flush is still in flight wait for it
        self.flush_control.wait_for_flush()?;
        if !anything_flushed && flushing_queue.any_changes() {
            // apply deletes if we did not flush any document
            debug!("DW: flush naked frozen global deletes");
            let frozen = flushing_queue.freeze_global_buffer(None)?;
            self.put_frozen_updates(frozen);
        }
        self.last_seq_no.fetch_max(seq_no, AcqRel);
        Ok((anything_flushed, seq_no))
    }

    pub fn finish_full_flush(&self, success: bool) {
        debug!("DW: finish full flush, success={}", success);
        if success {
            self.flush_control.finish_full_flush();
        } else {
            let mut new_files = HashSet::new();
            let aborted = self.flush_control.abort_full_flushes(&mut new_files);
            self.subtract_flushed_num_docs(aborted);
            if !new_files.is_empty() {
                self.put_event(WriterEvent::DeleteNewFiles(new_files));
            }
        }
        self.pending_changes_in_current_full_flush
            .store(false, Release);
    }

    /// Flushes everything buffered so far into segments. Returns whether any
    /// segment was flushed and the sequence number of the flush.
    pub fn flush(&self) -> Result<(bool, u64)> {
        let _l = self.full_flush_lock.lock()?;
        let res = self.flush_all_threads();
        self.finish_full_flush(res.is_ok());
        res
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }

    /// Rejects all further updates. Buffered documents are neither flushed
    /// nor aborted.
    pub fn close(&self) {
        self.closed.store(true, Release);
        self.flush_control.set_closed();
    }
}

impl<C: DocConsumer> Drop for DocumentsWriter<C> {
    fn drop(&mut self) {
        self.closed.store(true, Release);
        self.flush_control.set_closed();
    }
}

fn drain<T>(queue: &SegQueue<T>) -> Vec<T> {
    let mut res = Vec::with_capacity(queue.len());
    while let Some(item) = queue.pop() {
        res.push(item);
    }
    res
}

/// Segment names are `_` followed by the counter in base 36.
fn segment_name(counter: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = counter;
    let mut digits = vec![];
    loop {
        digits.push(DIGITS[(n % 36) as usize] as char);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    let mut name = String::with_capacity(digits.len() + 1);
    name.push('_');
    name.extend(digits.iter().rev());
    name
}

/// Internal events the caller of a `DocumentsWriter` must process. Events
/// are queued concurrently and no order is guaranteed.
#[derive(Debug, PartialEq)]
pub enum WriterEvent {
    /// Frozen global deletes are ready to be applied.
    ApplyDeletes,
    /// A segment was flushed, merges may be needed.
    MergePending,
    /// The flush of the named segment failed.
    FlushFailed(String),
    /// Files of aborted segments that must be deleted.
    DeleteNewFiles(HashSet<String>),
}
