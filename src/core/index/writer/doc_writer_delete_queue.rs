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
use crate::core::index::writer::{BufferedUpdates, FrozenBufferedUpdates};
use crate::core::util::{DocId, NO_MORE_DOCS};
use crate::error::Result;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// `DocumentsWriterDeleteQueue` is a linked pending deletes queue. In
/// contrast to other queue implementation we only maintain the tail of the
/// queue. A delete queue is always used in a context of a set of DWPTs and a
/// global delete pool. Each of the DWPT and the global pool need to maintain
/// their 'own' head of the queue (as a `DeleteSlice` instance per
/// `DocumentsWriterPerThread`).
///
/// The difference between the DWPT and the global pool is that the DWPT
/// starts maintaining a head once it has added its first document since for
/// its segments private deletes only the deletes after that document are
/// relevant. The global pool instead starts maintaining the head once this
/// instance is created by taking the sentinel instance as its initial head.
///
/// Since each `DeleteSlice` maintains its own head and the list is only
/// single linked, nodes no slice references any more are dropped as soon as
/// the last slice moves past them.
///
/// When a DWPT updates a document it:
///
/// - consumes a document and finishes its processing
/// - updates its private `DeleteSlice` either by calling `update_slice` or
///   `add_term_to_slice` (if the document has a delete term)
/// - applies all deletes in the slice to its private `BufferedUpdates` and resets it
/// - increments its internal document id
///
/// The DWPT also doesn't apply its current documents delete term until it
/// has updated its delete slice which ensures the consistency of the update.
///
/// A full flush replaces the queue of the `DocumentsWriterFlushControl` with
/// one of the next generation, every DWPT is bound to the generation it was
/// created with.
pub struct DocumentsWriterDeleteQueue {
    // current end(latest delete operation) in the delete queue:
    tail: Mutex<Arc<DeleteListNode>>,
    // Used to record deletes against all prior (already flushed) segments.
    // Whenever any segment flushes, we bundle up this set of deletes and
    // publish them before the newly flushed segment(s).
    global_data: Mutex<GlobalData>,
    pub generation: u64,
    next_seq_no: AtomicU64,
    max_seq_no: AtomicU64,
}

struct GlobalData {
    global_slice: DeleteSlice,
    global_buffered_updates: BufferedUpdates,
}

impl GlobalData {
    fn apply_global_updates(&mut self, doc_upto: DocId) {
        self.global_slice
            .apply(&mut self.global_buffered_updates, doc_upto);
    }
}

impl Default for DocumentsWriterDeleteQueue {
    fn default() -> Self {
        // seq_no must start at 1 because some APIs negate this to also return a boolean
        Self::with_generation(0, 1)
    }
}

impl DocumentsWriterDeleteQueue {
    pub fn with_generation(generation: u64, start_seq_no: u64) -> Self {
        Self::new(
            BufferedUpdates::new("global".into()),
            generation,
            start_seq_no,
        )
    }

    pub fn new(
        global_buffered_updates: BufferedUpdates,
        generation: u64,
        start_seq_no: u64,
    ) -> Self {
        // we use a sentinel instance as our initial tail. No slice will ever try to
        // apply this tail since the head is always omitted
        let tail = Arc::new(DeleteListNode::new(DeleteNode::Sentinel));
        let global_slice = DeleteSlice::new(&tail);
        let global_data = GlobalData {
            global_buffered_updates,
            global_slice,
        };
        DocumentsWriterDeleteQueue {
            tail: Mutex::new(tail),
            global_data: Mutex::new(global_data),
            generation,
            next_seq_no: AtomicU64::new(start_seq_no),
            max_seq_no: AtomicU64::new(i64::max_value() as u64),
        }
    }

    fn lock_tail(&self) -> MutexGuard<'_, Arc<DeleteListNode>> {
        // the tail is only swapped, never left half-updated
        self.tail.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_delete_terms(&self, terms: Vec<Term>) -> u64 {
        let node = Arc::new(DeleteListNode::new(DeleteNode::TermArray(terms)));
        let seq_no = self.add_node(node);
        self.try_apply_global_slice();
        seq_no
    }

    /// invariant for document update
    pub fn add_term_to_slice(&self, term: Term, slice: &mut DeleteSlice) -> u64 {
        let del_node = Arc::new(DeleteListNode::new(DeleteNode::Term(term)));
        let seq_no = self.add_node(Arc::clone(&del_node));
        // this is an update request where the term is the updated documents
        // delete term. The insert must be atomic with regards to the given
        // slice: if two threads update the same document with the same term
        // one of them must win. By taking our node as the new tail another
        // thread adding the same term right after us is applied the next time
        // we update our slice.
        slice.slice_tail = del_node;
        debug_assert!(!same_node(&slice.slice_head, &slice.slice_tail));
        self.try_apply_global_slice();
        seq_no
    }

    fn add_node(&self, node: Arc<DeleteListNode>) -> u64 {
        let mut tail = self.lock_tail();
        tail.set_next(Arc::clone(&node));
        *tail = node;
        self.next_sequence_number()
    }

    pub fn any_changes(&self) -> bool {
        let guard = match self.global_data.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        let tail = self.lock_tail();
        guard.global_buffered_updates.any()
            || !guard.global_slice.is_empty()
            || !same_node(&guard.global_slice.slice_tail, &tail)
    }

    pub fn next_sequence_number(&self) -> u64 {
        let no = self.next_seq_no.fetch_add(1, Ordering::AcqRel);
        debug_assert!(no < self.max_seq_no.load(Ordering::Acquire));
        no
    }

    fn try_apply_global_slice(&self) {
        if let Ok(mut guard) = self.global_data.try_lock() {
            // It is sufficient to apply the deletes that have been added after
            // the current in-flight global slices tail the next time we can get
            // the lock!
            if self.update_slice_without_seq_no(&mut guard.global_slice) {
                guard.apply_global_updates(NO_MORE_DOCS);
            }
        }
    }

    fn update_slice_without_seq_no(&self, slice: &mut DeleteSlice) -> bool {
        let tail = self.lock_tail();
        if !same_node(&slice.slice_tail, &tail) {
            slice.slice_tail = Arc::clone(&tail);
            true
        } else {
            false
        }
    }

    /// Applies every delete in the queue to the global buffer and hands it
    /// out frozen. The caller slice, if any, is moved to the current tail so
    /// its owner applies the same deletes privately.
    pub fn freeze_global_buffer(
        &self,
        caller_slice: Option<&mut DeleteSlice>,
    ) -> Result<FrozenBufferedUpdates> {
        let mut global_guard = self.global_data.lock()?;
        let current_tail = self.lock_tail();

        if let Some(slice) = caller_slice {
            if !same_node(&current_tail, &slice.slice_tail) {
                slice.slice_tail = Arc::clone(&current_tail);
            }
        }

        if !same_node(&global_guard.global_slice.slice_tail, &current_tail) {
            global_guard.global_slice.slice_tail = Arc::clone(&current_tail);
            global_guard.apply_global_updates(NO_MORE_DOCS);
        }
        let packet =
            FrozenBufferedUpdates::new(&global_guard.global_buffered_updates, self.generation, false);
        global_guard.global_buffered_updates.clear();
        Ok(packet)
    }

    pub fn new_slice(&self) -> DeleteSlice {
        DeleteSlice::new(&self.lock_tail())
    }

    /// Moves the slice to the current tail, returns a fresh sequence number
    /// and whether new deletes arrived since the last update.
    pub fn update_slice(&self, slice: &mut DeleteSlice) -> (u64, bool) {
        let tail = self.lock_tail();
        let seq_no = self.next_sequence_number();
        if !same_node(&tail, &slice.slice_tail) {
            // new deletes arrived since we last checked
            slice.slice_tail = Arc::clone(&tail);
            (seq_no, true)
        } else {
            (seq_no, false)
        }
    }

    pub fn num_global_term_deletes(&self) -> usize {
        match self.global_data.try_lock() {
            Ok(guard) => guard.global_buffered_updates.num_term_deletes,
            Err(_) => 0,
        }
    }

    /// RAM held by the global delete buffer, `0` if the buffer is busy being
    /// frozen or applied right now.
    pub fn ram_bytes_used(&self) -> u64 {
        match self.global_data.try_lock() {
            Ok(guard) => guard.global_buffered_updates.bytes_used() as u64,
            Err(_) => 0,
        }
    }

    pub fn clear(&self) -> Result<()> {
        let mut guard = self.global_data.lock()?;
        let current_tail = self.lock_tail();
        guard.global_slice.slice_head = Arc::clone(&current_tail);
        guard.global_slice.slice_tail = Arc::clone(&current_tail);
        guard.global_buffered_updates.clear();
        Ok(())
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.next_seq_no.load(Ordering::Acquire) - 1
    }

    pub fn skip_sequence_number(&self, jump: u64) {
        self.next_seq_no.fetch_add(jump, Ordering::AcqRel);
    }

    pub fn max_seq_no(&self) -> u64 {
        self.max_seq_no.load(Ordering::Acquire)
    }

    /// Caps the sequence numbers this queue may still hand out, the next
    /// generation starts right above it.
    pub fn set_max_seq_no(&self, max_seq_no: u64) {
        self.max_seq_no.store(max_seq_no, Ordering::Release);
    }
}

impl fmt::Display for DocumentsWriterDeleteQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DWDQ: [ generation: {}, next_seq_no: {} ]",
            self.generation,
            self.next_seq_no.load(Ordering::Acquire)
        )
    }
}

enum DeleteNode {
    Term(Term),
    TermArray(Vec<Term>),
    // used for sentinel head
    Sentinel,
}

impl DeleteNode {
    fn apply(&self, buffered_deletes: &mut BufferedUpdates, doc_id_upto: DocId) {
        match self {
            DeleteNode::Term(t) => {
                buffered_deletes.add_term(t.clone(), doc_id_upto);
            }
            DeleteNode::TermArray(terms) => {
                for t in terms {
                    buffered_deletes.add_term(t.clone(), doc_id_upto);
                }
            }
            DeleteNode::Sentinel => {
                unreachable!();
            }
        }
    }
}

struct DeleteListNode {
    data: DeleteNode,
    next: Mutex<Option<Arc<DeleteListNode>>>,
}

impl DeleteListNode {
    fn new(data: DeleteNode) -> Self {
        DeleteListNode {
            data,
            next: Mutex::new(None),
        }
    }

    fn set_next(&self, node: Arc<DeleteListNode>) {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(next.is_none());
        *next = Some(node);
    }

    // `add_node` links the next node before publishing it as tail, so every
    // node before a slice tail has a successor.
    fn get_next(&self) -> Option<Arc<DeleteListNode>> {
        self.next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for DeleteListNode {
    fn drop(&mut self) {
        // unlink iteratively, a long unreferenced chain would otherwise
        // recurse once per node
        let mut next = self
            .next
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => {
                    next = node
                        .next
                        .get_mut()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                }
                Err(_) => break,
            }
        }
    }
}

#[inline]
fn same_node(n1: &Arc<DeleteListNode>, n2: &Arc<DeleteListNode>) -> bool {
    Arc::ptr_eq(n1, n2)
}

pub struct DeleteSlice {
    // slices are thread captive (only accessed by one thread)!
    slice_head: Arc<DeleteListNode>,
    slice_tail: Arc<DeleteListNode>,
}

impl DeleteSlice {
    fn new(tail: &Arc<DeleteListNode>) -> Self {
        DeleteSlice {
            slice_head: Arc::clone(tail),
            slice_tail: Arc::clone(tail),
        }
    }

    pub fn apply(&mut self, buffered_deletes: &mut BufferedUpdates, doc_id_upto: DocId) {
        if same_node(&self.slice_head, &self.slice_tail) {
            // 0 length slice
            return;
        }

        // When we apply a slice we take the head and get its next as our first
        // item to apply and continue until we applied the tail.
        let mut current = Arc::clone(&self.slice_head);
        while let Some(next) = current.get_next() {
            next.data.apply(buffered_deletes, doc_id_upto);
            if same_node(&next, &self.slice_tail) {
                break;
            }
            current = next;
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        // Reset to a 0 length slice
        self.slice_head = Arc::clone(&self.slice_tail);
    }

    pub fn is_empty(&self) -> bool {
        same_node(&self.slice_head, &self.slice_tail)
    }
}
