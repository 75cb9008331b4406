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

use crate::core::index::writer::{DocConsumer, IndexWriterConfig, LockedFlushControl, ThreadState};

use std::sync::{Arc, MutexGuard};

/// `FlushPolicy` controls when segments are flushed from a RAM resident
/// internal data-structure to stable storage.
///
/// Segments are traditionally flushed by:
/// - RAM consumption - configured via `IndexWriterConfig#set_ram_buffer_size_mb`
/// - Number of RAM resident documents - configured via
///   `IndexWriterConfig#set_max_buffered_docs`
///
/// The policy also applies pending delete operations given the threshold set
/// in `IndexWriterConfig#set_max_buffered_delete_terms`.
///
/// The `DocumentsWriterFlushControl` consults the policy for each added or
/// updated document as well as for each delete term. Based on the
/// information provided via `ThreadState` and the locked flush control, the
/// policy decides if a `DocumentsWriterPerThread` needs flushing and marks
/// it as flush-pending via `LockedFlushControl#set_flush_pending`, or if
/// deletes need to be applied. A policy never flushes by itself.
///
/// Every hook is called while the flush control is locked and the calling
/// thread holds the lock on the given `ThreadState`. Other states must only
/// be inspected through `try_lock`.
pub trait FlushPolicy<C: DocConsumer>: Send + Sync {
    /// Called for each delete term. If this is a delete triggered due to an
    /// update the given `ThreadState` is `Some`.
    fn on_delete(&self, control: &mut LockedFlushControl<C>, state: Option<&mut ThreadState<C>>);

    /// Called for each document update on the given `ThreadState`'s
    /// `DocumentsWriterPerThread`.
    fn on_update(&self, control: &mut LockedFlushControl<C>, state: &mut ThreadState<C>) {
        self.on_insert(control, state);
        self.on_delete(control, Some(state));
    }

    /// Called for each document addition on the given `ThreadState`s
    /// `DocumentsWriterPerThread`.
    fn on_insert(&self, control: &mut LockedFlushControl<C>, state: &mut ThreadState<C>);
}

/// Default `FlushPolicy` implementation that flushes new segments based on
/// RAM used and document count depending on the `IndexWriterConfig`. It
/// also applies pending deletes based on the number of buffered delete
/// terms.
///
/// - `on_delete` applies pending delete operations based on the global
///   number of buffered delete terms iff `max_buffered_delete_terms` is
///   enabled, or if the deletes alone exceed the RAM buffer
/// - `on_insert` flushes either on the number of documents per
///   `DocumentsWriterPerThread` or on the global active memory consumption
///   in the current indexing session iff `max_buffered_docs` or
///   `ram_buffer_size_mb` is enabled respectively
/// - `on_update` calls `on_insert` and `on_delete` in order
///
/// If `ram_buffer_size_mb` is enabled, the largest ram consuming
/// `DocumentsWriterPerThread` will be marked as pending iff the global
/// active RAM consumption is `>=` the configured max RAM buffer.
pub struct FlushByRamOrCountsPolicy {
    config: Arc<IndexWriterConfig>,
}

impl FlushByRamOrCountsPolicy {
    pub fn new(config: Arc<IndexWriterConfig>) -> Self {
        FlushByRamOrCountsPolicy { config }
    }

    /// Marks the most ram consuming active `DocumentsWriterPerThread` flush
    /// pending
    fn mark_largest_writer_pending<C: DocConsumer>(
        &self,
        control: &mut LockedFlushControl<C>,
        per_thread: &mut ThreadState<C>,
        current_bytes_per_thread: u64,
    ) {
        debug_assert!(!per_thread.flush_pending());
        let states = control.per_thread_pool().thread_states();

        let mut max_ram_so_far = per_thread.bytes_used();
        // the dwpt which needs to be flushed eventually, `None` means the
        // calling thread's own state
        let mut largest: Option<MutexGuard<ThreadState<C>>> = None;
        let mut count = 0;
        for (i, state) in states.iter().enumerate() {
            if i == per_thread.index() {
                continue;
            }
            // a state locked by its owner is busy indexing, skip it
            if let Ok(guard) = state.try_lock() {
                if guard.flush_pending() || guard.num_docs_in_ram() == 0 {
                    continue;
                }
                let next_ram = guard.bytes_used();
                if next_ram > 0 {
                    count += 1;
                }
                if next_ram > max_ram_so_far {
                    max_ram_so_far = next_ram;
                    largest = Some(guard);
                }
            }
        }
        debug!(
            "FP: {} in-use non-flushing threads states, ram={} largest={}",
            count + 1,
            current_bytes_per_thread,
            max_ram_so_far
        );
        match largest {
            Some(mut guard) => control.set_flush_pending(&mut guard),
            None => control.set_flush_pending(per_thread),
        }
    }
}

impl<C: DocConsumer> FlushPolicy<C> for FlushByRamOrCountsPolicy {
    fn on_delete(&self, control: &mut LockedFlushControl<C>, _state: Option<&mut ThreadState<C>>) {
        if self.config.flush_on_delete_terms()
            && control.num_global_term_deletes() >= self.config.max_buffered_delete_terms() as usize
        {
            control.set_apply_all_deletes();
        }
        if self.config.flush_on_ram() && control.delete_bytes_used() > self.config.ram_buffer_size()
        {
            control.set_apply_all_deletes();
            debug!(
                "FP: force apply deletes bytes_used={} vs ram_buffer={}",
                control.delete_bytes_used(),
                self.config.ram_buffer_size()
            );
        }
    }

    fn on_insert(&self, control: &mut LockedFlushControl<C>, state: &mut ThreadState<C>) {
        if self.config.flush_on_doc_count()
            && state.num_docs_in_ram() >= self.config.max_buffered_docs()
        {
            // Flush this state by num docs
            control.set_flush_pending(state);
        } else if self.config.flush_on_ram() {
            let limit = self.config.ram_buffer_size();
            let total_ram = control.active_bytes() + control.delete_bytes_used();
            if total_ram >= limit {
                debug!(
                    "FP: trigger flush: active_bytes={} delete_bytes={} vs limit={}",
                    control.active_bytes(),
                    control.delete_bytes_used(),
                    limit
                );
                let bytes = state.bytes_used();
                self.mark_largest_writer_pending(control, state, bytes);
            }
        }
    }
}

/// A `FlushPolicy` that only looks at counts: a writer is flushed once it
/// buffers `max_buffered_docs` documents, and deletes are applied once
/// `max_buffered_delete_terms` terms are buffered. RAM usage is left to the
/// hard per-writer limit of the flush control.
pub struct FlushByCountsPolicy {
    config: Arc<IndexWriterConfig>,
}

impl FlushByCountsPolicy {
    pub fn new(config: Arc<IndexWriterConfig>) -> Self {
        FlushByCountsPolicy { config }
    }
}

impl<C: DocConsumer> FlushPolicy<C> for FlushByCountsPolicy {
    fn on_delete(&self, control: &mut LockedFlushControl<C>, _state: Option<&mut ThreadState<C>>) {
        if self.config.flush_on_delete_terms() {
            // flush this state by num del terms
            if control.num_global_term_deletes() >= self.config.max_buffered_delete_terms() as usize
            {
                control.set_apply_all_deletes();
            }
        }
    }

    fn on_insert(&self, control: &mut LockedFlushControl<C>, state: &mut ThreadState<C>) {
        if self.config.flush_on_doc_count()
            && state.num_docs_in_ram() >= self.config.max_buffered_docs()
        {
            // Flush this state by num docs
            control.set_flush_pending(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::doc::Term;
    use crate::core::index::writer::doc_consumer::mock::*;
    use crate::core::index::writer::{
        DocumentsWriterFlushControl, DocumentsWriterPerThread, DocumentsWriterPerThreadPool,
        ThreadStateHandle,
    };

    const MB: u64 = 1024 * 1024;

    fn add_doc(
        control: &DocumentsWriterFlushControl<MockDocConsumer>,
        handle: &ThreadStateHandle<MockDocConsumer>,
        settings: &Arc<MockSettings>,
        bytes: u64,
    ) -> Option<DocumentsWriterPerThread<MockDocConsumer>> {
        let mut state = handle.state.lock().unwrap();
        if !state.inited() {
            let name = format!("_{}", handle.index);
            state.dwpt = Some(DocumentsWriterPerThread::new(
                name.clone(),
                MockDocConsumer::new(&name, Arc::clone(settings)),
                control.delete_queue(),
            ));
        }
        state
            .dwpt
            .as_mut()
            .unwrap()
            .update_document(&MockDoc::new(bytes), None)
            .unwrap();
        control.do_after_document(&mut state, false)
    }

    fn new_control(
        config: IndexWriterConfig,
        by_ram: bool,
    ) -> DocumentsWriterFlushControl<MockDocConsumer> {
        let config = Arc::new(config);
        let pool = Arc::new(DocumentsWriterPerThreadPool::new(config.max_thread_states));
        let policy: Arc<dyn FlushPolicy<MockDocConsumer>> = if by_ram {
            Arc::new(FlushByRamOrCountsPolicy::new(Arc::clone(&config)))
        } else {
            Arc::new(FlushByCountsPolicy::new(Arc::clone(&config)))
        };
        DocumentsWriterFlushControl::new(config, policy, pool)
    }

    #[test]
    fn test_flush_largest_writer_by_ram() {
        let mut config = IndexWriterConfig::default();
        config.set_ram_buffer_size_mb(1.0).unwrap();
        let control = new_control(config, true);
        let settings = Arc::new(MockSettings::default());

        let pool = control.per_thread_pool();
        let h0 = pool.get_and_lock().unwrap();
        let h1 = pool.get_and_lock().unwrap();
        let h2 = pool.get_and_lock().unwrap();

        assert!(add_doc(&control, &h0, &settings, 300 * 1024).is_none());
        assert!(add_doc(&control, &h1, &settings, 500 * 1024).is_none());
        // crosses the buffer, the largest writer is not the calling one
        assert!(add_doc(&control, &h2, &settings, 250 * 1024).is_none());
        assert_eq!(control.num_pending(), 1);
        assert!(h1.state.lock().unwrap().flush_pending());
        assert_eq!(control.flush_bytes(), 500 * 1024);

        let dwpt = control.next_pending_flush().unwrap();
        assert_eq!(dwpt.segment_name, "_1");
        assert_eq!(control.num_pending(), 0);
        assert_eq!(control.num_flushing_dwpt(), 1);
        control.do_after_flush(dwpt);
        assert_eq!(control.flush_bytes(), 0);
        assert_eq!(control.active_bytes(), 550 * 1024);
    }

    #[test]
    fn test_flush_by_doc_count() {
        let mut config = IndexWriterConfig::default();
        config
            .set_ram_buffer_size_mb(-1.0)
            .unwrap()
            .set_max_buffered_docs(3)
            .unwrap();
        let control = new_control(config, false);
        let settings = Arc::new(MockSettings::default());
        let handle = control.per_thread_pool().get_and_lock().unwrap();

        assert!(add_doc(&control, &handle, &settings, MB).is_none());
        assert!(add_doc(&control, &handle, &settings, MB).is_none());
        let dwpt = add_doc(&control, &handle, &settings, MB).unwrap();
        assert_eq!(dwpt.num_docs_in_ram, 3);
        assert!(!handle.state.lock().unwrap().inited());
        control.do_after_flush(dwpt);
        assert_eq!(control.net_bytes(), 0);
    }

    #[test]
    fn test_apply_deletes_by_term_count() {
        let mut config = IndexWriterConfig::default();
        config.set_max_buffered_delete_terms(2).unwrap();
        let control = new_control(config, false);
        let term = |t: &str| Term::new("id".into(), t.as_bytes().to_vec());

        control.delete_queue().add_delete_terms(vec![term("a")]);
        control.do_on_delete();
        assert!(!control.get_and_reset_apply_all_deletes());

        control.delete_queue().add_delete_terms(vec![term("b")]);
        control.do_on_delete();
        assert!(control.get_and_reset_apply_all_deletes());
        assert!(!control.get_and_reset_apply_all_deletes());
    }
}
