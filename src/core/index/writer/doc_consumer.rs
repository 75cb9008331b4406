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

use crate::core::index::writer::BufferedUpdates;
use crate::core::util::DocId;
use crate::error::Result;

use std::collections::HashSet;

/// The indexing chain behind a `DocumentsWriterPerThread`: it inverts
/// documents into an in-memory segment and persists it on flush.
///
/// How documents are encoded and which files a segment consists of is up
/// to the implementation, the flush machinery only relies on the RAM it
/// reports and on the files it creates.
pub trait DocConsumer: Send + 'static {
    type Doc;

    /// Buffers one document. An `AbortingError` means the in-memory segment
    /// is corrupt and every buffered document of the writer is discarded,
    /// any other error only marks this document deleted.
    fn process_document(&mut self, doc_id: DocId, doc: &Self::Doc) -> Result<()>;

    /// RAM currently held by the buffered documents.
    fn bytes_used(&self) -> u64;

    fn flush(&mut self, state: &mut SegmentWriteState) -> Result<()>;

    fn abort(&mut self) -> Result<()>;

    /// Files written so far that belong to a not yet flushed segment. They
    /// must be deleted if the segment is aborted.
    fn created_files(&self) -> Vec<String> {
        vec![]
    }
}

/// Creates the consumer for a new segment, given the segment name.
pub type ConsumerFactory<C> = Box<dyn Fn(&str) -> Result<C> + Send + Sync>;

/// Holder for the state a consumer needs to flush a segment.
pub struct SegmentWriteState<'a> {
    pub segment_name: &'a str,
    pub num_docs: u32,
    /// Deletes to apply while flushing, the consumer may count the docs
    /// they hit into `del_count_on_flush`.
    pub segment_updates: &'a BufferedUpdates,
    pub del_count_on_flush: u32,
    pub files: HashSet<String>,
}

impl<'a> SegmentWriteState<'a> {
    pub fn new(segment_name: &'a str, num_docs: u32, segment_updates: &'a BufferedUpdates) -> Self {
        SegmentWriteState {
            segment_name,
            num_docs,
            segment_updates,
            del_count_on_flush: 0,
            files: HashSet::new(),
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::error::ErrorKind::{AbortingError, RuntimeError};

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A document that only costs RAM.
    pub struct MockDoc {
        pub bytes: u64,
        pub fail: bool,
        pub abort: bool,
    }

    impl MockDoc {
        pub fn new(bytes: u64) -> Self {
            MockDoc {
                bytes,
                fail: false,
                abort: false,
            }
        }

        pub fn failing(bytes: u64) -> Self {
            MockDoc {
                bytes,
                fail: true,
                abort: false,
            }
        }

        /// Fails with an error that corrupts the whole in-memory segment.
        pub fn aborting(bytes: u64) -> Self {
            MockDoc {
                bytes,
                fail: true,
                abort: true,
            }
        }
    }

    /// Knobs and counters shared by every consumer of one factory.
    #[derive(Default)]
    pub struct MockSettings {
        pub fail_on_abort: AtomicBool,
        pub fail_on_flush: AtomicBool,
        pub flushed_docs: AtomicUsize,
        pub flushed_segments: AtomicUsize,
        pub aborted_segments: AtomicUsize,
    }

    pub struct MockDocConsumer {
        segment_name: String,
        bytes_used: u64,
        num_docs: u32,
        settings: Arc<MockSettings>,
    }

    impl MockDocConsumer {
        pub fn new(segment_name: &str, settings: Arc<MockSettings>) -> Self {
            MockDocConsumer {
                segment_name: segment_name.to_string(),
                bytes_used: 0,
                num_docs: 0,
                settings,
            }
        }
    }

    pub fn factory(settings: &Arc<MockSettings>) -> ConsumerFactory<MockDocConsumer> {
        let settings = Arc::clone(settings);
        Box::new(move |name| Ok(MockDocConsumer::new(name, Arc::clone(&settings))))
    }

    impl DocConsumer for MockDocConsumer {
        type Doc = MockDoc;

        fn process_document(&mut self, _doc_id: DocId, doc: &MockDoc) -> Result<()> {
            // a failed doc still consumed some RAM
            self.bytes_used += doc.bytes;
            if doc.abort {
                bail!(AbortingError("mock segment corruption".into()));
            }
            if doc.fail {
                bail!(RuntimeError("mock document failure".into()));
            }
            self.num_docs += 1;
            Ok(())
        }

        fn bytes_used(&self) -> u64 {
            self.bytes_used
        }

        fn flush(&mut self, state: &mut SegmentWriteState) -> Result<()> {
            if self.settings.fail_on_flush.load(Ordering::Acquire) {
                bail!(RuntimeError("mock flush failure".into()));
            }
            state.files.insert(format!("{}.mock", state.segment_name));
            self.settings
                .flushed_docs
                .fetch_add(state.num_docs as usize, Ordering::AcqRel);
            self.settings.flushed_segments.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        fn abort(&mut self) -> Result<()> {
            self.settings.aborted_segments.fetch_add(1, Ordering::AcqRel);
            self.bytes_used = 0;
            if self.settings.fail_on_abort.load(Ordering::Acquire) {
                bail!(RuntimeError("mock abort failure".into()));
            }
            Ok(())
        }

        fn created_files(&self) -> Vec<String> {
            if self.num_docs > 0 {
                vec![format!("{}.tmp", self.segment_name)]
            } else {
                vec![]
            }
        }
    }
}
