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
use crate::core::util::DocId;

use std::collections::HashMap;
use std::fmt;
use std::mem;

// Rough logic: del docIDs are List<i32>.  Say list allocates ~2X size (2 * i32),
pub const BYTES_PER_DEL_DOCID: usize = 2 * mem::size_of::<DocId>();

/// Rough logic: hash-map has an array<index> varying load factor (say 2 * usize).
/// Term is object with two Vec(String is actual a Vec), each Vec cost 2 * usize (cap/size) +
/// vec.capasity * byte
pub const BYTES_PER_DEL_TERM: usize = 6 * mem::size_of::<usize>();

/// Holds buffered deletes by docID or term for a single segment. This is
/// used to hold buffered pending deletes against the to-be-flushed segment.
/// Once the deletes are pushed (on flush in `DocumentsWriter`), they are
/// converted to a `FrozenBufferedUpdates` instance.
///
/// NOTE: instances of this struct are accessed either via a private
/// instance on `DocumentsWriterPerThread`, or under the global lock of the
/// `DocumentsWriterDeleteQueue`.
#[derive(Debug, Default)]
pub struct BufferedUpdates {
    pub num_term_deletes: usize,
    pub deleted_terms: HashMap<Term, DocId>,
    pub deleted_doc_ids: Vec<DocId>,
    pub bytes_used: usize,
    pub segment_name: String,
}

impl BufferedUpdates {
    pub fn new(name: String) -> Self {
        BufferedUpdates {
            num_term_deletes: 0,
            deleted_terms: HashMap::new(),
            deleted_doc_ids: vec![],
            bytes_used: 0,
            segment_name: name,
        }
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn add_doc_id(&mut self, doc_id: DocId) {
        self.deleted_doc_ids.push(doc_id);
        self.bytes_used += BYTES_PER_DEL_DOCID;
    }

    pub fn add_term(&mut self, term: Term, doc_id_upto: DocId) {
        if let Some(current) = self.deleted_terms.get(&term) {
            if doc_id_upto < *current {
                // Only record the new number if it's greater than the
                // current one. Two threads replacing the same doc at nearly
                // the same time may be scheduled out of order.
                return;
            }
        }

        let cost = BYTES_PER_DEL_TERM + term.ram_bytes_used();
        let current = self.deleted_terms.insert(term, doc_id_upto);
        // a repeated term is counted again to respect max_buffered_delete_terms,
        // but its bytes only once.
        self.num_term_deletes += 1;
        if current.is_none() {
            self.bytes_used += cost;
        }
    }

    pub fn clear(&mut self) {
        self.deleted_terms.clear();
        self.deleted_doc_ids.clear();
        self.num_term_deletes = 0;
        self.bytes_used = 0;
    }

    pub fn any(&self) -> bool {
        !self.deleted_terms.is_empty() || !self.deleted_doc_ids.is_empty()
    }
}

impl fmt::Display for BufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "gen")?;
        if self.num_term_deletes > 0 {
            write!(
                f,
                " {} deleted terms (unique count={})",
                self.num_term_deletes,
                self.deleted_terms.len()
            )?;
        }
        if !self.deleted_doc_ids.is_empty() {
            write!(f, " {} deleted docIDs", self.deleted_doc_ids.len())?;
        }
        if self.bytes_used > 0 {
            write!(f, " bytes_used={}", self.bytes_used)?;
        }
        Ok(())
    }
}

/// Holds buffered deletes by term, once pushed. Pushed deletes are
/// write-once, so the terms are kept sorted in a plain vec. We don't hold
/// docIDs because these are applied on flush.
#[derive(Debug, Clone)]
pub struct FrozenBufferedUpdates {
    pub terms: Vec<Term>,
    pub bytes_used: usize,
    pub num_term_deletes: usize,
    pub gen: u64,
    // set to true iff this frozen packet represents a segment private delete.
    pub is_segment_private: bool,
}

impl FrozenBufferedUpdates {
    pub fn new(deletes: &BufferedUpdates, gen: u64, is_segment_private: bool) -> Self {
        let mut terms: Vec<Term> = deletes.deleted_terms.keys().cloned().collect();
        terms.sort();
        let bytes_used = terms
            .iter()
            .map(|t| BYTES_PER_DEL_TERM + t.ram_bytes_used())
            .sum();
        FrozenBufferedUpdates {
            terms,
            bytes_used,
            num_term_deletes: deletes.num_term_deletes,
            gen,
            is_segment_private,
        }
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty()
    }
}

impl fmt::Display for FrozenBufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "gen={}", self.gen)?;
        if self.num_term_deletes > 0 {
            write!(
                f,
                " {} deleted terms (unique count={})",
                self.num_term_deletes,
                self.terms.len()
            )?;
        }
        if self.bytes_used > 0 {
            write!(f, " bytes_used={}", self.bytes_used)?;
        }
        if self.is_segment_private {
            write!(f, " segment_private")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(text: &str) -> Term {
        Term::new("id".into(), text.as_bytes().to_vec())
    }

    #[test]
    fn test_add_term_keeps_max_doc_id_upto() {
        let mut updates = BufferedUpdates::new("_0".into());
        assert!(!updates.any());

        updates.add_term(term("a"), 5);
        let bytes = updates.bytes_used();
        assert_eq!(bytes, BYTES_PER_DEL_TERM + term("a").ram_bytes_used());

        updates.add_term(term("a"), 3);
        assert_eq!(updates.deleted_terms[&term("a")], 5);
        assert_eq!(updates.num_term_deletes, 1);

        updates.add_term(term("a"), 9);
        assert_eq!(updates.deleted_terms[&term("a")], 9);
        assert_eq!(updates.num_term_deletes, 2);
        assert_eq!(updates.bytes_used(), bytes);

        updates.add_doc_id(2);
        assert_eq!(updates.bytes_used(), bytes + BYTES_PER_DEL_DOCID);
        assert!(updates.any());

        updates.clear();
        assert!(!updates.any());
        assert_eq!(updates.bytes_used(), 0);
    }

    #[test]
    fn test_freeze_sorts_terms() {
        let mut updates = BufferedUpdates::new("_1".into());
        updates.add_term(term("c"), 1);
        updates.add_term(term("a"), 1);
        updates.add_term(term("b"), 1);

        let frozen = FrozenBufferedUpdates::new(&updates, 3, false);
        assert!(frozen.any());
        assert_eq!(frozen.gen, 3);
        assert_eq!(frozen.terms, vec![term("a"), term("b"), term("c")]);
        assert_eq!(frozen.bytes_used, updates.bytes_used());
        assert!(format!("{}", frozen).contains("3 deleted terms"));
    }
}
