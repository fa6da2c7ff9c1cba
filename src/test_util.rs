//! Iterator helpers for tests.

use crate::cmp::Comparator;
use crate::types::{current_key_val, InternalIterator};

use std::cmp::Ordering;
use std::rc::Rc;

/// An iterator over a fixed list of entries, pre-sorted under `cmp`.
pub struct TestIter {
    cmp: Rc<Box<dyn Comparator>>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    ix: usize,
    init: bool,
}

impl TestIter {
    pub fn new(cmp: Rc<Box<dyn Comparator>>, entries: Vec<(Vec<u8>, Vec<u8>)>) -> TestIter {
        TestIter {
            cmp,
            entries,
            ix: 0,
            init: false,
        }
    }
}

impl InternalIterator for TestIter {
    fn seek_ge(&mut self, key: &[u8]) {
        self.init = true;
        self.ix = self
            .entries
            .iter()
            .position(|(k, _)| self.cmp.compare(k, key) >= Ordering::Equal)
            .unwrap_or(self.entries.len());
    }

    fn seek_lt(&mut self, key: &[u8]) {
        self.init = true;
        match self
            .entries
            .iter()
            .rposition(|(k, _)| self.cmp.compare(k, key) == Ordering::Less)
        {
            Some(ix) => self.ix = ix,
            None => {
                self.init = false;
                self.ix = 0;
            }
        }
    }

    fn first(&mut self) {
        self.init = !self.entries.is_empty();
        self.ix = 0;
    }

    fn last(&mut self) {
        self.init = !self.entries.is_empty();
        self.ix = self.entries.len().saturating_sub(1);
    }

    fn next(&mut self) -> bool {
        if !self.init {
            self.first();
            return self.valid();
        }
        self.ix += 1;
        self.valid()
    }

    fn prev(&mut self) -> bool {
        if !self.init || self.ix == 0 {
            self.init = false;
            return false;
        }
        self.ix -= 1;
        true
    }

    fn valid(&self) -> bool {
        self.init && self.ix < self.entries.len()
    }

    fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool {
        if !self.valid() {
            return false;
        }
        key.clear();
        key.extend_from_slice(&self.entries[self.ix].0);
        val.clear();
        val.extend_from_slice(&self.entries[self.ix].1);
        true
    }
}

/// Collects all entries of an iterator from the start.
pub fn collect_forward<It: InternalIterator>(it: &mut It) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = vec![];
    it.first();
    while it.valid() {
        out.push(current_key_val(it).unwrap());
        it.next();
    }
    out
}
