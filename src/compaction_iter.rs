//! The compaction iterator consumes a merged view of a compaction's inputs and emits at most one
//! entry per user key, collapsing each key's newest-first history:
//!
//! - a SET or DELETE is emitted as-is and shadows everything older;
//! - a MERGE folds older MERGE entries into itself; folding into a SET turns the result into a
//!   SET (so it shadows lower levels), while a DELETE ends the history and leaves the folded
//!   operands as the key's value;
//! - range tombstones pass through unchanged, they are not part of any point history.
//!
//! Entries with unparseable keys or unknown kinds are corruption and end the compaction.

use crate::cmp::Comparator;
use crate::error::{Result, Status, StatusCode};
use crate::ikey::{self, KIND_DELETE, KIND_MERGE, KIND_RANGE_DELETE, KIND_SET};
use crate::merge::BoxedMerger;
use crate::types::{current_key_val, InternalIterator};

use std::cmp::Ordering;
use std::rc::Rc;

#[derive(PartialEq)]
enum Pos {
    /// The input still sits on (or within) the entries of the emitted user key.
    Cur,
    /// The input has already moved past the emitted user key.
    Next,
}

pub struct CompactionIter {
    cmp: Rc<Box<dyn Comparator>>,
    merger: BoxedMerger,
    input: Box<dyn InternalIterator>,

    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    pos: Pos,
    err: Option<Status>,
}

impl CompactionIter {
    pub fn new(
        cmp: Rc<Box<dyn Comparator>>,
        merger: BoxedMerger,
        input: Box<dyn InternalIterator>,
    ) -> CompactionIter {
        CompactionIter {
            cmp,
            merger,
            input,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
            pos: Pos::Cur,
            err: None,
        }
    }

    pub fn first(&mut self) {
        if self.err.is_some() {
            return;
        }
        self.input.first();
        self.find_next_entry();
    }

    pub fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.pos == Pos::Cur {
            self.skip_past_current_user_key();
        }
        self.find_next_entry()
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool {
        if !self.valid {
            return false;
        }
        key.clear();
        key.extend_from_slice(&self.key);
        val.clear();
        val.extend_from_slice(&self.value);
        true
    }

    pub fn status(&mut self) -> Result<()> {
        if let Some(e) = self.err.take() {
            return Err(e);
        }
        self.input.status()
    }

    fn corrupt_key(&mut self, kind: u8) -> bool {
        self.err = Some(Status::new(
            StatusCode::Corruption,
            &format!("invalid internal key kind {} in compaction input", kind),
        ));
        self.valid = false;
        false
    }

    /// Advances the input past every entry sharing the emitted key's user key.
    fn skip_past_current_user_key(&mut self) {
        let ukey = ikey::user_key(&self.key).to_vec();
        let (mut k, mut v) = (vec![], vec![]);
        while self.input.next() {
            if !self.input.current(&mut k, &mut v) {
                break;
            }
            if self.cmp.compare(ikey::user_key(&k), &ukey) != Ordering::Equal {
                break;
            }
        }
    }

    fn find_next_entry(&mut self) -> bool {
        self.valid = false;
        self.pos = Pos::Cur;

        while self.input.valid() {
            let (key, value) = match current_key_val(&self.input) {
                Some(kv) => kv,
                None => break,
            };
            let kind = match ikey::parse_internal_key(&key) {
                Some((_, _, kind)) => kind,
                None => return self.corrupt_key(0xff),
            };

            match kind {
                KIND_SET | KIND_DELETE => {
                    self.key = key;
                    self.value = value;
                    self.valid = true;
                    return true;
                }
                KIND_RANGE_DELETE => {
                    // Emitted standalone: it must not swallow point entries of its start key.
                    self.key = key;
                    self.value = value;
                    self.valid = true;
                    self.input.next();
                    self.pos = Pos::Next;
                    return true;
                }
                KIND_MERGE => return self.merge_next(key, value),
                k => return self.corrupt_key(k),
            }
        }
        false
    }

    /// Starting from a MERGE entry, folds older entries of the same user key into it.
    fn merge_next(&mut self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.key = key;
        self.value = value;
        self.valid = true;

        let (mut k, mut v) = (vec![], vec![]);
        loop {
            self.input.next();
            if !self.input.valid() || !self.input.current(&mut k, &mut v) {
                self.pos = Pos::Next;
                return true;
            }

            let (ukey, _, kind) = match ikey::parse_internal_key(&k) {
                Some(p) => p,
                None => return self.corrupt_key(0xff),
            };
            if self.cmp.compare(ikey::user_key(&self.key), ukey) != Ordering::Equal {
                // Moved on to the next user key; the fold is complete.
                self.pos = Pos::Next;
                return true;
            }

            match kind {
                KIND_DELETE => {
                    // The tombstone ends the history; the operands folded so far stay a MERGE.
                    return true;
                }
                KIND_SET => {
                    // Folding into a full value; the result shadows lower levels, so it becomes
                    // a SET: MERGE+MERGE+SET -> SET.
                    let folded = self.merger.merge(ikey::user_key(&self.key), &self.value, &v);
                    self.value = folded;
                    ikey::set_kind(&mut self.key, KIND_SET);
                    return true;
                }
                KIND_MERGE => {
                    self.value =
                        self.merger
                            .merge(ikey::user_key(&self.key), &self.value, &v);
                }
                // A range tombstone interleaved with the history is emitted separately by the
                // pass-through arm and does not terminate the fold.
                KIND_RANGE_DELETE => {}
                k => return self.corrupt_key(k),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::{DefaultCmp, InternalKeyCmp};
    use crate::ikey::make_internal_key;
    use crate::merge::ConcatMerger;
    use crate::test_util::TestIter;

    fn ucmp() -> Rc<Box<dyn Comparator>> {
        Rc::new(Box::new(DefaultCmp))
    }

    fn icmp() -> Rc<Box<dyn Comparator>> {
        Rc::new(Box::new(InternalKeyCmp(ucmp())))
    }

    fn compacted(mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<(Vec<u8>, u64, u8, Vec<u8>)> {
        entries.sort_by(|a, b| icmp().compare(&a.0, &b.0));
        let input = Box::new(TestIter::new(icmp(), entries));
        let mut it = CompactionIter::new(ucmp(), Rc::new(Box::new(ConcatMerger)), input);

        let mut out = vec![];
        let (mut k, mut v) = (vec![], vec![]);
        it.first();
        while it.valid() {
            assert!(it.current(&mut k, &mut v));
            let (ukey, seq, kind) = ikey::parse_internal_key(&k).unwrap();
            out.push((ukey.to_vec(), seq, kind, v.clone()));
            it.next();
        }
        it.status().unwrap();
        out
    }

    fn entry(ukey: &str, seq: u64, kind: u8, val: &str) -> (Vec<u8>, Vec<u8>) {
        (
            make_internal_key(ukey.as_bytes(), seq, kind),
            val.as_bytes().to_vec(),
        )
    }

    #[test]
    fn test_set_shadows_older_versions() {
        let out = compacted(vec![
            entry("a", 3, KIND_SET, "new"),
            entry("a", 2, KIND_SET, "mid"),
            entry("a", 1, KIND_SET, "old"),
            entry("b", 1, KIND_SET, "b1"),
        ]);
        assert_eq!(
            out,
            vec![
                (b"a".to_vec(), 3, KIND_SET, b"new".to_vec()),
                (b"b".to_vec(), 1, KIND_SET, b"b1".to_vec()),
            ]
        );
    }

    #[test]
    fn test_delete_is_emitted_and_shadows() {
        let out = compacted(vec![
            entry("a", 5, KIND_DELETE, ""),
            entry("a", 2, KIND_SET, "old"),
        ]);
        assert_eq!(out, vec![(b"a".to_vec(), 5, KIND_DELETE, b"".to_vec())]);
    }

    #[test]
    fn test_merge_chain_collapses_to_one_merge() {
        let out = compacted(vec![
            entry("k", 1, KIND_MERGE, "a"),
            entry("k", 2, KIND_MERGE, "b"),
            entry("k", 3, KIND_MERGE, "c"),
        ]);
        assert_eq!(out, vec![(b"k".to_vec(), 3, KIND_MERGE, b"abc".to_vec())]);
    }

    #[test]
    fn test_merge_meeting_set_becomes_set() {
        let out = compacted(vec![
            entry("k", 1, KIND_SET, "base"),
            entry("k", 2, KIND_MERGE, "+1"),
            entry("k", 3, KIND_MERGE, "+2"),
            entry("z", 1, KIND_SET, "zz"),
        ]);
        assert_eq!(
            out,
            vec![
                (b"k".to_vec(), 3, KIND_SET, b"base+1+2".to_vec()),
                (b"z".to_vec(), 1, KIND_SET, b"zz".to_vec()),
            ]
        );
    }

    #[test]
    fn test_merge_meeting_delete_stays_merge() {
        let out = compacted(vec![
            entry("k", 1, KIND_SET, "buried"),
            entry("k", 2, KIND_DELETE, ""),
            entry("k", 3, KIND_MERGE, "a"),
            entry("k", 4, KIND_MERGE, "b"),
        ]);
        // The tombstone ends the fold; the buried SET must not leak into the result.
        assert_eq!(out, vec![(b"k".to_vec(), 4, KIND_MERGE, b"ab".to_vec())]);
    }

    #[test]
    fn test_range_delete_passes_through() {
        let out = compacted(vec![
            entry("a", 7, KIND_RANGE_DELETE, "d"),
            entry("b", 2, KIND_SET, "b1"),
        ]);
        assert_eq!(
            out,
            vec![
                (b"a".to_vec(), 7, KIND_RANGE_DELETE, b"d".to_vec()),
                (b"b".to_vec(), 2, KIND_SET, b"b1".to_vec()),
            ]
        );
    }

    #[test]
    fn test_unknown_kind_is_corruption() {
        let entries = vec![entry("a", 1, 7, "x")];
        let input = Box::new(TestIter::new(icmp(), entries));
        let mut it = CompactionIter::new(ucmp(), Rc::new(Box::new(ConcatMerger)), input);
        it.first();
        assert!(!it.valid());
        assert_eq!(it.status().err().unwrap().code, StatusCode::Corruption);
    }
}
