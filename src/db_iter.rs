//! The user-facing iterator. It walks a merged stack of internal iterators (memtables, level-0
//! tables, deeper levels) at a fixed snapshot and collapses each user key's history to the value
//! a reader should see: entries above the snapshot are skipped, only the newest visible version
//! of a key is surfaced, deletions hide their key, MERGE entries fold through the merge
//! operator, and a range tombstone hides smaller-sequenced entries in `[start, end)` from the
//! point it is encountered onwards.
//!
//! Keys and values yielded are user keys and final values.

use crate::cmp::Comparator;
use crate::error::Result;
use crate::ikey::{
    self, LookupKey, KIND_DELETE, KIND_MERGE, KIND_RANGE_DELETE, KIND_SET,
};
use crate::merge::BoxedMerger;
use crate::merging_iter::MergingIter;
use crate::types::{
    Direction, InternalIterator, SequenceNumber, MAX_SEQUENCE_NUMBER, SEQ_NUM_BATCH,
};

use std::cmp::Ordering;
use std::rc::Rc;

struct Tombstone {
    start: Vec<u8>,
    end: Vec<u8>,
    seq: SequenceNumber,
}

pub struct DBIterator {
    ucmp: Rc<Box<dyn Comparator>>,
    merger: BoxedMerger,
    inner: MergingIter,
    /// Entries above this sequence number are invisible.
    seq: SequenceNumber,

    dir: Direction,
    valid: bool,
    // The emitted entry: user key and resolved value.
    key: Vec<u8>,
    value: Vec<u8>,

    // Range tombstones passed by the inner iterator since the last seek.
    tombstones: Vec<Tombstone>,
}

impl DBIterator {
    pub fn new(
        ucmp: Rc<Box<dyn Comparator>>,
        merger: BoxedMerger,
        inner: MergingIter,
        seq: SequenceNumber,
    ) -> DBIterator {
        DBIterator {
            ucmp,
            merger,
            inner,
            seq,
            dir: Direction::Forward,
            valid: false,
            key: Vec::new(),
            value: Vec::new(),
            tombstones: Vec::new(),
        }
    }

    fn visible(&self, seq: SequenceNumber) -> bool {
        seq <= self.seq || (seq & SEQ_NUM_BATCH) != 0
    }

    fn record_tombstone(&mut self, start: &[u8], end: &[u8], seq: SequenceNumber) {
        if self.visible(seq) {
            self.tombstones.push(Tombstone {
                start: start.to_vec(),
                end: end.to_vec(),
                seq,
            });
        }
    }

    fn covered_by_tombstone(&self, ukey: &[u8], seq: SequenceNumber) -> bool {
        self.tombstones.iter().any(|t| {
            seq < t.seq
                && self.ucmp.compare(&t.start, ukey) <= Ordering::Equal
                && self.ucmp.compare(ukey, &t.end) == Ordering::Less
        })
    }

    /// Advances the inner iterator past every entry of `ukey`.
    fn skip_user_key_forward(&mut self, ukey: &[u8]) {
        let (mut k, mut v) = (vec![], vec![]);
        while self.inner.current(&mut k, &mut v) {
            if self.ucmp.compare(ikey::user_key(&k), ukey) != Ordering::Equal {
                return;
            }
            if !self.inner.next() {
                return;
            }
        }
    }

    /// Resolves the next visible user key at or after the inner iterator's position. On success
    /// the inner iterator rests on or within the emitted key's history.
    fn find_next(&mut self) -> bool {
        self.valid = false;
        let (mut k, mut v) = (vec![], vec![]);

        'outer: while self.inner.current(&mut k, &mut v) {
            let (ukey, seq, kind) = match ikey::parse_internal_key(&k) {
                Some(p) => p,
                None => {
                    self.inner.next();
                    continue;
                }
            };
            if !self.visible(seq) {
                self.inner.next();
                continue;
            }

            let ukey = ukey.to_vec();
            if kind == KIND_RANGE_DELETE {
                self.record_tombstone(&ukey, &v, seq);
                self.inner.next();
                continue;
            }
            if self.covered_by_tombstone(&ukey, seq) || kind == KIND_DELETE {
                // The whole key is hidden; all older versions are shadowed anyway.
                self.skip_user_key_forward(&ukey);
                continue;
            }

            match kind {
                KIND_SET => {
                    self.key = ukey;
                    self.value = v.clone();
                    self.valid = true;
                    return true;
                }
                KIND_MERGE => {
                    // Fold older entries of this key.
                    let mut acc = v.clone();
                    loop {
                        if !self.inner.next() || !self.inner.current(&mut k, &mut v) {
                            break;
                        }
                        let (okey, oseq, okind) = match ikey::parse_internal_key(&k) {
                            Some(p) => p,
                            None => break,
                        };
                        if self.ucmp.compare(okey, &ukey) != Ordering::Equal {
                            break;
                        }
                        if !self.visible(oseq) {
                            continue;
                        }
                        match okind {
                            KIND_MERGE => acc = self.merger.merge(&ukey, &acc, &v),
                            KIND_SET => {
                                acc = self.merger.merge(&ukey, &acc, &v);
                                break;
                            }
                            // The tombstone ends the history; the fold stands on its own.
                            KIND_DELETE => break,
                            KIND_RANGE_DELETE => {
                                let end = v.clone();
                                self.record_tombstone(&okey.to_vec(), &end, oseq);
                            }
                            _ => break,
                        }
                    }
                    self.key = ukey;
                    self.value = acc;
                    self.valid = true;
                    return true;
                }
                _ => {
                    // Unknown kinds are skipped rather than surfaced.
                    self.inner.next();
                    continue 'outer;
                }
            }
        }
        false
    }

    /// Resolves the next visible user key at or before the inner iterator's position, moving
    /// strictly backwards. On success the inner iterator rests just below the emitted key's
    /// history.
    fn find_prev(&mut self) -> bool {
        self.valid = false;
        let (mut k, mut v) = (vec![], vec![]);

        loop {
            if !self.inner.current(&mut k, &mut v) {
                return false;
            }
            let run_ukey = match ikey::parse_internal_key(&k) {
                Some((u, _, _)) => u.to_vec(),
                None => {
                    if !self.inner.prev() {
                        return false;
                    }
                    continue;
                }
            };

            // Gather the visible versions of this user key, oldest first (the scan direction),
            // then step below the run.
            let mut versions: Vec<(u8, SequenceNumber, Vec<u8>)> = vec![];
            loop {
                if let Some((u, seq, kind)) = ikey::parse_internal_key(&k) {
                    if self.ucmp.compare(u, &run_ukey) != Ordering::Equal {
                        break;
                    }
                    if self.visible(seq) {
                        versions.push((kind, seq, v.clone()));
                    }
                } else {
                    break;
                }
                if !self.inner.prev() || !self.inner.current(&mut k, &mut v) {
                    break;
                }
            }

            // Resolve newest-first.
            let mut acc: Option<Vec<u8>> = None;
            let mut resolved = None;
            for (kind, seq, val) in versions.into_iter().rev() {
                if self.covered_by_tombstone(&run_ukey, seq) {
                    continue;
                }
                match kind {
                    KIND_SET => {
                        resolved = Some(match acc.take() {
                            Some(a) => self.merger.merge(&run_ukey, &a, &val),
                            None => val,
                        });
                        break;
                    }
                    KIND_DELETE => {
                        resolved = acc.take();
                        break;
                    }
                    KIND_MERGE => {
                        acc = Some(match acc.take() {
                            Some(a) => self.merger.merge(&run_ukey, &a, &val),
                            None => val,
                        });
                    }
                    _ => {}
                }
            }
            if resolved.is_none() {
                resolved = acc;
            }

            if let Some(value) = resolved {
                self.key = run_ukey;
                self.value = value;
                self.valid = true;
                return true;
            }
            // Hidden or deleted key; keep moving backwards.
        }
    }

    /// Positions at the first entry whose user key is >= `key`.
    pub fn seek_ge(&mut self, key: &[u8]) {
        self.tombstones.clear();
        self.dir = Direction::Forward;
        self.inner
            .seek_ge(LookupKey::new(key, self.seq).internal_key());
        self.find_next();
    }

    /// Positions at the last entry whose user key is < `key`.
    pub fn seek_lt(&mut self, key: &[u8]) {
        self.tombstones.clear();
        self.dir = Direction::Reverse;
        self.inner
            .seek_lt(LookupKey::new(key, MAX_SEQUENCE_NUMBER).internal_key());
        self.find_prev();
    }

    pub fn first(&mut self) {
        self.tombstones.clear();
        self.dir = Direction::Forward;
        self.inner.first();
        self.find_next();
    }

    pub fn last(&mut self) {
        self.tombstones.clear();
        self.dir = Direction::Reverse;
        self.inner.last();
        self.find_prev();
    }

    pub fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        if self.dir == Direction::Reverse {
            // The inner iterator sits below the emitted key; hop to just past it.
            self.dir = Direction::Forward;
            let from = LookupKey::new(&self.key, MAX_SEQUENCE_NUMBER);
            self.inner.seek_ge(from.internal_key());
        }
        let ukey = std::mem::take(&mut self.key);
        self.skip_user_key_forward(&ukey);
        self.key = ukey;
        self.find_next()
    }

    pub fn prev(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        if self.dir == Direction::Forward {
            // The inner iterator sits on or within the emitted key's history; hop below it.
            self.dir = Direction::Reverse;
            let from = LookupKey::new(&self.key, MAX_SEQUENCE_NUMBER);
            self.inner.seek_lt(from.internal_key());
        }
        self.find_prev()
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Copies the current user key and value into the supplied buffers.
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
        self.inner.status()
    }
}

/// Collects the current entry, like types::current_key_val but for the user-level iterator.
pub fn current_user_kv(it: &DBIterator) -> Option<(Vec<u8>, Vec<u8>)> {
    let (mut k, mut v) = (vec![], vec![]);
    if it.current(&mut k, &mut v) {
        Some((k, v))
    } else {
        None
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

    fn db_iter(mut entries: Vec<(Vec<u8>, Vec<u8>)>, seq: SequenceNumber) -> DBIterator {
        entries.sort_by(|a, b| icmp().compare(&a.0, &b.0));
        let inner = MergingIter::new(
            icmp(),
            vec![Box::new(TestIter::new(icmp(), entries)) as Box<dyn InternalIterator>],
        );
        DBIterator::new(ucmp(), Rc::new(Box::new(ConcatMerger)), inner, seq)
    }

    fn entry(ukey: &str, seq: u64, kind: u8, val: &str) -> (Vec<u8>, Vec<u8>) {
        (
            make_internal_key(ukey.as_bytes(), seq, kind),
            val.as_bytes().to_vec(),
        )
    }

    fn collect_fwd(it: &mut DBIterator) -> Vec<(String, String)> {
        let mut out = vec![];
        it.first();
        while it.valid() {
            let (k, v) = current_user_kv(it).unwrap();
            out.push((
                String::from_utf8(k).unwrap(),
                String::from_utf8(v).unwrap(),
            ));
            it.next();
        }
        out
    }

    fn pairs(v: &[(&str, &str)]) -> Vec<(String, String)> {
        v.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn test_db_iter_newest_visible_version_wins() {
        let entries = vec![
            entry("a", 1, KIND_SET, "a1"),
            entry("a", 2, KIND_SET, "a2"),
            entry("b", 3, KIND_SET, "b1"),
        ];
        let mut it = db_iter(entries.clone(), 100);
        assert_eq!(collect_fwd(&mut it), pairs(&[("a", "a2"), ("b", "b1")]));

        // At snapshot 1 only the first version of a exists.
        let mut it = db_iter(entries, 1);
        assert_eq!(collect_fwd(&mut it), pairs(&[("a", "a1")]));
    }

    #[test]
    fn test_db_iter_delete_hides_and_reverse_scan() {
        let entries = vec![
            entry("a", 1, KIND_SET, "a1"),
            entry("b", 2, KIND_SET, "b1"),
            entry("b", 3, KIND_DELETE, ""),
            entry("c", 4, KIND_SET, "c1"),
        ];
        let mut it = db_iter(entries, 100);
        assert_eq!(collect_fwd(&mut it), pairs(&[("a", "a1"), ("c", "c1")]));

        it.last();
        let mut got = vec![];
        while it.valid() {
            got.push(String::from_utf8(current_user_kv(&it).unwrap().0).unwrap());
            it.prev();
        }
        assert_eq!(got, vec!["c", "a"]);
    }

    #[test]
    fn test_db_iter_seeks() {
        let entries = vec![
            entry("cherry", 1, KIND_SET, "red"),
            entry("grape", 2, KIND_SET, "green"),
            entry("peach", 3, KIND_SET, "yellow"),
            entry("plum", 4, KIND_SET, "purple"),
        ];
        let mut it = db_iter(entries, 100);

        it.seek_ge(b"mango");
        let mut got = vec![];
        while it.valid() {
            let (k, v) = current_user_kv(&it).unwrap();
            got.push((String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap()));
            it.next();
        }
        assert_eq!(got, pairs(&[("peach", "yellow"), ("plum", "purple")]));

        it.seek_lt(b"mango");
        assert_eq!(current_user_kv(&it).unwrap().0, b"grape".to_vec());
    }

    #[test]
    fn test_db_iter_merge_fold() {
        let entries = vec![
            entry("k", 1, KIND_MERGE, "a"),
            entry("k", 2, KIND_MERGE, "b"),
            entry("k", 3, KIND_MERGE, "c"),
            entry("m", 4, KIND_SET, "base"),
            entry("m", 5, KIND_MERGE, "+x"),
        ];
        let mut it = db_iter(entries, 100);
        assert_eq!(collect_fwd(&mut it), pairs(&[("k", "abc"), ("m", "base+x")]));

        // Reverse resolves the same values.
        it.last();
        assert_eq!(current_user_kv(&it).unwrap().1, b"base+x".to_vec());
        it.prev();
        assert_eq!(current_user_kv(&it).unwrap().1, b"abc".to_vec());
    }

    #[test]
    fn test_db_iter_multi_version_reverse() {
        // An atomically committed batch: a@1, a@2, b@3, b@4.
        let entries = vec![
            entry("a", 1, KIND_SET, "1"),
            entry("a", 2, KIND_SET, "2"),
            entry("b", 3, KIND_SET, "1"),
            entry("b", 4, KIND_SET, "2"),
        ];
        let mut it = db_iter(entries, 100);
        it.last();
        let mut got = vec![];
        while it.valid() {
            let (k, v) = current_user_kv(&it).unwrap();
            got.push((String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap()));
            it.prev();
        }
        assert_eq!(got, pairs(&[("b", "2"), ("a", "2")]));
    }

    #[test]
    fn test_db_iter_direction_switches() {
        let entries = vec![
            entry("a", 1, KIND_SET, "a1"),
            entry("b", 2, KIND_SET, "b1"),
            entry("c", 3, KIND_SET, "c1"),
        ];
        let mut it = db_iter(entries, 100);
        it.first();
        assert!(it.next());
        assert_eq!(current_user_kv(&it).unwrap().0, b"b".to_vec());
        assert!(it.prev());
        assert_eq!(current_user_kv(&it).unwrap().0, b"a".to_vec());
        assert!(it.next());
        assert_eq!(current_user_kv(&it).unwrap().0, b"b".to_vec());
    }

    #[test]
    fn test_db_iter_range_delete_masks_forward() {
        let entries = vec![
            entry("a", 1, KIND_SET, "a1"),
            entry("b", 5, KIND_RANGE_DELETE, "e"), // deletes [b, e) at seq 5
            entry("b", 2, KIND_SET, "b1"),
            entry("c", 3, KIND_SET, "c1"),
            entry("e", 4, KIND_SET, "e1"),
            entry("f", 6, KIND_SET, "f1"),
        ];
        let mut it = db_iter(entries.clone(), 100);
        // b and c fall into the tombstone; e is the exclusive end and survives.
        assert_eq!(
            collect_fwd(&mut it),
            pairs(&[("a", "a1"), ("e", "e1"), ("f", "f1")])
        );

        // A write newer than the tombstone shines through.
        let mut entries2 = entries;
        entries2.push(entry("c", 9, KIND_SET, "c2"));
        let mut it = db_iter(entries2, 100);
        assert_eq!(
            collect_fwd(&mut it),
            pairs(&[("a", "a1"), ("c", "c2"), ("e", "e1"), ("f", "f1")])
        );
    }
}
