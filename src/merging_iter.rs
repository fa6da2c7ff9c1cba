//! A k-way merge over internal iterators, yielding entries in internal-key order. The tie-break
//! is the full internal-key comparison, so among equal user keys the entry with the higher
//! sequence number -- the newer one -- comes first.

use crate::cmp::Comparator;
use crate::error::Result;
use crate::types::{current_key_val, Direction, InternalIterator};

use std::cmp::Ordering;
use std::rc::Rc;

pub struct MergingIter {
    iters: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
    direction: Direction,
    cmp: Rc<Box<dyn Comparator>>,
}

impl MergingIter {
    /// `cmp` must order internal keys.
    pub fn new(cmp: Rc<Box<dyn Comparator>>, iters: Vec<Box<dyn InternalIterator>>) -> MergingIter {
        MergingIter {
            iters,
            current: None,
            direction: Direction::Forward,
            cmp,
        }
    }

    /// Repositions all children but the current one to the far side of the current key in the
    /// new direction. Forward means "first entry past the current key", reverse "last entry
    /// before it".
    fn switch_direction(&mut self, d: Direction) {
        if self.direction == d {
            return;
        }
        self.direction = d;

        let current = match self.current {
            Some(c) => c,
            None => return,
        };
        let (key, _) = match current_key_val(self) {
            Some(kv) => kv,
            None => return,
        };

        let (mut k, mut v) = (vec![], vec![]);
        for i in 0..self.iters.len() {
            if i == current {
                continue;
            }
            match d {
                Direction::Forward => {
                    self.iters[i].seek_ge(&key);
                    // Children never share full internal keys (sequence numbers are unique), but
                    // an exact hit must still land past the current entry.
                    if self.iters[i].current(&mut k, &mut v)
                        && self.cmp.compare(&k, &key) == Ordering::Equal
                    {
                        self.iters[i].next();
                    }
                }
                Direction::Reverse => {
                    self.iters[i].seek_lt(&key);
                }
            }
        }
    }

    fn find_smallest(&mut self) {
        self.find(Ordering::Less)
    }

    fn find_largest(&mut self) {
        self.find(Ordering::Greater)
    }

    /// Selects the valid child whose key compares `wanted` against all others.
    fn find(&mut self, wanted: Ordering) {
        let mut best: Option<usize> = None;
        let mut best_key = vec![];
        let (mut k, mut v) = (vec![], vec![]);

        for i in 0..self.iters.len() {
            if !self.iters[i].current(&mut k, &mut v) {
                continue;
            }
            match best {
                None => {
                    best = Some(i);
                    std::mem::swap(&mut best_key, &mut k);
                }
                Some(_) => {
                    if self.cmp.compare(&k, &best_key) == wanted {
                        best = Some(i);
                        std::mem::swap(&mut best_key, &mut k);
                    }
                }
            }
        }
        self.current = best;
    }
}

impl InternalIterator for MergingIter {
    fn seek_ge(&mut self, key: &[u8]) {
        for it in self.iters.iter_mut() {
            it.seek_ge(key);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_lt(&mut self, key: &[u8]) {
        for it in self.iters.iter_mut() {
            it.seek_lt(key);
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn first(&mut self) {
        for it in self.iters.iter_mut() {
            it.first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn last(&mut self) {
        for it in self.iters.iter_mut() {
            it.last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn next(&mut self) -> bool {
        match self.current {
            None => self.first(),
            Some(current) => {
                self.switch_direction(Direction::Forward);
                self.iters[current].next();
                self.find_smallest();
            }
        }
        self.valid()
    }

    fn prev(&mut self) -> bool {
        match self.current {
            None => self.last(),
            Some(current) => {
                self.switch_direction(Direction::Reverse);
                self.iters[current].prev();
                self.find_largest();
            }
        }
        self.valid()
    }

    fn valid(&self) -> bool {
        match self.current {
            Some(ix) => self.iters[ix].valid(),
            None => false,
        }
    }

    fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool {
        match self.current {
            Some(ix) => self.iters[ix].current(key, val),
            None => false,
        }
    }

    fn status(&mut self) -> Result<()> {
        for it in self.iters.iter_mut() {
            it.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::{DefaultCmp, InternalKeyCmp};
    use crate::ikey::{make_internal_key, parse_internal_key, KIND_SET};
    use crate::test_util::TestIter;

    fn icmp() -> Rc<Box<dyn Comparator>> {
        Rc::new(Box::new(InternalKeyCmp(Rc::new(Box::new(DefaultCmp)))))
    }

    fn ientry(ukey: &str, seq: u64) -> (Vec<u8>, Vec<u8>) {
        (
            make_internal_key(ukey.as_bytes(), seq, KIND_SET),
            format!("{}@{}", ukey, seq).into_bytes(),
        )
    }

    fn merged(children: Vec<Vec<(Vec<u8>, Vec<u8>)>>) -> MergingIter {
        let iters: Vec<Box<dyn InternalIterator>> = children
            .into_iter()
            .map(|c| Box::new(TestIter::new(icmp(), c)) as Box<dyn InternalIterator>)
            .collect();
        MergingIter::new(icmp(), iters)
    }

    fn user_seq(key: &[u8]) -> (String, u64) {
        let (u, s, _) = parse_internal_key(key).unwrap();
        (String::from_utf8(u.to_vec()).unwrap(), s)
    }

    #[test]
    fn test_merging_interleaves_in_order() {
        let mut mi = merged(vec![
            vec![ientry("a", 10), ientry("c", 10), ientry("e", 10)],
            vec![ientry("b", 11), ientry("d", 11)],
        ]);

        let mut got = vec![];
        mi.first();
        while mi.valid() {
            let (k, _) = current_key_val(&mi).unwrap();
            got.push(user_seq(&k).0);
            mi.next();
        }
        assert_eq!(got, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_merging_newer_sequence_first() {
        let mut mi = merged(vec![
            vec![ientry("k", 5)],
            vec![ientry("k", 9)],
            vec![ientry("k", 7)],
        ]);

        let mut got = vec![];
        mi.first();
        while mi.valid() {
            got.push(user_seq(&current_key_val(&mi).unwrap().0).1);
            mi.next();
        }
        assert_eq!(got, vec![9, 7, 5]);
    }

    #[test]
    fn test_merging_seeks() {
        let mut mi = merged(vec![
            vec![ientry("a", 1), ientry("c", 1)],
            vec![ientry("b", 2), ientry("d", 2)],
        ]);

        mi.seek_ge(&make_internal_key(b"b", crate::types::MAX_SEQUENCE_NUMBER, KIND_SET));
        assert_eq!(user_seq(&current_key_val(&mi).unwrap().0).0, "b");

        mi.seek_lt(&make_internal_key(b"b", 0, KIND_SET));
        // Everything of user key b sorts before (b, 0), so seek_lt lands on b itself; seeking
        // below all of b requires its lookup form.
        let (u, _) = user_seq(&current_key_val(&mi).unwrap().0);
        assert_eq!(u, "b");

        mi.seek_lt(&make_internal_key(b"b", crate::types::MAX_SEQUENCE_NUMBER, KIND_SET));
        assert_eq!(user_seq(&current_key_val(&mi).unwrap().0).0, "a");
    }

    #[test]
    fn test_merging_reverse_and_direction_switch() {
        let mut mi = merged(vec![
            vec![ientry("a", 1), ientry("c", 1)],
            vec![ientry("b", 2), ientry("d", 2)],
        ]);

        mi.last();
        let mut got = vec![];
        while mi.valid() {
            got.push(user_seq(&current_key_val(&mi).unwrap().0).0);
            mi.prev();
        }
        assert_eq!(got, vec!["d", "c", "b", "a"]);

        // Switch directions mid-stream.
        mi.first();
        assert!(mi.next()); // at b
        assert!(mi.next()); // at c
        assert!(mi.prev()); // back to b
        assert_eq!(user_seq(&current_key_val(&mi).unwrap().0).0, "b");
        assert!(mi.next()); // forward again to c
        assert_eq!(user_seq(&current_key_val(&mi).unwrap().0).0, "c");
    }

    #[test]
    fn test_merging_empty_children() {
        let mut mi = merged(vec![vec![], vec![ientry("a", 1)], vec![]]);
        mi.first();
        assert!(mi.valid());
        assert!(!mi.next());

        let mut empty = merged(vec![]);
        empty.first();
        assert!(!empty.valid());
    }
}
