//! An ordered map implemented as a skiplist. The engine treats it as an opaque sorted multimap:
//! the memtable keys it by encoded internal keys, the indexed batch by entry offsets resolved
//! through a shared buffer.
//!
//! Nodes are owned through the level-0 `next` chain; the skip pointers are raw and only ever
//! point at live nodes (nothing is removed before the whole map drops). Every node carries the
//! comparator's `inline_key` fingerprint, so most comparisons are decided on a single u64 without
//! touching the full keys.

use crate::cmp::Comparator;
use crate::types::InternalIterator;

use std::cell::RefCell;
use std::cmp::Ordering;
use std::mem;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_HEIGHT: usize = 12;
const BRANCHING_FACTOR: u32 = 4;

struct Node {
    skips: Vec<Option<*mut Node>>,
    // Owns the next node in the level-0 chain.
    next: Option<Box<Node>>,
    inline: u64,
    key: Vec<u8>,
    value: Vec<u8>,
}

pub struct InnerSkipMap {
    head: Box<Node>,
    rand: StdRng,
    len: usize,
    // Approximate memory usage of keys and values plus node overhead.
    approx_mem: usize,
    cmp: Rc<Box<dyn Comparator>>,
}

impl InnerSkipMap {
    fn cmp_with_inline(&self, a_inline: u64, a_key: &[u8], b_inline: u64, b_key: &[u8]) -> Ordering {
        if a_inline != b_inline {
            a_inline.cmp(&b_inline)
        } else {
            self.cmp.compare(a_key, b_key)
        }
    }

    fn random_height(&mut self) -> usize {
        let mut height = 1;
        while height < MAX_HEIGHT && self.rand.gen_range(0..BRANCHING_FACTOR) == 0 {
            height += 1;
        }
        height
    }

    /// Returns the last node whose key is strictly less than `key`; the head node if there is
    /// none.
    fn find_less_than(&self, key: &[u8]) -> *const Node {
        let inline = self.cmp.inline_key(key);
        let mut current = self.head.as_ref() as *const Node;
        let mut level = MAX_HEIGHT - 1;

        loop {
            unsafe {
                if let Some(next) = (&(*current).skips)[level] {
                    if self.cmp_with_inline((*next).inline, &(*next).key, inline, key)
                        == Ordering::Less
                    {
                        current = next;
                        continue;
                    }
                }
            }
            if level == 0 {
                break;
            }
            level -= 1;
        }
        current
    }

    /// Returns the first node whose key is greater than or equal to `key`, if any.
    fn find_greater_or_equal(&self, key: &[u8]) -> Option<*const Node> {
        let less = self.find_less_than(key);
        unsafe { (&(*less).skips)[0].map(|n| n as *const Node) }
    }

    fn find_last(&self) -> Option<*const Node> {
        let mut current = self.head.as_ref() as *const Node;
        let mut level = MAX_HEIGHT - 1;
        loop {
            unsafe {
                if let Some(next) = (&(*current).skips)[level] {
                    current = next;
                    continue;
                }
            }
            if level == 0 {
                break;
            }
            level -= 1;
        }
        if current == self.head.as_ref() as *const Node {
            None
        } else {
            Some(current)
        }
    }

    /// Inserts a new entry. Keys must not repeat; the callers guarantee uniqueness (distinct
    /// sequence numbers in the memtable, distinct offsets in a batch index).
    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        assert!(!key.is_empty());
        let inline = self.cmp.inline_key(&key);
        let new_height = self.random_height();

        let mut prevs: Vec<*mut Node> = vec![self.head.as_mut() as *mut Node; new_height];
        let mut current = self.head.as_mut() as *mut Node;
        let mut level = MAX_HEIGHT - 1;

        loop {
            unsafe {
                if let Some(next) = (&(*current).skips)[level] {
                    let ord = self.cmp_with_inline((*next).inline, &(*next).key, inline, &key);
                    assert!(ord != Ordering::Equal, "No duplicate keys allowed");
                    if ord == Ordering::Less {
                        current = next;
                        continue;
                    }
                }
            }
            if level < new_height {
                prevs[level] = current;
            }
            if level == 0 {
                break;
            }
            level -= 1;
        }

        self.approx_mem += mem::size_of::<Node>() + key.len() + value.len();
        self.len += 1;

        let mut new = Box::new(Node {
            skips: vec![None; new_height],
            next: None,
            inline,
            key,
            value,
        });
        let newp = new.as_mut() as *mut Node;

        for (i, prev) in prevs.iter().enumerate() {
            unsafe {
                new.skips[i] = (&(**prev).skips)[i];
                (&mut (**prev).skips)[i] = Some(newp);
            }
        }
        // Splice into the owning level-0 chain.
        unsafe {
            let prev = prevs[0];
            new.next = (*prev).next.take();
            (*prev).next = Some(new);
        }
    }
}

impl Drop for InnerSkipMap {
    // The default drop would recurse through the level-0 ownership chain and can blow the stack
    // for large maps.
    fn drop(&mut self) {
        let mut cur = self.head.next.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
    }
}

/// A shared handle to a skiplist. Clones refer to the same list; iterators keep the list alive.
#[derive(Clone)]
pub struct SkipMap {
    map: Rc<RefCell<InnerSkipMap>>,
}

impl SkipMap {
    pub fn new(cmp: Rc<Box<dyn Comparator>>) -> SkipMap {
        let head = Box::new(Node {
            skips: vec![None; MAX_HEIGHT],
            next: None,
            inline: 0,
            key: Vec::new(),
            value: Vec::new(),
        });
        SkipMap {
            map: Rc::new(RefCell::new(InnerSkipMap {
                head,
                rand: StdRng::seed_from_u64(0xdeadbeef),
                len: 0,
                approx_mem: 0,
                cmp,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn approx_memory(&self) -> usize {
        self.map.borrow().approx_mem
    }

    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.map.borrow_mut().insert(key, value)
    }

    pub fn iter(&self) -> SkipMapIter {
        SkipMapIter {
            map: self.map.clone(),
            current: std::ptr::null(),
        }
    }
}

/// An iterator over a skiplist. Unpositioned until the first seek; insertions during iteration
/// never move nodes, so an iterator stays valid across them. Clones remember their position,
/// which callers use to cache interesting positions cheaply.
#[derive(Clone)]
pub struct SkipMapIter {
    map: Rc<RefCell<InnerSkipMap>>,
    current: *const Node,
}

impl SkipMapIter {
    fn head(&self) -> *const Node {
        self.map.borrow().head.as_ref() as *const Node
    }

    /// Whether two iterators over the same map sit on the same entry.
    pub fn at_same(&self, other: &SkipMapIter) -> bool {
        std::ptr::eq(self.current, other.current)
    }
}

impl InternalIterator for SkipMapIter {
    fn seek_ge(&mut self, key: &[u8]) {
        let map = self.map.borrow();
        self.current = map.find_greater_or_equal(key).unwrap_or(std::ptr::null());
    }

    fn seek_lt(&mut self, key: &[u8]) {
        let map = self.map.borrow();
        let less = map.find_less_than(key);
        self.current = if less == map.head.as_ref() as *const Node {
            std::ptr::null()
        } else {
            less
        };
    }

    fn first(&mut self) {
        let map = self.map.borrow();
        self.current = map.head.skips[0].map_or(std::ptr::null(), |n| n as *const Node);
    }

    fn last(&mut self) {
        let map = self.map.borrow();
        self.current = map.find_last().unwrap_or(std::ptr::null());
    }

    fn next(&mut self) -> bool {
        if self.current.is_null() {
            self.first();
            return self.valid();
        }
        unsafe {
            self.current = (&(*self.current).skips)[0].map_or(std::ptr::null(), |n| n as *const Node);
        }
        self.valid()
    }

    fn prev(&mut self) -> bool {
        if self.current.is_null() {
            self.last();
            return self.valid();
        }
        let key = unsafe { (*self.current).key.clone() };
        let map = self.map.borrow();
        let less = map.find_less_than(&key);
        self.current = if less == map.head.as_ref() as *const Node {
            std::ptr::null()
        } else {
            less
        };
        self.valid()
    }

    fn valid(&self) -> bool {
        !self.current.is_null() && self.current != self.head()
    }

    fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool {
        if !self.valid() {
            return false;
        }
        unsafe {
            key.clear();
            key.extend_from_slice(&(*self.current).key);
            val.clear();
            val.extend_from_slice(&(*self.current).value);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::DefaultCmp;
    use crate::types::current_key_val;

    fn make_map(keys: &[&[u8]]) -> SkipMap {
        let map = SkipMap::new(Rc::new(Box::new(DefaultCmp)));
        for k in keys {
            map.insert(k.to_vec(), k.to_vec());
        }
        map
    }

    #[test]
    fn test_insert_len_mem() {
        let map = make_map(&[b"dog", b"ant", b"cat"]);
        assert_eq!(map.len(), 3);
        assert!(map.approx_memory() > 18);
    }

    #[test]
    fn test_iter_forward_sorted() {
        let map = make_map(&[b"dog", b"ant", b"cat", b"bee", b"elk"]);
        let mut it = map.iter();
        let mut got = vec![];
        it.first();
        while it.valid() {
            got.push(current_key_val(&it).unwrap().0);
            it.next();
        }
        assert_eq!(got, vec![b"ant".to_vec(), b"bee".to_vec(), b"cat".to_vec(), b"dog".to_vec(), b"elk".to_vec()]);
    }

    #[test]
    fn test_iter_backward_sorted() {
        let map = make_map(&[b"dog", b"ant", b"cat"]);
        let mut it = map.iter();
        it.last();
        let mut got = vec![];
        while it.valid() {
            got.push(current_key_val(&it).unwrap().0);
            it.prev();
        }
        assert_eq!(got, vec![b"dog".to_vec(), b"cat".to_vec(), b"ant".to_vec()]);
    }

    #[test]
    fn test_seeks() {
        let map = make_map(&[b"ant", b"cat", b"elk"]);
        let mut it = map.iter();

        it.seek_ge(b"bee");
        assert_eq!(current_key_val(&it).unwrap().0, b"cat".to_vec());
        it.seek_ge(b"cat");
        assert_eq!(current_key_val(&it).unwrap().0, b"cat".to_vec());
        it.seek_ge(b"fox");
        assert!(!it.valid());

        it.seek_lt(b"cat");
        assert_eq!(current_key_val(&it).unwrap().0, b"ant".to_vec());
        it.seek_lt(b"ant");
        assert!(!it.valid());
        it.seek_lt(b"zebra");
        assert_eq!(current_key_val(&it).unwrap().0, b"elk".to_vec());
    }

    #[test]
    fn test_many_entries_stay_sorted() {
        let map = SkipMap::new(Rc::new(Box::new(DefaultCmp)));
        for i in (0..500).rev() {
            map.insert(format!("{:08}", i).into_bytes(), vec![]);
        }
        assert_eq!(map.len(), 500);
        let mut it = map.iter();
        it.first();
        let mut prev = vec![];
        let mut count = 0;
        while it.valid() {
            let (k, _) = current_key_val(&it).unwrap();
            assert!(k > prev);
            prev = k;
            count += 1;
            it.next();
        }
        assert_eq!(count, 500);
    }

    #[test]
    fn test_iter_valid_across_inserts() {
        let map = make_map(&[b"b", b"d"]);
        let mut it = map.iter();
        it.seek_ge(b"d");
        map.insert(b"c".to_vec(), vec![]);
        assert_eq!(current_key_val(&it).unwrap().0, b"d".to_vec());
        assert!(it.prev());
        assert_eq!(current_key_val(&it).unwrap().0, b"c".to_vec());
    }
}
