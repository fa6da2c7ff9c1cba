//! A bounded LRU cache. Used in two places: the block cache, holding decompressed table blocks
//! keyed by (file number, block offset), and the table cache, holding open table readers keyed by
//! file number.

use crate::types::FileNum;

use integer_encoding::FixedIntWriter;

use std::collections::HashMap;
use std::mem::swap;

// A handle is a raw pointer into the LRU list. No clone, no copy: a handle exists exactly once
// per cached entry.
type LRUHandle<T> = *mut LRUNode<T>;

struct LRUNode<T> {
    next: Option<Box<LRUNode<T>>>, // None in the list's last node
    prev: Option<*mut LRUNode<T>>,
    data: Option<T>, // if None, then this is the head node
}

struct LRUList<T> {
    head: LRUNode<T>,
    count: usize,
}

impl<T> LRUList<T> {
    fn new() -> LRUList<T> {
        LRUList {
            head: LRUNode {
                data: None,
                next: None,
                prev: None,
            },
            count: 0,
        }
    }

    /// Inserts a new element at the front (most recently used position).
    fn insert(&mut self, elem: T) -> LRUHandle<T> {
        self.count += 1;
        let mut new = Box::new(LRUNode {
            data: Some(elem),
            next: None,
            prev: Some(&mut self.head as *mut LRUNode<T>),
        });
        let newp = new.as_mut() as *mut LRUNode<T>;

        if self.head.next.is_some() {
            self.head.next.as_mut().unwrap().prev = Some(newp);
            new.next = self.head.next.take();
        } else {
            // First node; it is also the tail.
            self.head.prev = Some(newp);
        }
        self.head.next = Some(new);
        newp
    }

    /// Removes the least recently used element and returns it.
    fn remove_last(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let mut lasto = unsafe { (*((*self.head.prev.unwrap()).prev.unwrap())).next.take() };

        if let Some(ref mut last) = lasto {
            self.head.prev = last.prev;
            self.count -= 1;
            last.data.take()
        } else {
            None
        }
    }

    /// Removes the element behind the handle.
    fn remove(&mut self, handle: LRUHandle<T>) -> T {
        unsafe {
            let d = (*handle).data.take().unwrap();
            // Take ownership of the node to be removed.
            let mut current = (*(*handle).prev.unwrap()).next.take().unwrap();
            let prev = current.prev.unwrap();
            if let Some(next) = current.next.as_mut() {
                next.prev = current.prev.take();
            } else {
                self.head.prev = current.prev.take();
            }
            (*prev).next = current.next.take();
            self.count -= 1;
            d
        }
    }

    /// Moves the element behind the handle back to the front.
    fn reinsert_front(&mut self, handle: LRUHandle<T>) {
        unsafe {
            let prevp = (*handle).prev.unwrap();

            // Detach: update the following node's (or the tail's) prev pointer.
            if let Some(next) = (*handle).next.as_mut() {
                next.prev = Some(prevp);
            } else {
                self.head.prev = Some(prevp);
            }

            // Swap this.next with prev.next; after this, this.next owns the node itself.
            swap(&mut (*prevp).next, &mut (*handle).next);
            // Swap with head.next to reinsert at the front.
            swap(&mut (*handle).next, &mut self.head.next);

            (*handle).prev = Some(&mut self.head as *mut LRUNode<T>);
            if let Some(ref mut second) = (*handle).next {
                second.prev = Some(handle);
            } else {
                // Single node; it is also the tail.
                self.head.prev = Some(handle);
            }
        }
    }

    fn count(&self) -> usize {
        self.count
    }
}

pub type CacheKey = [u8; 16];
type CacheEntry<T> = (T, LRUHandle<CacheKey>);

/// Encodes a (file number, block offset) pair into a cache key. The table cache keys whole
/// readers and passes offset 0.
pub fn cache_key(file_num: FileNum, offset: u64) -> CacheKey {
    let mut key = [0; 16];
    (&mut key[..8]).write_fixedint(file_num).unwrap();
    (&mut key[8..]).write_fixedint(offset).unwrap();
    key
}

/// A bounded cache with least-recently-used eviction, based on a HashMap whose entries are linked
/// into an LRU list.
pub struct Cache<T> {
    list: LRUList<CacheKey>,
    map: HashMap<CacheKey, CacheEntry<T>>,
    cap: usize,
}

impl<T> Cache<T> {
    pub fn new(capacity: usize) -> Cache<T> {
        assert!(capacity > 0);
        Cache {
            list: LRUList::new(),
            map: HashMap::with_capacity(capacity.min(1024)),
            cap: capacity,
        }
    }

    /// How many elements the cache holds.
    pub fn count(&self) -> usize {
        self.list.count()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Inserts an element, evicting the least recently used one if the cache is full.
    pub fn insert(&mut self, key: &CacheKey, elem: T) {
        if self.list.count() >= self.cap {
            if let Some(evicted) = self.list.remove_last() {
                assert!(self.map.remove(&evicted).is_some());
            }
        }
        let handle = self.list.insert(*key);
        self.map.insert(*key, (elem, handle));
    }

    /// Retrieves an element and marks it most recently used.
    pub fn get(&mut self, key: &CacheKey) -> Option<&T> {
        match self.map.get(key) {
            None => None,
            Some(&(ref elem, handle)) => {
                self.list.reinsert_front(handle);
                Some(elem)
            }
        }
    }

    /// Removes an element (for invalidation).
    pub fn remove(&mut self, key: &CacheKey) -> Option<T> {
        match self.map.remove(key) {
            None => None,
            Some((elem, handle)) => {
                self.list.remove(handle);
                Some(elem)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> CacheKey {
        cache_key(n, 0)
    }

    #[test]
    fn test_cache_insert_get() {
        let mut c: Cache<u32> = Cache::new(4);
        c.insert(&key(1), 11);
        c.insert(&key(2), 22);
        assert_eq!(c.get(&key(1)), Some(&11));
        assert_eq!(c.get(&key(2)), Some(&22));
        assert_eq!(c.get(&key(3)), None);
        assert_eq!(c.count(), 2);
    }

    #[test]
    fn test_cache_evicts_lru() {
        let mut c: Cache<u32> = Cache::new(3);
        c.insert(&key(1), 1);
        c.insert(&key(2), 2);
        c.insert(&key(3), 3);
        // Touch 1 so that 2 is the least recently used.
        assert!(c.get(&key(1)).is_some());
        c.insert(&key(4), 4);
        assert_eq!(c.get(&key(2)), None);
        assert!(c.get(&key(1)).is_some());
        assert!(c.get(&key(3)).is_some());
        assert!(c.get(&key(4)).is_some());
        assert_eq!(c.count(), 3);
    }

    #[test]
    fn test_cache_remove() {
        let mut c: Cache<u32> = Cache::new(3);
        c.insert(&key(1), 1);
        c.insert(&key(2), 2);
        assert_eq!(c.remove(&key(1)), Some(1));
        assert_eq!(c.get(&key(1)), None);
        assert_eq!(c.remove(&key(1)), None);
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn test_cache_churn() {
        let mut c: Cache<u64> = Cache::new(8);
        for i in 0..1000 {
            c.insert(&key(i), i);
            assert!(c.count() <= 8);
            assert_eq!(c.get(&key(i)), Some(&i));
        }
    }
}
