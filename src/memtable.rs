//! The memtable stages committed writes in memory until a flush turns them into an L0 table. It
//! is a skiplist over encoded internal keys with a byte budget: `prepare` reserves room for a
//! whole batch or reports the table full, `apply` inserts the batch's entries at consecutive
//! sequence numbers. Entries are immutable once inserted.

use crate::batch::{Batch, BatchReader};
use crate::cmp::{Comparator, InternalKeyCmp};
use crate::error::{err, Result, StatusCode};
use crate::ikey::{self, LookupKey, KIND_DELETE, KIND_MERGE, KIND_RANGE_DELETE, KIND_SET};
use crate::merge::BoxedMerger;
use crate::skipmap::{SkipMap, SkipMapIter};
use crate::types::{current_key_val, InternalIterator, SequenceNumber};

use std::cmp::Ordering;
use std::rc::Rc;

// Estimated per-entry overhead of a skiplist node, on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 112;

/// The approximate memtable space an entry occupies; batches accumulate this while being built
/// so that `prepare` can reserve space without decoding them twice.
pub fn mem_entry_size(klen: usize, vlen: usize) -> usize {
    klen + 8 + vlen + ENTRY_OVERHEAD
}

/// The outcome of a memtable point lookup.
#[derive(Debug, PartialEq)]
pub enum MemGetResult {
    /// The newest visible entry resolves to this value.
    Value(Vec<u8>),
    /// The newest visible entry is a deletion.
    Deleted,
    /// The history within this memtable is all MERGE entries; the fold so far must continue
    /// into older state.
    Merged(Vec<u8>),
    NotFound,
}

pub struct MemTable {
    map: SkipMap,
    cmp: Rc<Box<dyn Comparator>>,
    capacity: usize,
    reserved: usize,
    // In-flight writers that have reserved but possibly not yet applied.
    writers: usize,
}

pub type MemtableIterator = SkipMapIter;

impl MemTable {
    /// `cmp` is the user comparator; `capacity` bounds the reservable bytes.
    pub fn new(cmp: Rc<Box<dyn Comparator>>, capacity: usize) -> MemTable {
        let icmp: Rc<Box<dyn Comparator>> = Rc::new(Box::new(InternalKeyCmp(cmp.clone())));
        MemTable {
            map: SkipMap::new(icmp),
            cmp,
            capacity,
            reserved: 0,

            writers: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn approx_mem_usage(&self) -> usize {
        self.reserved
    }

    /// Reserves space for the batch and registers its writer. Fails with ArenaFull when the
    /// batch does not fit; a batch larger than the whole capacity is still accepted into an
    /// empty memtable, since rotating would never make room for it.
    pub fn prepare(&mut self, batch: &Batch) -> Result<()> {
        let size = batch.mem_size();
        if self.reserved > 0 && self.reserved + size > self.capacity {
            return err(StatusCode::ArenaFull, "memtable is full");
        }
        self.reserved += size;
        self.writers += 1;
        Ok(())
    }

    /// Inserts the batch's entries, the i-th at sequence number `base_seq + i`. The space must
    /// have been reserved via `prepare`.
    pub fn apply(&mut self, batch: &Batch, base_seq: SequenceNumber) -> Result<()> {
        let data = batch.repr();
        let mut reader = BatchReader::new(&data)?;
        let mut i = 0;
        while let Some((kind, ukey, val)) = reader.next()? {
            let key = ikey::make_internal_key(ukey, base_seq + i, kind);
            self.map.insert(key, val.to_vec());
            i += 1;
        }
        Ok(())
    }

    /// Returns reserved bytes after a commit that never applied, keeping the rotation heuristic
    /// accurate.
    pub fn cancel_reservation(&mut self, size: usize) {
        assert!(self.reserved >= size);
        self.reserved -= size;
    }

    /// Releases a writer registered by `prepare`; returns true when it was the last one.
    pub fn unref(&mut self) -> bool {
        assert!(self.writers > 0);
        self.writers -= 1;
        self.writers == 0
    }

    /// Whether no writer holds a reservation; a memtable may only flush once this holds and it
    /// has been rotated out of the mutable slot.
    pub fn ready_for_flush(&self) -> bool {
        self.writers == 0
    }

    /// Resolves `key` within this memtable at the lookup key's snapshot, folding MERGE entries
    /// through `merger`.
    pub fn get(&self, key: &LookupKey, merger: &BoxedMerger) -> MemGetResult {
        let mut iter = self.map.iter();
        iter.seek_ge(key.internal_key());

        let mut pending: Option<Vec<u8>> = None;
        loop {
            let (ikey, val) = match current_key_val(&iter) {
                Some(kv) => kv,
                None => break,
            };
            let (ukey, _, kind) = match ikey::parse_internal_key(&ikey) {
                Some(p) => p,
                None => break,
            };
            if self.cmp.compare(ukey, key.user_key()) != Ordering::Equal {
                break;
            }

            match kind {
                KIND_SET => {
                    return match pending {
                        Some(acc) => MemGetResult::Value(merger.merge(ukey, &acc, &val)),
                        None => MemGetResult::Value(val),
                    }
                }
                KIND_DELETE => {
                    return match pending {
                        // The deletion ends the history; the folded operands stand alone.
                        Some(acc) => MemGetResult::Value(acc),
                        None => MemGetResult::Deleted,
                    };
                }
                KIND_MERGE => {
                    pending = Some(match pending {
                        Some(acc) => merger.merge(ukey, &acc, &val),
                        None => val,
                    });
                }
                // A range tombstone whose start coincides with the key carries no point value.
                KIND_RANGE_DELETE => {}
                _ => break,
            }
            iter.next();
        }

        match pending {
            Some(acc) => MemGetResult::Merged(acc),
            None => MemGetResult::NotFound,
        }
    }

    /// An iterator over the memtable's internal keys.
    pub fn new_iter(&self) -> MemtableIterator {
        self.map.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::DefaultCmp;
    use crate::merge::ConcatMerger;
    use crate::types::MAX_SEQUENCE_NUMBER;

    fn merger() -> BoxedMerger {
        Rc::new(Box::new(ConcatMerger))
    }

    fn ucmp() -> Rc<Box<dyn Comparator>> {
        Rc::new(Box::new(DefaultCmp))
    }

    fn apply_batch(mem: &mut MemTable, base_seq: SequenceNumber, f: impl Fn(&mut Batch)) {
        let mut b = Batch::new();
        f(&mut b);
        mem.prepare(&b).unwrap();
        mem.apply(&b, base_seq).unwrap();
        mem.unref();
    }

    fn lookup(mem: &MemTable, key: &[u8]) -> MemGetResult {
        mem.get(&LookupKey::new(key, MAX_SEQUENCE_NUMBER), &merger())
    }

    #[test]
    fn test_memtable_basic() {
        let mut mem = MemTable::new(ucmp(), 1 << 20);
        apply_batch(&mut mem, 1, |b| {
            b.set(b"cherry", b"red").unwrap();
            b.set(b"peach", b"yellow").unwrap();
            b.set(b"grape", b"red").unwrap();
            b.set(b"grape", b"green").unwrap();
            b.set(b"plum", b"purple").unwrap();
        });
        assert_eq!(mem.len(), 5);

        assert_eq!(lookup(&mem, b"plum"), MemGetResult::Value(b"purple".to_vec()));
        assert_eq!(lookup(&mem, b"grape"), MemGetResult::Value(b"green".to_vec()));
        assert_eq!(lookup(&mem, b"lychee"), MemGetResult::NotFound);
    }

    #[test]
    fn test_memtable_snapshot_visibility() {
        let mut mem = MemTable::new(ucmp(), 1 << 20);
        apply_batch(&mut mem, 1, |b| b.set(b"k", b"old").unwrap());
        apply_batch(&mut mem, 2, |b| b.set(b"k", b"new").unwrap());

        let m = merger();
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 1), &m),
            MemGetResult::Value(b"old".to_vec())
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 2), &m),
            MemGetResult::Value(b"new".to_vec())
        );
    }

    #[test]
    fn test_memtable_delete_hides() {
        let mut mem = MemTable::new(ucmp(), 1 << 20);
        apply_batch(&mut mem, 1, |b| b.set(b"k", b"v").unwrap());
        apply_batch(&mut mem, 2, |b| b.delete(b"k").unwrap());
        assert_eq!(lookup(&mem, b"k"), MemGetResult::Deleted);
    }

    #[test]
    fn test_memtable_merge_fold() {
        let mut mem = MemTable::new(ucmp(), 1 << 20);
        apply_batch(&mut mem, 1, |b| b.merge(b"k", b"a").unwrap());
        apply_batch(&mut mem, 2, |b| b.merge(b"k", b"b").unwrap());
        apply_batch(&mut mem, 3, |b| b.merge(b"k", b"c").unwrap());
        assert_eq!(lookup(&mem, b"k"), MemGetResult::Merged(b"abc".to_vec()));

        // A merge history with a SET base resolves fully.
        apply_batch(&mut mem, 4, |b| b.set(b"m", b"x").unwrap());
        apply_batch(&mut mem, 5, |b| b.merge(b"m", b"y").unwrap());
        assert_eq!(lookup(&mem, b"m"), MemGetResult::Value(b"xy".to_vec()));

        // A merge history cut off by a deletion also resolves fully.
        apply_batch(&mut mem, 6, |b| b.delete(b"d").unwrap());
        apply_batch(&mut mem, 7, |b| b.merge(b"d", b"z").unwrap());
        assert_eq!(lookup(&mem, b"d"), MemGetResult::Value(b"z".to_vec()));
    }

    #[test]
    fn test_memtable_prepare_arena_full() {
        let mut mem = MemTable::new(ucmp(), 3 * mem_entry_size(1, 8));
        let mut big = Batch::new();
        big.set(b"a", b"12345678").unwrap();
        big.set(b"b", b"12345678").unwrap();
        mem.prepare(&big).unwrap();
        mem.apply(&big, 1).unwrap();
        mem.unref();

        let mut more = Batch::new();
        more.set(b"c", b"12345678").unwrap();
        more.set(b"d", b"12345678").unwrap();
        assert_eq!(
            mem.prepare(&more).err().unwrap().code,
            StatusCode::ArenaFull
        );

        // An oversized batch is still accepted by an empty memtable.
        let mut fresh = MemTable::new(ucmp(), 8);
        fresh.prepare(&big).unwrap();
        fresh.apply(&big, 10).unwrap();
        fresh.unref();
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn test_memtable_iterates_internal_order() {
        let mut mem = MemTable::new(ucmp(), 1 << 20);
        apply_batch(&mut mem, 1, |b| b.set(b"a", b"1").unwrap());
        apply_batch(&mut mem, 2, |b| b.set(b"a", b"2").unwrap());
        apply_batch(&mut mem, 3, |b| b.set(b"b", b"1").unwrap());

        let mut it = mem.new_iter();
        it.first();
        let mut got = vec![];
        while it.valid() {
            let (k, v) = current_key_val(&it).unwrap();
            let (ukey, seq, _) = ikey::parse_internal_key(&k).map(|(u, s, k2)| (u.to_vec(), s, k2)).unwrap();
            got.push((ukey, seq, v));
            it.next();
        }
        // Same user key: newer sequence numbers first.
        assert_eq!(
            got,
            vec![
                (b"a".to_vec(), 2, b"2".to_vec()),
                (b"a".to_vec(), 1, b"1".to_vec()),
                (b"b".to_vec(), 3, b"1".to_vec()),
            ]
        );
    }

    #[test]
    fn test_memtable_thousand_entries() {
        let mut mem = MemTable::new(ucmp(), 16 << 20);
        for i in 0..1000u64 {
            apply_batch(&mut mem, i + 1, |b| {
                b.set(format!("{:08}", i).as_bytes(), &vec![b'x'; i as usize])
                    .unwrap()
            });
        }
        assert_eq!(mem.len(), 1000);
        for i in (0..1000u64).step_by(97) {
            match lookup(&mem, format!("{:08}", i).as_bytes()) {
                MemGetResult::Value(v) => {
                    assert_eq!(v.len(), i as usize);
                    assert!(v.iter().all(|b| *b == b'x'));
                }
                r => panic!("unexpected result {:?}", r),
            }
        }
    }
}
