//! Batches stage a sequence of mutations that commit atomically. A batch's buffer doubles as its
//! wire format, written to the write-ahead log as a single record:
//!
//! ```text
//! [seq_num: u64 LE] [count: u32 LE]
//! count * [kind: u8, varstr user_key, (varstr value)]
//! ```
//!
//! where the value is present iff the kind is SET, MERGE or RANGE_DELETE. The sequence number is
//! zero until the commit path stamps it; a count of 0xffffffff marks a batch that overflowed and
//! is permanently invalid.
//!
//! An indexed batch additionally maintains a skiplist keyed by entry offsets, resolving offsets
//! to user keys through the shared buffer. Equal user keys order newest insertion first.

use crate::cmp::Comparator;
use crate::error::{err, Result, Status, StatusCode};
use crate::ikey::{self, KIND_DELETE, KIND_MERGE, KIND_RANGE_DELETE, KIND_SET};
use crate::memtable::mem_entry_size;
use crate::skipmap::{SkipMap, SkipMapIter};
use crate::types::{InternalIterator, SequenceNumber, SEQ_NUM_BATCH};

use std::cell::{Ref, RefCell};
use std::cmp::Ordering;
use std::rc::Rc;

use integer_encoding::{FixedInt, VarInt, VarIntReader};

pub const BATCH_HEADER_LEN: usize = 12;
const INVALID_BATCH_COUNT: u32 = u32::MAX;

// Tag bytes distinguishing the two key encodings inside a batch index: entries are tagged
// offsets into the batch buffer, search keys are tagged raw user keys.
const INDEX_KEY_OFFSET: u8 = 1;
const INDEX_KEY_SEARCH: u8 = 0;

fn offset_index_key(offset: u32) -> Vec<u8> {
    let mut key = vec![INDEX_KEY_OFFSET];
    key.extend_from_slice(&offset.encode_fixed_vec());
    key
}

fn search_index_key(user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + user_key.len());
    key.push(INDEX_KEY_SEARCH);
    key.extend_from_slice(user_key);
    key
}

/// Decodes the entry at `offset` into (kind, user key, value). The value is empty for DELETE.
fn decode_entry_at(data: &[u8], offset: usize) -> Option<(u8, &[u8], &[u8])> {
    let mut r: &[u8] = data.get(offset..)?;
    if r.is_empty() {
        return None;
    }
    let kind = r[0];
    if !ikey::valid_kind(kind) {
        return None;
    }
    r = &r[1..];

    let klen = (&mut r).read_varint::<u64>().ok()? as usize;
    if klen > r.len() {
        return None;
    }
    let (key, mut r) = r.split_at(klen);

    let val = match kind {
        KIND_SET | KIND_MERGE | KIND_RANGE_DELETE => {
            let vlen = (&mut r).read_varint::<u64>().ok()? as usize;
            if vlen > r.len() {
                return None;
            }
            &r[..vlen]
        }
        _ => &[][..],
    };
    Some((kind, key, val))
}

/// Orders batch index keys: by the user key the offset resolves to, ties by offset descending so
/// later insertions sort first. A tagged raw search key sorts before all entries with the same
/// user key.
struct BatchIndexCmp {
    data: Rc<RefCell<Vec<u8>>>,
    cmp: Rc<Box<dyn Comparator>>,
}

impl BatchIndexCmp {
    fn resolve<'a>(&self, data: &'a [u8], index_key: &'a [u8]) -> (&'a [u8], Option<u32>) {
        match index_key[0] {
            INDEX_KEY_SEARCH => (&index_key[1..], None),
            _ => {
                let offset = u32::decode_fixed(&index_key[1..5]).unwrap();
                let (_, ukey, _) =
                    decode_entry_at(data, offset as usize).expect("corrupt batch entry");
                (ukey, Some(offset))
            }
        }
    }
}

impl Comparator for BatchIndexCmp {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let data = self.data.borrow();
        let (ka, oa) = self.resolve(&data, a);
        let (kb, ob) = self.resolve(&data, b);
        match self.cmp.compare(ka, kb) {
            Ordering::Equal => match (oa, ob) {
                (Some(oa), Some(ob)) => ob.cmp(&oa),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            o => o,
        }
    }

    fn name(&self) -> &'static str {
        self.cmp.name()
    }

    fn find_shortest_sep(&self, _: &[u8], _: &[u8]) -> Vec<u8> {
        panic!("find* functions are invalid on BatchIndexCmp");
    }

    fn find_short_succ(&self, _: &[u8]) -> Vec<u8> {
        panic!("find* functions are invalid on BatchIndexCmp");
    }

    fn inline_key(&self, key: &[u8]) -> u64 {
        let data = self.data.borrow();
        let (ukey, _) = self.resolve(&data, key);
        self.cmp.inline_key(ukey)
    }
}

/// A sequence of SETs, MERGEs and DELETEs applied atomically.
pub struct Batch {
    data: Rc<RefCell<Vec<u8>>>,
    cmp: Rc<Box<dyn Comparator>>,
    index: Option<SkipMap>,
    mem_size: usize,
}

impl Batch {
    pub fn new() -> Batch {
        Batch {
            data: Rc::new(RefCell::new(Vec::new())),
            cmp: Rc::new(Box::new(crate::cmp::DefaultCmp)),
            index: None,
            mem_size: 0,
        }
    }

    /// A batch that additionally maintains an index over its entries, enabling `get` and
    /// `new_iter`.
    pub fn new_indexed(cmp: Rc<Box<dyn Comparator>>) -> Batch {
        let data = Rc::new(RefCell::new(Vec::new()));
        let index_cmp: Rc<Box<dyn Comparator>> = Rc::new(Box::new(BatchIndexCmp {
            data: data.clone(),
            cmp: cmp.clone(),
        }));
        Batch {
            data,
            cmp,
            index: Some(SkipMap::new(index_cmp)),

            mem_size: 0,
        }
    }

    pub fn indexed(&self) -> bool {
        self.index.is_some()
    }

    /// The number of entries.
    pub fn count(&self) -> u32 {
        let data = self.data.borrow();
        if data.len() < BATCH_HEADER_LEN {
            return 0;
        }
        u32::decode_fixed(&data[8..12]).unwrap()
    }

    pub fn seq_num(&self) -> SequenceNumber {
        let data = self.data.borrow();
        if data.len() < BATCH_HEADER_LEN {
            return 0;
        }
        u64::decode_fixed(&data[0..8]).unwrap()
    }

    /// Stamps the sequence number of the batch's first entry; done by the commit path.
    pub fn set_seq_num(&mut self, seq: SequenceNumber) {
        let mut data = self.data.borrow_mut();
        assert!(data.len() >= BATCH_HEADER_LEN);
        seq.encode_fixed(&mut data[0..8]).unwrap();
    }

    /// The approximate memtable space the batch will occupy when applied.
    pub fn mem_size(&self) -> usize {
        self.mem_size
    }

    /// The batch's wire representation, borrowed from the shared buffer.
    pub fn repr(&self) -> Ref<'_, Vec<u8>> {
        self.data.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.data.borrow().len() <= BATCH_HEADER_LEN
    }

    /// Replaces the batch contents with a wire-format buffer, e.g. one replayed from the log.
    /// Rebuilds the index if the batch is indexed.
    pub fn set_contents(&mut self, contents: &[u8]) -> Result<()> {
        if contents.len() < BATCH_HEADER_LEN {
            return err(StatusCode::InvalidBatch, "batch is shorter than its header");
        }
        {
            let mut data = self.data.borrow_mut();
            data.clear();
            data.extend_from_slice(contents);
        }
        if self.index.is_some() {
            self.reindex(BATCH_HEADER_LEN)?;
        }
        self.refresh_mem_size()?;
        Ok(())
    }

    fn refresh_mem_size(&mut self) -> Result<()> {
        self.mem_size = 0;
        let data = self.data.borrow();
        let mut offset = BATCH_HEADER_LEN;
        for _ in 0..self.count() {
            let (kind, key, val) = match decode_entry_at(&data, offset) {
                Some(e) => e,
                None => return err(StatusCode::InvalidBatch, "corrupt batch entry"),
            };
            self.mem_size += mem_entry_size(key.len(), val.len());
            offset = next_entry_offset(offset, kind, key.len(), val.len());
        }
        Ok(())
    }

    /// Re-adds all entries from `from_offset` on to the index.
    fn reindex(&mut self, from_offset: usize) -> Result<()> {
        let index = self.index.as_ref().unwrap().clone();
        let data = self.data.borrow();
        let mut offset = from_offset;
        while offset < data.len() {
            let (kind, key, val) = match decode_entry_at(&data, offset) {
                Some(e) => e,
                None => return err(StatusCode::InvalidBatch, "corrupt batch entry"),
            };
            index.insert(offset_index_key(offset as u32), Vec::new());
            offset = next_entry_offset(offset, kind, key.len(), val.len());
        }
        Ok(())
    }

    fn init_header(data: &mut Vec<u8>) {
        if data.is_empty() {
            data.resize(BATCH_HEADER_LEN, 0);
        }
    }

    /// Byte-wise increment of the count field. Returns false once the count reaches the invalid
    /// marker, which then stays in place for good.
    fn increment_count(data: &mut [u8]) -> bool {
        let count = &mut data[8..12];
        for b in count.iter_mut() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
        !count.iter().all(|b| *b == 0xff)
    }

    fn append_entry(&mut self, kind: u8, key: &[u8], val: Option<&[u8]>) -> Result<()> {
        let offset;
        {
            let mut data = self.data.borrow_mut();
            Batch::init_header(&mut data);
            if u32::decode_fixed(&data[8..12]).unwrap() == INVALID_BATCH_COUNT {
                return err(StatusCode::InvalidBatch, "batch count overflowed");
            }
            if !Batch::increment_count(&mut data) {
                return err(StatusCode::InvalidBatch, "batch count overflowed");
            }

            offset = data.len();
            data.push(kind);
            let mut buf = [0u8; 10];
            let n = (key.len() as u64).encode_var(&mut buf);
            data.extend_from_slice(&buf[..n]);
            data.extend_from_slice(key);
            if let Some(val) = val {
                let n = (val.len() as u64).encode_var(&mut buf);
                data.extend_from_slice(&buf[..n]);
                data.extend_from_slice(val);
            }
        }

        if let Some(ref index) = self.index {
            index.insert(offset_index_key(offset as u32), Vec::new());
        }
        self.mem_size += mem_entry_size(key.len(), val.map_or(0, |v| v.len()));
        Ok(())
    }

    /// Records a key/value store.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        self.append_entry(KIND_SET, key, Some(val))
    }

    /// Records a merge of `val` into the key's current value.
    pub fn merge(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        self.append_entry(KIND_MERGE, key, Some(val))
    }

    /// Records a deletion.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.append_entry(KIND_DELETE, key, None)
    }

    /// Records a deletion of every key in `[start, end)`.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        self.append_entry(KIND_RANGE_DELETE, start, Some(end))
    }

    /// Appends all entries of another batch.
    pub fn apply_batch(&mut self, other: &Batch) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        let from_offset;
        {
            let other_data = other.data.borrow();
            if other_data.len() < BATCH_HEADER_LEN {
                return err(StatusCode::InvalidBatch, "batch is shorter than its header");
            }
            let mut data = self.data.borrow_mut();
            Batch::init_header(&mut data);
            from_offset = data.len();
            data.extend_from_slice(&other_data[BATCH_HEADER_LEN..]);

            let count = u32::decode_fixed(&data[8..12]).unwrap();
            let (sum, overflow) = count.overflowing_add(other.count());
            if overflow || sum == INVALID_BATCH_COUNT {
                for b in data[8..12].iter_mut() {
                    *b = 0xff;
                }
                return err(StatusCode::InvalidBatch, "batch count overflowed");
            }
            sum.encode_fixed(&mut data[8..12]).unwrap();
        }

        if self.index.is_some() {
            self.reindex(from_offset)?;
        }
        self.mem_size += other.mem_size;
        Ok(())
    }

    /// Looks up the most recently written entry for `key`. The value is empty for a deletion.
    /// Requires an indexed batch.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let index = match self.index {
            Some(ref ix) => ix,
            None => return err(StatusCode::NotIndexed, "batch was built without an index"),
        };

        let mut iter = index.iter();
        iter.seek_ge(&search_index_key(key));

        let (mut ik, mut _iv) = (vec![], vec![]);
        if iter.current(&mut ik, &mut _iv) {
            let data = self.data.borrow();
            let offset = u32::decode_fixed(&ik[1..5]).unwrap() as usize;
            let (_, ukey, val) = match decode_entry_at(&data, offset) {
                Some(e) => e,
                None => return err(StatusCode::InvalidBatch, "corrupt batch entry"),
            };
            if self.cmp.compare(ukey, key) == Ordering::Equal {
                return Ok(Some(val.to_vec()));
            }
        }
        Ok(None)
    }

    /// An iterator over the batch's entries as internal keys, newest first among equal user
    /// keys. Requires an indexed batch.
    pub fn new_iter(&self) -> Result<BatchIter> {
        let index = match self.index {
            Some(ref ix) => ix,
            None => return err(StatusCode::NotIndexed, "batch was built without an index"),
        };
        Ok(BatchIter {
            data: self.data.clone(),
            cmp: self.cmp.clone(),
            iter: index.iter(),
            reverse: false,
            prev_start: index.iter(),
            prev_end: index.iter(),
            err: None,
        })
    }
}

/// Decodes a batch's wire format entry by entry; used by the memtable and write-ahead-log
/// replay.
pub struct BatchReader<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> BatchReader<'a> {
    /// Reads the header of a wire-format buffer. Fails on truncated input or the invalid-count
    /// marker.
    pub fn new(data: &'a [u8]) -> Result<BatchReader<'a>> {
        if data.len() < BATCH_HEADER_LEN {
            return err(StatusCode::InvalidBatch, "batch is shorter than its header");
        }
        let count = u32::decode_fixed(&data[8..12]).unwrap();
        if count == INVALID_BATCH_COUNT {
            return err(StatusCode::InvalidBatch, "batch is marked invalid");
        }
        Ok(BatchReader {
            data,
            offset: BATCH_HEADER_LEN,
            remaining: count,
        })
    }

    pub fn seq_num(&self) -> SequenceNumber {
        u64::decode_fixed(&self.data[0..8]).unwrap()
    }

    pub fn count(&self) -> u32 {
        u32::decode_fixed(&self.data[8..12]).unwrap()
    }

    /// The next (kind, user key, value) triple, or None at the end.
    #[allow(clippy::type_complexity)]
    pub fn next(&mut self) -> Result<Option<(u8, &'a [u8], &'a [u8])>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match decode_entry_at(self.data, self.offset) {
            Some((kind, key, val)) => {
                self.remaining -= 1;
                self.offset = next_entry_offset(self.offset, kind, key.len(), val.len());
                Ok(Some((kind, key, val)))
            }
            None => err(StatusCode::InvalidBatch, "corrupt batch entry"),
        }
    }
}

fn next_entry_offset(offset: usize, kind: u8, klen: usize, vlen: usize) -> usize {
    let mut n = offset + 1 + (klen as u64).required_space() + klen;
    if matches!(kind, KIND_SET | KIND_MERGE | KIND_RANGE_DELETE) {
        n += (vlen as u64).required_space() + vlen;
    }
    n
}

/// Iterates an indexed batch as internal keys. The sequence number of each yielded key is the
/// entry's buffer offset with the batch marker bit set; readers treat such sequence numbers as
/// always visible.
///
/// The index orders equal user keys newest-first, but reverse iteration must yield descending
/// user keys while keeping the newest-first order within each user key. Stepping backwards
/// therefore walks forward within a run of equal user keys and jumps to the start of the
/// previous run at its end; the bounds of the current run are cached in `prev_start`/`prev_end`.
pub struct BatchIter {
    data: Rc<RefCell<Vec<u8>>>,
    cmp: Rc<Box<dyn Comparator>>,
    iter: SkipMapIter,

    reverse: bool,
    prev_start: SkipMapIter,
    prev_end: SkipMapIter,

    err: Option<Status>,
}

impl BatchIter {
    fn entry_at(&self, it: &SkipMapIter) -> Option<(u8, Vec<u8>, Vec<u8>, u32)> {
        let (mut ik, mut iv) = (vec![], vec![]);
        if !it.current(&mut ik, &mut iv) {
            return None;
        }
        let offset = u32::decode_fixed(&ik[1..5]).unwrap();
        let data = self.data.borrow();
        decode_entry_at(&data, offset as usize)
            .map(|(kind, key, val)| (kind, key.to_vec(), val.to_vec(), offset))
    }

    fn entry_at_current(&self) -> Option<(u8, Vec<u8>, Vec<u8>, u32)> {
        self.entry_at(&self.iter)
    }

    fn current_user_key(&self) -> Option<Vec<u8>> {
        self.entry_at_current().map(|(_, key, _, _)| key)
    }

    fn user_key_at(&self, it: &SkipMapIter) -> Option<Vec<u8>> {
        self.entry_at(it).map(|(_, key, _, _)| key)
    }

    fn clear_prev_cache(&mut self) {
        self.reverse = false;
    }

    /// Points prev_start at the newest entry of the current entry's user-key run.
    fn init_prev_start(&mut self, user_key: &[u8]) {
        self.reverse = true;
        self.prev_start = self.iter.clone();
        loop {
            let mut probe = self.prev_start.clone();
            if !probe.prev() {
                break;
            }
            let same = self
                .user_key_at(&probe)
                .map_or(false, |k| self.cmp.compare(&k, user_key) == Ordering::Equal);
            if !same {
                break;
            }
            self.prev_start = probe;
        }
    }

    /// Points prev_end at the oldest entry of the current entry's user-key run.
    fn init_prev_end(&mut self, user_key: &[u8]) {
        self.prev_end = self.iter.clone();
        loop {
            let mut probe = self.prev_end.clone();
            if !probe.next() {
                break;
            }
            let same = self
                .user_key_at(&probe)
                .map_or(false, |k| self.cmp.compare(&k, user_key) == Ordering::Equal);
            if !same {
                break;
            }
            self.prev_end = probe;
        }
    }
}

impl InternalIterator for BatchIter {
    fn seek_ge(&mut self, key: &[u8]) {
        self.clear_prev_cache();
        self.iter.seek_ge(&search_index_key(ikey::user_key(key)));
    }

    fn seek_lt(&mut self, key: &[u8]) {
        self.clear_prev_cache();
        self.iter.seek_lt(&search_index_key(ikey::user_key(key)));
        if self.iter.valid() {
            if let Some(ukey) = self.current_user_key() {
                self.init_prev_start(&ukey);
                self.init_prev_end(&ukey);
                self.iter = self.prev_start.clone();
            }
        }
    }

    fn first(&mut self) {
        self.clear_prev_cache();
        self.iter.first();
    }

    fn last(&mut self) {
        self.clear_prev_cache();
        self.iter.last();
        if self.iter.valid() {
            if let Some(ukey) = self.current_user_key() {
                self.init_prev_start(&ukey);
                self.prev_end = self.iter.clone();
                self.iter = self.prev_start.clone();
            }
        }
    }

    fn next(&mut self) -> bool {
        self.clear_prev_cache();
        self.iter.next()
    }

    fn prev(&mut self) -> bool {
        if !self.iter.valid() {
            // Ran off either end; reverse iteration starts over from the largest user key.
            self.last();
            return self.iter.valid();
        }
        if !self.reverse {
            if let Some(ukey) = self.current_user_key() {
                self.init_prev_start(&ukey);
                self.init_prev_end(&ukey);
            }
        }
        if !self.iter.at_same(&self.prev_end) {
            // Still inside the current user-key run: the next (older) entry comes next in
            // reverse order.
            return self.iter.next();
        }
        self.iter = self.prev_start.clone();
        if !self.iter.prev() {
            self.clear_prev_cache();
            return false;
        }
        self.prev_end = self.iter.clone();
        if let Some(ukey) = self.current_user_key() {
            self.init_prev_start(&ukey);
        }
        self.iter = self.prev_start.clone();
        true
    }

    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool {
        match self.entry_at_current() {
            None => false,
            Some((kind, ukey, v, offset)) => {
                key.clear();
                ikey::append_internal_key(key, &ukey, offset as u64 | SEQ_NUM_BATCH, kind);
                val.clear();
                val.extend_from_slice(&v);
                true
            }
        }
    }

    fn status(&mut self) -> Result<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
