//! Table blocks: sequences of key/value entries with prefix compression and restart points.
//!
//! An entry is `[varint shared, varint non_shared, varint value_len, key delta, value]`, where
//! `shared` is the length of the prefix shared with the previous key. Every N entries the full
//! key is stored (`shared == 0`) and the entry's offset is recorded in the restart array at the
//! end of the block: `[restart offsets (u32 each), restart count (u32)]`. Seeks binary-search the
//! restart array and scan linearly from the closest restart.
//!
//! Data and index blocks hold internal keys; the metaindex and properties blocks hold raw keys
//! and use a raw comparator with no sequence-number stamping.

use crate::cmp::Comparator;
use crate::error::{err, Result, Status, StatusCode};
use crate::ikey;
use crate::types::{InternalIterator, SequenceNumber};

use std::cmp::Ordering;
use std::rc::Rc;

use integer_encoding::{FixedInt, VarInt, VarIntReader};

pub type BlockContents = Vec<u8>;

/// Reads a varint off the front of src, returning the value and its encoded length.
fn read_varint_at(src: &[u8]) -> Option<(u64, usize)> {
    let mut r: &[u8] = src;
    match (&mut r).read_varint::<u64>() {
        Ok(v) => Some((v, src.len() - r.len())),
        Err(_) => None,
    }
}

/// An immutable block and the comparator governing its keys. Cloning is cheap; the contents are
/// shared.
#[derive(Clone)]
pub struct Block {
    block: Rc<BlockContents>,
    cmp: Rc<Box<dyn Comparator>>,
    global_seq_num: SequenceNumber,
}

impl Block {
    pub fn new(
        contents: BlockContents,
        cmp: Rc<Box<dyn Comparator>>,
        global_seq_num: SequenceNumber,
    ) -> Result<Block> {
        if contents.len() < 4 {
            return err(StatusCode::Corruption, "block is too short for a restart count");
        }
        let b = Block {
            block: Rc::new(contents),
            cmp,
            global_seq_num,
        };
        if b.num_restarts() == 0 {
            return err(StatusCode::Corruption, "block has no restart points");
        }
        if 4 * (1 + b.num_restarts()) > b.block.len() {
            return err(StatusCode::Corruption, "block restart array is out of bounds");
        }
        Ok(b)
    }

    fn num_restarts(&self) -> usize {
        u32::decode_fixed(&self.block[self.block.len() - 4..]).unwrap() as usize
    }

    fn restarts_off(&self) -> usize {
        self.block.len().saturating_sub(4 * (1 + self.num_restarts()))
    }

    pub fn iter(&self) -> BlockIter {
        BlockIter {
            block: self.block.clone(),
            cmp: self.cmp.clone(),
            global_seq_num: self.global_seq_num,
            restarts_off: self.restarts_off(),
            num_restarts: self.num_restarts(),
            offset: 0,
            next_offset: 0,
            key: Vec::new(),
            val: Vec::new(),
            valid: false,
            cached: Vec::new(),
            err: None,
        }
    }
}

struct CachedEntry {
    offset: usize,
    key: Vec<u8>,
    val: Vec<u8>,
}

/// An iterator over one block. Reverse iteration scans forward from the nearest restart point,
/// caching the entries it passes; stepping back repeatedly within one restart window pops from
/// that cache.
pub struct BlockIter {
    block: Rc<BlockContents>,
    cmp: Rc<Box<dyn Comparator>>,
    global_seq_num: SequenceNumber,

    restarts_off: usize,
    num_restarts: usize,

    // Offset of the current entry and of the one following it.
    offset: usize,
    next_offset: usize,
    key: Vec<u8>,
    val: Vec<u8>,
    valid: bool,

    cached: Vec<CachedEntry>,
    err: Option<Status>,
}

impl BlockIter {
    fn corrupt(&mut self, msg: &str) {
        self.valid = false;
        self.err = Some(Status::new(StatusCode::Corruption, msg));
    }

    fn restart_point(&self, ix: usize) -> usize {
        u32::decode_fixed(&self.block[self.restarts_off + 4 * ix..self.restarts_off + 4 * ix + 4]).unwrap()
            as usize
    }

    /// Decodes the full key stored at a restart point without touching the iterator state.
    fn key_at_restart(&self, ix: usize) -> Option<&[u8]> {
        let off = self.restart_point(ix);
        let src = &self.block[off..self.restarts_off];
        // shared is 0 at a restart point and occupies one byte.
        let (shared, n0) = read_varint_at(src)?;
        if shared != 0 {
            return None;
        }
        let (non_shared, n1) = read_varint_at(&src[n0..])?;
        let (_, n2) = read_varint_at(&src[n0 + n1..])?;
        let start = n0 + n1 + n2;
        if start + non_shared as usize > src.len() {
            return None;
        }
        Some(&src[start..start + non_shared as usize])
    }

    /// Decodes the entry at self.offset, using self.key as the prefix state. Sets next_offset.
    fn read_entry(&mut self) -> bool {
        let src = &self.block[self.offset..self.restarts_off];
        let hdr = (|| {
            let (shared, n0) = read_varint_at(src)?;
            let (non_shared, n1) = read_varint_at(&src[n0..])?;
            let (val_len, n2) = read_varint_at(&src[n0 + n1..])?;
            Some((shared as usize, non_shared as usize, val_len as usize, n0 + n1 + n2))
        })();
        let (shared, non_shared, val_len, hdr_len) = match hdr {
            Some(h) => h,
            None => {
                self.corrupt("truncated entry header");
                return false;
            }
        };
        if shared > self.key.len() || hdr_len + non_shared + val_len > src.len() {
            self.corrupt("entry exceeds block bounds");
            return false;
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&src[hdr_len..hdr_len + non_shared]);
        self.val.clear();
        self.val
            .extend_from_slice(&src[hdr_len + non_shared..hdr_len + non_shared + val_len]);
        self.next_offset = self.offset + hdr_len + non_shared + val_len;

        if self.global_seq_num != 0 && self.key.len() >= 8 {
            // Keys of an ingested table are written with sequence number zero and stamped with
            // the table-wide sequence number when read.
            let kind = ikey::kind(&self.key);
            let n = self.key.len() - 8;
            self.key.truncate(n);
            let mut tr = [0u8; 8];
            ikey::trailer(self.global_seq_num, kind).encode_fixed(&mut tr).unwrap();
            self.key.extend_from_slice(&tr);
        }
        true
    }

    fn clear_cache(&mut self) {
        self.cached.clear();
    }

    fn cache_entry(&mut self) {
        self.cached.push(CachedEntry {
            offset: self.offset,
            key: self.key.clone(),
            val: self.val.clone(),
        });
    }

    /// Positions at the restart-anchored entry `ix` and scans forward while `pred` holds.
    fn scan_from_restart<F: FnMut(&[u8]) -> bool>(&mut self, ix: usize, mut pred: F) {
        self.offset = self.restart_point(ix);
        self.key.clear();
        self.valid = true;
        loop {
            if self.offset >= self.restarts_off {
                self.valid = false;
                return;
            }
            if !self.read_entry() {
                return;
            }
            if !pred(&self.key) {
                return;
            }
            self.offset = self.next_offset;
        }
    }
}

impl InternalIterator for BlockIter {
    fn seek_ge(&mut self, target: &[u8]) {
        if self.err.is_some() {
            return;
        }
        self.clear_cache();

        // The smallest restart whose anchored key is > target; the scan starts one before it.
        let mut left = 0;
        let mut right = self.num_restarts;
        while left < right {
            let mid = (left + right) / 2;
            match self.key_at_restart(mid) {
                None => {
                    self.corrupt("bad restart-anchored key");
                    return;
                }
                Some(k) => {
                    if self.cmp.compare(target, k) == Ordering::Less {
                        right = mid;
                    } else {
                        left = mid + 1;
                    }
                }
            }
        }
        let start = left.saturating_sub(1);

        let cmp = self.cmp.clone();
        let mut found = false;
        self.scan_from_restart(start, |key| {
            if cmp.compare(key, target) >= Ordering::Equal {
                found = true;
                false
            } else {
                true
            }
        });
        if !found {
            self.valid = false;
        }
    }

    fn seek_lt(&mut self, target: &[u8]) {
        if self.err.is_some() {
            return;
        }
        self.seek_ge(target);
        if self.valid {
            self.prev();
        } else if self.err.is_none() {
            // Everything in the block is smaller than the target.
            self.last();
        }
    }

    fn first(&mut self) {
        if self.err.is_some() {
            return;
        }
        self.clear_cache();
        if self.restarts_off == 0 {
            self.valid = false;
            return;
        }
        self.offset = 0;
        self.key.clear();
        self.valid = self.read_entry();
    }

    fn last(&mut self) {
        if self.err.is_some() {
            return;
        }
        if self.restarts_off == 0 {
            self.valid = false;
            return;
        }
        // Scan forward from the last restart, caching for subsequent prev() calls.
        self.clear_cache();
        self.offset = self.restart_point(self.num_restarts - 1);
        self.key.clear();
        self.valid = true;
        loop {
            if !self.read_entry() {
                return;
            }
            self.cache_entry();
            if self.next_offset >= self.restarts_off {
                return;
            }
            self.offset = self.next_offset;
        }
    }

    fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if !self.valid {
            self.first();
            return self.valid;
        }
        if self.next_offset >= self.restarts_off {
            self.valid = false;
            return false;
        }
        self.offset = self.next_offset;
        self.valid = self.read_entry();
        self.valid
    }

    fn prev(&mut self) -> bool {
        if self.err.is_some() || !self.valid {
            return false;
        }

        // Happy path: the predecessor is cached from a previous forward scan.
        if self.cached.len() >= 2 && self.cached[self.cached.len() - 1].offset == self.offset {
            self.cached.pop();
            let e = self.cached.last().unwrap();
            self.next_offset = self.offset;
            self.offset = e.offset;
            self.key.clear();
            self.key.extend_from_slice(&e.key);
            self.val.clear();
            self.val.extend_from_slice(&e.val);
            return true;
        }

        if self.offset == 0 {
            self.valid = false;
            self.clear_cache();
            return false;
        }

        // Find the restart window containing the current entry and scan up to it, caching
        // everything on the way.
        let target_offset = self.offset;
        let mut ix = self.num_restarts - 1;
        while ix > 0 && self.restart_point(ix) >= target_offset {
            ix -= 1;
        }

        self.clear_cache();
        self.offset = self.restart_point(ix);
        self.key.clear();
        self.valid = true;
        loop {
            if !self.read_entry() {
                return false;
            }
            self.cache_entry();
            if self.next_offset >= target_offset {
                return true;
            }
            self.offset = self.next_offset;
        }
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool {
        if !self.valid {
            return false;
        }
        key.clear();
        key.extend_from_slice(&self.key);
        val.clear();
        val.extend_from_slice(&self.val);
        true
    }

    fn status(&mut self) -> Result<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builds a block in the on-disk format; the caller appends the compression trailer.
pub struct BlockBuilder {
    restart_interval: usize,
    cmp: Rc<Box<dyn Comparator>>,

    buffer: Vec<u8>,
    restarts: Vec<u32>,
    entries: usize,
    restart_counter: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize, cmp: Rc<Box<dyn Comparator>>) -> BlockBuilder {
        assert!(restart_interval > 0);
        BlockBuilder {
            restart_interval,
            cmp,
            buffer: Vec::new(),
            restarts: vec![0],
            entries: 0,
            restart_counter: 0,
            last_key: Vec::new(),
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + 4 * self.restarts.len() + 4
    }

    pub fn add(&mut self, key: &[u8], val: &[u8]) {
        assert!(self.restart_counter <= self.restart_interval);
        assert!(
            self.buffer.is_empty()
                || self.cmp.compare(&self.last_key, key) == Ordering::Less
        );

        let mut shared = 0;
        if self.restart_counter < self.restart_interval {
            let small = self.last_key.len().min(key.len());
            while shared < small && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.restart_counter = 0;
        }

        let non_shared = key.len() - shared;
        let mut buf = [0u8; 10];
        for v in [shared as u64, non_shared as u64, val.len() as u64] {
            let n = v.encode_var(&mut buf);
            self.buffer.extend_from_slice(&buf[..n]);
        }
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(val);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entries += 1;
        self.restart_counter += 1;
    }

    pub fn finish(mut self) -> BlockContents {
        // Append the restart array and its length.
        self.buffer.reserve(4 * self.restarts.len() + 4);
        for r in &self.restarts {
            self.buffer.extend_from_slice(&r.encode_fixed_vec());
        }
        self.buffer
            .extend_from_slice(&(self.restarts.len() as u32).encode_fixed_vec());
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::DefaultCmp;
    use crate::types::current_key_val;

    fn raw_cmp() -> Rc<Box<dyn Comparator>> {
        Rc::new(Box::new(DefaultCmp))
    }

    fn test_entries() -> Vec<(Vec<u8>, Vec<u8>)> {
        // Shared prefixes exercise the delta encoding; > 3 entries exercise restarts with a
        // small interval.
        ["key1", "key2", "key3", "prefix_a", "prefix_b", "prefix_c", "z"]
            .iter()
            .enumerate()
            .map(|(i, k)| (k.as_bytes().to_vec(), format!("val{}", i).into_bytes()))
            .collect()
    }

    fn build_block(entries: &[(Vec<u8>, Vec<u8>)], restart_interval: usize) -> Block {
        let mut b = BlockBuilder::new(restart_interval, raw_cmp());
        for (k, v) in entries {
            b.add(k, v);
        }
        Block::new(b.finish(), raw_cmp(), 0).unwrap()
    }

    #[test]
    fn test_block_forward_iteration() {
        let entries = test_entries();
        for interval in [1, 3, 16] {
            let block = build_block(&entries, interval);
            let mut it = block.iter();
            it.first();
            for want in &entries {
                assert!(it.valid());
                let (k, v) = current_key_val(&it).unwrap();
                assert_eq!((k, v), *want);
                it.next();
            }
            assert!(!it.valid());
        }
    }

    #[test]
    fn test_block_reverse_iteration() {
        let entries = test_entries();
        for interval in [1, 3, 16] {
            let block = build_block(&entries, interval);
            let mut it = block.iter();
            it.last();
            for want in entries.iter().rev() {
                assert!(it.valid(), "interval {}", interval);
                let (k, v) = current_key_val(&it).unwrap();
                assert_eq!((k, v), *want);
                it.prev();
            }
            assert!(!it.valid());
        }
    }

    #[test]
    fn test_block_seek_ge() {
        let entries = test_entries();
        let block = build_block(&entries, 3);
        let mut it = block.iter();

        it.seek_ge(b"key2");
        assert_eq!(current_key_val(&it).unwrap().0, b"key2".to_vec());
        it.seek_ge(b"key21");
        assert_eq!(current_key_val(&it).unwrap().0, b"key3".to_vec());
        it.seek_ge(b"a");
        assert_eq!(current_key_val(&it).unwrap().0, b"key1".to_vec());
        it.seek_ge(b"zz");
        assert!(!it.valid());
    }

    #[test]
    fn test_block_seek_lt() {
        let entries = test_entries();
        let block = build_block(&entries, 3);
        let mut it = block.iter();

        it.seek_lt(b"key2");
        assert_eq!(current_key_val(&it).unwrap().0, b"key1".to_vec());
        it.seek_lt(b"key1");
        assert!(!it.valid());
        it.seek_lt(b"zzz");
        assert_eq!(current_key_val(&it).unwrap().0, b"z".to_vec());
        it.seek_lt(b"prefix_b");
        assert_eq!(current_key_val(&it).unwrap().0, b"prefix_a".to_vec());
    }

    #[test]
    fn test_block_mixed_directions() {
        let entries = test_entries();
        let block = build_block(&entries, 2);
        let mut it = block.iter();

        it.seek_ge(b"prefix_b");
        assert!(it.prev());
        assert_eq!(current_key_val(&it).unwrap().0, b"prefix_a".to_vec());
        assert!(it.next());
        assert_eq!(current_key_val(&it).unwrap().0, b"prefix_b".to_vec());
        assert!(it.prev());
        assert!(it.prev());
        assert_eq!(current_key_val(&it).unwrap().0, b"key3".to_vec());
    }

    #[test]
    fn test_block_corrupt_restart_count() {
        assert!(Block::new(vec![0, 0], raw_cmp(), 0).is_err());
        assert!(Block::new(vec![0, 0, 0, 0], raw_cmp(), 0).is_err());
    }

    #[test]
    fn test_block_global_seq_num_stamping() {
        use crate::cmp::InternalKeyCmp;
        use crate::ikey::{make_internal_key, parse_internal_key, KIND_SET};

        let icmp: Rc<Box<dyn Comparator>> =
            Rc::new(Box::new(InternalKeyCmp(Rc::new(Box::new(DefaultCmp)))));
        let mut b = BlockBuilder::new(16, icmp.clone());
        b.add(&make_internal_key(b"one", 0, KIND_SET), b"1");
        b.add(&make_internal_key(b"two", 0, KIND_SET), b"2");

        let block = Block::new(b.finish(), icmp, 99).unwrap();
        let mut it = block.iter();
        it.first();
        let (k, _) = current_key_val(&it).unwrap();
        let (ukey, seq, kind) = parse_internal_key(&k).unwrap();
        assert_eq!(ukey, b"one");
        assert_eq!(seq, 99);
        assert_eq!(kind, KIND_SET);
    }
}
