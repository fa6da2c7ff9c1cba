//! Per-block filters. A filter block covers a whole table, holding one filter per 2 KiB window of
//! data block offsets:
//!
//! ```text
//! [filter 0, filter 1, ..., offset of filter 0 (u32), offset of filter 1, ...,
//!  offset of the offset array (u32), log2 of the window size (u8)]
//! ```
//!
//! Two consecutive filter offsets may be equal if no data block started in a window.

use crate::filter::BoxedFilterPolicy;

use std::rc::Rc;

use integer_encoding::FixedInt;

const FILTER_BASE_LOG2: u32 = 11;

/// For a given data block offset, the index of the filter covering it.
#[inline]
fn filter_index(offset: usize, base_lg2: u32) -> u32 {
    (offset >> base_lg2 as usize) as u32
}

pub struct FilterBlockBuilder {
    policy: BoxedFilterPolicy,
    // Finished filters, concatenated.
    filters: Vec<u8>,
    filter_offsets: Vec<usize>,

    // Keys of the current window; reset on every start_block().
    keys: Vec<u8>,
    key_offsets: Vec<usize>,
}

impl FilterBlockBuilder {
    pub fn new(fp: BoxedFilterPolicy) -> FilterBlockBuilder {
        FilterBlockBuilder {
            policy: fp,
            filters: Vec::with_capacity(1024),
            filter_offsets: Vec::with_capacity(1024),
            key_offsets: Vec::with_capacity(1024),
            keys: Vec::with_capacity(1024),
        }
    }

    pub fn size_estimate(&self) -> usize {
        self.filters.len() + 4 * self.filter_offsets.len() + 4 + 1
    }

    pub fn filter_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.key_offsets.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    /// Called when a data block starts at `offset`; emits the filters of all completed windows.
    pub fn start_block(&mut self, offset: usize) {
        let filter_ix = filter_index(offset, FILTER_BASE_LOG2);
        assert!(filter_ix >= self.filter_offsets.len() as u32);

        while filter_ix > self.filter_offsets.len() as u32 {
            self.generate_filter();
        }
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.filters.len());
        if self.keys.is_empty() {
            return;
        }

        let filter = self.policy.create_filter(&self.keys, &self.key_offsets);
        self.filters.extend_from_slice(&filter);

        self.keys.clear();
        self.key_offsets.clear();
    }

    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate_filter();
        }

        let mut result = self.filters;
        let offsets_offset = result.len();
        let mut ix = result.len();
        result.resize(ix + 4 * self.filter_offsets.len() + 5, 0);

        for offset in self.filter_offsets.into_iter() {
            (offset as u32).encode_fixed(&mut result[ix..ix + 4]).unwrap();
            ix += 4;
        }
        (offsets_offset as u32).encode_fixed(&mut result[ix..ix + 4]).unwrap();
        ix += 4;
        result[ix] = FILTER_BASE_LOG2 as u8;

        result
    }
}

#[derive(Clone)]
pub struct FilterBlockReader {
    policy: BoxedFilterPolicy,
    block: Rc<Vec<u8>>,

    offsets_offset: usize,
    filter_base_lg2: u32,
}

impl FilterBlockReader {
    pub fn new_owned(pol: BoxedFilterPolicy, data: Vec<u8>) -> FilterBlockReader {
        FilterBlockReader::new(pol, Rc::new(data))
    }

    pub fn new(pol: BoxedFilterPolicy, data: Rc<Vec<u8>>) -> FilterBlockReader {
        assert!(data.len() >= 5);

        let fbase = data[data.len() - 1] as u32;
        let offset = u32::decode_fixed(&data[data.len() - 5..data.len() - 1]).unwrap() as usize;

        FilterBlockReader {
            policy: pol,
            block: data,
            filter_base_lg2: fbase,
            offsets_offset: offset,
        }
    }

    /// The number of filters in the block.
    pub fn num(&self) -> u32 {
        ((self.block.len() - self.offsets_offset - 5) / 4) as u32
    }

    fn offset_of(&self, i: u32) -> usize {
        let offset_offset = self.offsets_offset + 4 * i as usize;
        u32::decode_fixed(&self.block[offset_offset..offset_offset + 4]).unwrap() as usize
    }

    /// Whether the key may be present in the data block starting at blk_offset.
    pub fn key_may_match(&self, blk_offset: usize, key: &[u8]) -> bool {
        let ix = filter_index(blk_offset, self.filter_base_lg2);
        if ix >= self.num() {
            return true;
        }

        let filter_begin = self.offset_of(ix);
        let filter_end = if ix + 1 < self.num() {
            self.offset_of(ix + 1)
        } else {
            self.offsets_offset
        };

        if filter_begin == filter_end {
            // No data block started in this window.
            return false;
        }

        assert!(filter_begin < filter_end);
        assert!(filter_end <= self.offsets_offset);

        self.policy
            .key_may_match(key, &self.block[filter_begin..filter_end])
    }
}
