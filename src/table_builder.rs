//! Writes tables: a sequence of compressed data blocks, the filter block(s), a properties block,
//! the metaindex naming the auxiliary blocks, the index block mapping separator keys to data
//! block handles, and the fixed-size footer.
//!
//! Every block on disk is followed by a 5-byte trailer `(compression type, masked crc32c)` where
//! the checksum covers the payload followed by the type byte.

use crate::block::{BlockBuilder, BlockContents};
use crate::blockhandle::BlockHandle;
use crate::cmp::{Comparator, DefaultCmp, InternalKeyCmp};
use crate::error::{err, Result, StatusCode};
use crate::filter::{BoxedFilterPolicy, FilterPolicy, InternalFilterPolicy};
use crate::filter_block::FilterBlockBuilder;
use crate::log::mask_crc;
use crate::options::{CompressionType, FilterType, LevelOptions, Options};
use crate::types::SequenceNumber;

use std::cmp::Ordering;
use std::io::Write;
use std::rc::Rc;

use crc::crc32;
use crc::Hasher32;
use integer_encoding::{FixedInt, VarInt};
use snap::raw::Encoder;

pub const FULL_FOOTER_LENGTH: usize = 53;
pub const BLOCK_TRAILER_SIZE: usize = 5;

const FOOTER_VERSION: u32 = 1;
const CHECKSUM_CRC32C: u8 = 1;
const TABLE_MAGIC: u64 = u64::from_le_bytes(*b"shaletbl");

// Block names in the metaindex.
pub const PROPERTIES_BLOCK_NAME: &str = "rocksdb.properties";
pub const FILTER_BLOCK_PREFIX: &str = "filter.";
pub const FULL_FILTER_BLOCK_PREFIX: &str = "fullfilter.";

// Property keys within the properties block.
pub const PROP_GLOBAL_SEQ_NUM: &[u8] = b"shaledb.global-seq-num";
pub const PROP_NUM_ENTRIES: &[u8] = b"shaledb.num-entries";

/// The fixed-size table footer: checksum type, the metaindex and index handles, zero padding,
/// a format version and the magic number, 53 bytes in total at the end of the file.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub metaindex: BlockHandle,
    pub index: BlockHandle,
}

impl Footer {
    pub fn new(metaindex: BlockHandle, index: BlockHandle) -> Footer {
        Footer { metaindex, index }
    }

    pub fn decode(from: &[u8]) -> Result<Footer> {
        if from.len() < FULL_FOOTER_LENGTH {
            return err(StatusCode::Corruption, "footer is too short");
        }
        if u64::decode_fixed(&from[45..53]).unwrap() != TABLE_MAGIC {
            return err(StatusCode::Corruption, "bad magic number in footer");
        }
        if u32::decode_fixed(&from[41..45]).unwrap() != FOOTER_VERSION {
            return err(StatusCode::Corruption, "unsupported footer version");
        }
        if from[0] != CHECKSUM_CRC32C {
            return err(StatusCode::Corruption, "unsupported checksum type in footer");
        }
        let (metaindex, n) = match BlockHandle::decode(&from[1..41]) {
            Some(d) => d,
            None => return err(StatusCode::Corruption, "bad metaindex handle in footer"),
        };
        let (index, _) = match BlockHandle::decode(&from[1 + n..41]) {
            Some(d) => d,
            None => return err(StatusCode::Corruption, "bad index handle in footer"),
        };
        Ok(Footer { metaindex, index })
    }

    pub fn encode(&self, to: &mut [u8]) {
        assert!(to.len() >= FULL_FOOTER_LENGTH);
        for b in to[..FULL_FOOTER_LENGTH].iter_mut() {
            *b = 0;
        }
        to[0] = CHECKSUM_CRC32C;
        let n = 1 + self.metaindex.encode_to(&mut to[1..41]);
        self.index.encode_to(&mut to[n..41]);
        FOOTER_VERSION.encode_fixed(&mut to[41..45]).unwrap();
        TABLE_MAGIC.encode_fixed(&mut to[45..53]).unwrap();
    }
}

/// Computes a block's on-disk checksum: masked CRC32C over the payload followed by the
/// compression type byte.
pub fn block_checksum(payload: &[u8], compression: u8) -> u32 {
    let mut digest = crc32::Digest::new(crc32::CASTAGNOLI);
    digest.write(payload);
    digest.write(&[compression]);
    mask_crc(digest.sum32())
}

/// Builds a table from internal keys added in ascending order.
pub struct TableBuilder<W: Write> {
    opt: Options,
    level_opt: LevelOptions,
    icmp: Rc<Box<dyn Comparator>>,
    dst: W,

    offset: usize,
    num_entries: usize,

    data_block: Option<BlockBuilder>,
    index_block: BlockBuilder,

    // Per-block filters (FilterType::Block).
    filter_block: Option<FilterBlockBuilder>,
    // Whole-table filter (FilterType::Table): all keys, concatenated and indexed.
    table_filter_policy: Option<BoxedFilterPolicy>,
    table_filter_keys: Vec<u8>,
    table_filter_key_offsets: Vec<usize>,
}

impl<W: Write> TableBuilder<W> {
    pub fn new(opt: Options, level_opt: LevelOptions, dst: W) -> TableBuilder<W> {
        let icmp: Rc<Box<dyn Comparator>> =
            Rc::new(Box::new(InternalKeyCmp(opt.cmp.clone())));

        let mut filter_block = None;
        let mut table_filter_policy = None;
        if let Some(ref policy) = level_opt.filter_policy {
            let wrapped: BoxedFilterPolicy =
                Rc::new(Box::new(InternalFilterPolicy::new(policy.clone())));
            match level_opt.filter_type {
                FilterType::Block => filter_block = Some(FilterBlockBuilder::new(wrapped)),
                FilterType::Table => table_filter_policy = Some(wrapped),
            }
        }

        TableBuilder {
            index_block: BlockBuilder::new(opt.block_restart_interval, icmp.clone()),
            opt,
            level_opt,
            icmp,
            dst,
            offset: 0,
            num_entries: 0,
            data_block: None,
            filter_block,
            table_filter_policy,
            table_filter_keys: Vec::new(),
            table_filter_key_offsets: Vec::new(),
        }
    }

    pub fn entries(&self) -> usize {
        self.num_entries
    }

    /// The size the table would have if finished now, ignoring meta blocks.
    pub fn size_estimate(&self) -> usize {
        let data = self.data_block.as_ref().map_or(0, |b| b.size_estimate());
        self.offset + data + self.index_block.size_estimate() + FULL_FOOTER_LENGTH
    }

    /// Adds an entry. Keys are internal keys and must arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        if let Some(ref db) = self.data_block {
            if db.entries() > 0 {
                assert!(self.icmp.compare(db.last_key(), key) == Ordering::Less);
            }
            if db.size_estimate() > self.opt.block_size {
                self.write_data_block(key)?;
            }
        }

        if self.data_block.is_none() {
            self.data_block = Some(BlockBuilder::new(
                self.opt.block_restart_interval,
                self.icmp.clone(),
            ));
        }

        if let Some(ref mut fb) = self.filter_block {
            fb.add_key(key);
        }
        if self.table_filter_policy.is_some() {
            self.table_filter_key_offsets.push(self.table_filter_keys.len());
            self.table_filter_keys.extend_from_slice(key);
        }

        self.data_block.as_mut().unwrap().add(key, val);
        self.num_entries += 1;
        Ok(())
    }

    /// Writes out the current data block; `next_key` bounds the separator put into the index.
    fn write_data_block(&mut self, next_key: &[u8]) -> Result<()> {
        let block = self.data_block.take().unwrap();
        let sep = self.icmp.find_shortest_sep(block.last_key(), next_key);
        let handle = self.write_block(block.finish(), self.opt.compression)?;
        self.index_block.add(&sep, &handle.encode());
        if let Some(ref mut fb) = self.filter_block {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    /// Compresses and writes a block, returning its handle.
    fn write_block(
        &mut self,
        contents: BlockContents,
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        let payload = match compression {
            CompressionType::None => contents,
            CompressionType::Snappy => Encoder::new()
                .compress_vec(&contents)
                .map_err(|e| {
                    crate::error::Status::new(StatusCode::IOError, &e.to_string())
                })?,
        };
        self.write_block_raw(&payload, compression as u8)
    }

    fn write_block_raw(&mut self, payload: &[u8], compression: u8) -> Result<BlockHandle> {
        let crc = block_checksum(payload, compression);

        self.dst.write_all(payload)?;
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = compression;
        crc.encode_fixed(&mut trailer[1..]).unwrap();
        self.dst.write_all(&trailer)?;

        let handle = BlockHandle::new(self.offset, payload.len());
        self.offset += payload.len() + BLOCK_TRAILER_SIZE;
        Ok(handle)
    }

    /// Writes all remaining blocks and the footer. Returns the final table size and the
    /// destination, so the caller can sync it.
    pub fn finish(mut self) -> Result<(usize, W)> {
        // Flush the last data block; its index separator only needs to be greater than every key
        // in it.
        if let Some(db) = self.data_block.take() {
            if db.entries() > 0 {
                let succ = self.icmp.find_short_succ(db.last_key());
                let handle = self.write_block(db.finish(), self.opt.compression)?;
                self.index_block.add(&succ, &handle.encode());
            }
        }

        let mut meta_entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

        // Filter blocks are stored uncompressed.
        if let Some(fb) = self.filter_block.take() {
            let name = format!("{}{}", FILTER_BLOCK_PREFIX, fb.filter_name());
            let handle = self.write_block_raw(&fb.finish(), CompressionType::None as u8)?;
            meta_entries.push((name.into_bytes(), handle.encode()));
        }
        if let Some(policy) = self.table_filter_policy.take() {
            if !self.table_filter_key_offsets.is_empty() {
                let keys = std::mem::take(&mut self.table_filter_keys);
                let offsets = std::mem::take(&mut self.table_filter_key_offsets);
                let filter = policy.create_filter(&keys, &offsets);
                let name = format!("{}{}", FULL_FILTER_BLOCK_PREFIX, policy.name());
                let handle = self.write_block_raw(&filter, CompressionType::None as u8)?;
                meta_entries.push((name.into_bytes(), handle.encode()));
            }
        }

        // Properties block.
        let raw_cmp: Rc<Box<dyn Comparator>> = Rc::new(Box::new(DefaultCmp));
        let mut props = BlockBuilder::new(1, raw_cmp.clone());
        props.add(PROP_GLOBAL_SEQ_NUM, &(0 as SequenceNumber).encode_var_vec());
        props.add(PROP_NUM_ENTRIES, &(self.num_entries as u64).encode_var_vec());
        let handle = self.write_block(props.finish(), CompressionType::None)?;
        meta_entries.push((PROPERTIES_BLOCK_NAME.as_bytes().to_vec(), handle.encode()));

        // Metaindex block, entries sorted by name.
        meta_entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut metaindex = BlockBuilder::new(self.opt.block_restart_interval, raw_cmp);
        for (name, handle) in &meta_entries {
            metaindex.add(name, handle);
        }
        let metaindex_handle = self.write_block(metaindex.finish(), CompressionType::None)?;

        // Index block and footer.
        let index_contents = std::mem::replace(
            &mut self.index_block,
            BlockBuilder::new(1, Rc::new(Box::new(DefaultCmp))),
        )
        .finish();
        let index_handle = self.write_block(index_contents, self.opt.compression)?;

        let mut buf = [0u8; FULL_FOOTER_LENGTH];
        Footer::new(metaindex_handle, index_handle).encode(&mut buf);
        self.dst.write_all(&buf)?;
        self.offset += FULL_FOOTER_LENGTH;
        self.dst.flush()?;

        Ok((self.offset, self.dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_roundtrip() {
        let f = Footer::new(BlockHandle::new(44, 4), BlockHandle::new(55, 5));
        let mut buf = [0u8; FULL_FOOTER_LENGTH];
        f.encode(&mut buf);

        let f2 = Footer::decode(&buf).unwrap();
        assert_eq!(f2.metaindex.offset(), 44);
        assert_eq!(f2.metaindex.size(), 4);
        assert_eq!(f2.index.offset(), 55);
        assert_eq!(f2.index.size(), 5);
    }

    #[test]
    fn test_footer_rejects_garbage() {
        let f = Footer::new(BlockHandle::new(44, 4), BlockHandle::new(55, 5));
        let mut buf = [0u8; FULL_FOOTER_LENGTH];
        f.encode(&mut buf);

        let mut bad_magic = buf;
        bad_magic[50] ^= 0xff;
        assert!(Footer::decode(&bad_magic).is_err());

        let mut bad_version = buf;
        bad_version[41] = 9;
        assert!(Footer::decode(&bad_version).is_err());

        let mut bad_checksum_type = buf;
        bad_checksum_type[0] = 7;
        assert!(Footer::decode(&bad_checksum_type).is_err());

        assert!(Footer::decode(&buf[..20]).is_err());
    }

    // Building and reading whole tables is exercised in table_reader.
}
