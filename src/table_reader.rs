use crate::block::{Block, BlockContents, BlockIter};
use crate::blockhandle::BlockHandle;
use crate::cache::cache_key;
use crate::cmp::{Comparator, DefaultCmp, InternalKeyCmp};
use crate::env::RandomAccess;
use crate::error::{err, Result, Status, StatusCode};
use crate::filter::{BoxedFilterPolicy, FilterPolicy, InternalFilterPolicy};
use crate::filter_block::FilterBlockReader;
use crate::options::Options;
use crate::table_builder::{
    block_checksum, Footer, BLOCK_TRAILER_SIZE, FILTER_BLOCK_PREFIX, FULL_FILTER_BLOCK_PREFIX,
    FULL_FOOTER_LENGTH, PROPERTIES_BLOCK_NAME, PROP_GLOBAL_SEQ_NUM, PROP_NUM_ENTRIES,
};
use crate::types::{current_key_val, FileNum, InternalIterator, SequenceNumber};

use std::rc::Rc;

use integer_encoding::FixedInt;
use integer_encoding::VarIntReader;
use snap::raw::Decoder;

/// Properties stored in a table's properties block.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableProperties {
    /// When non-zero, every key in the table reads with this sequence number in place of the
    /// zero it was written with (ingested tables).
    pub global_seq_num: SequenceNumber,
    pub num_entries: u64,
}

/// Reads a table footer.
fn read_footer(f: &dyn RandomAccess, size: usize) -> Result<Footer> {
    if size < FULL_FOOTER_LENGTH {
        return err(StatusCode::Corruption, "file is too small for a footer");
    }
    let mut buf = vec![0; FULL_FOOTER_LENGTH];
    if f.read_at(size - FULL_FOOTER_LENGTH, &mut buf)? != FULL_FOOTER_LENGTH {
        return err(StatusCode::Corruption, "short read of footer");
    }
    Footer::decode(&buf)
}

/// Reads a block's payload, verifies the trailer checksum and decompresses.
fn read_block_contents(f: &dyn RandomAccess, location: &BlockHandle) -> Result<BlockContents> {
    let full = location.size() + BLOCK_TRAILER_SIZE;
    let mut buf = vec![0; full];
    if f.read_at(location.offset(), &mut buf)? != full {
        return err(StatusCode::Corruption, "short read of block");
    }

    let compression = buf[location.size()];
    let stored_crc = u32::decode_fixed(&buf[location.size() + 1..]).unwrap();
    if block_checksum(&buf[..location.size()], compression) != stored_crc {
        return err(StatusCode::Corruption, "block checksum mismatch");
    }

    buf.truncate(location.size());
    match compression {
        0 => Ok(buf),
        1 => Decoder::new()
            .decompress_vec(&buf)
            .map_err(|_| Status::new(StatusCode::Corruption, "snappy decompression failed")),
        c => err(
            StatusCode::Corruption,
            &format!("unknown block compression {}", c),
        ),
    }
}

/// An open table file. Clones share the underlying file and decoded index; the table cache hands
/// out clones, and an outstanding clone keeps the reader alive past eviction.
#[derive(Clone)]
pub struct Table {
    file: Rc<Box<dyn RandomAccess>>,
    file_num: FileNum,
    opt: Options,
    icmp: Rc<Box<dyn Comparator>>,

    index_block: Block,
    block_filter: Option<FilterBlockReader>,
    table_filter: Option<(BoxedFilterPolicy, Rc<Vec<u8>>)>,
    pub properties: TableProperties,
}

impl Table {
    pub fn new(
        opt: Options,
        file: Rc<Box<dyn RandomAccess>>,
        size: usize,
        file_num: FileNum,
    ) -> Result<Table> {
        let footer = read_footer(file.as_ref().as_ref(), size)?;

        // The metaindex and its referents hold raw keys, not internal keys.
        let raw_cmp: Rc<Box<dyn Comparator>> = Rc::new(Box::new(DefaultCmp));
        let metaindex = Block::new(
            read_block_contents(file.as_ref().as_ref(), &footer.metaindex)?,
            raw_cmp,
            0,
        )?;

        let properties = Table::read_properties(file.as_ref().as_ref(), &metaindex)?;
        let (block_filter, table_filter) =
            Table::read_filters(file.as_ref().as_ref(), &metaindex, &opt)?;

        let icmp: Rc<Box<dyn Comparator>> = Rc::new(Box::new(InternalKeyCmp(opt.cmp.clone())));
        let index_block = Block::new(
            read_block_contents(file.as_ref().as_ref(), &footer.index)?,
            icmp.clone(),
            properties.global_seq_num,
        )?;

        Ok(Table {
            file,
            file_num,
            opt,
            icmp,
            index_block,
            block_filter,
            table_filter,
            properties,
        })
    }

    fn metaindex_lookup(metaindex: &Block, name: &str) -> Option<BlockHandle> {
        let mut iter = metaindex.iter();
        iter.seek_ge(name.as_bytes());
        if let Some((key, val)) = current_key_val(&iter) {
            if key == name.as_bytes() {
                return BlockHandle::decode(&val).map(|(h, _)| h);
            }
        }
        None
    }

    fn read_properties(f: &dyn RandomAccess, metaindex: &Block) -> Result<TableProperties> {
        let mut props = TableProperties::default();
        let handle = match Table::metaindex_lookup(metaindex, PROPERTIES_BLOCK_NAME) {
            Some(h) => h,
            None => return Ok(props),
        };
        let raw_cmp: Rc<Box<dyn Comparator>> = Rc::new(Box::new(DefaultCmp));
        let block = Block::new(read_block_contents(f, &handle)?, raw_cmp, 0)?;

        let mut iter = block.iter();
        iter.first();
        while iter.valid() {
            if let Some((key, val)) = current_key_val(&iter) {
                let mut r: &[u8] = &val;
                let num = r.read_varint::<u64>().unwrap_or(0);
                if key == PROP_GLOBAL_SEQ_NUM {
                    props.global_seq_num = num;
                } else if key == PROP_NUM_ENTRIES {
                    props.num_entries = num;
                }
            }
            iter.next();
        }
        Ok(props)
    }

    /// Looks for filter blocks under every policy configured for any level, trying the per-block
    /// flavor first, then the whole-table one.
    #[allow(clippy::type_complexity)]
    fn read_filters(
        f: &dyn RandomAccess,
        metaindex: &Block,
        opt: &Options,
    ) -> Result<(
        Option<FilterBlockReader>,
        Option<(BoxedFilterPolicy, Rc<Vec<u8>>)>,
    )> {
        for level_opt in &opt.levels {
            let policy = match &level_opt.filter_policy {
                Some(p) => p,
                None => continue,
            };
            let wrapped: BoxedFilterPolicy =
                Rc::new(Box::new(InternalFilterPolicy::new(policy.clone())));

            let name = format!("{}{}", FILTER_BLOCK_PREFIX, policy.name());
            if let Some(handle) = Table::metaindex_lookup(metaindex, &name) {
                if handle.size() > 0 {
                    let contents = read_block_contents(f, &handle)?;
                    return Ok((Some(FilterBlockReader::new_owned(wrapped, contents)), None));
                }
            }

            let name = format!("{}{}", FULL_FILTER_BLOCK_PREFIX, policy.name());
            if let Some(handle) = Table::metaindex_lookup(metaindex, &name) {
                if handle.size() > 0 {
                    let contents = read_block_contents(f, &handle)?;
                    return Ok((None, Some((wrapped, Rc::new(contents)))));
                }
            }
        }
        Ok((None, None))
    }

    /// Reads a data block, consulting the shared block cache keyed by (file number, offset).
    fn read_block(&self, location: &BlockHandle) -> Result<Block> {
        let key = cache_key(self.file_num, location.offset() as u64);
        if let Some(block) = self.opt.block_cache.borrow_mut().get(&key) {
            return Ok(block.clone());
        }

        let contents = read_block_contents(self.file.as_ref().as_ref(), location)?;
        let block = Block::new(contents, self.icmp.clone(), self.properties.global_seq_num)?;

        self.opt.block_cache.borrow_mut().insert(&key, block.clone());
        Ok(block)
    }

    /// Point lookup for the first entry with key >= `key`. The caller must check that the
    /// returned entry's user key matches, since the next-greater entry is returned for absent
    /// keys sharing a block with present ones.
    pub fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some((policy, data)) = &self.table_filter {
            if !policy.key_may_match(key, data) {
                return Ok(None);
            }
        }

        let mut index_iter = self.index_block.iter();
        index_iter.seek_ge(key);
        let handle = match current_key_val(&index_iter) {
            Some((_, v)) => match BlockHandle::decode(&v) {
                Some((h, _)) => h,
                None => return err(StatusCode::Corruption, "corrupt index entry"),
            },
            None => return Ok(None),
        };

        if let Some(filters) = &self.block_filter {
            if !filters.key_may_match(handle.offset(), key) {
                return Ok(None);
            }
        }

        let block = self.read_block(&handle)?;
        let mut iter = block.iter();
        iter.seek_ge(key);
        if let Some((k, v)) = current_key_val(&iter) {
            return Ok(Some((k, v)));
        }
        // The sought key may sit right past this block's last key; any match would then be the
        // next block's first entry.
        let mut ti = self.iter();
        ti.seek_ge(key);
        Ok(current_key_val(&ti))
    }

    pub fn iter(&self) -> TableIterator {
        TableIterator {
            index: self.index_block.iter(),
            data: None,
            table: self.clone(),
            err: None,
        }
    }
}

/// A two-level iterator: an index block iterator supplies data block handles, a data block
/// iterator supplies entries.
pub struct TableIterator {
    table: Table,
    index: BlockIter,
    data: Option<BlockIter>,
    err: Option<Status>,
}

impl TableIterator {
    /// Loads the data block referenced by the current index entry. Clears the data iterator on
    /// failure.
    fn load_block(&mut self) -> bool {
        self.data = None;
        let (_, val) = match current_key_val(&self.index) {
            Some(kv) => kv,
            None => return false,
        };
        let handle = match BlockHandle::decode(&val) {
            Some((h, _)) => h,
            None => {
                self.err = Some(Status::new(StatusCode::Corruption, "corrupt index entry"));
                return false;
            }
        };
        match self.table.read_block(&handle) {
            Ok(block) => {
                self.data = Some(block.iter());
                true
            }
            Err(e) => {
                self.err = Some(e);
                false
            }
        }
    }

    fn data_valid(&self) -> bool {
        self.data.as_ref().map_or(false, |d| d.valid())
    }

    /// Steps forward through index entries until a block yields a valid position via `position`.
    fn skip_forward(&mut self) -> bool {
        while !self.data_valid() {
            if self.err.is_some() || !self.index.next() {
                self.data = None;
                return false;
            }
            if self.load_block() {
                self.data.as_mut().unwrap().first();
            }
        }
        true
    }

    fn skip_backward(&mut self) -> bool {
        while !self.data_valid() {
            if self.err.is_some() || !self.index.prev() {
                self.data = None;
                return false;
            }
            if self.load_block() {
                self.data.as_mut().unwrap().last();
            }
        }
        true
    }
}

impl InternalIterator for TableIterator {
    fn seek_ge(&mut self, key: &[u8]) {
        self.index.seek_ge(key);
        if !self.index.valid() {
            self.data = None;
            return;
        }
        if self.load_block() {
            self.data.as_mut().unwrap().seek_ge(key);
        }
        // A separator may fall between the last key of its block and the first key of the next
        // one; the match is then at the start of a following block.
        self.skip_forward();
    }

    fn seek_lt(&mut self, key: &[u8]) {
        self.index.seek_ge(key);
        if !self.index.valid() {
            self.index.last();
        }
        if !self.index.valid() {
            self.data = None;
            return;
        }
        if self.load_block() {
            self.data.as_mut().unwrap().seek_lt(key);
        }
        // The separator may land between user keys; the true predecessor is then the previous
        // block's last entry.
        self.skip_backward();
    }

    fn first(&mut self) {
        self.index.first();
        if !self.index.valid() {
            self.data = None;
            return;
        }
        if self.load_block() {
            self.data.as_mut().unwrap().first();
        }
        self.skip_forward();
    }

    fn last(&mut self) {
        self.index.last();
        if !self.index.valid() {
            self.data = None;
            return;
        }
        if self.load_block() {
            self.data.as_mut().unwrap().last();
        }
        self.skip_backward();
    }

    fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if let Some(ref mut data) = self.data {
            if data.next() {
                return true;
            }
        } else {
            self.first();
            return self.valid();
        }
        self.data = None;
        self.skip_forward()
    }

    fn prev(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if let Some(ref mut data) = self.data {
            if data.prev() {
                return true;
            }
        }
        self.data = None;
        self.skip_backward()
    }

    fn valid(&self) -> bool {
        self.err.is_none() && self.data_valid()
    }

    fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool {
        match self.data {
            Some(ref d) => d.current(key, val),
            None => false,
        }
    }

    fn status(&mut self) -> Result<()> {
        if let Some(e) = self.err.take() {
            return Err(e);
        }
        self.index.status()?;
        if let Some(ref mut d) = self.data {
            d.status()?;
        }
        Ok(())
    }
}
