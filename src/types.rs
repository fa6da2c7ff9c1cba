//! A collection of fundamental types and helpers used throughout the engine: sequence numbers,
//! file numbering and naming, the shared-ownership alias, and the internal iterator trait
//! implemented by all iterators over internal keys.

use crate::error::{err, Result, StatusCode};
use crate::ikey;

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

pub const NUM_LEVELS: usize = 7;

/// Sequence numbers occupy 56 bits of an internal key's trailer.
pub type SequenceNumber = u64;

pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// A sequence number with this bit set is a batch-relative offset instead; it only occurs inside
/// an indexed batch that has not been applied yet.
pub const SEQ_NUM_BATCH: SequenceNumber = 1 << 55;

/// File numbers for manifests, logs and tables are allocated from a single namespace.
pub type FileNum = u64;

/// Denotes a file on disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileType {
    Log,
    DBLock,
    Table,
    Descriptor,
    Current,
    Temp,
    InfoLog,
}

/// Parses a file name within a database directory into its number and type.
pub fn parse_file_name<P: AsRef<Path>>(f: P) -> Result<(FileNum, FileType)> {
    let f = f.as_ref().to_str().unwrap_or_default();
    if f == "CURRENT" {
        return Ok((0, FileType::Current));
    } else if f == "LOCK" {
        return Ok((0, FileType::DBLock));
    } else if f == "LOG" || f == "LOG.old" {
        return Ok((0, FileType::InfoLog));
    } else if let Some(stripped) = f.strip_prefix("MANIFEST-") {
        if let Ok(num) = stripped.parse::<FileNum>() {
            return Ok((num, FileType::Descriptor));
        }
        return err(StatusCode::InvalidArgument, "manifest file number is invalid");
    }

    let dot_ix = match f.find('.') {
        Some(ix) => ix,
        None => return err(StatusCode::InvalidArgument, "unknown file name"),
    };
    let num = match f[0..dot_ix].parse::<FileNum>() {
        Ok(num) => num,
        Err(_) => return err(StatusCode::InvalidArgument, "file number is invalid"),
    };
    match &f[dot_ix + 1..] {
        "log" => Ok((num, FileType::Log)),
        "sst" => Ok((num, FileType::Table)),
        "dbtmp" => Ok((num, FileType::Temp)),
        _ => err(StatusCode::InvalidArgument, "unknown file extension"),
    }
}

/// Describes a single table file: its number, size and key range.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileMetaData {
    pub num: FileNum,
    pub size: usize,
    // Internal keys.
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// An extension of the standard `Iterator` idiom to bidirectional, seekable iterators over
/// internal keys. All iterators in the engine -- memtable, block, batch, table, level, merging and
/// the user-facing one built on top -- speak this interface.
///
/// An iterator is either positioned at an entry (`valid()` returns true) or unpositioned. Seeks
/// and `first()`/`last()` establish a position; `next()`/`prev()` move it and invalidate the
/// iterator when they run off either end. `current()` copies the entry at the position into the
/// supplied buffers.
pub trait InternalIterator {
    /// Positions the iterator at the first entry whose key is greater than or equal to `key`.
    fn seek_ge(&mut self, key: &[u8]);
    /// Positions the iterator at the last entry whose key is less than `key`.
    fn seek_lt(&mut self, key: &[u8]);
    /// Positions the iterator at the first entry, if any.
    fn first(&mut self);
    /// Positions the iterator at the last entry, if any.
    fn last(&mut self);
    /// Advances to the next entry; returns false and invalidates the iterator at the end.
    fn next(&mut self) -> bool;
    /// Moves to the previous entry; returns false and invalidates the iterator at the start.
    fn prev(&mut self) -> bool;
    fn valid(&self) -> bool;
    /// Copies the current entry into `key` and `val`. Returns false if unpositioned.
    fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool;
    /// A terminal error encountered by the iterator, if any. An errored iterator is also invalid.
    fn status(&mut self) -> Result<()> {
        Ok(())
    }

    /// Advances past all remaining entries sharing the current entry's user key.
    ///
    /// The default implementation compares user keys bytewise. Byte equality implies equality
    /// under any well-formed user comparator, so this may under-skip (and never over-skips) for
    /// exotic comparators; callers that fold user keys themselves advance manually instead.
    fn next_user_key(&mut self) -> bool {
        let (mut key, mut val) = (vec![], vec![]);
        if !self.current(&mut key, &mut val) {
            self.first();
            return self.valid();
        }
        let ukey = ikey::user_key(&key).to_vec();
        while self.next() {
            if self.current(&mut key, &mut val) && ikey::user_key(&key) != &ukey[..] {
                return true;
            }
        }
        false
    }

    /// Moves before all entries sharing the current entry's user key; see `next_user_key` for the
    /// comparison caveat.
    fn prev_user_key(&mut self) -> bool {
        let (mut key, mut val) = (vec![], vec![]);
        if !self.current(&mut key, &mut val) {
            self.last();
            return self.valid();
        }
        let ukey = ikey::user_key(&key).to_vec();
        while self.prev() {
            if self.current(&mut key, &mut val) && ikey::user_key(&key) != &ukey[..] {
                return true;
            }
        }
        false
    }
}

/// current_key_val is a helper returning a copy of the current entry of an iterator.
pub fn current_key_val<It: InternalIterator + ?Sized>(it: &It) -> Option<(Vec<u8>, Vec<u8>)> {
    let (mut k, mut v) = (vec![], vec![]);
    if it.current(&mut k, &mut v) {
        Some((k, v))
    } else {
        None
    }
}

impl InternalIterator for Box<dyn InternalIterator> {
    fn seek_ge(&mut self, key: &[u8]) {
        self.as_mut().seek_ge(key)
    }
    fn seek_lt(&mut self, key: &[u8]) {
        self.as_mut().seek_lt(key)
    }
    fn first(&mut self) {
        self.as_mut().first()
    }
    fn last(&mut self) {
        self.as_mut().last()
    }
    fn next(&mut self) -> bool {
        self.as_mut().next()
    }
    fn prev(&mut self) -> bool {
        self.as_mut().prev()
    }
    fn valid(&self) -> bool {
        self.as_ref().valid()
    }
    fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool {
        self.as_ref().current(key, val)
    }
    fn status(&mut self) -> Result<()> {
        self.as_mut().status()
    }
    fn next_user_key(&mut self) -> bool {
        self.as_mut().next_user_key()
    }
    fn prev_user_key(&mut self) -> bool {
        self.as_mut().prev_user_key()
    }
}

/// Shared wraps a value in a reference-counted cell with interior mutability.
pub type Shared<T> = Rc<RefCell<T>>;

pub fn share<T>(t: T) -> Rc<RefCell<T>> {
    Rc::new(RefCell::new(t))
}
