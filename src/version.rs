//! A Version is an immutable snapshot of the on-disk state: which table files make up each
//! level. Level 0 files may overlap and are ordered oldest to newest; files of deeper levels are
//! disjoint and sorted by their smallest key. Readers hold a Version and are unaffected by
//! concurrent version installs.

use crate::cmp::{Comparator, InternalKeyCmp};
use crate::error::{Result, Status};
use crate::ikey;
use crate::table_cache::TableCache;
use crate::table_reader::TableIterator;
use crate::types::{FileMetaData, FileNum, InternalIterator, Shared, NUM_LEVELS};

use std::cmp::Ordering;
use std::rc::Rc;

pub type FileMetaHandle = Shared<FileMetaData>;

/// The byte size a level may reach before it is due for compaction; doubles per level.
pub fn max_bytes_for_level(level: usize) -> f64 {
    assert!(level > 0);
    let base = 10.0 * f64::from(1 << 20);
    base * f64::from(1u32 << (level - 1) as u32)
}

pub fn total_size<'a, I: Iterator<Item = &'a FileMetaHandle>>(files: I) -> usize {
    files.map(|f| f.borrow().size).sum()
}

pub struct Version {
    table_cache: Shared<TableCache>,
    ucmp: Rc<Box<dyn Comparator>>,
    pub files: [Vec<FileMetaHandle>; NUM_LEVELS],

    pub compaction_score: Option<f64>,
    pub compaction_level: Option<usize>,
}

impl Version {
    pub fn new(table_cache: Shared<TableCache>, ucmp: Rc<Box<dyn Comparator>>) -> Version {
        Version {
            table_cache,
            ucmp,
            files: Default::default(),
            compaction_score: None,
            compaction_level: None,
        }
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        assert!(level < NUM_LEVELS);
        self.files[level].len()
    }

    pub fn live_files(&self) -> Vec<FileNum> {
        let mut nums = vec![];
        for level in 0..NUM_LEVELS {
            for f in &self.files[level] {
                nums.push(f.borrow().num);
            }
        }
        nums
    }

    /// The files of `level` whose user-key ranges overlap `[smallest, largest]`. For level 0 the
    /// search range grows transitively: an overlapping file widens the range and the scan starts
    /// over, so the result covers everything that must compact together.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        smallest: &[u8],
        largest: &[u8],
    ) -> Vec<FileMetaHandle> {
        assert!(level < NUM_LEVELS);
        let mut smallest = smallest.to_vec();
        let mut largest = largest.to_vec();

        'restart: loop {
            let mut inputs = vec![];
            for f_ in &self.files[level] {
                let f = f_.borrow();
                let f_smallest = ikey::user_key(&f.smallest);
                let f_largest = ikey::user_key(&f.largest);
                if self.ucmp.compare(f_largest, &smallest) == Ordering::Less
                    || self.ucmp.compare(f_smallest, &largest) == Ordering::Greater
                {
                    continue;
                }
                if level == 0 {
                    // Level-0 files overlap each other; widen the range and rescan if this file
                    // extends it.
                    if self.ucmp.compare(f_smallest, &smallest) == Ordering::Less {
                        smallest = f_smallest.to_vec();
                        continue 'restart;
                    }
                    if self.ucmp.compare(f_largest, &largest) == Ordering::Greater {
                        largest = f_largest.to_vec();
                        continue 'restart;
                    }
                }
                inputs.push(f_.clone());
            }
            return inputs;
        }
    }

    /// Iterators over the whole version: one per level-0 file, one concatenating iterator per
    /// deeper level.
    pub fn new_iters(&self) -> Result<Vec<Box<dyn InternalIterator>>> {
        let mut iters: Vec<Box<dyn InternalIterator>> = vec![];
        for f in &self.files[0] {
            iters.push(Box::new(
                self.table_cache.borrow_mut().new_iter(f.borrow().num)?,
            ));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(Box::new(new_level_iter(
                    self.files[level].clone(),
                    self.table_cache.clone(),
                    self.ucmp.clone(),
                )));
            }
        }
        Ok(iters)
    }
}

/// An iterator over the entries of a sequence of disjoint, sorted table files, opening each file
/// through the table cache only when the iteration reaches it.
pub struct LevelIter {
    files: Vec<FileMetaHandle>,
    table_cache: Shared<TableCache>,
    icmp: InternalKeyCmp,

    file_ix: usize,
    current: Option<TableIterator>,
    err: Option<Status>,
}

pub fn new_level_iter(
    files: Vec<FileMetaHandle>,
    table_cache: Shared<TableCache>,
    ucmp: Rc<Box<dyn Comparator>>,
) -> LevelIter {
    LevelIter {
        files,
        table_cache,
        icmp: InternalKeyCmp(ucmp),
        file_ix: 0,
        current: None,
        err: None,
    }
}

impl LevelIter {
    fn load_file(&mut self, ix: usize) -> bool {
        self.current = None;
        let num = self.files[ix].borrow().num;
        match self.table_cache.borrow_mut().new_iter(num) {
            Ok(iter) => {
                self.file_ix = ix;
                self.current = Some(iter);
                true
            }
            Err(e) => {
                self.err = Some(e);
                false
            }
        }
    }

    fn current_valid(&self) -> bool {
        self.current.as_ref().map_or(false, |c| c.valid())
    }
}

impl InternalIterator for LevelIter {
    fn seek_ge(&mut self, key: &[u8]) {
        // The first file whose largest key admits the target.
        let ix = self
            .files
            .partition_point(|f| self.icmp.compare(&f.borrow().largest, key) == Ordering::Less);
        self.current = None;
        if ix >= self.files.len() {
            return;
        }
        if self.load_file(ix) {
            self.current.as_mut().unwrap().seek_ge(key);
            if !self.current_valid() {
                self.next();
            }
        }
    }

    fn seek_lt(&mut self, key: &[u8]) {
        // The last file whose smallest key is below the target.
        let ix = self
            .files
            .partition_point(|f| self.icmp.compare(&f.borrow().smallest, key) == Ordering::Less);
        self.current = None;
        if ix == 0 {
            return;
        }
        if self.load_file(ix - 1) {
            self.current.as_mut().unwrap().seek_lt(key);
            if !self.current_valid() {
                self.prev();
            }
        }
    }

    fn first(&mut self) {
        self.current = None;
        if !self.files.is_empty() && self.load_file(0) {
            self.current.as_mut().unwrap().first();
        }
    }

    fn last(&mut self) {
        self.current = None;
        if !self.files.is_empty() && self.load_file(self.files.len() - 1) {
            self.current.as_mut().unwrap().last();
        }
    }

    fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.current.is_none() {
            self.first();
            return self.current_valid();
        }
        if self.current.as_mut().unwrap().next() {
            return true;
        }
        // File exhausted; move to the next one.
        while self.file_ix + 1 < self.files.len() {
            if !self.load_file(self.file_ix + 1) {
                return false;
            }
            self.current.as_mut().unwrap().first();
            if self.current_valid() {
                return true;
            }
        }
        self.current = None;
        false
    }

    fn prev(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.current.is_none() {
            self.last();
            return self.current_valid();
        }
        if self.current.as_mut().unwrap().prev() {
            return true;
        }
        while self.file_ix > 0 {
            if !self.load_file(self.file_ix - 1) {
                return false;
            }
            self.current.as_mut().unwrap().last();
            if self.current_valid() {
                return true;
            }
        }
        self.current = None;
        false
    }

    fn valid(&self) -> bool {
        self.err.is_none() && self.current_valid()
    }

    fn current(&self, key: &mut Vec<u8>, val: &mut Vec<u8>) -> bool {
        match self.current {
            Some(ref c) => c.current(key, val),
            None => false,
        }
    }

    fn status(&mut self) -> Result<()> {
        if let Some(e) = self.err.take() {
            return Err(e);
        }
        if let Some(ref mut c) = self.current {
            c.status()?;
        }
        Ok(())
    }
}
