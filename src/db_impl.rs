//! The database: opening and recovery, the commit path into the write-ahead log and memtable,
//! reads, and the flush and compaction machinery that keeps the levels in shape.
//!
//! This implementation is single-threaded: background work runs cooperatively from the write
//! path and from open. The commit sequencing, visibility rules and on-disk formats are the same
//! ones a concurrent implementation would use; readers only ever observe sequence numbers up to
//! `visible_seq_num`, which is published only after a batch is both logged and applied.

use crate::batch::Batch;
use crate::cmp::{Comparator, InternalKeyCmp};
use crate::compaction_iter::CompactionIter;
use crate::db_iter::DBIterator;
use crate::env::{FileLock, WritableFile};
use crate::error::{err, Result, StatusCode};
use crate::ikey::{self, LookupKey, KIND_DELETE};
use crate::infolog::Logger;
use crate::log::{LogReader, LogWriter};
use crate::memtable::{MemGetResult, MemTable};
use crate::merging_iter::MergingIter;
use crate::options::Options;
use crate::rate::RateLimiter;
use crate::table_builder::TableBuilder;
use crate::table_cache::{table_file_name, TableCache};
use crate::types::{
    parse_file_name, share, FileMetaData, FileNum, FileType, InternalIterator, SequenceNumber,
    Shared,
};
use crate::version_edit::VersionEdit;
use crate::version_set::{manifest_file_path, set_current_file, Compaction, VersionSet};

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::rc::Rc;

fn log_file_path(db_path: &Path, num: FileNum) -> PathBuf {
    db_path.join(format!("{:06}.log", num))
}

fn lock_file_path(db_path: &Path) -> PathBuf {
    db_path.join("LOCK")
}

/// Opens the LOG info log inside the database directory, rotating a previous one to LOG.old.
/// Falls back to a sink logger if the file cannot be opened.
fn open_info_log(opt: &Options, db_path: &Path) -> Logger {
    let logfile = db_path.join("LOG");
    let oldfile = db_path.join("LOG.old");
    let _ = opt.env.mkdir(db_path);
    if let Ok(true) = opt.env.exists(&logfile) {
        let _ = opt.env.rename(&logfile, &oldfile);
    }
    if let Ok(w) = opt.env.open_writable_file(&logfile) {
        Logger(Box::new(w))
    } else {
        Logger(Box::new(io::sink()))
    }
}

pub struct DB {
    path: PathBuf,
    opt: Options,
    icmp: Rc<Box<dyn Comparator>>,
    lock: Option<FileLock>,

    mem: MemTable,
    // Immutable memtables waiting for a flush, oldest first.
    imm_queue: VecDeque<MemTable>,

    log: Option<LogWriter<BufWriter<Box<dyn WritableFile>>>>,
    log_num: FileNum,

    table_cache: Shared<TableCache>,
    versions: VersionSet,

    // File numbers of flush/compaction outputs being written; they are live for the purposes of
    // obsolete-file collection even though no version references them yet.
    pending_outputs: HashSet<FileNum>,

    write_controller: RateLimiter,
    compaction_controller: RateLimiter,
    flushing: bool,
    compacting: bool,
}

impl DB {
    /// Opens or creates the database in directory `path`.
    pub fn open<P: AsRef<Path>>(path: P, mut opt: Options) -> Result<DB> {
        let path = path.as_ref().to_owned();
        if opt.log.is_none() {
            opt.log = Some(share(open_info_log(&opt, &path)));
        }
        let _ = opt.env.mkdir(&path);

        let table_cache = share(TableCache::new(&path, opt.clone()));
        let versions = VersionSet::new(&path, opt.clone(), table_cache.clone());
        let icmp: Rc<Box<dyn Comparator>> =
            Rc::new(Box::new(InternalKeyCmp(opt.cmp.clone())));

        let mut db = DB {
            icmp,
            mem: MemTable::new(opt.cmp.clone(), opt.write_buffer_size),
            imm_queue: VecDeque::new(),
            log: None,
            log_num: 0,
            table_cache,
            versions,
            pending_outputs: HashSet::new(),
            write_controller: RateLimiter::new(opt.write_rate.0, opt.write_rate.1),
            compaction_controller: RateLimiter::new(opt.compaction_rate.0, opt.compaction_rate.1),
            flushing: false,
            compacting: false,
            lock: None,
            opt,
            path,
        };

        db.acquire_lock()?;

        let current_exists = db.opt.env.exists(&db.path.join("CURRENT")).unwrap_or(false);
        if !current_exists {
            db.initialize_db()?;
        } else if db.opt.error_if_exists {
            return err(StatusCode::AlreadyExists, "database already exists");
        }

        db.versions.recover()?;

        // Replay write-ahead logs newer than the manifest's.
        let mut edit = VersionEdit::new();
        let mut log_files = vec![];
        for name in db.opt.env.children(&db.path)? {
            if let Ok((num, FileType::Log)) = parse_file_name(&name) {
                if num >= db.versions.log_num || num == db.versions.prev_log_num {
                    log_files.push(num);
                }
            }
        }
        log_files.sort_unstable();
        for num in log_files {
            let max_seq = db.replay_wal(num, &mut edit)?;
            db.versions.mark_file_number_used(num);
            if db.versions.log_seq_num <= max_seq {
                db.versions.log_seq_num = max_seq + 1;
                db.versions.visible_seq_num = max_seq;
            }
        }

        // Fresh write-ahead log; the edit records it so older logs become obsolete.
        let new_log_num = db.versions.new_file_number();
        let logfile = db.opt.env.open_writable_file(&log_file_path(&db.path, new_log_num))?;
        db.log = Some(LogWriter::new(BufWriter::new(logfile)));
        db.log_num = new_log_num;
        edit.set_log_num(new_log_num);

        db.versions.log_and_apply(edit)?;
        db.delete_obsolete_files();
        db.maybe_schedule_compaction();
        Ok(db)
    }

    /// Creates an empty database: a manifest holding an empty version and a CURRENT naming it.
    fn initialize_db(&mut self) -> Result<()> {
        const MANIFEST_NUM: FileNum = 1;
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.opt.cmp.name());
        edit.set_log_num(0);
        edit.set_next_file(MANIFEST_NUM + 1);
        edit.set_last_sequence(0);

        {
            let path = manifest_file_path(&self.path, MANIFEST_NUM);
            let file = self.opt.env.open_writable_file(&path)?;
            let mut lw = LogWriter::new(file);
            lw.add_record(&edit.encode())?;
            lw.sync()?;
        }
        set_current_file(self.opt.env.as_ref().as_ref(), &self.path, MANIFEST_NUM)
    }

    fn acquire_lock(&mut self) -> Result<()> {
        match self.opt.env.lock(&lock_file_path(&self.path)) {
            Ok(lock) => {
                self.lock = Some(lock);
                Ok(())
            }
            Err(ref e) if e.code == StatusCode::LockError => err(
                StatusCode::LockError,
                "database lock is held by another instance",
            ),
            Err(e) => Err(e),
        }
    }

    fn release_lock(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => self.opt.env.unlock(lock),
            None => Ok(()),
        }
    }

    /// Replays one log file into L0 tables recorded in `edit`; returns the highest sequence
    /// number seen. Corruption aborts the open.
    fn replay_wal(&mut self, num: FileNum, edit: &mut VersionEdit) -> Result<SequenceNumber> {
        let path = log_file_path(&self.path, num);
        let file = self.opt.env.open_sequential_file(&path)?;
        let mut reader = LogReader::new(file, true);
        log!(self.opt.log, "replaying log {:06}", num);

        let mut mem = MemTable::new(self.opt.cmp.clone(), self.opt.write_buffer_size);
        let mut batch = Batch::new();
        let mut record = vec![];
        let mut max_seq = 0;

        loop {
            let n = reader
                .read(&mut record)
                .map_err(|e| e.annotate(format!("log {:06}", num)))?;
            if n == 0 {
                break;
            }
            // set_contents walks all entries, so a corrupt batch aborts the replay here.
            batch.set_contents(&record)?;
            if batch.count() == 0 {
                continue;
            }

            let seq = batch.seq_num();
            let last = seq + batch.count() as u64 - 1;
            if last > max_seq {
                max_seq = last;
            }

            if mem.prepare(&batch).is_err() {
                // Memtable full mid-replay: flush it as an L0 table and continue fresh.
                let meta = {
                    let mut iter = mem.new_iter();
                    self.write_level0_table(&mut iter)?
                };
                if meta.size > 0 {
                    self.pending_outputs.remove(&meta.num);
                    edit.add_file(0, meta);
                }
                mem = MemTable::new(self.opt.cmp.clone(), self.opt.write_buffer_size);
                mem.prepare(&batch)?;
            }
            mem.apply(&batch, seq)?;
            mem.unref();
        }

        if !mem.is_empty() {
            let meta = {
                let mut iter = mem.new_iter();
                self.write_level0_table(&mut iter)?
            };
            if meta.size > 0 {
                self.pending_outputs.remove(&meta.num);
                edit.add_file(0, meta);
            }
        }
        Ok(max_seq)
    }

    /// Flushes buffered log writes and releases the database lock.
    pub fn close(&mut self) -> Result<()> {
        if let Some(ref mut log) = self.log {
            log.flush()?;
        }
        self.release_lock()
    }
}

impl DB {
    // WRITE //

    /// Stores a single key/value pair.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut b = Batch::new();
        b.set(key, val)?;
        self.apply(b)
    }

    /// Merges a value into the key's current value using the configured merge operator.
    pub fn merge(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut b = Batch::new();
        b.merge(key, val)?;
        self.apply(b)
    }

    /// Deletes a single key.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let mut b = Batch::new();
        b.delete(key)?;
        self.apply(b)
    }

    /// Deletes every key in `[start, end)`.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        let mut b = Batch::new();
        b.delete_range(start, end)?;
        self.apply(b)
    }

    /// Commits a batch with the configured durability.
    pub fn apply(&mut self, batch: Batch) -> Result<()> {
        self.apply_with_sync(batch, self.opt.sync_writes)
    }

    /// Commits a batch atomically: a sequence number is assigned, the batch goes to the
    /// write-ahead log (synced if requested), its entries are applied to the memtable, and only
    /// then does it become visible to readers.
    pub fn apply_with_sync(&mut self, mut batch: Batch, sync: bool) -> Result<()> {
        let count = batch.count();
        if count == 0 {
            return Ok(());
        }
        assert!(self.log.is_some());

        let wire_size = batch.repr().len();
        self.write_controller.acquire(wire_size);

        // Reserve memtable room, rotating to a fresh memtable and log when full.
        while self.mem.prepare(&batch).is_err() {
            self.rotate_memtable()?;
        }

        let base_seq = self.versions.log_seq_num;
        self.versions.log_seq_num += count as u64;
        batch.set_seq_num(base_seq);

        let log_result = (|| -> Result<()> {
            let log = self.log.as_mut().unwrap();
            log.add_record(&batch.repr())?;
            log.flush()?;
            if sync {
                log.sync()?;
            }
            Ok(())
        })();
        if let Err(e) = log_result {
            // Nothing was applied or published; put the counters back.
            self.versions.log_seq_num = base_seq;
            self.mem.cancel_reservation(batch.mem_size());
            self.mem.unref();
            return Err(e);
        }

        self.mem.apply(&batch, base_seq)?;
        self.mem.unref();

        // Publish: readers may now see everything up to the batch's last entry.
        self.versions.visible_seq_num = base_seq + count as u64 - 1;
        Ok(())
    }

    /// Moves the mutable memtable to the immutable queue behind a fresh memtable and log file,
    /// then flushes the queue.
    fn rotate_memtable(&mut self) -> Result<()> {
        let new_log_num = self.versions.new_file_number();
        let logfile = self.opt.env.open_writable_file(&log_file_path(&self.path, new_log_num));
        let logfile = match logfile {
            Ok(f) => f,
            Err(e) => {
                self.versions.reuse_file_number(new_log_num);
                return Err(e);
            }
        };
        self.log = Some(LogWriter::new(BufWriter::new(logfile)));
        self.log_num = new_log_num;

        let full = std::mem::replace(
            &mut self.mem,
            MemTable::new(self.opt.cmp.clone(), self.opt.write_buffer_size),
        );
        self.imm_queue.push_back(full);
        self.maybe_schedule_flush();
        Ok(())
    }

    /// Forces the current memtable contents to an L0 table.
    pub fn flush(&mut self) -> Result<()> {
        if !self.mem.is_empty() {
            self.rotate_memtable()?;
        } else {
            self.maybe_schedule_flush();
        }
        if let Some(ref mut log) = self.log {
            log.sync()?;
        }
        Ok(())
    }
}

impl DB {
    // READ //

    /// Reads the newest visible value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let seq = self.versions.visible_seq_num;

        // The mutable memtable resolves most hot reads by itself.
        match self.mem.get(&LookupKey::new(key, seq), &self.opt.merger) {
            MemGetResult::Value(v) => return Ok(Some(v)),
            MemGetResult::Deleted => return Ok(None),
            // A partial merge or a miss needs the older state below.
            MemGetResult::Merged(_) | MemGetResult::NotFound => {}
        }

        let mut iter = self.new_iter_at(seq)?;
        iter.seek_ge(key);
        let (mut k, mut v) = (vec![], vec![]);
        if iter.current(&mut k, &mut v) && self.opt.cmp.compare(&k, key) == Ordering::Equal {
            return Ok(Some(v));
        }
        iter.status()?;
        Ok(None)
    }

    /// An iterator over the database at the current visible snapshot. Writes after its creation
    /// are not surfaced.
    pub fn new_iter(&self) -> Result<DBIterator> {
        self.new_iter_at(self.versions.visible_seq_num)
    }

    fn new_iter_at(&self, seq: SequenceNumber) -> Result<DBIterator> {
        let mut iters: Vec<Box<dyn InternalIterator>> = vec![];
        iters.push(Box::new(self.mem.new_iter()));
        for imm in self.imm_queue.iter().rev() {
            iters.push(Box::new(imm.new_iter()));
        }
        iters.extend(self.versions.current().borrow().new_iters()?);

        let merged = MergingIter::new(self.icmp.clone(), iters);
        Ok(DBIterator::new(
            self.opt.cmp.clone(),
            self.opt.merger.clone(),
            merged,
            seq,
        ))
    }
}

impl DB {
    // FLUSH AND COMPACTION //

    /// Flushes the ready prefix of the immutable queue into an L0 table. Errors are contained:
    /// the queue is left intact and the flush stays eligible for another attempt.
    fn maybe_schedule_flush(&mut self) {
        if self.flushing || self.imm_queue.is_empty() {
            return;
        }
        if !self.imm_queue.front().unwrap().ready_for_flush() {
            return;
        }
        self.flushing = true;
        let result = self.flush_queue();
        self.flushing = false;

        match result {
            Ok(()) => self.maybe_schedule_compaction(),
            Err(e) => {
                log!(self.opt.log, "memtable flush failed: {}", e);
            }
        }
    }

    fn flush_queue(&mut self) -> Result<()> {
        // The longest prefix of flush-ready immutables.
        let mut n = 0;
        while n < self.imm_queue.len() && self.imm_queue[n].ready_for_flush() {
            n += 1;
        }
        if n == 0 {
            return Ok(());
        }

        let meta = {
            let mut iter: Box<dyn InternalIterator> = if n == 1 {
                Box::new(self.imm_queue[0].new_iter())
            } else {
                let iters: Vec<Box<dyn InternalIterator>> = self
                    .imm_queue
                    .iter()
                    .take(n)
                    .map(|m| Box::new(m.new_iter()) as Box<dyn InternalIterator>)
                    .collect();
                Box::new(MergingIter::new(self.icmp.clone(), iters))
            };
            self.write_level0_table(&mut iter)?
        };

        let mut edit = VersionEdit::new();
        edit.set_log_num(self.log_num);
        let meta_num = meta.num;
        if meta.size > 0 {
            edit.add_file(0, meta);
        }
        let apply_result = self.versions.log_and_apply(edit);
        self.pending_outputs.remove(&meta_num);
        if let Err(e) = apply_result {
            let _ = self.opt.env.delete(&table_file_name(&self.path, meta_num));
            return Err(e);
        }

        self.imm_queue.drain(..n);
        self.delete_obsolete_files();
        Ok(())
    }

    /// Writes all entries of `iter` into a fresh L0 table file and returns its metadata. The
    /// file number stays in `pending_outputs` on success; the caller removes it once a version
    /// references the file.
    fn write_level0_table(&mut self, iter: &mut dyn InternalIterator) -> Result<FileMetaData> {
        let num = self.versions.new_file_number();
        self.pending_outputs.insert(num);
        log!(self.opt.log, "writing L0 table {:06}", num);

        let result = (|| -> Result<FileMetaData> {
            let path = table_file_name(&self.path, num);
            let file = self.opt.env.open_writable_file(&path)?;
            let mut builder = TableBuilder::new(
                self.opt.clone(),
                self.opt.level(0).clone(),
                BufWriter::new(file),
            );

            let mut meta = FileMetaData {
                num,
                ..Default::default()
            };
            let (mut key, mut val) = (vec![], vec![]);
            iter.first();
            while iter.valid() {
                if !iter.current(&mut key, &mut val) {
                    break;
                }
                if meta.smallest.is_empty() {
                    meta.smallest = key.clone();
                }
                meta.largest.clear();
                meta.largest.extend_from_slice(&key);
                builder.add(&key, &val)?;
                iter.next();
            }
            iter.status()?;

            if builder.entries() == 0 {
                return Ok(meta);
            }
            let (size, mut file) = builder.finish()?;
            file.sync()?;
            meta.size = size;

            // The new table must be readable before it is recorded anywhere.
            self.table_cache.borrow_mut().get_table(num)?;
            log!(self.opt.log, "L0 table {:06} has {} bytes", num, size);
            Ok(meta)
        })();

        match result {
            Ok(meta) => {
                if meta.size == 0 {
                    let _ = self.opt.env.delete(&table_file_name(&self.path, num));
                    self.pending_outputs.remove(&num);
                    self.versions.reuse_file_number(num);
                }
                Ok(meta)
            }
            Err(e) => {
                let _ = self.opt.env.delete(&table_file_name(&self.path, num));
                self.pending_outputs.remove(&num);
                self.versions.reuse_file_number(num);
                Err(e)
            }
        }
    }

    /// Runs compactions while the current version's score calls for one. Errors are contained
    /// and logged; the level state stays as if the compaction had not run.
    fn maybe_schedule_compaction(&mut self) {
        if self.compacting {
            return;
        }
        self.compacting = true;
        while self.versions.needs_compaction() {
            let c = match self.versions.pick_compaction() {
                Some(c) => c,
                None => break,
            };
            if let Err(e) = self.run_compaction(c) {
                log!(self.opt.log, "compaction failed: {}", e);
                break;
            }
        }
        self.compacting = false;
    }

    fn run_compaction(&mut self, c: Compaction) -> Result<()> {
        if c.is_trivial_move() {
            let f = c.input(0, 0);
            let level = c.level();
            log!(
                self.opt.log,
                "moving table {:06} ({} bytes) from L{} to L{}",
                f.num,
                f.size,
                level,
                level + 1
            );
            let mut edit = VersionEdit::new();
            edit.delete_file(level, f.num);
            edit.add_file(level + 1, f);
            return self.versions.log_and_apply(edit);
        }
        self.compact_disk_tables(c)
    }

    /// Merges the compaction inputs into one or more tables at level+1, then applies the edit
    /// swapping inputs for outputs.
    fn compact_disk_tables(&mut self, mut c: Compaction) -> Result<()> {
        log!(
            self.opt.log,
            "compacting {} files at L{} with {} files at L{}",
            c.num_inputs(0),
            c.level(),
            c.num_inputs(1),
            c.level() + 1
        );
        let output_level = c.level() + 1;
        let mut outputs: Vec<FileMetaData> = vec![];
        let mut builder: Option<TableBuilder<BufWriter<Box<dyn WritableFile>>>> = None;

        let result = (|| -> Result<()> {
            let input = self.versions.make_input_iterator(&c)?;
            let mut iter = CompactionIter::new(
                self.opt.cmp.clone(),
                self.opt.merger.clone(),
                input,
            );

            let (mut key, mut val) = (vec![], vec![]);
            iter.first();
            while iter.valid() {
                if !iter.current(&mut key, &mut val) {
                    break;
                }

                if builder.is_some() && c.should_stop_before(&key) {
                    let b = builder.take().unwrap();
                    finish_compaction_output(&mut *self, b, &mut outputs)?;
                }

                // A deletion whose key cannot exist below the output level carries no
                // information; drop it.
                if ikey::kind(&key) == KIND_DELETE
                    && c.is_base_level_for_user_key(ikey::user_key(&key))
                {
                    iter.next();
                    continue;
                }

                if builder.is_none() {
                    let num = self.versions.new_file_number();
                    self.pending_outputs.insert(num);
                    let path = table_file_name(&self.path, num);
                    let file = self.opt.env.open_writable_file(&path)?;
                    builder = Some(TableBuilder::new(
                        self.opt.clone(),
                        self.opt.level(output_level).clone(),
                        BufWriter::new(file),
                    ));
                    outputs.push(FileMetaData {
                        num,
                        ..Default::default()
                    });
                }

                let b = builder.as_mut().unwrap();
                if b.entries() == 0 {
                    outputs.last_mut().unwrap().smallest = key.clone();
                }
                let out = outputs.last_mut().unwrap();
                out.largest.clear();
                out.largest.extend_from_slice(&key);

                self.compaction_controller.acquire(key.len() + val.len());
                b.add(&key, &val)?;

                if b.size_estimate() > c.output_file_size() {
                    let b = builder.take().unwrap();
                    finish_compaction_output(&mut *self, b, &mut outputs)?;
                }
                iter.next();
            }
            iter.status()?;

            if let Some(b) = builder.take() {
                finish_compaction_output(&mut *self, b, &mut outputs)?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            // Failed mid-write: remove the partial outputs and pretend nothing happened.
            for o in &outputs {
                let _ = self.opt.env.delete(&table_file_name(&self.path, o.num));
                self.pending_outputs.remove(&o.num);
            }
            return Err(e);
        }

        c.add_input_deletions();
        let mut edit = c.into_edit();
        for o in &outputs {
            edit.add_file(output_level, o.clone());
        }
        let apply_result = self.versions.log_and_apply(edit);
        for o in &outputs {
            self.pending_outputs.remove(&o.num);
        }
        if let Err(e) = apply_result {
            for o in &outputs {
                let _ = self.opt.env.delete(&table_file_name(&self.path, o.num));
            }
            return Err(e);
        }

        log!(
            self.opt.log,
            "compaction to L{} produced {} tables",
            output_level,
            outputs.len()
        );
        self.delete_obsolete_files();
        Ok(())
    }

    /// Removes files no longer referenced by the version set, the pending outputs, the current
    /// log or the current manifest. Filesystem errors are ignored.
    fn delete_obsolete_files(&mut self) {
        let mut live = self.versions.live_files();
        live.extend(self.pending_outputs.iter());
        let log_num = self.versions.log_num;
        let manifest_num = self.versions.manifest_num;

        let children = match self.opt.env.children(&self.path) {
            Ok(c) => c,
            Err(_) => return,
        };
        for name in children {
            let (num, typ) = match parse_file_name(&name) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let keep = match typ {
                FileType::Log => num >= log_num,
                FileType::Descriptor => num >= manifest_num,
                FileType::Table => live.contains(&num),
                FileType::Temp => live.contains(&num),
                FileType::Current | FileType::DBLock | FileType::InfoLog => true,
            };
            if keep {
                continue;
            }
            if typ == FileType::Table {
                let _ = self.table_cache.borrow_mut().evict(num);
            }
            log!(self.opt.log, "deleting obsolete file {:?}", name);
            if let Err(e) = self.opt.env.delete(&self.path.join(&name)) {
                log!(self.opt.log, "deleting {:?} failed: {}", name, e);
            }
        }
    }
}

/// Closes a compaction output: finalizes the table, syncs it, fills in its metadata and
/// verifies it is readable.
fn finish_compaction_output(
    db: &mut DB,
    builder: TableBuilder<BufWriter<Box<dyn WritableFile>>>,
    outputs: &mut [FileMetaData],
) -> Result<()> {
    let entries = builder.entries();
    let (size, mut file) = builder.finish()?;
    file.sync()?;

    let out = outputs.last_mut().unwrap();
    out.size = size;

    if entries > 0 {
        db.table_cache.borrow_mut().get_table(out.num)?;
        log!(
            db.opt.log,
            "new table {:06}: {} keys, {} bytes",
            out.num,
            entries,
            size
        );
    }
    Ok(())
}

impl Drop for DB {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_iter::current_user_kv;
    use crate::options::CompressionType;
    use crate::types::NUM_LEVELS;

    fn test_opt() -> Options {
        let mut opt = Options::default();
        // Small sizes so flushes and compactions trigger with little data.
        opt.write_buffer_size = 16 << 10;
        opt.block_size = 512;
        opt.compression = CompressionType::Snappy;
        opt.write_rate = (0, 0);
        opt.compaction_rate = (0, 0);
        for (i, l) in opt.levels.iter_mut().enumerate() {
            l.target_file_size = 32 << 10;
            if i > 0 {
                l.filter_policy = Some(Rc::new(Box::new(crate::filter::BloomPolicy::new(10))));
            }
        }
        opt
    }

    fn v(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn collect_all(db: &DB) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut iter = db.new_iter().unwrap();
        let mut out = vec![];
        iter.first();
        while iter.valid() {
            out.push(current_user_kv(&iter).unwrap());
            iter.next();
        }
        out
    }

    #[test]
    fn test_db_basic_point_ops() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();

        db.put(b"cherry", b"red").unwrap();
        db.put(b"peach", b"yellow").unwrap();
        db.put(b"grape", b"red").unwrap();
        db.put(b"grape", b"green").unwrap();
        db.put(b"plum", b"purple").unwrap();

        assert_eq!(db.get(b"plum").unwrap(), Some(v("purple")));
        assert_eq!(db.get(b"grape").unwrap(), Some(v("green")));
        assert_eq!(db.get(b"lychee").unwrap(), None);
        assert_eq!(collect_all(&db).len(), 4);
    }

    #[test]
    fn test_db_iterator_seek() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();
        for (k, val) in [("cherry", "red"), ("peach", "yellow"), ("grape", "green"), ("plum", "purple")] {
            db.put(k.as_bytes(), val.as_bytes()).unwrap();
        }

        let mut iter = db.new_iter().unwrap();
        iter.seek_ge(b"mango");
        let mut got = vec![];
        while iter.valid() {
            got.push(current_user_kv(&iter).unwrap());
            iter.next();
        }
        assert_eq!(
            got,
            vec![(v("peach"), v("yellow")), (v("plum"), v("purple"))]
        );
    }

    #[test]
    fn test_db_batch_is_atomic_and_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();

        let mut b = Batch::new();
        b.set(b"a", b"1").unwrap();
        b.set(b"b", b"1").unwrap();
        b.set(b"a", b"2").unwrap();
        b.delete(b"b").unwrap();
        db.apply(b).unwrap();

        assert_eq!(db.get(b"a").unwrap(), Some(v("2")));
        assert_eq!(db.get(b"b").unwrap(), None);
    }

    #[test]
    fn test_db_merge_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();

        db.merge(b"k", b"a").unwrap();
        db.merge(b"k", b"b").unwrap();
        db.merge(b"k", b"c").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(v("abc")));

        // The fold survives a flush.
        db.flush().unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(v("abc")));

        // Merges over a flushed SET base also resolve across storage layers.
        db.put(b"m", b"base").unwrap();
        db.flush().unwrap();
        db.merge(b"m", b"+1").unwrap();
        assert_eq!(db.get(b"m").unwrap(), Some(v("base+1")));
    }

    #[test]
    fn test_db_delete_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();

        db.put(b"k", b"v").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(v("v")));
        db.delete(b"k").unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);

        db.flush().unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_db_reverse_scan_multi_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();

        let mut b = Batch::new();
        b.set(b"a", b"1").unwrap();
        b.set(b"a", b"2").unwrap();
        b.set(b"b", b"1").unwrap();
        b.set(b"b", b"2").unwrap();
        db.apply(b).unwrap();

        let mut iter = db.new_iter().unwrap();
        iter.last();
        let mut got = vec![];
        while iter.valid() {
            got.push(current_user_kv(&iter).unwrap());
            iter.prev();
        }
        assert_eq!(got, vec![(v("b"), v("2")), (v("a"), v("2"))]);
    }

    #[test]
    fn test_db_wal_replay_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut opt = test_opt();
            opt.write_buffer_size = 4 << 20; // no flush before the "crash"
            opt.sync_writes = true;
            let mut db = DB::open(dir.path(), opt).unwrap();
            for i in 0..1000usize {
                db.put(format!("{:08}", i).as_bytes(), &vec![b'x'; i]).unwrap();
            }
            // Simulate a crash: drop without flushing memtables.
            std::mem::forget(db.lock.take());
        }

        let db = DB::open(dir.path(), test_opt()).unwrap();
        for i in (0..1000usize).step_by(53) {
            let got = db.get(format!("{:08}", i).as_bytes()).unwrap().unwrap();
            assert_eq!(got.len(), i);
            assert!(got.iter().all(|b| *b == b'x'));
        }
    }

    #[test]
    fn test_db_reopen_equivalence() {
        let dir = tempfile::tempdir().unwrap();
        let expected;
        {
            let mut db = DB::open(dir.path(), test_opt()).unwrap();
            for i in 0..500usize {
                let k = format!("key-{:05}", i);
                let val = format!("val-{}", i * 7);
                db.put(k.as_bytes(), val.as_bytes()).unwrap();
                if i % 100 == 99 {
                    db.flush().unwrap();
                }
            }
            for i in (0..500usize).step_by(3) {
                db.delete(format!("key-{:05}", i).as_bytes()).unwrap();
            }
            expected = collect_all(&db);
            db.close().unwrap();
        }

        let db = DB::open(dir.path(), test_opt()).unwrap();
        assert_eq!(collect_all(&db), expected);
        assert_eq!(db.get(b"key-00001").unwrap(), Some(v("val-7")));
        assert_eq!(db.get(b"key-00000").unwrap(), None);
    }

    #[test]
    fn test_db_flush_and_compaction_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();

        // Overlapping key ranges across many flushes force level-0 accumulation and then a
        // compaction into level 1.
        for round in 0..8 {
            for i in 0..200usize {
                let k = format!("key-{:05}", i);
                db.put(k.as_bytes(), format!("r{}-{}", round, i).as_bytes()).unwrap();
            }
            db.flush().unwrap();
        }

        // Compaction must have moved data below level 0.
        let version = db.versions.current();
        let version = version.borrow();
        let below: usize = (1..NUM_LEVELS).map(|l| version.num_level_files(l)).sum();
        assert!(below > 0, "no compaction happened");

        // Levels >= 1 are sorted and disjoint.
        let icmp = InternalKeyCmp(db.opt.cmp.clone());
        for level in 1..NUM_LEVELS {
            let files = &version.files[level];
            for w in files.windows(2) {
                assert_eq!(
                    icmp.compare(&w[0].borrow().largest, &w[1].borrow().smallest),
                    Ordering::Less
                );
            }
        }

        // Every live file resolves on disk; nothing else but bookkeeping files remains.
        let live = db.versions.live_files();
        for num in &live {
            assert!(db.opt.env.exists(&table_file_name(dir.path(), *num)).unwrap());
        }
        for name in db.opt.env.children(dir.path()).unwrap() {
            if let Ok((num, FileType::Table)) = parse_file_name(&name) {
                assert!(live.contains(&num), "obsolete table {:06} not deleted", num);
            }
        }

        // All data still reads back with last-write-wins semantics.
        for i in (0..200usize).step_by(17) {
            let k = format!("key-{:05}", i);
            assert_eq!(db.get(k.as_bytes()).unwrap(), Some(v(&format!("r7-{}", i))));
        }
    }

    #[test]
    fn test_db_delete_dropped_at_base_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();

        db.put(b"gone", b"soon").unwrap();
        db.flush().unwrap();
        db.delete(b"gone").unwrap();
        db.put(b"kept", b"here").unwrap();
        db.flush().unwrap();

        // Push everything down until the deletion reaches its base level.
        for round in 0..8 {
            for i in 0..200usize {
                db.put(format!("fill-{:05}", i).as_bytes(), format!("{}", round).as_bytes())
                    .unwrap();
            }
            db.flush().unwrap();
        }

        assert_eq!(db.get(b"gone").unwrap(), None);
        assert_eq!(db.get(b"kept").unwrap(), Some(v("here")));

        // No table anywhere still carries the deleted key once its tombstone hit the bottom of
        // the key's range; at the very least the key never resurfaces in scans.
        let all = collect_all(&db);
        assert!(all.iter().all(|(k, _)| k != &v("gone")));
    }

    #[test]
    fn test_db_second_open_fails_on_lock() {
        let dir = tempfile::tempdir().unwrap();
        let _db = DB::open(dir.path(), test_opt()).unwrap();
        let second = DB::open(dir.path(), test_opt());
        assert_eq!(second.err().unwrap().code, StatusCode::LockError);
    }

    #[test]
    fn test_db_error_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _db = DB::open(dir.path(), test_opt()).unwrap();
        }
        let mut opt = test_opt();
        opt.error_if_exists = true;
        assert_eq!(
            DB::open(dir.path(), opt).err().unwrap().code,
            StatusCode::AlreadyExists
        );
    }

    #[test]
    fn test_db_range_delete_hides_range_in_scans() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();

        for k in ["a", "b", "c", "d", "e"] {
            db.put(k.as_bytes(), b"x").unwrap();
        }
        db.delete_range(b"b", b"d").unwrap();

        let keys: Vec<Vec<u8>> = collect_all(&db).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![v("a"), v("d"), v("e")]);

        // Writes newer than the tombstone reappear.
        db.put(b"c", b"back").unwrap();
        let keys: Vec<Vec<u8>> = collect_all(&db).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![v("a"), v("c"), v("d"), v("e")]);
    }

    #[test]
    fn test_db_sequence_numbers_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DB::open(dir.path(), test_opt()).unwrap();

        let mut last_visible = db.versions.visible_seq_num;
        for i in 0..100 {
            db.put(format!("k{}", i).as_bytes(), b"v").unwrap();
            let visible = db.versions.visible_seq_num;
            assert!(visible >= last_visible);
            assert!(visible < db.versions.log_seq_num);
            last_visible = visible;
        }
    }
}
