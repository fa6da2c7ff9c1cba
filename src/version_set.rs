//! The VersionSet tracks the chain of Versions over the database's lifetime, owns the sequence
//! number and file number counters, and makes version transitions durable by appending
//! VersionEdits to the MANIFEST. It also picks compactions off the current version.

use crate::cmp::{Comparator, InternalKeyCmp};
use crate::env::Env;
use crate::error::{err, Result, Status, StatusCode};
use crate::ikey;
use crate::log::{LogReader, LogWriter};
use crate::merging_iter::MergingIter;
use crate::options::Options;
use crate::table_cache::TableCache;
use crate::types::{share, FileNum, InternalIterator, SequenceNumber, Shared, NUM_LEVELS};
use crate::version::{
    max_bytes_for_level, new_level_iter, total_size, FileMetaHandle, Version,
};
use crate::version_edit::VersionEdit;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A planned compaction: the files of `level` and `level + 1` to merge, the level + 2 files
/// consulted for output splitting, and the VersionEdit under construction.
pub struct Compaction {
    level: usize,
    max_output_file_size: usize,
    input_version: Option<Shared<Version>>,
    ucmp: Rc<Box<dyn Comparator>>,
    icmp: InternalKeyCmp,

    // Inputs from level and level+1.
    inputs: [Vec<FileMetaHandle>; 2],
    // Files of level+2 overlapping the compaction's key range.
    grandparents: Vec<FileMetaHandle>,
    grandparent_ix: usize,
    overlapped_bytes: usize,
    seen_key: bool,

    // Cross-call cursors into levels >= level+2, see is_base_level_for.
    level_ixs: [usize; NUM_LEVELS],

    edit: VersionEdit,
}

impl Compaction {
    pub fn new(opt: &Options, level: usize, input: Option<Shared<Version>>) -> Compaction {
        Compaction {
            level,
            max_output_file_size: opt.target_file_size(level + 1),
            input_version: input,
            ucmp: opt.cmp.clone(),
            icmp: InternalKeyCmp(opt.cmp.clone()),
            inputs: Default::default(),
            grandparents: Vec::new(),
            grandparent_ix: 0,
            overlapped_bytes: 0,
            seen_key: false,
            level_ixs: Default::default(),
            edit: VersionEdit::new(),
        }
    }

    fn add_input(&mut self, parent: usize, f: FileMetaHandle) {
        assert!(parent <= 1);
        self.inputs[parent].push(f)
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn output_file_size(&self) -> usize {
        self.max_output_file_size
    }

    pub fn input(&self, parent: usize, ix: usize) -> crate::types::FileMetaData {
        assert!(parent < 2);
        assert!(ix < self.inputs[parent].len());
        self.inputs[parent][ix].borrow().clone()
    }

    pub fn num_inputs(&self, parent: usize) -> usize {
        assert!(parent < 2);
        self.inputs[parent].len()
    }

    pub fn edit(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    pub fn into_edit(self) -> VersionEdit {
        self.edit
    }

    /// Marks every input file as deleted in the edit under construction.
    pub fn add_input_deletions(&mut self) {
        for parent in 0..2 {
            for f in &self.inputs[parent] {
                self.edit.delete_file(self.level + parent, f.borrow().num);
            }
        }
    }

    /// Whether no level below the compaction's output can contain the user key; a deletion
    /// emitted at the output level may then be dropped entirely.
    ///
    /// Callers probe keys in ascending order, which lets the per-level cursors in `level_ixs`
    /// persist across calls.
    pub fn is_base_level_for_user_key(&mut self, ukey: &[u8]) -> bool {
        assert!(self.input_version.is_some());
        let version = self.input_version.as_ref().unwrap();
        for level in self.level + 2..NUM_LEVELS {
            let version = version.borrow();
            let files = &version.files[level];
            while self.level_ixs[level] < files.len() {
                let f = files[self.level_ixs[level]].borrow();
                if self.ucmp.compare(ukey, ikey::user_key(&f.largest)) <= Ordering::Equal {
                    if self.ucmp.compare(ukey, ikey::user_key(&f.smallest)) >= Ordering::Equal {
                        // The key falls into this file's range.
                        return false;
                    }
                    break;
                }
                self.level_ixs[level] += 1;
            }
        }
        true
    }

    /// A trivial move shifts a single input file to the next level by edit only, with no I/O.
    /// It is declined when the file drags along too much grandparent overlap, which would set up
    /// an expensive merge later.
    pub fn is_trivial_move(&self) -> bool {
        self.num_inputs(0) == 1
            && self.num_inputs(1) == 0
            && total_size(self.grandparents.iter()) <= 10 * self.max_output_file_size
    }

    /// Reports whether the current output must be cut before appending `key`, to bound the
    /// overlap any single output file accumulates against level+2.
    pub fn should_stop_before(&mut self, key: &[u8]) -> bool {
        while self.grandparent_ix < self.grandparents.len()
            && self
                .icmp
                .compare(key, &self.grandparents[self.grandparent_ix].borrow().largest)
                == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_ix].borrow().size;
            }
            self.grandparent_ix += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > 10 * self.max_output_file_size {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}

pub struct VersionSet {
    db_path: PathBuf,
    opt: Options,
    icmp: InternalKeyCmp,
    table_cache: Shared<TableCache>,

    /// The next sequence number handed to a commit.
    pub log_seq_num: SequenceNumber,
    /// The highest sequence number visible to readers; never exceeds log_seq_num - 1.
    pub visible_seq_num: SequenceNumber,

    pub next_file_num: FileNum,
    pub manifest_num: FileNum,
    pub log_num: FileNum,
    pub prev_log_num: FileNum,

    current_version: Option<Shared<Version>>,
    compaction_ptrs: [Vec<u8>; NUM_LEVELS],

    descriptor_log: Option<LogWriter<Box<dyn crate::env::WritableFile>>>,
}

impl VersionSet {
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        opt: Options,
        table_cache: Shared<TableCache>,
    ) -> VersionSet {
        let current = Version::new(table_cache.clone(), opt.cmp.clone());
        VersionSet {
            db_path: db_path.as_ref().to_owned(),
            icmp: InternalKeyCmp(opt.cmp.clone()),
            opt,
            table_cache,

            log_seq_num: 1,
            visible_seq_num: 0,

            next_file_num: 2,
            manifest_num: 0,
            log_num: 0,
            prev_log_num: 0,

            current_version: Some(share(current)),
            compaction_ptrs: Default::default(),
            descriptor_log: None,
        }
    }

    /// The current version; there always is one.
    pub fn current(&self) -> Shared<Version> {
        self.current_version.as_ref().unwrap().clone()
    }

    fn add_version(&mut self, v: Version) {
        self.current_version = Some(share(v));
    }

    pub fn new_file_number(&mut self) -> FileNum {
        self.next_file_num += 1;
        self.next_file_num - 1
    }

    /// Returns an unused file number to the counter, if it was the most recently allocated one.
    pub fn reuse_file_number(&mut self, num: FileNum) {
        if num == self.next_file_num - 1 {
            self.next_file_num = num;
        }
    }

    pub fn mark_file_number_used(&mut self, num: FileNum) {
        if self.next_file_num <= num {
            self.next_file_num = num + 1;
        }
    }

    /// The file numbers referenced by the current version.
    pub fn live_files(&self) -> HashSet<FileNum> {
        let mut live = HashSet::new();
        if let Some(ref v) = self.current_version {
            live.extend(v.borrow().live_files());
        }
        live
    }

    pub fn needs_compaction(&self) -> bool {
        let v = self.current();
        let v = v.borrow();
        v.compaction_score.unwrap_or(0.0) >= 1.0
    }

    /// Picks the next compaction off the current version, or None if none is due. One seed file
    /// is chosen at the scoring level, rotating through the level via the per-level compaction
    /// pointer; at level 0 the seed grows to all transitively overlapping files.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        let current = current.borrow();

        if current.compaction_score.unwrap_or(0.0) < 1.0 {
            return None;
        }
        let level = current.compaction_level.unwrap();
        assert!(level < NUM_LEVELS - 1);

        let mut c = Compaction::new(&self.opt, level, self.current_version.clone());

        for f in &current.files[level] {
            if self.compaction_ptrs[level].is_empty()
                || self
                    .icmp
                    .compare(&f.borrow().largest, &self.compaction_ptrs[level])
                    == Ordering::Greater
            {
                c.add_input(0, f.clone());
                break;
            }
        }
        if c.num_inputs(0) == 0 {
            // Wrap around past the pointer.
            c.add_input(0, current.files[level][0].clone());
        }

        if level == 0 {
            let (smallest, largest) = get_range(&self.icmp, c.inputs[0].iter());
            c.inputs[0] = current.overlapping_inputs(
                0,
                ikey::user_key(&smallest),
                ikey::user_key(&largest),
            );
            assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let current = self.current();
        let current = current.borrow();
        let level = c.level;

        let (smallest, largest) = get_range(&self.icmp, c.inputs[0].iter());
        c.inputs[1] = current.overlapping_inputs(
            level + 1,
            ikey::user_key(&smallest),
            ikey::user_key(&largest),
        );

        let (mut all_start, mut all_limit) =
            get_range(&self.icmp, c.inputs[0].iter().chain(c.inputs[1].iter()));

        // Try growing the level inputs within the joint range, as long as that does not change
        // the set of level+1 inputs and stays within the expansion budget.
        if !c.inputs[1].is_empty() {
            let expanded0 = current.overlapping_inputs(
                level,
                ikey::user_key(&all_start),
                ikey::user_key(&all_limit),
            );
            let inputs1_size = total_size(c.inputs[1].iter());
            let expanded0_size = total_size(expanded0.iter());
            if expanded0.len() > c.num_inputs(0)
                && inputs1_size + expanded0_size < 25 * self.opt.target_file_size(level + 1)
            {
                let (new_start, new_limit) = get_range(&self.icmp, expanded0.iter());
                let expanded1 = current.overlapping_inputs(
                    level + 1,
                    ikey::user_key(&new_start),
                    ikey::user_key(&new_limit),
                );
                if expanded1.len() == c.num_inputs(1) {
                    log!(
                        self.opt.log,
                        "expanding inputs@{} {}+{} ({}+{} bytes) to {}+{} ({}+{} bytes)",
                        level,
                        c.inputs[0].len(),
                        c.inputs[1].len(),
                        total_size(c.inputs[0].iter()),
                        inputs1_size,
                        expanded0.len(),
                        expanded1.len(),
                        expanded0_size,
                        total_size(expanded1.iter())
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let (ns, nl) =
                        get_range(&self.icmp, c.inputs[0].iter().chain(c.inputs[1].iter()));
                    all_start = ns;
                    all_limit = nl;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents = current.overlapping_inputs(
                level + 2,
                ikey::user_key(&all_start),
                ikey::user_key(&all_limit),
            );
        }

        // Rotate the pointer so the next compaction of this level starts past these inputs.
        let (_, largest) = get_range(&self.icmp, c.inputs[0].iter());
        self.compaction_ptrs[level] = largest;
    }

    /// An iterator over all entries of a compaction's inputs. Fails if any input table cannot be
    /// opened; compacting past an unreadable input would silently drop its entries.
    pub fn make_input_iterator(&self, c: &Compaction) -> Result<Box<dyn InternalIterator>> {
        let cap = if c.level == 0 { c.num_inputs(0) + 1 } else { 2 };
        let mut iters: Vec<Box<dyn InternalIterator>> = Vec::with_capacity(cap);
        for parent in 0..2 {
            if c.num_inputs(parent) == 0 {
                continue;
            }
            if c.level + parent == 0 {
                // Level-0 files overlap, each gets its own iterator.
                for f in &c.inputs[parent] {
                    let num = f.borrow().num;
                    let iter = self
                        .table_cache
                        .borrow_mut()
                        .new_iter(num)
                        .map_err(|e| e.annotate(format!("compaction input {:06}", num)))?;
                    iters.push(Box::new(iter));
                }
            } else {
                iters.push(Box::new(new_level_iter(
                    c.inputs[parent].clone(),
                    self.table_cache.clone(),
                    self.opt.cmp.clone(),
                )));
            }
        }
        let icmp: Rc<Box<dyn Comparator>> = Rc::new(Box::new(self.icmp.clone()));
        Ok(Box::new(MergingIter::new(icmp, iters)))
    }

    /// Writes a snapshot edit describing the full current version into the (fresh) manifest.
    fn write_snapshot(&mut self) -> Result<usize> {
        assert!(self.descriptor_log.is_some());

        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.opt.cmp.name());
        edit.set_log_num(self.log_num);
        edit.set_next_file(self.next_file_num);
        edit.set_last_sequence(self.visible_seq_num);

        let current = self.current();
        let current = current.borrow();
        for level in 0..NUM_LEVELS {
            for f in &current.files[level] {
                edit.add_file(level, f.borrow().clone());
            }
        }
        self.descriptor_log.as_mut().unwrap().add_record(&edit.encode())
    }

    /// Applies an edit: computes the successor version, makes the edit durable in the MANIFEST
    /// (creating one and pointing CURRENT at it if none is open), and installs the new version.
    /// On failure the version is discarded; consumed file numbers stay consumed.
    pub fn log_and_apply(&mut self, mut edit: VersionEdit) -> Result<()> {
        assert!(self.current_version.is_some());

        if let Some(num) = edit.log_number {
            assert!(num >= self.log_num);
            assert!(num < self.next_file_num);
        } else {
            edit.set_log_num(self.log_num);
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_num(self.prev_log_num);
        }

        let created = self.descriptor_log.is_none();
        if created {
            self.manifest_num = self.new_file_number();
        }

        edit.set_next_file(self.next_file_num);
        edit.set_last_sequence(self.visible_seq_num);

        let mut v = Version::new(self.table_cache.clone(), self.opt.cmp.clone());
        {
            let mut builder = Builder::new();
            builder.apply(&edit);
            builder.save_to(&self.icmp, self.current_version.as_ref().unwrap(), &mut v);
        }
        self.finalize(&mut v);

        let result = (|| -> Result<()> {
            if created {
                let path = manifest_file_path(&self.db_path, self.manifest_num);
                let file = self.opt.env.open_writable_file(&path)?;
                self.descriptor_log = Some(LogWriter::new(file));
                self.write_snapshot()?;
            }

            let lw = self.descriptor_log.as_mut().unwrap();
            lw.add_record(&edit.encode())?;
            lw.sync()?;

            if created {
                set_current_file(self.opt.env.as_ref().as_ref(), &self.db_path, self.manifest_num)?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            if created {
                // The fresh manifest never became CURRENT; forget it so the next apply starts
                // over.
                self.descriptor_log = None;
                let _ = self
                    .opt
                    .env
                    .delete(&manifest_file_path(&self.db_path, self.manifest_num));
            }
            return Err(e);
        }

        self.log_num = edit.log_number.unwrap();
        self.add_version(v);
        Ok(())
    }

    /// Computes the compaction score of a version: the maximum over levels of size relative to
    /// the level's target, where level 0 counts files instead of bytes.
    fn finalize(&self, v: &mut Version) {
        let mut best_level = None;
        let mut best_score = None;

        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                v.files[0].len() as f64 / 4.0
            } else {
                total_size(v.files[level].iter()) as f64 / max_bytes_for_level(level)
            };
            if best_score.map_or(true, |s| s < score) {
                best_score = Some(score);
                best_level = Some(level);
            }
        }
        v.compaction_score = best_score;
        v.compaction_level = best_level;
    }

    /// Rebuilds the version set from CURRENT and the MANIFEST it names.
    pub fn recover(&mut self) -> Result<()> {
        let mut current_name = read_current_file(self.opt.env.as_ref().as_ref(), &self.db_path)?;
        current_name.truncate(current_name.len() - 1);
        let manifest_path = self.db_path.join(&current_name);

        let mut builder = Builder::new();
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        {
            let file = self.opt.env.open_sequential_file(&manifest_path)?;
            let mut reader = LogReader::new(file, true);
            let mut record = Vec::new();
            loop {
                let n = reader
                    .read(&mut record)
                    .map_err(|e| e.annotate("manifest replay"))?;
                if n == 0 {
                    break;
                }
                let edit = VersionEdit::decode_from(&record)?;

                if let Some(ref name) = edit.comparator_name {
                    if name != self.opt.cmp.name() {
                        return err(
                            StatusCode::InvalidArgument,
                            &format!(
                                "comparator mismatch: database uses {}, options supply {}",
                                name,
                                self.opt.cmp.name()
                            ),
                        );
                    }
                }
                if edit.log_number.is_some() {
                    log_number = edit.log_number;
                }
                if edit.prev_log_number.is_some() {
                    prev_log_number = edit.prev_log_number;
                }
                if edit.next_file_number.is_some() {
                    next_file_number = edit.next_file_number;
                }
                if edit.last_sequence.is_some() {
                    last_sequence = edit.last_sequence;
                }
                builder.apply(&edit);
            }
        }

        match (log_number, next_file_number, last_sequence) {
            (Some(log_number), Some(next_file_number), Some(last_sequence)) => {
                self.log_num = log_number;
                self.next_file_num = next_file_number;
                self.visible_seq_num = last_sequence;
                self.log_seq_num = last_sequence + 1;
                self.prev_log_num = prev_log_number.unwrap_or(0);
                self.mark_file_number_used(log_number);
                if let Some(prev) = prev_log_number {
                    self.mark_file_number_used(prev);
                }
            }
            _ => {
                return err(
                    StatusCode::Corruption,
                    "manifest is missing a log number, next file number or last sequence entry",
                )
            }
        }

        let mut v = Version::new(self.table_cache.clone(), self.opt.cmp.clone());
        builder.save_to(&self.icmp, self.current_version.as_ref().unwrap(), &mut v);
        self.finalize(&mut v);
        self.add_version(v);

        log!(
            self.opt.log,
            "recovered manifest {:?}: next_file={} log_num={} prev_log_num={} last_seq={}",
            current_name,
            self.next_file_num,
            self.log_num,
            self.prev_log_num,
            self.visible_seq_num
        );
        Ok(())
    }
}

/// Accumulates the per-level additions and deletions of one or more edits, then bakes them and a
/// base version into a new version.
struct Builder {
    deleted: [Vec<FileNum>; NUM_LEVELS],
    added: [Vec<FileMetaHandle>; NUM_LEVELS],
}

impl Builder {
    fn new() -> Builder {
        Builder {
            deleted: Default::default(),
            added: Default::default(),
        }
    }

    fn apply(&mut self, edit: &VersionEdit) {
        for &(level, num) in edit.deleted_files.iter() {
            self.deleted[level].push(num);
        }
        for (level, f) in edit.new_files.iter() {
            // An edit may re-add a file it deleted at the same level.
            self.deleted[*level].retain(|d| *d != f.num);
            self.added[*level].push(share(f.clone()));
        }
    }

    fn maybe_add_file(
        &mut self,
        icmp: &InternalKeyCmp,
        v: &mut Version,
        level: usize,
        f: FileMetaHandle,
    ) {
        if self.deleted[level].iter().any(|d| *d == f.borrow().num) {
            return;
        }
        if level > 0 {
            if let Some(last) = v.files[level].last() {
                // Levels above 0 must stay disjoint and sorted.
                assert_eq!(
                    icmp.compare(&last.borrow().largest, &f.borrow().smallest),
                    Ordering::Less
                );
            }
        }
        v.files[level].push(f);
    }

    fn save_to(&mut self, icmp: &InternalKeyCmp, base: &Shared<Version>, v: &mut Version) {
        for level in 0..NUM_LEVELS {
            sort_files_by_smallest(icmp, &mut self.added[level]);

            let added = self.added[level].clone();
            let base_files = base.borrow().files[level].clone();
            v.files[level].reserve(base_files.len() + added.len());

            let merged = merge_iters(added.into_iter(), base_files.into_iter(), |a, b| {
                icmp.compare(&a.borrow().smallest, &b.borrow().smallest)
            });
            for f in merged {
                self.maybe_add_file(icmp, v, level, f);
            }
        }
    }
}

pub fn manifest_file_name(num: FileNum) -> PathBuf {
    PathBuf::from(format!("MANIFEST-{:06}", num))
}

pub fn manifest_file_path<P: AsRef<Path>>(db_path: P, num: FileNum) -> PathBuf {
    db_path.as_ref().join(manifest_file_name(num))
}

fn temp_file_path<P: AsRef<Path>>(db_path: P, num: FileNum) -> PathBuf {
    db_path.as_ref().join(format!("{:06}.dbtmp", num))
}

fn current_file_path<P: AsRef<Path>>(db_path: P) -> PathBuf {
    db_path.as_ref().join("CURRENT")
}

/// Reads CURRENT; its content is the name of the active manifest plus a trailing newline.
pub fn read_current_file(env: &dyn Env, db_path: &Path) -> Result<String> {
    let mut contents = String::new();
    let mut f = env.open_sequential_file(&current_file_path(db_path))?;
    f.read_to_string(&mut contents)?;

    if contents.is_empty() || !contents.ends_with('\n') {
        return err(
            StatusCode::Corruption,
            "CURRENT file is empty or malformed",
        );
    }
    Ok(contents)
}

/// Atomically points CURRENT at the given manifest: write a temp file, then rename it over
/// CURRENT.
pub fn set_current_file(env: &dyn Env, db_path: &Path, manifest_num: FileNum) -> Result<()> {
    let tmp = temp_file_path(db_path, manifest_num);
    {
        let mut f = env.open_writable_file(&tmp)?;
        f.write_all(manifest_file_name(manifest_num).display().to_string().as_bytes())?;
        f.write_all(b"\n")?;
        f.sync()?;
    }
    if let Err(e) = env.rename(&tmp, &current_file_path(db_path)) {
        let _ = env.delete(&tmp);
        return Err(Status::from(e));
    }
    Ok(())
}

fn sort_files_by_smallest(icmp: &InternalKeyCmp, files: &mut [FileMetaHandle]) {
    files.sort_by(|a, b| icmp.compare(&a.borrow().smallest, &b.borrow().smallest))
}

/// Merges two sorted iterators into a sorted vector.
fn merge_iters<Item, C: Fn(&Item, &Item) -> Ordering, I: Iterator<Item = Item>, J: Iterator<Item = Item>>(
    mut iter_a: I,
    mut iter_b: J,
    cmp: C,
) -> Vec<Item> {
    let mut a = iter_a.next();
    let mut b = iter_b.next();
    let mut out = vec![];
    while a.is_some() && b.is_some() {
        if cmp(a.as_ref().unwrap(), b.as_ref().unwrap()) == Ordering::Less {
            out.push(a.take().unwrap());
            a = iter_a.next();
        } else {
            out.push(b.take().unwrap());
            b = iter_b.next();
        }
    }
    if let Some(a) = a {
        out.push(a);
    }
    if let Some(b) = b {
        out.push(b);
    }
    out.extend(iter_a);
    out.extend(iter_b);
    out
}

/// The smallest and largest internal keys covered by a set of files.
fn get_range<'a, C: Comparator, I: Iterator<Item = &'a FileMetaHandle>>(
    cmp: &C,
    files: I,
) -> (Vec<u8>, Vec<u8>) {
    let mut smallest: Option<Vec<u8>> = None;
    let mut largest: Option<Vec<u8>> = None;
    for f in files {
        let f = f.borrow();
        if smallest
            .as_ref()
            .map_or(true, |s| cmp.compare(&f.smallest, s) == Ordering::Less)
        {
            smallest = Some(f.smallest.clone());
        }
        if largest
            .as_ref()
            .map_or(true, |l| cmp.compare(&f.largest, l) == Ordering::Greater)
        {
            largest = Some(f.largest.clone());
        }
    }
    (smallest.unwrap(), largest.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikey::{make_internal_key, KIND_SET};
    use crate::types::FileMetaData;

    fn make_version_set(dir: &Path, opt: &Options) -> VersionSet {
        let cache = share(TableCache::new(dir, opt.clone()));
        VersionSet::new(dir, opt.clone(), cache)
    }

    fn meta(num: FileNum, size: usize, smallest: &str, largest: &str) -> FileMetaData {
        FileMetaData {
            num,
            size,
            smallest: make_internal_key(smallest.as_bytes(), 1, KIND_SET),
            largest: make_internal_key(largest.as_bytes(), 1, KIND_SET),
        }
    }

    #[test]
    fn test_file_number_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Options::default();
        let mut vs = make_version_set(dir.path(), &opt);

        let a = vs.new_file_number();
        let b = vs.new_file_number();
        assert_eq!(b, a + 1);
        vs.reuse_file_number(b);
        assert_eq!(vs.new_file_number(), b);
        vs.mark_file_number_used(100);
        assert_eq!(vs.new_file_number(), 101);
    }

    #[test]
    fn test_log_and_apply_updates_version_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Options::default();
        let mut vs = make_version_set(dir.path(), &opt);

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(9, 100, "a", "m"));
        vs.mark_file_number_used(9);
        vs.log_and_apply(edit).unwrap();

        assert_eq!(vs.current().borrow().num_level_files(0), 1);
        assert!(vs.live_files().contains(&9));
        assert!(opt
            .env
            .exists(&manifest_file_path(dir.path(), vs.manifest_num))
            .unwrap());
        let current = read_current_file(opt.env.as_ref().as_ref(), dir.path()).unwrap();
        assert_eq!(
            current.trim_end(),
            manifest_file_name(vs.manifest_num).display().to_string()
        );

        // A second edit reuses the open manifest and deletes the file again.
        let mut edit = VersionEdit::new();
        edit.delete_file(0, 9);
        vs.log_and_apply(edit).unwrap();
        assert_eq!(vs.current().borrow().num_level_files(0), 0);
    }

    #[test]
    fn test_recover_rebuilds_state() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Options::default();
        {
            let mut vs = make_version_set(dir.path(), &opt);
            vs.visible_seq_num = 41;
            vs.log_seq_num = 42;
            let mut edit = VersionEdit::new();
            edit.add_file(1, meta(7, 128, "d", "f"));
            edit.add_file(1, meta(8, 128, "a", "c"));
            vs.mark_file_number_used(8);
            vs.log_and_apply(edit).unwrap();
        }

        let mut vs = make_version_set(dir.path(), &opt);
        vs.recover().unwrap();
        assert_eq!(vs.visible_seq_num, 41);
        assert_eq!(vs.log_seq_num, 42);
        let v = vs.current();
        let v = v.borrow();
        assert_eq!(v.num_level_files(1), 2);
        // Sorted by smallest after recovery.
        assert_eq!(v.files[1][0].borrow().num, 8);
        assert_eq!(v.files[1][1].borrow().num, 7);
    }

    #[test]
    fn test_recover_rejects_comparator_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Options::default();
        {
            let mut vs = make_version_set(dir.path(), &opt);
            vs.log_and_apply(VersionEdit::new()).unwrap();
        }

        // Corrupt the persisted comparator name by writing a new manifest claiming another one.
        let mut vs = make_version_set(dir.path(), &opt);
        {
            let manifest = read_current_file(opt.env.as_ref().as_ref(), dir.path()).unwrap();
            let path = dir.path().join(manifest.trim_end());
            let mut edit = VersionEdit::new();
            edit.comparator_name = Some("some.other.Comparator".to_string());
            edit.set_log_num(0);
            edit.set_next_file(2);
            edit.set_last_sequence(0);
            let file = opt.env.open_writable_file(&path).unwrap();
            let mut lw = LogWriter::new(file);
            lw.add_record(&edit.encode()).unwrap();
            lw.flush().unwrap();
        }
        assert_eq!(
            vs.recover().err().unwrap().code,
            StatusCode::InvalidArgument
        );
    }

    #[test]
    fn test_finalize_scores() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Options::default();
        let vs = make_version_set(dir.path(), &opt);

        let mut v = Version::new(vs.table_cache.clone(), opt.cmp.clone());
        for i in 0..5 {
            v.files[0].push(share(meta(i + 1, 1000, "a", "z")));
        }
        vs.finalize(&mut v);
        assert_eq!(v.compaction_level, Some(0));
        assert!(v.compaction_score.unwrap() >= 1.0);

        let mut v = Version::new(vs.table_cache.clone(), opt.cmp.clone());
        v.files[1].push(share(meta(1, 20 << 20, "a", "z")));
        vs.finalize(&mut v);
        assert_eq!(v.compaction_level, Some(1));
        assert!(v.compaction_score.unwrap() >= 1.0);
    }

    #[test]
    fn test_pick_compaction_level0_pulls_overlaps() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Options::default();
        let mut vs = make_version_set(dir.path(), &opt);

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(2, 100, "a", "d"));
        edit.add_file(0, meta(3, 100, "c", "f"));
        edit.add_file(0, meta(4, 100, "x", "z"));
        edit.add_file(0, meta(5, 100, "e", "g"));
        edit.add_file(1, meta(6, 100, "a", "e"));
        vs.mark_file_number_used(6);
        vs.log_and_apply(edit).unwrap();

        let c = vs.pick_compaction().unwrap();
        assert_eq!(c.level(), 0);
        // Seeded anywhere in a..g, the transitive overlap pulls in files 2, 3 and 5 but not 4.
        let nums: HashSet<FileNum> = (0..c.num_inputs(0)).map(|i| c.input(0, i).num).collect();
        assert_eq!(nums, HashSet::from([2, 3, 5]));
        // Level 1 overlap comes along.
        assert_eq!(c.num_inputs(1), 1);
        assert_eq!(c.input(1, 0).num, 6);
        assert!(!c.is_trivial_move());
    }

    #[test]
    fn test_pick_compaction_trivial_move() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Options::default();
        let mut vs = make_version_set(dir.path(), &opt);

        // One oversized file at level 1, nothing at level 2.
        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(2, 40 << 20, "a", "c"));
        vs.mark_file_number_used(2);
        vs.log_and_apply(edit).unwrap();

        let mut c = vs.pick_compaction().unwrap();
        assert_eq!(c.level(), 1);
        assert_eq!(c.num_inputs(0), 1);
        assert_eq!(c.num_inputs(1), 0);
        assert!(c.is_trivial_move());
        assert!(c.is_base_level_for_user_key(b"b"));
    }

    #[test]
    fn test_compaction_pointer_rotates_through_level() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Options::default();
        let mut vs = make_version_set(dir.path(), &opt);

        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(2, 20 << 20, "a", "c"));
        edit.add_file(1, meta(3, 20 << 20, "e", "g"));
        vs.mark_file_number_used(3);
        vs.log_and_apply(edit).unwrap();

        let first = vs.pick_compaction().unwrap();
        assert_eq!(first.input(0, 0).num, 2);
        let second = vs.pick_compaction().unwrap();
        assert_eq!(second.input(0, 0).num, 3);
        // Past the last file, the pointer wraps around.
        let third = vs.pick_compaction().unwrap();
        assert_eq!(third.input(0, 0).num, 2);
    }
}
