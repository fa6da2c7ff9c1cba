use crate::block::Block;
use crate::cache::Cache;
use crate::cmp::{Comparator, DefaultCmp};
use crate::disk_env::PosixDiskEnv;
use crate::env::Env;
use crate::filter::BoxedFilterPolicy;
use crate::infolog::Logger;
use crate::merge::{BoxedMerger, ConcatMerger};
use crate::types::{share, Shared, NUM_LEVELS};

use std::rc::Rc;

const KIB: usize = 1 << 10;
const MIB: usize = 1024 * KIB;

/// Compression type of a table block, stored in the block's on-disk trailer.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

pub fn int_to_compression_type(i: u32) -> Option<CompressionType> {
    match i {
        0 => Some(CompressionType::None),
        1 => Some(CompressionType::Snappy),
        _ => None,
    }
}

/// Where a level's filter is placed: one filter per 2 KiB of data block ("filter.<name>") or one
/// filter over the whole table ("fullfilter.<name>").
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum FilterType {
    Block,
    Table,
}

/// Per-level tuning: the target size of table files written to the level and the optional filter
/// policy applied to them.
#[derive(Clone)]
pub struct LevelOptions {
    pub target_file_size: usize,
    pub filter_policy: Option<BoxedFilterPolicy>,
    pub filter_type: FilterType,
}

impl Default for LevelOptions {
    fn default() -> LevelOptions {
        LevelOptions {
            target_file_size: 2 * MIB,
            filter_policy: None,
            filter_type: FilterType::Block,
        }
    }
}

/// Options for opening and operating a database. The defaults are sane for light use.
#[derive(Clone)]
pub struct Options {
    /// The user key order. Its name is persisted in the first manifest edit and checked on open.
    pub cmp: Rc<Box<dyn Comparator>>,
    /// The fold applied to MERGE entries during reads and compactions.
    pub merger: BoxedMerger,
    pub env: Rc<Box<dyn Env>>,
    pub log: Option<Shared<Logger>>,

    pub create_if_missing: bool,
    pub error_if_exists: bool,

    /// Capacity of a memtable; a batch that does not fit rotates the memtable.
    pub write_buffer_size: usize,
    /// Upper bound on open files; the table cache gets this minus a reserve.
    pub max_open_files: usize,
    /// Cache of decompressed table blocks, shareable between databases.
    pub block_cache: Shared<Cache<Block>>,

    pub block_size: usize,
    pub block_restart_interval: usize,
    pub compression: CompressionType,

    /// Per-level options, indexed by level; the last entry covers all deeper levels.
    pub levels: Vec<LevelOptions>,

    /// Whether commits sync the write-ahead log before returning.
    pub sync_writes: bool,

    /// (bytes per second, burst bytes) for user writes; 0 disables limiting.
    pub write_rate: (usize, usize),
    /// (bytes per second, burst bytes) for compaction writes; 0 disables limiting.
    pub compaction_rate: (usize, usize),
}

const DEFAULT_RATE: (usize, usize) = (50 * MIB, MIB);

impl Default for Options {
    fn default() -> Options {
        Options {
            cmp: Rc::new(Box::new(DefaultCmp)),
            merger: Rc::new(Box::new(ConcatMerger)),
            env: Rc::new(Box::new(PosixDiskEnv::new())),
            log: None,
            create_if_missing: true,
            error_if_exists: false,
            write_buffer_size: 4 * MIB,
            max_open_files: 1000,
            block_cache: share(Cache::new(1024)),
            block_size: 4 * KIB,
            block_restart_interval: 16,
            compression: CompressionType::Snappy,
            levels: vec![LevelOptions::default(); NUM_LEVELS],
            sync_writes: false,
            write_rate: DEFAULT_RATE,
            compaction_rate: DEFAULT_RATE,
        }
    }
}

impl Options {
    /// The options of `level`, falling back to the last configured entry for deeper levels.
    pub fn level(&self, level: usize) -> &LevelOptions {
        assert!(!self.levels.is_empty());
        &self.levels[level.min(self.levels.len() - 1)]
    }

    pub fn target_file_size(&self, level: usize) -> usize {
        self.level(level).target_file_size
    }
}
