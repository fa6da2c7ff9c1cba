//! shaledb is an embedded, ordered, persistent key-value store in the leveled
//! log-structured-merge family: a durable map from byte-string keys to byte-string values with
//! point lookups, forward and reverse range iteration, atomic batched writes, point and range
//! deletes, and user-defined merge operators.
//!
//! Writes are staged in an in-memory table and a write-ahead log, then flushed into immutable
//! sorted table files. Tables are organized into levels and continuously compacted; a
//! MANIFEST log of version edits makes the level structure crash-recoverable.
//!
//! ```no_run
//! use shaledb::{Batch, Options, DB};
//!
//! let mut db = DB::open("demo-db", Options::default()).unwrap();
//! db.put(b"cherry", b"red").unwrap();
//!
//! let mut batch = Batch::new();
//! batch.set(b"grape", b"green").unwrap();
//! batch.delete(b"cherry").unwrap();
//! db.apply(batch).unwrap();
//!
//! assert_eq!(db.get(b"grape").unwrap(), Some(b"green".to_vec()));
//! assert_eq!(db.get(b"cherry").unwrap(), None);
//! ```

#[macro_use]
pub mod infolog;

pub mod batch;
pub mod block;
pub mod blockhandle;
pub mod cache;
pub mod cmp;
pub mod compaction_iter;
pub mod db_impl;
pub mod db_iter;
pub mod disk_env;
pub mod env;
pub mod error;
pub mod filter;
pub mod filter_block;
pub mod ikey;
pub mod log;
pub mod memtable;
pub mod merge;
pub mod merging_iter;
pub mod options;
pub mod rate;
pub mod skipmap;
pub mod table_builder;
pub mod table_cache;
pub mod table_reader;
pub mod types;
pub mod version;
pub mod version_edit;
pub mod version_set;

#[cfg(test)]
mod test_util;

pub use crate::batch::Batch;
pub use crate::cmp::{Comparator, DefaultCmp};
pub use crate::db_impl::DB;
pub use crate::db_iter::DBIterator;
pub use crate::error::{Result, Status, StatusCode};
pub use crate::filter::{BloomPolicy, FilterPolicy};
pub use crate::merge::{ConcatMerger, Merger};
pub use crate::options::{CompressionType, FilterType, LevelOptions, Options};
pub use crate::types::SequenceNumber;
