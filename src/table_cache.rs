//! A read-through cache of open table readers, keyed by file number. Iterators hand out clones
//! of the reader, so evicting a table defers its teardown until the last iterator over it drops.

use crate::cache::{cache_key, Cache};
use crate::error::{err, Result, StatusCode};
use crate::options::Options;
use crate::table_reader::{Table, TableIterator};
use crate::types::FileNum;

use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Open files not used for tables: the WAL, the manifest, the info log and some slack.
const NUM_NON_TABLE_FILES: usize = 10;
const MIN_TABLE_CACHE_SIZE: usize = 64;

pub fn table_file_name<P: AsRef<Path>>(db_path: P, num: FileNum) -> PathBuf {
    assert!(num > 0);
    db_path.as_ref().join(format!("{:06}.sst", num))
}

pub struct TableCache {
    db_path: PathBuf,
    cache: Cache<Table>,
    opt: Options,
}

impl TableCache {
    pub fn new<P: AsRef<Path>>(db_path: P, opt: Options) -> TableCache {
        let capacity = opt
            .max_open_files
            .saturating_sub(NUM_NON_TABLE_FILES)
            .max(MIN_TABLE_CACHE_SIZE);
        TableCache {
            db_path: db_path.as_ref().to_owned(),
            cache: Cache::new(capacity),
            opt,
        }
    }

    /// Point lookup through the cache; see Table::get for the contract.
    pub fn get(&mut self, file_num: FileNum, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.get_table(file_num)?.get(key)
    }

    /// Returns an iterator over the table, opening and caching it if needed. The iterator pins
    /// the reader.
    pub fn new_iter(&mut self, file_num: FileNum) -> Result<TableIterator> {
        Ok(self.get_table(file_num)?.iter())
    }

    /// Returns the table from cache, or opens the backing file, caching the reader.
    pub fn get_table(&mut self, file_num: FileNum) -> Result<Table> {
        let key = cache_key(file_num, 0);
        if let Some(t) = self.cache.get(&key) {
            return Ok(t.clone());
        }
        self.open_table(file_num)
    }

    fn open_table(&mut self, file_num: FileNum) -> Result<Table> {
        let path = table_file_name(&self.db_path, file_num);
        let file_size = self.opt.env.size_of(&path)?;
        if file_size == 0 {
            return err(StatusCode::InvalidData, "table file is empty");
        }
        let file = Rc::new(self.opt.env.open_random_access_file(&path)?);
        let table = Table::new(self.opt.clone(), file, file_size, file_num)
            .map_err(|e| e.annotate(format!("table {:06}", file_num)))?;
        self.cache.insert(&cache_key(file_num, 0), table.clone());
        Ok(table)
    }

    /// Drops a table from the cache; the reader closes when the last outstanding clone drops.
    pub fn evict(&mut self, file_num: FileNum) -> Result<()> {
        if self.cache.remove(&cache_key(file_num, 0)).is_some() {
            Ok(())
        } else {
            err(StatusCode::NotFound, "table not present in cache")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikey::{make_internal_key, LookupKey, KIND_SET};
    use crate::table_builder::TableBuilder;
    use crate::types::{current_key_val, InternalIterator};

    use std::io::Write;

    fn write_test_table(opt: &Options, dir: &Path, num: FileNum) {
        let level_opt = opt.level(0).clone();
        let mut b = TableBuilder::new(opt.clone(), level_opt, Vec::new());
        for i in 0..50 {
            b.add(
                &make_internal_key(format!("k{:03}", i).as_bytes(), i + 1, KIND_SET),
                format!("v{}", i).as_bytes(),
            )
            .unwrap();
        }
        let (_, data) = b.finish().unwrap();
        let mut f = opt.env.open_writable_file(&table_file_name(dir, num)).unwrap();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
    }

    #[test]
    fn test_table_cache_open_get_evict() {
        let dir = tempfile::tempdir().unwrap();
        let opt = Options::default();
        write_test_table(&opt, dir.path(), 5);

        let mut tc = TableCache::new(dir.path(), opt);
        assert!(tc.evict(5).is_err());
        assert!(tc.get_table(5).is_ok());
        assert!(tc.get_table(5).is_ok());

        let lookup = LookupKey::new(b"k007", 1000);
        let (_, v) = tc.get(5, lookup.internal_key()).unwrap().unwrap();
        assert_eq!(v, b"v7".to_vec());

        // An iterator taken before eviction keeps working afterwards.
        let mut it = tc.new_iter(5).unwrap();
        tc.evict(5).unwrap();
        assert!(tc.evict(5).is_err());
        it.first();
        assert!(it.valid());
        assert_eq!(
            current_key_val(&it).unwrap().1,
            b"v0".to_vec()
        );

        assert!(tc.get_table(6).is_err());
    }
}
