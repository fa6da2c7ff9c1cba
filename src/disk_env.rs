use crate::env::{path_to_str, Env, FileLock, RandomAccess, WritableFile};
use crate::error::{err, Result, Status, StatusCode};
use crate::infolog::Logger;

use fs2::FileExt;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::FileExt as UnixFileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The POSIX filesystem environment. Locks are tracked per-process so that two handles within the
/// same process cannot both hold the same database directory.
#[derive(Clone)]
pub struct PosixDiskEnv {
    locks: Arc<Mutex<HashMap<String, File>>>,
}

impl PosixDiskEnv {
    pub fn new() -> PosixDiskEnv {
        PosixDiskEnv {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for PosixDiskEnv {
    fn default() -> Self {
        PosixDiskEnv::new()
    }
}

/// Annotates an io::Error with the operation and the file it concerned.
fn map_err_with_name(method: &'static str, path: &Path, e: io::Error) -> Status {
    let mut s = Status::from(e);
    s.err = format!("{}: {}: {}", method, s.err, path_to_str(path));
    s
}

impl RandomAccess for File {
    fn read_at(&self, off: usize, dst: &mut [u8]) -> Result<usize> {
        Ok(UnixFileExt::read_at(self, dst, off as u64)?)
    }
}

impl WritableFile for File {
    fn sync(&mut self) -> Result<()> {
        Ok(File::sync_data(self)?)
    }
}

impl Env for PosixDiskEnv {
    fn open_sequential_file(&self, p: &Path) -> Result<Box<dyn Read>> {
        Ok(Box::new(
            fs::OpenOptions::new()
                .read(true)
                .open(p)
                .map_err(|e| map_err_with_name("open (seq)", p, e))?,
        ))
    }

    fn open_random_access_file(&self, p: &Path) -> Result<Box<dyn RandomAccess>> {
        Ok(fs::OpenOptions::new()
            .read(true)
            .open(p)
            .map(|f| Box::new(f) as Box<dyn RandomAccess>)
            .map_err(|e| map_err_with_name("open (random)", p, e))?)
    }

    fn open_writable_file(&self, p: &Path) -> Result<Box<dyn WritableFile>> {
        Ok(Box::new(
            fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(p)
                .map_err(|e| map_err_with_name("open (write)", p, e))?,
        ))
    }

    fn open_appendable_file(&self, p: &Path) -> Result<Box<dyn WritableFile>> {
        Ok(Box::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .map_err(|e| map_err_with_name("open (append)", p, e))?,
        ))
    }

    fn exists(&self, p: &Path) -> Result<bool> {
        Ok(p.exists())
    }

    fn children(&self, p: &Path) -> Result<Vec<PathBuf>> {
        let dir_reader = fs::read_dir(p).map_err(|e| map_err_with_name("children", p, e))?;
        Ok(dir_reader
            .filter_map(|e| e.ok().map(|e| PathBuf::from(e.file_name())))
            .collect())
    }

    fn size_of(&self, p: &Path) -> Result<usize> {
        let meta = fs::metadata(p).map_err(|e| map_err_with_name("size_of", p, e))?;
        Ok(meta.len() as usize)
    }

    fn delete(&self, p: &Path) -> Result<()> {
        Ok(fs::remove_file(p).map_err(|e| map_err_with_name("delete", p, e))?)
    }

    fn mkdir(&self, p: &Path) -> Result<()> {
        Ok(fs::create_dir_all(p).map_err(|e| map_err_with_name("mkdir", p, e))?)
    }

    fn rmdir(&self, p: &Path) -> Result<()> {
        Ok(fs::remove_dir_all(p).map_err(|e| map_err_with_name("rmdir", p, e))?)
    }

    fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        Ok(fs::rename(old, new).map_err(|e| map_err_with_name("rename", old, e))?)
    }

    fn lock(&self, p: &Path) -> Result<FileLock> {
        let mut locks = self.locks.lock().unwrap();
        let id = p.to_string_lossy().to_string();

        if locks.contains_key(&id) {
            return err(StatusCode::LockError, "lock is held by this process");
        }

        let f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(p)
            .map_err(|e| map_err_with_name("lock", p, e))?;

        match f.try_lock_exclusive() {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                return err(
                    StatusCode::LockError,
                    "database lock is held by another process",
                )
            }
            Err(_) => {
                return Err(Status::new(
                    StatusCode::Errno(errno::errno()),
                    &format!("unknown lock error on {}", p.display()),
                ))
            }
            _ => (),
        };

        locks.insert(id.clone(), f);
        Ok(FileLock { id })
    }

    fn unlock(&self, lock: FileLock) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        match locks.remove(&lock.id) {
            None => err(
                StatusCode::LockError,
                &format!("unlocking a file that is not locked: {}", lock.id),
            ),
            Some(f) => {
                if FileExt::unlock(&f).is_err() {
                    return err(StatusCode::LockError, &format!("unlock failed: {}", lock.id));
                }
                Ok(())
            }
        }
    }

    fn new_logger(&self, p: &Path) -> Result<Logger> {
        self.open_appendable_file(p).map(|f| Logger::new(Box::new(f)))
    }

    fn micros(&self) -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_micros() as u64,
            Err(_) => 0,
        }
    }

    fn sleep_for(&self, micros: u32) {
        thread::sleep(Duration::from_micros(micros as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_files_roundtrip() {
        let env = PosixDiskEnv::new();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.txt");

        {
            let mut f = env.open_writable_file(&p).unwrap();
            f.write_all(b"hello").unwrap();
            f.sync().unwrap();
        }
        assert!(env.exists(&p).unwrap());
        assert_eq!(env.size_of(&p).unwrap(), 5);

        {
            let f = env.open_random_access_file(&p).unwrap();
            let mut buf = [0u8; 3];
            assert_eq!(f.read_at(2, &mut buf).unwrap(), 3);
            assert_eq!(&buf, b"llo");
        }

        {
            let mut f = env.open_appendable_file(&p).unwrap();
            f.write_all(b" world").unwrap();
            f.flush().unwrap();
        }
        let mut s = String::new();
        env.open_sequential_file(&p).unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello world");

        assert_eq!(env.children(dir.path()).unwrap().len(), 1);
        env.delete(&p).unwrap();
        assert!(!env.exists(&p).unwrap());
    }

    #[test]
    fn test_locking_within_process() {
        let env = PosixDiskEnv::new();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("LOCK");

        let l = env.lock(&p).unwrap();
        assert_eq!(
            env.lock(&p).err().unwrap().code,
            StatusCode::LockError
        );
        env.unlock(l).unwrap();
        let l2 = env.lock(&p).unwrap();
        env.unlock(l2).unwrap();
    }
}
