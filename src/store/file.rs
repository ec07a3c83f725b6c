use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{ResultStore, StatusStore, check_transition, validate_key};
use crate::error::StoreError;
use crate::job::JobStatusRecord;

/// Filesystem-backed store rooted at the data directory.
///
/// Layout:
/// - `<root>/<job_id>_status.txt` holds `status,progress,total`
/// - `<root>/progress/<job_id>.count` holds the live counter
/// - `<root>/results/<key>.json` holds one persisted task result
///
/// Every write goes through a temp file and a rename, so readers never see a
/// half-written record. Read-modify-write operations hold an exclusive
/// advisory lock on `<root>/.store.lock`, which also serialises separate
/// processes sharing the directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    local: Mutex<()>,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("progress"))?;
        fs::create_dir_all(root.join("results"))?;
        Ok(Self {
            root,
            local: Mutex::new(()),
        })
    }

    fn status_path(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        validate_key(job_id)?;
        Ok(self.root.join(format!("{job_id}_status.txt")))
    }

    fn progress_path(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        validate_key(job_id)?;
        Ok(self.root.join("progress").join(format!("{job_id}.count")))
    }

    fn result_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join("results").join(format!("{key}.json")))
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _local = self.local.lock();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(".store.lock"))?;
        lock.lock_exclusive()?;
        let out = f();
        FileExt::unlock(&lock)?;
        out
    }

    fn read_counter(path: &Path) -> Result<Option<u64>, StoreError> {
        match read_optional(path)? {
            Some(text) => text
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display()))),
            None => Ok(None),
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_optional(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

impl StatusStore for FileStore {
    fn get(&self, job_id: &str) -> Result<Option<JobStatusRecord>, StoreError> {
        let path = self.status_path(job_id)?;
        read_optional(&path)?
            .map(|line| JobStatusRecord::parse_line(&line))
            .transpose()
    }

    fn set(&self, job_id: &str, record: JobStatusRecord) -> Result<(), StoreError> {
        let path = self.status_path(job_id)?;
        self.locked(|| {
            let current = read_optional(&path)?
                .map(|line| JobStatusRecord::parse_line(&line))
                .transpose()?;
            check_transition(job_id, current.as_ref(), &record)?;
            write_atomic(&path, record.to_line().as_bytes())
        })
    }

    fn increment_progress(&self, job_id: &str) -> Result<u64, StoreError> {
        let path = self.progress_path(job_id)?;
        self.locked(|| {
            let next = Self::read_counter(&path)?.unwrap_or(0) + 1;
            write_atomic(&path, next.to_string().as_bytes())?;
            Ok(next)
        })
    }

    fn progress(&self, job_id: &str) -> Result<Option<u64>, StoreError> {
        Self::read_counter(&self.progress_path(job_id)?)
    }

    fn delete_progress(&self, job_id: &str) -> Result<(), StoreError> {
        let path = self.progress_path(job_id)?;
        self.locked(|| remove_optional(&path))
    }

    fn delete_status(&self, job_id: &str) -> Result<(), StoreError> {
        let path = self.status_path(job_id)?;
        self.locked(|| remove_optional(&path))
    }
}

impl ResultStore for FileStore {
    fn put_result(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.result_path(key)?, value)
    }

    fn get_result(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.result_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn result_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(self.root.join("results"))? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = name.strip_suffix(".json") {
                if key.starts_with(prefix) {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete_result(&self, key: &str) -> Result<(), StoreError> {
        remove_optional(&self.result_path(key)?)
    }
}
