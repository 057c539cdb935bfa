//! Versioned Action Store
//!
//! One plain-text backing file per domain holding the induced action
//! definitions. Mutation goes through a [`StoreTransaction`]:
//!
//! ```text
//! begin ──► stage(additions) ──► commit   (drop backup, append history)
//!   │              │
//!   │              └───────────► abort    (restore S0 atomically)
//!   └─ lock file held until the transaction ends
//! ```
//!
//! Every file replacement is a write to a temporary sibling followed by an
//! atomic rename, so readers only ever observe S0 or S0 + additions.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HISTORY_DIR: &str = ".history";
const BACKUP_DIR: &str = "backups";

/// Stores with an open transaction in this process
static ACTIVE: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Action store '{0}' is locked by another induction (remove {1} if stale)")]
    Locked(String, PathBuf),

    #[error("Action store {0} changed outside the transaction")]
    Conflict(PathBuf),

    #[error("Nothing staged in transaction")]
    NothingStaged,

    #[error("Corrupt history record: {0}")]
    History(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Content hash used as a store version
pub fn content_version(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Replace a file's contents atomically
pub fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// One committed mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub seq: u64,
    pub version: String,
    pub parent: String,
    pub added_bytes: usize,
    pub committed_at: DateTime<Utc>,
}

/// Backing store of one domain
#[derive(Debug, Clone)]
pub struct ActionStore {
    dir: PathBuf,
    domain: String,
    path: PathBuf,
}

impl ActionStore {
    /// Open (creating if needed) `<dir>/<domain>.py`
    ///
    /// A staging backup left by an interrupted transaction is restored.
    pub fn open(dir: impl Into<PathBuf>, domain: &str) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let store = Self {
            path: dir.join(format!("{}.py", domain)),
            dir,
            domain: domain.to_string(),
        };

        let backup = store.staging_backup_path();
        let holder = store.lock_holder().filter(|pid| process_alive(*pid));
        if let (true, Some(pid)) = (backup.exists(), holder) {
            warn!(domain, pid, "Action store has a transaction in flight, not recovering");
        } else if backup.exists() && !ACTIVE.lock().contains(&store.path) {
            warn!(domain, "Restoring action store from interrupted transaction");
            let original = fs::read_to_string(&backup).map_err(io_err(&backup))?;
            atomic_write(&store.path, &original).map_err(io_err(&store.path))?;
            fs::remove_file(&backup).map_err(io_err(&backup))?;
            let lock = store.lock_path();
            if lock.exists() {
                fs::remove_file(&lock).map_err(io_err(&lock))?;
            }
        }

        if !store.path.exists() {
            atomic_write(&store.path, "").map_err(io_err(&store.path))?;
        }
        Ok(store)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<String, StoreError> {
        fs::read_to_string(&self.path).map_err(io_err(&self.path))
    }

    pub fn version(&self) -> Result<String, StoreError> {
        self.read().map(|c| content_version(&c))
    }

    fn staging_backup_path(&self) -> PathBuf {
        self.dir.join(format!(".{}.py.staging", self.domain))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!(".{}.lock", self.domain))
    }

    /// PID recorded in the lock file, if any
    fn lock_holder(&self) -> Option<u32> {
        fs::read_to_string(self.lock_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_DIR).join(format!("{}.log", self.domain))
    }

    /// Committed versions, oldest first
    pub fn history(&self) -> Result<Vec<CommitRecord>, StoreError> {
        let path = self.history_path();
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_err(&path))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| StoreError::History(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Write a timestamped snapshot `{domain}_{label}_{YYYYmmdd_HHMMSS}.py`
    pub fn backup(&self, label: &str) -> Result<PathBuf, StoreError> {
        let content = self.read()?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self
            .dir
            .join(BACKUP_DIR)
            .join(format!("{}_{}_{}.py", self.domain, label, stamp));
        atomic_write(&path, &content).map_err(io_err(&path))?;
        info!(domain = %self.domain, path = %path.display(), "Backed up action store");
        Ok(path)
    }

    /// Start a transaction, holding the domain lock until it ends
    pub fn begin(&self) -> Result<StoreTransaction<'_>, StoreError> {
        let lock = LockGuard::acquire(self)?;
        let original = self.read()?;
        debug!(domain = %self.domain, version = %content_version(&original), "Began store transaction");
        Ok(StoreTransaction {
            store: self,
            original,
            staged: None,
            finished: false,
            _lock: lock,
        })
    }

    fn append_history(&self, parent: &str, version: &str, added_bytes: usize) -> Result<CommitRecord, StoreError> {
        let seq = self.history()?.last().map_or(1, |r| r.seq + 1);
        let record = CommitRecord {
            seq,
            version: version.to_string(),
            parent: parent.to_string(),
            added_bytes,
            committed_at: Utc::now(),
        };
        let path = self.history_path();
        if let Some(parent_dir) = path.parent() {
            fs::create_dir_all(parent_dir).map_err(io_err(parent_dir))?;
        }
        let line = serde_json::to_string(&record).map_err(|e| StoreError::History(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        writeln!(file, "{}", line).map_err(io_err(&path))?;
        Ok(record)
    }
}

/// Whether a process with this PID is running
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without procfs every recorded holder is assumed alive
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

struct LockGuard {
    path: PathBuf,
    store_path: PathBuf,
}

impl LockGuard {
    fn acquire(store: &ActionStore) -> Result<Self, StoreError> {
        let path = store.lock_path();
        {
            let mut active = ACTIVE.lock();
            if !active.insert(store.path.clone()) {
                return Err(StoreError::Locked(store.domain.clone(), path));
            }
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let guard = Self {
                    path,
                    store_path: store.path.clone(),
                };
                writeln!(file, "{}", std::process::id())
                    .and_then(|_| file.sync_all())
                    .map_err(io_err(&guard.path))?;
                Ok(guard)
            }
            Err(e) => {
                ACTIVE.lock().remove(&store.path);
                if e.kind() == io::ErrorKind::AlreadyExists {
                    Err(StoreError::Locked(store.domain.clone(), path))
                } else {
                    Err(io_err(&path)(e))
                }
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove store lock");
        }
        ACTIVE.lock().remove(&self.store_path);
    }
}

/// Staged mutation of one store
///
/// Dropping an unfinished transaction aborts it.
pub struct StoreTransaction<'s> {
    store: &'s ActionStore,
    original: String,
    staged: Option<String>,
    finished: bool,
    _lock: LockGuard,
}

impl<'s> StoreTransaction<'s> {
    pub fn store(&self) -> &ActionStore {
        self.store
    }

    /// Content at `begin`
    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn staged(&self) -> Option<&str> {
        self.staged.as_deref()
    }

    /// Append definitions, keeping a verbatim copy of the original
    pub fn stage(&mut self, additions: &[String]) -> Result<&str, StoreError> {
        let backup = self.store.staging_backup_path();
        if self.staged.is_none() {
            atomic_write(&backup, &self.original).map_err(io_err(&backup))?;
        }
        let content = format!("{}\n\n{}", self.original, additions.join("\n\n"));
        atomic_write(&self.store.path, &content).map_err(io_err(&self.store.path))?;
        debug!(
            domain = %self.store.domain,
            additions = additions.len(),
            version = %content_version(&content),
            "Staged actions"
        );
        Ok(self.staged.insert(content).as_str())
    }

    pub fn commit(mut self) -> Result<CommitRecord, StoreError> {
        let staged = self.staged.clone().ok_or(StoreError::NothingStaged)?;
        let current = self.store.read()?;
        if current != staged {
            return Err(StoreError::Conflict(self.store.path.clone()));
        }

        let backup = self.store.staging_backup_path();
        fs::remove_file(&backup).map_err(io_err(&backup))?;
        self.finished = true;

        let record = self.store.append_history(
            &content_version(&self.original),
            &content_version(&staged),
            staged.len().saturating_sub(self.original.len()),
        )?;
        info!(domain = %self.store.domain, seq = record.seq, version = %record.version, "Committed action store");
        Ok(record)
    }

    pub fn abort(mut self) -> Result<(), StoreError> {
        self.restore()?;
        self.finished = true;
        info!(domain = %self.store.domain, "Reverted action store");
        Ok(())
    }

    fn restore(&mut self) -> Result<(), StoreError> {
        if self.staged.take().is_none() {
            return Ok(());
        }
        atomic_write(&self.store.path, &self.original).map_err(io_err(&self.store.path))?;
        let backup = self.store.staging_backup_path();
        if backup.exists() {
            fs::remove_file(&backup).map_err(io_err(&backup))?;
        }
        Ok(())
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.restore() {
            warn!(domain = %self.store.domain, error = %e, "Failed to restore action store on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const S0: &str = "def a():\n    \"\"\"A.\n\n    Examples:\n        a()\n    \"\"\"\n    noop()\n";

    fn store(dir: &TempDir) -> ActionStore {
        let store = ActionStore::open(dir.path(), "shopping").unwrap();
        fs::write(store.path(), S0).unwrap();
        store
    }

    #[test]
    fn test_commit_appends() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut tx = store.begin().unwrap();
        tx.stage(&["def b():\n    noop()".to_string()]).unwrap();
        let record = tx.commit().unwrap();

        let content = store.read().unwrap();
        assert_eq!(content, format!("{}\n\ndef b():\n    noop()", S0));
        assert_eq!(record.seq, 1);
        assert_eq!(record.parent, content_version(S0));
        assert_eq!(record.version, store.version().unwrap());
        assert_eq!(store.history().unwrap(), vec![record]);
        assert!(!store.staging_backup_path().exists());
        assert!(!store.lock_path().exists());
    }

    #[test]
    fn test_abort_restores_exactly() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut tx = store.begin().unwrap();
        tx.stage(&["def b():\n    noop()".to_string()]).unwrap();
        assert_ne!(store.read().unwrap(), S0);
        tx.abort().unwrap();
        assert_eq!(store.read().unwrap(), S0);
        assert!(store.history().unwrap().is_empty());
    }

    #[test]
    fn test_drop_aborts() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        {
            let mut tx = store.begin().unwrap();
            tx.stage(&["def b():\n    noop()".to_string()]).unwrap();
        }
        assert_eq!(store.read().unwrap(), S0);
    }

    #[test]
    fn test_single_writer() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let tx = store.begin().unwrap();
        assert!(matches!(store.begin(), Err(StoreError::Locked(..))));
        drop(tx);
        assert!(store.begin().is_ok());
    }

    #[test]
    fn test_recover_interrupted_stage() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(store.staging_backup_path(), S0).unwrap();
        fs::write(store.path(), format!("{}\n\ndef half", S0)).unwrap();

        let reopened = ActionStore::open(dir.path(), "shopping").unwrap();
        assert_eq!(reopened.read().unwrap(), S0);
        assert!(!reopened.staging_backup_path().exists());
    }

    #[test]
    fn test_live_lock_holder_blocks_recovery() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let staged = format!("{}\n\ndef b():\n    noop()", S0);
        fs::write(store.staging_backup_path(), S0).unwrap();
        fs::write(store.path(), &staged).unwrap();
        fs::write(store.lock_path(), format!("{}\n", std::process::id())).unwrap();

        let reopened = ActionStore::open(dir.path(), "shopping").unwrap();
        assert_eq!(reopened.read().unwrap(), staged);
        assert!(reopened.staging_backup_path().exists());
        assert!(reopened.lock_path().exists());
        assert!(matches!(reopened.begin(), Err(StoreError::Locked(..))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dead_lock_holder_is_recovered() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(store.staging_backup_path(), S0).unwrap();
        fs::write(store.path(), format!("{}\n\ndef half", S0)).unwrap();
        // above the kernel's pid_max
        fs::write(store.lock_path(), "4194305\n").unwrap();

        let reopened = ActionStore::open(dir.path(), "shopping").unwrap();
        assert_eq!(reopened.read().unwrap(), S0);
        assert!(!reopened.lock_path().exists());
    }

    #[test]
    fn test_lock_records_pid() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let _tx = store.begin().unwrap();
        assert_eq!(store.lock_holder(), Some(std::process::id()));
    }

    #[test]
    fn test_backup_snapshot_name() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let path = store.backup("step_10").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("shopping_step_10_"));
        assert!(name.ends_with(".py"));
        assert_eq!(fs::read_to_string(path).unwrap(), S0);
    }
}
