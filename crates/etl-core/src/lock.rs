//! Cross-process run locks keyed on the set of actions a run executes.
//!
//! Each running overseer owns one file `<prefix><pid>` in the lock directory:
//! the pid on the first line, one action name per following line, held under
//! an exclusive `flock` for the life of the run. A file whose lock can be
//! taken belongs to a process that is gone and is reclaimed. Two runs only
//! conflict when their action sets intersect.
//!
//! Our own record is published before the directory is scanned, so of two
//! runs starting at the same moment at least one sees the other.

use crate::error::{EtlError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Contents of one lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub path: PathBuf,
    pub pid: Option<i32>,
    pub actions: Vec<String>,
    /// Whether the owning process still holds the lock.
    pub live: bool,
}

impl LockRecord {
    fn parse(path: PathBuf, contents: &str, live: bool) -> Self {
        let mut lines = contents.lines();
        let pid = lines.next().and_then(|l| l.trim().parse().ok());
        let actions = lines
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        LockRecord {
            path,
            pid,
            actions,
            live,
        }
    }
}

struct Held {
    path: PathBuf,
    actions: Vec<String>,
    // Dropping the guard releases the advisory lock.
    _guard: Flock<File>,
}

pub struct LockFile {
    dir: PathBuf,
    prefix: String,
    pid: i32,
    held: Option<Held>,
}

impl LockFile {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self::with_pid(dir, prefix, nix::unistd::getpid().as_raw())
    }

    /// Lock file recorded under an explicit pid.
    pub fn with_pid(dir: impl Into<PathBuf>, prefix: impl Into<String>, pid: i32) -> Self {
        LockFile {
            dir: dir.into(),
            prefix: prefix.into(),
            pid,
            held: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_locked(&self) -> bool {
        self.held.is_some()
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, self.pid))
    }

    pub fn actions(&self) -> &[String] {
        self.held.as_ref().map(|h| h.actions.as_slice()).unwrap_or(&[])
    }

    /// Claim `actions` for this process. Fails with
    /// [`EtlError::LockConflict`] when a live run already claims any of them.
    pub fn lock(&mut self, actions: &[String]) -> Result<()> {
        self.unlock()?;
        fs::create_dir_all(&self.dir).map_err(|e| self.dir_error(e))?;

        let held = self.publish(actions)?;
        let own = held.path.clone();
        self.held = Some(held);

        if let Err(e) = self.check_conflicts(&own, actions) {
            self.unlock()?;
            return Err(e);
        }
        info!(pid = self.pid, path = %own.display(), actions = actions.len(), "lock acquired");
        Ok(())
    }

    /// Release and delete the lock file. A no-op when nothing is held.
    pub fn unlock(&mut self) -> Result<()> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        match fs::remove_file(&held.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.dir_error(e)),
        }
        debug!(pid = self.pid, path = %held.path.display(), "lock released");
        Ok(())
    }

    fn publish(&self, actions: &[String]) -> Result<Held> {
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| self.dir_error(e))?;
        let handle = tmp.as_file().try_clone().map_err(|e| self.dir_error(e))?;
        let guard = Flock::lock(handle, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| self.dir_error(errno.into()))?;

        let mut contents = format!("{}\n", self.pid);
        for action in actions {
            contents.push_str(action);
            contents.push('\n');
        }
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;

        let path = self.path();
        tmp.persist(&path).map_err(|e| self.dir_error(e.error))?;
        Ok(Held {
            path,
            actions: actions.to_vec(),
            _guard: guard,
        })
    }

    fn check_conflicts(&self, own: &Path, actions: &[String]) -> Result<()> {
        for path in lock_paths(&self.dir, &self.prefix)? {
            if path == own {
                continue;
            }
            let Some(record) = inspect(&path, true)? else {
                continue;
            };
            if !record.live {
                info!(path = %path.display(), pid = ?record.pid, "reclaimed stale lock file");
                continue;
            }
            let overlap: Vec<String> = actions
                .iter()
                .filter(|a| record.actions.contains(a))
                .cloned()
                .collect();
            if !overlap.is_empty() {
                warn!(pid = ?record.pid, overlap = overlap.len(), "overlapping run holds a lock");
                return Err(EtlError::LockConflict {
                    pid: record.pid.unwrap_or(-1),
                    actions: overlap,
                });
            }
        }
        Ok(())
    }

    fn dir_error(&self, e: std::io::Error) -> EtlError {
        EtlError::LockDir {
            path: self.dir.clone(),
            message: e.to_string(),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(error = %e, "failed to release lock");
        }
    }
}

/// Every lock record under `dir`, with its live or stale status. Stale files
/// are reported, not removed.
pub fn list_records(dir: &Path, prefix: &str) -> Result<Vec<LockRecord>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for path in lock_paths(dir, prefix)? {
        if let Some(record) = inspect(&path, false)? {
            records.push(record);
        }
    }
    Ok(records)
}

fn lock_paths(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| EtlError::LockDir {
        path: dir.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| n.strip_prefix(prefix))
                .is_some_and(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()))
        })
        .map(|e| e.path())
        .collect();
    paths.sort();
    Ok(paths)
}

/// Read one lock file and test whether its owner still holds it. With
/// `reclaim`, a stale file is deleted while we hold its lock. `None` means
/// the file vanished underneath us.
fn inspect(path: &Path, reclaim: bool) -> Result<Option<LockRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(mut guard) => {
            let mut contents = String::new();
            guard.read_to_string(&mut contents)?;
            if reclaim {
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(Some(LockRecord::parse(path.to_path_buf(), &contents, false)))
        }
        Err((mut file, Errno::EWOULDBLOCK)) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            Ok(Some(LockRecord::parse(path.to_path_buf(), &contents, true)))
        }
        Err((_, errno)) => Err(std::io::Error::from(errno).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn lock_writes_pid_and_actions() {
        let dir = TempDir::new().unwrap();
        let mut lock = LockFile::with_pid(dir.path(), "etl-", 4242);
        lock.lock(&names(&["etl.jobs.a", "etl.jobs.b"])).unwrap();
        let contents = fs::read_to_string(dir.path().join("etl-4242")).unwrap();
        assert_eq!(contents, "4242\netl.jobs.a\netl.jobs.b\n");
        assert!(lock.is_locked());
        lock.unlock().unwrap();
        assert!(!dir.path().join("etl-4242").exists());
    }

    #[test]
    fn disjoint_runs_coexist() {
        let dir = TempDir::new().unwrap();
        let mut first = LockFile::with_pid(dir.path(), "etl-", 1);
        let mut second = LockFile::with_pid(dir.path(), "etl-", 2);
        first.lock(&names(&["a", "b"])).unwrap();
        second.lock(&names(&["c"])).unwrap();
        assert_eq!(list_records(dir.path(), "etl-").unwrap().len(), 2);
    }

    #[test]
    fn overlapping_run_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut first = LockFile::with_pid(dir.path(), "etl-", 1);
        let mut second = LockFile::with_pid(dir.path(), "etl-", 2);
        first.lock(&names(&["a", "b", "c"])).unwrap();
        match second.lock(&names(&["x", "c", "a"])) {
            Err(EtlError::LockConflict { pid, actions }) => {
                assert_eq!(pid, 1);
                assert_eq!(actions, names(&["c", "a"]));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!second.is_locked());
        assert!(!dir.path().join("etl-2").exists());
        first.unlock().unwrap();
        second.lock(&names(&["a"])).unwrap();
    }

    #[test]
    fn stale_file_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("etl-999999"), "999999\na\n").unwrap();
        let mut lock = LockFile::with_pid(dir.path(), "etl-", 7);
        lock.lock(&names(&["a"])).unwrap();
        assert!(!dir.path().join("etl-999999").exists());
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("etl-notes"), "1\na\n").unwrap();
        fs::write(dir.path().join("other-5"), "5\na\n").unwrap();
        let mut lock = LockFile::with_pid(dir.path(), "etl-", 7);
        lock.lock(&names(&["a"])).unwrap();
        assert!(dir.path().join("etl-notes").exists());
        assert!(dir.path().join("other-5").exists());
    }

    #[test]
    fn unlock_before_lock_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut lock = LockFile::with_pid(dir.path(), "", 3);
        lock.unlock().unwrap();
        assert!(lock.actions().is_empty());
    }

    #[test]
    fn empty_prefix_and_drop_release() {
        let dir = TempDir::new().unwrap();
        {
            let mut lock = LockFile::with_pid(dir.path(), "", 31);
            lock.lock(&names(&["a"])).unwrap();
            assert!(dir.path().join("31").exists());
        }
        assert!(!dir.path().join("31").exists());
    }

    #[test]
    fn records_report_live_and_stale() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("etl-12"), "12\nold\n").unwrap();
        let mut lock = LockFile::with_pid(dir.path(), "etl-", 13);
        lock.lock(&names(&["new"])).unwrap();
        // 12 was reclaimed by the lock above.
        fs::write(dir.path().join("etl-14"), "14\nolder\n").unwrap();
        let records = list_records(dir.path(), "etl-").unwrap();
        assert_eq!(records.len(), 2);
        let live: Vec<_> = records.iter().filter(|r| r.live).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].pid, Some(13));
        assert_eq!(live[0].actions, names(&["new"]));
        assert!(dir.path().join("etl-14").exists());
    }

    #[test]
    fn missing_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("run/locks");
        let mut lock = LockFile::with_pid(&nested, "etl-", 5);
        lock.lock(&names(&["a"])).unwrap();
        assert!(nested.join("etl-5").exists());
    }
}
