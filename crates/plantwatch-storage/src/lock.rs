use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("job {job} is already running (run {run_id}, since {acquired_at})")]
    Held {
        job: String,
        run_id: Uuid,
        acquired_at: DateTime<Utc>,
    },
    #[error("run lock io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing lease: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LockError + '_ {
    move |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseFile {
    job: String,
    run_id: Uuid,
    acquired_at: DateTime<Utc>,
    pid: u32,
}

impl LeaseFile {
    fn held_error(&self, job: &str) -> LockError {
        LockError::Held {
            job: job.to_string(),
            run_id: self.run_id,
            acquired_at: self.acquired_at,
        }
    }
}

/// Directory of per-job lease files. A lease older than `ttl` is considered
/// abandoned and may be taken over.
#[derive(Debug, Clone)]
pub struct RunLockDir {
    root: PathBuf,
    ttl: Duration,
}

/// Held for the duration of a run; dropping it releases the job.
#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
    job: String,
    run_id: Uuid,
}

impl RunLease {
    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

// Drop cannot await, so release is a blocking unlink of one small file.
impl Drop for RunLease {
    fn drop(&mut self) {
        let current = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LeaseFile>(&bytes).ok());
        if let Some(current) = current.filter(|held| held.run_id != self.run_id) {
            warn!(
                job = %self.job,
                run_id = %self.run_id,
                holder = %current.run_id,
                "run lock was taken over; leaving it in place"
            );
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(job = %self.job, run_id = %self.run_id, "released run lock"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(job = %self.job, error = %err, "failed to release run lock"),
        }
    }
}

/// Marker claimed while a stale lease is being replaced. Only its holder may
/// remove a lease file.
struct TakeoverGuard {
    path: PathBuf,
}

impl Drop for TakeoverGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove takeover guard");
            }
        }
    }
}

impl RunLockDir {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    fn lease_path(&self, job: &str) -> PathBuf {
        self.root.join(format!("{job}.lock"))
    }

    fn guard_path(&self, job: &str) -> PathBuf {
        self.root.join(format!("{job}.takeover"))
    }

    pub async fn acquire(&self, job: &str, run_id: Uuid) -> Result<RunLease, LockError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))?;
        let path = self.lease_path(job);
        let lease = LeaseFile {
            job: job.to_string(),
            run_id,
            acquired_at: Utc::now(),
            pid: std::process::id(),
        };
        let body = serde_json::to_vec_pretty(&lease)?;

        if let Some(lease) = self.create_lease(job, run_id, &path, &body).await? {
            return Ok(lease);
        }
        match self.read_holder(&path).await {
            Some(held) if !self.is_stale(held.acquired_at) => return Err(held.held_error(job)),
            Some(held) => warn!(
                job = %held.job,
                stale_run_id = %held.run_id,
                stale_pid = held.pid,
                "taking over stale run lock"
            ),
            None => warn!(job, "replacing unreadable run lock"),
        }
        self.take_over(job, run_id, &path, &body).await
    }

    /// Replaces a stale lease. The holder is re-read under the guard, so a
    /// contender that lost the race sees the winner's fresh lease instead of
    /// deleting it.
    async fn take_over(
        &self,
        job: &str,
        run_id: Uuid,
        path: &Path,
        body: &[u8],
    ) -> Result<RunLease, LockError> {
        let Some(_guard) = self.claim_guard(job).await? else {
            return Err(self.current_holder(job, path).await);
        };

        if let Some(lease) = self.create_lease(job, run_id, path, body).await? {
            return Ok(lease);
        }
        if let Some(held) = self
            .read_holder(path)
            .await
            .filter(|held| !self.is_stale(held.acquired_at))
        {
            return Err(held.held_error(job));
        }
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(LockError::Io { path: path.to_path_buf(), source }),
        }
        match self.create_lease(job, run_id, path, body).await? {
            Some(lease) => Ok(lease),
            None => Err(self.current_holder(job, path).await),
        }
    }

    /// `None` when another takeover is in progress. A guard older than the ttl
    /// was left by a crashed process and is cleared for the next attempt.
    async fn claim_guard(&self, job: &str) -> Result<Option<TakeoverGuard>, LockError> {
        let path = self.guard_path(job);
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(Some(TakeoverGuard { path })),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let modified = fs::metadata(&path).await.and_then(|m| m.modified()).ok();
                if modified.is_some_and(|at| self.is_stale(at.into())) {
                    warn!(job, "clearing abandoned takeover guard");
                    if let Err(err) = fs::remove_file(&path).await {
                        warn!(job, error = %err, "failed to clear takeover guard");
                    }
                }
                Ok(None)
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    /// `None` when the lease file already exists.
    async fn create_lease(
        &self,
        job: &str,
        run_id: Uuid,
        path: &Path,
        body: &[u8],
    ) -> Result<Option<RunLease>, LockError> {
        let mut file = match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(source) => return Err(LockError::Io { path: path.to_path_buf(), source }),
        };
        file.write_all(body).await.map_err(io_err(path))?;
        file.flush().await.map_err(io_err(path))?;
        info!(job, %run_id, "acquired run lock");
        Ok(Some(RunLease {
            path: path.to_path_buf(),
            job: job.to_string(),
            run_id,
        }))
    }

    async fn current_holder(&self, job: &str, path: &Path) -> LockError {
        let held = self.read_holder(path).await;
        LockError::Held {
            job: job.to_string(),
            run_id: held.as_ref().map(|h| h.run_id).unwrap_or_default(),
            acquired_at: held.map(|h| h.acquired_at).unwrap_or_else(Utc::now),
        }
    }

    fn is_stale(&self, acquired_at: DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(acquired_at);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }

    /// A lease that cannot be parsed is only trusted while its file is younger
    /// than the ttl, since another process may still be writing it.
    async fn read_holder(&self, path: &Path) -> Option<LeaseFile> {
        let parsed = fs::read(path)
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LeaseFile>(&bytes).ok());
        if parsed.is_some() {
            return parsed;
        }
        let modified = fs::metadata(path).await.and_then(|m| m.modified()).ok()?;
        let modified: DateTime<Utc> = modified.into();
        if self.is_stale(modified) {
            None
        } else {
            Some(LeaseFile {
                job: String::new(),
                run_id: Uuid::nil(),
                acquired_at: modified,
                pid: 0,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stale_lease(job: &str) -> Vec<u8> {
        serde_json::to_vec(&LeaseFile {
            job: job.into(),
            run_id: Uuid::new_v4(),
            acquired_at: Utc::now() - chrono::Duration::minutes(10),
            pid: 1,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn second_acquire_fails_while_lease_is_held() {
        let dir = tempdir().expect("tempdir");
        let locks = RunLockDir::new(dir.path(), Duration::from_secs(600));
        let first = Uuid::new_v4();

        let lease = locks.acquire("archive", first).await.expect("first acquire");
        let err = locks.acquire("archive", Uuid::new_v4()).await.unwrap_err();
        match err {
            LockError::Held { job, run_id, .. } => {
                assert_eq!(job, "archive");
                assert_eq!(run_id, first);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Different jobs do not contend.
        let _sync = locks.acquire("sync", Uuid::new_v4()).await.expect("sync lock");

        drop(lease);
        locks
            .acquire("archive", Uuid::new_v4())
            .await
            .expect("released lease can be reacquired");
    }

    #[tokio::test]
    async fn stale_leases_are_taken_over() {
        let dir = tempdir().expect("tempdir");
        let locks = RunLockDir::new(dir.path(), Duration::from_secs(60));
        std::fs::write(dir.path().join("sync.lock"), stale_lease("sync")).unwrap();

        let run_id = Uuid::new_v4();
        let lease = locks.acquire("sync", run_id).await.expect("takeover");
        assert_eq!(lease.run_id(), run_id);
        assert_eq!(lease.job(), "sync");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("sync.lock")]);
    }

    #[tokio::test]
    async fn stale_lease_is_left_alone_while_another_takeover_runs() {
        let dir = tempdir().expect("tempdir");
        let locks = RunLockDir::new(dir.path(), Duration::from_secs(60));
        let stale = stale_lease("alert");
        std::fs::write(dir.path().join("alert.lock"), &stale).unwrap();
        std::fs::write(dir.path().join("alert.takeover"), b"").unwrap();

        let err = locks.acquire("alert", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
        assert_eq!(std::fs::read(dir.path().join("alert.lock")).unwrap(), stale);

        std::fs::remove_file(dir.path().join("alert.takeover")).unwrap();
        locks
            .acquire("alert", Uuid::new_v4())
            .await
            .expect("takeover once the guard is gone");
        assert!(!dir.path().join("alert.takeover").exists());
    }

    #[tokio::test]
    async fn superseded_lease_does_not_release_its_successor() {
        let dir = tempdir().expect("tempdir");
        let locks = RunLockDir::new(dir.path(), Duration::from_secs(60));
        let old = locks.acquire("sync", Uuid::new_v4()).await.expect("old lease");
        std::fs::write(dir.path().join("sync.lock"), stale_lease("sync")).unwrap();

        let successor = locks.acquire("sync", Uuid::new_v4()).await.expect("takeover");
        drop(old);

        let err = locks.acquire("sync", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LockError::Held { run_id, .. } if run_id == successor.run_id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_takeovers_admit_a_single_run() {
        let dir = tempdir().expect("tempdir");
        let locks = RunLockDir::new(dir.path(), Duration::from_secs(60));

        for _ in 0..25 {
            std::fs::write(dir.path().join("archive.lock"), stale_lease("archive")).unwrap();
            let contenders: Vec<_> = (0..4)
                .map(|_| {
                    let locks = locks.clone();
                    tokio::spawn(async move { locks.acquire("archive", Uuid::new_v4()).await })
                })
                .collect();

            let mut leases = Vec::new();
            for contender in contenders {
                match contender.await.unwrap() {
                    Ok(lease) => leases.push(lease),
                    Err(LockError::Held { .. }) => {}
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }
            assert_eq!(leases.len(), 1, "exactly one contender may win the takeover");
            drop(leases);
        }
    }
}
