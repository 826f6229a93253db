//! Per-batch lease files.
//!
//! A stage operation holds a lease on its batch for the whole run so two
//! invocations can never process the same batch at once. The lease lives in
//! `<lock_dir>/batch-<id>.lock` and contains JSON metadata about the holder
//! (PID, hostname, timestamp, stage).
//!
//! A lease is written to a private tmp file and then hard-linked to its final
//! name, so acquisition is atomic across processes and the lease file is
//! never observed half-written. A lease older than the configured timeout is
//! considered stale (its holder crashed) and is taken over. An unreadable
//! lease only counts as stale once its mtime is older than the timeout.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use plp_types::{BatchId, Stage};
use serde::{Deserialize, Serialize};

/// Information stored in the lease file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Process ID of the holder
    pub pid: u32,
    /// Hostname where the lease was taken
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub batch_id: BatchId,
    /// Stage being run, if any (admin operations hold leases too)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl LeaseInfo {
    fn is_stale(&self, timeout: Duration) -> bool {
        let age = Utc::now() - self.acquired_at;
        age.num_seconds().unsigned_abs() > timeout.as_secs()
    }
}

/// Lease handle that releases the file on Drop
#[derive(Debug)]
pub struct BatchLease {
    path: PathBuf,
    info: LeaseInfo,
    released: bool,
}

impl BatchLease {
    /// Take the lease on `batch_id`, failing if anyone holds it.
    pub fn acquire(lock_dir: &Path, batch_id: BatchId, stage: Option<Stage>) -> Result<Self> {
        fs::create_dir_all(lock_dir)
            .with_context(|| format!("failed to create lock dir {}", lock_dir.display()))?;

        let path = lease_path(lock_dir, batch_id);
        let info = LeaseInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            batch_id,
            stage,
        };
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lease info")?;

        let tmp = lock_dir.join(format!(
            "batch-{batch_id}.lock.{}.{}.tmp",
            info.pid,
            info.acquired_at.timestamp_nanos_opt().unwrap_or_default()
        ));
        if let Err(e) = write_tmp(&tmp, json.as_bytes()) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);

        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let Ok(holder) = read_lease_info(&path) else {
                    bail!(
                        "batch {batch_id} is leased (lease file {} is unreadable)",
                        path.display()
                    );
                };
                bail!(
                    "batch {} is leased by pid {} on {} since {} (stage: {})",
                    batch_id,
                    holder.pid,
                    holder.hostname,
                    holder.acquired_at,
                    holder.stage.map(|s| s.as_str()).unwrap_or("none")
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to publish lease {}", path.display()));
            }
        }

        Ok(Self {
            path,
            info,
            released: false,
        })
    }

    /// Take the lease, first removing a stale or corrupt lease file.
    pub fn acquire_with_timeout(
        lock_dir: &Path,
        batch_id: BatchId,
        stage: Option<Stage>,
        timeout: Duration,
    ) -> Result<Self> {
        let path = lease_path(lock_dir, batch_id);
        if path.exists() {
            let remove = match read_lease_info(&path) {
                Ok(info) => info.is_stale(timeout),
                Err(_) => file_older_than(&path, timeout),
            };
            if remove {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("failed to remove stale lease {}", path.display())
                        });
                    }
                }
            }
        }

        Self::acquire(lock_dir, batch_id, stage)
    }

    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }

    /// Release the lease
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to remove lease {}", self.path.display()));
            }
        }
        self.released = true;
        Ok(())
    }

    /// Whether a live (non-stale) lease is held on `batch_id`.
    pub fn is_leased(lock_dir: &Path, batch_id: BatchId, timeout: Duration) -> Result<bool> {
        let path = lease_path(lock_dir, batch_id);
        if !path.exists() {
            return Ok(false);
        }
        Ok(match read_lease_info(&path) {
            Ok(info) => !info.is_stale(timeout),
            Err(_) => !file_older_than(&path, timeout),
        })
    }

    /// Current holder of the lease on `batch_id`, if any.
    pub fn holder(lock_dir: &Path, batch_id: BatchId) -> Result<Option<LeaseInfo>> {
        let path = lease_path(lock_dir, batch_id);
        if !path.exists() {
            return Ok(None);
        }
        read_lease_info(&path).map(Some)
    }
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        // Best effort
        let _ = self.release();
    }
}

fn write_tmp(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("failed to create lease tmp file {}", path.display()))?;
    file.write_all(content)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write lease tmp file {}", path.display()))
}

/// Whether `path` was last modified more than `timeout` ago. Unknown mtimes
/// count as fresh.
fn file_older_than(path: &Path, timeout: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > timeout)
}

fn read_lease_info(path: &Path) -> Result<LeaseInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lease file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lease JSON from {}", path.display()))
}

/// Path of the lease file for `batch_id`.
pub fn lease_path(lock_dir: &Path, batch_id: BatchId) -> PathBuf {
    lock_dir.join(format!("batch-{batch_id}.lock"))
}
