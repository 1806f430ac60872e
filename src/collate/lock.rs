// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Cross-process table lock
//!
//! Several mriflow processes, typically one per subject on a cluster, append
//! to the same tables. A sibling `.lock` file created with `create_new`
//! serializes them.

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::errors::{MriflowError, MriflowResult};

/// Locks older than this are considered abandoned
const LOCK_STALE_AFTER: Duration = Duration::from_secs(300);

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_unix_secs: u64,
}

/// Exclusive lock on a table, released on drop
#[derive(Debug)]
pub struct TableLock {
    path: PathBuf,
}

impl TableLock {
    /// Lock file path for `table`
    pub fn path_for(table: &Path) -> PathBuf {
        let mut name = table.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        table.with_file_name(name)
    }

    /// Acquire the lock for `table`, waiting at most `timeout`
    pub async fn acquire(table: &Path, timeout: Duration) -> MriflowResult<Self> {
        let path = Self::path_for(table);
        let started = Instant::now();

        loop {
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_unix_secs: SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or_default(),
                    };
                    // The lock is held from here on, even if recording the owner fails
                    let lock = Self { path };
                    file.write_all(serde_json::to_string(&info)?.as_bytes())?;
                    debug!(lock = %lock.path.display(), "table lock acquired");
                    return Ok(lock);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        warn!(lock = %path.display(), "removing stale table lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(MriflowError::LockTimeout { path });
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(MriflowError::FileWriteError {
                        path,
                        error: e.to_string(),
                    })
                }
            }
        }
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to release table lock");
        }
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}
