//! Periodic removal of expired cache entries and orphaned job files
//!
//! Each pass removes:
//! - hash directories older than the maximum age (unless leased by a job)
//! - staging directories left behind by crashed jobs
//! - upload directories older than the maximum age

use crate::services::result_cache::{ResultCache, STAGING_PREFIX};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counts from one reaper pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub removed_entries: usize,
    pub removed_staging: usize,
    pub removed_uploads: usize,
    pub skipped_leased: usize,
}

pub struct CacheReaper {
    cache: ResultCache,
    uploads_dir: PathBuf,
    max_age: Duration,
}

impl CacheReaper {
    pub fn new(cache: ResultCache, uploads_dir: PathBuf, max_age: Duration) -> Self {
        Self {
            cache,
            uploads_dir,
            max_age,
        }
    }

    /// One blocking pass over the cache and upload directories
    pub fn reap_once(&self) -> ReapReport {
        let mut report = ReapReport::default();
        let now = SystemTime::now();

        for dir in subdirectories(self.cache.root()) {
            let Some(hash) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };

            // Lease check and removal happen under the lease lock, so a job
            // cannot lease this hash between the two
            let expired = is_older_than(&dir, now, self.max_age);
            let outcome = self.cache.with_unleased(&hash, || {
                if expired {
                    return (remove_dir(&dir) as usize, 0);
                }
                let staging = subdirectories(&dir)
                    .into_iter()
                    .filter(|child| {
                        child
                            .file_name()
                            .map(|n| n.to_string_lossy().starts_with(STAGING_PREFIX))
                            .unwrap_or(false)
                    })
                    .filter(|child| remove_dir(child))
                    .count();
                (0, staging)
            });

            match outcome {
                None => report.skipped_leased += 1,
                Some((entries, staging)) => {
                    if entries > 0 {
                        debug!(hash = %hash, "Removed expired cache entry");
                    }
                    report.removed_entries += entries;
                    report.removed_staging += staging;
                }
            }
        }

        for dir in subdirectories(&self.uploads_dir) {
            if is_older_than(&dir, now, self.max_age) && remove_dir(&dir) {
                report.removed_uploads += 1;
            }
        }

        report
    }

    /// Run a pass every `interval` on the blocking pool
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        let reaper = std::sync::Arc::new(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it so startup is not slowed
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let reaper = std::sync::Arc::clone(&reaper);
                match tokio::task::spawn_blocking(move || reaper.reap_once()).await {
                    Ok(report) if report != ReapReport::default() => {
                        info!(
                            removed_entries = report.removed_entries,
                            removed_staging = report.removed_staging,
                            removed_uploads = report.removed_uploads,
                            skipped_leased = report.skipped_leased,
                            "Cache cleanup pass"
                        );
                    }
                    Ok(_) => debug!("Cache cleanup pass: nothing to remove"),
                    Err(e) => warn!("Cache cleanup pass crashed: {}", e),
                }
            }
        })
    }
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect(),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Cannot list {}: {}", dir.display(), e);
            }
            Vec::new()
        }
    }
}

fn is_older_than(path: &Path, now: SystemTime, max_age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO) >= max_age)
        .unwrap_or(false)
}

fn remove_dir(dir: &Path) -> bool {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to remove {}: {}", dir.display(), e);
            false
        }
    }
}
