use std::fs;
use std::io;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{WorkEntry, WorkId};
use crate::error::WorkerError;
use crate::fs_util;
use crate::layout::{CacheLayout, DOWNLOAD_PREFIX};
use crate::store::WorkStore;

/// Entries fetched from the store per eviction round.
pub const EVICTION_BATCH: usize = 10;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub initial_bytes: u64,
    pub remaining_bytes: u64,
    pub evicted: usize,
    pub freed_bytes: u64,
}

pub struct CacheMaintenance<'a, S: WorkStore> {
    store: &'a S,
    layout: &'a CacheLayout,
    budget_mb: u64,
}

impl<'a, S: WorkStore> CacheMaintenance<'a, S> {
    pub fn new(store: &'a S, layout: &'a CacheLayout, budget_mb: u64) -> Self {
        Self {
            store,
            layout,
            budget_mb,
        }
    }

    /// Evicts least recently used bundles until the works directory fits the
    /// budget or the store runs out of entries.
    ///
    /// Sizes are compared in whole MiB, truncating, so `50.9` MiB fits a
    /// budget of 50. Store rows of evicted entries are deleted even when
    /// their directory could not be measured or removed.
    pub fn enforce_budget(&self) -> Result<MaintenanceReport, WorkerError> {
        let works_dir = self.layout.works_dir();
        let initial = match fs_util::directory_size(works_dir.as_std_path()) {
            Ok(size) => size,
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => {
                return Err(WorkerError::Filesystem(format!("measure {works_dir}: {err}")));
            }
        };

        let mut report = MaintenanceReport {
            initial_bytes: initial,
            remaining_bytes: initial,
            ..MaintenanceReport::default()
        };

        while self.over_budget(report.remaining_bytes) {
            let batch = self.store.oldest(EVICTION_BATCH)?;
            if batch.is_empty() {
                warn!(
                    size_mb = report.remaining_bytes / BYTES_PER_MB,
                    budget_mb = self.budget_mb,
                    "cache over budget with nothing left to evict"
                );
                break;
            }

            let mut evicted_ids = Vec::with_capacity(batch.len());
            for entry in &batch {
                if !self.over_budget(report.remaining_bytes) {
                    break;
                }
                let freed = self.remove_bundle(entry);
                report.remaining_bytes = report.remaining_bytes.saturating_sub(freed);
                report.freed_bytes += freed;
                evicted_ids.push(entry.id);
            }

            self.store.delete(&evicted_ids)?;
            report.evicted += evicted_ids.len();
        }

        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                freed_mb = report.freed_bytes / BYTES_PER_MB,
                remaining_mb = report.remaining_bytes / BYTES_PER_MB,
                "evicted works from cache"
            );
        }
        Ok(report)
    }

    /// Drops store rows whose bundle directory no longer exists and removes
    /// archive downloads left behind by an interrupted run. Returns the
    /// number of rows dropped.
    pub fn reconcile(&self) -> Result<usize, WorkerError> {
        self.sweep_partial_downloads();
        let stale = self
            .store
            .list()?
            .into_iter()
            .filter(|entry| !entry.path.as_std_path().is_dir())
            .map(|entry| entry.id)
            .collect::<Vec<WorkId>>();
        if stale.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete(&stale)?;
        info!(removed, "dropped cache rows without bundle directories");
        Ok(removed)
    }

    fn sweep_partial_downloads(&self) {
        let works_dir = self.layout.works_dir();
        let entries = match fs::read_dir(works_dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(path = %works_dir, error = %err, "failed to scan works directory");
                return;
            }
        };
        for entry in entries.filter_map(Result::ok) {
            let is_download = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(DOWNLOAD_PREFIX));
            if !is_download || !entry.file_type().is_ok_and(|ft| ft.is_file()) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => info!(path = %entry.path().display(), "removed partial download"),
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "failed to remove partial download");
                }
            }
        }
    }

    fn over_budget(&self, bytes: u64) -> bool {
        bytes / BYTES_PER_MB > self.budget_mb
    }

    /// Removes the bundle directory and returns the bytes it held.
    fn remove_bundle(&self, entry: &WorkEntry) -> u64 {
        let works_dir = self.layout.works_dir();
        if !entry.path.starts_with(&works_dir) {
            warn!(work_id = %entry.id, path = %entry.path, "refusing to remove path outside cache");
            return 0;
        }
        let size = match fs_util::directory_size(entry.path.as_std_path()) {
            Ok(size) => size,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(work_id = %entry.id, "bundle already gone from disk");
                return 0;
            }
            Err(err) => {
                warn!(work_id = %entry.id, error = %err, "failed to measure bundle");
                return 0;
            }
        };
        match fs::remove_dir_all(entry.path.as_std_path()) {
            Ok(()) => size,
            Err(err) => {
                warn!(work_id = %entry.id, error = %err, "failed to remove bundle");
                0
            }
        }
    }
}
