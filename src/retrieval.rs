use std::collections::HashSet;
use std::fs;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::api::CoordinatorClient;
use crate::domain::{EventId, WorkEntry, WorkId};
use crate::error::WorkerError;
use crate::fs_util;
use crate::layout::{CacheLayout, DOWNLOAD_PREFIX};
use crate::store::WorkStore;

/// Resolves all works of an event into local bundles, downloading the ones
/// the cache does not hold yet.
pub struct WorkRetrieval<'a, A: CoordinatorClient, S: WorkStore> {
    api: &'a A,
    store: &'a S,
    layout: &'a CacheLayout,
}

impl<'a, A: CoordinatorClient, S: WorkStore> WorkRetrieval<'a, A, S> {
    pub fn new(api: &'a A, store: &'a S, layout: &'a CacheLayout) -> Self {
        Self { api, store, layout }
    }

    /// Cache hits plus whatever could be downloaded. Works that fail to
    /// download are logged and left out of the result.
    pub fn list_event_works(&self, event_id: EventId) -> Result<Vec<WorkEntry>, WorkerError> {
        let ids = self.api.event_works(event_id)?;
        let (mut hits, misses) = self.partition(&ids)?;

        if !hits.is_empty() {
            let now = Utc::now();
            let hit_ids = hits.iter().map(|entry| entry.id).collect::<Vec<_>>();
            match self.store.touch(&hit_ids, now) {
                Ok(_) => {
                    for entry in &mut hits {
                        entry.accessed_at = entry.accessed_at.max(now);
                    }
                }
                Err(err) => warn!(%event_id, error = %err, "failed to refresh cache timestamps"),
            }
        }

        debug!(
            %event_id,
            hits = hits.len(),
            misses = misses.len(),
            "resolved event works against cache"
        );

        hits.extend(self.fetch_missing(&misses));
        Ok(hits)
    }

    fn partition(&self, ids: &[WorkId]) -> Result<(Vec<WorkEntry>, Vec<WorkId>), WorkerError> {
        let mut seen = HashSet::with_capacity(ids.len());
        let mut hits = Vec::with_capacity(ids.len());
        let mut misses = Vec::new();
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.store.get(id) {
                Ok(entry) if entry.path.as_std_path().is_dir() => hits.push(entry),
                Ok(entry) => {
                    warn!(work_id = %id, path = %entry.path, "cached bundle missing on disk");
                    misses.push(id);
                }
                Err(WorkerError::WorkNotFound(_)) => misses.push(id),
                Err(err) => return Err(err),
            }
        }
        Ok((hits, misses))
    }

    fn fetch_missing(&self, missing: &[WorkId]) -> Vec<WorkEntry> {
        if missing.is_empty() {
            return Vec::new();
        }
        let urls = match self.api.work_urls(missing) {
            Ok(urls) => urls,
            Err(err) => {
                warn!(count = missing.len(), error = %err, "failed to resolve download urls");
                return Vec::new();
            }
        };

        let wanted = missing.iter().copied().collect::<HashSet<_>>();
        let mut downloaded = Vec::with_capacity(missing.len());
        let mut done = HashSet::with_capacity(missing.len());
        for work in urls {
            if !wanted.contains(&work.work_id) || !done.insert(work.work_id) {
                debug!(work_id = %work.work_id, "ignoring unrequested download url");
                continue;
            }
            match self.download_work(work.work_id, &work.url) {
                Ok(entry) => downloaded.push(entry),
                Err(err) => warn!(work_id = %work.work_id, error = %err, "failed to fetch work"),
            }
        }
        for id in missing.iter().filter(|id| !done.contains(id)) {
            warn!(work_id = %id, "coordinator returned no download url");
        }
        if !downloaded.is_empty() {
            info!(count = downloaded.len(), "downloaded works into cache");
        }
        downloaded
    }

    fn download_work(&self, id: WorkId, url: &str) -> Result<WorkEntry, WorkerError> {
        let work_dir = self.layout.work_dir(id);
        let unzip_dir = self.layout.unzip_dir(id);
        fs_util::prepare_directory(unzip_dir.as_std_path())?;

        let result = self.fill_work_dir(id, url, &unzip_dir);
        if result.is_err() {
            if let Err(err) = fs::remove_dir_all(work_dir.as_std_path()) {
                debug!(work_id = %id, error = %err, "failed to clean up partial download");
            }
        }
        result
    }

    fn fill_work_dir(
        &self,
        id: WorkId,
        url: &str,
        unzip_dir: &camino::Utf8Path,
    ) -> Result<WorkEntry, WorkerError> {
        let archive = tempfile::Builder::new()
            .prefix(DOWNLOAD_PREFIX)
            .suffix(".zip")
            .tempfile_in(self.layout.works_dir().as_std_path())
            .map_err(|err| WorkerError::Filesystem(err.to_string()))?;
        self.api.download(url, archive.path())?;

        let summary = fs_util::extract_zip(archive.path(), unzip_dir.as_std_path())?;
        if summary.files == 0 && summary.directories == 0 {
            return Err(WorkerError::Archive(format!(
                "archive for work {id} produced no files"
            )));
        }
        if summary.skipped > 0 {
            warn!(work_id = %id, skipped = summary.skipped, "some archive entries were skipped");
        }

        let entry = WorkEntry {
            id,
            path: self.layout.work_dir(id),
            accessed_at: Utc::now(),
        };
        self.store.save(entry.id, &entry.path, entry.accessed_at)?;
        Ok(entry)
    }
}
