use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::WorkId;
use crate::error::WorkerError;

const WORKS_DIR: &str = "works";
const DB_FILE: &str = "data.db";
const RESULT_FILE: &str = "result.zip";

/// Name prefix of in-flight archive downloads inside the works directory.
pub const DOWNLOAD_PREFIX: &str = ".download-";

/// On-disk layout of the cache root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: Utf8PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn works_dir(&self) -> Utf8PathBuf {
        self.root.join(WORKS_DIR)
    }

    /// Directory owned by one cached work; removed whole on eviction.
    pub fn work_dir(&self, id: WorkId) -> Utf8PathBuf {
        self.works_dir().join(id.to_string())
    }

    /// Extraction target, `<root>/works/<id>/<id>`.
    pub fn unzip_dir(&self, id: WorkId) -> Utf8PathBuf {
        self.work_dir(id).join(id.to_string())
    }

    pub fn db_path(&self) -> Utf8PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn result_path(&self) -> Utf8PathBuf {
        self.root.join(RESULT_FILE)
    }

    pub fn ensure(&self) -> Result<(), WorkerError> {
        fs::create_dir_all(self.works_dir().as_std_path())
            .map_err(|err| WorkerError::Filesystem(format!("create {}: {err}", self.works_dir())))
    }
}
