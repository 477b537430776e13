use std::io::{self, Write};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::domain::WorkEntry;
use crate::error::WorkerError;
use crate::fs_util;
use crate::layout::CacheLayout;
use crate::maintenance::MaintenanceReport;
use crate::store::WorkStore;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub root: Utf8PathBuf,
    pub budget_mb: u64,
    pub total_bytes: u64,
    pub entries: Vec<WorkEntry>,
}

impl StatusResult {
    /// Snapshot of the cache. Fails when the works directory cannot be measured.
    pub fn collect<S: WorkStore>(
        store: &S,
        layout: &CacheLayout,
        budget_mb: u64,
    ) -> Result<Self, WorkerError> {
        let works_dir = layout.works_dir();
        let total_bytes = fs_util::directory_size(works_dir.as_std_path())
            .map_err(|err| WorkerError::Filesystem(format!("measure {works_dir}: {err}")))?;
        Ok(Self {
            root: layout.root().to_owned(),
            budget_mb,
            total_bytes,
            entries: store.list()?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintainResult {
    pub reconciled: usize,
    pub report: MaintenanceReport,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_maintain(result: &MaintainResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
