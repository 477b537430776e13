#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crosscheck_worker::api::CoordinatorClient;
use crosscheck_worker::checker::Checker;
use crosscheck_worker::domain::{EventId, ReportItem, Task, WorkEntry, WorkId, WorkUrl};
use crosscheck_worker::error::WorkerError;
use crosscheck_worker::store::{SqliteWorkStore, WorkStore};

pub const MB: u64 = 1024 * 1024;

pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

pub fn utf8_dir(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

/// Creates a sparse file so MB-sized bundles cost no real disk space.
pub fn sparse_file(path: &Utf8Path, len: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path()).unwrap();
    }
    fs::File::create(path.as_std_path())
        .unwrap()
        .set_len(len)
        .unwrap();
}

#[derive(Default)]
pub struct FakeApi {
    pub tasks: Mutex<VecDeque<Task>>,
    pub works: HashMap<EventId, Vec<WorkId>>,
    pub archives: HashMap<WorkId, Vec<u8>>,
    pub failing_downloads: HashSet<WorkId>,
    pub fail_reports_from: Option<usize>,
    pub url_requests: Mutex<Vec<Vec<WorkId>>>,
    pub downloads: Mutex<Vec<WorkId>>,
    pub reports: Mutex<Vec<ReportItem>>,
}

impl FakeApi {
    pub fn with_event(mut self, event: u64, works: &[u64]) -> Self {
        self.works.insert(
            EventId::new(event),
            works.iter().copied().map(WorkId::new).collect(),
        );
        self
    }

    pub fn with_archive(mut self, work: u64, archive: Vec<u8>) -> Self {
        self.archives.insert(WorkId::new(work), archive);
        self
    }

    pub fn with_failing_download(mut self, work: u64) -> Self {
        self.failing_downloads.insert(WorkId::new(work));
        self
    }

    pub fn with_task(self, event: u64, work: u64) -> Self {
        self.tasks.lock().unwrap().push_back(Task {
            event_id: EventId::new(event),
            work_id: WorkId::new(work),
        });
        self
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl CoordinatorClient for FakeApi {
    fn next_task(&self) -> Result<Option<Task>, WorkerError> {
        Ok(self.tasks.lock().unwrap().pop_front())
    }

    fn event_works(&self, event_id: EventId) -> Result<Vec<WorkId>, WorkerError> {
        self.works
            .get(&event_id)
            .cloned()
            .ok_or_else(|| WorkerError::ApiStatus {
                status: 404,
                message: format!("unknown event {event_id}"),
            })
    }

    fn work_urls(&self, ids: &[WorkId]) -> Result<Vec<WorkUrl>, WorkerError> {
        self.url_requests.lock().unwrap().push(ids.to_vec());
        Ok(ids
            .iter()
            .filter(|id| self.archives.contains_key(id) || self.failing_downloads.contains(id))
            .map(|id| WorkUrl {
                work_id: *id,
                url: format!("mem://{id}"),
            })
            .collect())
    }

    fn download(&self, url: &str, destination: &Path) -> Result<(), WorkerError> {
        let id: WorkId = url.trim_start_matches("mem://").parse().unwrap();
        self.downloads.lock().unwrap().push(id);
        if self.failing_downloads.contains(&id) {
            return Err(WorkerError::ApiHttp(format!("connection reset for {url}")));
        }
        fs::write(destination, &self.archives[&id])
            .map_err(|err| WorkerError::Filesystem(err.to_string()))
    }

    fn send_report(&self, report: &ReportItem) -> Result<(), WorkerError> {
        let mut reports = self.reports.lock().unwrap();
        if self.fail_reports_from == Some(reports.len()) {
            return Err(WorkerError::ApiStatus {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        reports.push(report.clone());
        Ok(())
    }
}

pub enum CheckerBehavior {
    /// Writes this overview JSON to the result path.
    Overview(String),
    Fail,
}

pub struct FakeChecker {
    pub result_path: Utf8PathBuf,
    pub behavior: CheckerBehavior,
    pub calls: Mutex<Vec<(Option<Utf8PathBuf>, Vec<Utf8PathBuf>)>>,
}

impl FakeChecker {
    pub fn new(result_path: Utf8PathBuf, behavior: CheckerBehavior) -> Self {
        Self {
            result_path,
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Checker for FakeChecker {
    fn run(
        &self,
        new_work: Option<&Utf8Path>,
        old_works: &[Utf8PathBuf],
    ) -> Result<Utf8PathBuf, WorkerError> {
        self.calls
            .lock()
            .unwrap()
            .push((new_work.map(Utf8Path::to_owned), old_works.to_vec()));
        if new_work.is_none() || old_works.is_empty() {
            return Err(WorkerError::NoFilesToCompare);
        }
        match &self.behavior {
            CheckerBehavior::Overview(json) => {
                fs::write(self.result_path.as_std_path(), json).unwrap();
                Ok(self.result_path.clone())
            }
            CheckerBehavior::Fail => Err(WorkerError::Checker("exit status: 1".to_string())),
        }
    }
}

/// Store wrapper that counts calls reaching the underlying store.
pub struct CountingStore {
    pub inner: SqliteWorkStore,
    pub touches: Mutex<Vec<Vec<WorkId>>>,
    pub saves: Mutex<usize>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteWorkStore::open_in_memory().unwrap(),
            touches: Mutex::new(Vec::new()),
            saves: Mutex::new(0),
        }
    }
}

impl WorkStore for CountingStore {
    fn get(&self, id: WorkId) -> Result<WorkEntry, WorkerError> {
        self.inner.get(id)
    }

    fn save(
        &self,
        id: WorkId,
        path: &Utf8Path,
        accessed_at: DateTime<Utc>,
    ) -> Result<WorkId, WorkerError> {
        *self.saves.lock().unwrap() += 1;
        self.inner.save(id, path, accessed_at)
    }

    fn touch(&self, ids: &[WorkId], accessed_at: DateTime<Utc>) -> Result<usize, WorkerError> {
        self.touches.lock().unwrap().push(ids.to_vec());
        self.inner.touch(ids, accessed_at)
    }

    fn oldest(&self, count: usize) -> Result<Vec<WorkEntry>, WorkerError> {
        self.inner.oldest(count)
    }

    fn delete(&self, ids: &[WorkId]) -> Result<usize, WorkerError> {
        self.inner.delete(ids)
    }

    fn list(&self) -> Result<Vec<WorkEntry>, WorkerError> {
        self.inner.list()
    }
}
