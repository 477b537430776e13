use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::api::CoordinatorClient;
use crate::checker::Checker;
use crate::domain::{Task, WorkEntry};
use crate::error::WorkerError;
use crate::layout::CacheLayout;
use crate::maintenance::{CacheMaintenance, MaintenanceReport};
use crate::report;
use crate::retrieval::WorkRetrieval;
use crate::store::WorkStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStage {
    FetchTask,
    ResolveWorks,
    Checker,
    ParseResults,
}

/// How one tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NoTask,
    NotEnoughWorks,
    NoFilesToCompare,
    Reported { sent: usize, total: usize },
    Failed(TickStage),
}

pub struct TaskPipeline<A: CoordinatorClient, S: WorkStore, C: Checker> {
    api: A,
    store: S,
    checker: C,
    layout: CacheLayout,
    budget_mb: u64,
}

impl<A: CoordinatorClient, S: WorkStore, C: Checker> TaskPipeline<A, S, C> {
    pub fn new(api: A, store: S, checker: C, layout: CacheLayout, budget_mb: u64) -> Self {
        Self {
            api,
            store,
            checker,
            layout,
            budget_mb,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn checker(&self) -> &C {
        &self.checker
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Pulls at most one task and runs it to completion. Never fails: every
    /// error is logged and folded into the returned outcome.
    pub fn process(&self) -> TickOutcome {
        let task = match self.api.next_task() {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("no new task");
                return TickOutcome::NoTask;
            }
            Err(err) => {
                error!(error = %err, "failed to fetch next task");
                return TickOutcome::Failed(TickStage::FetchTask);
            }
        };

        info!(event_id = %task.event_id, work_id = %task.work_id, "processing task");
        let outcome = self.process_task(&task);

        if let Err(err) = self.enforce_budget() {
            error!(error = %err, "cache maintenance failed");
        }
        outcome
    }

    pub fn enforce_budget(&self) -> Result<MaintenanceReport, WorkerError> {
        CacheMaintenance::new(&self.store, &self.layout, self.budget_mb).enforce_budget()
    }

    pub fn reconcile(&self) -> Result<usize, WorkerError> {
        CacheMaintenance::new(&self.store, &self.layout, self.budget_mb).reconcile()
    }

    fn process_task(&self, task: &Task) -> TickOutcome {
        let retrieval = WorkRetrieval::new(&self.api, &self.store, &self.layout);
        let works = match retrieval.list_event_works(task.event_id) {
            Ok(works) => works,
            Err(err) => {
                error!(event_id = %task.event_id, error = %err, "failed to resolve event works");
                return TickOutcome::Failed(TickStage::ResolveWorks);
            }
        };
        if works.len() < 2 {
            debug!(event_id = %task.event_id, works = works.len(), "nothing to compare");
            return TickOutcome::NotEnoughWorks;
        }

        let (new_work, old_works) = split_works(&works, task);
        let artifact = match self.checker.run(new_work.as_deref(), &old_works) {
            Ok(path) => path,
            Err(WorkerError::NoFilesToCompare) => {
                debug!(work_id = %task.work_id, "checker had no files to compare");
                return TickOutcome::NoFilesToCompare;
            }
            Err(err) => {
                error!(work_id = %task.work_id, error = %err, "checker failed");
                return TickOutcome::Failed(TickStage::Checker);
            }
        };

        let parsed = report::parse_results(artifact.as_std_path(), task);
        remove_artifact(&artifact);
        let items = match parsed {
            Ok(items) => items,
            Err(err) => {
                error!(work_id = %task.work_id, error = %err, "failed to parse checker result");
                return TickOutcome::Failed(TickStage::ParseResults);
            }
        };

        let total = items.len();
        let mut sent = 0usize;
        for item in &items {
            if let Err(err) = self.api.send_report(item) {
                error!(
                    work_id = %task.work_id,
                    matched = %item.matched_work_id,
                    error = %err,
                    "failed to send report"
                );
                break;
            }
            sent += 1;
        }
        info!(work_id = %task.work_id, sent, total, "reported findings");
        TickOutcome::Reported { sent, total }
    }
}

/// Separates the task's own submission from the prior ones.
fn split_works(works: &[WorkEntry], task: &Task) -> (Option<Utf8PathBuf>, Vec<Utf8PathBuf>) {
    let mut new_work = None;
    let mut old_works = Vec::with_capacity(works.len());
    for work in works {
        if work.id == task.work_id {
            new_work = Some(work.path.clone());
        } else {
            old_works.push(work.path.clone());
        }
    }
    (new_work, old_works)
}

fn remove_artifact(path: &Utf8Path) {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path, error = %err, "failed to remove checker result"),
    }
}
