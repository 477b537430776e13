//! Reading the checker's result artifact.
//!
//! The checker writes either a zip holding `overview.json` or the overview
//! itself. Every entry of `top_comparisons` that pairs the task's new work
//! with another cached work becomes one [`ReportItem`], in file order.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use serde::Deserialize;
use tracing::debug;
use zip::ZipArchive;

use crate::domain::{ReportItem, Task, WorkId};
use crate::error::WorkerError;

const OVERVIEW_FILE: &str = "overview.json";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Deserialize)]
struct Overview {
    #[serde(default)]
    top_comparisons: Vec<Comparison>,
}

#[derive(Debug, Deserialize)]
struct Comparison {
    first_submission: String,
    second_submission: String,
    #[serde(default)]
    similarity: Option<f64>,
    #[serde(default)]
    similarities: HashMap<String, f64>,
}

pub fn parse_results(path: &Path, task: &Task) -> Result<Vec<ReportItem>, WorkerError> {
    let bytes = fs::read(path)
        .map_err(|err| WorkerError::ReportParse(format!("read {}: {err}", path.display())))?;
    let overview = if bytes.starts_with(ZIP_MAGIC) {
        overview_from_zip(bytes)?
    } else {
        String::from_utf8(bytes).map_err(|err| WorkerError::ReportParse(err.to_string()))?
    };
    parse_overview(&overview, task)
}

pub fn parse_overview(json: &str, task: &Task) -> Result<Vec<ReportItem>, WorkerError> {
    let overview: Overview =
        serde_json::from_str(json).map_err(|err| WorkerError::ReportParse(err.to_string()))?;

    let mut items = Vec::with_capacity(overview.top_comparisons.len());
    for comparison in overview.top_comparisons {
        let (Some(first), Some(second)) = (
            submission_id(&comparison.first_submission),
            submission_id(&comparison.second_submission),
        ) else {
            debug!(
                first = %comparison.first_submission,
                second = %comparison.second_submission,
                "skipping comparison with unrecognized submission names"
            );
            continue;
        };
        let matched = if first == task.work_id {
            second
        } else if second == task.work_id {
            first
        } else {
            continue;
        };
        if matched == task.work_id {
            continue;
        }
        let Some(similarity) = comparison
            .similarity
            .or_else(|| comparison.similarities.get("AVG").copied())
        else {
            debug!(%matched, "skipping comparison without similarity score");
            continue;
        };
        items.push(ReportItem {
            event_id: task.event_id,
            work_id: task.work_id,
            matched_work_id: matched,
            similarity,
            max_similarity: comparison.similarities.get("MAX").copied(),
        });
    }
    Ok(items)
}

fn overview_from_zip(bytes: Vec<u8>) -> Result<String, WorkerError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| WorkerError::ReportParse(format!("open result archive: {err}")))?;
    let mut entry = archive
        .by_name(OVERVIEW_FILE)
        .map_err(|err| WorkerError::ReportParse(format!("{OVERVIEW_FILE}: {err}")))?;
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|err| WorkerError::ReportParse(format!("{OVERVIEW_FILE}: {err}")))?;
    Ok(content)
}

/// Submissions are named after their bundle directory, which is the work id.
fn submission_id(name: &str) -> Option<WorkId> {
    let name = name.trim().trim_end_matches(['/', '\\']);
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    last.parse().ok()
}
