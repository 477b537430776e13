use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::config::ApiConfig;
use crate::domain::{EventId, ReportItem, Task, WorkId, WorkUrl};
use crate::error::WorkerError;

const PATH_NEW_TASK: &str = "/api/newtask";
const PATH_WORKS: &str = "/api/works";
const PATH_WORKS_URL: &str = "/api/worksurl";
const PATH_REPORT: &str = "/api/crossreport";

/// The remote coordinator, seen from the worker.
pub trait CoordinatorClient: Send + Sync {
    /// `Ok(None)` when the coordinator has nothing queued.
    fn next_task(&self) -> Result<Option<Task>, WorkerError>;
    fn event_works(&self, event_id: EventId) -> Result<Vec<WorkId>, WorkerError>;
    fn work_urls(&self, ids: &[WorkId]) -> Result<Vec<WorkUrl>, WorkerError>;
    /// Streams the archive at `url` into `destination`.
    fn download(&self, url: &str, destination: &Path) -> Result<(), WorkerError>;
    fn send_report(&self, report: &ReportItem) -> Result<(), WorkerError>;
}

#[derive(Debug, Deserialize)]
struct WorksListDto {
    #[serde(default)]
    list: Vec<WorkId>,
}

#[derive(Debug, Deserialize)]
struct WorksUrlDto {
    #[serde(default)]
    works: Vec<WorkUrl>,
}

#[derive(Clone)]
pub struct HttpCoordinatorClient {
    client: Client,
    base_url: String,
}

impl HttpCoordinatorClient {
    pub fn new(config: &ApiConfig) -> Result<Self, WorkerError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("crosscheck-worker/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| WorkerError::Config(err.to_string()))?,
        );
        if let Some(key) = &config.key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                .map_err(|err| WorkerError::Config(format!("mainServerKey: {err}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| WorkerError::ApiHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, WorkerError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "coordinator request failed".to_string());
        Err(WorkerError::ApiStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, WorkerError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(WorkerError::ApiHttp(err.to_string()));
                }
            }
        }
    }
}

impl CoordinatorClient for HttpCoordinatorClient {
    fn next_task(&self) -> Result<Option<Task>, WorkerError> {
        let url = self.url(PATH_NEW_TASK);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = Self::handle_status(response)?;
        let task = response
            .json::<Task>()
            .map_err(|err| WorkerError::ApiHttp(format!("decode task: {err}")))?;
        Ok(Some(task))
    }

    fn event_works(&self, event_id: EventId) -> Result<Vec<WorkId>, WorkerError> {
        let url = self.url(PATH_WORKS);
        let response =
            self.send_with_retries(|| self.client.get(&url).query(&[("id", event_id.get())]))?;
        let response = Self::handle_status(response)?;
        let dto = response
            .json::<WorksListDto>()
            .map_err(|err| WorkerError::ApiHttp(format!("decode works list: {err}")))?;
        Ok(dto.list)
    }

    fn work_urls(&self, ids: &[WorkId]) -> Result<Vec<WorkUrl>, WorkerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url(PATH_WORKS_URL);
        let query = ids
            .iter()
            .map(|id| ("id", id.get()))
            .collect::<Vec<_>>();
        let response = self.send_with_retries(|| self.client.get(&url).query(&query))?;
        let response = Self::handle_status(response)?;
        let dto = response
            .json::<WorksUrlDto>()
            .map_err(|err| WorkerError::ApiHttp(format!("decode work urls: {err}")))?;
        Ok(dto.works)
    }

    fn download(&self, url: &str, destination: &Path) -> Result<(), WorkerError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        let mut response = Self::handle_status(response)?;
        let mut file = File::create(destination)
            .map_err(|err| WorkerError::Filesystem(format!("{}: {err}", destination.display())))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| WorkerError::ApiHttp(format!("download {url}: {err}")))?;
        Ok(())
    }

    fn send_report(&self, report: &ReportItem) -> Result<(), WorkerError> {
        let url = self.url(PATH_REPORT);
        let response = self.send_with_retries(|| self.client.post(&url).json(report))?;
        Self::handle_status(response)?;
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
