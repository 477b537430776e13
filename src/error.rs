use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("required setting not found: {0}")]
    MissingSetting(String),

    #[error("cache budget of {size} MB is below the minimum of {min} MB")]
    BudgetTooSmall { size: u64, min: u64 },

    #[error("failed to read config file at {0}")]
    ConfigRead(String),

    #[error("work cache storage error: {0}")]
    Storage(String),

    #[error("work not found in cache: {0}")]
    WorkNotFound(u64),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("coordinator request failed: {0}")]
    ApiHttp(String),

    #[error("coordinator returned status {status}: {message}")]
    ApiStatus { status: u16, message: String },

    #[error("no files for comparison")]
    NoFilesToCompare,

    #[error("checker failed: {0}")]
    Checker(String),

    #[error("checker did not finish within {0} seconds")]
    CheckerTimeout(u64),

    #[error("failed to parse checker result: {0}")]
    ReportParse(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("worker runtime error: {0}")]
    Runtime(String),
}

impl WorkerError {
    /// Errors that abort startup rather than a single tick.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            WorkerError::Config(_)
                | WorkerError::MissingSetting(_)
                | WorkerError::BudgetTooSmall { .. }
                | WorkerError::ConfigRead(_)
                | WorkerError::Logging(_)
        )
    }
}

impl From<rusqlite::Error> for WorkerError {
    fn from(err: rusqlite::Error) -> Self {
        WorkerError::Storage(err.to_string())
    }
}
