use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Startup-class failures. Any of these aborts the run before a job is dispatched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid range '{spec}': {reason}")]
    InvalidRange { spec: String, reason: String },

    #[error("empty selection: {what}")]
    EmptySelection { what: String },

    #[error("{what} id {id} not found in source table")]
    UnknownId { what: String, id: u64 },

    #[error("missing isolated model copy for worker {worker_id}: {}", path.display())]
    MissingResource { worker_id: usize, path: PathBuf },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("{}:{line}: {message}", path.display())]
    Table {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRange { .. } => "invalid_range",
            EngineError::EmptySelection { .. } => "empty_selection",
            EngineError::UnknownId { .. } => "unknown_id",
            EngineError::MissingResource { .. } => "missing_resource",
            EngineError::Config(_) => "invalid_config",
            EngineError::Table { .. } => "invalid_table",
            EngineError::Io(_) => "io_error",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Failure reported by the external simulation executor.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{message}")]
pub struct ExecutorError {
    pub class: ErrorClass,
    pub message: String,
}

impl ExecutorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class == ErrorClass::Fatal
    }
}

/// Per-job failures. Contained to the job that raised them.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    #[error("attempt timed out after {after_secs:.1}s")]
    Timeout { after_secs: f64 },

    #[error("simulation {sim_index} failed: {source}")]
    Executor {
        sim_index: u32,
        #[source]
        source: ExecutorError,
    },

    #[error("missing {what} inputs for id {id}")]
    MissingInput { what: String, id: u64 },

    #[error("failed to persist results: {message}")]
    Sink { message: String },

    #[error("no live workers left in the pool")]
    WorkerUnavailable,

    #[error("run was shut down before the job finished")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<JobError> },
}

impl JobError {
    /// Short classification string used in run summaries.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Timeout { .. } => "timeout",
            JobError::Executor { .. } => "executor_error",
            JobError::MissingInput { .. } => "missing_input",
            JobError::Sink { .. } => "sink_error",
            JobError::WorkerUnavailable => "worker_unavailable",
            JobError::Cancelled => "cancelled",
            JobError::RetryExhausted { .. } => "retry_exhausted",
        }
    }
}
