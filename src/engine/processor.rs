//! The caller-supplied processing seam.

use thiserror::Error;
use toml::Table;

use crate::model::{JobId, ResultEnvelope};

/// A processor failure. The message ends up on the FAILED job record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProcessError(pub String);

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for ProcessError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ProcessError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// What a processor returns: an optional envelope to publish, or a failure.
pub type ProcessResult = Result<Option<ResultEnvelope>, ProcessError>;

/// Turns a decoded payload into a result.
///
/// Called synchronously from the processing loop, one job at a time.
/// Returning `Ok(None)` completes the job without publishing anything.
pub trait Processor {
    fn process(&self, payload: &Table, job_id: &JobId) -> ProcessResult;
}

impl<F> Processor for F
where
    F: Fn(&Table, &JobId) -> ProcessResult,
{
    fn process(&self, payload: &Table, job_id: &JobId) -> ProcessResult {
        self(payload, job_id)
    }
}
