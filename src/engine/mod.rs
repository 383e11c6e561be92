//! Job engine: the processing loop, its processor seam, and the
//! status-query surface.

pub mod control;
pub mod processor;

pub use control::{Dispatch, Engine, SkipReason, resolve_job_id};
pub use processor::{ProcessError, ProcessResult, Processor};
