//! Duplicate policy: what to do with a message whose job id is already tracked.

use crate::config::DuplicateAction;
use crate::model::JobStatus;

/// Outcome of the duplicate check for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No existing job; create one.
    ProceedNew,
    /// Mark the existing job DUPLICATE and drop the message.
    SkipAsDuplicate,
    /// Log and drop the message; the existing job is untouched.
    RejectWithError,
    /// Existing job is RUNNING; drop the message and leave the job alone.
    SkipInFlight,
    /// Overwrite the existing job and run it again.
    ProceedReprocess,
}

/// Decide how to treat an inbound message given the status of any job
/// already tracked under its id.
pub fn decide(existing: Option<JobStatus>, action: &DuplicateAction) -> Verdict {
    let Some(status) = existing else {
        return Verdict::ProceedNew;
    };

    match action {
        DuplicateAction::Skip => Verdict::SkipAsDuplicate,
        DuplicateAction::Error => Verdict::RejectWithError,
        DuplicateAction::Reprocess if status.is_running() => Verdict::SkipInFlight,
        DuplicateAction::Reprocess => Verdict::ProceedReprocess,
        DuplicateAction::Unknown(_) => Verdict::SkipAsDuplicate,
    }
}
