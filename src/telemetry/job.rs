//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs
//! flowing through the engine.

use tracing::Span;

use crate::model::{JobId, JobStatus};
use crate::telemetry::metrics;

/// Start a span for one job's trip through the engine.
///
/// The `job.status` field is declared empty and is updated by
/// [`record_state_transition`].
pub fn start_job_span(job_id: &JobId, topic: &str) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %job_id,
        "job.topic" = topic,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span and count it.
///
/// Emits a tracing `info` event scoped to the span.
pub fn record_state_transition(span: &Span, from: JobStatus, to: JobStatus) {
    span.record("job.status", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(%from, %to, "state_transition");
    });
    metrics::job_state_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.to_string()),
            opentelemetry::KeyValue::new("to", to.to_string()),
        ],
    );
}
