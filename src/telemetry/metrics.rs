//! Metric instrument factories for jobcast.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobcast"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobcast instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobcast")
}

/// Counter: messages delivered by the transport.
pub fn messages_received() -> Counter<u64> {
    meter()
        .u64_counter("jobcast.messages.received")
        .with_description("Number of messages delivered by the transport")
        .build()
}

/// Counter: messages dropped before reaching a processor.
/// Labels: `reason` ("decode" | "empty" | "job_id" | "store").
pub fn messages_skipped() -> Counter<u64> {
    meter()
        .u64_counter("jobcast.messages.skipped")
        .with_description("Number of messages dropped without processing")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobcast.job.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: duplicate deliveries.
/// Labels: `action` ("skip" | "error" | "reprocess" | unknown value).
pub fn job_duplicates() -> Counter<u64> {
    meter()
        .u64_counter("jobcast.job.duplicates")
        .with_description("Number of messages whose job id was already tracked")
        .build()
}

/// Counter: jobs removed from the store.
/// Labels: `pass` ("age" | "capacity").
pub fn jobs_evicted() -> Counter<u64> {
    meter()
        .u64_counter("jobcast.jobs.evicted")
        .with_description("Number of jobs evicted from memory")
        .build()
}

/// Counter: result envelopes or failure reports that could not be published.
pub fn publish_failures() -> Counter<u64> {
    meter()
        .u64_counter("jobcast.publish.failures")
        .with_description("Number of failed result or failure report publications")
        .build()
}

/// Histogram: processor run time in milliseconds.
/// Labels: `outcome` ("completed" | "failed").
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobcast.handler.duration_ms")
        .with_description("Processor run time in milliseconds")
        .with_unit("ms")
        .build()
}
