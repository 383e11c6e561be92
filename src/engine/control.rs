//! Processing loop: receive messages, track jobs, run the processor,
//! publish results.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use opentelemetry::KeyValue;
use toml::{Table, Value};
use tracing::{Instrument, Span, error, info, warn};

use crate::codec::{CodecError, PayloadSource, TomlCodec, panic_message};
use crate::config::{Config, DuplicateAction, JobsConfig};
use crate::error::{Error, Result};
use crate::model::{JobId, JobRecord, JobStatus, QoS, ResultEnvelope};
use crate::policy::{self, Verdict};
use crate::store::{EvictionReport, JobStore, StoreLimits};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;
use crate::transport::{ConnectOptions, InboundMessage, Transport, TransportError};

use super::processor::{ProcessError, Processor};

/// Pause after an idle receive before checking the stop flag again.
const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// What the engine did with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Dropped before a job was touched.
    Skipped { reason: SkipReason },
    /// Existing job marked DUPLICATE; processor not run.
    Duplicate { job_id: JobId },
    /// Existing job left untouched because duplicates are errors.
    Rejected { job_id: JobId },
    /// Existing job is RUNNING; message dropped.
    InFlight { job_id: JobId },
    /// Processor returned normally. `published` is true only if a result
    /// envelope was handed to the transport successfully.
    Completed { job_id: JobId, published: bool },
    /// Processor returned an error or panicked.
    Failed { job_id: JobId, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Payload could not be decoded or failed validation.
    Decode(String),
    /// Payload decoded to an empty table.
    Empty,
    /// No id in the payload and generation is disabled.
    MissingJobId,
    /// A store operation failed.
    Store(String),
}

impl SkipReason {
    fn label(&self) -> &'static str {
        match self {
            SkipReason::Decode(_) => "decode",
            SkipReason::Empty => "empty",
            SkipReason::MissingJobId => "job_id",
            SkipReason::Store(_) => "store",
        }
    }
}

/// Extract the job id from `payload`, or synthesize one if allowed.
///
/// String values are used verbatim; other values use their TOML rendering.
pub fn resolve_job_id(payload: &Table, config: &JobsConfig) -> Option<JobId> {
    match payload.get(&config.id_field) {
        Some(Value::String(id)) => Some(JobId::new(id.clone())),
        Some(other) => Some(JobId::new(other.to_string())),
        None if config.allow_id_generation => Some(JobId::generate()),
        None => None,
    }
}

/// The job engine. Cheap to clone; clones share the store and stop flag,
/// so status queries and `stop()` work from other tasks while `run` is active.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<Config>,
    codec: Arc<TomlCodec>,
    store: Arc<JobStore>,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl Engine {
    /// Create an engine with a codec built from the config and no validators.
    pub fn new(config: Config) -> Self {
        let codec = TomlCodec::new(config.codec.limits());
        Self::with_codec(config, codec)
    }

    /// Create an engine with a pre-built codec (e.g. with validators).
    pub fn with_codec(config: Config, codec: TomlCodec) -> Self {
        let store = JobStore::new(StoreLimits::from(&config.jobs));
        Self {
            config: Arc::new(config),
            codec: Arc::new(codec),
            store: Arc::new(store),
            stop: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn codec(&self) -> &TomlCodec {
        &self.codec
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Ask the loop to stop. Observed between messages; an in-flight
    /// processor or transport call is not interrupted.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Is the processing loop currently active?
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Connect, subscribe, and process messages until stopped.
    ///
    /// Connect and subscribe failures are fatal and returned. Everything
    /// after that is handled per message and never ends the loop; a
    /// transport that reports [`TransportError::Closed`] does.
    pub async fn run<T, P>(&self, transport: &mut T, processor: &P) -> Result<()>
    where
        T: Transport,
        P: Processor + Sync,
    {
        let options = ConnectOptions::from_config(&self.config);
        if let Err(e) = transport.connect(options).await {
            error!(uri = %self.config.connection.uri(), error = %e, "error connecting to broker");
            return Err(e.into());
        }

        let topics = &self.config.topics;
        if let Err(e) = transport.subscribe(&topics.main, topics.qos).await {
            error!(topic = %topics.main, error = %e, "error subscribing");
            if let Err(e) = transport.disconnect().await {
                warn!(error = %e, "disconnect failed");
            }
            return Err(e.into());
        }

        self.running.store(true, Ordering::Release);
        info!(topic = %topics.main, qos = %topics.qos, "engine started, listening for jobs");

        let eviction_interval = self.config.jobs.eviction_interval();
        let mut last_eviction = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            if last_eviction.elapsed() >= eviction_interval {
                self.store.evict().await;
                last_eviction = Instant::now();
            }

            match transport.recv().await {
                Ok(Some(message)) => {
                    self.process_message(transport, processor, &message).await;
                }
                Ok(None) => tokio::time::sleep(IDLE_BACKOFF).await,
                Err(TransportError::Closed) => {
                    info!("transport closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
        info!("engine stopped");
        Ok(())
    }

    /// Handle one inbound message: decode, resolve the id, apply the
    /// duplicate policy, run the processor, publish the result.
    pub async fn process_message<T, P>(
        &self,
        transport: &mut T,
        processor: &P,
        message: &InboundMessage,
    ) -> Dispatch
    where
        T: Transport,
        P: Processor + Sync,
    {
        metrics::messages_received().add(1, &[]);

        let payload = match self.codec.decode(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(topic = %message.topic, error = %e, "failed to decode payload, skipping");
                return skipped(SkipReason::Decode(e.to_string()));
            }
        };
        if payload.is_empty() {
            warn!(topic = %message.topic, "received empty payload, skipping");
            return skipped(SkipReason::Empty);
        }

        let Some(job_id) = resolve_job_id(&payload, &self.config.jobs) else {
            error!(
                topic = %message.topic,
                field = %self.config.jobs.id_field,
                "no job id found in message and generation disabled"
            );
            return skipped(SkipReason::MissingJobId);
        };

        let span = start_job_span(&job_id, &message.topic);
        self.dispatch(transport, processor, job_id, payload, &span)
            .instrument(span.clone())
            .await
    }

    async fn dispatch<T, P>(
        &self,
        transport: &mut T,
        processor: &P,
        job_id: JobId,
        payload: Table,
        span: &Span,
    ) -> Dispatch
    where
        T: Transport,
        P: Processor + Sync,
    {
        let action = &self.config.jobs.duplicate_action;
        let existing = self.store.status(&job_id).await;

        match policy::decide(existing, action) {
            Verdict::ProceedNew => {
                if !self.store.create(job_id.clone(), payload.clone()).await {
                    warn!(job.id = %job_id, "job was created concurrently, skipping");
                    return skipped(SkipReason::Store(format!("job {job_id} already exists")));
                }
            }
            Verdict::SkipAsDuplicate => {
                count_duplicate(action);
                if let DuplicateAction::Unknown(raw) = action {
                    warn!(job.id = %job_id, duplicate_action = %raw, "unknown duplicate_action, skipping");
                } else {
                    info!(job.id = %job_id, status = ?existing, "job already exists, skipping");
                }
                if let Err(e) = self.store.mark_duplicate(&job_id).await {
                    error!(job.id = %job_id, error = %e, "failed to mark job duplicate");
                    return skipped(SkipReason::Store(e.to_string()));
                }
                if let Some(from) = existing {
                    record_state_transition(span, from, JobStatus::Duplicate);
                }
                return Dispatch::Duplicate { job_id };
            }
            Verdict::RejectWithError => {
                count_duplicate(action);
                error!(job.id = %job_id, "job already exists, cannot reprocess");
                return Dispatch::Rejected { job_id };
            }
            Verdict::SkipInFlight => {
                count_duplicate(action);
                warn!(job.id = %job_id, "job is currently running, skipping");
                return Dispatch::InFlight { job_id };
            }
            Verdict::ProceedReprocess => {
                count_duplicate(action);
                match self.store.reprocess_or_create(&job_id, payload.clone()).await {
                    Ok(attempts) => {
                        info!(job.id = %job_id, attempts, "job exists, reprocessing as requested");
                    }
                    Err(Error::InvalidTransition { from: JobStatus::Running, .. }) => {
                        warn!(job.id = %job_id, "job started running before reprocess, skipping");
                        return Dispatch::InFlight { job_id };
                    }
                    Err(e) => {
                        error!(job.id = %job_id, error = %e, "cannot reprocess job, skipping");
                        return skipped(SkipReason::Store(e.to_string()));
                    }
                }
            }
        }

        self.execute(transport, processor, job_id, payload, span)
            .await
    }

    async fn execute<T, P>(
        &self,
        transport: &mut T,
        processor: &P,
        job_id: JobId,
        payload: Table,
        span: &Span,
    ) -> Dispatch
    where
        T: Transport,
        P: Processor + Sync,
    {
        if let Err(e) = self.store.update_status(&job_id, JobStatus::Running).await {
            error!(job.id = %job_id, error = %e, "failed to start job");
            return skipped(SkipReason::Store(e.to_string()));
        }
        record_state_transition(span, JobStatus::Pending, JobStatus::Running);
        info!(job.id = %job_id, "processing job");

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(&payload, &job_id)))
            .unwrap_or_else(|panic| {
                Err(ProcessError::new(format!(
                    "processor panicked: {}",
                    panic_message(&*panic)
                )))
            });
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Err(e) => {
                metrics::handler_duration_ms().record(duration_ms, &[KeyValue::new("outcome", "failed")]);
                if let Err(store_err) = self.store.fail(&job_id, e.to_string()).await {
                    error!(job.id = %job_id, error = %store_err, "failed to record job failure");
                }
                record_state_transition(span, JobStatus::Running, JobStatus::Failed);
                error!(job.id = %job_id, error = %e, duration_ms, "job failed");
                self.publish_failure(transport, &job_id, &e.to_string()).await;
                Dispatch::Failed {
                    job_id,
                    error: e.to_string(),
                }
            }
            Ok(envelope) => {
                metrics::handler_duration_ms()
                    .record(duration_ms, &[KeyValue::new("outcome", "completed")]);
                if let Err(e) = self.store.complete(&job_id, envelope.clone()).await {
                    error!(job.id = %job_id, error = %e, "failed to record job completion");
                }
                record_state_transition(span, JobStatus::Running, JobStatus::Completed);
                info!(job.id = %job_id, duration_ms, "job completed successfully");

                let published = match envelope {
                    Some(envelope) => self.publish_result(transport, &job_id, &envelope).await,
                    None => false,
                };
                Dispatch::Completed { job_id, published }
            }
        }
    }

    /// Report a failed job on the error topic. Best effort; the job stays
    /// FAILED either way.
    async fn publish_failure<T: Transport>(&self, transport: &mut T, job_id: &JobId, reason: &str) {
        let topics = &self.config.topics;
        let mut report = Table::new();
        report.insert("job_id".to_string(), Value::String(job_id.to_string()));
        report.insert("error".to_string(), Value::String(reason.to_string()));
        report.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        let bytes = match self.codec.encode(&report) {
            Ok(bytes) => bytes,
            Err(e) => {
                metrics::publish_failures().add(1, &[]);
                error!(job.id = %job_id, topic = %topics.error, error = %e, "error encoding failure report");
                return;
            }
        };
        match transport
            .publish(&topics.error, bytes, topics.qos, topics.retain)
            .await
        {
            Ok(()) => info!(job.id = %job_id, topic = %topics.error, "published failure report"),
            Err(e) => {
                metrics::publish_failures().add(1, &[]);
                error!(job.id = %job_id, topic = %topics.error, error = %e, "error publishing failure report");
            }
        }
    }

    /// Publish a result envelope. Failures are logged; the job stays COMPLETED.
    async fn publish_result<T: Transport>(
        &self,
        transport: &mut T,
        job_id: &JobId,
        envelope: &ResultEnvelope,
    ) -> bool {
        let topic = envelope.target_topic(&self.config.topics.results);

        let bytes = match self.codec.encode(&envelope.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                metrics::publish_failures().add(1, &[]);
                error!(job.id = %job_id, topic, error = %e, "error encoding result");
                return false;
            }
        };

        match transport
            .publish(topic, bytes, envelope.qos, envelope.retain)
            .await
        {
            Ok(()) => {
                info!(job.id = %job_id, topic, "published result");
                true
            }
            Err(e) => {
                metrics::publish_failures().add(1, &[]);
                error!(job.id = %job_id, topic, error = %e, "error publishing result");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status queries
    // -----------------------------------------------------------------------

    pub async fn get_job(&self, id: &JobId) -> Option<JobRecord> {
        self.store.get(id).await
    }

    pub async fn job_exists(&self, id: &JobId) -> bool {
        self.store.contains(id).await
    }

    pub async fn is_job_running(&self, id: &JobId) -> bool {
        self.store.status(id).await.is_some_and(JobStatus::is_running)
    }

    /// True once the processor has finished with the job, successfully or not.
    pub async fn is_job_completed(&self, id: &JobId) -> bool {
        self.store.status(id).await.is_some_and(JobStatus::is_completed)
    }

    pub async fn all_jobs(&self) -> Vec<JobRecord> {
        self.store.list(None).await
    }

    pub async fn running_jobs(&self) -> Vec<JobRecord> {
        self.store.list(Some(JobStatus::Running)).await
    }

    pub async fn completed_jobs(&self) -> Vec<JobRecord> {
        self.store.list(Some(JobStatus::Completed)).await
    }

    pub async fn failed_jobs(&self) -> Vec<JobRecord> {
        self.store.list(Some(JobStatus::Failed)).await
    }

    pub async fn duplicate_jobs(&self) -> Vec<JobRecord> {
        self.store.list(Some(JobStatus::Duplicate)).await
    }

    /// Run eviction now instead of waiting for the loop's next pass.
    pub async fn cleanup_old_jobs(&self) -> EvictionReport {
        self.store.evict().await
    }

    // -----------------------------------------------------------------------
    // Direct publishing
    // -----------------------------------------------------------------------

    /// Publish raw bytes, bypassing job tracking.
    pub async fn send_message<T: Transport>(
        &self,
        transport: &mut T,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        transport.publish(topic, payload.into(), qos, retain).await?;
        Ok(())
    }

    /// Encode a table and publish it.
    pub async fn send_table<T: Transport>(
        &self,
        transport: &mut T,
        topic: &str,
        data: &Table,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        let bytes = self.codec.encode(data)?;
        self.send_message(transport, topic, bytes, qos, retain).await
    }

    /// Load a TOML file through the codec and publish its contents.
    pub async fn send_toml_file<T: Transport>(
        &self,
        transport: &mut T,
        topic: &str,
        path: impl AsRef<Path>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        let parsed = self
            .codec
            .parse(PayloadSource::File(path.as_ref().to_path_buf()))?;
        if !parsed.is_valid() {
            return Err(CodecError::Invalid(parsed.validation_errors).into());
        }
        self.send_table(transport, topic, &parsed.data, qos, retain)
            .await
    }

    /// Publish to a configured custom topic using its qos and retain settings.
    pub async fn send_to_custom_topic<T: Transport>(
        &self,
        transport: &mut T,
        name: &str,
        data: &Table,
    ) -> Result<()> {
        let options = self
            .config
            .custom_topic(name)
            .ok_or_else(|| Error::Config(format!("unknown custom topic: {name}")))?;
        self.send_table(transport, name, data, options.qos, options.retain)
            .await
    }
}

fn skipped(reason: SkipReason) -> Dispatch {
    metrics::messages_skipped().add(1, &[KeyValue::new("reason", reason.label())]);
    Dispatch::Skipped { reason }
}

fn count_duplicate(action: &DuplicateAction) {
    metrics::job_duplicates().add(1, &[KeyValue::new("action", action.to_string())]);
}
