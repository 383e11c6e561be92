//! Core data model.
//!
//! A job is one tracked unit of work created from a single inbound message.
//! It has identity (a caller- or system-assigned id), the payload that
//! produced it, and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toml::Table;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job Id
// ---------------------------------------------------------------------------

/// Newtype for job identifiers. Opaque; unique within the job store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Synthesize a globally unique id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet dispatched to the processor.
    Pending,
    /// Processor invoked, awaiting return.
    Running,
    /// Processor returned normally. Terminal.
    Completed,
    /// Processor returned an error. Terminal.
    Failed,
    /// Assigned by the duplicate policy without running. Terminal.
    Duplicate,
}

impl JobStatus {
    /// Can an ordinary update move a job from self to `to`?
    ///
    /// Re-entering `Pending` is not an ordinary update; it only happens
    /// through an explicit reprocess.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (_, Duplicate)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Duplicate
        )
    }

    /// Finished by the processor, successfully or not.
    pub fn is_completed(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_running(self) -> bool {
        self == JobStatus::Running
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Duplicate => "duplicate",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "duplicate" => Ok(JobStatus::Duplicate),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Job Record
// ---------------------------------------------------------------------------

/// A job tracked by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Stamped on entry to a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// The decoded payload that produced this job.
    pub input: Table,
    /// Present only after successful completion with an envelope.
    pub result: Option<ResultEnvelope>,
    /// Present only after failure.
    pub error: Option<String>,
    /// 1 on first creation, incremented by every reprocess.
    pub attempts: u32,
}

impl JobRecord {
    pub(crate) fn pending(id: JobId, input: Table) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            input,
            result: None,
            error: None,
            attempts: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// QoS
// ---------------------------------------------------------------------------

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            n => Err(format!("invalid qos level {n}, expected 0, 1 or 2")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

// ---------------------------------------------------------------------------
// Result Envelope
// ---------------------------------------------------------------------------

/// What a processor hands back for publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub data: Table,
    /// Empty means "use the configured results topic".
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
}

impl ResultEnvelope {
    pub fn new(job_id: JobId, data: Table) -> Self {
        Self {
            data,
            topic: String::new(),
            qos: QoS::default(),
            retain: false,
            job_id,
            timestamp: Utc::now(),
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// The topic to publish on, falling back to `default` when unset.
    pub fn target_topic<'a>(&'a self, default: &'a str) -> &'a str {
        if self.topic.is_empty() {
            default
        } else {
            &self.topic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_transitions_follow_the_lifecycle() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn any_status_may_become_duplicate() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Duplicate,
        ] {
            assert!(status.can_transition_to(JobStatus::Duplicate));
        }
    }

    #[test]
    fn completed_covers_completed_and_failed_only() {
        assert!(JobStatus::Completed.is_completed());
        assert!(JobStatus::Failed.is_completed());
        assert!(!JobStatus::Duplicate.is_completed());
        assert!(JobStatus::Duplicate.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn qos_rejects_out_of_range_levels() {
        assert_eq!(QoS::try_from(1u8).unwrap(), QoS::AtLeastOnce);
        assert!(QoS::try_from(3u8).is_err());
    }

    #[test]
    fn envelope_falls_back_to_default_topic() {
        let envelope = ResultEnvelope::new(JobId::from("a1"), Table::new());
        assert_eq!(envelope.target_topic("results/default"), "results/default");

        let envelope = envelope.topic("results/x");
        assert_eq!(envelope.target_topic("results/default"), "results/x");
    }
}
