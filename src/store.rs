//! In-memory job store.
//!
//! Single source of truth for job state. One mutex guards the whole map;
//! every operation, read or write, takes it for exactly that operation and
//! hands back owned copies, so callers never see a live view.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Mutex;
use toml::Table;
use tracing::{debug, info};

use crate::config::JobsConfig;
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;

/// Bounds applied by [`JobStore::evict`].
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_jobs: usize,
    /// Terminal jobs completed longer ago than this are evicted.
    pub retention: Duration,
}

impl From<&JobsConfig> for StoreLimits {
    fn from(config: &JobsConfig) -> Self {
        Self {
            max_jobs: config.max_in_memory,
            retention: config.retention(),
        }
    }
}

/// What an eviction run removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Removed by the age pass.
    pub expired: usize,
    /// Removed by the capacity pass.
    pub reaped: usize,
    /// Jobs left in the store.
    pub remaining: usize,
}

/// Job store. Owns the id → record map.
#[derive(Debug)]
pub struct JobStore {
    inner: Mutex<Inner>,
    limits: StoreLimits,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Slot>,
    /// Orders terminal stamps that share a timestamp.
    next_seq: u64,
}

#[derive(Debug)]
struct Slot {
    record: JobRecord,
    terminal_seq: u64,
}

impl JobStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            limits,
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    // -----------------------------------------------------------------------
    // Create / read
    // -----------------------------------------------------------------------

    /// Create a PENDING job. Returns false, leaving the existing record
    /// untouched, if the id is already tracked.
    pub async fn create(&self, id: JobId, input: Table) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&id) {
            return false;
        }
        debug!(job.id = %id, "job created");
        inner.jobs.insert(
            id.clone(),
            Slot {
                record: JobRecord::pending(id, input),
                terminal_seq: 0,
            },
        );
        true
    }

    pub async fn get(&self, id: &JobId) -> Option<JobRecord> {
        let inner = self.inner.lock().await;
        inner.jobs.get(id).map(|slot| slot.record.clone())
    }

    pub async fn contains(&self, id: &JobId) -> bool {
        self.inner.lock().await.jobs.contains_key(id)
    }

    pub async fn status(&self, id: &JobId) -> Option<JobStatus> {
        let inner = self.inner.lock().await;
        inner.jobs.get(id).map(|slot| slot.record.status)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.jobs.is_empty()
    }

    /// Snapshot of all jobs, optionally filtered by status, oldest first.
    pub async fn list(&self, status: Option<JobStatus>) -> Vec<JobRecord> {
        let inner = self.inner.lock().await;
        let mut records: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|slot| status.is_none_or(|s| slot.record.status == s))
            .map(|slot| slot.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Move a job to `to`. Returns the previous status.
    pub async fn update_status(&self, id: &JobId, to: JobStatus) -> Result<JobStatus> {
        let mut inner = self.inner.lock().await;
        transition_on(&mut inner, id, to)
    }

    /// RUNNING → COMPLETED, attaching the processor's envelope if any.
    pub async fn complete(&self, id: &JobId, result: Option<ResultEnvelope>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        transition_on(&mut inner, id, JobStatus::Completed)?;
        if let Some(slot) = inner.jobs.get_mut(id) {
            slot.record.result = result;
        }
        Ok(())
    }

    /// RUNNING → FAILED, attaching the error text.
    pub async fn fail(&self, id: &JobId, error: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        transition_on(&mut inner, id, JobStatus::Failed)?;
        if let Some(slot) = inner.jobs.get_mut(id) {
            slot.record.error = Some(error.into());
        }
        Ok(())
    }

    /// Any status → DUPLICATE. Re-stamps the completion time.
    pub async fn mark_duplicate(&self, id: &JobId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        transition_on(&mut inner, id, JobStatus::Duplicate)?;
        Ok(())
    }

    /// Replace an existing job with a fresh PENDING record for `input`.
    ///
    /// Refused while the job is RUNNING. Returns the new attempt count.
    pub async fn reprocess(&self, id: &JobId, input: Table) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        reset_slot(slot, id, input)
    }

    /// Like [`reprocess`](Self::reprocess), but a job evicted since it was
    /// looked up is created afresh instead of reported missing.
    pub async fn reprocess_or_create(&self, id: &JobId, input: Table) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.jobs.get_mut(id) else {
            debug!(job.id = %id, "job gone before reprocess, recreating");
            inner.jobs.insert(
                id.clone(),
                Slot {
                    record: JobRecord::pending(id.clone(), input),
                    terminal_seq: 0,
                },
            );
            return Ok(1);
        };
        reset_slot(slot, id, input)
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    /// Evict terminal jobs by age, then by count, using the current time.
    pub async fn evict(&self) -> EvictionReport {
        self.evict_at(Utc::now()).await
    }

    /// Eviction against an explicit clock. PENDING and RUNNING jobs are
    /// never removed, even if that leaves the store above its maximum.
    pub async fn evict_at(&self, now: DateTime<Utc>) -> EvictionReport {
        let mut inner = self.inner.lock().await;

        // Age pass.
        let retention = TimeDelta::from_std(self.limits.retention).unwrap_or(TimeDelta::MAX);
        let before = inner.jobs.len();
        if let Some(cutoff) = now.checked_sub_signed(retention) {
            inner.jobs.retain(|_, slot| {
                let expired = slot.record.status.is_terminal()
                    && slot.record.completed_at.is_some_and(|at| at < cutoff);
                !expired
            });
        }
        let expired = before - inner.jobs.len();

        // Capacity pass: oldest completion first.
        let mut reaped = 0;
        if inner.jobs.len() > self.limits.max_jobs {
            let excess = inner.jobs.len() - self.limits.max_jobs;
            let mut terminal: Vec<(Option<DateTime<Utc>>, u64, JobId)> = inner
                .jobs
                .values()
                .filter(|slot| slot.record.status.is_terminal())
                .map(|slot| (slot.record.completed_at, slot.terminal_seq, slot.record.id.clone()))
                .collect();
            terminal.sort();

            for (_, _, id) in terminal.into_iter().take(excess) {
                inner.jobs.remove(&id);
                reaped += 1;
            }
        }

        if expired > 0 {
            metrics::jobs_evicted().add(expired as u64, &[KeyValue::new("pass", "age")]);
        }
        if reaped > 0 {
            metrics::jobs_evicted().add(reaped as u64, &[KeyValue::new("pass", "capacity")]);
        }

        let report = EvictionReport {
            expired,
            reaped,
            remaining: inner.jobs.len(),
        };
        if expired + reaped > 0 {
            info!(expired, reaped, remaining = report.remaining, "evicted jobs");
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Inner functions, called with the lock already held.
// ---------------------------------------------------------------------------

/// Swap in a fresh PENDING record, keeping the attempt count.
fn reset_slot(slot: &mut Slot, id: &JobId, input: Table) -> Result<u32> {
    if slot.record.status.is_running() {
        return Err(Error::InvalidTransition {
            from: JobStatus::Running,
            to: JobStatus::Pending,
        });
    }
    let attempts = slot.record.attempts + 1;
    slot.record = JobRecord {
        attempts,
        ..JobRecord::pending(id.clone(), input)
    };
    slot.terminal_seq = 0;
    Ok(attempts)
}

fn transition_on(inner: &mut Inner, id: &JobId, to: JobStatus) -> Result<JobStatus> {
    inner.next_seq += 1;
    let seq = inner.next_seq;

    let slot = inner
        .jobs
        .get_mut(id)
        .ok_or_else(|| Error::NotFound(id.clone()))?;
    let from = slot.record.status;

    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition { from, to });
    }

    slot.record.status = to;
    if to.is_terminal() {
        slot.record.completed_at = Some(Utc::now());
        slot.terminal_seq = seq;
    }

    Ok(from)
}
