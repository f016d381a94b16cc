//! Ref-counted job entries sharing a single cancellation token.
//!
//! Many concurrent sub-requests of one logical job acquire the same entry and
//! observe the same [`CancellationToken`]. The token is level-triggered, so a
//! handle acquired after `cancel` sees an already-cancelled job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::JobError;

/// Canonical form of a job id: surrounding whitespace is not significant.
/// Returns `None` for an empty id.
pub fn normalize_job_id(job_id: &str) -> Option<&str> {
    let job_id = job_id.trim();
    (!job_id.is_empty()).then_some(job_id)
}

/// Optional metadata attached on acquisition.
#[derive(Debug, Clone, Default)]
pub struct JobMeta {
    /// Tab / UI context the job belongs to.
    pub tab_id: Option<String>,
    /// Current processing stage label.
    pub stage: Option<String>,
}

impl JobMeta {
    pub fn with_stage(stage: impl Into<String>) -> Self {
        Self {
            tab_id: None,
            stage: Some(stage.into()),
        }
    }

    pub fn tab(mut self, tab_id: impl Into<String>) -> Self {
        self.tab_id = Some(tab_id.into());
        self
    }
}

/// Registry view of one logical job.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub job_id: String,
    pub tab_id: Option<String>,
    pub stage: Option<String>,
    pub token: CancellationToken,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ref_count: u32,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    last_seen: Instant,
}

impl JobEntry {
    fn new(job_id: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            tab_id: None,
            stage: None,
            token: CancellationToken::new(),
            created_at: now,
            last_seen_at: now,
            ref_count: 0,
            cancelled_at: None,
            cancel_reason: None,
            last_seen: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_seen_at = Utc::now();
        self.last_seen = Instant::now();
    }

    fn apply_meta(&mut self, meta: JobMeta) {
        if let Some(tab_id) = meta.tab_id {
            self.tab_id = Some(tab_id);
        }
        if let Some(stage) = meta.stage {
            self.stage = Some(stage);
        }
    }

    /// Whether the job has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    /// Time since the entry was last acquired, released or cancelled.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_seen)
    }
}

/// Caller-held view of a job: its id, stage and shared cancellation token.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: String,
    stage: Option<String>,
    token: CancellationToken,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    /// The shared cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the job is cancelled (immediately if it already was).
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// One unit of the job's reference count.
///
/// `release` is idempotent; dropping an unreleased lease releases it.
#[derive(Debug)]
pub struct JobLease {
    job_id: String,
    jobs: Arc<DashMap<String, JobEntry>>,
    released: AtomicBool,
}

impl JobLease {
    /// Give back this reference. Calls after the first are no-ops.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut entry) = self.jobs.get_mut(&self.job_id) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.touch();
            debug!(job_id = %self.job_id, ref_count = entry.ref_count, "Job reference released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Tracks jobs by id. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<DashMap<String, JobEntry>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on `job_id`, creating the entry if it is unknown.
    ///
    /// # Errors
    /// - `JobError::InvalidJobId` if the id is empty or whitespace
    pub fn acquire(&self, job_id: &str, meta: JobMeta) -> Result<(JobHandle, JobLease), JobError> {
        let job_id = normalize_job_id(job_id).ok_or(JobError::InvalidJobId)?;

        let handle = {
            let mut entry = match self.jobs.entry(job_id.to_string()) {
                Entry::Occupied(occupied) => occupied.into_ref(),
                Entry::Vacant(vacant) => {
                    debug!(job_id = %job_id, "Registered new job");
                    vacant.insert(JobEntry::new(job_id))
                }
            };
            entry.apply_meta(meta);
            entry.ref_count += 1;
            entry.touch();

            JobHandle {
                job_id: entry.job_id.clone(),
                stage: entry.stage.clone(),
                token: entry.token.clone(),
            }
        };

        let lease = JobLease {
            job_id: job_id.to_string(),
            jobs: Arc::clone(&self.jobs),
            released: AtomicBool::new(false),
        };

        Ok((handle, lease))
    }

    /// Cancel a job. Returns `false` if the id is unknown.
    ///
    /// The first reason recorded wins; later calls still return `true`.
    pub fn cancel(&self, job_id: &str, reason: &str) -> bool {
        let Some(job_id) = normalize_job_id(job_id) else {
            return false;
        };
        let Some(mut entry) = self.jobs.get_mut(job_id) else {
            return false;
        };

        if entry.cancelled_at.is_none() {
            entry.cancelled_at = Some(Utc::now());
            entry.cancel_reason = Some(reason.to_string());
            info!(
                job_id = %job_id,
                reason = %reason,
                ref_count = entry.ref_count,
                "Job cancelled"
            );
        }
        entry.touch();
        entry.token.cancel();
        true
    }

    /// Read-only copy of a job entry.
    pub fn get(&self, job_id: &str) -> Option<JobEntry> {
        let job_id = normalize_job_id(job_id)?;
        self.jobs.get(job_id).map(|e| e.value().clone())
    }

    /// Remove unreferenced entries idle for longer than `ttl`.
    /// Returns the number of entries removed.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let mut removed = 0;
        self.jobs.retain(|_, entry| {
            let expired = entry.ref_count == 0 && entry.idle_for() > ttl;
            if expired {
                removed += 1;
            }
            !expired
        });

        if removed > 0 {
            debug!(count = removed, "Swept idle jobs");
        }
        removed
    }

    /// Number of tracked jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
