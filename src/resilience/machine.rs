//! Per-key escalation ladder.
//!
//! Counts attempts, timeouts and rate limits for one escalation key and
//! advises when the caller should degrade its request shape. The level only
//! ever goes up for a key; a new key starts at zero.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use super::options::{DegradedCeilings, RequestOptions, apply_level_to_options};
use crate::config::ResilienceConfig;
use crate::error::{GuardrailKind, InvariantViolation};
use crate::events::{EventPayload, EventSink};

/// Cap on the escalation history kept per key.
const MAX_HISTORY: usize = 50;

/// Build the conventional escalation key for a job stage.
pub fn escalation_key(job_id: &str, stage: &str) -> String {
    format!("{}::{stage}", job_id.trim())
}

/// Outcome of one attempt, from the escalation point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResilienceOutcome {
    Success,
    Timeout,
    RateLimited,
    Error,
    /// The optional proofreading stage misbehaved; stop issuing it for a while.
    DisableProofread,
}

/// Classified error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    CountMismatch,
    IdsSubset,
    Placeholders,
    SchemaViolation,
    RateLimited,
    Timeout,
    /// Generic retryable failure.
    Transient,
    Fatal,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CountMismatch => "count_mismatch",
            Self::IdsSubset => "ids_subset",
            Self::Placeholders => "placeholders",
            Self::SchemaViolation => "schema_violation",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }

    /// Error types that justify stepping up the ladder on their own.
    pub fn triggers_escalation(&self) -> bool {
        matches!(
            self,
            Self::CountMismatch
                | Self::IdsSubset
                | Self::Placeholders
                | Self::SchemaViolation
                | Self::RateLimited
                | Self::Timeout
        )
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<GuardrailKind> for ErrorType {
    fn from(kind: GuardrailKind) -> Self {
        match kind {
            GuardrailKind::CountMismatch => Self::CountMismatch,
            GuardrailKind::IdsSubset => Self::IdsSubset,
            GuardrailKind::Placeholders => Self::Placeholders,
        }
    }
}

/// The last error seen for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub error_type: ErrorType,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorDescriptor {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl From<&InvariantViolation> for ErrorDescriptor {
    fn from(violation: &InvariantViolation) -> Self {
        Self::new(violation.kind.into(), violation.to_string())
    }
}

/// One step up the ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub from: u8,
    pub to: u8,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct ResilienceState {
    attempts: u32,
    timeouts: u32,
    rate_limits: u32,
    started_at: Instant,
    level: u8,
    last_error: Option<ErrorDescriptor>,
    proofread_disabled_until: Option<(Instant, DateTime<Utc>)>,
    last_state_log_at: Option<Instant>,
    history: Vec<EscalationRecord>,
}

impl ResilienceState {
    fn new() -> Self {
        Self {
            attempts: 0,
            timeouts: 0,
            rate_limits: 0,
            started_at: Instant::now(),
            level: 0,
            last_error: None,
            proofread_disabled_until: None,
            last_state_log_at: None,
            history: Vec::new(),
        }
    }

    fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }

    /// Move to `to` (never down). Returns the record if the level changed.
    fn raise_to(&mut self, to: u8, reason: &str) -> Option<EscalationRecord> {
        if to <= self.level {
            return None;
        }
        let record = EscalationRecord {
            from: self.level,
            to,
            reason: reason.to_string(),
            error_type: self.last_error.as_ref().map(|e| e.error_type),
            at: Utc::now(),
        };
        self.level = to;
        self.history.push(record.clone());
        if self.history.len() > MAX_HISTORY {
            let drain_count = self.history.len() - MAX_HISTORY;
            self.history.drain(..drain_count);
        }
        Some(record)
    }

    fn snapshot(&self, key: &str) -> ResilienceSnapshot {
        ResilienceSnapshot {
            key: key.to_string(),
            attempts: self.attempts,
            timeouts: self.timeouts,
            rate_limits: self.rate_limits,
            level: self.level,
            elapsed_ms: self.elapsed().as_millis() as u64,
            last_error: self.last_error.clone(),
            proofread_disabled_until: self
                .proofread_disabled_until
                .filter(|(until, _)| *until > Instant::now())
                .map(|(_, wall)| wall),
            history: self.history.clone(),
        }
    }
}

/// Public, read-only view of a key's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceSnapshot {
    pub key: String,
    pub attempts: u32,
    pub timeouts: u32,
    pub rate_limits: u32,
    pub level: u8,
    pub elapsed_ms: u64,
    pub last_error: Option<ErrorDescriptor>,
    /// Set while proofreading is disabled for this key.
    pub proofread_disabled_until: Option<DateTime<Utc>>,
    pub history: Vec<EscalationRecord>,
}

/// Escalation state for every key. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ResilienceMachine {
    config: Arc<ResilienceConfig>,
    states: Arc<DashMap<String, ResilienceState>>,
    events: EventSink,
}

impl ResilienceMachine {
    pub fn new(config: ResilienceConfig, events: EventSink) -> Self {
        Self {
            config: Arc::new(config),
            states: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn max_level(&self) -> u8 {
        self.config.max_level
    }

    /// Count one attempt and its outcome.
    pub fn record_outcome(
        &self,
        key: &str,
        outcome: ResilienceOutcome,
        error: Option<ErrorDescriptor>,
    ) {
        let mut events = Vec::new();
        {
            let mut state = self
                .states
                .entry(key.to_string())
                .or_insert_with(ResilienceState::new);

            state.attempts += 1;
            match outcome {
                ResilienceOutcome::Timeout => state.timeouts += 1,
                ResilienceOutcome::RateLimited => state.rate_limits += 1,
                ResilienceOutcome::DisableProofread => {
                    let window = self.config.proofread_disable_window;
                    let wall = Utc::now()
                        + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
                    state.proofread_disabled_until = Some((Instant::now() + window, wall));
                    info!(key = %key, window_secs = window.as_secs(), "Proofreading disabled");
                }
                ResilienceOutcome::Success | ResilienceOutcome::Error => {}
            }
            if let Some(error) = error {
                state.last_error = Some(error);
            }

            if state.elapsed() > self.config.hard_ceiling {
                if let Some(record) = state.raise_to(self.config.max_level, "hard_ceiling") {
                    info!(key = %key, from = record.from, to = record.to, "Hard ceiling reached, forcing maximum degradation");
                    events.push(escalation_event(key, &record));
                }
            }

            let now = Instant::now();
            let log_due = state
                .last_state_log_at
                .is_none_or(|t| now.saturating_duration_since(t) >= self.config.state_log_interval);
            if log_due {
                state.last_state_log_at = Some(now);
                debug!(
                    key = %key,
                    outcome = ?outcome,
                    attempts = state.attempts,
                    timeouts = state.timeouts,
                    rate_limits = state.rate_limits,
                    level = state.level,
                    "Resilience state"
                );
            }

            events.push(EventPayload::ResilienceTransition {
                key: key.to_string(),
                attempts: state.attempts,
                timeouts: state.timeouts,
                rate_limits: state.rate_limits,
                level: state.level,
            });
        }

        for event in events {
            self.events.emit(event);
        }
    }

    /// Whether accumulated failures (or `error_type` itself) justify degrading.
    pub fn should_escalate(&self, key: &str, error_type: Option<ErrorType>) -> bool {
        let (attempts, timeouts, rate_limits, level, elapsed) = match self.states.get(key) {
            Some(state) => (
                state.attempts,
                state.timeouts,
                state.rate_limits,
                state.level,
                state.elapsed(),
            ),
            None => (0, 0, 0, 0, Duration::ZERO),
        };
        let cfg = &self.config;

        elapsed > cfg.hard_ceiling
            || attempts >= cfg.max_attempts
            || timeouts >= cfg.max_timeouts
            || rate_limits >= cfg.max_rate_limits
            || (level < cfg.max_level && error_type.is_some_and(|t| t.triggers_escalation()))
            || (error_type == Some(ErrorType::Transient) && attempts >= cfg.transient_attempts)
    }

    /// Step one level up (clamped). Returns the level after the call.
    pub fn escalate(&self, key: &str, reason: &str) -> u8 {
        let (level, record) = {
            let mut state = self
                .states
                .entry(key.to_string())
                .or_insert_with(ResilienceState::new);
            let target = state.level.saturating_add(1).min(self.config.max_level);
            let record = state.raise_to(target, reason);
            (state.level, record)
        };

        if let Some(record) = record {
            info!(
                key = %key,
                from = record.from,
                to = record.to,
                reason = %reason,
                last_error = record.error_type.map(|t| t.as_str()),
                "Escalated degradation level"
            );
            self.events.emit(escalation_event(key, &record));
        }
        level
    }

    /// Current level for a key (0 if unknown).
    pub fn level(&self, key: &str) -> u8 {
        self.states.get(key).map(|s| s.level).unwrap_or(0)
    }

    /// Options for `level` using this machine's degradation ceilings.
    pub fn apply_level_to_options(&self, level: u8, base: &RequestOptions) -> RequestOptions {
        let level = level.min(self.config.max_level);
        apply_level_to_options(level, base, DegradedCeilings::from(self.config.as_ref()))
    }

    /// Whether the optional proofreading stage may be issued for this key.
    pub fn proofread_allowed(&self, key: &str) -> bool {
        self.states
            .get(key)
            .and_then(|s| s.proofread_disabled_until)
            .is_none_or(|(until, _)| Instant::now() >= until)
    }

    pub fn get_state(&self, key: &str) -> Option<ResilienceSnapshot> {
        self.states.get(key).map(|s| s.snapshot(key))
    }

    /// Drop a key's state once its job is finished.
    pub fn forget(&self, key: &str) -> bool {
        self.states.remove(key).is_some()
    }
}

fn escalation_event(key: &str, record: &EscalationRecord) -> EventPayload {
    EventPayload::Escalation {
        key: key.to_string(),
        from: record.from,
        to: record.to,
        reason: record.reason.clone(),
        last_error: record.error_type.map(|t| t.as_str().to_string()),
    }
}
