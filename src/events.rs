//! Observability sink: structured events broadcast to optional subscribers.
//!
//! Components emit through an [`EventSink`]. With no subscribers, or with a
//! disabled sink, emitting is a no-op; nothing in the governor depends on an
//! event being delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::GuardrailKind;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// A timestamped event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Event payloads, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Point-in-time view of a route after a release.
    AdmissionSnapshot {
        route: String,
        limit: u32,
        in_flight: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        ema_latency_ms: Option<f64>,
        backoff_remaining_ms: u64,
    },
    /// A route was told to back off.
    Overload {
        route: String,
        backoff_ms: u64,
        limit: u32,
        recent_overloads: u32,
    },
    /// A route's concurrency limit moved.
    LimitChanged {
        route: String,
        from: u32,
        to: u32,
        reason: String,
    },
    /// Counters for an escalation key changed.
    ResilienceTransition {
        key: String,
        attempts: u32,
        timeouts: u32,
        rate_limits: u32,
        level: u8,
    },
    /// An escalation key moved up the ladder.
    Escalation {
        key: String,
        from: u8,
        to: u8,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    /// A guardrail check failed.
    GuardrailViolation {
        stage: String,
        violation: GuardrailKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        block_key: Option<String>,
        details: serde_json::Value,
    },
}

impl EventPayload {
    /// The serde tag of this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdmissionSnapshot { .. } => "admission_snapshot",
            Self::Overload { .. } => "overload",
            Self::LimitChanged { .. } => "limit_changed",
            Self::ResilienceTransition { .. } => "resilience_transition",
            Self::Escalation { .. } => "escalation",
            Self::GuardrailViolation { .. } => "guardrail_violation",
        }
    }
}

/// Cloneable handle used by components to publish events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<broadcast::Sender<GovernorEvent>>,
}

impl EventSink {
    /// Create an enabled sink.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create an enabled sink with a specific buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Subscribe to events. Returns `None` for a disabled sink.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<GovernorEvent>> {
        self.tx.as_ref().map(|tx| tx.subscribe())
    }

    /// Publish an event. Never fails.
    pub fn emit(&self, payload: EventPayload) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.receiver_count() == 0 {
            return;
        }
        // Ok if every receiver has gone away in the meantime
        let _ = tx.send(GovernorEvent {
            timestamp: Utc::now(),
            payload,
        });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
