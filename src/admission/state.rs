//! Per-route admission state and its transitions.
//!
//! All transitions are synchronous and take `now` explicitly; the controller
//! calls them under the route's lock.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::AdmissionConfig;

/// How a dispatched request ended, from the admission point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionOutcome {
    /// The remote answered normally.
    Success,
    /// The remote signalled overload (HTTP 429 and friends).
    RateLimited,
    /// A failure that may be load related (5xx, timeout, connection reset).
    TransientError,
    /// The request was abandoned for reasons unrelated to remote load
    /// (job cancelled, fatal request error). Frees the slot, no signal.
    Abandoned,
}

impl std::fmt::Display for AdmissionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::RateLimited => "rate_limited",
            Self::TransientError => "transient_error",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// Observations about a completed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestStats {
    pub estimated_tokens: Option<u64>,
    pub actual_tokens: Option<u64>,
    pub latency: Option<Duration>,
}

/// A change of the concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitChange {
    pub from: u32,
    pub to: u32,
}

/// Result of applying a rate-limit signal.
#[derive(Debug, Clone, Copy)]
pub struct BackoffApplied {
    /// Backoff including jitter.
    pub backoff: Duration,
    pub limit: Option<LimitChange>,
}

/// Admission state of one route key.
#[derive(Debug, Clone)]
pub struct AdmissionState {
    pub limit: u32,
    pub in_flight: u32,
    pub last_overload_at: Option<Instant>,
    pub backoff_until: Option<Instant>,
    /// Current backoff duration, without jitter.
    pub backoff: Duration,
    pub ema_latency_ms: Option<f64>,
    pub last_latency_ms: Option<f64>,
    pub last_estimated_tokens: Option<u64>,
    pub last_actual_tokens: Option<u64>,
    pub consecutive_errors: u32,
    pub recent_overloads: u32,
    pub last_increase_at: Option<Instant>,
    pub created_at: Instant,
}

impl AdmissionState {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            limit: config.clamp_limit(config.initial_limit),
            in_flight: 0,
            last_overload_at: None,
            backoff_until: None,
            backoff: Duration::ZERO,
            ema_latency_ms: None,
            last_latency_ms: None,
            last_estimated_tokens: None,
            last_actual_tokens: None,
            consecutive_errors: 0,
            recent_overloads: 0,
            last_increase_at: None,
            created_at: Instant::now(),
        }
    }

    /// Remaining backoff at `now`, if a window is active.
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Take a slot if one is free.
    pub fn try_admit(&mut self) -> bool {
        if self.in_flight < self.limit {
            self.in_flight += 1;
            true
        } else {
            false
        }
    }

    pub fn release_slot(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn decrease_limit(&mut self, config: &AdmissionConfig) -> Option<LimitChange> {
        let from = self.limit;
        let to = config.clamp_limit(from.saturating_sub(1));
        (to != from).then(|| {
            self.limit = to;
            LimitChange { from, to }
        })
    }

    /// Exponential backoff plus one unit of limit.
    ///
    /// A `retry_after` hint from the remote extends the window, up to
    /// `backoff_cap`; it never shortens it.
    pub fn on_rate_limited(
        &mut self,
        config: &AdmissionConfig,
        now: Instant,
        jitter: Duration,
        retry_after: Option<Duration>,
    ) -> BackoffApplied {
        let doubled = self.backoff.saturating_mul(2);
        self.backoff = doubled.max(config.backoff_floor).min(config.backoff_cap);

        let hint = retry_after.map_or(Duration::ZERO, |d| d.min(config.backoff_cap));
        let backoff = (self.backoff + jitter).max(hint);
        let until = now + backoff;
        self.backoff_until = Some(match self.backoff_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        self.last_overload_at = Some(now);
        self.recent_overloads += 1;

        BackoffApplied {
            backoff,
            limit: self.decrease_limit(config),
        }
    }

    /// Count a transient error; every `transient_error_threshold` in a row
    /// costs one unit of limit.
    pub fn on_transient_error(&mut self, config: &AdmissionConfig) -> Option<LimitChange> {
        self.consecutive_errors += 1;
        if self.consecutive_errors < config.transient_error_threshold {
            return None;
        }
        self.consecutive_errors = 0;
        self.decrease_limit(config)
    }

    /// Decay error counters, relax the backoff, and maybe raise the limit.
    pub fn on_success(&mut self, config: &AdmissionConfig, now: Instant) -> Option<LimitChange> {
        self.consecutive_errors = self.consecutive_errors.saturating_sub(1);
        self.recent_overloads = self.recent_overloads.saturating_sub(1);

        if self.backoff_remaining(now).is_none() && !self.backoff.is_zero() {
            let halved = self.backoff / 2;
            self.backoff = if halved < config.backoff_floor {
                Duration::ZERO
            } else {
                halved
            };
        }

        if !self.can_increase(config, now) {
            return None;
        }

        let from = self.limit;
        self.limit = config.clamp_limit(from + 1);
        self.last_increase_at = Some(now);
        Some(LimitChange {
            from,
            to: self.limit,
        })
    }

    fn can_increase(&self, config: &AdmissionConfig, now: Instant) -> bool {
        let cooled = |at: Option<Instant>| {
            at.is_none_or(|t| now.saturating_duration_since(t) >= config.recovery_cooldown)
        };

        cooled(self.last_overload_at)
            && cooled(self.last_increase_at.or(Some(self.created_at)))
            && self.latency_stable(config.stability_tolerance)
            && self.consecutive_errors == 0
            && self.limit < config.max_limit
    }

    /// Whether the last latency sits within `tolerance` of the EMA.
    ///
    /// With no observations yet there is nothing to contradict stability.
    pub fn latency_stable(&self, tolerance: f64) -> bool {
        match (self.last_latency_ms, self.ema_latency_ms) {
            (Some(last), Some(ema)) if ema > 0.0 => ((last - ema).abs() / ema) <= tolerance,
            (Some(last), Some(_)) => last <= 0.0,
            _ => true,
        }
    }

    /// Fold request observations into the EMA and last-seen fields.
    pub fn note_stats(&mut self, config: &AdmissionConfig, stats: &RequestStats) {
        if let Some(tokens) = stats.estimated_tokens {
            self.last_estimated_tokens = Some(tokens);
        }
        if let Some(tokens) = stats.actual_tokens {
            self.last_actual_tokens = Some(tokens);
        }
        if let Some(latency) = stats.latency {
            let ms = latency.as_secs_f64() * 1000.0;
            self.last_latency_ms = Some(ms);
            self.ema_latency_ms = Some(match self.ema_latency_ms {
                Some(ema) => ema + config.ema_alpha * (ms - ema),
                None => ms,
            });
        }
    }
}
