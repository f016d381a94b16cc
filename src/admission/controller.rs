//! Adaptive per-route concurrency limiter.
//!
//! Each route key owns an [`AdmissionState`] behind its own lock, so routes
//! never contend with each other. Waiters poll in bounded slices and are also
//! woken early when a slot on their route is released. There is no FIFO
//! guarantee among waiters.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, futures::Notified};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{AdmissionOutcome, AdmissionState, LimitChange, RequestStats};
use crate::config::AdmissionConfig;
use crate::error::ConfigError;
use crate::events::{EventPayload, EventSink};

/// Build the conventional route key for an operation and model tier.
pub fn route_key(operation: &str, model: &str) -> String {
    format!("{operation}::{model}")
}

#[derive(Debug)]
struct Route {
    state: Mutex<AdmissionState>,
    released: Notify,
}

#[derive(Debug)]
struct Shared {
    config: AdmissionConfig,
    routes: DashMap<String, Arc<Route>>,
    events: EventSink,
}

impl Shared {
    fn route(&self, key: &str) -> Arc<Route> {
        if let Some(route) = self.routes.get(key) {
            return Arc::clone(route.value());
        }
        let route = self.routes.entry(key.to_string()).or_insert_with(|| {
            debug!(route = %key, limit = self.config.initial_limit, "Created admission route");
            Arc::new(Route {
                state: Mutex::new(AdmissionState::new(&self.config)),
                released: Notify::new(),
            })
        });
        Arc::clone(route.value())
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.config.backoff_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    fn release(
        &self,
        key: &str,
        route: &Route,
        outcome: AdmissionOutcome,
        retry_after: Option<Duration>,
    ) {
        let mut events = Vec::new();
        {
            let mut state = route.state.lock();
            let now = Instant::now();
            state.release_slot();

            let change = match outcome {
                AdmissionOutcome::RateLimited => {
                    let applied = state.on_rate_limited(&self.config, now, self.jitter(), retry_after);
                    warn!(
                        route = %key,
                        backoff_ms = applied.backoff.as_millis() as u64,
                        limit = state.limit,
                        recent_overloads = state.recent_overloads,
                        "Route overloaded, backing off"
                    );
                    events.push(EventPayload::Overload {
                        route: key.to_string(),
                        backoff_ms: applied.backoff.as_millis() as u64,
                        limit: state.limit,
                        recent_overloads: state.recent_overloads,
                    });
                    applied.limit.map(|c| (c, "rate_limited"))
                }
                AdmissionOutcome::TransientError => state
                    .on_transient_error(&self.config)
                    .map(|c| (c, "consecutive_transient_errors")),
                AdmissionOutcome::Success => state
                    .on_success(&self.config, now)
                    .map(|c| (c, "stable_recovery")),
                AdmissionOutcome::Abandoned => None,
            };

            if let Some((LimitChange { from, to }, reason)) = change {
                info!(route = %key, from, to, reason, "Concurrency limit changed");
                events.push(EventPayload::LimitChanged {
                    route: key.to_string(),
                    from,
                    to,
                    reason: reason.to_string(),
                });
            }

            debug!(
                route = %key,
                outcome = %outcome,
                in_flight = state.in_flight,
                limit = state.limit,
                "Admission slot released"
            );
            events.push(snapshot_event(key, &state, now));
        }

        route.released.notify_waiters();
        for event in events {
            self.events.emit(event);
        }
    }
}

fn snapshot_event(key: &str, state: &AdmissionState, now: Instant) -> EventPayload {
    EventPayload::AdmissionSnapshot {
        route: key.to_string(),
        limit: state.limit,
        in_flight: state.in_flight,
        ema_latency_ms: state.ema_latency_ms,
        backoff_remaining_ms: state
            .backoff_remaining(now)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
    }
}

/// Permission to have one request in flight on a route.
///
/// Hand it back with [`AdmissionController::release`]. Dropping it without
/// a release counts as [`AdmissionOutcome::Abandoned`].
#[derive(Debug)]
pub struct AdmissionSlot {
    route_key: String,
    route: Arc<Route>,
    shared: Arc<Shared>,
    released: bool,
}

impl AdmissionSlot {
    pub fn route_key(&self) -> &str {
        &self.route_key
    }

    /// Release the slot with an outcome.
    pub fn release(mut self, outcome: AdmissionOutcome) {
        self.finish(outcome, None);
    }

    /// Release as rate limited, honoring the remote's retry-after hint.
    pub fn release_rate_limited(mut self, retry_after: Option<Duration>) {
        self.finish(AdmissionOutcome::RateLimited, retry_after);
    }

    fn finish(&mut self, outcome: AdmissionOutcome, retry_after: Option<Duration>) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.shared
            .release(&self.route_key, &self.route, outcome, retry_after);
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.finish(AdmissionOutcome::Abandoned, None);
    }
}

enum Wait<'a> {
    Backoff(Duration),
    Slot(Notified<'a>),
}

/// Adaptive admission controller. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    /// # Errors
    /// - `ConfigError::InvalidValue` if `config` fails [`AdmissionConfig::validate`]
    pub fn new(config: AdmissionConfig, events: EventSink) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                routes: DashMap::new(),
                events,
            }),
        })
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.shared.config
    }

    /// Wait for a slot on `route_key`.
    ///
    /// Returns only once the route's backoff window has passed and its
    /// in-flight count is below the limit.
    pub async fn acquire(&self, route_key: &str) -> AdmissionSlot {
        let route = self.shared.route(route_key);
        let backoff_poll = self.shared.config.backoff_poll;
        let slot_poll = self.shared.config.slot_poll;

        loop {
            let wait = {
                let mut state = route.state.lock();
                match state.backoff_remaining(Instant::now()) {
                    Some(remaining) => Wait::Backoff(remaining.min(backoff_poll)),
                    None if state.try_admit() => break,
                    None => Wait::Slot(route.released.notified()),
                }
            };

            match wait {
                Wait::Backoff(slice) => tokio::time::sleep(slice).await,
                Wait::Slot(notified) => {
                    let _ = tokio::time::timeout(slot_poll, notified).await;
                }
            }
        }

        AdmissionSlot {
            route_key: route_key.to_string(),
            route,
            shared: Arc::clone(&self.shared),
            released: false,
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up with `None` once `cancel`
    /// fires. A cancelled wait never holds a slot.
    pub async fn acquire_cancellable(
        &self,
        route_key: &str,
        cancel: &CancellationToken,
    ) -> Option<AdmissionSlot> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            slot = self.acquire(route_key) => Some(slot),
        }
    }

    /// Release a slot with the outcome of the request it admitted.
    pub fn release(&self, slot: AdmissionSlot, outcome: AdmissionOutcome) {
        slot.release(outcome);
    }

    /// Record latency and token observations for a route.
    pub fn note_request_stats(&self, route_key: &str, stats: RequestStats) {
        let route = self.shared.route(route_key);
        let mut state = route.state.lock();
        state.note_stats(&self.shared.config, &stats);
    }

    /// Copy of a route's state. Unknown routes report their initial state.
    pub fn snapshot(&self, route_key: &str) -> AdmissionState {
        match self.shared.routes.get(route_key) {
            Some(route) => route.state.lock().clone(),
            None => AdmissionState::new(&self.shared.config),
        }
    }

    /// Every route key seen so far.
    pub fn routes(&self) -> Vec<String> {
        self.shared.routes.iter().map(|r| r.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn controller(initial: u32) -> AdmissionController {
        AdmissionController::new(
            AdmissionConfig {
                initial_limit: initial,
                ..Default::default()
            },
            EventSink::new(),
        )
        .unwrap()
    }

    #[test]
    fn route_key_format() {
        assert_eq!(route_key("translate", "gpt-x"), "translate::gpt-x");
    }

    #[tokio::test]
    async fn acquire_returns_immediately_with_free_slots() {
        let ctl = controller(2);
        let a = ctl.acquire("r").await;
        let b = ctl.acquire("r").await;
        assert_eq!(ctl.snapshot("r").in_flight, 2);

        ctl.release(a, AdmissionOutcome::Success);
        b.release(AdmissionOutcome::Success);
        assert_eq!(ctl.snapshot("r").in_flight, 0);
    }

    #[tokio::test]
    async fn dropped_slot_is_abandoned() {
        let ctl = controller(2);
        {
            let _slot = ctl.acquire("r").await;
            assert_eq!(ctl.snapshot("r").in_flight, 1);
        }
        let state = ctl.snapshot("r");
        assert_eq!(state.in_flight, 0);
        assert_eq!(state.limit, 2);
        assert_eq!(state.consecutive_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_slot_after_release() {
        let ctl = controller(1);
        let held = ctl.acquire("r").await;

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.acquire("r").await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        held.release(AdmissionOutcome::Success);
        let slot = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctl.snapshot("r").in_flight, 1);
        drop(slot);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_blocks_until_backoff_passes() {
        let ctl = controller(6);
        let slot = ctl.acquire("r").await;
        ctl.release(slot, AdmissionOutcome::RateLimited);

        let state = ctl.snapshot("r");
        assert_eq!(state.limit, 5);
        let until = state.backoff_until.unwrap();

        let slot = ctl.acquire("r").await;
        assert!(Instant::now() >= until);
        drop(slot);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellable_acquire_gives_up() {
        let ctl = controller(1);
        let _held = ctl.acquire("r").await;

        let token = CancellationToken::new();
        let waiter = {
            let ctl = ctl.clone();
            let token = token.clone();
            tokio::spawn(async move { ctl.acquire_cancellable("r", &token).await.is_none() })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        assert!(waiter.await.unwrap());
        assert_eq!(ctl.snapshot("r").in_flight, 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let ctl = controller(4);
        let token = CancellationToken::new();
        token.cancel();
        assert!(ctl.acquire_cancellable("r", &token).await.is_none());
        assert_eq!(ctl.snapshot("r").in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_never_exceeds_limit() {
        let ctl = controller(3);
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let ctl = ctl.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let slot = ctl.acquire("r").await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    slot.release(AdmissionOutcome::Abandoned);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(ctl.snapshot("r").in_flight, 0);
    }

    #[tokio::test]
    async fn routes_are_independent() {
        let ctl = controller(1);
        let _a = ctl.acquire("translate::a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), ctl.acquire("translate::b")).await;
        assert!(b.is_ok());

        let mut routes = ctl.routes();
        routes.sort();
        assert_eq!(routes, vec!["translate::a", "translate::b"]);
    }

    #[tokio::test]
    async fn release_emits_overload_event() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe().unwrap();
        let ctl = AdmissionController::new(AdmissionConfig::default(), sink).unwrap();

        let slot = ctl.acquire("r").await;
        slot.release(AdmissionOutcome::RateLimited);

        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.payload.kind())
            .collect();
        assert_eq!(kinds, vec!["overload", "limit_changed", "admission_snapshot"]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let inverted = AdmissionConfig {
            min_limit: 8,
            max_limit: 4,
            ..Default::default()
        };
        assert!(AdmissionController::new(inverted, EventSink::disabled()).is_err());

        let spinning = AdmissionConfig {
            slot_poll: Duration::ZERO,
            ..Default::default()
        };
        assert!(AdmissionController::new(spinning, EventSink::disabled()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_delays_next_acquire() {
        let ctl = controller(4);
        let slot = ctl.acquire("r").await;
        let start = Instant::now();
        slot.release_rate_limited(Some(Duration::from_secs(40)));

        let _next = ctl.acquire("r").await;
        assert!(Instant::now() - start >= Duration::from_secs(40));
    }
}
