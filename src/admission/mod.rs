//! Admission control: how many requests may be in flight per route.
//!
//! Core components:
//! - `state`: per-route limit, backoff and latency bookkeeping
//! - `controller`: slot acquisition, release with outcome, stats, snapshots
//!
//! Limits drop immediately on overload and climb back one unit at a time,
//! only after a full cooldown of stable latency without errors. A decrease
//! never revokes slots already granted; it only delays new ones.

pub mod controller;
pub mod state;

pub use controller::{AdmissionController, AdmissionSlot, route_key};
pub use state::{AdmissionOutcome, AdmissionState, LimitChange, RequestStats};
