//! Job registry: one shared cancellation token per logical job.
//!
//! Core components:
//! - `registry`: ref-counted job entries, acquire/release/cancel/lookup
//! - `sweeper`: background reclamation of idle entries

pub mod registry;
pub mod sweeper;

pub use registry::{JobEntry, JobHandle, JobLease, JobMeta, JobRegistry, normalize_job_id};
pub use sweeper::{SweepTask, spawn_sweep_task};
