//! Resilience state machine: degrade request shape as failures accumulate.
//!
//! Core components:
//! - `machine`: per-key counters, escalation advice and the level ladder
//! - `options`: request shape and the pure level-to-options rewrite

pub mod machine;
pub mod options;

pub use machine::{
    ErrorDescriptor, ErrorType, EscalationRecord, ResilienceMachine, ResilienceOutcome,
    ResilienceSnapshot, escalation_key,
};
pub use options::{
    ContextMode, DegradedCeilings, ProofreadMode, RequestOptions, apply_level_to_options,
};
