//! AI Governor: adaptive admission and resilience control for outbound AI calls.

pub mod admission;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod governor;
pub mod guardrails;
pub mod jobs;
pub mod resilience;

pub use config::GovernorConfig;
pub use error::{Error, Result};
pub use governor::{Governor, UnitOutput, WorkUnit};
