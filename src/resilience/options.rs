//! Outbound request shape and how degradation levels rewrite it.

use serde::{Deserialize, Serialize};

use crate::config::ResilienceConfig;

/// Minimum split depth once splitting is forced.
pub const FORCED_SPLIT_DEPTH: u32 = 2;

/// How much surrounding context a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    Full,
    Short,
    None,
}

/// How the optional proofreading stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofreadMode {
    Full,
    /// Only return changed segments.
    Delta,
    Off,
}

/// Caller-supplied shape of an outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub force_fallback_model: bool,
    #[serde(default)]
    pub force_split: bool,
    #[serde(default)]
    pub min_split_depth: u32,
    pub context_mode: ContextMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    pub proofread_mode: ProofreadMode,
    /// Upper bound of work units packed into one request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_units_per_request: Option<usize>,
}

impl RequestOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            fallback_model: None,
            force_fallback_model: false,
            force_split: false,
            min_split_depth: 0,
            context_mode: ContextMode::Full,
            max_context_chars: None,
            max_completion_tokens: None,
            proofread_mode: ProofreadMode::Full,
            max_units_per_request: None,
        }
    }

    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }
}

/// Fixed ceilings applied from level 3 on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DegradedCeilings {
    pub context_chars: usize,
    pub completion_tokens: u32,
}

impl From<&ResilienceConfig> for DegradedCeilings {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            context_chars: config.degraded_context_chars,
            completion_tokens: config.degraded_completion_tokens,
        }
    }
}

impl Default for DegradedCeilings {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

fn clamp_opt<T: Ord + Copy>(current: Option<T>, ceiling: T) -> Option<T> {
    Some(current.map_or(ceiling, |v| v.min(ceiling)))
}

/// Return a copy of `base` with every mitigation up to `level` merged in.
///
/// Levels are cumulative:
/// - 1: force splitting (depth at least 2)
/// - 2: force the fallback model
/// - 3: short context, clamp context length and completion budget
/// - 4: proofreading in delta mode
/// - 5: no context, one unit per request
pub fn apply_level_to_options(
    level: u8,
    base: &RequestOptions,
    ceilings: DegradedCeilings,
) -> RequestOptions {
    let mut options = base.clone();

    if level >= 1 {
        options.force_split = true;
        options.min_split_depth = options.min_split_depth.max(FORCED_SPLIT_DEPTH);
    }

    if level >= 2 {
        options.force_fallback_model = true;
        if let Some(fallback) = &options.fallback_model {
            options.model = fallback.clone();
        }
    }

    if level >= 3 {
        if options.context_mode == ContextMode::Full {
            options.context_mode = ContextMode::Short;
        }
        options.max_context_chars = clamp_opt(options.max_context_chars, ceilings.context_chars);
        options.max_completion_tokens =
            clamp_opt(options.max_completion_tokens, ceilings.completion_tokens);
    }

    if level >= 4 && options.proofread_mode == ProofreadMode::Full {
        options.proofread_mode = ProofreadMode::Delta;
    }

    if level >= 5 {
        options.context_mode = ContextMode::None;
        options.max_context_chars = Some(0);
        options.max_units_per_request = Some(1);
    }

    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RequestOptions {
        RequestOptions::new("gpt-x").with_fallback("gpt-x-mini")
    }

    fn apply(level: u8, options: &RequestOptions) -> RequestOptions {
        apply_level_to_options(level, options, DegradedCeilings::default())
    }

    #[test]
    fn level_zero_is_identity() {
        assert_eq!(apply(0, &base()), base());
    }

    #[test]
    fn level_one_forces_split() {
        let out = apply(1, &base());
        assert!(out.force_split);
        assert_eq!(out.min_split_depth, 2);
        assert_eq!(out.model, "gpt-x");
    }

    #[test]
    fn split_depth_never_lowered() {
        let mut options = base();
        options.min_split_depth = 4;
        assert_eq!(apply(1, &options).min_split_depth, 4);
    }

    #[test]
    fn level_two_switches_model() {
        let out = apply(2, &base());
        assert!(out.force_fallback_model);
        assert_eq!(out.model, "gpt-x-mini");

        let no_fallback = apply(2, &RequestOptions::new("gpt-x"));
        assert!(no_fallback.force_fallback_model);
        assert_eq!(no_fallback.model, "gpt-x");
    }

    #[test]
    fn level_three_clamps_budgets() {
        let mut options = base();
        options.max_context_chars = Some(10_000);
        options.max_completion_tokens = Some(200);

        let out = apply(3, &options);
        assert_eq!(out.context_mode, ContextMode::Short);
        assert_eq!(out.max_context_chars, Some(1200));
        // already below the ceiling
        assert_eq!(out.max_completion_tokens, Some(200));
        assert_eq!(out.proofread_mode, ProofreadMode::Full);
    }

    #[test]
    fn level_four_uses_delta_proofreading() {
        assert_eq!(apply(4, &base()).proofread_mode, ProofreadMode::Delta);

        let mut off = base();
        off.proofread_mode = ProofreadMode::Off;
        assert_eq!(apply(4, &off).proofread_mode, ProofreadMode::Off);
    }

    #[test]
    fn level_five_is_cumulative() {
        let out = apply(5, &base());
        assert!(out.force_split);
        assert_eq!(out.model, "gpt-x-mini");
        assert_eq!(out.context_mode, ContextMode::None);
        assert_eq!(out.max_units_per_request, Some(1));
        assert_eq!(out.max_completion_tokens, Some(1024));
        assert_eq!(out.proofread_mode, ProofreadMode::Delta);
    }

    #[test]
    fn pure_and_deterministic() {
        let options = base();
        let before = options.clone();
        let a = apply(3, &options);
        let b = apply(3, &options);
        assert_eq!(a, b);
        assert_eq!(options, before);
    }
}
