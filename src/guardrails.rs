//! Post-hoc structural checks on completed work.
//!
//! The `check_*` functions are pure and return a typed
//! [`InvariantViolation`]. [`Guardrails`] wraps them with throttled logging
//! and event emission; the violation itself is always returned to the caller.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use regex::Regex;
use serde_json::json;
use tokio::time::Instant;
use tracing::warn;

use crate::config::GuardrailConfig;
use crate::error::{GuardrailKind, InvariantViolation};
use crate::events::{EventPayload, EventSink};

/// Throttle entries kept before stale ones are pruned.
const THROTTLE_PRUNE_THRESHOLD: usize = 1024;

/// Template variables, printf/format placeholders and inline markup tags.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\{\{[^{}]*\}\}",
        r"|\$\{[^{}]*\}",
        r"|\{[A-Za-z0-9_.:\-]*\}",
        r"|%(?:\d+\$)?[-+0#]*\d*(?:\.\d+)?[sdifuxXeEgGcp@]",
        r"|</?[A-Za-z][A-Za-z0-9\-]*",
        r#"(?:\s+[A-Za-z_:][A-Za-z0-9_:.\-]*\s*=\s*(?:"[^"]*"|'[^']*'))*\s*/?>"#,
    ))
    .expect("placeholder regex is valid")
});

/// Extract placeholder tokens from `text`, sorted.
///
/// Whitespace inside brace-delimited tokens is ignored, so `{{ name }}` and
/// `{{name}}` compare equal.
pub fn extract_placeholders(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = PLACEHOLDER_RE
        .find_iter(text)
        .map(|m| {
            let token = m.as_str();
            if token.starts_with('{') || token.starts_with('$') {
                token.chars().filter(|c| !c.is_whitespace()).collect()
            } else {
                token.to_string()
            }
        })
        .collect();
    tokens.sort();
    tokens
}

fn violation(
    kind: GuardrailKind,
    stage: &str,
    message: String,
    details: serde_json::Value,
) -> InvariantViolation {
    InvariantViolation {
        kind,
        stage: stage.to_string(),
        message,
        details,
    }
}

/// Expected and actual item counts must be equal. `None` on either side
/// means the check does not apply.
pub fn check_count_match(
    stage: &str,
    expected: impl Into<Option<usize>>,
    actual: impl Into<Option<usize>>,
) -> Result<(), InvariantViolation> {
    let (Some(expected), Some(actual)) = (expected.into(), actual.into()) else {
        return Ok(());
    };
    if expected == actual {
        return Ok(());
    }
    Err(violation(
        GuardrailKind::CountMismatch,
        stage,
        format!("expected {expected} items, got {actual}"),
        json!({ "expected": expected, "actual": actual }),
    ))
}

/// Every actual id must belong to the expected set.
pub fn check_ids_subset<E, A>(
    stage: &str,
    expected: impl IntoIterator<Item = E>,
    actual: impl IntoIterator<Item = A>,
) -> Result<(), InvariantViolation>
where
    E: AsRef<str>,
    A: AsRef<str>,
{
    let allowed: HashSet<String> = expected
        .into_iter()
        .map(|id| id.as_ref().to_string())
        .collect();

    let mut seen = HashSet::new();
    let extras: Vec<String> = actual
        .into_iter()
        .map(|id| id.as_ref().to_string())
        .filter(|id| !allowed.contains(id) && seen.insert(id.clone()))
        .collect();

    if extras.is_empty() {
        return Ok(());
    }
    Err(violation(
        GuardrailKind::IdsSubset,
        stage,
        format!("{} unexpected id(s)", extras.len()),
        json!({ "extras": extras, "expected_count": allowed.len() }),
    ))
}

/// Placeholders in `transformed` must match those in `source` as a multiset.
pub fn check_placeholders_match(
    stage: &str,
    source: &str,
    transformed: &str,
) -> Result<(), InvariantViolation> {
    let expected = extract_placeholders(source);
    let actual = extract_placeholders(transformed);
    if expected == actual {
        return Ok(());
    }

    let mut balance: BTreeMap<&str, i64> = BTreeMap::new();
    for token in &expected {
        *balance.entry(token.as_str()).or_default() += 1;
    }
    for token in &actual {
        *balance.entry(token.as_str()).or_default() -= 1;
    }

    let mut missing = Vec::new();
    let mut unexpected = Vec::new();
    for (token, count) in balance {
        for _ in 0..count.max(0) {
            missing.push(token);
        }
        for _ in 0..(-count).max(0) {
            unexpected.push(token);
        }
    }

    Err(violation(
        GuardrailKind::Placeholders,
        stage,
        format!(
            "{} placeholder(s) missing, {} unexpected",
            missing.len(),
            unexpected.len()
        ),
        json!({
            "expected": expected,
            "actual": actual,
            "missing": missing,
            "unexpected": unexpected,
        }),
    ))
}

/// Where a checked unit of work came from; also the log throttle key.
#[derive(Debug, Clone, Default)]
pub struct GuardrailContext {
    pub stage: String,
    pub request_id: Option<String>,
    pub block_key: Option<String>,
}

impl GuardrailContext {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Default::default()
        }
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn block(mut self, block_key: impl Into<String>) -> Self {
        self.block_key = Some(block_key.into());
        self
    }
}

type ThrottleKey = (String, GuardrailKind, Option<String>, Option<String>);

/// Guardrail checks with throttled reporting.
#[derive(Debug, Clone)]
pub struct Guardrails {
    window: Duration,
    last_logged: Arc<DashMap<ThrottleKey, Instant>>,
    events: EventSink,
}

impl Guardrails {
    pub fn new(config: GuardrailConfig, events: EventSink) -> Self {
        Self {
            window: config.log_window,
            last_logged: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn check_count_match(
        &self,
        ctx: &GuardrailContext,
        expected: impl Into<Option<usize>>,
        actual: impl Into<Option<usize>>,
    ) -> Result<(), InvariantViolation> {
        check_count_match(&ctx.stage, expected, actual).inspect_err(|v| {
            self.report(ctx, v);
        })
    }

    pub fn check_ids_subset<E, A>(
        &self,
        ctx: &GuardrailContext,
        expected: impl IntoIterator<Item = E>,
        actual: impl IntoIterator<Item = A>,
    ) -> Result<(), InvariantViolation>
    where
        E: AsRef<str>,
        A: AsRef<str>,
    {
        check_ids_subset(&ctx.stage, expected, actual).inspect_err(|v| {
            self.report(ctx, v);
        })
    }

    pub fn check_placeholders_match(
        &self,
        ctx: &GuardrailContext,
        source: &str,
        transformed: &str,
    ) -> Result<(), InvariantViolation> {
        check_placeholders_match(&ctx.stage, source, transformed).inspect_err(|v| {
            self.report(ctx, v);
        })
    }

    /// Log and publish a violation unless the same tuple was reported within
    /// the window. Returns whether it was reported.
    pub fn report(&self, ctx: &GuardrailContext, violation: &InvariantViolation) -> bool {
        let key: ThrottleKey = (
            ctx.stage.clone(),
            violation.kind,
            ctx.request_id.clone(),
            ctx.block_key.clone(),
        );
        let now = Instant::now();

        let due = match self.last_logged.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
            Entry::Occupied(mut occupied) => {
                if now.saturating_duration_since(*occupied.get()) > self.window {
                    occupied.insert(now);
                    true
                } else {
                    false
                }
            }
        };

        if self.last_logged.len() > THROTTLE_PRUNE_THRESHOLD {
            let window = self.window;
            self.last_logged
                .retain(|_, at| now.saturating_duration_since(*at) <= window);
        }

        if !due {
            return false;
        }

        warn!(
            stage = %ctx.stage,
            violation = %violation.kind,
            request_id = ctx.request_id.as_deref(),
            block_key = ctx.block_key.as_deref(),
            details = %violation.details,
            "Guardrail violation"
        );
        self.events.emit(EventPayload::GuardrailViolation {
            stage: ctx.stage.clone(),
            violation: violation.kind,
            request_id: ctx.request_id.clone(),
            block_key: ctx.block_key.clone(),
            details: violation.details.clone(),
        });
        true
    }
}
