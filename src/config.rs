//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Job registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Idle time after which an unreferenced job entry is reclaimed.
    /// `None` disables reclamation entirely.
    pub idle_ttl: Option<Duration>,
    /// How often the background sweep runs. Clamped to `idle_ttl`.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Some(Duration::from_secs(600)), // 10 minutes
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    /// Effective sweep interval (never longer than the TTL).
    pub fn effective_sweep_interval(&self) -> Option<Duration> {
        self.idle_ttl
            .map(|ttl| self.sweep_interval.min(ttl).max(Duration::from_millis(1)))
    }
}

/// Per-route admission control tuning.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Limit a route starts with.
    pub initial_limit: u32,
    /// Lower clamp for the concurrency limit.
    pub min_limit: u32,
    /// Upper clamp for the concurrency limit.
    pub max_limit: u32,
    /// Smallest backoff applied after a rate limit.
    pub backoff_floor: Duration,
    /// Largest backoff applied after a rate limit (before jitter).
    pub backoff_cap: Duration,
    /// Upper bound of the random jitter added to each backoff.
    pub backoff_jitter: Duration,
    /// Quiet period required after an overload, and between two increases.
    pub recovery_cooldown: Duration,
    /// Maximum relative deviation of the last latency from the EMA for the
    /// route to count as stable.
    pub stability_tolerance: f64,
    /// EMA smoothing factor.
    pub ema_alpha: f64,
    /// Consecutive transient errors that cost one unit of limit.
    pub transient_error_threshold: u32,
    /// Sleep slice while a backoff window is active.
    pub backoff_poll: Duration,
    /// Sleep slice while waiting for a free slot.
    pub slot_poll: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            initial_limit: 6,
            min_limit: 1,
            max_limit: 12,
            backoff_floor: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: Duration::from_millis(250),
            recovery_cooldown: Duration::from_secs(30),
            stability_tolerance: 0.3,
            ema_alpha: 0.2,
            transient_error_threshold: 3,
            backoff_poll: Duration::from_millis(250),
            slot_poll: Duration::from_millis(25),
        }
    }
}

impl AdmissionConfig {
    /// Clamp a limit into `[min_limit, max_limit]`.
    pub fn clamp_limit(&self, limit: u32) -> u32 {
        limit.max(self.min_limit).min(self.max_limit)
    }

    /// Checked by [`AdmissionController::new`](crate::admission::AdmissionController::new).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_limit == 0 {
            return Err(invalid("admission.min_limit", "must be at least 1"));
        }
        if self.min_limit > self.max_limit {
            return Err(invalid(
                "admission.max_limit",
                format!("{} is below min_limit {}", self.max_limit, self.min_limit),
            ));
        }
        if self.backoff_floor > self.backoff_cap {
            return Err(invalid(
                "admission.backoff_cap",
                "must not be below backoff_floor",
            ));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(invalid(
                "admission.ema_alpha",
                format!("{} is outside (0, 1]", self.ema_alpha),
            ));
        }
        if self.backoff_poll.is_zero() {
            return Err(invalid("admission.backoff_poll", "must be non-zero"));
        }
        if self.slot_poll.is_zero() {
            return Err(invalid("admission.slot_poll", "must be non-zero"));
        }
        Ok(())
    }
}

/// Escalation ladder tuning.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Highest degradation level.
    pub max_level: u8,
    /// Attempts at which escalation is advised.
    pub max_attempts: u32,
    /// Timeouts at which escalation is advised.
    pub max_timeouts: u32,
    /// Rate limits at which escalation is advised.
    pub max_rate_limits: u32,
    /// Attempts after which a generic transient failure escalates.
    pub transient_attempts: u32,
    /// Elapsed time after which the key is forced to `max_level`.
    pub hard_ceiling: Duration,
    /// How long the proofreading stage stays disabled after a
    /// `disable_proofread` outcome.
    pub proofread_disable_window: Duration,
    /// Context character ceiling from level 3 on.
    pub degraded_context_chars: usize,
    /// Completion token ceiling from level 3 on.
    pub degraded_completion_tokens: u32,
    /// Minimum interval between two state log lines for one key.
    pub state_log_interval: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_level: 5,
            max_attempts: 8,
            max_timeouts: 3,
            max_rate_limits: 4,
            transient_attempts: 2,
            hard_ceiling: Duration::from_secs(12 * 60),
            proofread_disable_window: Duration::from_secs(15 * 60),
            degraded_context_chars: 1200,
            degraded_completion_tokens: 1024,
            state_log_interval: Duration::from_secs(5),
        }
    }
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_level == 0 {
            return Err(invalid("resilience.max_level", "must be at least 1"));
        }
        Ok(())
    }
}

/// Guardrail logging configuration.
#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    /// Window within which repeated violations for one tuple are logged once.
    pub log_window: Duration,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            log_window: Duration::from_secs(15),
        }
    }
}

/// Complete governor configuration.
#[derive(Debug, Clone, Default)]
pub struct GovernorConfig {
    pub registry: RegistryConfig,
    pub admission: AdmissionConfig,
    pub resilience: ResilienceConfig,
    pub guardrails: GuardrailConfig,
}

impl GovernorConfig {
    /// Build a configuration from defaults overlaid with `AI_GOVERNOR_*`
    /// environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u32>(&lookup, "AI_GOVERNOR_MIN_CONCURRENCY")? {
            config.admission.min_limit = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "AI_GOVERNOR_MAX_CONCURRENCY")? {
            config.admission.max_limit = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "AI_GOVERNOR_INITIAL_CONCURRENCY")? {
            config.admission.initial_limit = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "AI_GOVERNOR_BACKOFF_CAP_MS")? {
            config.admission.backoff_cap = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "AI_GOVERNOR_JOB_TTL_SECS")? {
            config.registry.idle_ttl = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = parse_var::<u8>(&lookup, "AI_GOVERNOR_MAX_LEVEL")? {
            config.resilience.max_level = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the components cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.admission.validate()?;
        self.resilience.validate()
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}
