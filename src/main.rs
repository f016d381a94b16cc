use std::sync::Arc;
use std::time::Duration;

use ai_governor::error::CallError;
use ai_governor::events::EventPayload;
use ai_governor::executor::{CallExecutor, CallRequest, CallResponse};
use ai_governor::guardrails::GuardrailContext;
use ai_governor::resilience::{RequestOptions, escalation_key};
use ai_governor::{Error, Governor, GovernorConfig, WorkUnit};
use async_trait::async_trait;
use rand::Rng;
use tracing::{info, warn};

/// Pretend remote that rate-limits and fails at configurable rates.
struct SimulatedExecutor {
    rate_limit_chance: f64,
    transient_chance: f64,
    base_latency_ms: u64,
}

impl SimulatedExecutor {
    fn from_env() -> Self {
        let chance = |key: &str, default: f64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v.clamp(0.0, 1.0))
                .unwrap_or(default)
        };
        Self {
            rate_limit_chance: chance("AI_GOVERNOR_SIM_RATE_LIMIT", 0.15),
            transient_chance: chance("AI_GOVERNOR_SIM_TRANSIENT", 0.05),
            base_latency_ms: std::env::var("AI_GOVERNOR_SIM_LATENCY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(40),
        }
    }
}

#[async_trait]
impl CallExecutor for SimulatedExecutor {
    async fn execute(&self, request: CallRequest) -> Result<CallResponse, CallError> {
        let (roll, latency_ms) = {
            let mut rng = rand::thread_rng();
            let spread = self.base_latency_ms / 2;
            (
                rng.gen_range(0.0..1.0),
                self.base_latency_ms + rng.gen_range(0..=spread),
            )
        };
        let latency = Duration::from_millis(latency_ms);
        tokio::time::sleep(latency).await;

        if roll < self.rate_limit_chance {
            return Err(CallError::RateLimited { retry_after: None });
        }
        if roll < self.rate_limit_chance + self.transient_chance {
            return Err(CallError::Transient("simulated 503".to_string()));
        }

        let units = request.options.max_units_per_request.unwrap_or(8) as u64;
        Ok(CallResponse {
            payload: serde_json::json!({
                "model": request.options.model,
                "level": request.level,
                "units": units,
            }),
            latency,
            estimated_tokens: Some(units * 120),
            actual_tokens: Some(units * 110),
        })
    }
}

/// Run every unit of one job, retrying each a bounded number of times.
async fn run_job(
    governor: Governor,
    executor: Arc<SimulatedExecutor>,
    job_id: String,
    units: usize,
) -> (String, usize, usize) {
    let options = RequestOptions::new("gpt-x").with_fallback("gpt-x-mini");
    let mut done = 0;
    let mut failed = 0;

    for index in 0..units {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let unit = WorkUnit::new(&job_id, "translate", "translate", options.clone());
            match governor.run_unit(unit, executor.as_ref()).await {
                Ok(output) => {
                    let expected = output.options.max_units_per_request.unwrap_or(8);
                    let actual = output.payload["units"].as_u64().unwrap_or(0) as usize;
                    let ctx = GuardrailContext::new("translate")
                        .request(&output.request_id)
                        .block(format!("{job_id}#{index}"));
                    if let Err(violation) =
                        governor.guardrails().check_count_match(&ctx, expected, actual)
                    {
                        governor.report_violation(&job_id, "translate", &violation);
                    }
                    done += 1;
                    break;
                }
                Err(Error::Job(err)) => {
                    warn!(job_id = %job_id, error = %err, "Job stopped");
                    return (job_id, done, failed + (units - index));
                }
                Err(err) if attempts < 4 => {
                    info!(job_id = %job_id, unit = index, attempts, error = %err, "Retrying unit");
                }
                Err(err) => {
                    warn!(job_id = %job_id, unit = index, error = %err, "Giving up on unit");
                    failed += 1;
                    break;
                }
            }
        }
    }

    (job_id, done, failed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = GovernorConfig::from_env()?;
    let jobs: usize = std::env::var("AI_GOVERNOR_SIM_JOBS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    let units: usize = std::env::var("AI_GOVERNOR_SIM_UNITS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(12);

    eprintln!("AI Governor simulator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Concurrency: {} (min {}, max {})",
        config.admission.initial_limit, config.admission.min_limit, config.admission.max_limit
    );
    eprintln!("   Jobs: {jobs} x {units} units\n");

    let governor = Governor::new(config)?;
    let sweeper = governor.start_sweeper();
    let executor = Arc::new(SimulatedExecutor::from_env());

    if let Some(mut rx) = governor.subscribe() {
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match &event.payload {
                    EventPayload::LimitChanged { route, from, to, reason } => {
                        eprintln!("   [limit] {route}: {from} -> {to} ({reason})");
                    }
                    EventPayload::Escalation { key, from, to, reason, .. } => {
                        eprintln!("   [escalate] {key}: {from} -> {to} ({reason})");
                    }
                    _ => {}
                }
            }
        });
    }

    let tasks = (0..jobs).map(|n| {
        run_job(
            governor.clone(),
            Arc::clone(&executor),
            format!("job-{n}"),
            units,
        )
    });
    let results = futures::future::join_all(tasks).await;

    eprintln!("\nResults:");
    for (job_id, done, failed) in &results {
        let level = governor
            .resilience()
            .get_state(&escalation_key(job_id, "translate"))
            .map(|s| s.level)
            .unwrap_or(0);
        eprintln!("   {job_id}: {done} done, {failed} failed, level {level}");
        governor.finish_stage(job_id, "translate");
    }

    eprintln!("\nRoutes:");
    let mut routes = governor.admission().routes();
    routes.sort();
    for route in routes {
        let state = governor.admission().snapshot(&route);
        eprintln!(
            "   {route}: limit {} in-flight {} ema {:.1}ms",
            state.limit,
            state.in_flight,
            state.ema_latency_ms.unwrap_or(0.0)
        );
    }

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }
    Ok(())
}
