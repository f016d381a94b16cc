//! Governor facade: owns one of each component and drives a unit of work
//! through them.
//!
//! Components stay independent: each serializes its own key space, and the
//! governor only passes values between them.

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::admission::{AdmissionController, RequestStats, route_key};
use crate::config::GovernorConfig;
use crate::error::{CallError, ConfigError, Error, InvariantViolation, JobError};
use crate::events::{EventSink, GovernorEvent};
use crate::executor::{
    CallExecutor, CallRequest, admission_outcome, classify, resilience_outcome,
};
use crate::guardrails::Guardrails;
use crate::jobs::{JobMeta, JobRegistry, SweepTask, spawn_sweep_task};
use crate::resilience::{
    ErrorDescriptor, ProofreadMode, RequestOptions, ResilienceMachine, ResilienceOutcome,
    escalation_key,
};

/// One unit of work to dispatch.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub job_id: String,
    pub meta: JobMeta,
    /// Processing stage; part of the escalation key.
    pub stage: String,
    /// Operation type; part of the route key.
    pub operation: String,
    pub options: RequestOptions,
}

impl WorkUnit {
    pub fn new(
        job_id: impl Into<String>,
        stage: impl Into<String>,
        operation: impl Into<String>,
        options: RequestOptions,
    ) -> Self {
        let stage = stage.into();
        Self {
            job_id: job_id.into(),
            meta: JobMeta::with_stage(stage.clone()),
            stage,
            operation: operation.into(),
            options,
        }
    }

    pub fn escalation_key(&self) -> String {
        escalation_key(&self.job_id, &self.stage)
    }
}

/// Result of a successfully dispatched unit.
#[derive(Debug, Clone)]
pub struct UnitOutput {
    pub request_id: String,
    pub route_key: String,
    pub level: u8,
    pub options: RequestOptions,
    pub payload: serde_json::Value,
}

/// Facade over the job registry, admission controller, resilience machine
/// and guardrails.
#[derive(Debug, Clone)]
pub struct Governor {
    config: GovernorConfig,
    jobs: JobRegistry,
    admission: AdmissionController,
    resilience: ResilienceMachine,
    guardrails: Guardrails,
    events: EventSink,
}

impl Governor {
    /// Build a governor with an enabled event sink.
    pub fn new(config: GovernorConfig) -> Result<Self, ConfigError> {
        Self::with_events(config, EventSink::new())
    }

    pub fn with_events(config: GovernorConfig, events: EventSink) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            jobs: JobRegistry::new(),
            admission: AdmissionController::new(config.admission.clone(), events.clone())?,
            resilience: ResilienceMachine::new(config.resilience.clone(), events.clone()),
            guardrails: Guardrails::new(config.guardrails.clone(), events.clone()),
            events,
            config,
        })
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn resilience(&self) -> &ResilienceMachine {
        &self.resilience
    }

    pub fn guardrails(&self) -> &Guardrails {
        &self.guardrails
    }

    /// Subscribe to structured events.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<GovernorEvent>> {
        self.events.subscribe()
    }

    /// Start the idle-job sweep, unless the TTL is disabled.
    pub fn start_sweeper(&self) -> Option<SweepTask> {
        let ttl = self.config.registry.idle_ttl?;
        let interval = self.config.registry.effective_sweep_interval()?;
        Some(spawn_sweep_task(self.jobs.clone(), interval, ttl))
    }

    /// Cancel a job. Returns `false` if the job is unknown.
    pub fn cancel(&self, job_id: &str, reason: &str) -> bool {
        self.jobs.cancel(job_id, reason)
    }

    /// Discard escalation state of a finished job stage.
    pub fn finish_stage(&self, job_id: &str, stage: &str) -> bool {
        self.resilience.forget(&escalation_key(job_id, stage))
    }

    fn cancelled_error(&self, job_id: &str) -> Error {
        let reason = self
            .jobs
            .get(job_id)
            .and_then(|entry| entry.cancel_reason)
            .unwrap_or_else(|| "cancelled".to_string());
        Error::Job(JobError::Cancelled {
            id: job_id.to_string(),
            reason,
        })
    }

    /// Dispatch one unit of work through `executor`.
    ///
    /// Holds a job reference for the duration, waits for an admission slot,
    /// shapes the request for the current degradation level, reports the
    /// outcome to admission and resilience, and escalates when advised.
    /// Cancellation of the job aborts the wait or the call and is reported
    /// as an abandoned slot, never as a remote failure.
    pub async fn run_unit(
        &self,
        unit: WorkUnit,
        executor: &dyn CallExecutor,
    ) -> Result<UnitOutput, Error> {
        let (handle, _lease) = self.jobs.acquire(&unit.job_id, unit.meta.clone())?;
        let job_id = handle.job_id().to_string();
        if handle.is_cancelled() {
            return Err(self.cancelled_error(&job_id));
        }

        let key = escalation_key(&job_id, &unit.stage);
        let level = self.resilience.level(&key);
        let mut options = self.resilience.apply_level_to_options(level, &unit.options);
        if options.proofread_mode != ProofreadMode::Off && !self.resilience.proofread_allowed(&key)
        {
            options.proofread_mode = ProofreadMode::Off;
        }

        let route = route_key(&unit.operation, &options.model);
        let Some(slot) = self
            .admission
            .acquire_cancellable(&route, handle.token())
            .await
        else {
            return Err(self.cancelled_error(&job_id));
        };

        let request = CallRequest {
            request_id: Uuid::new_v4().to_string(),
            job_id: job_id.clone(),
            stage: unit.stage.clone(),
            route_key: route.clone(),
            level,
            options: options.clone(),
        };
        let request_id = request.request_id.clone();

        debug!(
            job_id = %job_id,
            route = %route,
            level,
            request_id = %request_id,
            "Dispatching unit"
        );

        let result = tokio::select! {
            _ = handle.cancelled() => Err(CallError::Aborted("job cancelled".to_string())),
            result = executor.execute(request) => result,
        };

        if let Ok(response) = &result {
            self.admission.note_request_stats(
                &route,
                RequestStats {
                    estimated_tokens: response.estimated_tokens,
                    actual_tokens: response.actual_tokens,
                    latency: Some(response.latency),
                },
            );
        }

        match &result {
            Err(CallError::RateLimited { retry_after }) => {
                slot.release_rate_limited(*retry_after)
            }
            _ => slot.release(admission_outcome(&result)),
        }
        if let Some((outcome, error)) = resilience_outcome(&result) {
            self.resilience.record_outcome(&key, outcome, error);
        }

        match result {
            Ok(response) => Ok(UnitOutput {
                request_id,
                route_key: route,
                level,
                options,
                payload: response.payload,
            }),
            Err(CallError::Aborted(_)) => Err(self.cancelled_error(&job_id)),
            Err(err) => {
                let error_type = classify(&err);
                if self.resilience.should_escalate(&key, Some(error_type)) {
                    self.resilience.escalate(&key, error_type.as_str());
                }
                Err(Error::Call(err))
            }
        }
    }

    /// Feed a guardrail violation for a job stage into escalation.
    /// Returns the level after any escalation.
    pub fn report_violation(&self, job_id: &str, stage: &str, violation: &InvariantViolation) -> u8 {
        let key = escalation_key(job_id, stage);
        let descriptor = ErrorDescriptor::from(violation);
        let error_type = descriptor.error_type;

        self.resilience
            .record_outcome(&key, ResilienceOutcome::Error, Some(descriptor));
        if self.resilience.should_escalate(&key, Some(error_type)) {
            self.resilience.escalate(&key, error_type.as_str())
        } else {
            self.resilience.level(&key)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::error::GuardrailKind;
    use crate::executor::CallResponse;
    use crate::resilience::ErrorType;

    fn response(latency_ms: u64) -> CallResponse {
        CallResponse {
            payload: json!({ "ok": true }),
            latency: Duration::from_millis(latency_ms),
            estimated_tokens: Some(100),
            actual_tokens: Some(90),
        }
    }

    /// Returns queued results in order, then successes.
    #[derive(Default)]
    struct Scripted {
        results: Mutex<VecDeque<Result<CallResponse, CallError>>>,
        seen: Mutex<Vec<CallRequest>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<CallResponse, CallError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<CallRequest> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl CallExecutor for Scripted {
        async fn execute(&self, request: CallRequest) -> Result<CallResponse, CallError> {
            self.seen.lock().push(request);
            let next = self.results.lock().pop_front();
            next.unwrap_or_else(|| Ok(response(10)))
        }
    }

    struct Hanging;

    #[async_trait]
    impl CallExecutor for Hanging {
        async fn execute(&self, _request: CallRequest) -> Result<CallResponse, CallError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(response(10))
        }
    }

    fn governor() -> Governor {
        Governor::new(GovernorConfig::default()).unwrap()
    }

    fn unit(job_id: &str) -> WorkUnit {
        WorkUnit::new(
            job_id,
            "translate",
            "translate",
            RequestOptions::new("gpt-x").with_fallback("gpt-x-mini"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn success_flows_through_every_component() {
        let governor = governor();
        let executor = Scripted::new(vec![Ok(response(100))]);

        let output = governor.run_unit(unit("job-1"), &executor).await.unwrap();
        assert_eq!(output.level, 0);
        assert_eq!(output.route_key, "translate::gpt-x");
        assert_eq!(output.payload["ok"], true);

        let route = governor.admission().snapshot("translate::gpt-x");
        assert_eq!(route.in_flight, 0);
        assert_eq!(route.ema_latency_ms, Some(100.0));
        assert_eq!(route.last_actual_tokens, Some(90));

        let state = governor
            .resilience()
            .get_state("job-1::translate")
            .unwrap();
        assert_eq!(state.attempts, 1);
        assert_eq!(state.level, 0);

        assert_eq!(governor.jobs().get("job-1").unwrap().ref_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_step_up_the_ladder() {
        let governor = governor();
        let limited = || Err(CallError::RateLimited { retry_after: None });
        let executor = Scripted::new(vec![limited(), limited(), limited()]);

        for _ in 0..3 {
            let err = governor.run_unit(unit("job-1"), &executor).await.unwrap_err();
            assert!(matches!(err, Error::Call(CallError::RateLimited { .. })));
        }

        let requests = executor.requests();
        let levels: Vec<u8> = requests.iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![0, 1, 2]);
        assert!(!requests[0].options.force_split);
        assert!(requests[1].options.force_split);
        assert_eq!(requests[1].route_key, "translate::gpt-x");
        assert_eq!(requests[2].route_key, "translate::gpt-x-mini");

        assert_eq!(governor.resilience().level("job-1::translate"), 3);
        assert_eq!(governor.admission().snapshot("translate::gpt-x").limit, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_escalate_after_two_attempts() {
        let governor = governor();
        let failing = || Err(CallError::Transient("502".into()));
        let executor = Scripted::new(vec![failing(), failing()]);

        let _ = governor.run_unit(unit("job-1"), &executor).await;
        assert_eq!(governor.resilience().level("job-1::translate"), 0);

        let _ = governor.run_unit(unit("job-1"), &executor).await;
        assert_eq!(governor.resilience().level("job-1::translate"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_call() {
        let governor = governor();
        let task = {
            let governor = governor.clone();
            tokio::spawn(async move { governor.run_unit(unit("job-1"), &Hanging).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(governor.admission().snapshot("translate::gpt-x").in_flight, 1);
        assert!(governor.cancel("job-1", "user closed tab"));

        let err = task.await.unwrap().unwrap_err();
        match err {
            Error::Job(JobError::Cancelled { id, reason }) => {
                assert_eq!(id, "job-1");
                assert_eq!(reason, "user closed tab");
            }
            other => panic!("unexpected error: {other}"),
        }

        let route = governor.admission().snapshot("translate::gpt-x");
        assert_eq!(route.in_flight, 0);
        assert_eq!(route.limit, 6);
        assert!(route.backoff_until.is_none());
        assert!(governor.resilience().get_state("job-1::translate").is_none());
    }

    #[tokio::test]
    async fn cancelled_job_is_not_dispatched() {
        let governor = governor();
        let (_handle, _lease) = governor
            .jobs()
            .acquire("job-1", JobMeta::default())
            .unwrap();
        governor.cancel("job-1", "stop");

        let executor = Scripted::default();
        let err = governor.run_unit(unit("job-1"), &executor).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Cancelled { .. })));
        assert!(executor.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn padded_job_id_is_one_job() {
        let governor = governor();
        let executor = Scripted::new(vec![Err(CallError::Timeout(Duration::from_secs(30)))]);

        let _ = governor.run_unit(unit(" job-1 "), &executor).await;
        assert_eq!(executor.requests()[0].job_id, "job-1");
        assert!(governor.resilience().get_state("job-1::translate").is_some());

        assert!(governor.cancel(" job-1 ", "user"));
        assert!(governor.jobs().get("job-1").unwrap().is_cancelled());
        assert!(governor.finish_stage(" job-1 ", "translate"));
        assert!(governor.resilience().get_state("job-1::translate").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_reaches_admission() {
        let governor = governor();
        let executor = Scripted::new(vec![Err(CallError::RateLimited {
            retry_after: Some(Duration::from_secs(45)),
        })]);

        let before = tokio::time::Instant::now();
        let _ = governor.run_unit(unit("job-1"), &executor).await;

        let until = governor
            .admission()
            .snapshot("translate::gpt-x")
            .backoff_until
            .unwrap();
        assert!(until >= before + Duration::from_secs(45));
    }

    #[tokio::test]
    async fn empty_job_id_is_rejected() {
        let governor = governor();
        let executor = Scripted::default();
        let err = governor.run_unit(unit("  "), &executor).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidJobId)));
        assert!(governor.jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_proofreading_is_forced_off() {
        let governor = governor();
        governor.resilience().record_outcome(
            "job-1::translate",
            ResilienceOutcome::DisableProofread,
            None,
        );

        let executor = Scripted::default();
        let output = governor.run_unit(unit("job-1"), &executor).await.unwrap();
        assert_eq!(output.options.proofread_mode, ProofreadMode::Off);

        tokio::time::advance(Duration::from_secs(16 * 60)).await;
        let output = governor.run_unit(unit("job-1"), &executor).await.unwrap();
        assert_ne!(output.options.proofread_mode, ProofreadMode::Off);
    }

    #[test]
    fn violation_report_escalates() {
        let governor = governor();
        let violation = crate::guardrails::check_count_match("translate", 3, 2).unwrap_err();
        assert_eq!(violation.kind, GuardrailKind::CountMismatch);

        assert_eq!(governor.report_violation("job-1", "translate", &violation), 1);
        let state = governor
            .resilience()
            .get_state("job-1::translate")
            .unwrap();
        assert_eq!(
            state.last_error.map(|e| e.error_type),
            Some(ErrorType::CountMismatch)
        );

        assert!(governor.finish_stage("job-1", "translate"));
        assert_eq!(governor.resilience().level("job-1::translate"), 0);
    }
}
