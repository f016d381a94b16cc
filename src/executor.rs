//! Outbound call executor contract.
//!
//! The governor never performs network I/O. Callers plug in an executor that
//! sends the reshaped request and reports one outcome per call.

use std::time::Duration;

use async_trait::async_trait;

use crate::admission::AdmissionOutcome;
use crate::error::CallError;
use crate::resilience::{ErrorDescriptor, ErrorType, RequestOptions, ResilienceOutcome};

/// A request after degradation has been applied.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub request_id: String,
    pub job_id: String,
    pub stage: String,
    pub route_key: String,
    /// Degradation level the options were shaped for.
    pub level: u8,
    pub options: RequestOptions,
}

/// A successful remote response.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub payload: serde_json::Value,
    pub latency: Duration,
    pub estimated_tokens: Option<u64>,
    pub actual_tokens: Option<u64>,
}

/// Performs the remote call.
#[async_trait]
pub trait CallExecutor: Send + Sync {
    async fn execute(&self, request: CallRequest) -> Result<CallResponse, CallError>;
}

/// Map a call result to exactly one admission outcome.
///
/// Rate limiting takes precedence: an executor that sees both a 429 and a
/// transport failure must report `RateLimited`. Timeouts count as transient
/// for admission. Fatal and aborted calls free the slot without a signal.
pub fn admission_outcome(result: &Result<CallResponse, CallError>) -> AdmissionOutcome {
    match result {
        Ok(_) => AdmissionOutcome::Success,
        Err(CallError::RateLimited { .. }) => AdmissionOutcome::RateLimited,
        Err(CallError::Timeout(_) | CallError::Transient(_)) => AdmissionOutcome::TransientError,
        Err(CallError::Fatal(_) | CallError::Aborted(_)) => AdmissionOutcome::Abandoned,
    }
}

/// Map a call result to a resilience outcome. Aborted calls are not
/// attempts and yield `None`.
pub fn resilience_outcome(
    result: &Result<CallResponse, CallError>,
) -> Option<(ResilienceOutcome, Option<ErrorDescriptor>)> {
    let err = match result {
        Ok(_) => return Some((ResilienceOutcome::Success, None)),
        Err(CallError::Aborted(_)) => return None,
        Err(err) => err,
    };

    let outcome = match err {
        CallError::RateLimited { .. } => ResilienceOutcome::RateLimited,
        CallError::Timeout(_) => ResilienceOutcome::Timeout,
        _ => ResilienceOutcome::Error,
    };
    Some((outcome, Some(ErrorDescriptor::new(classify(err), err.to_string()))))
}

/// Error type of a failed call.
pub fn classify(err: &CallError) -> ErrorType {
    match err {
        CallError::RateLimited { .. } => ErrorType::RateLimited,
        CallError::Timeout(_) => ErrorType::Timeout,
        CallError::Transient(_) => ErrorType::Transient,
        CallError::Fatal(_) | CallError::Aborted(_) => ErrorType::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok() -> Result<CallResponse, CallError> {
        Ok(CallResponse {
            payload: serde_json::Value::Null,
            latency: Duration::from_millis(10),
            estimated_tokens: None,
            actual_tokens: None,
        })
    }

    #[test]
    fn maps_each_call_result() {
        let cases: Vec<(Result<CallResponse, CallError>, AdmissionOutcome, Option<ResilienceOutcome>)> = vec![
            (ok(), AdmissionOutcome::Success, Some(ResilienceOutcome::Success)),
            (
                Err(CallError::RateLimited { retry_after: None }),
                AdmissionOutcome::RateLimited,
                Some(ResilienceOutcome::RateLimited),
            ),
            (
                Err(CallError::Timeout(Duration::from_secs(30))),
                AdmissionOutcome::TransientError,
                Some(ResilienceOutcome::Timeout),
            ),
            (
                Err(CallError::Transient("502".into())),
                AdmissionOutcome::TransientError,
                Some(ResilienceOutcome::Error),
            ),
            (
                Err(CallError::Fatal("400".into())),
                AdmissionOutcome::Abandoned,
                Some(ResilienceOutcome::Error),
            ),
            (
                Err(CallError::Aborted("cancelled".into())),
                AdmissionOutcome::Abandoned,
                None,
            ),
        ];

        for (result, admission, resilience) in cases {
            assert_eq!(admission_outcome(&result), admission);
            assert_eq!(resilience_outcome(&result).map(|(o, _)| o), resilience);
        }
    }

    #[test]
    fn error_descriptor_carries_type() {
        let result = Err(CallError::Transient("connection reset".into()));
        let (_, descriptor) = resilience_outcome(&result).unwrap();
        let descriptor = descriptor.unwrap();
        assert_eq!(descriptor.error_type, ErrorType::Transient);
        assert!(descriptor.message.contains("connection reset"));
    }
}
