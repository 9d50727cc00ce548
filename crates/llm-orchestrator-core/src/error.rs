// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy shared by every executor in the workflow step-execution
//! core, plus the `StepResult` factories that stamp timing and status.

use std::time::Duration;

use crate::step::{StepResult, StepStatus};

/// Typed error kinds every executor must classify its failures into.
///
/// Only [`OrchestratorError::Cancelled`] may escape `Executor::execute` as an
/// `Err`; every other variant is expected to be folded into a `Failed` or
/// `Timeout` [`StepResult`] by the caller (see `spec.md` §4.4 and §7).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// No executor is registered under the requested step type.
    #[error("no executor registered for step type '{0}'")]
    NotFound(String),

    /// Step configuration is missing a required key or fails validation.
    #[error("invalid step configuration: {0}")]
    Config(String),

    /// A runtime failure occurred while performing the step's work.
    #[error("step execution failed: {0}")]
    Execution(String),

    /// The step's own deadline elapsed before it completed.
    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    /// An executor failed to initialize from its registry-supplied config.
    #[error("executor initialization failed: {0}")]
    Init(String),

    /// The workflow-level cancellation token fired. The only variant that
    /// is allowed to propagate out of `Executor::execute` as an error.
    #[error("execution cancelled")]
    Cancelled,
}

impl OrchestratorError {
    /// Wraps an arbitrary error as an [`OrchestratorError::Execution`].
    pub fn execution(err: impl std::fmt::Display) -> Self {
        Self::Execution(err.to_string())
    }

    /// Wraps an arbitrary error as an [`OrchestratorError::Config`].
    pub fn config(err: impl std::fmt::Display) -> Self {
        Self::Config(err.to_string())
    }

    /// `true` for the single variant allowed to abort a workflow outright.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// `true` when this error represents a step-local timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Terse, user-visible message (no error-code prefix).
    pub fn message(&self) -> String {
        match self {
            Self::NotFound(s) => format!("no executor registered for step type '{s}'"),
            Self::Config(s) => s.clone(),
            Self::Execution(s) => s.clone(),
            Self::Timeout(d) => format!("timed out after {d:?}"),
            Self::Init(s) => s.clone(),
            Self::Cancelled => "execution cancelled".to_string(),
        }
    }

    /// Code-qualified message suitable for logs.
    pub fn detailed(&self) -> String {
        let code = match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Config(_) => "CONFIG",
            Self::Execution(_) => "EXECUTION",
            Self::Timeout(_) => "TIMEOUT",
            Self::Init(_) => "INIT",
            Self::Cancelled => "CANCELLED",
        };
        format!("[{code}] {}", self.message())
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

fn now_ms() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// Builds a `success` [`StepResult`]. Never carries an `Error`.
pub fn create_success_result(
    step_id: impl Into<String>,
    start_time: chrono::DateTime<chrono::Utc>,
    output: serde_json::Value,
) -> StepResult {
    let end_time = now_ms();
    StepResult {
        step_id: step_id.into(),
        status: StepStatus::Success,
        start_time,
        end_time,
        duration: to_duration(start_time, end_time),
        output,
        error: None,
        metrics: Default::default(),
    }
}

/// Builds a `failed` [`StepResult`] carrying the typed cause.
pub fn create_failed_result(
    step_id: impl Into<String>,
    start_time: chrono::DateTime<chrono::Utc>,
    err: &OrchestratorError,
) -> StepResult {
    let end_time = now_ms();
    StepResult {
        step_id: step_id.into(),
        status: StepStatus::Failed,
        start_time,
        end_time,
        duration: to_duration(start_time, end_time),
        output: serde_json::Value::Null,
        error: Some(err.detailed()),
        metrics: Default::default(),
    }
}

/// Builds a `timeout` [`StepResult`].
pub fn create_timeout_result(
    step_id: impl Into<String>,
    start_time: chrono::DateTime<chrono::Utc>,
    timeout: Duration,
) -> StepResult {
    let end_time = now_ms();
    StepResult {
        step_id: step_id.into(),
        status: StepStatus::Timeout,
        start_time,
        end_time,
        duration: to_duration(start_time, end_time),
        output: serde_json::Value::Null,
        error: Some(OrchestratorError::Timeout(timeout).detailed()),
        metrics: Default::default(),
    }
}

/// Builds a `skipped` [`StepResult`]. Start and end time coincide.
pub fn create_skipped_result(step_id: impl Into<String>) -> StepResult {
    let now = now_ms();
    StepResult {
        step_id: step_id.into(),
        status: StepStatus::Skipped,
        start_time: now,
        end_time: now,
        duration: Duration::from_secs(0),
        output: serde_json::Value::Null,
        error: None,
        metrics: Default::default(),
    }
}

fn to_duration(
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> Duration {
    (end - start).to_std().unwrap_or(Duration::from_secs(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_result_never_carries_error() {
        let start = now_ms();
        let result = create_success_result("s1", start, serde_json::json!({"a": 1}));
        assert_eq!(result.status, StepStatus::Success);
        assert!(result.error.is_none());
        assert!(result.end_time >= result.start_time);
    }

    #[test]
    fn failed_result_carries_detailed_message() {
        let start = now_ms();
        let err = OrchestratorError::Config("missing url".to_string());
        let result = create_failed_result("s2", start, &err);
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("[CONFIG] missing url"));
    }

    #[test]
    fn detailed_includes_code_prefix_message_does_not() {
        let err = OrchestratorError::NotFound("foo".to_string());
        assert!(!err.message().starts_with('['));
        assert!(err.detailed().starts_with("[NOT_FOUND]"));
    }
}
