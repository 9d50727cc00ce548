// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared machinery for executors that run child steps: `condition`,
//! `loop`, and `parallel`. `spec.md` §4.6.

use crate::context::ExecutionContext;
use crate::error::{create_skipped_result, OrchestratorError, Result};
use crate::registry::ExecutorRegistry;
use crate::step::{OnError, Step, StepResult, StepStatus};

/// Cancellation signal consulted at each iteration boundary. A trivial
/// `AtomicBool`-backed token is provided via [`CancellationToken`]; callers
/// embedding their own cancellation (e.g. a `tokio_util::sync::CancellationToken`)
/// can implement this trait directly.
pub trait Cancellation: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// A no-op token for call sites that never cancel (most unit tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancelled;

impl Cancellation for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Runs `steps` in declaration order against `execCtx`, honoring each
/// step's `on_error` policy. `spec.md` §4.6.
///
/// Returns the per-step results gathered so far, plus an error only when
/// the scope was aborted (cancellation, a not-found executor, or an
/// `on_error = abort` child failure).
pub async fn execute_nested_steps(
    registry: &ExecutorRegistry,
    steps: &[Step],
    exec_ctx: &ExecutionContext,
    parent_id: &str,
    iteration: Option<u64>,
    cancellation: &dyn Cancellation,
) -> (Vec<StepResult>, Option<OrchestratorError>) {
    let mut results = Vec::with_capacity(steps.len());

    for step in steps {
        if cancellation.is_cancelled() {
            return (results, Some(OrchestratorError::Cancelled));
        }

        if step.disabled {
            if let Some(cb) = &exec_ctx.callback {
                cb.on_step_skipped(step, "disabled", Some(parent_id), iteration)
                    .await;
            }
            results.push(create_skipped_result(step.id.clone()));
            continue;
        }

        if let Some(cb) = &exec_ctx.callback {
            cb.on_step_start(step, Some(parent_id), iteration).await;
        }

        let Some(executor) = registry.get(&step.step_type) else {
            let err = OrchestratorError::NotFound(step.step_type.clone());
            if let Some(cb) = &exec_ctx.callback {
                cb.on_step_failed(step, &err, std::time::Duration::from_secs(0), Some(parent_id), iteration)
                    .await;
            }
            return (results, Some(err));
        };

        let start = std::time::Instant::now();
        let exec_result = executor.execute(step, exec_ctx).await;

        let result = match exec_result {
            Ok(result) => result,
            Err(err) => {
                // Only cancellation may escape `execute` as an Err.
                if let Some(cb) = &exec_ctx.callback {
                    cb.on_step_failed(step, &err, start.elapsed(), Some(parent_id), iteration)
                        .await;
                }
                return (results, Some(err));
            }
        };

        exec_ctx.set_result(step.id.clone(), result.clone());

        if let Some(cb) = &exec_ctx.callback {
            match result.status {
                StepStatus::Success => {
                    cb.on_step_complete(step, &result, Some(parent_id), iteration).await
                }
                _ => {
                    let err = OrchestratorError::Execution(
                        result.error.clone().unwrap_or_default(),
                    );
                    cb.on_step_failed(step, &err, result.duration, Some(parent_id), iteration)
                        .await;
                }
            }
        }

        let is_failure = matches!(result.status, StepStatus::Failed | StepStatus::Timeout);
        results.push(result.clone());

        if is_failure {
            match step.on_error {
                OnError::Abort => {
                    let err = OrchestratorError::Execution(
                        result.error.clone().unwrap_or_else(|| "step failed".to_string()),
                    );
                    return (results, Some(err));
                }
                OnError::Continue => continue,
                OnError::Skip => return (results, None),
            }
        }
    }

    (results, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::create_failed_result;
    use crate::registry::Executor;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct AlwaysFail;

    #[async_trait]
    impl Executor for AlwaysFail {
        fn step_type(&self) -> &str {
            "always_fail"
        }

        async fn execute(&self, step: &Step, _ctx: &ExecutionContext) -> Result<StepResult> {
            Ok(create_failed_result(
                step.id.clone(),
                chrono::Utc::now(),
                &OrchestratorError::Execution("boom".to_string()),
            ))
        }
    }

    struct AlwaysSucceed;

    #[async_trait]
    impl Executor for AlwaysSucceed {
        fn step_type(&self) -> &str {
            "always_succeed"
        }

        async fn execute(&self, step: &Step, _ctx: &ExecutionContext) -> Result<StepResult> {
            Ok(crate::error::create_success_result(
                step.id.clone(),
                chrono::Utc::now(),
                serde_json::json!({}),
            ))
        }
    }

    fn registry() -> ExecutorRegistry {
        let r = ExecutorRegistry::new();
        r.register(Arc::new(AlwaysFail)).unwrap();
        r.register(Arc::new(AlwaysSucceed)).unwrap();
        r
    }

    #[tokio::test]
    async fn abort_stops_on_first_failure() {
        let steps = vec![
            Step::new("a", "always_succeed"),
            Step::new("b", "always_fail"),
            Step::new("c", "always_succeed"),
        ];
        let ctx = ExecutionContext::new("wf", "exec");
        let (results, err) =
            execute_nested_steps(&registry(), &steps, &ctx, "root", None, &NeverCancelled).await;
        assert_eq!(results.len(), 2);
        assert!(err.is_some());
    }

    #[tokio::test]
    async fn continue_runs_every_sibling() {
        let steps = vec![
            Step::new("a", "always_fail").with_on_error(OnError::Continue),
            Step::new("b", "always_succeed"),
        ];
        let ctx = ExecutionContext::new("wf", "exec");
        let (results, err) =
            execute_nested_steps(&registry(), &steps, &ctx, "root", None, &NeverCancelled).await;
        assert_eq!(results.len(), 2);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn skip_stops_silently() {
        let steps = vec![
            Step::new("a", "always_fail").with_on_error(OnError::Skip),
            Step::new("b", "always_succeed"),
        ];
        let ctx = ExecutionContext::new("wf", "exec");
        let (results, err) =
            execute_nested_steps(&registry(), &steps, &ctx, "root", None, &NeverCancelled).await;
        assert_eq!(results.len(), 1);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn disabled_step_is_skipped_not_executed() {
        let steps = vec![Step::new("a", "always_fail").with_disabled(true)];
        let ctx = ExecutionContext::new("wf", "exec");
        let (results, err) =
            execute_nested_steps(&registry(), &steps, &ctx, "root", None, &NeverCancelled).await;
        assert_eq!(results[0].status, StepStatus::Skipped);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn unknown_step_type_aborts_with_not_found() {
        let steps = vec![Step::new("a", "nonexistent")];
        let ctx = ExecutionContext::new("wf", "exec");
        let (_, err) =
            execute_nested_steps(&registry(), &steps, &ctx, "root", None, &NeverCancelled).await;
        assert!(matches!(err, Some(OrchestratorError::NotFound(_))));
    }
}
