// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry executor: re-runs a single wrapped child step under a backoff
//! policy until it succeeds or the attempt budget is exhausted.
//! `spec.md` §4.11.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{create_failed_result, create_success_result, OrchestratorError, Result};
use crate::registry::{Executor, ExecutorRegistry};
use crate::step::{Step, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_strategy")]
    strategy: BackoffStrategy,
    #[serde(default = "default_initial_delay_ms")]
    initial_delay_ms: u64,
    #[serde(default)]
    max_delay_ms: Option<u64>,
    /// Supplementary feature: randomizes each computed delay within
    /// ±`jitter_ratio` of its value. Off by default (`0.0`).
    #[serde(default)]
    jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_strategy() -> BackoffStrategy {
    BackoffStrategy::Fixed
}

fn default_initial_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOutput {
    pub attempts: u32,
    pub succeeded: bool,
    pub last_error: Option<String>,
}

pub struct RetryExecutor {
    registry: Arc<ExecutorRegistry>,
}

impl RetryExecutor {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self { registry }
    }
}

fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = match config.strategy {
        BackoffStrategy::Fixed => config.initial_delay_ms,
        BackoffStrategy::Linear => config.initial_delay_ms.saturating_mul(attempt as u64),
        BackoffStrategy::Exponential => {
            config.initial_delay_ms.saturating_mul(1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX))
        }
    };
    let capped_ms = match config.max_delay_ms {
        Some(max) if max > 0 => base_ms.min(max),
        _ => base_ms,
    };
    if config.jitter_ratio <= 0.0 {
        return Duration::from_millis(capped_ms);
    }
    let jitter_ratio = config.jitter_ratio.clamp(0.0, 1.0);
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-jitter_ratio..=jitter_ratio);
    let jittered = (capped_ms as f64 * factor).max(0.0) as u64;
    Duration::from_millis(jittered)
}

#[async_trait]
impl Executor for RetryExecutor {
    fn step_type(&self) -> &str {
        "retry"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
        let start = chrono::Utc::now();

        let config: RetryConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid retry config: {e}")),
                ))
            }
        };

        let Some(child) = step.children.first() else {
            return Ok(create_failed_result(
                step.id.clone(),
                start,
                &OrchestratorError::Config("retry step requires exactly one child step".to_string()),
            ));
        };

        let Some(executor) = self.registry.get(&child.step_type) else {
            return Ok(create_failed_result(
                step.id.clone(),
                start,
                &OrchestratorError::NotFound(child.step_type.clone()),
            ));
        };

        let max_attempts = config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let result = executor.execute(child, ctx).await?;

            if result.is_success() {
                ctx.set_result(child.id.clone(), result.clone());
                let output = RetryOutput {
                    attempts: attempt,
                    succeeded: true,
                    last_error: None,
                };
                return Ok(create_success_result(
                    step.id.clone(),
                    start,
                    serde_json::json!({
                        "retry": output,
                        "result": result.output,
                    }),
                )
                .with_metric("retry_attempts", attempt as f64));
            }

            last_error = result.error.clone();
            ctx.set_result(child.id.clone(), result);

            if attempt < max_attempts {
                let delay = compute_delay(&config, attempt);
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let output = RetryOutput {
            attempts: max_attempts,
            succeeded: false,
            last_error: last_error.clone(),
        };
        let mut result = create_failed_result(
            step.id.clone(),
            start,
            &OrchestratorError::Execution(format!(
                "retry exhausted after {max_attempts} attempts: {}",
                last_error.unwrap_or_default()
            )),
        )
        .with_metric("retry_attempts", max_attempts as f64);
        result.output = serde_json::to_value(&output).unwrap();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyExecutor {
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl Executor for FlakyExecutor {
        fn step_type(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, step: &Step, _ctx: &ExecutionContext) -> Result<StepResult> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Ok(create_failed_result(
                    step.id.clone(),
                    chrono::Utc::now(),
                    &OrchestratorError::Execution("not yet".to_string()),
                ));
            }
            Ok(create_success_result(step.id.clone(), chrono::Utc::now(), serde_json::json!({"ok": true})))
        }
    }

    struct AlwaysFailExecutor;

    #[async_trait]
    impl Executor for AlwaysFailExecutor {
        fn step_type(&self) -> &str {
            "always_fail"
        }

        async fn execute(&self, step: &Step, _ctx: &ExecutionContext) -> Result<StepResult> {
            Ok(create_failed_result(
                step.id.clone(),
                chrono::Utc::now(),
                &OrchestratorError::Execution("nope".to_string()),
            ))
        }
    }

    fn registry_with(executor: Arc<dyn Executor>) -> Arc<ExecutorRegistry> {
        let r = ExecutorRegistry::new();
        r.register(executor).unwrap();
        Arc::new(r)
    }

    #[tokio::test]
    async fn succeeds_after_two_failures() {
        let inner = Arc::new(FlakyExecutor { fail_times: AtomicU32::new(2) });
        let registry = registry_with(inner);
        registry.register(Arc::new(RetryExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let step = Step::new("r1", "retry")
            .with_config(serde_json::json!({"max_attempts": 5, "strategy": "fixed", "initial_delay_ms": 1}))
            .with_children(vec![Step::new("child", "flaky")]);

        let exec = registry.get("retry").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.metrics["retry_attempts"], 3.0);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_fails() {
        let registry = registry_with(Arc::new(AlwaysFailExecutor));
        registry.register(Arc::new(RetryExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let step = Step::new("r1", "retry")
            .with_config(serde_json::json!({"max_attempts": 3, "initial_delay_ms": 1}))
            .with_children(vec![Step::new("child", "always_fail")]);

        let exec = registry.get("retry").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert!(!result.is_success());
        assert_eq!(result.metrics["retry_attempts"], 3.0);
    }

    #[test]
    fn exponential_backoff_doubles_each_attempt() {
        let config = RetryConfig {
            max_attempts: 5,
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: None,
            jitter_ratio: 0.0,
        };
        assert_eq!(compute_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(compute_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(compute_delay(&config, 3), Duration::from_millis(400));
    }

    #[test]
    fn max_delay_caps_growth() {
        let config = RetryConfig {
            max_attempts: 5,
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: Some(250),
            jitter_ratio: 0.0,
        };
        assert_eq!(compute_delay(&config, 3), Duration::from_millis(250));
    }

    /// Scenario S5: a cap of `0` means uncapped, not a 0ms ceiling.
    #[test]
    fn zero_max_delay_means_uncapped() {
        let config = RetryConfig {
            max_attempts: 5,
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: Some(0),
            jitter_ratio: 0.0,
        };
        assert_eq!(compute_delay(&config, 4), Duration::from_millis(800));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let config = RetryConfig {
            max_attempts: 5,
            strategy: BackoffStrategy::Linear,
            initial_delay_ms: 100,
            max_delay_ms: None,
            jitter_ratio: 0.0,
        };
        assert_eq!(compute_delay(&config, 3), Duration::from_millis(300));
    }
}
