// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parallel executor: bounded fan-out over sibling steps with fail-fast
//! and ordered result collection. `spec.md` §4.10.
//!
//! Each branch runs against its own [`ExecutionContext::clone_scope`] so
//! concurrent writers never race on the same variable map; only
//! env-scoped writes are merged back into the parent, in branch order,
//! after every branch has finished (`ExecutionContext::absorb_env_writes_from`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{create_failed_result, create_success_result, OrchestratorError, Result};
use crate::registry::{Executor, ExecutorRegistry};
use crate::step::{Step, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatedBy {
    Completed,
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelOutput {
    pub total_branches: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub terminated_by: TerminatedBy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ParallelConfig {
    #[serde(default)]
    max_concurrency: Option<usize>,
    #[serde(default = "default_fail_fast")]
    fail_fast: bool,
}

fn default_fail_fast() -> bool {
    true
}

pub struct ParallelExecutor {
    registry: Arc<ExecutorRegistry>,
}

impl ParallelExecutor {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Executor for ParallelExecutor {
    fn step_type(&self) -> &str {
        "parallel"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
        let start = chrono::Utc::now();

        let config: ParallelConfig = if step.config.is_null() || step.config == serde_json::json!({}) {
            ParallelConfig {
                max_concurrency: None,
                fail_fast: true,
            }
        } else {
            match serde_json::from_value(step.config.clone()) {
                Ok(c) => c,
                Err(e) => {
                    return Ok(create_failed_result(
                        step.id.clone(),
                        start,
                        &OrchestratorError::Config(format!("invalid parallel config: {e}")),
                    ))
                }
            }
        };

        if step.children.is_empty() {
            let output = ParallelOutput {
                total_branches: 0,
                succeeded: 0,
                failed: 0,
                terminated_by: TerminatedBy::Completed,
            };
            return Ok(create_success_result(
                step.id.clone(),
                start,
                serde_json::to_value(&output).unwrap(),
            ));
        }

        let wall_start = Instant::now();
        let limit = config.max_concurrency.unwrap_or(step.children.len()).max(1);
        let cancel_rest = Arc::new(AtomicBool::new(false));

        let mut in_flight = FuturesUnordered::new();
        let remaining: Vec<&Step> = step.children.iter().collect();
        let mut ordered_results: Vec<Option<StepResult>> = vec![None; step.children.len()];
        let mut branch_contexts: Vec<Option<ExecutionContext>> = Vec::with_capacity(step.children.len());
        for _ in 0..step.children.len() {
            branch_contexts.push(None);
        }

        let mut next_index = 0usize;
        let spawn = |index: usize, branch_step: &Step, ctx: &ExecutionContext, cancel_rest: Arc<AtomicBool>| {
            let branch_ctx = ctx.clone_scope();
            let registry = self.registry.clone();
            let branch_step = branch_step.clone();
            async move {
                if cancel_rest.load(Ordering::SeqCst) {
                    return (index, None, branch_ctx);
                }
                let result = match registry.get(&branch_step.step_type) {
                    Some(executor) => executor.execute(&branch_step, &branch_ctx).await,
                    None => Err(OrchestratorError::NotFound(branch_step.step_type.clone())),
                };
                let result = match result {
                    Ok(result) => result,
                    Err(err) => create_failed_result(branch_step.id.clone(), chrono::Utc::now(), &err),
                };
                (index, Some(result), branch_ctx)
            }
        };

        while next_index < limit.min(step.children.len()) {
            let branch_step = remaining[next_index];
            in_flight.push(spawn(next_index, branch_step, ctx, cancel_rest.clone()));
            next_index += 1;
        }

        let mut dispatched = next_index;
        let mut failed_count = 0usize;
        let mut succeeded_count = 0usize;
        let mut fail_fast_triggered = false;

        while let Some((index, result, branch_ctx)) = in_flight.next().await {
            branch_contexts[index] = Some(branch_ctx);
            if let Some(result) = result {
                if result.is_success() {
                    succeeded_count += 1;
                } else {
                    failed_count += 1;
                    if config.fail_fast {
                        cancel_rest.store(true, Ordering::SeqCst);
                        fail_fast_triggered = true;
                    }
                }
                ordered_results[index] = Some(result);
            }

            if dispatched < step.children.len() && !cancel_rest.load(Ordering::SeqCst) {
                let branch_step = remaining[dispatched];
                in_flight.push(spawn(dispatched, branch_step, ctx, cancel_rest.clone()));
                dispatched += 1;
            }
        }

        for branch_ctx in branch_contexts.into_iter().flatten() {
            ctx.absorb_env_writes_from(&branch_ctx);
        }

        let mut parallel_results = serde_json::Map::new();
        for (branch_step, result) in step.children.iter().zip(ordered_results.into_iter()) {
            if let Some(result) = result {
                ctx.set_result(branch_step.id.clone(), result.clone());
                parallel_results.insert(branch_step.id.clone(), serde_json::to_value(&result).unwrap());
            }
        }
        ctx.set_variable("parallel_results", serde_json::Value::Object(parallel_results));

        let terminated_by = if fail_fast_triggered {
            TerminatedBy::FailFast
        } else {
            TerminatedBy::Completed
        };

        if fail_fast_triggered {
            let err = OrchestratorError::Execution(format!(
                "{failed_count} of {} parallel branches failed (fail_fast)",
                step.children.len()
            ));
            return Ok(create_failed_result(step.id.clone(), start, &err));
        }

        let output = ParallelOutput {
            total_branches: step.children.len(),
            succeeded: succeeded_count,
            failed: failed_count,
            terminated_by,
        };

        Ok(
            create_success_result(step.id.clone(), start, serde_json::to_value(&output).unwrap())
                .with_metric("parallel_branches_total", step.children.len() as f64)
                .with_metric("parallel_duration_ms", wall_start.elapsed().as_millis() as f64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VarScope;
    use std::sync::Arc;

    struct SucceedExecutor;

    #[async_trait]
    impl Executor for SucceedExecutor {
        fn step_type(&self) -> &str {
            "succeed"
        }

        async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
            ctx.set_variable_with_tracking(
                format!("seen_{}", step.id),
                serde_json::json!(true),
                VarScope::Env,
                step.id.clone(),
            );
            Ok(create_success_result(step.id.clone(), chrono::Utc::now(), serde_json::json!({"ok": true})))
        }
    }

    struct FailExecutor;

    #[async_trait]
    impl Executor for FailExecutor {
        fn step_type(&self) -> &str {
            "fail"
        }

        async fn execute(&self, step: &Step, _ctx: &ExecutionContext) -> Result<StepResult> {
            Ok(create_failed_result(
                step.id.clone(),
                chrono::Utc::now(),
                &OrchestratorError::Execution("boom".to_string()),
            ))
        }
    }

    fn registry() -> Arc<ExecutorRegistry> {
        let r = ExecutorRegistry::new();
        r.register(Arc::new(SucceedExecutor)).unwrap();
        r.register(Arc::new(FailExecutor)).unwrap();
        Arc::new(r)
    }

    #[tokio::test]
    async fn all_branches_succeed_populates_parallel_results() {
        let registry = registry();
        registry.register(Arc::new(ParallelExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let step = Step::new("p1", "parallel").with_children(vec![
            Step::new("a", "succeed"),
            Step::new("b", "succeed"),
            Step::new("c", "succeed"),
        ]);

        let exec = registry.get("parallel").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert!(result.is_success());

        let output: ParallelOutput = serde_json::from_value(result.output).unwrap();
        assert_eq!(output.total_branches, 3);
        assert_eq!(output.succeeded, 3);

        let parallel_results = ctx.get_variable("parallel_results").unwrap();
        assert!(parallel_results.get("a").is_some());
        assert!(ctx.get_variable("seen_a").is_some());
    }

    #[tokio::test]
    async fn fail_fast_reports_failure() {
        let registry = registry();
        registry.register(Arc::new(ParallelExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let step = Step::new("p1", "parallel")
            .with_config(serde_json::json!({"fail_fast": true}))
            .with_children(vec![Step::new("a", "succeed"), Step::new("b", "fail")]);

        let exec = registry.get("parallel").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn fail_fast_disabled_runs_every_branch() {
        let registry = registry();
        registry.register(Arc::new(ParallelExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let step = Step::new("p1", "parallel")
            .with_config(serde_json::json!({"fail_fast": false}))
            .with_children(vec![Step::new("a", "fail"), Step::new("b", "succeed")]);

        let exec = registry.get("parallel").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert!(result.is_success());
        let output: ParallelOutput = serde_json::from_value(result.output).unwrap();
        assert_eq!(output.succeeded, 1);
        assert_eq!(output.failed, 1);
    }

    #[tokio::test]
    async fn empty_children_is_trivially_successful() {
        let registry = registry();
        registry.register(Arc::new(ParallelExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("p1", "parallel");
        let exec = registry.get("parallel").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert!(result.is_success());
    }
}
