// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loop executor: `for`/`foreach`/`while` iteration with labeled
//! `break`/`continue`. `spec.md` §4.8, §4.9.
//!
//! Break/continue are modeled as typed sentinels rather than exceptions: a
//! `break`/`continue` step sets a reserved context variable naming its
//! label, which the nearest loop whose own label matches (or the nearest
//! unlabeled loop, when the signal is unlabeled) consumes. A loop that
//! cannot consume the signal it observes leaves the variable set so the
//! next loop up the call stack sees it too.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{create_failed_result, create_success_result, OrchestratorError, Result};
use crate::expression::ExpressionEvaluator;
use crate::registry::{Executor, ExecutorRegistry};
use crate::step::{Loop, LoopMode, OnError, Step, StepResult, StepStatus};
use crate::variables::VariableResolver;

const SIGNAL_VAR: &str = "__loop_signal";
const DEFAULT_MAX_ITERATIONS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatedBy {
    Completed,
    Break,
    MaxIterations,
    #[serde(rename = "condition")]
    ConditionFalse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOutput {
    pub mode: LoopMode,
    pub total_iterations: u64,
    pub break_triggered: bool,
    pub steps_executed: u64,
    pub duration_ms: u64,
    pub terminated_by: TerminatedBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    None,
    Break(Option<SignalLabel>),
    Continue(Option<SignalLabel>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalLabel {
    Present,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
struct BreakContinueConfig {
    #[serde(default)]
    label: Option<String>,
}

pub struct LoopExecutor {
    registry: Arc<ExecutorRegistry>,
    evaluator: ExpressionEvaluator,
    resolver: VariableResolver,
}

impl LoopExecutor {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            registry,
            evaluator: ExpressionEvaluator::new(),
            resolver: VariableResolver::new(),
        }
    }
}

#[async_trait]
impl Executor for LoopExecutor {
    fn step_type(&self) -> &str {
        "loop"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
        let start = chrono::Utc::now();
        let wall_start = Instant::now();

        let Some(loop_spec) = &step.loop_ else {
            return Ok(create_failed_result(
                step.id.clone(),
                start,
                &OrchestratorError::Config("loop step requires a 'loop' block".to_string()),
            ));
        };

        let item_var = loop_spec.item_var.clone().unwrap_or_else(|| "item".to_string());
        let index_var = loop_spec.index_var.clone().unwrap_or_else(|| "index".to_string());

        let mut total_iterations: u64 = 0;
        let mut steps_executed: u64 = 0;
        let mut terminated_by = TerminatedBy::Completed;
        let mut break_triggered = false;

        match loop_spec.mode {
            LoopMode::For => {
                let count = loop_spec.count.unwrap_or(0).max(0) as u64;
                for index in 0..count {
                    ctx.set_variable(index_var.clone(), Value::from(index));
                    set_loop_var(ctx, index as i64, Value::Null, count as i64);

                    if should_break_via_condition(loop_spec, &self.evaluator, ctx) {
                        break_triggered = true;
                        terminated_by = TerminatedBy::Break;
                        break;
                    }

                    if should_skip_via_continue(loop_spec, &self.evaluator, ctx) {
                        total_iterations += 1;
                        continue;
                    }

                    let (ran, signal, err) =
                        run_body(&self.registry, &loop_spec.steps, ctx, &step.id, index).await;
                    steps_executed += ran;
                    total_iterations += 1;

                    if let Some(err) = err {
                        return Ok(create_failed_result(step.id.clone(), start, &err));
                    }

                    match resolve_signal(signal, loop_spec.label.as_deref(), ctx) {
                        LoopFlow::Continue => continue,
                        LoopFlow::Break => {
                            break_triggered = true;
                            terminated_by = TerminatedBy::Break;
                            break;
                        }
                        LoopFlow::Propagate => {
                            break_triggered = true;
                            terminated_by = TerminatedBy::Break;
                            break;
                        }
                        LoopFlow::Normal => {}
                    }
                }
            }
            LoopMode::Foreach => {
                let items = resolve_items(loop_spec.items.as_ref().unwrap_or(&Value::Null), ctx, &self.resolver);
                let entries = foreach_entries(&items);
                let total = entries.len() as i64;

                for (index, (key, item)) in entries.into_iter().enumerate() {
                    ctx.set_variable(index_var.clone(), key.clone());
                    ctx.set_variable(item_var.clone(), item.clone());
                    set_loop_var(ctx, index as i64, item.clone(), total);

                    if should_break_via_condition(loop_spec, &self.evaluator, ctx) {
                        break_triggered = true;
                        terminated_by = TerminatedBy::Break;
                        break;
                    }

                    if should_skip_via_continue(loop_spec, &self.evaluator, ctx) {
                        total_iterations += 1;
                        continue;
                    }

                    let (ran, signal, err) =
                        run_body(&self.registry, &loop_spec.steps, ctx, &step.id, index as u64).await;
                    steps_executed += ran;
                    total_iterations += 1;

                    if let Some(err) = err {
                        return Ok(create_failed_result(step.id.clone(), start, &err));
                    }

                    match resolve_signal(signal, loop_spec.label.as_deref(), ctx) {
                        LoopFlow::Continue => continue,
                        LoopFlow::Break | LoopFlow::Propagate => {
                            break_triggered = true;
                            terminated_by = TerminatedBy::Break;
                            break;
                        }
                        LoopFlow::Normal => {}
                    }
                }
            }
            LoopMode::While => {
                let Some(condition) = &loop_spec.condition else {
                    return Ok(create_failed_result(
                        step.id.clone(),
                        start,
                        &OrchestratorError::Config("while loop requires a 'condition'".to_string()),
                    ));
                };
                let max_iterations = loop_spec.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
                let mut index: u64 = 0;

                loop {
                    if index >= max_iterations {
                        terminated_by = TerminatedBy::MaxIterations;
                        break;
                    }

                    let continues = match self.evaluator.evaluate_string(condition, ctx) {
                        Ok(v) => v,
                        Err(e) => return Ok(create_failed_result(step.id.clone(), start, &e)),
                    };
                    if !continues {
                        terminated_by = TerminatedBy::ConditionFalse;
                        break;
                    }

                    ctx.set_variable(index_var.clone(), Value::from(index));
                    set_loop_var(ctx, index as i64, Value::Null, -1);

                    if should_break_via_condition(loop_spec, &self.evaluator, ctx) {
                        break_triggered = true;
                        terminated_by = TerminatedBy::Break;
                        break;
                    }

                    if should_skip_via_continue(loop_spec, &self.evaluator, ctx) {
                        total_iterations += 1;
                        index += 1;
                        continue;
                    }

                    let (ran, signal, err) =
                        run_body(&self.registry, &loop_spec.steps, ctx, &step.id, index).await;
                    steps_executed += ran;
                    total_iterations += 1;
                    index += 1;

                    if let Some(err) = err {
                        return Ok(create_failed_result(step.id.clone(), start, &err));
                    }

                    match resolve_signal(signal, loop_spec.label.as_deref(), ctx) {
                        LoopFlow::Continue => continue,
                        LoopFlow::Break | LoopFlow::Propagate => {
                            break_triggered = true;
                            terminated_by = TerminatedBy::Break;
                            break;
                        }
                        LoopFlow::Normal => {}
                    }
                }
            }
        }

        let output = LoopOutput {
            mode: loop_spec.mode,
            total_iterations,
            break_triggered,
            steps_executed,
            duration_ms: wall_start.elapsed().as_millis() as u64,
            terminated_by,
        };

        Ok(
            create_success_result(step.id.clone(), start, serde_json::to_value(&output).unwrap())
                .with_metric("loop_iterations_total", total_iterations as f64)
                .with_metric("loop_duration_ms", wall_start.elapsed().as_millis() as f64),
        )
    }
}

fn set_loop_var(ctx: &ExecutionContext, index: i64, item: Value, total: i64) {
    ctx.set_variable(
        "loop",
        serde_json::json!({
            "index": index,
            "item": item,
            "is_first": index == 0,
            "is_last": total >= 0 && index == total - 1,
        }),
    );
}

fn should_skip_via_continue(loop_spec: &Loop, evaluator: &ExpressionEvaluator, ctx: &ExecutionContext) -> bool {
    match &loop_spec.continue_condition {
        Some(expr) => evaluator.evaluate_string(expr, ctx).unwrap_or(false),
        None => false,
    }
}

fn should_break_via_condition(loop_spec: &Loop, evaluator: &ExpressionEvaluator, ctx: &ExecutionContext) -> bool {
    match &loop_spec.break_condition {
        Some(expr) => evaluator.evaluate_string(expr, ctx).unwrap_or(false),
        None => false,
    }
}

/// Resolves `items` preserving structure when the whole string is a single
/// `${path}` reference (so an array/object reaches the loop intact, rather
/// than being stringified by ordinary substitution).
fn resolve_items(items: &Value, ctx: &ExecutionContext, resolver: &VariableResolver) -> Value {
    if let Value::String(s) = items {
        let trimmed = s.trim();
        if trimmed.starts_with("${") && trimmed.ends_with('}') && trimmed.matches("${").count() == 1 {
            let path = &trimmed[2..trimmed.len() - 1];
            let eval_ctx = ctx.to_evaluation_context();
            return lookup_path(&eval_ctx, path).unwrap_or(Value::Null);
        }
        return Value::String(resolver.resolve_string(s, ctx));
    }
    items.clone()
}

fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root.clone();
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?.clone();
    }
    Some(current)
}

/// `foreach` over an array yields `(index, item)`; over an object (the
/// additive map-iteration support) yields `(key, value)`; a bare scalar
/// yields one iteration binding the scalar itself.
fn foreach_entries(items: &Value) -> Vec<(Value, Value)> {
    match items {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::from(i), v.clone()))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), v.clone()))
            .collect(),
        Value::Null => Vec::new(),
        other => vec![(Value::from(0), other.clone())],
    }
}

enum LoopFlow {
    Normal,
    Continue,
    Break,
    Propagate,
}

fn resolve_signal(signal: Signal, own_label: Option<&str>, ctx: &ExecutionContext) -> LoopFlow {
    match signal {
        Signal::None => LoopFlow::Normal,
        Signal::Break(label) => {
            if matches_label(label, own_label, ctx) {
                ctx.set_variable(SIGNAL_VAR, Value::Null);
                LoopFlow::Break
            } else {
                LoopFlow::Propagate
            }
        }
        Signal::Continue(label) => {
            if matches_label(label, own_label, ctx) {
                ctx.set_variable(SIGNAL_VAR, Value::Null);
                LoopFlow::Continue
            } else {
                LoopFlow::Propagate
            }
        }
    }
}

fn matches_label(signal_label: Option<SignalLabel>, own_label: Option<&str>, ctx: &ExecutionContext) -> bool {
    let Some(SignalLabel::Present) = signal_label else {
        return true;
    };
    let recorded = ctx
        .get_variable(SIGNAL_VAR)
        .and_then(|v| v.get("label").and_then(|l| l.as_str().map(str::to_string)));
    match (recorded, own_label) {
        (Some(recorded), Some(own)) => recorded == own,
        _ => false,
    }
}

/// Runs `steps` once, stopping early on a `break`/`continue` sentinel or an
/// `on_error = abort` failure. Mirrors [`crate::executors::nested::execute_nested_steps`]
/// with sentinel interception spliced in.
async fn run_body(
    registry: &ExecutorRegistry,
    steps: &[Step],
    ctx: &ExecutionContext,
    parent_id: &str,
    iteration: u64,
) -> (u64, Signal, Option<OrchestratorError>) {
    let mut executed = 0u64;

    for step in steps {
        if step.step_type == "break" || step.step_type == "continue" {
            let config: BreakContinueConfig =
                serde_json::from_value(step.config.clone()).unwrap_or(BreakContinueConfig { label: None });
            let label = config.label.clone();
            ctx.set_variable(
                SIGNAL_VAR,
                serde_json::json!({"kind": step.step_type, "label": label}),
            );
            ctx.set_result(
                step.id.clone(),
                create_success_result(step.id.clone(), chrono::Utc::now(), serde_json::json!({"signal": step.step_type})),
            );
            let label_token = label.map(|_| SignalLabel::Present);
            let signal = if step.step_type == "break" {
                Signal::Break(label_token)
            } else {
                Signal::Continue(label_token)
            };
            return (executed, signal, None);
        }

        if step.disabled {
            continue;
        }

        if let Some(cb) = &ctx.callback {
            cb.on_step_start(step, Some(parent_id), Some(iteration)).await;
        }

        let Some(executor) = registry.get(&step.step_type) else {
            return (executed, Signal::None, Some(OrchestratorError::NotFound(step.step_type.clone())));
        };

        let exec_result = executor.execute(step, ctx).await;
        let result = match exec_result {
            Ok(result) => result,
            Err(err) => return (executed, Signal::None, Some(err)),
        };

        ctx.set_result(step.id.clone(), result.clone());
        executed += 1;

        if let Some(cb) = &ctx.callback {
            match result.status {
                StepStatus::Success => cb.on_step_complete(step, &result, Some(parent_id), Some(iteration)).await,
                _ => {
                    let err = OrchestratorError::Execution(result.error.clone().unwrap_or_default());
                    cb.on_step_failed(step, &err, result.duration, Some(parent_id), Some(iteration)).await;
                }
            }
        }

        if matches!(result.status, StepStatus::Failed | StepStatus::Timeout) {
            match step.on_error {
                OnError::Abort => {
                    let err = OrchestratorError::Execution(
                        result.error.clone().unwrap_or_else(|| "step failed".to_string()),
                    );
                    return (executed, Signal::None, Some(err));
                }
                OnError::Continue => continue,
                OnError::Skip => return (executed, Signal::None, None),
            }
        }

        // A nested loop/condition/parallel step may have set the sentinel
        // without this loop being able to consume it; surface it so our
        // caller re-evaluates against its own label.
        if let Some(pending) = ctx.get_variable(SIGNAL_VAR) {
            if !pending.is_null() {
                let kind = pending.get("kind").and_then(|v| v.as_str()).unwrap_or("break");
                let label_token = pending
                    .get("label")
                    .and_then(|v| v.as_str())
                    .map(|_| SignalLabel::Present);
                let signal = if kind == "break" {
                    Signal::Break(label_token)
                } else {
                    Signal::Continue(label_token)
                };
                return (executed, signal, None);
            }
        }
    }

    (executed, Signal::None, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Loop;
    use std::sync::Arc;

    struct CountingExecutor;

    #[async_trait]
    impl Executor for CountingExecutor {
        fn step_type(&self) -> &str {
            "noop"
        }

        async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
            let count = ctx.get_variable("count").and_then(|v| v.as_i64()).unwrap_or(0);
            ctx.set_variable("count", Value::from(count + 1));
            Ok(create_success_result(step.id.clone(), chrono::Utc::now(), serde_json::json!({})))
        }
    }

    fn registry() -> Arc<ExecutorRegistry> {
        let r = ExecutorRegistry::new();
        r.register(Arc::new(CountingExecutor)).unwrap();
        Arc::new(r)
    }

    #[tokio::test]
    async fn for_mode_runs_exact_count() {
        let registry = registry();
        registry.register(Arc::new(LoopExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let loop_spec = Loop {
            mode: LoopMode::For,
            steps: vec![Step::new("body", "noop")],
            count: Some(5),
            items: None,
            item_var: None,
            index_var: None,
            condition: None,
            break_condition: None,
            continue_condition: None,
            max_iterations: None,
            label: None,
        };
        let step = Step::new("loop1", "loop").with_loop(loop_spec);
        let exec = registry.get("loop").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        let output: LoopOutput = serde_json::from_value(result.output).unwrap();
        assert_eq!(output.total_iterations, 5);
        assert_eq!(ctx.get_variable("count"), Some(Value::from(5)));
        assert_eq!(output.terminated_by, TerminatedBy::Completed);
    }

    #[tokio::test]
    async fn foreach_over_array_binds_item_and_index() {
        let registry = registry();
        registry.register(Arc::new(LoopExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let loop_spec = Loop {
            mode: LoopMode::Foreach,
            steps: vec![Step::new("body", "noop")],
            count: None,
            items: Some(serde_json::json!(["a", "b", "c"])),
            item_var: Some("fruit".to_string()),
            index_var: Some("idx".to_string()),
            condition: None,
            break_condition: None,
            continue_condition: None,
            max_iterations: None,
            label: None,
        };
        let step = Step::new("loop1", "loop").with_loop(loop_spec);
        let exec = registry.get("loop").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        let output: LoopOutput = serde_json::from_value(result.output).unwrap();
        assert_eq!(output.total_iterations, 3);
        assert_eq!(ctx.get_variable("fruit"), Some(serde_json::json!("c")));
        assert_eq!(ctx.get_variable("idx"), Some(Value::from(2)));
    }

    #[tokio::test]
    async fn foreach_over_map_binds_key_as_index() {
        let registry = registry();
        registry.register(Arc::new(LoopExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let loop_spec = Loop {
            mode: LoopMode::Foreach,
            steps: vec![Step::new("body", "noop")],
            count: None,
            items: Some(serde_json::json!({"x": 1, "y": 2})),
            item_var: None,
            index_var: None,
            condition: None,
            break_condition: None,
            continue_condition: None,
            max_iterations: None,
            label: None,
        };
        let step = Step::new("loop1", "loop").with_loop(loop_spec);
        let exec = registry.get("loop").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        let output: LoopOutput = serde_json::from_value(result.output).unwrap();
        assert_eq!(output.total_iterations, 2);
    }

    #[tokio::test]
    async fn while_mode_respects_max_iterations_guard() {
        let registry = registry();
        registry.register(Arc::new(LoopExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let loop_spec = Loop {
            mode: LoopMode::While,
            steps: vec![Step::new("body", "noop")],
            count: None,
            items: None,
            item_var: None,
            index_var: None,
            condition: Some("true".to_string()),
            break_condition: None,
            continue_condition: None,
            max_iterations: Some(10),
            label: None,
        };
        let step = Step::new("loop1", "loop").with_loop(loop_spec);
        let exec = registry.get("loop").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        let output: LoopOutput = serde_json::from_value(result.output).unwrap();
        assert_eq!(output.total_iterations, 10);
        assert_eq!(output.terminated_by, TerminatedBy::MaxIterations);
    }

    #[tokio::test]
    async fn break_step_stops_loop_early() {
        let registry = registry();
        registry.register(Arc::new(LoopExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let loop_spec = Loop {
            mode: LoopMode::For,
            steps: vec![Step::new("a", "noop"), Step::new("b", "break")],
            count: Some(10),
            items: None,
            item_var: None,
            index_var: None,
            condition: None,
            break_condition: None,
            continue_condition: None,
            max_iterations: None,
            label: None,
        };
        let step = Step::new("loop1", "loop").with_loop(loop_spec);
        let exec = registry.get("loop").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        let output: LoopOutput = serde_json::from_value(result.output).unwrap();
        assert!(output.break_triggered);
        assert_eq!(output.total_iterations, 1);
        assert_eq!(output.terminated_by, TerminatedBy::Break);
    }

    #[tokio::test]
    async fn break_condition_is_checked_before_body_each_iteration() {
        let registry = registry();
        registry.register(Arc::new(LoopExecutor::new(registry.clone()))).unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let loop_spec = Loop {
            mode: LoopMode::For,
            steps: vec![Step::new("a", "noop")],
            count: Some(10),
            items: None,
            item_var: None,
            index_var: None,
            condition: None,
            break_condition: Some("${count} >= 3".to_string()),
            continue_condition: None,
            max_iterations: None,
            label: None,
        };
        let step = Step::new("loop1", "loop").with_loop(loop_spec);
        let exec = registry.get("loop").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        let output: LoopOutput = serde_json::from_value(result.output).unwrap();
        assert_eq!(output.total_iterations, 3);
        assert!(output.break_triggered);
    }
}
