// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Condition executor: the classical `if/else-if/else` shape nested under
//! `Step.Condition`, and the chained shape of sibling `condition` steps
//! tagged `Config.type ∈ {if, else_if, else}`. `spec.md` §4.7.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{create_failed_result, create_success_result, OrchestratorError, Result};
use crate::executors::nested::{execute_nested_steps, NeverCancelled};
use crate::expression::ExpressionEvaluator;
use crate::registry::{Executor, ExecutorRegistry};
use crate::step::{Step, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchTaken {
    Then,
    ElseIf,
    Else,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionOutput {
    pub result: bool,
    pub branch_taken: BranchTaken,
    pub branch_index: i64,
    pub steps_executed: Vec<String>,
}

impl ConditionOutput {
    pub fn is_branch_taken(&self) -> bool {
        self.branch_taken != BranchTaken::None
    }
}

/// Chained-shape config: `Config.type` plus, for `if`/`else_if`, an
/// `expression`. `else_if`/`else` additionally name the `group` — the id of
/// the `if` step that started this lexical chain — since `spec.md` leaves
/// the structural identification of a "lexical group" unspecified; see
/// DESIGN.md for this resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ChainedConfig {
    r#type: ChainedKind,
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ChainedKind {
    If,
    ElseIf,
    Else,
}

pub struct ConditionExecutor {
    registry: Arc<ExecutorRegistry>,
    evaluator: ExpressionEvaluator,
}

impl ConditionExecutor {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            registry,
            evaluator: ExpressionEvaluator::new(),
        }
    }

    async fn run_branch(
        &self,
        steps: &[Step],
        ctx: &ExecutionContext,
        parent_id: &str,
    ) -> (Vec<String>, Option<OrchestratorError>) {
        let (results, err) =
            execute_nested_steps(&self.registry, steps, ctx, parent_id, None, &NeverCancelled).await;
        (results.into_iter().map(|r| r.step_id).collect(), err)
    }
}

#[async_trait]
impl Executor for ConditionExecutor {
    fn step_type(&self) -> &str {
        "condition"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
        let start = chrono::Utc::now();

        if let Some(condition) = &step.condition {
            return self.execute_classical(step, condition, ctx, start).await;
        }

        self.execute_chained(step, ctx, start).await
    }
}

impl ConditionExecutor {
    async fn execute_classical(
        &self,
        step: &Step,
        condition: &crate::step::Condition,
        ctx: &ExecutionContext,
        start: chrono::DateTime<chrono::Utc>,
    ) -> Result<StepResult> {
        let expr_result = match self.evaluator.evaluate_string(&condition.expression, ctx) {
            Ok(v) => v,
            Err(e) => return Ok(create_failed_result(step.id.clone(), start, &e)),
        };

        if expr_result {
            let (executed, err) = self.run_branch(&condition.then, ctx, &step.id).await;
            return Ok(self.finish(
                step,
                start,
                true,
                BranchTaken::Then,
                0,
                executed,
                err,
            ));
        }

        for (idx, branch) in condition.else_if.iter().enumerate() {
            let branch_result = match self.evaluator.evaluate_string(&branch.condition, ctx) {
                Ok(v) => v,
                Err(e) => return Ok(create_failed_result(step.id.clone(), start, &e)),
            };
            if branch_result {
                let (executed, err) = self.run_branch(&branch.steps, ctx, &step.id).await;
                return Ok(self.finish(
                    step,
                    start,
                    false,
                    BranchTaken::ElseIf,
                    idx as i64,
                    executed,
                    err,
                ));
            }
        }

        if !condition.r#else.is_empty() {
            let (executed, err) = self.run_branch(&condition.r#else, ctx, &step.id).await;
            return Ok(self.finish(step, start, false, BranchTaken::Else, 0, executed, err));
        }

        Ok(self.finish(step, start, false, BranchTaken::None, 0, Vec::new(), None))
    }

    async fn execute_chained(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        start: chrono::DateTime<chrono::Utc>,
    ) -> Result<StepResult> {
        let chained: ChainedConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid condition config: {e}")),
                ))
            }
        };

        let group_key = match chained.r#type {
            ChainedKind::If => step.id.clone(),
            ChainedKind::ElseIf | ChainedKind::Else => match &chained.group {
                Some(g) => g.clone(),
                None => {
                    return Ok(create_failed_result(
                        step.id.clone(),
                        start,
                        &OrchestratorError::Config(
                            "else_if/else steps require a 'group' naming their originating if step"
                                .to_string(),
                        ),
                    ))
                }
            },
        };
        let flag_var = format!("__condition_chain_taken::{group_key}");

        if matches!(chained.r#type, ChainedKind::If) {
            ctx.set_variable(flag_var.clone(), serde_json::json!(false));
        }

        let already_taken = ctx
            .get_variable(&flag_var)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let evaluates = match chained.r#type {
            ChainedKind::If | ChainedKind::ElseIf => {
                let Some(expr) = &chained.expression else {
                    return Ok(create_failed_result(
                        step.id.clone(),
                        start,
                        &OrchestratorError::Config(
                            "if/else_if steps require an 'expression'".to_string(),
                        ),
                    ));
                };
                if already_taken {
                    false
                } else {
                    match self.evaluator.evaluate_string(expr, ctx) {
                        Ok(v) => v,
                        Err(e) => return Ok(create_failed_result(step.id.clone(), start, &e)),
                    }
                }
            }
            ChainedKind::Else => !already_taken,
        };

        let branch_taken = match chained.r#type {
            ChainedKind::If => BranchTaken::Then,
            ChainedKind::ElseIf => BranchTaken::ElseIf,
            ChainedKind::Else => BranchTaken::Else,
        };

        if !evaluates {
            return Ok(self.finish(step, start, false, BranchTaken::None, 0, Vec::new(), None));
        }

        ctx.set_variable(flag_var, serde_json::json!(true));
        let (executed, err) = self.run_branch(&step.children, ctx, &step.id).await;
        Ok(self.finish(step, start, true, branch_taken, 0, executed, err))
    }

    fn finish(
        &self,
        step: &Step,
        start: chrono::DateTime<chrono::Utc>,
        result: bool,
        branch_taken: BranchTaken,
        branch_index: i64,
        steps_executed: Vec<String>,
        err: Option<OrchestratorError>,
    ) -> StepResult {
        if let Some(err) = err {
            return create_failed_result(step.id.clone(), start, &err);
        }

        let output = ConditionOutput {
            result,
            branch_taken,
            branch_index,
            steps_executed: steps_executed.clone(),
        };

        create_success_result(step.id.clone(), start, serde_json::to_value(&output).unwrap())
            .with_metric("condition_result", if result { 1.0 } else { 0.0 })
            .with_metric("branch_steps_count", steps_executed.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::create_success_result as ok_result;
    use crate::step::{ElseIfBranch, OnError};
    use std::sync::Arc;

    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        fn step_type(&self) -> &str {
            "noop"
        }

        async fn execute(&self, step: &Step, _ctx: &ExecutionContext) -> Result<StepResult> {
            Ok(ok_result(step.id.clone(), chrono::Utc::now(), serde_json::json!({})))
        }
    }

    fn registry() -> Arc<ExecutorRegistry> {
        let r = ExecutorRegistry::new();
        r.register(Arc::new(NoopExecutor)).unwrap();
        Arc::new(r)
    }

    #[tokio::test]
    async fn s1_if_else_if_else_runs_exactly_one_branch() {
        let ctx = ExecutionContext::new("wf", "exec");
        ctx.set_variable("value", serde_json::json!(3));

        let condition = crate::step::Condition {
            expression: "${value} > 5".to_string(),
            then: vec![Step::new("A", "noop")],
            else_if: vec![ElseIfBranch {
                condition: "${value} > 2".to_string(),
                steps: vec![Step::new("B", "noop")],
            }],
            r#else: vec![Step::new("C", "noop")],
        };

        let step = Step::new("cond1", "condition").with_condition(condition);
        let registry = registry();
        let executor = ConditionExecutor::new(registry.clone());
        registry.register(Arc::new(executor)).unwrap();

        let exec = registry.get("condition").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        let output: ConditionOutput = serde_json::from_value(result.output).unwrap();

        assert_eq!(output.branch_taken, BranchTaken::ElseIf);
        assert_eq!(output.steps_executed, vec!["B".to_string()]);
        assert_eq!(result.metrics["condition_result"], 0.0);
    }

    #[tokio::test]
    async fn classical_none_when_no_branch_matches() {
        let ctx = ExecutionContext::new("wf", "exec");
        let condition = crate::step::Condition {
            expression: "false".to_string(),
            then: vec![],
            else_if: vec![],
            r#else: vec![],
        };
        let step = Step::new("cond1", "condition").with_condition(condition);
        let registry = registry();
        registry
            .register(Arc::new(ConditionExecutor::new(registry.clone())))
            .unwrap();

        let exec = registry.get("condition").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        let output: ConditionOutput = serde_json::from_value(result.output).unwrap();
        assert_eq!(output.branch_taken, BranchTaken::None);
    }

    #[tokio::test]
    async fn chained_shape_else_runs_only_when_if_missed() {
        let registry = registry();
        registry
            .register(Arc::new(ConditionExecutor::new(registry.clone())))
            .unwrap();
        let exec = registry.get("condition").unwrap();
        let ctx = ExecutionContext::new("wf", "exec");

        let if_step = Step::new("if1", "condition")
            .with_config(serde_json::json!({"type": "if", "expression": "false"}))
            .with_children(vec![Step::new("A", "noop")]);
        let else_step = Step::new("else1", "condition")
            .with_config(serde_json::json!({"type": "else", "group": "if1"}))
            .with_children(vec![Step::new("B", "noop")]);

        let if_result = exec.execute(&if_step, &ctx).await.unwrap();
        let if_output: ConditionOutput = serde_json::from_value(if_result.output).unwrap();
        assert_eq!(if_output.branch_taken, BranchTaken::None);

        let else_result = exec.execute(&else_step, &ctx).await.unwrap();
        let else_output: ConditionOutput = serde_json::from_value(else_result.output).unwrap();
        assert_eq!(else_output.branch_taken, BranchTaken::Else);
        assert_eq!(else_output.steps_executed, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn missing_expression_on_if_is_config_error() {
        let registry = registry();
        registry
            .register(Arc::new(ConditionExecutor::new(registry.clone())))
            .unwrap();
        let exec = registry.get("condition").unwrap();
        let ctx = ExecutionContext::new("wf", "exec");
        let step =
            Step::new("if1", "condition").with_config(serde_json::json!({"type": "if"}));
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert_eq!(result.status, crate::step::StepStatus::Failed);
        assert!(result.error.unwrap().contains("CONFIG"));
    }

    #[test]
    fn on_error_default_is_abort() {
        assert_eq!(OnError::default(), OnError::Abort);
    }
}
