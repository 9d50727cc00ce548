// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Processor executor port: the pluggable in-line transformations attached
//! to steps (`set_variable`, `extract_param`, `assertion`, `js_script`).
//! `spec.md` §4.11 (Design Notes: "Processor executor as a port").
//!
//! `js_script` delegates to an injected [`ScriptRuntime`]; the embedded
//! scripting runtime itself is an external collaborator, out of scope here
//! (`spec.md` §1).

use async_trait::async_trait;
use serde_json::Value;

use crate::context::{ExecutionContext, LogEntry, VarScope};
use crate::error::{OrchestratorError, Result};
use crate::variables::VariableResolver;

/// The four processor kinds recognized by the core. `spec.md` §4.11.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorType {
    SetVariable,
    ExtractParam,
    Assertion,
    JsScript,
}

/// Authoring record for one pre/post-processor attached to a step.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessorSpec {
    pub id: String,
    pub name: String,
    pub processor_type: ProcessorType,
    #[serde(default = "default_processor_config")]
    pub config: Value,
}

fn default_processor_config() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Outcome of running one processor: success flag, message, output payload,
/// and any variable mutations to apply.
pub struct ProcessorOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub output: Value,
}

impl ProcessorOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            message: None,
            output,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            output: Value::Null,
        }
    }
}

/// Injection point for the embedded scripting runtime used by `js_script`
/// processors and `script` steps. Only the invocation contract is specified
/// here; the interpreter itself is an external collaborator.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Evaluates `code` with `bindings` available as in-scope variables,
    /// returning the script's final expression value.
    async fn eval(&self, code: &str, bindings: &Value) -> Result<Value>;
}

/// Pluggable processor executor consumed by HTTP/AI/MQ/etc. step pipelines.
/// `spec.md` §4.11 specifies only this contract.
#[async_trait]
pub trait ProcessorExecutor: Send + Sync {
    async fn run(&self, spec: &ProcessorSpec, ctx: &ExecutionContext) -> Result<ProcessorOutcome>;
}

/// Default in-process implementation: handles `set_variable`,
/// `extract_param`, and `assertion` directly; `js_script` delegates to an
/// injected [`ScriptRuntime`] if one is configured, otherwise fails with a
/// `Config` error naming the missing collaborator.
pub struct DefaultProcessorExecutor {
    resolver: VariableResolver,
    script_runtime: Option<std::sync::Arc<dyn ScriptRuntime>>,
}

impl DefaultProcessorExecutor {
    pub fn new() -> Self {
        Self {
            resolver: VariableResolver::new(),
            script_runtime: None,
        }
    }

    pub fn with_script_runtime(mut self, runtime: std::sync::Arc<dyn ScriptRuntime>) -> Self {
        self.script_runtime = Some(runtime);
        self
    }
}

impl Default for DefaultProcessorExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessorExecutor for DefaultProcessorExecutor {
    async fn run(&self, spec: &ProcessorSpec, ctx: &ExecutionContext) -> Result<ProcessorOutcome> {
        let outcome = match spec.processor_type {
            ProcessorType::SetVariable => run_set_variable(&self.resolver, spec, ctx),
            ProcessorType::ExtractParam => run_extract_param(spec, ctx),
            ProcessorType::Assertion => run_assertion(&self.resolver, spec, ctx),
            ProcessorType::JsScript => run_js_script(self.script_runtime.as_deref(), spec, ctx).await?,
        };

        ctx.append_log(LogEntry::Processor {
            id: spec.id.clone(),
            name: spec.name.clone(),
            processor_type: format!("{:?}", spec.processor_type).to_lowercase(),
            success: outcome.success,
            message: outcome.message.clone(),
            output: outcome.output.clone(),
        });

        if matches!(spec.processor_type, ProcessorType::Assertion) {
            ctx.append_log(LogEntry::AssertionResult {
                id: spec.id.clone(),
                name: spec.name.clone(),
                success: outcome.success,
                message: outcome.message.clone(),
            });
        }

        Ok(outcome)
    }
}

fn run_set_variable(
    resolver: &VariableResolver,
    spec: &ProcessorSpec,
    ctx: &ExecutionContext,
) -> ProcessorOutcome {
    let Some(name) = spec.config.get("name").and_then(|v| v.as_str()) else {
        return ProcessorOutcome::fail("set_variable requires a 'name'".to_string());
    };
    let value = match spec.config.get("value") {
        Some(v) => resolver.resolve_value(v, ctx),
        None => Value::Null,
    };
    let scope = match spec.config.get("scope").and_then(|v| v.as_str()) {
        Some("env") => VarScope::Env,
        _ => VarScope::Temp,
    };
    ctx.set_variable_with_tracking(name, value.clone(), scope, spec.name.clone());
    ProcessorOutcome::ok(value)
}

fn run_extract_param(spec: &ProcessorSpec, ctx: &ExecutionContext) -> ProcessorOutcome {
    let Some(source_path) = spec.config.get("from").and_then(|v| v.as_str()) else {
        return ProcessorOutcome::fail("extract_param requires a 'from' path".to_string());
    };
    let Some(target_name) = spec.config.get("as").and_then(|v| v.as_str()) else {
        return ProcessorOutcome::fail("extract_param requires an 'as' name".to_string());
    };

    let eval_ctx = ctx.to_evaluation_context();
    let mut current = eval_ctx;
    for segment in source_path.split('.') {
        match current.as_object().and_then(|m| m.get(segment)) {
            Some(v) => current = v.clone(),
            None => {
                return ProcessorOutcome::fail(format!(
                    "extract_param: path '{source_path}' not found"
                ))
            }
        }
    }

    ctx.set_variable_with_tracking(target_name, current.clone(), VarScope::Temp, spec.name.clone());
    ProcessorOutcome::ok(current)
}

fn run_assertion(
    resolver: &VariableResolver,
    spec: &ProcessorSpec,
    ctx: &ExecutionContext,
) -> ProcessorOutcome {
    let Some(expression) = spec.config.get("expression").and_then(|v| v.as_str()) else {
        return ProcessorOutcome::fail("assertion requires an 'expression'".to_string());
    };
    let evaluator = crate::expression::ExpressionEvaluator::new();
    match evaluator.evaluate_string(expression, ctx) {
        Ok(true) => ProcessorOutcome::ok(Value::Bool(true)),
        Ok(false) => ProcessorOutcome::fail(format!("assertion failed: {expression}")),
        Err(e) => {
            let _ = resolver; // resolver already applied inside evaluate_string
            ProcessorOutcome::fail(format!("assertion error: {e}"))
        }
    }
}

async fn run_js_script(
    runtime: Option<&dyn ScriptRuntime>,
    spec: &ProcessorSpec,
    ctx: &ExecutionContext,
) -> Result<ProcessorOutcome> {
    let Some(code) = spec.config.get("code").and_then(|v| v.as_str()) else {
        return Ok(ProcessorOutcome::fail("js_script requires 'code'".to_string()));
    };
    let Some(runtime) = runtime else {
        return Err(OrchestratorError::Config(
            "js_script processor requires a ScriptRuntime to be configured".to_string(),
        ));
    };
    let bindings = ctx.to_evaluation_context();
    match runtime.eval(code, &bindings).await {
        Ok(value) => Ok(ProcessorOutcome::ok(value)),
        Err(e) => Ok(ProcessorOutcome::fail(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(processor_type: ProcessorType, config: Value) -> ProcessorSpec {
        ProcessorSpec {
            id: "p1".to_string(),
            name: "test".to_string(),
            processor_type,
            config,
        }
    }

    #[tokio::test]
    async fn set_variable_updates_context_and_logs() {
        let ctx = ExecutionContext::new("wf", "exec");
        let executor = DefaultProcessorExecutor::new();
        let outcome = executor
            .run(
                &spec(
                    ProcessorType::SetVariable,
                    serde_json::json!({"name": "x", "value": 42}),
                ),
                &ctx,
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(ctx.get_variable("x"), Some(serde_json::json!(42)));
        assert_eq!(ctx.get_logs().len(), 1);
    }

    #[tokio::test]
    async fn extract_param_reads_nested_path() {
        let ctx = ExecutionContext::new("wf", "exec");
        ctx.set_variable("resp", serde_json::json!({"body": {"id": "abc"}}));
        let executor = DefaultProcessorExecutor::new();
        let outcome = executor
            .run(
                &spec(
                    ProcessorType::ExtractParam,
                    serde_json::json!({"from": "resp.body.id", "as": "extracted_id"}),
                ),
                &ctx,
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(
            ctx.get_variable("extracted_id"),
            Some(serde_json::json!("abc"))
        );
    }

    #[tokio::test]
    async fn assertion_failure_is_reported_not_erroring() {
        let ctx = ExecutionContext::new("wf", "exec");
        ctx.set_variable("value", serde_json::json!(1));
        let executor = DefaultProcessorExecutor::new();
        let outcome = executor
            .run(
                &spec(
                    ProcessorType::Assertion,
                    serde_json::json!({"expression": "${value} > 5"}),
                ),
                &ctx,
            )
            .await
            .unwrap();
        assert!(!outcome.success);

        let logs = ctx.get_logs();
        assert!(logs
            .iter()
            .any(|l| matches!(l, LogEntry::AssertionResult { success: false, .. })));
    }

    #[tokio::test]
    async fn js_script_without_runtime_is_config_error() {
        let ctx = ExecutionContext::new("wf", "exec");
        let executor = DefaultProcessorExecutor::new();
        let result = executor
            .run(
                &spec(ProcessorType::JsScript, serde_json::json!({"code": "1+1"})),
                &ctx,
            )
            .await;
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }
}
