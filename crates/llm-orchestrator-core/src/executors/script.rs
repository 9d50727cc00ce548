// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw script executor: adapter-contract-only per `spec.md` §4.15. Shares
//! the [`crate::processors::ScriptRuntime`] collaborator with `js_script`
//! processors rather than defining a second evaluation port.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{create_failed_result, create_success_result, create_timeout_result, OrchestratorError, Result};
use crate::processors::{ProcessorExecutor, ScriptRuntime};
use crate::registry::Executor;
use crate::step::{Step, StepResult};
use crate::variables::VariableResolver;

#[derive(Debug, Clone, Deserialize)]
struct ScriptStepConfig {
    code: String,
    #[serde(default)]
    bindings: Value,
}

pub struct ScriptExecutor {
    runtime: Arc<dyn ScriptRuntime>,
    processor: Arc<dyn ProcessorExecutor>,
    resolver: VariableResolver,
}

impl ScriptExecutor {
    pub fn new(runtime: Arc<dyn ScriptRuntime>, processor: Arc<dyn ProcessorExecutor>) -> Self {
        Self { runtime, processor, resolver: VariableResolver::new() }
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    fn step_type(&self) -> &str {
        "script"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
        let start = chrono::Utc::now();
        let wall_start = Instant::now();

        for spec in &step.pre_processors {
            if let Err(e) = self.processor.run(spec, ctx).await {
                return Ok(create_failed_result(step.id.clone(), start, &e));
            }
        }

        let config: ScriptStepConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid script step configuration: {e}")),
                ))
            }
        };

        let code = self.resolver.resolve_string(&config.code, ctx);

        let mut bindings = match config.bindings {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("bindings".to_string(), other);
                map
            }
        };
        for (name, value) in ctx.all_variables() {
            bindings.entry(name).or_insert(value);
        }
        let bindings = Value::Object(bindings);

        let timeout = step.timeout.unwrap_or(std::time::Duration::from_secs(30));
        let outcome = tokio::time::timeout(timeout, self.runtime.eval(&code, &bindings)).await;

        let output = match outcome {
            Err(_) => return Ok(create_timeout_result(step.id.clone(), start, timeout)),
            Ok(Err(e)) => return Ok(create_failed_result(step.id.clone(), start, &e)),
            Ok(Ok(value)) => value,
        };

        for spec in &step.post_processors {
            if let Err(e) = self.processor.run(spec, ctx).await {
                return Ok(create_failed_result(step.id.clone(), start, &e));
            }
        }

        ctx.create_variable_snapshot_with_env_vars(None);
        let logs = ctx.flush_logs();
        let console_logs = serde_json::to_value(&logs).unwrap_or(Value::Null);

        Ok(create_success_result(
            step.id.clone(),
            start,
            serde_json::json!({"result": output, "console_logs": console_logs}),
        )
        .with_metric("script_duration_ms", wall_start.elapsed().as_millis() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::DefaultProcessorExecutor;

    struct EchoRuntime;

    #[async_trait]
    impl ScriptRuntime for EchoRuntime {
        async fn eval(&self, code: &str, bindings: &Value) -> Result<Value> {
            if code == "fail" {
                return Err(OrchestratorError::Execution("boom".to_string()));
            }
            Ok(serde_json::json!({"code": code, "bindings": bindings}))
        }
    }

    fn executor() -> ScriptExecutor {
        ScriptExecutor::new(Arc::new(EchoRuntime), Arc::new(DefaultProcessorExecutor::new()))
    }

    #[tokio::test]
    async fn evaluates_script_with_context_bindings() {
        let ctx = ExecutionContext::new("wf", "exec");
        ctx.set_variable("x", serde_json::json!(1));
        let step = Step::new("s1", "script").with_config(serde_json::json!({"code": "return x"}));
        let result = executor().execute(&step, &ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.output["result"]["bindings"]["x"], 1);
    }

    #[tokio::test]
    async fn runtime_error_fails_the_step() {
        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("s1", "script").with_config(serde_json::json!({"code": "fail"}));
        let result = executor().execute(&step, &ctx).await.unwrap();
        assert!(!result.is_success());
    }
}
