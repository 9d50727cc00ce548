// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sub-workflow call executor: invokes a registered script fragment with
//! param binding, default values, and call-stack cycle detection.
//! `spec.md` §4.14.
//!
//! The call stack is kept behind the narrow `Push`/`Pop`/`Contains`
//! interface `spec.md` §9's Design Notes call for, so it is never
//! conflated with general execution state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{create_failed_result, create_success_result, OrchestratorError, Result};
use crate::executors::nested::{execute_nested_steps, NeverCancelled};
use crate::registry::ExecutorRegistry;
use crate::step::{Step, StepResult};
use crate::variables::VariableResolver;

/// A single named parameter accepted by a fragment.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// A named value a fragment hands back to its caller.
#[derive(Debug, Clone, Deserialize)]
pub struct ReturnSpec {
    pub name: String,
    pub value: String,
}

/// A registered, callable unit of steps. `spec.md` §4.14, §9 (Call stack).
#[derive(Debug, Clone, Deserialize)]
pub struct Fragment {
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub returns: Vec<ReturnSpec>,
}

/// Lookup of registered fragments by name.
pub trait FragmentRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<Fragment>;
}

/// In-memory fragment registry; the common case for embedding applications
/// that parse their own workflow definitions into [`Fragment`]s up front.
#[derive(Default)]
pub struct InMemoryFragmentRegistry {
    fragments: Mutex<HashMap<String, Fragment>>,
}

impl InMemoryFragmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, fragment: Fragment) {
        self.fragments.lock().insert(name.into(), fragment);
    }
}

impl FragmentRegistry for InMemoryFragmentRegistry {
    fn get(&self, name: &str) -> Option<Fragment> {
        self.fragments.lock().get(name).cloned()
    }
}

/// The process-wide cycle detector every in-flight `call` step registers
/// itself on for the duration of its fragment's execution. `spec.md` §5, §9.
pub trait CallStack: Send + Sync {
    /// Registers `name` as in-flight. Returns an error if it is already
    /// present (a cycle).
    fn push(&self, name: &str) -> Result<()>;
    fn pop(&self, name: &str);
    fn contains(&self, name: &str) -> bool;
}

#[derive(Default)]
pub struct InMemoryCallStack {
    active: Mutex<std::collections::HashSet<String>>,
}

impl InMemoryCallStack {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CallStack for InMemoryCallStack {
    fn push(&self, name: &str) -> Result<()> {
        let mut active = self.active.lock();
        if !active.insert(name.to_string()) {
            return Err(OrchestratorError::Execution(format!(
                "sub-workflow cycle detected: '{name}' is already on the call stack"
            )));
        }
        Ok(())
    }

    fn pop(&self, name: &str) {
        self.active.lock().remove(name);
    }

    fn contains(&self, name: &str) -> bool {
        self.active.lock().contains(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CallConfig {
    script: String,
    #[serde(default)]
    params: serde_json::Map<String, Value>,
    #[serde(default)]
    results: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallOutput {
    pub success: bool,
    pub script: String,
    pub returns: HashMap<String, Value>,
    pub step_count: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
}

pub struct CallExecutor {
    registry: Arc<ExecutorRegistry>,
    fragments: Arc<dyn FragmentRegistry>,
    call_stack: Arc<dyn CallStack>,
    resolver: VariableResolver,
}

impl CallExecutor {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        fragments: Arc<dyn FragmentRegistry>,
        call_stack: Arc<dyn CallStack>,
    ) -> Self {
        Self {
            registry,
            fragments,
            call_stack,
            resolver: VariableResolver::new(),
        }
    }
}

#[async_trait]
impl crate::registry::Executor for CallExecutor {
    fn step_type(&self) -> &str {
        "call"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
        let start = chrono::Utc::now();
        let wall_start = Instant::now();

        let config: CallConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid call config: {e}")),
                ))
            }
        };

        let script_name = self.resolver.resolve_string(&config.script, ctx);
        let Some(fragment) = self.fragments.get(&script_name) else {
            return Ok(create_failed_result(
                step.id.clone(),
                start,
                &OrchestratorError::Config(format!("no script fragment registered as '{script_name}'")),
            ));
        };

        if let Err(err) = self.call_stack.push(&script_name) {
            return Ok(create_failed_result(step.id.clone(), start, &err));
        }

        let result = self.run_fragment(step, &config, &script_name, &fragment, ctx).await;
        self.call_stack.pop(&script_name);

        let step_result = match result {
            Ok(output) => {
                create_success_result(step.id.clone(), start, serde_json::to_value(&output).unwrap())
                    .with_metric("call_step_count", output.step_count as f64)
            }
            Err(err) => {
                let output = CallOutput {
                    success: false,
                    script: script_name,
                    returns: HashMap::new(),
                    step_count: 0,
                    duration_ms: wall_start.elapsed().as_millis() as u64,
                    error: Some(err.message()),
                };
                let mut result = create_failed_result(step.id.clone(), start, &err);
                result.output = serde_json::to_value(&output).unwrap();
                result
            }
        };

        Ok(step_result)
    }
}

impl CallExecutor {
    async fn run_fragment(
        &self,
        step: &Step,
        config: &CallConfig,
        script_name: &str,
        fragment: &Fragment,
        ctx: &ExecutionContext,
    ) -> Result<CallOutput> {
        let wall_start = Instant::now();

        let resolved_params = self
            .resolver
            .resolve_value(&Value::Object(config.params.clone()), ctx);
        let resolved_params = resolved_params.as_object().cloned().unwrap_or_default();

        let mut bound_params = serde_json::Map::new();
        for param_spec in &fragment.params {
            match resolved_params.get(&param_spec.name) {
                Some(v) => {
                    bound_params.insert(param_spec.name.clone(), v.clone());
                }
                None => match &param_spec.default {
                    Some(default) => {
                        bound_params.insert(param_spec.name.clone(), default.clone());
                    }
                    None if param_spec.required => {
                        return Err(OrchestratorError::Config(format!(
                            "missing required param '{}' for script '{}'",
                            param_spec.name, script_name
                        )));
                    }
                    None => {}
                },
            }
        }

        let child_ctx = ctx
            .clone_scope()
            .with_parent(step.id.clone(), None);
        for (name, value) in bound_params {
            child_ctx.set_variable(name, value);
        }

        let (results, err) =
            execute_nested_steps(&self.registry, &fragment.steps, &child_ctx, &step.id, None, &NeverCancelled).await;

        if let Some(err) = err {
            return Err(err);
        }

        let mut returns = HashMap::new();
        for return_spec in &fragment.returns {
            let value = resolve_return_value(&return_spec.value, &child_ctx, &self.resolver);
            returns.insert(return_spec.name.clone(), value.clone());
            if let Some(outer_name) = config.results.get(&return_spec.name) {
                ctx.set_variable(outer_name.clone(), value);
            }
        }

        Ok(CallOutput {
            success: true,
            script: script_name.to_string(),
            returns,
            step_count: results.len(),
            duration_ms: wall_start.elapsed().as_millis() as u64,
            error: None,
        })
    }
}

/// Resolves a `Return.Value` template, preserving structure when the whole
/// string is a single `${path}` reference rather than stringifying it.
fn resolve_return_value(template: &str, ctx: &ExecutionContext, resolver: &VariableResolver) -> Value {
    let trimmed = template.trim();
    if trimmed.starts_with("${") && trimmed.ends_with('}') && trimmed.matches("${").count() == 1 {
        let path = &trimmed[2..trimmed.len() - 1];
        let eval_ctx = ctx.to_evaluation_context();
        let mut current = eval_ctx;
        for segment in path.split('.') {
            match current.as_object().and_then(|m| m.get(segment)) {
                Some(v) => current = v.clone(),
                None => return Value::String(resolver.resolve_string(template, ctx)),
            }
        }
        return current;
    }
    Value::String(resolver.resolve_string(template, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::create_success_result as ok_result;

    struct NoopExecutor;

    #[async_trait]
    impl crate::registry::Executor for NoopExecutor {
        fn step_type(&self) -> &str {
            "noop"
        }

        async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
            ctx.set_variable("touched", serde_json::json!(true));
            Ok(ok_result(step.id.clone(), chrono::Utc::now(), serde_json::json!({})))
        }
    }

    fn setup() -> (Arc<ExecutorRegistry>, Arc<InMemoryFragmentRegistry>, Arc<InMemoryCallStack>) {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor)).unwrap();
        let registry = Arc::new(registry);
        (registry, Arc::new(InMemoryFragmentRegistry::new()), Arc::new(InMemoryCallStack::new()))
    }

    #[tokio::test]
    async fn binds_params_and_maps_returns() {
        let (registry, fragments, call_stack) = setup();
        fragments.insert(
            "greet",
            Fragment {
                params: vec![ParamSpec { name: "name".to_string(), required: true, default: None }],
                steps: vec![Step::new("a", "noop")],
                returns: vec![ReturnSpec { name: "greeting".to_string(), value: "${name}".to_string() }],
            },
        );

        registry
            .register(Arc::new(CallExecutor::new(registry.clone(), fragments.clone(), call_stack.clone())))
            .unwrap();

        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("c1", "call").with_config(serde_json::json!({
            "script": "greet",
            "params": {"name": "ada"},
            "results": {"greeting": "outer_greeting"}
        }));

        let exec = registry.get("call").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(ctx.get_variable("outer_greeting"), Some(serde_json::json!("ada")));
        assert_eq!(ctx.get_variable("touched"), None, "child writes stay scoped to the child context");
    }

    #[tokio::test]
    async fn missing_required_param_is_config_error() {
        let (registry, fragments, call_stack) = setup();
        fragments.insert(
            "needs_param",
            Fragment {
                params: vec![ParamSpec { name: "x".to_string(), required: true, default: None }],
                steps: vec![],
                returns: vec![],
            },
        );
        registry
            .register(Arc::new(CallExecutor::new(registry.clone(), fragments.clone(), call_stack.clone())))
            .unwrap();
        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("c1", "call").with_config(serde_json::json!({"script": "needs_param"}));
        let exec = registry.get("call").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn s7_cycle_detection_restores_stack_depth() {
        let (registry, fragments, call_stack) = setup();
        registry
            .register(Arc::new(CallExecutor::new(registry.clone(), fragments.clone(), call_stack.clone())))
            .unwrap();

        let recursive_step = Step::new("inner", "call").with_config(serde_json::json!({"script": "a"}));
        fragments.insert(
            "a",
            Fragment {
                params: vec![],
                steps: vec![recursive_step],
                returns: vec![],
            },
        );

        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("c1", "call").with_config(serde_json::json!({"script": "a"}));
        let exec = registry.get("call").unwrap();
        let result = exec.execute(&step, &ctx).await.unwrap();
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("cycle"));
        assert!(!call_stack.contains("a"));
    }
}
