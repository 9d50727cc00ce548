// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-run mutable execution scope: concurrent-safe variables, step
//! results, log collection, and the deep/shallow clone semantics nested
//! scopes rely on. `spec.md` §3, §4.3, §5.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::step::{Step, StepResult};

/// Variable scope partition used by variable-change tracking and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarScope {
    Env,
    Temp,
}

/// Tagged log entry variants collected during a run. `spec.md` §3.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    /// Free-text emitted by scripts.
    Console { message: String },
    /// A pre/post-processor execution record.
    Processor {
        id: String,
        name: String,
        processor_type: String,
        success: bool,
        message: Option<String>,
        output: Value,
    },
    /// A tracked variable mutation.
    VariableChange {
        name: String,
        old_value: Option<Value>,
        new_value: Value,
        scope: VarScope,
        source: String,
    },
    /// A point-in-time partition of variables into env/temp sets.
    Snapshot {
        env: HashMap<String, Value>,
        temp: HashMap<String, Value>,
    },
    /// Derived from a `Processor` entry whose `processor_type == "assertion"`.
    AssertionResult {
        id: String,
        name: String,
        success: bool,
        message: Option<String>,
    },
}

/// Observer hooks an embedding engine may register on [`ExecutionContext`].
/// `spec.md` §6.
#[async_trait]
pub trait ExecutionCallback: Send + Sync {
    async fn on_step_start(&self, step: &Step, parent_id: Option<&str>, iteration: Option<u64>) {
        let _ = (step, parent_id, iteration);
    }
    async fn on_step_complete(
        &self,
        step: &Step,
        result: &StepResult,
        parent_id: Option<&str>,
        iteration: Option<u64>,
    ) {
        let _ = (step, result, parent_id, iteration);
    }
    async fn on_step_failed(
        &self,
        step: &Step,
        error: &crate::error::OrchestratorError,
        duration: std::time::Duration,
        parent_id: Option<&str>,
        iteration: Option<u64>,
    ) {
        let _ = (step, error, duration, parent_id, iteration);
    }
    async fn on_step_skipped(
        &self,
        step: &Step,
        reason: &str,
        parent_id: Option<&str>,
        iteration: Option<u64>,
    ) {
        let _ = (step, reason, parent_id, iteration);
    }
    async fn on_progress(&self, index: usize, total: usize, name: &str) {
        let _ = (index, total, name);
    }
}

/// A callback that additionally understands AI tool-call round events.
/// `spec.md` §6, consumed by the tool-call loop (§4.13).
#[async_trait]
pub trait AiToolCallback: ExecutionCallback {
    async fn on_ai_chunk(&self, step_id: &str, text: &str, index: usize) {
        let _ = (step_id, text, index);
    }
    async fn on_ai_complete(&self, step_id: &str, result: &Value) {
        let _ = (step_id, result);
    }
    async fn on_ai_error(&self, step_id: &str, error: &crate::error::OrchestratorError) {
        let _ = (step_id, error);
    }
    /// Delivers a human-interaction request and blocks for a response.
    async fn on_ai_interaction_required(
        &self,
        step_id: &str,
        request: &InteractionRequest,
    ) -> crate::error::Result<InteractionResponse>;

    async fn on_ai_tool_call_start(&self, step_id: &str, call: &crate::executors::ai::ToolCall) {
        let _ = (step_id, call);
    }
    async fn on_ai_tool_call_complete(
        &self,
        step_id: &str,
        call: &crate::executors::ai::ToolCall,
        result: &crate::executors::ai::ToolResult,
    ) {
        let _ = (step_id, call, result);
    }
}

/// `human_interaction` tool request payload. `spec.md` §4.13.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InteractionRequest {
    pub kind: InteractionKind,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Confirm,
    Input,
    Select,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InteractionResponse {
    pub skipped: bool,
    pub value: String,
}

struct Inner {
    variables: HashMap<String, Value>,
    results: HashMap<String, StepResult>,
    logs: Vec<LogEntry>,
    env_vars: std::collections::HashSet<String>,
}

/// The mutable per-run scope passed to every executor.
///
/// All public operations acquire the single internal lock; nested
/// operations that would otherwise call several methods (e.g.
/// "set then log") do so through one locked critical section rather than
/// holding the lock across any I/O (`spec.md` §5).
pub struct ExecutionContext {
    inner: RwLock<Inner>,
    pub vu: u64,
    pub iteration: u64,
    pub workflow_id: String,
    pub execution_id: String,
    pub parent_step_id: Option<String>,
    pub loop_iteration: Option<u64>,
    pub callback: Option<Arc<dyn ExecutionCallback>>,
    /// Separate slot for a tool-aware callback, since `dyn ExecutionCallback`
    /// cannot be downcast to `dyn AiToolCallback`. Only the AI tool-call loop
    /// (§4.13) consults this. `with_callback` and `with_ai_callback` may both
    /// be set to the same object wrapped in two `Arc`s if the caller wants
    /// both sets of hooks delivered.
    pub ai_callback: Option<Arc<dyn AiToolCallback>>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                variables: HashMap::new(),
                results: HashMap::new(),
                logs: Vec::new(),
                env_vars: std::collections::HashSet::new(),
            }),
            vu: 0,
            iteration: 0,
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
            parent_step_id: None,
            loop_iteration: None,
            callback: None,
            ai_callback: None,
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn ExecutionCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_ai_callback(mut self, callback: Arc<dyn AiToolCallback>) -> Self {
        self.ai_callback = Some(callback);
        self
    }

    pub fn with_variables(self, vars: HashMap<String, Value>) -> Self {
        self.inner.write().variables = vars;
        self
    }

    // -- variables ---------------------------------------------------

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.inner.write().variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.inner.read().variables.get(name).cloned()
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.inner.read().variables.contains_key(name)
    }

    pub fn all_variables(&self) -> HashMap<String, Value> {
        self.inner.read().variables.clone()
    }

    /// Atomic set plus a `variable_change` log entry (`spec.md` §4.3).
    pub fn set_variable_with_tracking(
        &self,
        name: impl Into<String>,
        value: Value,
        scope: VarScope,
        source: impl Into<String>,
    ) {
        let name = name.into();
        let mut inner = self.inner.write();
        let old_value = inner.variables.get(&name).cloned();
        inner.variables.insert(name.clone(), value.clone());
        if matches!(scope, VarScope::Env) {
            inner.env_vars.insert(name.clone());
        }
        inner.logs.push(LogEntry::VariableChange {
            name,
            old_value,
            new_value: value,
            scope,
            source: source.into(),
        });
    }

    pub fn mark_as_env_var(&self, name: impl Into<String>) {
        self.inner.write().env_vars.insert(name.into());
    }

    pub fn is_env_var(&self, name: &str) -> bool {
        self.inner.read().env_vars.contains(name)
    }

    // -- results -------------------------------------------------------

    pub fn set_result(&self, step_id: impl Into<String>, result: StepResult) {
        self.inner.write().results.insert(step_id.into(), result);
    }

    pub fn get_result(&self, step_id: &str) -> Option<StepResult> {
        self.inner.read().results.get(step_id).cloned()
    }

    pub fn all_results(&self) -> HashMap<String, StepResult> {
        self.inner.read().results.clone()
    }

    // -- logs ------------------------------------------------------------

    pub fn append_log(&self, entry: LogEntry) {
        self.inner.write().logs.push(entry);
    }

    pub fn append_logs(&self, entries: impl IntoIterator<Item = LogEntry>) {
        self.inner.write().logs.extend(entries);
    }

    /// Returns and clears all currently-collected logs.
    pub fn flush_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.inner.write().logs)
    }

    /// Peeks the currently-collected logs without clearing them.
    pub fn get_logs(&self) -> Vec<LogEntry> {
        self.inner.read().logs.clone()
    }

    /// Emits a `snapshot` entry partitioning current variables into env vs
    /// temp sets, merging `extra` into the env partition if provided.
    pub fn create_variable_snapshot_with_env_vars(&self, extra: Option<HashMap<String, Value>>) {
        let mut inner = self.inner.write();
        let mut env = HashMap::new();
        let mut temp = HashMap::new();
        for (name, value) in inner.variables.iter() {
            if inner.env_vars.contains(name) {
                env.insert(name.clone(), value.clone());
            } else {
                temp.insert(name.clone(), value.clone());
            }
        }
        if let Some(extra) = extra {
            env.extend(extra);
        }
        inner.logs.push(LogEntry::Snapshot { env, temp });
    }

    // -- cloning -----------------------------------------------------------

    /// Deep-copies `variables`, shallow-copies `results`, clones the log
    /// collector. Mutations on the clone are never observable in `self`.
    pub fn clone_scope(&self) -> Self {
        let inner = self.inner.read();
        Self {
            inner: RwLock::new(Inner {
                variables: deep_clone_map(&inner.variables),
                results: inner.results.clone(),
                logs: inner.logs.clone(),
                env_vars: inner.env_vars.clone(),
            }),
            vu: self.vu,
            iteration: self.iteration,
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id.clone(),
            parent_step_id: self.parent_step_id.clone(),
            loop_iteration: self.loop_iteration,
            callback: self.callback.clone(),
            ai_callback: self.ai_callback.clone(),
        }
    }

    pub fn with_parent(mut self, parent_step_id: impl Into<String>, iteration: Option<u64>) -> Self {
        self.parent_step_id = Some(parent_step_id.into());
        self.loop_iteration = iteration;
        self
    }

    /// Merges variable-change log entries recorded in a child scope (e.g. a
    /// `parallel` worker) back into `self`, re-applying only env-scoped
    /// writes as the spec's §4.10 ordering guarantee requires.
    pub fn absorb_env_writes_from(&self, child: &ExecutionContext) {
        let child_inner = child.inner.read();
        for (name, value) in child_inner.variables.iter() {
            if child_inner.env_vars.contains(name) {
                self.set_variable_with_tracking(
                    name.clone(),
                    value.clone(),
                    VarScope::Env,
                    "parallel-join".to_string(),
                );
            }
        }
    }

    /// Materializes a flat mapping suitable for variable resolution and
    /// expression evaluation (`spec.md` §4.1/§4.2/§4.3).
    pub fn to_evaluation_context(&self) -> Value {
        let inner = self.inner.read();
        let mut root = serde_json::Map::new();
        for (name, value) in inner.variables.iter() {
            root.insert(name.clone(), value.clone());
        }

        let mut results = serde_json::Map::new();
        for (step_id, result) in inner.results.iter() {
            let mut entry = serde_json::Map::new();
            entry.insert("status".to_string(), serde_json::json!(result.status));
            entry.insert(
                "duration".to_string(),
                serde_json::json!(result.duration.as_millis() as u64),
            );
            entry.insert("output".to_string(), result.output.clone());
            entry.insert("step_id".to_string(), serde_json::json!(result.step_id));
            entry.insert("start_time".to_string(), serde_json::json!(result.start_time));
            entry.insert("end_time".to_string(), serde_json::json!(result.end_time));
            if let Some(err) = &result.error {
                entry.insert("error".to_string(), serde_json::json!(err));
            }
            if !result.metrics.is_empty() {
                entry.insert("metrics".to_string(), serde_json::json!(result.metrics));
            }

            // Flat-splice output object keys at the top level of the sub-mapping.
            if let Value::Object(map) = &result.output {
                for (k, v) in map.iter() {
                    entry.entry(k.clone()).or_insert_with(|| v.clone());
                }
                // HTTP-shaped outputs additionally expose these at top level.
                for key in ["status_code", "body", "headers"] {
                    if let Some(v) = map.get(key) {
                        entry.entry(key.to_string()).or_insert_with(|| v.clone());
                    }
                }
            }

            results.insert(step_id.clone(), Value::Object(entry));
        }
        root.insert("steps".to_string(), Value::Object(results.clone()));
        // Also expose step results at top level under their own id, since
        // `${step_id.field}` is a common authoring shortcut alongside
        // `${steps.step_id.field}`.
        for (step_id, value) in results {
            root.entry(step_id).or_insert(value);
        }

        root.insert(
            "loop".to_string(),
            inner
                .variables
                .get("loop")
                .cloned()
                .unwrap_or(Value::Null),
        );

        Value::Object(root)
    }
}

fn deep_clone_map(map: &HashMap<String, Value>) -> HashMap<String, Value> {
    // serde_json::Value's Clone is already a deep/structural clone; this
    // wrapper exists to make the deep-copy contract explicit at the call
    // site and as the one place to special-case non-JSON payloads in the
    // future.
    map.clone()
}
