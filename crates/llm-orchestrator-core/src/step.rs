// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The authoring data model: `Step`, its outcome `StepResult`, and the
//! overlays (`Condition`, `Loop`) that give control-flow steps their
//! classical (non-chained) shape.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What an executor should do when its own `StepResult` is not `success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Stop the enclosing scope and return the error (default).
    #[default]
    Abort,
    /// Record the failure and move on to the next sibling.
    Continue,
    /// Stop the enclosing scope silently; not reported as a failure.
    Skip,
}

/// Classical condition overlay: `Step.Condition` in `spec.md` §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub expression: String,
    #[serde(default)]
    pub then: Vec<Step>,
    #[serde(default)]
    pub else_if: Vec<ElseIfBranch>,
    #[serde(default)]
    pub r#else: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElseIfBranch {
    pub condition: String,
    pub steps: Vec<Step>,
}

/// Loop mode selector, see `spec.md` §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    For,
    Foreach,
    While,
}

/// Loop overlay: `Step.Loop` in `spec.md` §4.8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    pub mode: LoopMode,
    /// Body steps executed each iteration.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// `for` mode: number of iterations.
    #[serde(default)]
    pub count: Option<i64>,
    /// `foreach` mode: literal list, `${path}` reference, or scalar.
    #[serde(default)]
    pub items: Option<serde_json::Value>,
    /// `foreach` mode: name bound to the current item (default `item`).
    #[serde(default)]
    pub item_var: Option<String>,
    /// `foreach`/`for` mode: name bound to the current index.
    #[serde(default)]
    pub index_var: Option<String>,
    /// `while` mode: expression re-evaluated each round.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub break_condition: Option<String>,
    #[serde(default)]
    pub continue_condition: Option<String>,
    /// Guard against runaway `while` loops; default 1000.
    #[serde(default)]
    pub max_iterations: Option<u64>,
    /// Label used to target this loop from a nested `break`/`continue`.
    #[serde(default)]
    pub label: Option<String>,
}

/// An authoring unit: immutable once parsed, consumed by exactly one
/// registered [`crate::registry::Executor`] by `step_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub step_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub on_error: OnError,
    /// Open mapping consumed by the executor named by `step_type`.
    #[serde(default = "default_config")]
    pub config: serde_json::Value,
    #[serde(default)]
    pub children: Vec<Step>,
    #[serde(default)]
    pub pre_processors: Vec<crate::processors::ProcessorSpec>,
    #[serde(default)]
    pub post_processors: Vec<crate::processors::ProcessorSpec>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default, rename = "loop")]
    pub loop_: Option<Loop>,
}

fn default_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Step {
    /// Minimal builder used heavily by tests and embedders constructing
    /// steps programmatically rather than from parsed YAML/JSON.
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            name: None,
            disabled: false,
            timeout: None,
            on_error: OnError::default(),
            config: default_config(),
            children: Vec::new(),
            pre_processors: Vec::new(),
            post_processors: Vec::new(),
            condition: None,
            loop_: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_children(mut self, children: Vec<Step>) -> Self {
        self.children = children;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_loop(mut self, loop_: Loop) -> Self {
        self.loop_ = Some(loop_);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }
}

/// Execution status of a completed step. `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Timeout,
    Skipped,
}

/// Outcome record for a single step execution. `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub duration: Duration,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub metrics: HashMap<String, f64>,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}
