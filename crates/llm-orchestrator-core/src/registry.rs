// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Executor registry: name-indexed lookup of the runtime realization of
//! each step type, guarded by a reader/writer lock. `spec.md` §4.5, §6.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::step::{Step, StepResult};

/// The contract every step kind must honor. `spec.md` §6.
///
/// A non-`Ok` return from `execute` is reserved for cancellation: all other
/// failures must be encoded in the returned [`StepResult`] (`status !=
/// success`), never surfaced as an `Err`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The registry key this executor answers to, e.g. `"http"`.
    fn step_type(&self) -> &str;

    /// One-time setup from this executor's type-keyed sub-config.
    async fn init(&self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Runs `step` under `ctx`, returning its outcome.
    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult>;

    /// Releases any resources acquired by `init`.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Name-indexed executor lookup. Cheap to clone (wraps an `Arc`-backed map).
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Arc<DashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: Arc::new(DashMap::new()),
        }
    }

    /// Registers `executor`. Fails if the type name is already taken.
    pub fn register(&self, executor: Arc<dyn Executor>) -> Result<()> {
        let key = executor.step_type().to_string();
        if self.executors.contains_key(&key) {
            return Err(OrchestratorError::Config(format!(
                "executor already registered for step type '{key}'"
            )));
        }
        self.executors.insert(key, executor);
        Ok(())
    }

    /// Registers `executor`, panicking on a duplicate. Intended for
    /// init-time registration by executor packages, mirroring the
    /// teacher's `MustRegister` idiom for process-global wiring.
    pub fn must_register(&self, executor: Arc<dyn Executor>) {
        self.register(executor)
            .expect("duplicate executor registration");
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(step_type).map(|e| e.clone())
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    /// Invokes every executor's `init` with its type-keyed sub-config,
    /// stored under its `step_type` key in `configs`. Missing keys get an
    /// empty object.
    pub async fn init_all(
        &self,
        configs: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let empty = serde_json::Value::Object(serde_json::Map::new());
        for entry in self.executors.iter() {
            let config = configs.get(entry.key()).unwrap_or(&empty);
            entry
                .value()
                .init(config)
                .await
                .map_err(|e| OrchestratorError::Init(format!("{}: {e}", entry.key())))?;
        }
        Ok(())
    }

    /// Invokes every executor's `cleanup`, continuing past failures and
    /// remembering the last error encountered.
    pub async fn cleanup_all(&self) -> Result<()> {
        let mut last_err = None;
        for entry in self.executors.iter() {
            if let Err(e) = entry.value().cleanup().await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
