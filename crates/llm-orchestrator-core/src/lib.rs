// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # LLM Orchestrator Core
//!
//! The workflow step-execution core: a pluggable engine that executes a
//! graph of heterogeneous steps (HTTP, scripts, database/message-queue/
//! socket I/O, LLM tool-calling, conditionals, loops, parallel blocks, and
//! sub-workflow calls) against a shared [`context::ExecutionContext`].
//!
//! This crate is a library, not a runnable engine: an embedding application
//! builds an [`registry::ExecutorRegistry`], registers the executors it
//! needs (wiring in whatever database/MQ/socket drivers, script runtimes,
//! and LLM provider factories its deployment requires), and drives step
//! execution by looking up `step.step_type` in the registry, exactly as
//! `spec.md` §2 describes. DAG scheduling, workflow parsing/persistence,
//! and any admin surface are the embedder's concern.
//!
//! ## Wiring example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use llm_orchestrator_core::context::ExecutionContext;
//! use llm_orchestrator_core::executors::{condition::ConditionExecutor, http::HttpExecutor, loop_exec::LoopExecutor};
//! use llm_orchestrator_core::executors::http::HttpGlobalConfig;
//! use llm_orchestrator_core::processors::DefaultProcessorExecutor;
//! use llm_orchestrator_core::registry::ExecutorRegistry;
//!
//! # async fn wire() -> llm_orchestrator_core::error::Result<()> {
//! let registry = Arc::new(ExecutorRegistry::new());
//! let processor = Arc::new(DefaultProcessorExecutor::new());
//! registry.register(Arc::new(HttpExecutor::new(HttpGlobalConfig::default(), processor.clone())))?;
//! registry.register(Arc::new(ConditionExecutor::new(registry.clone())))?;
//! registry.register(Arc::new(LoopExecutor::new(registry.clone())))?;
//!
//! let ctx = ExecutionContext::new("workflow-1", "execution-1");
//! # let _ = ctx;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod executors;
pub mod expression;
pub mod processors;
pub mod providers;
pub mod registry;
pub mod step;
pub mod variables;

pub use context::ExecutionContext;
pub use error::{OrchestratorError, Result};
pub use registry::{Executor, ExecutorRegistry};
pub use step::{Step, StepResult, StepStatus};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
