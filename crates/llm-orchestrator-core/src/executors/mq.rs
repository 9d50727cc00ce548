// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message queue executor: adapter-contract-only per `spec.md` §4.15.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{create_failed_result, create_success_result, create_timeout_result, OrchestratorError, Result};
use crate::processors::ProcessorExecutor;
use crate::registry::Executor;
use crate::step::{Step, StepResult};
use crate::variables::VariableResolver;

/// Per-driver interface a hosting application implements for its message
/// broker of choice. `spec.md` §4.15.
#[async_trait]
pub trait MqDriver: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn publish(&self, topic: &str, payload: &Value) -> Result<()>;
    async fn consume(&self, topic: &str, max_messages: usize) -> Result<Vec<Value>>;
    async fn close(&self) -> Result<()>;
    async fn is_connected(&self) -> bool;
}

fn default_max_messages() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum MqAction {
    Connect,
    Publish {
        topic: String,
        payload: Value,
    },
    Consume {
        topic: String,
        #[serde(default = "default_max_messages")]
        max_messages: usize,
    },
    Close,
    IsConnected,
}

pub struct MessageQueueExecutor {
    driver: Arc<dyn MqDriver>,
    processor: Arc<dyn ProcessorExecutor>,
    resolver: VariableResolver,
}

impl MessageQueueExecutor {
    pub fn new(driver: Arc<dyn MqDriver>, processor: Arc<dyn ProcessorExecutor>) -> Self {
        Self { driver, processor, resolver: VariableResolver::new() }
    }
}

#[async_trait]
impl Executor for MessageQueueExecutor {
    fn step_type(&self) -> &str {
        "message_queue"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
        let start = chrono::Utc::now();
        let wall_start = Instant::now();

        for spec in &step.pre_processors {
            if let Err(e) = self.processor.run(spec, ctx).await {
                return Ok(create_failed_result(step.id.clone(), start, &e));
            }
        }

        let resolved_config = self.resolver.resolve_value(&step.config, ctx);
        let action: MqAction = match serde_json::from_value(resolved_config) {
            Ok(a) => a,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid message_queue step configuration: {e}")),
                ))
            }
        };

        let timeout = step.timeout.unwrap_or(std::time::Duration::from_secs(30));
        let outcome = tokio::time::timeout(timeout, run_action(self.driver.as_ref(), &action)).await;

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
        .with_metric("mq_duration_ms", wall_start.elapsed().as_millis() as f64))
    }
}

async fn run_action(driver: &dyn MqDriver, action: &MqAction) -> Result<Value> {
    match action {
        MqAction::Connect => {
            driver.connect().await?;
            Ok(Value::Bool(true))
        }
        MqAction::Publish { topic, payload } => {
            driver.publish(topic, payload).await?;
            Ok(Value::Bool(true))
        }
        MqAction::Consume { topic, max_messages } => {
            driver.consume(topic, *max_messages).await.map(Value::Array)
        }
        MqAction::Close => {
            driver.close().await?;
            Ok(Value::Bool(true))
        }
        MqAction::IsConnected => Ok(Value::Bool(driver.is_connected().await)),
    }
}
