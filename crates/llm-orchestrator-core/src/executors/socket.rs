// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw socket executor: adapter-contract-only per `spec.md` §4.15. Unlike
//! the HTTP client pool or the shared MCP/DB/MQ drivers, the socket
//! executor owns exactly one connection per executor instance, opened and
//! closed by explicit `connect`/`close` actions (`spec.md` §5).

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

/// Per-driver interface a hosting application implements for its socket
/// transport of choice. `spec.md` §4.15.
#[async_trait]
pub trait SocketDriver: Send + Sync {
    async fn connect(&self, address: &str) -> Result<()>;
    async fn send(&self, data: &str) -> Result<()>;
    async fn receive(&self) -> Result<String>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum SocketAction {
    Connect { address: String },
    Send { data: String },
    Receive,
    Close,
}

pub struct SocketExecutor {
    driver: Arc<dyn SocketDriver>,
    processor: Arc<dyn ProcessorExecutor>,
    resolver: VariableResolver,
}

impl SocketExecutor {
    pub fn new(driver: Arc<dyn SocketDriver>, processor: Arc<dyn ProcessorExecutor>) -> Self {
        Self { driver, processor, resolver: VariableResolver::new() }
    }
}

#[async_trait]
impl Executor for SocketExecutor {
    fn step_type(&self) -> &str {
        "socket"
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
        let action: SocketAction = match serde_json::from_value(resolved_config) {
            Ok(a) => a,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid socket step configuration: {e}")),
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
        .with_metric("socket_duration_ms", wall_start.elapsed().as_millis() as f64))
    }
}

async fn run_action(driver: &dyn SocketDriver, action: &SocketAction) -> Result<Value> {
    match action {
        SocketAction::Connect { address } => {
            driver.connect(address).await?;
            Ok(Value::Bool(true))
        }
        SocketAction::Send { data } => {
            driver.send(data).await?;
            Ok(Value::Bool(true))
        }
        SocketAction::Receive => driver.receive().await.map(Value::String),
        SocketAction::Close => {
            driver.close().await?;
            Ok(Value::Bool(true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::DefaultProcessorExecutor;
    use parking_lot::Mutex;

    struct FakeSocket {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SocketDriver for FakeSocket {
        async fn connect(&self, _address: &str) -> Result<()> {
            Ok(())
        }
        async fn send(&self, data: &str) -> Result<()> {
            self.sent.lock().push(data.to_string());
            Ok(())
        }
        async fn receive(&self) -> Result<String> {
            Ok("pong".to_string())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn executor() -> (SocketExecutor, Arc<FakeSocket>) {
        let driver = Arc::new(FakeSocket { sent: Mutex::new(Vec::new()) });
        (SocketExecutor::new(driver.clone(), Arc::new(DefaultProcessorExecutor::new())), driver)
    }

    #[tokio::test]
    async fn send_then_receive() {
        let (exec, driver) = executor();
        let ctx = ExecutionContext::new("wf", "exec");
        let send_step = Step::new("s1", "socket").with_config(serde_json::json!({"action": "send", "data": "ping"}));
        let result = exec.execute(&send_step, &ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(driver.sent.lock().as_slice(), ["ping"]);

        let recv_step = Step::new("s2", "socket").with_config(serde_json::json!({"action": "receive"}));
        let result = exec.execute(&recv_step, &ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.output["result"], "pong");
    }
}
