// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database executor: adapter-contract-only per `spec.md` §4.15. The
//! executor dispatches a step's configured action to an injected
//! [`DbDriver`] implemented by the hosting application, enforces the
//! step's timeout, resolves variables, and packages the result.

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

/// Per-driver interface a hosting application implements for its database
/// of choice. `spec.md` §4.15.
#[async_trait]
pub trait DbDriver: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Value>;
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Value>;
    async fn count(&self, table: &str, filter: &Value) -> Result<i64>;
    async fn exists(&self, table: &str, filter: &Value) -> Result<bool>;
    async fn begin_tx(&self) -> Result<String>;
    async fn commit_tx(&self, tx_id: &str) -> Result<()>;
    async fn rollback_tx(&self, tx_id: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum DbAction {
    Connect,
    Query {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    Execute {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    Count {
        table: String,
        #[serde(default)]
        filter: Value,
    },
    Exists {
        table: String,
        #[serde(default)]
        filter: Value,
    },
    BeginTx,
    CommitTx {
        tx_id: String,
    },
    RollbackTx {
        tx_id: String,
    },
    Close,
}

pub struct DatabaseExecutor {
    driver: Arc<dyn DbDriver>,
    processor: Arc<dyn ProcessorExecutor>,
    resolver: VariableResolver,
}

impl DatabaseExecutor {
    pub fn new(driver: Arc<dyn DbDriver>, processor: Arc<dyn ProcessorExecutor>) -> Self {
        Self { driver, processor, resolver: VariableResolver::new() }
    }
}

#[async_trait]
impl Executor for DatabaseExecutor {
    fn step_type(&self) -> &str {
        "database"
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
        let action: DbAction = match serde_json::from_value(resolved_config) {
            Ok(a) => a,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid database step configuration: {e}")),
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
        .with_metric("db_duration_ms", wall_start.elapsed().as_millis() as f64))
    }
}

async fn run_action(driver: &dyn DbDriver, action: &DbAction) -> Result<Value> {
    match action {
        DbAction::Connect => {
            driver.connect().await?;
            Ok(Value::Bool(true))
        }
        DbAction::Query { sql, params } => driver.query(sql, params).await,
        DbAction::Execute { sql, params } => driver.execute(sql, params).await,
        DbAction::Count { table, filter } => driver.count(table, filter).await.map(|n| serde_json::json!(n)),
        DbAction::Exists { table, filter } => driver.exists(table, filter).await.map(Value::Bool),
        DbAction::BeginTx => driver.begin_tx().await.map(Value::String),
        DbAction::CommitTx { tx_id } => {
            driver.commit_tx(tx_id).await?;
            Ok(Value::Bool(true))
        }
        DbAction::RollbackTx { tx_id } => {
            driver.rollback_tx(tx_id).await?;
            Ok(Value::Bool(true))
        }
        DbAction::Close => {
            driver.close().await?;
            Ok(Value::Bool(true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::DefaultProcessorExecutor;

    struct FakeDb;

    #[async_trait]
    impl DbDriver for FakeDb {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn query(&self, sql: &str, _params: &[Value]) -> Result<Value> {
            Ok(serde_json::json!({"rows": [], "sql": sql}))
        }
        async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<Value> {
            Ok(serde_json::json!({"rows_affected": 1}))
        }
        async fn count(&self, _table: &str, _filter: &Value) -> Result<i64> {
            Ok(3)
        }
        async fn exists(&self, _table: &str, _filter: &Value) -> Result<bool> {
            Ok(true)
        }
        async fn begin_tx(&self) -> Result<String> {
            Ok("tx-1".to_string())
        }
        async fn commit_tx(&self, _tx_id: &str) -> Result<()> {
            Ok(())
        }
        async fn rollback_tx(&self, _tx_id: &str) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn executor() -> DatabaseExecutor {
        DatabaseExecutor::new(Arc::new(FakeDb), Arc::new(DefaultProcessorExecutor::new()))
    }

    #[tokio::test]
    async fn query_action_returns_rows() {
        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("s1", "database")
            .with_config(serde_json::json!({"action": "query", "sql": "select 1"}));
        let result = executor().execute(&step, &ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.output["result"]["sql"], "select 1");
    }

    #[tokio::test]
    async fn count_action_returns_integer() {
        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("s1", "database").with_config(serde_json::json!({"action": "count", "table": "users"}));
        let result = executor().execute(&step, &ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.output["result"], 3);
    }

    #[tokio::test]
    async fn invalid_action_fails_with_config_error() {
        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("s1", "database").with_config(serde_json::json!({"action": "bogus"}));
        let result = executor().execute(&step, &ctx).await.unwrap();
        assert!(!result.is_success());
        assert!(result.error.unwrap().starts_with("[CONFIG]"));
    }
}
