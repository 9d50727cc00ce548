// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP step pipeline: config-layer merge, variable substitution, URL
//! resolution, request execution, response capture, and processor
//! bracketing. `spec.md` §4.12.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ExecutionContext, LogEntry, VarScope};
use crate::error::{create_failed_result, create_timeout_result, OrchestratorError, Result};
use crate::processors::{ProcessorExecutor, ProcessorSpec};
use crate::step::{Step, StepResult, StepStatus};
use crate::variables::VariableResolver;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Engine-global defaults + named-domain base URLs, the third merge layer
/// (step > domain > global > defaults). `spec.md` §4.12.
#[derive(Debug, Clone)]
pub struct HttpGlobalConfig {
    pub base_url: Option<String>,
    pub domains: HashMap<String, String>,
    pub default_headers: HashMap<String, String>,
    pub ssl_verify: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for HttpGlobalConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            domains: HashMap::new(),
            default_headers: HashMap::new(),
            ssl_verify: true,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl HttpGlobalConfig {
    /// Reads `HTTP_BASE_URL` for the global base URL, mirroring the
    /// `from_env` idiom the provider crate uses for its own API base.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var("HTTP_BASE_URL") {
            config.base_url = Some(base_url);
        }
        config
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct Overrides {
    ssl_verify: Option<bool>,
    follow_redirects: Option<bool>,
    max_redirects: Option<usize>,
    connect_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum BodyConfig {
    Raw { content: String },
    Json { value: Value },
    Form { fields: HashMap<String, String> },
    UrlEncoded { fields: HashMap<String, String> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
struct HttpStepConfig {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    domain_base_url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    params: HashMap<String, String>,
    #[serde(default)]
    body: Option<BodyConfig>,
    #[serde(default)]
    overrides: Overrides,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize)]
struct ActualRequest {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpOutput {
    pub status_code: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub body_type: String,
    pub size: usize,
    pub duration_ms: u64,
    pub actual_request: ActualRequest,
    /// Auto-decoded `body` when the response declares a JSON content type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    pub console_logs: Vec<LogEntry>,
    pub assertions: Vec<LogEntry>,
}

pub struct HttpExecutor {
    default_client: Client,
    global: HttpGlobalConfig,
    resolver: VariableResolver,
    processor: Arc<dyn ProcessorExecutor>,
}

impl HttpExecutor {
    pub fn new(global: HttpGlobalConfig, processor: Arc<dyn ProcessorExecutor>) -> Self {
        let default_client = build_client(&global.ssl_verify, global.follow_redirects, global.max_redirects)
            .expect("default HTTP client configuration is always valid");
        Self {
            default_client,
            global,
            resolver: VariableResolver::new(),
            processor,
        }
    }

    fn client_for(&self, ssl_verify: bool, follow_redirects: bool, max_redirects: usize) -> Result<Client> {
        if ssl_verify == self.global.ssl_verify
            && follow_redirects == self.global.follow_redirects
            && max_redirects == self.global.max_redirects
        {
            return Ok(self.default_client.clone());
        }
        build_client(&ssl_verify, follow_redirects, max_redirects)
    }
}

fn build_client(ssl_verify: &bool, follow_redirects: bool, max_redirects: usize) -> Result<Client> {
    let redirect_policy = if follow_redirects {
        Policy::limited(max_redirects)
    } else {
        Policy::none()
    };
    Client::builder()
        .danger_accept_invalid_certs(!ssl_verify)
        .redirect(redirect_policy)
        .build()
        .map_err(|e| OrchestratorError::Init(format!("failed to build HTTP client: {e}")))
}

#[async_trait]
impl crate::registry::Executor for HttpExecutor {
    fn step_type(&self) -> &str {
        "http"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
        let start = chrono::Utc::now();
        let wall_start = Instant::now();

        // 1-2. Pre-processors run against the shared context; their
        // variable mutations are immediately visible to substitution below.
        for spec in &step.pre_processors {
            if let Err(e) = self.processor.run(spec, ctx).await {
                return Ok(create_failed_result(step.id.clone(), start, &e));
            }
        }

        // 3. Parse config.
        let config: HttpStepConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid http step configuration: {e}")),
                ))
            }
        };

        let method = match Method::from_bytes(config.method.to_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid HTTP method '{}'", config.method)),
                ))
            }
        };

        // 4. Substitute variables in url/headers/params/body.
        let eval_ctx = ctx.to_evaluation_context();
        let url_template = self.resolver.resolve_string_against(&config.url, &eval_ctx);
        let mut headers: HashMap<String, String> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), self.resolver.resolve_string_against(v, &eval_ctx)))
            .collect();
        let params: HashMap<String, String> = config
            .params
            .iter()
            .map(|(k, v)| (k.clone(), self.resolver.resolve_string_against(v, &eval_ctx)))
            .collect();
        let body = config.body.as_ref().map(|b| resolve_body(b, &self.resolver, &eval_ctx));

        // 5. Resolve the base URL.
        let resolved_url = resolve_url(&url_template, config.domain_base_url.as_deref(), config.domain.as_deref(), &self.global);

        // 6. Domain-level headers fill gaps only.
        if let Some(domain) = &config.domain {
            if let Some(_domain_base) = self.global.domains.get(domain) {
                for (k, v) in &self.global.default_headers {
                    headers.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        for (k, v) in &self.global.default_headers {
            headers.entry(k.clone()).or_insert_with(|| v.clone());
        }

        // 7. Resolve effective timeout and overrides.
        let ssl_verify = config.overrides.ssl_verify.unwrap_or(self.global.ssl_verify);
        let follow_redirects = config.overrides.follow_redirects.unwrap_or(self.global.follow_redirects);
        let max_redirects = config.overrides.max_redirects.unwrap_or(self.global.max_redirects);
        let request_timeout_ms = step
            .timeout
            .map(|d| d.as_millis() as u64)
            .or(config.overrides.request_timeout_ms)
            .unwrap_or(self.global.request_timeout_ms);

        let client = match self.client_for(ssl_verify, follow_redirects, max_redirects) {
            Ok(c) => c,
            Err(e) => return Ok(create_failed_result(step.id.clone(), start, &e)),
        };

        // 8. Build the request, capturing ActualRequest before sending.
        let mut builder = client.request(method.clone(), &resolved_url).query(
            &params.iter().collect::<Vec<_>>(),
        );
        for (k, v) in &headers {
            builder = builder.header(k, v);
        }
        let body_text = body.as_ref().map(|b| b.preview.clone());
        if let Some(body) = &body {
            builder = (body.apply)(builder);
        }

        let actual_request = ActualRequest {
            method: method.to_string(),
            url: resolved_url.clone(),
            headers: headers.clone(),
            body: body_text,
        };

        // 9. Execute under a hard deadline.
        let timeout = Duration::from_millis(request_timeout_ms);
        let send_result = tokio::time::timeout(timeout, builder.send()).await;

        let response = match send_result {
            Err(_) => {
                let mut result = create_timeout_result(step.id.clone(), start, timeout);
                result.output = serde_json::json!({"actual_request": actual_request});
                return Ok(result);
            }
            Ok(Err(e)) => {
                let err = OrchestratorError::Execution(format!("http request failed: {e}"));
                let mut result = create_failed_result(step.id.clone(), start, &err);
                result.output = serde_json::json!({"actual_request": actual_request});
                return Ok(result);
            }
            Ok(Ok(response)) => response,
        };

        // 10. Capture the response.
        let status_code = response.status().as_u16();
        let status_text = response.status().canonical_reason().unwrap_or("").to_string();
        let mut response_headers = HashMap::new();
        for (name, value) in response.headers().iter() {
            if !response_headers.contains_key(name.as_str()) {
                response_headers.insert(name.as_str().to_string(), value.to_str().unwrap_or("").to_string());
            }
        }
        let content_type = response_headers.get("content-type").cloned().unwrap_or_default();
        let body_type = detect_body_type(&content_type);

        let body_text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                let err = OrchestratorError::Execution(format!("failed to read response body: {e}"));
                let mut result = create_failed_result(step.id.clone(), start, &err);
                result.output = serde_json::json!({"actual_request": actual_request});
                return Ok(result);
            }
        };
        let size = body_text.len();
        let json_body = if body_type == "json" {
            serde_json::from_str::<Value>(&body_text).ok()
        } else {
            None
        };

        // 11. Post-processors run over a response view spliced into context.
        ctx.set_variable(
            "response",
            serde_json::json!({
                "statusCode": status_code,
                "statusText": status_text,
                "body": body_text,
                "headers": response_headers,
                "duration": wall_start.elapsed().as_millis() as u64,
            }),
        );
        for spec in &step.post_processors {
            if let Err(e) = self.processor.run(spec, ctx).await {
                return Ok(create_failed_result(step.id.clone(), start, &e));
            }
        }

        // 12. Snapshot + flush logs, extract assertions.
        ctx.create_variable_snapshot_with_env_vars(None);
        let logs = ctx.flush_logs();
        let assertions: Vec<LogEntry> = logs
            .iter()
            .filter(|l| matches!(l, LogEntry::AssertionResult { .. }))
            .cloned()
            .collect();

        let output = HttpOutput {
            status_code,
            status_text,
            headers: response_headers,
            body: body_text,
            body_type,
            size,
            duration_ms: wall_start.elapsed().as_millis() as u64,
            actual_request,
            json: json_body,
            console_logs: logs,
            assertions,
        };

        let status = if (200..400).contains(&status_code) {
            StepStatus::Success
        } else {
            StepStatus::Failed
        };

        let mut result = StepResult {
            step_id: step.id.clone(),
            status,
            start_time: start,
            end_time: chrono::Utc::now(),
            duration: wall_start.elapsed(),
            output: serde_json::to_value(&output).unwrap(),
            error: if status == StepStatus::Failed {
                Some(OrchestratorError::Execution(format!("http request returned status {status_code}")).detailed())
            } else {
                None
            },
            metrics: HashMap::new(),
        };
        result = result
            .with_metric("http_status", status_code as f64)
            .with_metric("http_response_size", size as f64)
            .with_metric("data_received", size as f64)
            .with_metric(
                "data_sent",
                output.actual_request.body.as_ref().map(|b| b.len()).unwrap_or(0) as f64,
            );

        Ok(result)
    }
}

fn resolve_url(url: &str, domain_base_url: Option<&str>, domain: Option<&str>, global: &HttpGlobalConfig) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    if let Some(base) = domain_base_url {
        return join_url(base, url);
    }
    if let Some(domain) = domain {
        if let Some(base) = global.domains.get(domain) {
            return join_url(base, url);
        }
    }
    match &global.base_url {
        Some(base) => join_url(base, url),
        None => url.to_string(),
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn detect_body_type(content_type: &str) -> String {
    let ct = content_type.to_lowercase();
    if ct.contains("json") {
        "json".to_string()
    } else if ct.contains("xml") {
        "xml".to_string()
    } else if ct.contains("html") {
        "html".to_string()
    } else {
        "text".to_string()
    }
}

struct ResolvedBody {
    preview: String,
    apply: Box<dyn Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync>,
}

fn resolve_body(config: &BodyConfig, resolver: &VariableResolver, eval_ctx: &Value) -> ResolvedBody {
    match config {
        BodyConfig::Raw { content } => {
            let resolved = resolver.resolve_string_against(content, eval_ctx);
            let preview = resolved.clone();
            ResolvedBody {
                preview,
                apply: Box::new(move |b| b.body(resolved.clone())),
            }
        }
        BodyConfig::Json { value } => {
            let resolved_value = resolve_value_against(value, resolver, eval_ctx);
            let preview = serde_json::to_string(&resolved_value).unwrap_or_default();
            ResolvedBody {
                preview,
                apply: Box::new(move |b| b.json(&resolved_value)),
            }
        }
        BodyConfig::Form { fields } => {
            let resolved: HashMap<String, String> = fields
                .iter()
                .map(|(k, v)| (k.clone(), resolver.resolve_string_against(v, eval_ctx)))
                .collect();
            let preview = serde_json::to_string(&resolved).unwrap_or_default();
            ResolvedBody {
                preview,
                apply: Box::new(move |b| b.form(&resolved)),
            }
        }
        BodyConfig::UrlEncoded { fields } => {
            let resolved: HashMap<String, String> = fields
                .iter()
                .map(|(k, v)| (k.clone(), resolver.resolve_string_against(v, eval_ctx)))
                .collect();
            let preview = serde_urlencoded::to_string(&resolved).unwrap_or_default();
            ResolvedBody {
                preview,
                apply: Box::new(move |b| {
                    b.header("content-type", "application/x-www-form-urlencoded")
                        .body(serde_urlencoded::to_string(&resolved).unwrap_or_default())
                }),
            }
        }
    }
}

fn resolve_value_against(value: &Value, resolver: &VariableResolver, eval_ctx: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(resolver.resolve_string_against(s, eval_ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value_against(v, resolver, eval_ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value_against(v, resolver, eval_ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::DefaultProcessorExecutor;

    fn executor() -> HttpExecutor {
        HttpExecutor::new(HttpGlobalConfig::default(), Arc::new(DefaultProcessorExecutor::new()))
    }

    #[tokio::test]
    async fn get_request_against_mock_server_captures_json_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/widgets/1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "1", "name": "gizmo"}"#)
            .create_async()
            .await;

        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("h1", "http").with_config(serde_json::json!({
            "method": "GET",
            "url": format!("{}/widgets/1", server.url()),
        }));

        let exec = executor();
        let result = exec.execute(&step, &ctx).await.unwrap();
        mock.assert_async().await;
        assert!(result.is_success());
        assert_eq!(result.metrics["http_status"], 200.0);

        let output: HttpOutput = serde_json::from_value(result.output).unwrap();
        assert_eq!(output.body_type, "json");
        assert_eq!(output.json.unwrap()["name"], serde_json::json!("gizmo"));
    }

    #[tokio::test]
    async fn non_2xx_status_is_reported_as_failed() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/missing").with_status(404).create_async().await;

        let ctx = ExecutionContext::new("wf", "exec");
        let step = Step::new("h1", "http").with_config(serde_json::json!({
            "method": "GET",
            "url": format!("{}/missing", server.url()),
        }));

        let result = executor().execute(&step, &ctx).await.unwrap();
        assert!(!result.is_success());
        assert_eq!(result.metrics["http_status"], 404.0);
    }

    #[tokio::test]
    async fn variables_are_substituted_into_url() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/items/42").with_status(200).with_body("ok").create_async().await;

        let ctx = ExecutionContext::new("wf", "exec");
        ctx.set_variable("item_id", serde_json::json!(42));
        let step = Step::new("h1", "http").with_config(serde_json::json!({
            "method": "GET",
            "url": format!("{}/items/${{item_id}}", server.url()),
        }));

        let result = executor().execute(&step, &ctx).await.unwrap();
        assert!(result.is_success());
    }

    #[test]
    fn url_resolution_prefers_absolute_over_domain() {
        let global = HttpGlobalConfig {
            base_url: Some("https://fallback.example".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_url("https://absolute.example/x", None, None, &global),
            "https://absolute.example/x"
        );
        assert_eq!(resolve_url("/x", None, None, &global), "https://fallback.example/x");
    }

    #[test]
    fn named_domain_wins_over_base_url() {
        let mut global = HttpGlobalConfig {
            base_url: Some("https://fallback.example".to_string()),
            ..Default::default()
        };
        global.domains.insert("billing".to_string(), "https://billing.example".to_string());
        assert_eq!(
            resolve_url("/accounts", None, Some("billing"), &global),
            "https://billing.example/accounts"
        );
        assert_eq!(
            resolve_url("/accounts", None, Some("unknown"), &global),
            "https://fallback.example/accounts"
        );
    }
}
