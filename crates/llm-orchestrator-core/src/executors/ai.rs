// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM tool-call loop: the most intricate state machine in the repo.
//! `spec.md` §4.13.
//!
//! An `ai` step either makes a single direct completion call (no tools
//! configured) or drives a multi-round model <-> tool dialogue: the model
//! proposes tool calls, this executor dispatches them concurrently, splices
//! the results back into the message history in the model's original
//! emission order, and loops until the model stops asking for tools or the
//! round budget runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ExecutionContext, InteractionKind, InteractionRequest, LogEntry};
use crate::error::{create_failed_result, create_success_result, OrchestratorError, Result};
use crate::providers::{ChatMessage, CompletionRequest, LLMProvider, ProviderError, ToolCallRequest, ToolSchema};
use crate::registry::Executor;
use crate::step::{Step, StepResult};
use crate::variables::VariableResolver;

/// A tool's advertised shape. `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<ToolDefinition> for ToolSchema {
    fn from(def: ToolDefinition) -> Self {
        ToolSchema { name: def.name, description: def.description, parameters: def.parameters }
    }
}

impl From<ToolSchema> for ToolDefinition {
    fn from(schema: ToolSchema) -> Self {
        ToolDefinition { name: schema.name, description: schema.description, parameters: schema.parameters }
    }
}

/// A tool invocation the model asked for. `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl From<&ToolCallRequest> for ToolCall {
    fn from(req: &ToolCallRequest) -> Self {
        let arguments = match &req.arguments {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ToolCall { id: req.id.clone(), name: req.name.clone(), arguments }
    }
}

/// Outcome of one tool invocation. `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { tool_call_id: tool_call_id.into(), content: content.into(), is_error: false }
    }

    fn err(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { tool_call_id: tool_call_id.into(), content: content.into(), is_error: true }
    }
}

/// A single recorded round of tool dispatch, surfaced in `output.tool_calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub round: u32,
    pub name: String,
    pub arguments: String,
    pub result: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

/// Final `ai` step output. `spec.md` §4.13.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiOutput {
    pub content: String,
    pub tokens_used: u32,
    pub finish_reason: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub rounds: u32,
}

/// A registered built-in tool, looked up by name from `Tools`. `spec.md` §4.13.
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn call(&self, arguments: &Value) -> std::result::Result<String, String>;
}

/// `json_parse` reference tool: extracts a dotted path out of a JSON string.
pub struct JsonParseTool;

#[async_trait]
impl BuiltinTool for JsonParseTool {
    fn name(&self) -> &str {
        "json_parse"
    }

    fn description(&self) -> &str {
        "Parses a JSON string and extracts the value at a dotted path."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json_string": {"type": "string"},
                "path": {"type": "string"}
            },
            "required": ["json_string", "path"]
        })
    }

    async fn call(&self, arguments: &Value) -> std::result::Result<String, String> {
        let json_string = arguments.get("json_string").and_then(Value::as_str).ok_or("missing 'json_string'")?;
        let path = arguments.get("path").and_then(Value::as_str).ok_or("missing 'path'")?;
        let parsed: Value = serde_json::from_str(json_string).map_err(|e| format!("invalid JSON: {e}"))?;
        let mut current = &parsed;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Err(format!("path '{path}' not found")),
            }
        }
        Ok(match current {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// `http_get` reference tool: a bare GET request returning the response body.
pub struct HttpGetTool {
    client: reqwest::Client,
}

impl Default for HttpGetTool {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl BuiltinTool for HttpGetTool {
    fn name(&self) -> &str {
        "http_get"
    }

    fn description(&self) -> &str {
        "Performs an HTTP GET request and returns the response body as text."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"url": {"type": "string"}},
            "required": ["url"]
        })
    }

    async fn call(&self, arguments: &Value) -> std::result::Result<String, String> {
        let url = arguments.get("url").and_then(Value::as_str).ok_or("missing 'url'")?;
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        response.text().await.map_err(|e| e.to_string())
    }
}

/// A remote MCP server's tool surface. External collaborator; the core
/// carries only the interface.
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self) -> std::result::Result<Vec<ToolDefinition>, String>;
    async fn call_tool(&self, name: &str, arguments: &Value) -> std::result::Result<ToolResult, String>;
}

/// Resolves a configured `MCPServerIDs` entry to its client. Hosting
/// applications implement this; the default carries no servers.
pub trait McpServerRegistry: Send + Sync {
    fn get(&self, server_id: &str) -> Option<Arc<dyn McpClient>>;
}

#[derive(Default)]
pub struct EmptyMcpServerRegistry;

impl McpServerRegistry for EmptyMcpServerRegistry {
    fn get(&self, _server_id: &str) -> Option<Arc<dyn McpClient>> {
        None
    }
}

/// A mounted skill: a system prompt plus description surfaced as a tool.
#[derive(Debug, Clone)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
}

pub trait SkillRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<SkillInfo>;
}

#[derive(Default)]
pub struct EmptySkillRegistry;

impl SkillRegistry for EmptySkillRegistry {
    fn get(&self, _name: &str) -> Option<SkillInfo> {
        None
    }
}

/// Builds an [`LLMProvider`] for a named vendor from step-supplied
/// credentials. Implemented by `llm-orchestrator-providers` so the core
/// never links against a concrete vendor SDK. `spec.md` §4.13, §6.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        provider: &str,
        api_key: &str,
        base_url: Option<&str>,
        api_version: Option<&str>,
    ) -> std::result::Result<Arc<dyn LLMProvider>, ProviderError>;
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_interaction_timeout_secs() -> u64 {
    300
}

fn default_max_tool_rounds() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
struct AiStepConfig {
    model: String,
    api_key: String,
    prompt: String,
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    presence_penalty: Option<f32>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    interactive: bool,
    #[serde(default = "default_interaction_timeout_secs")]
    interaction_timeout_secs: u64,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    mcp_server_ids: Vec<String>,
    #[serde(default = "default_max_tool_rounds")]
    max_tool_rounds: u32,
    #[serde(default)]
    skills: Vec<String>,
}

/// Sanitizes a skill name into a tool-safe identifier. `spec.md` §4.13: keep
/// `[A-Za-z0-9_]` and CJK code points, replace everything else with `_`;
/// empty result becomes `"unnamed"`.
fn sanitize_skill_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || is_cjk(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "unnamed".to_string()
    } else {
        sanitized
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x20000..=0x2A6DF |
        0x3040..=0x309F | 0x30A0..=0x30FF | 0xAC00..=0xD7AF
    )
}

fn human_interaction_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "human_interaction".to_string(),
        description: "Asks the human operator a confirm/input/select question and waits for a response."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "type": {"type": "string", "enum": ["confirm", "input", "select"]},
                "prompt": {"type": "string"},
                "options": {"type": "array", "items": {"type": "string"}},
                "default_value": {"type": "string"}
            },
            "required": ["type", "prompt"]
        }),
    }
}

const INTERACTIVE_ADDENDUM: &str = "\n\nYou must use the `human_interaction` tool to ask the user \
anything rather than asking in free text, and you must produce the final artifact only after you \
have collected all the inputs you need.";

/// Drives the tool-call loop for `ai` steps. `spec.md` §4.13.
pub struct AiExecutor {
    provider_factory: Arc<dyn ProviderFactory>,
    builtin_tools: HashMap<String, Arc<dyn BuiltinTool>>,
    mcp_servers: Arc<dyn McpServerRegistry>,
    skills: Arc<dyn SkillRegistry>,
    resolver: VariableResolver,
}

impl AiExecutor {
    pub fn new(provider_factory: Arc<dyn ProviderFactory>) -> Self {
        let mut builtin_tools: HashMap<String, Arc<dyn BuiltinTool>> = HashMap::new();
        builtin_tools.insert("json_parse".to_string(), Arc::new(JsonParseTool));
        builtin_tools.insert("http_get".to_string(), Arc::new(HttpGetTool::default()));
        Self {
            provider_factory,
            builtin_tools,
            mcp_servers: Arc::new(EmptyMcpServerRegistry),
            skills: Arc::new(EmptySkillRegistry),
            resolver: VariableResolver::new(),
        }
    }

    pub fn with_builtin_tool(mut self, tool: Arc<dyn BuiltinTool>) -> Self {
        self.builtin_tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn with_mcp_servers(mut self, registry: Arc<dyn McpServerRegistry>) -> Self {
        self.mcp_servers = registry;
        self
    }

    pub fn with_skills(mut self, registry: Arc<dyn SkillRegistry>) -> Self {
        self.skills = registry;
        self
    }

    /// Single non-tool completion call.
    async fn direct_generate(
        &self,
        provider: &dyn LLMProvider,
        config: &AiStepConfig,
        system: Option<String>,
        prompt: String,
    ) -> std::result::Result<crate::providers::CompletionResponse, ProviderError> {
        provider
            .complete(CompletionRequest {
                model: config.model.clone(),
                messages: vec![ChatMessage::user(prompt)],
                system,
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                tools: Vec::new(),
                extra: extra_params(config),
            })
            .await
    }

    /// Dispatches a single tool call and returns its result plus wall time.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool_call(
        &self,
        step_id: &str,
        call: ToolCall,
        ctx: &ExecutionContext,
        config: &AiStepConfig,
        provider: &dyn LLMProvider,
        mcp_owner: &HashMap<String, String>,
        skill_lookup: &HashMap<String, SkillInfo>,
    ) -> (ToolCall, ToolResult, Duration) {
        if let Some(cb) = &ctx.ai_callback {
            cb.on_ai_tool_call_start(step_id, &call).await;
        }
        let started = Instant::now();

        let arguments: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);

        let result = if call.name == "human_interaction" {
            self.run_human_interaction(step_id, &call, &arguments, ctx, config).await
        } else if let Some(sanitized) = call.name.strip_prefix("skill__") {
            self.run_skill(sanitized, &arguments, &call, provider, config, skill_lookup).await
        } else if let Some(tool) = self.builtin_tools.get(&call.name) {
            match tool.call(&arguments).await {
                Ok(content) => ToolResult::ok(call.id.clone(), content),
                Err(e) => ToolResult::err(call.id.clone(), e),
            }
        } else if let Some(server_id) = mcp_owner.get(&call.name) {
            match self.mcp_servers.get(server_id) {
                Some(client) => match client.call_tool(&call.name, &arguments).await {
                    Ok(mut result) => {
                        result.tool_call_id = call.id.clone();
                        result
                    }
                    Err(e) => ToolResult::err(call.id.clone(), e),
                },
                None => ToolResult::err(call.id.clone(), "mcp server no longer available"),
            }
        } else {
            ToolResult::err(call.id.clone(), "unknown tool")
        };

        let duration = started.elapsed();
        if let Some(cb) = &ctx.ai_callback {
            cb.on_ai_tool_call_complete(step_id, &call, &result).await;
        }
        (call, result, duration)
    }

    async fn run_human_interaction(
        &self,
        step_id: &str,
        call: &ToolCall,
        arguments: &Value,
        ctx: &ExecutionContext,
        config: &AiStepConfig,
    ) -> ToolResult {
        let kind = match arguments.get("type").and_then(Value::as_str) {
            Some("confirm") => InteractionKind::Confirm,
            Some("select") => InteractionKind::Select,
            _ => InteractionKind::Input,
        };
        let request = InteractionRequest {
            kind,
            prompt: arguments.get("prompt").and_then(Value::as_str).unwrap_or_default().to_string(),
            options: arguments
                .get("options")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            default_value: arguments.get("default_value").and_then(Value::as_str).map(str::to_string),
        };

        let Some(cb) = &ctx.ai_callback else {
            return ToolResult::ok(call.id.clone(), serde_json::json!({"skipped": true, "value": ""}).to_string());
        };

        let timeout = Duration::from_secs(config.interaction_timeout_secs);
        match tokio::time::timeout(timeout, cb.on_ai_interaction_required(step_id, &request)).await {
            Ok(Ok(response)) => ToolResult::ok(
                call.id.clone(),
                serde_json::json!({"skipped": response.skipped, "value": response.value}).to_string(),
            ),
            Ok(Err(e)) => ToolResult::err(call.id.clone(), e.message()),
            Err(_) => ToolResult::ok(
                call.id.clone(),
                serde_json::json!({"skipped": true, "value": ""}).to_string(),
            ),
        }
    }

    async fn run_skill(
        &self,
        sanitized_name: &str,
        arguments: &Value,
        call: &ToolCall,
        provider: &dyn LLMProvider,
        config: &AiStepConfig,
        skill_lookup: &HashMap<String, SkillInfo>,
    ) -> ToolResult {
        let tool_name = format!("skill__{sanitized_name}");
        let Some(skill) = skill_lookup.get(&tool_name) else {
            return ToolResult::err(call.id.clone(), "unknown skill");
        };
        let task = arguments.get("task").and_then(Value::as_str).unwrap_or_default().to_string();

        let request = CompletionRequest {
            model: config.model.clone(),
            messages: vec![ChatMessage::user(task)],
            system: Some(skill.system_prompt.clone()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            tools: Vec::new(),
            extra: HashMap::new(),
        };
        match provider.complete(request).await {
            Ok(response) => ToolResult::ok(call.id.clone(), response.text),
            Err(e) => ToolResult::err(call.id.clone(), e.to_string()),
        }
    }
}

fn extra_params(config: &AiStepConfig) -> HashMap<String, Value> {
    let mut extra = HashMap::new();
    if let Some(top_p) = config.top_p {
        extra.insert("top_p".to_string(), serde_json::json!(top_p));
    }
    if let Some(presence_penalty) = config.presence_penalty {
        extra.insert("presence_penalty".to_string(), serde_json::json!(presence_penalty));
    }
    extra
}

#[async_trait]
impl Executor for AiExecutor {
    fn step_type(&self) -> &str {
        "ai"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<StepResult> {
        let start = chrono::Utc::now();

        let config: AiStepConfig = match serde_json::from_value(step.config.clone()) {
            Ok(c) => c,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Config(format!("invalid ai config: {e}")),
                ))
            }
        };

        let provider = match self.provider_factory.create(
            &config.provider,
            &config.api_key,
            config.base_url.as_deref(),
            config.api_version.as_deref(),
        ) {
            Ok(p) => p,
            Err(e) => {
                return Ok(create_failed_result(
                    step.id.clone(),
                    start,
                    &OrchestratorError::Init(e.to_string()),
                ))
            }
        };

        let prompt = self.resolver.resolve_string(&config.prompt, ctx);
        let base_system = config.system_prompt.as_deref().map(|s| self.resolver.resolve_string(s, ctx));

        let has_tools =
            !config.tools.is_empty() || !config.mcp_server_ids.is_empty() || config.interactive || !config.skills.is_empty();

        if !has_tools {
            return match self.direct_generate(provider.as_ref(), &config, base_system, prompt).await {
                Ok(response) => {
                    let output = AiOutput {
                        content: response.text,
                        tokens_used: response.tokens_used.unwrap_or(0),
                        finish_reason: response.finish_reason,
                        tool_calls: Vec::new(),
                        rounds: 1,
                    };
                    let tokens = output.tokens_used as f64;
                    Ok(create_success_result(step.id.clone(), start, serde_json::to_value(&output).unwrap())
                        .with_metric("ai_tokens_used", tokens)
                        .with_metric("ai_tool_rounds", 1.0))
                }
                Err(e) => Ok(create_failed_result(step.id.clone(), start, &OrchestratorError::Execution(e.to_string()))),
            };
        }

        // Preparation: collect tool definitions (spec.md §4.13 steps 1-3).
        let mut tool_defs: Vec<ToolDefinition> = Vec::new();
        let mut mcp_owner: HashMap<String, String> = HashMap::new();
        let mut skill_lookup: HashMap<String, SkillInfo> = HashMap::new();

        for name in &config.tools {
            match self.builtin_tools.get(name) {
                Some(tool) => tool_defs.push(ToolDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                }),
                None => ctx.append_log(LogEntry::Console {
                    message: format!("ai step '{}': unknown built-in tool '{name}', skipping", step.id),
                }),
            }
        }

        if config.interactive {
            tool_defs.push(human_interaction_tool_definition());
        }

        for server_id in &config.mcp_server_ids {
            match self.mcp_servers.get(server_id) {
                Some(client) => match client.list_tools().await {
                    Ok(defs) => {
                        for def in defs {
                            mcp_owner.entry(def.name.clone()).or_insert_with(|| server_id.clone());
                            tool_defs.push(def);
                        }
                    }
                    Err(e) => ctx.append_log(LogEntry::Console {
                        message: format!("ai step '{}': mcp server '{server_id}' list_tools failed: {e}", step.id),
                    }),
                },
                None => ctx.append_log(LogEntry::Console {
                    message: format!("ai step '{}': unknown mcp server '{server_id}', skipping", step.id),
                }),
            }
        }

        for skill_name in &config.skills {
            match self.skills.get(skill_name) {
                Some(skill) => {
                    let tool_name = format!("skill__{}", sanitize_skill_name(skill_name));
                    tool_defs.push(ToolDefinition {
                        name: tool_name.clone(),
                        description: skill.description.clone(),
                        parameters: serde_json::json!({
                            "type": "object",
                            "properties": {"task": {"type": "string"}},
                            "required": ["task"]
                        }),
                    });
                    skill_lookup.insert(tool_name, skill);
                }
                None => ctx.append_log(LogEntry::Console {
                    message: format!("ai step '{}': unknown skill '{skill_name}', skipping", step.id),
                }),
            }
        }

        if tool_defs.is_empty() {
            return match self.direct_generate(provider.as_ref(), &config, base_system, prompt).await {
                Ok(response) => {
                    let output = AiOutput {
                        content: response.text,
                        tokens_used: response.tokens_used.unwrap_or(0),
                        finish_reason: response.finish_reason,
                        tool_calls: Vec::new(),
                        rounds: 1,
                    };
                    let tokens = output.tokens_used as f64;
                    Ok(create_success_result(step.id.clone(), start, serde_json::to_value(&output).unwrap())
                        .with_metric("ai_tokens_used", tokens)
                        .with_metric("ai_tool_rounds", 1.0))
                }
                Err(e) => Ok(create_failed_result(step.id.clone(), start, &OrchestratorError::Execution(e.to_string()))),
            };
        }

        let mut system_prompt = base_system.unwrap_or_default();
        if config.interactive {
            system_prompt.push_str(INTERACTIVE_ADDENDUM);
        }
        if !skill_lookup.is_empty() {
            system_prompt.push_str("\n\nAvailable skills:\n");
            for (tool_name, skill) in &skill_lookup {
                system_prompt.push_str(&format!("- {tool_name}: {}\n", skill.description));
            }
        }
        let system = if system_prompt.is_empty() { None } else { Some(system_prompt) };

        let schema: Vec<ToolSchema> = tool_defs.into_iter().map(ToolSchema::from).collect();
        let mut messages = vec![ChatMessage::user(prompt)];
        let mut tool_call_records: Vec<ToolCallRecord> = Vec::new();
        let mut total_tokens: u32 = 0;
        let mut finish_reason: Option<String> = None;
        let mut final_content = String::new();
        let mut rounds_used = 0u32;
        let max_rounds = config.max_tool_rounds.max(1);

        'rounds: for round in 1..=max_rounds {
            rounds_used = round;

            let request = CompletionRequest {
                model: config.model.clone(),
                messages: messages.clone(),
                system: system.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                tools: schema.clone(),
                extra: extra_params(&config),
            };

            let response = match provider.complete(request).await {
                Ok(r) => r,
                Err(e) => {
                    if let Some(cb) = &ctx.ai_callback {
                        cb.on_ai_error(&step.id, &OrchestratorError::Execution(e.to_string())).await;
                    }
                    return Ok(create_failed_result(step.id.clone(), start, &OrchestratorError::Execution(e.to_string())));
                }
            };

            total_tokens = total_tokens.saturating_add(response.tokens_used.unwrap_or(0));
            finish_reason = response.finish_reason.clone();

            if let Some(cb) = &ctx.ai_callback {
                cb.on_ai_chunk(&step.id, &response.text, (round - 1) as usize).await;
            }

            if response.tool_calls.is_empty() {
                final_content = response.text;
                break 'rounds;
            }

            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: response.text.clone(),
                tool_calls: response.tool_calls.clone(),
                tool_call_id: None,
            });

            let calls: Vec<ToolCall> = response.tool_calls.iter().map(ToolCall::from).collect();
            let dispatched = futures::future::join_all(calls.into_iter().map(|call| {
                self.dispatch_tool_call(&step.id, call, ctx, &config, provider.as_ref(), &mcp_owner, &skill_lookup)
            }))
            .await;

            // Joined in original order by construction of `join_all` over an
            // order-preserving iterator; spliced back in that same order.
            for (call, result, duration) in dispatched {
                messages.push(ChatMessage::tool_result(result.tool_call_id.clone(), result.content.clone()));
                tool_call_records.push(ToolCallRecord {
                    round,
                    name: call.name,
                    arguments: call.arguments,
                    result: result.content,
                    is_error: result.is_error,
                    duration_ms: duration.as_millis() as u64,
                });
            }

            if round == max_rounds {
                tracing::warn!(step_id = %step.id, "ai tool-call loop hit MaxToolRounds, forcing final generate");
                let final_request = CompletionRequest {
                    model: config.model.clone(),
                    messages: messages.clone(),
                    system: system.clone(),
                    temperature: config.temperature,
                    max_tokens: config.max_tokens,
                    tools: Vec::new(),
                    extra: extra_params(&config),
                };
                match provider.complete(final_request).await {
                    Ok(r) => {
                        final_content = r.text;
                        total_tokens = total_tokens.saturating_add(r.tokens_used.unwrap_or(0));
                        finish_reason = r.finish_reason.or(Some("max_tool_rounds".to_string()));
                    }
                    Err(e) => {
                        return Ok(create_failed_result(
                            step.id.clone(),
                            start,
                            &OrchestratorError::Execution(e.to_string()),
                        ))
                    }
                }
            }
        }

        let output = AiOutput {
            content: final_content,
            tokens_used: total_tokens,
            finish_reason,
            tool_calls: tool_call_records,
            rounds: rounds_used,
        };

        if let Some(cb) = &ctx.ai_callback {
            cb.on_ai_complete(&step.id, &serde_json::to_value(&output).unwrap()).await;
        }

        let tokens = output.tokens_used as f64;
        let rounds = output.rounds as f64;
        Ok(create_success_result(step.id.clone(), start, serde_json::to_value(&output).unwrap())
            .with_metric("ai_tokens_used", tokens)
            .with_metric("ai_tool_rounds", rounds))
    }
}
