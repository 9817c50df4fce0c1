// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Where a tool came from.  The core treats all sources identically; the
/// source is carried for observability and caller-side filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Native,
    Mcp,
    Client,
    OpenApi,
}

/// How a sub-agent tool threads child state across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadMode {
    /// Fresh child state per call.
    Stateless,
    /// One child state shared across sibling calls in the same session.
    Shared,
    /// Child state keyed on an external identifier argument.
    PerSession,
}

/// Metadata for one registered function tool.
///
/// Descriptors are plain data: registration is explicit, there is no
/// attribute scanning or reflection.  The paired handler (the callable)
/// is registered alongside the descriptor.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Unique across functions AND containers; resolution is case-sensitive.
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
    /// When set, the permission middleware gates every invocation behind a
    /// bidirectional permission request.
    pub requires_permission: bool,
    pub source: ToolSource,
    /// Name of the container this tool belongs to.  Parentless tools are
    /// always visible; contained tools only while their parent is expanded.
    pub parent_container: Option<String>,
    /// Set only on sub-agent tools.
    pub thread_mode: Option<ThreadMode>,
    /// Tools that opt out of parallel batches force sequential execution
    /// for the whole iteration.
    pub parallel_safe: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            requires_permission: false,
            source: ToolSource::Native,
            parent_container: None,
            thread_mode: None,
            parallel_safe: true,
        }
    }

    pub fn with_permission(mut self) -> Self {
        self.requires_permission = true;
        self
    }

    pub fn with_parent(mut self, container: impl Into<String>) -> Self {
        self.parent_container = Some(container.into());
        self
    }

    pub fn with_source(mut self, source: ToolSource) -> Self {
        self.source = source;
        self
    }

    pub fn sequential_only(mut self) -> Self {
        self.parallel_safe = false;
        self
    }
}

/// Text attached to a container: either a literal string or a handler
/// evaluated at activation time against the live agent environment.
#[derive(Clone)]
pub enum ContainerText {
    Literal(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl ContainerText {
    pub fn is_static(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Resolve to concrete text.  Dynamic handlers run exactly once per
    /// activation; callers record the result rather than re-resolving.
    pub fn resolve(&self) -> String {
        match self {
            Self::Literal(s) => s.clone(),
            Self::Dynamic(f) => f(),
        }
    }
}

impl fmt::Debug for ContainerText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(s) => f.debug_tuple("Literal").field(s).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for ContainerText {
    fn from(s: &str) -> Self {
        Self::Literal(s.to_string())
    }
}

impl From<String> for ContainerText {
    fn from(s: String) -> Self {
        Self::Literal(s)
    }
}

/// A container (collapse) tool: a synthetic tool whose invocation expands
/// its children into the visible tool set.
#[derive(Debug, Clone)]
pub struct ContainerDescriptor {
    pub name: String,
    pub description: String,
    /// Containers may nest; a child container is only visible while its
    /// parent is expanded.
    pub parent_container: Option<String>,
    /// Names of the function tools revealed by expanding this container.
    /// Must be non-empty and reference registered functions.
    pub function_names: Vec<String>,
    /// Payload returned to the model as the activation tool-call result.
    pub function_result: ContainerText,
    /// Optional persistent system-prompt text merged into the request
    /// instructions while the container stays expanded.
    pub system_prompt: Option<ContainerText>,
}

impl ContainerDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        function_names: Vec<String>,
        function_result: impl Into<ContainerText>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parent_container: None,
            function_names,
            function_result: function_result.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, text: impl Into<ContainerText>) -> Self {
        self.system_prompt = Some(text.into());
        self
    }

    pub fn with_parent(mut self, container: impl Into<String>) -> Self {
        self.parent_container = Some(container.into());
        self
    }
}

// ─── Invocation types ─────────────────────────────────────────────────────────

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: false }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: msg.into(), is_error: true }
    }
}

/// The opaque callable paired with a [`ToolDescriptor`] at registration.
///
/// Implementations must honour `cancel` for long-running work; abandoned
/// executions have their result slot filled by the executor.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput;
}

// ─── Argument binding ─────────────────────────────────────────────────────────

/// Bind model-supplied arguments against a descriptor's parameter schema.
///
/// Keys not declared under `properties` are discarded; missing `required`
/// keys produce a validation error without running the tool.  Schemas
/// without a `properties` map pass arguments through untouched.
pub fn validate_args(descriptor: &ToolDescriptor, args: &Value) -> Result<Value, String> {
    let obj = match args {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => return Err(format!("arguments must be a JSON object, got {other}")),
    };

    if let Some(required) = descriptor.parameters.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(format!("missing required parameter '{key}'"));
            }
        }
    }

    let properties = match descriptor.parameters.get("properties").and_then(|p| p.as_object()) {
        Some(p) => p,
        None => return Ok(Value::Object(obj)),
    };
    let filtered: serde_json::Map<String, Value> = obj
        .into_iter()
        .filter(|(k, _)| properties.contains_key(k))
        .collect();
    Ok(Value::Object(filtered))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
