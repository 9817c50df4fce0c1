// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use otto_config::CoreConfig;
use otto_model::ChatClient;
use otto_tools::{ThreadMode, ToolCall, ToolDescriptor, ToolHandler, ToolOutput, ToolSet};

use crate::events::AgentEventKind;
use crate::orchestrator::AgentLoop;
use crate::state::AgentLoopState;

const MAX_DEPTH: usize = 3;

/// A tool that delegates a focused task to a child agent loop and
/// returns its final text output.
///
/// `thread_mode` controls child-state threading: `Stateless` starts
/// fresh every call, `Shared` carries one child state across sibling
/// calls, `PerSession` keys child states on a `session_id` argument.
pub struct SubAgentTool {
    agent_name: String,
    client: Arc<dyn ChatClient>,
    tools: Arc<ToolSet>,
    config: Arc<CoreConfig>,
    thread_mode: ThreadMode,
    depth: Arc<AtomicUsize>,
    shared_state: Mutex<Option<AgentLoopState>>,
    sessions: Mutex<HashMap<String, AgentLoopState>>,
}

impl SubAgentTool {
    pub fn new(
        agent_name: impl Into<String>,
        client: Arc<dyn ChatClient>,
        tools: Arc<ToolSet>,
        config: Arc<CoreConfig>,
        thread_mode: ThreadMode,
        depth: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            client,
            tools,
            config,
            thread_mode,
            depth,
            shared_state: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The descriptor to register this handler under.
    pub fn descriptor(name: impl Into<String>, thread_mode: ThreadMode) -> ToolDescriptor {
        let mut d = ToolDescriptor::new(
            name,
            "Delegate a focused task to a sub-agent and return its final text output. \
             Useful for isolated sub-tasks that would clutter the main conversation.",
            json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "The task description for the sub-agent"
                    },
                    "session_id": {
                        "type": "string",
                        "description": "External identifier selecting the child conversation \
                                        (per-session mode only)"
                    }
                },
                "required": ["prompt"]
            }),
        );
        d.thread_mode = Some(thread_mode);
        d
    }

    fn build_child(&self) -> Result<AgentLoop, crate::orchestrator::BuildError> {
        AgentLoop::builder(format!("{}/sub", self.agent_name), Arc::clone(&self.client))
            .tools(Arc::clone(&self.tools))
            .config((*self.config).clone())
            .build()
    }
}

#[async_trait]
impl ToolHandler for SubAgentTool {
    async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(Value::as_str) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };

        let current_depth = self.depth.load(Ordering::Relaxed);
        if current_depth >= MAX_DEPTH {
            return ToolOutput::err(
                &call.id,
                format!("maximum sub-agent depth ({MAX_DEPTH}) reached"),
            );
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(prompt = %prompt, depth = current_depth + 1, "spawning sub-agent");

        let mut child = match self.build_child() {
            Ok(c) => c,
            Err(e) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                return ToolOutput::err(&call.id, format!("sub-agent build failed: {e}"));
            }
        };

        // Seed child state per thread mode.
        let session_key = call
            .args
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let seed = match self.thread_mode {
            ThreadMode::Stateless => None,
            ThreadMode::Shared => self.shared_state.lock().await.clone(),
            ThreadMode::PerSession => self.sessions.lock().await.get(&session_key).cloned(),
        };
        if let Some(state) = seed {
            if let Err(e) = child.resume_from(state) {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                return ToolOutput::err(&call.id, format!("sub-agent state invalid: {e}"));
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run_result = child.run_turn_with_cancel(Some(&prompt), tx, cancel).await;

        let mut output = String::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEventKind::TextDelta { text } = event.kind {
                output.push_str(&text);
            }
        }

        // Persist the child state for stateful modes.
        match self.thread_mode {
            ThreadMode::Stateless => {}
            ThreadMode::Shared => {
                *self.shared_state.lock().await = Some(child.state().clone());
            }
            ThreadMode::PerSession => {
                self.sessions
                    .lock()
                    .await
                    .insert(session_key, child.state().clone());
            }
        }
        self.depth.fetch_sub(1, Ordering::Relaxed);

        match run_result {
            Ok(_) => {
                if output.is_empty() {
                    ToolOutput::ok(&call.id, "(sub-agent produced no text output)")
                } else {
                    ToolOutput::ok(&call.id, output)
                }
            }
            Err(e) => ToolOutput::err(&call.id, format!("sub-agent error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_model::{ResponseEvent, ScriptedMockClient};

    fn sub_agent(client: ScriptedMockClient, mode: ThreadMode) -> SubAgentTool {
        SubAgentTool::new(
            "otto",
            Arc::new(client),
            Arc::new(ToolSet::empty()),
            Arc::new(CoreConfig::default()),
            mode,
            Arc::new(AtomicUsize::new(0)),
        )
    }

    fn call_with(args: Value) -> ToolCall {
        ToolCall { id: "c1".into(), name: "task".into(), args }
    }

    #[tokio::test]
    async fn returns_child_text_output() {
        let tool = sub_agent(ScriptedMockClient::always_text("child says hi"), ThreadMode::Stateless);
        let out = tool
            .execute(&call_with(json!({"prompt": "greet"})), CancellationToken::new())
            .await;
        assert!(!out.is_error);
        assert_eq!(out.content, "child says hi");
    }

    #[tokio::test]
    async fn missing_prompt_is_an_error() {
        let tool = sub_agent(ScriptedMockClient::always_text("x"), ThreadMode::Stateless);
        let out = tool.execute(&call_with(json!({})), CancellationToken::new()).await;
        assert!(out.is_error);
        assert!(out.content.contains("prompt"));
    }

    #[tokio::test]
    async fn depth_cap_rejects_nesting() {
        let client = ScriptedMockClient::always_text("x");
        let depth = Arc::new(AtomicUsize::new(MAX_DEPTH));
        let tool = SubAgentTool::new(
            "otto",
            Arc::new(client),
            Arc::new(ToolSet::empty()),
            Arc::new(CoreConfig::default()),
            ThreadMode::Stateless,
            depth,
        );
        let out = tool
            .execute(&call_with(json!({"prompt": "go"})), CancellationToken::new())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("depth"));
    }

    #[tokio::test]
    async fn stateless_mode_forgets_between_calls() {
        let client = ScriptedMockClient::new(vec![
            vec![ResponseEvent::TextDelta("first".into()), ResponseEvent::Done],
            vec![ResponseEvent::TextDelta("second".into()), ResponseEvent::Done],
        ]);
        let requests = Arc::clone(&client.requests);
        let tool = sub_agent(client, ThreadMode::Stateless);

        let _ = tool
            .execute(&call_with(json!({"prompt": "one"})), CancellationToken::new())
            .await;
        let _ = tool
            .execute(&call_with(json!({"prompt": "two"})), CancellationToken::new())
            .await;

        let reqs = requests.lock().unwrap();
        // Each child turn starts from scratch: one user message each.
        assert_eq!(reqs[0].messages.len(), 1);
        assert_eq!(reqs[1].messages.len(), 1);
    }

    #[tokio::test]
    async fn shared_mode_threads_one_child_state() {
        let client = ScriptedMockClient::new(vec![
            vec![ResponseEvent::TextDelta("first".into()), ResponseEvent::Done],
            vec![ResponseEvent::TextDelta("second".into()), ResponseEvent::Done],
        ]);
        let requests = Arc::clone(&client.requests);
        let tool = sub_agent(client, ThreadMode::Shared);

        let _ = tool
            .execute(&call_with(json!({"prompt": "one"})), CancellationToken::new())
            .await;
        let _ = tool
            .execute(&call_with(json!({"prompt": "two"})), CancellationToken::new())
            .await;

        let reqs = requests.lock().unwrap();
        assert_eq!(reqs[0].messages.len(), 1);
        // Second call sees the first call's user + assistant turns.
        assert_eq!(reqs[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn per_session_mode_keys_on_the_identifier() {
        let client = ScriptedMockClient::new(vec![
            vec![ResponseEvent::TextDelta("a1".into()), ResponseEvent::Done],
            vec![ResponseEvent::TextDelta("b1".into()), ResponseEvent::Done],
            vec![ResponseEvent::TextDelta("a2".into()), ResponseEvent::Done],
        ]);
        let requests = Arc::clone(&client.requests);
        let tool = sub_agent(client, ThreadMode::PerSession);

        let _ = tool
            .execute(
                &call_with(json!({"prompt": "one", "session_id": "a"})),
                CancellationToken::new(),
            )
            .await;
        let _ = tool
            .execute(
                &call_with(json!({"prompt": "one", "session_id": "b"})),
                CancellationToken::new(),
            )
            .await;
        let _ = tool
            .execute(
                &call_with(json!({"prompt": "two", "session_id": "a"})),
                CancellationToken::new(),
            )
            .await;

        let reqs = requests.lock().unwrap();
        assert_eq!(reqs[0].messages.len(), 1, "session a starts fresh");
        assert_eq!(reqs[1].messages.len(), 1, "session b starts fresh");
        assert_eq!(reqs[2].messages.len(), 3, "session a continues its history");
    }

    #[test]
    fn descriptor_carries_thread_mode() {
        let d = SubAgentTool::descriptor("task", ThreadMode::Shared);
        assert_eq!(d.thread_mode, Some(ThreadMode::Shared));
        assert_eq!(d.name, "task");
        assert!(d.parameters["required"].as_array().unwrap().iter().any(|v| v == "prompt"));
    }
}
