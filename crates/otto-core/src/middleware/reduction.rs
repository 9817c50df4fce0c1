// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use otto_config::{HistoryReductionConfig, ReductionStrategy};
use otto_model::{ChatClient, ChatOptions, Message, MessageContent, Role};

use crate::middleware::{IterationContext, Middleware};

pub const HISTORY_REDUCTION_KEY: &str = "history-reduction";

const SUMMARIZE_PROMPT: &str =
    "You are a context reduction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, \
     identifiers, and tool outputs that may be relevant to future work. The summary will \
     replace the original history to free up context space.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReductionRecord {
    pub summary_text: String,
    pub message_count_at_reduction: usize,
    pub summarized_up_to_index: usize,
    pub target_count: usize,
    pub threshold: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReductionState {
    pub last_reduction: Option<ReductionRecord>,
}

/// Shrinks the outgoing payload when the history grows past
/// `target_count + threshold`.
///
/// Applies on iteration 0 only, and only to the working list: the
/// reduced prefix becomes a single assistant summary message while the
/// persisted `current_messages` keeps the full unreduced history.  Tool
/// results appended later in the same turn are never reduced.
pub struct HistoryReductionMiddleware {
    config: HistoryReductionConfig,
    /// Backend used by the summarizing strategy.  `None` forces the
    /// deterministic message-counting path.
    client: Option<Arc<dyn ChatClient>>,
}

impl HistoryReductionMiddleware {
    pub fn new(config: HistoryReductionConfig, client: Option<Arc<dyn ChatClient>>) -> Self {
        Self { config, client }
    }

    async fn summarize(&self, prefix: &[Message]) -> Option<String> {
        let client = self.client.as_ref()?;
        let prompt = format!("{SUMMARIZE_PROMPT}\n\n---\n\n{}", serialize_history(prefix));
        let request = vec![Message::user(prompt)];
        match client
            .get_response(&request, &ChatOptions::default(), CancellationToken::new())
            .await
        {
            Ok(resp) => {
                let text = resp.message.as_text().unwrap_or("").to_string();
                if text.is_empty() {
                    warn!("summarizing reduction returned empty text; using counting digest");
                    None
                } else {
                    Some(text)
                }
            }
            Err(e) => {
                warn!(error = %e, "summarizing reduction failed; using counting digest");
                None
            }
        }
    }
}

#[async_trait]
impl Middleware for HistoryReductionMiddleware {
    fn name(&self) -> &str {
        "history-reduction"
    }

    fn state_key(&self) -> Option<&str> {
        Some(HISTORY_REDUCTION_KEY)
    }

    async fn before_iteration(&self, cx: &mut IterationContext<'_>) -> anyhow::Result<()> {
        if !self.config.enabled || cx.iteration != 0 {
            return Ok(());
        }
        // Backends with server-side history receive deltas; rewriting the
        // payload would desynchronise the server's view.
        if cx.services.state.inner_client_tracks_history {
            return Ok(());
        }
        let total = cx.working_messages.len();
        if total <= self.config.target_count + self.config.threshold {
            return Ok(());
        }

        // Leading system message survives reduction untouched.
        let has_system = cx
            .working_messages
            .first()
            .map(|m| m.role == Role::System)
            .unwrap_or(false);
        let body_start = usize::from(has_system);
        let body = &cx.working_messages[body_start..];

        let mut split = body.len().saturating_sub(self.config.target_count);
        // Move the split backward until the preserved tail starts at a
        // conversation-turn boundary.  Splitting inside a tool-call group
        // would orphan tool results whose requests were summarised away.
        while split > 0 && split < body.len() {
            match &body[split].content {
                MessageContent::ToolResult { .. } | MessageContent::ToolCall { .. } => split -= 1,
                _ => break,
            }
        }
        if split == 0 {
            return Ok(());
        }

        let prefix: Vec<Message> = body[..split].to_vec();
        let tail: Vec<Message> = body[split..].to_vec();

        let summary_text = match self.config.strategy {
            ReductionStrategy::Summarizing => match self.summarize(&prefix).await {
                Some(text) => text,
                None => counting_digest(&prefix),
            },
            ReductionStrategy::MessageCounting => counting_digest(&prefix),
        };

        let mut reduced = Vec::with_capacity(tail.len() + 2);
        if has_system {
            reduced.push(cx.working_messages[0].clone());
        }
        reduced.push(Message::assistant(summary_text.clone()));
        reduced.extend(tail);
        *cx.working_messages = reduced;

        let record = ReductionRecord {
            summary_text,
            message_count_at_reduction: total,
            summarized_up_to_index: body_start + split,
            target_count: self.config.target_count,
            threshold: self.config.threshold,
        };
        cx.services
            .state
            .middleware_state
            .update::<HistoryReductionState>(HISTORY_REDUCTION_KEY, |_| HistoryReductionState {
                last_reduction: Some(record),
            });
        Ok(())
    }
}

/// Deterministic digest used by the message-counting strategy and as the
/// fallback when a summary call fails.
fn counting_digest(prefix: &[Message]) -> String {
    let users = prefix.iter().filter(|m| m.role == Role::User).count();
    let assistants = prefix.iter().filter(|m| m.role == Role::Assistant).count();
    let tools = prefix.iter().filter(|m| m.role == Role::Tool).count();
    let approx_tokens: usize = prefix.iter().map(|m| m.approx_tokens()).sum();
    format!(
        "[Earlier history reduced: {} messages ({users} user, {assistants} assistant, \
         {tools} tool; ~{approx_tokens} tokens) were summarised away to free context space. \
         The conversation continues below.]",
        prefix.len()
    )
}

/// Flatten messages into role-prefixed lines for the summary prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::Reasoning(t) => format!("[reasoning: {t}]"),
                MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                MessageContent::ToolResult { content, .. } => {
                    format!("[tool_result: {content}]")
                }
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
