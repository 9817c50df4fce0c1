// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    ChatClient, ChatOptions, ChatResponse, FinishReason, Message, MessageContent, ResponseEvent,
    ResponseStream, Role, Usage,
};

/// Deterministic mock client for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockClient;

#[async_trait]
impl ChatClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_response(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChatResponse> {
        collect_response(self.get_streaming_response(messages, options, cancel).await?).await
    }

    async fn get_streaming_response(
        &self,
        messages: &[Message],
        _options: &ChatOptions,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ResponseStream> {
        let reply = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage(Usage { input_tokens: 10, output_tokens: 10 })),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A recorded request: the exact message payload and options one
/// `get_streaming_response` call received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub options: ChatOptions,
}

/// A pre-scripted mock client.  Each completion call pops the next
/// response script from the front of the queue.  This lets tests specify
/// exact event sequences – including tool calls – without network access.
pub struct ScriptedMockClient {
    scripts: Mutex<Vec<Vec<ResponseEvent>>>,
    /// Every request seen by this client, in call order.  Tests inspect
    /// this to assert on payload lengths, tool sets, and instructions.
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    tracks_history: bool,
}

impl ScriptedMockClient {
    /// Build a client from a list of response scripts.
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`ResponseEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            requests: Arc::new(Mutex::new(Vec::new())),
            tracks_history: false,
        }
    }

    /// Declare that this mock retains conversation state server-side,
    /// so the orchestrator sends deltas instead of the full history.
    pub fn with_history_tracking(mut self) -> Self {
        self.tracks_history = true;
        self
    }

    /// Convenience: client that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage(Usage { input_tokens: 5, output_tokens: 5 }),
            ResponseEvent::Done,
        ]])
    }

    /// Convenience: client that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            // Round 1 – model emits a tool call
            vec![
                ResponseEvent::ToolCallDelta {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done,
            ],
            // Round 2 – model responds after the tool result
            vec![ResponseEvent::TextDelta(final_text.into()), ResponseEvent::Done],
        ])
    }

    /// Number of completion calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The request captured for call `i` (panics when out of range).
    pub fn request(&self, i: usize) -> RecordedRequest {
        self.requests.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl ChatClient for ScriptedMockClient {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn tracks_history(&self) -> bool {
        self.tracks_history
    }

    async fn get_response(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChatResponse> {
        collect_response(self.get_streaming_response(messages, options, cancel).await?).await
    }

    async fn get_streaming_response(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ResponseStream> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: messages.to_vec(),
            options: options.clone(),
        });
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![ResponseEvent::TextDelta("[no more scripts]".into()), ResponseEvent::Done]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ResponseEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// Drain a response stream into a [`ChatResponse`].
///
/// Shared by the mock clients' `get_response` implementations; concrete
/// backends typically have a native non-streaming path instead.
pub async fn collect_response(mut stream: ResponseStream) -> anyhow::Result<ChatResponse> {
    let mut text = String::new();
    let mut finish = FinishReason::Stop;
    let mut usage = None;
    let mut response_id = None;
    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(t) => text.push_str(&t),
            ResponseEvent::Finish(f) => finish = f,
            ResponseEvent::Usage(u) => usage = Some(u),
            ResponseEvent::ResponseId(id) => response_id = Some(id),
            ResponseEvent::Done => break,
            _ => {}
        }
    }
    Ok(ChatResponse {
        message: Message { role: Role::Assistant, content: MessageContent::Text(text) },
        finish_reason: finish,
        usage,
        model_id: None,
        response_id,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
