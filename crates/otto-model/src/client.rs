// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{ChatOptions, ChatResponse, Message, ResponseEvent};

/// Lazy event sequence produced by a streaming completion.
///
/// Finite, not restartable, single-consumer.
pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// The abstract chat-completion backend consumed by the agent loop.
///
/// Implementations wrap concrete provider APIs; the core never sees
/// anything more specific than this trait.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Human-readable backend name for status display and events.
    fn name(&self) -> &str;

    /// Send a completion request and return the full response.
    async fn get_response(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChatResponse>;

    /// Send a completion request and return a streaming response.
    async fn get_streaming_response(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<ResponseStream>;

    /// Whether this backend retains conversation state server-side.
    ///
    /// When `true`, the orchestrator sends only the messages appended
    /// since the previous call instead of the full history.
    fn tracks_history(&self) -> bool {
        false
    }
}
