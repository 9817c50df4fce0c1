// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Facade crate: re-exports the public API of the otto workspace.
//!
//! Embedders depend on this crate; the member crates stay usable on
//! their own for callers that only need one layer (e.g. the chat-client
//! interface without the loop).

pub use otto_config::{
    CheckpointingConfig, CircuitBreakerConfig, ContinuationConfig, CoreConfig,
    HistoryReductionConfig, PermissionsConfig, ReductionStrategy, StructuredOutputConfig,
};
pub use otto_core::{
    AgentEvent, AgentEventKind, AgentLoop, AgentLoopBuilder, AgentLoopState, BuildError,
    Checkpoint, CheckpointStore, CoreError, EventMeta, EventResponse, MemoryCheckpointStore,
    Middleware, PermissionDecision, ResponseRouter, RetryPolicy, SubAgentTool, TurnOutcome,
    CHECKPOINT_SCHEMA_VERSION,
};
pub use otto_model::{
    ChatClient, ChatOptions, ChatResponse, FinishReason, Message, MessageContent, MockClient,
    ResponseEvent, ResponseStream, Role, ScriptedMockClient, ToolChoice, ToolSchema, Usage,
};
pub use otto_tools::{
    ContainerDescriptor, ContainerText, ThreadMode, ToolCall, ToolDescriptor, ToolHandler,
    ToolOutput, ToolSet, ToolSetBuilder, ToolSetError,
};
