// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The ordered middleware pipeline.
//!
//! Hooks run strictly sequentially in registration order within one
//! iteration; each hook observes the state mutations of its
//! predecessors.  Each middleware owns at most one sub-state key in
//! [`AgentLoopState::middleware_state`]; key uniqueness is enforced when
//! the loop is built.

pub mod circuit_breaker;
pub mod containers;
pub mod continuation;
pub mod error_tracker;
pub mod permission;
pub mod pii;
pub mod reduction;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use otto_model::{ChatOptions, Message};
use otto_tools::{ToolCall, ToolDescriptor, ToolOutput};

use crate::coordinator::EventCoordinator;
use crate::error::CoreError;
use crate::events::AgentEventKind;
use crate::state::AgentLoopState;

/// Handle given to every hook: identity, state access, event emission.
///
/// State is read and written through `state`; middleware sub-states go
/// through [`AgentLoopState::middleware_state`] under the middleware's
/// own key.
pub struct HookServices<'a> {
    pub state: &'a mut AgentLoopState,
    pub events: &'a EventCoordinator,
}

impl HookServices<'_> {
    pub fn agent_name(&self) -> &str {
        &self.state.agent_name
    }

    pub fn conversation_id(&self) -> &str {
        &self.state.conversation_id
    }
}

/// BeforeMessageTurn / AfterMessageTurn.
pub struct TurnContext<'a> {
    pub services: HookServices<'a>,
    /// The loop's base chat options.  AfterMessageTurn uses this to strip
    /// per-turn instruction fragments so they cannot leak across turns.
    pub options: &'a mut ChatOptions,
}

/// BeforeIteration.
pub struct IterationContext<'a> {
    pub services: HookServices<'a>,
    pub iteration: u32,
    /// The outgoing payload for this iteration.  Middleware may rewrite
    /// it freely (reduction, PII filtering); `current_messages` in the
    /// persisted state is never touched through this list.
    pub working_messages: &'a mut Vec<Message>,
    pub options: &'a mut ChatOptions,
    /// Skip the model call.  With an `override_response`, the override is
    /// treated as the model output; without one the turn completes as-is.
    pub skip_llm_call: bool,
    pub override_response: Option<Message>,
}

/// BeforeToolExecution — fires once per iteration after the model
/// returned, with the parsed tool-call requests.
pub struct ToolExecutionContext<'a> {
    pub services: HookServices<'a>,
    pub assistant_text: &'a str,
    pub calls: &'a [ToolCall],
    /// Skip execution of the whole batch; `override_results` (matched by
    /// call id) stand in for the real outputs.
    pub skip_tool_execution: bool,
    pub override_results: Vec<ToolOutput>,
}

/// BeforeParallelBatch — fires once when an iteration carries more than
/// one executable call.
pub struct ParallelBatchContext<'a> {
    pub services: HookServices<'a>,
    pub calls: &'a [ToolCall],
    /// Vetoing parallelism forces sequential execution for this batch.
    pub allow_parallel: bool,
}

/// BeforeFunction — fires once per call, before execution.
pub struct FunctionContext<'a> {
    pub services: HookServices<'a>,
    pub call: &'a ToolCall,
    pub descriptor: Option<&'a ToolDescriptor>,
    /// Block this call; `override_result` becomes its synthetic result.
    pub block_execution: bool,
    pub override_result: Option<ToolOutput>,
    /// Set to a request id to suspend the turn instead of executing.
    pub suspend_request: Option<String>,
}

/// AfterFunction — fires once per call, after execution (or suppression).
pub struct AfterFunctionContext<'a> {
    pub services: HookServices<'a>,
    pub call: &'a ToolCall,
    /// The result; middleware may transform or wrap it in place.
    pub output: &'a mut ToolOutput,
    /// Present when the call raised (panic, suppression, validation).
    pub exception: Option<&'a str>,
}

/// AfterIteration — fires once per iteration with the full batch outcome.
pub struct AfterIterationContext<'a> {
    pub services: HookServices<'a>,
    pub iteration: u32,
    pub results: &'a [ToolOutput],
}

/// OnError — fires for captured tool, middleware, and backend errors.
pub struct ErrorContext<'a> {
    pub services: HookServices<'a>,
    pub error: &'a CoreError,
    /// Name of the component the error originated from.
    pub source: &'a str,
}

/// One component of the middleware stack.  Implement any subset of the
/// hooks; the defaults are no-ops.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable name used in events and logs.
    fn name(&self) -> &str;

    /// The sub-state key this middleware owns, if it keeps state.
    /// One key per middleware; duplicates are rejected at build.
    fn state_key(&self) -> Option<&str> {
        None
    }

    async fn before_turn(&self, _cx: &mut TurnContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_turn(&self, _cx: &mut TurnContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_iteration(&self, _cx: &mut IterationContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_tool_execution(
        &self,
        _cx: &mut ToolExecutionContext<'_>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_iteration(&self, _cx: &mut AfterIterationContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_parallel_batch(
        &self,
        _cx: &mut ParallelBatchContext<'_>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_function(&self, _cx: &mut FunctionContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_function(&self, _cx: &mut AfterFunctionContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_error(&self, _cx: &mut ErrorContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Dispatch helpers ─────────────────────────────────────────────────────────

/// Run every OnError hook for a captured error.
///
/// Hook failures inside OnError are logged and reported as events but do
/// not recurse into OnError again.
pub(crate) async fn fire_on_error(
    middleware: &[Arc<dyn Middleware>],
    state: &mut AgentLoopState,
    events: &EventCoordinator,
    error: &CoreError,
    source: &str,
) {
    for mw in middleware {
        let mut cx = ErrorContext {
            services: HookServices { state: &mut *state, events },
            error,
            source,
        };
        if let Err(e) = mw.on_error(&mut cx).await {
            warn!(middleware = mw.name(), error = %e, "on_error hook failed");
            let _ = events.emit(AgentEventKind::MiddlewareError {
                middleware: mw.name().to_string(),
                hook: "on_error".to_string(),
                error: e.to_string(),
            });
        }
    }
}

/// Capture a middleware hook failure: emit the classification event and
/// convert it into an OnError trigger.  The failed hook's own effect is
/// treated as a no-op.
pub(crate) async fn capture_hook_failure(
    middleware: &[Arc<dyn Middleware>],
    state: &mut AgentLoopState,
    events: &EventCoordinator,
    failed_name: &str,
    hook: &str,
    err: anyhow::Error,
) {
    warn!(middleware = failed_name, hook, error = %err, "middleware hook failed");
    let _ = events.emit(AgentEventKind::MiddlewareError {
        middleware: failed_name.to_string(),
        hook: hook.to_string(),
        error: err.to_string(),
    });
    let core_err = CoreError::MiddlewareFailure {
        middleware: failed_name.to_string(),
        hook: hook.to_string(),
        message: err.to_string(),
    };
    fire_on_error(middleware, state, events, &core_err, failed_name).await;
}
