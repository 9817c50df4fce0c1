// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use otto_config::CoreConfig;
use otto_model::{
    ChatClient, ChatOptions, Message, MessageContent, ResponseEvent, Role,
};
use otto_tools::{ToolCall, ToolOutput, ToolSet};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::coordinator::{EventCoordinator, ResponseRouter};
use crate::error::{classify_backend_error, CoreError};
use crate::events::{AgentEvent, AgentEventKind};
use crate::executor::{execute_batch, truncate_output};
use crate::middleware::circuit_breaker::CircuitBreakerMiddleware;
use crate::middleware::containers::ContainerVisibilityMiddleware;
use crate::middleware::continuation::ContinuationMiddleware;
use crate::middleware::error_tracker::ErrorTrackerMiddleware;
use crate::middleware::permission::PermissionMiddleware;
use crate::middleware::reduction::HistoryReductionMiddleware;
use crate::middleware::{
    capture_hook_failure, fire_on_error, AfterIterationContext, HookServices, IterationContext,
    Middleware, ToolExecutionContext, TurnContext,
};
use crate::retry::RetryPolicy;
use crate::state::AgentLoopState;

/// How a turn ended.  Suspension is a normal outcome, not an exception:
/// the stream has closed and the caller resumes from the checkpointed
/// state after answering the named request out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Terminal assistant text with no tool calls.
    Completed,
    /// A middleware or policy ended the turn early.
    Terminated { reason: String },
    /// Awaiting an external response; state rolled back to the last
    /// iteration boundary.
    Suspended { request_id: String },
    Cancelled,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("two middleware claim the sub-state key '{0}'")]
    DuplicateStateKey(String),
}

/// Builder for an [`AgentLoop`].
///
/// Wires the built-in middleware from [`CoreConfig`] and validates that
/// every middleware owns a distinct sub-state key.  Tool packs are
/// loaded explicitly through the [`ToolSet`]; nothing is discovered at
/// module-initialisation time.
pub struct AgentLoopBuilder {
    agent_name: String,
    conversation_id: Option<String>,
    client: Arc<dyn ChatClient>,
    tools: Arc<ToolSet>,
    config: CoreConfig,
    custom_middleware: Vec<Arc<dyn Middleware>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    chat_options: ChatOptions,
    retry: RetryPolicy,
}

impl AgentLoopBuilder {
    pub fn new(agent_name: impl Into<String>, client: Arc<dyn ChatClient>) -> Self {
        Self {
            agent_name: agent_name.into(),
            conversation_id: None,
            client,
            tools: Arc::new(ToolSet::empty()),
            config: CoreConfig::default(),
            custom_middleware: Vec::new(),
            checkpoint_store: None,
            chat_options: ChatOptions::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn tools(mut self, tools: Arc<ToolSet>) -> Self {
        self.tools = tools;
        self
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a custom middleware after the built-in stack.
    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.custom_middleware.push(mw);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn chat_options(mut self, options: ChatOptions) -> Self {
        self.chat_options = options;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<AgentLoop, BuildError> {
        let mut middleware: Vec<Arc<dyn Middleware>> = Vec::new();

        middleware.push(Arc::new(ErrorTrackerMiddleware::new(
            self.config.max_consecutive_errors,
        )));
        if self.config.continuation.enabled {
            middleware.push(Arc::new(ContinuationMiddleware::new(
                self.config.max_iterations,
                Duration::from_secs(self.config.continuation.timeout_secs),
            )));
        }
        if self.config.history_reduction.enabled {
            middleware.push(Arc::new(HistoryReductionMiddleware::new(
                self.config.history_reduction.clone(),
                Some(Arc::clone(&self.client)),
            )));
        }
        middleware.push(Arc::new(ContainerVisibilityMiddleware::new(Arc::clone(
            &self.tools,
        ))));
        if self.config.circuit_breaker.enabled {
            middleware.push(Arc::new(CircuitBreakerMiddleware::new(
                self.config.circuit_breaker.max_consecutive_identical_calls,
            )));
        }
        if self.config.permissions.enabled {
            middleware.push(Arc::new(PermissionMiddleware::new(
                Duration::from_secs(self.config.permissions.timeout_secs),
                self.config.permissions.suspend_on_timeout,
            )));
        }
        middleware.extend(self.custom_middleware);

        let mut keys = HashSet::new();
        for mw in &middleware {
            if let Some(key) = mw.state_key() {
                if !keys.insert(key.to_string()) {
                    return Err(BuildError::DuplicateStateKey(key.to_string()));
                }
            }
        }

        let conversation_id = self
            .conversation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut state = AgentLoopState::new(&self.agent_name, &conversation_id);
        state.inner_client_tracks_history = self.client.tracks_history();

        Ok(AgentLoop {
            agent_name: self.agent_name,
            client: self.client,
            tools: self.tools,
            config: Arc::new(self.config),
            middleware,
            checkpoint_store: self.checkpoint_store,
            base_options: self.chat_options,
            retry: self.retry,
            router: Arc::new(ResponseRouter::new()),
            state,
        })
    }
}

/// One model call's accumulated output.
struct StreamedTurn {
    text: String,
    calls: Vec<ToolCall>,
}

/// The agentic loop: owns the state and drives
/// assemble → model call → tool execution → repeat for each turn.
pub struct AgentLoop {
    agent_name: String,
    client: Arc<dyn ChatClient>,
    tools: Arc<ToolSet>,
    config: Arc<CoreConfig>,
    middleware: Vec<Arc<dyn Middleware>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    base_options: ChatOptions,
    retry: RetryPolicy,
    router: Arc<ResponseRouter>,
    state: AgentLoopState,
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("agent_name", &self.agent_name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl AgentLoop {
    pub fn builder(agent_name: impl Into<String>, client: Arc<dyn ChatClient>) -> AgentLoopBuilder {
        AgentLoopBuilder::new(agent_name, client)
    }

    pub fn state(&self) -> &AgentLoopState {
        &self.state
    }

    /// Handle for delivering responses to bidirectional events.  Valid
    /// across turns.
    pub fn responder(&self) -> Arc<ResponseRouter> {
        Arc::clone(&self.router)
    }

    /// Replace the loop state with a rehydrated one (checkpoint resume).
    ///
    /// Invariant violations are fatal and leave the existing state
    /// untouched.
    pub fn resume_from(&mut self, state: AgentLoopState) -> Result<(), CoreError> {
        state.validate()?;
        self.state = state;
        self.state.inner_client_tracks_history = self.client.tracks_history();
        Ok(())
    }

    /// Run one turn and stream events through `tx`.
    ///
    /// `input` is the new user message; pass `None` to resume a turn from
    /// a rehydrated state.  The stream is always bounded: it closes when
    /// the returned outcome is decided.
    pub async fn run_turn(
        &mut self,
        input: Option<&str>,
        tx: mpsc::UnboundedSender<AgentEvent>,
    ) -> anyhow::Result<TurnOutcome> {
        self.run_turn_with_cancel(input, tx, CancellationToken::new()).await
    }

    /// Like [`run_turn`] but with a caller-held cancellation token.
    ///
    /// On cancellation the iteration is aborted, a cancellation event is
    /// emitted with the current iteration index, pending tool calls get
    /// error results so the message list stays consistent, and the
    /// checkpointed state of the last iteration boundary remains the
    /// resumable state.
    ///
    /// [`run_turn`]: AgentLoop::run_turn
    pub async fn run_turn_with_cancel(
        &mut self,
        input: Option<&str>,
        tx: mpsc::UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<TurnOutcome> {
        let events = EventCoordinator::new(tx, &self.agent_name, Arc::clone(&self.router));
        let _ = events.emit(AgentEventKind::TurnStarted);

        match input {
            Some(text) => {
                // Fresh turn: iteration resets, termination flags clear.
                self.state.iteration = 0;
                self.state.is_terminated = false;
                self.state.termination_reason = None;
                self.state.completed_functions.clear();
                self.state.current_messages.push(Message::user(text));
            }
            None => {
                // Resume.  The stored iteration index is the last one that
                // completed; a trailing user message means the stored
                // iteration never produced output and must run as-is.
                if let Err(e) = self.state.validate() {
                    let _ = events.emit(AgentEventKind::Fatal { message: e.to_string() });
                    return Err(e.into());
                }
                if self.state.current_messages.is_empty() {
                    anyhow::bail!("nothing to resume: state has no messages");
                }
                if self.state.is_terminated {
                    let reason = self
                        .state
                        .termination_reason
                        .clone()
                        .unwrap_or_else(|| "turn already terminated".to_string());
                    let _ = events.emit(AgentEventKind::Terminated { reason: reason.clone() });
                    let _ = events.emit(AgentEventKind::TurnFinished);
                    return Ok(TurnOutcome::Terminated { reason });
                }
                let last_is_user = self
                    .state
                    .current_messages
                    .last()
                    .map(|m| m.role == Role::User)
                    .unwrap_or(false);
                if !last_is_user {
                    self.state.iteration += 1;
                }
            }
        }

        let mut options = self.base_options.clone();
        if self.config.structured_output.enabled {
            if let Some(schema) = &self.config.structured_output.schema {
                options.response_schema = Some(schema.clone());
                let _ = events.emit(AgentEventKind::StructuredOutputRequested {
                    schema: schema.clone(),
                });
            }
        }

        self.run_turn_hooks(&events, &mut options, "before_turn").await;
        if self.state.is_terminated {
            return Ok(self.finish_terminated(&events, &mut options).await);
        }

        let outcome = self.drive(&events, &mut options, &cancel).await?;
        Ok(outcome)
    }

    /// The iteration loop.
    async fn drive(
        &mut self,
        events: &EventCoordinator,
        options: &mut ChatOptions,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TurnOutcome> {
        let mut empty_turn_retries = 0u32;
        const MAX_EMPTY_TURN_RETRIES: u32 = 2;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.finish_cancelled(events, options).await);
            }
            let iter = self.state.iteration;
            // The boundary snapshot: what suspension rolls back to.
            let boundary = self.state.clone();

            events.begin_iteration();
            if events.emit(AgentEventKind::IterationStarted { iteration: iter }).is_err() {
                // Emit-side failure means the consumer went away.
                return Ok(self.finish_cancelled(events, options).await);
            }

            // Assemble the outgoing payload.  Backends with server-side
            // history receive only the messages they have not seen.
            let mut working: Vec<Message> = if self.state.inner_client_tracks_history {
                self.state.current_messages[self.state.messages_sent_to_inner_client..].to_vec()
            } else {
                self.state.current_messages.clone()
            };

            // BeforeIteration hooks.
            let mut skip_llm_call = false;
            let mut override_response: Option<Message> = None;
            let middleware = self.middleware.clone();
            for mw in &middleware {
                let mut cx = IterationContext {
                    services: HookServices { state: &mut self.state, events },
                    iteration: iter,
                    working_messages: &mut working,
                    options: &mut *options,
                    skip_llm_call,
                    override_response: override_response.take(),
                };
                let hook_result = mw.before_iteration(&mut cx).await;
                skip_llm_call = cx.skip_llm_call;
                override_response = cx.override_response.take();
                if let Err(e) = hook_result {
                    let name = mw.name().to_string();
                    capture_hook_failure(
                        &middleware,
                        &mut self.state,
                        events,
                        &name,
                        "before_iteration",
                        e,
                    )
                    .await;
                }
                if self.state.is_terminated {
                    break;
                }
            }
            if self.state.is_terminated {
                let _ = events.emit(AgentEventKind::IterationFinished { iteration: iter });
                events.end_iteration();
                return Ok(self.finish_terminated(events, options).await);
            }

            // Model invocation (or the BeforeIteration short-circuit).
            let streamed = if skip_llm_call {
                match override_response {
                    Some(message) => {
                        let text = message.as_text().unwrap_or("").to_string();
                        StreamedTurn { text, calls: Vec::new() }
                    }
                    None => {
                        // Short-circuit with nothing to say: the turn is
                        // over and the message list stays as-is.
                        let _ =
                            events.emit(AgentEventKind::IterationFinished { iteration: iter });
                        events.end_iteration();
                        self.write_checkpoint(events).await?;
                        return Ok(self.finish_completed(events, options, None).await);
                    }
                }
            } else {
                let payload_len = working.len();
                match self.stream_model_once(events, &working, options, cancel).await {
                    Ok(streamed) => {
                        // "Already sent" becomes the actual payload length.
                        if self.state.inner_client_tracks_history {
                            self.state.messages_sent_to_inner_client =
                                self.state.current_messages.len();
                        } else {
                            self.state.messages_sent_to_inner_client = payload_len;
                        }
                        streamed
                    }
                    Err(ModelCallError::Cancelled) => {
                        return Ok(self.finish_cancelled(events, options).await);
                    }
                    Err(ModelCallError::Backend(core_err)) => {
                        fire_on_error(
                            &middleware,
                            &mut self.state,
                            events,
                            &core_err,
                            "chat-client",
                        )
                        .await;
                        if !self.state.is_terminated {
                            self.state.terminate(format!("model call failed: {core_err}"));
                        }
                        let _ =
                            events.emit(AgentEventKind::IterationFinished { iteration: iter });
                        events.end_iteration();
                        return Ok(self.finish_terminated(events, options).await);
                    }
                }
            };

            // Persist the model output (phase 1: requests before results).
            if !streamed.text.is_empty() {
                self.state.current_messages.push(Message::assistant(&streamed.text));
            }
            for call in &streamed.calls {
                self.state.current_messages.push(Message::tool_call(
                    &call.id,
                    &call.name,
                    call.args.to_string(),
                ));
                let _ = events.emit(AgentEventKind::ToolCallStarted {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.args.clone(),
                });
            }
            if self.state.inner_client_tracks_history {
                self.state.messages_sent_to_inner_client = self.state.current_messages.len();
            }

            if streamed.calls.is_empty() {
                if streamed.text.is_empty() && empty_turn_retries < MAX_EMPTY_TURN_RETRIES {
                    // The model produced neither text nor calls; nudge it
                    // once or twice before giving up on the turn.
                    empty_turn_retries += 1;
                    self.state.current_messages.push(Message::user(
                        "You produced no response or tool call. \
                         Please continue with your next action.",
                    ));
                    let _ = events.emit(AgentEventKind::IterationFinished { iteration: iter });
                    events.end_iteration();
                    self.write_checkpoint(events).await?;
                    self.state.iteration = iter + 1;
                    continue;
                }
                if streamed.text.is_empty() {
                    self.state.terminate("model produced neither text nor tool calls");
                    let _ = events.emit(AgentEventKind::IterationFinished { iteration: iter });
                    events.end_iteration();
                    return Ok(self.finish_terminated(events, options).await);
                }
                // Terminal assistant text: the turn is complete.
                let _ = events.emit(AgentEventKind::IterationFinished { iteration: iter });
                events.end_iteration();
                self.write_checkpoint(events).await?;
                return Ok(self
                    .finish_completed(events, options, Some(streamed.text.as_str()))
                    .await);
            }
            empty_turn_retries = 0;

            // BeforeToolExecution hook (once per iteration).
            let mut skip_tool_execution = false;
            let mut override_results: Vec<ToolOutput> = Vec::new();
            for mw in &middleware {
                let mut cx = ToolExecutionContext {
                    services: HookServices { state: &mut self.state, events },
                    assistant_text: &streamed.text,
                    calls: &streamed.calls,
                    skip_tool_execution,
                    override_results: std::mem::take(&mut override_results),
                };
                let hook_result = mw.before_tool_execution(&mut cx).await;
                skip_tool_execution = cx.skip_tool_execution;
                override_results = cx.override_results;
                if let Err(e) = hook_result {
                    let name = mw.name().to_string();
                    capture_hook_failure(
                        &middleware,
                        &mut self.state,
                        events,
                        &name,
                        "before_tool_execution",
                        e,
                    )
                    .await;
                }
            }

            // Tool execution.
            let outputs = if skip_tool_execution {
                let outputs = synthesize_skipped_outputs(&streamed.calls, override_results);
                for (call, output) in streamed.calls.iter().zip(outputs.iter()) {
                    self.state.completed_functions.push(crate::state::CompletedFunction {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        success: !output.is_error,
                    });
                    let _ = events.emit(AgentEventKind::ToolCallFinished {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        output: output.content.clone(),
                        is_error: output.is_error,
                    });
                }
                outputs
            } else {
                let batch = match execute_batch(
                    &self.tools,
                    &middleware,
                    &self.config,
                    events,
                    &mut self.state,
                    &streamed.calls,
                    cancel,
                )
                .await
                {
                    Ok(batch) => batch,
                    Err(fatal) => {
                        let _ = events.emit(AgentEventKind::Fatal { message: fatal.to_string() });
                        let _ = events.emit(AgentEventKind::TurnFinished);
                        return Err(fatal.into());
                    }
                };
                if let Some(request_id) = batch.suspended {
                    // Roll back to the boundary; the re-run after resume
                    // repeats this iteration's model call.
                    self.state = boundary;
                    self.state.iteration = iter.saturating_sub(1);
                    let _ = events.emit(AgentEventKind::IterationFinished { iteration: iter });
                    events.end_iteration();
                    self.write_checkpoint(events).await?;
                    let _ = events.emit(AgentEventKind::TurnFinished);
                    return Ok(TurnOutcome::Suspended { request_id });
                }
                batch.outputs
            };

            // Append results (phase 3), truncating oversized payloads.
            let cap = self.config.tool_result_token_cap;
            for output in &outputs {
                let content = truncate_output(&output.content, cap);
                let message = if output.is_error {
                    Message::tool_error(&output.call_id, content)
                } else {
                    Message::tool_result(&output.call_id, content)
                };
                self.state.current_messages.push(message);
            }

            // AfterIteration hooks see the whole batch as a set.
            for mw in &middleware {
                let failed = {
                    let mut cx = AfterIterationContext {
                        services: HookServices { state: &mut self.state, events },
                        iteration: iter,
                        results: &outputs,
                    };
                    mw.after_iteration(&mut cx).await.err()
                };
                if let Some(e) = failed {
                    let name = mw.name().to_string();
                    capture_hook_failure(
                        &middleware,
                        &mut self.state,
                        events,
                        &name,
                        "after_iteration",
                        e,
                    )
                    .await;
                }
            }

            let _ = events.emit(AgentEventKind::IterationFinished { iteration: iter });
            events.end_iteration();
            self.write_checkpoint(events).await?;

            // Termination checks.
            if self.state.is_terminated {
                return Ok(self.finish_terminated(events, options).await);
            }
            if !self.config.continuation.enabled && iter + 1 >= self.config.max_iterations {
                self.state.terminate(format!(
                    "maximum iterations reached ({})",
                    self.config.max_iterations
                ));
                return Ok(self.finish_terminated(events, options).await);
            }
            self.state.iteration = iter + 1;
        }
    }

    /// One streaming model call with transient-error retry.
    async fn stream_model_once(
        &self,
        events: &EventCoordinator,
        payload: &[Message],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<StreamedTurn, ModelCallError> {
        use futures::StreamExt;

        let mut attempt = 0u32;
        'retry: loop {
            let mut stream = match self
                .client
                .get_streaming_response(payload, options, cancel.clone())
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    let classified = classify_backend_error(&e);
                    if classified.is_retryable() && !self.retry.should_give_up(attempt) {
                        let delay = self.retry.delay_for(attempt, &classified);
                        warn!(attempt, delay_ms = delay.as_millis() as u64,
                              error = %classified, "model call failed; retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue 'retry;
                    }
                    return Err(ModelCallError::Backend(classified));
                }
            };

            let mut text = String::new();
            let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
            let mut emitted_anything = false;

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ModelCallError::Cancelled),
                    next = stream.next() => match next {
                        Some(e) => e,
                        None => break,
                    },
                };
                match event {
                    Ok(ResponseEvent::TextDelta(delta)) if !delta.is_empty() => {
                        emitted_anything = true;
                        text.push_str(&delta);
                        let _ = events.emit(AgentEventKind::TextDelta { text: delta });
                    }
                    Ok(ResponseEvent::ReasoningDelta(delta)) => {
                        emitted_anything = true;
                        let _ = events.emit(AgentEventKind::ReasoningDelta { text: delta });
                    }
                    Ok(ResponseEvent::ToolCallDelta { index, id, name, arguments }) => {
                        emitted_anything = true;
                        let ptc = pending.entry(index).or_insert_with(PendingToolCall::default);
                        if !id.is_empty() {
                            ptc.id = id;
                        }
                        if !name.is_empty() {
                            ptc.name = name;
                        }
                        if !arguments.is_empty() {
                            if !ptc.id.is_empty() {
                                let _ = events.emit(AgentEventKind::ToolCallArgsDelta {
                                    call_id: ptc.id.clone(),
                                    arguments: arguments.clone(),
                                });
                            }
                            ptc.args_buf.push_str(&arguments);
                        }
                    }
                    Ok(ResponseEvent::Done) => break,
                    Ok(ResponseEvent::Error(e)) => {
                        warn!("model stream error: {e}");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let classified = classify_backend_error(&e);
                        // Retry is only safe before anything reached the
                        // consumer; replaying a half-streamed response
                        // would duplicate output.
                        if !emitted_anything
                            && classified.is_retryable()
                            && !self.retry.should_give_up(attempt)
                        {
                            let delay = self.retry.delay_for(attempt, &classified);
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue 'retry;
                        }
                        return Err(ModelCallError::Backend(classified));
                    }
                }
            }

            // Flush accumulated parallel tool calls, ordered by index.
            // Calls with an empty name cannot be dispatched and are
            // dropped; empty ids get a synthetic fallback.
            let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
            sorted.sort_by_key(|(idx, _)| *idx);
            let mut calls = Vec::with_capacity(sorted.len());
            for (i, (_, ptc)) in sorted.into_iter().enumerate() {
                if ptc.name.is_empty() {
                    warn!(
                        tool_call_id = %ptc.id,
                        "dropping tool call with empty name from model; cannot dispatch"
                    );
                    continue;
                }
                let mut call = ptc.finish();
                if call.id.is_empty() {
                    call.id = format!("call_synthetic_{i}");
                    warn!(
                        tool_name = %call.name,
                        tool_call_id = %call.id,
                        "tool call from model had empty id; generated synthetic id"
                    );
                }
                calls.push(call);
            }

            return Ok(StreamedTurn { text, calls });
        }
    }

    /// Run the turn-boundary hooks (`before_turn` / `after_turn`).
    async fn run_turn_hooks(
        &mut self,
        events: &EventCoordinator,
        options: &mut ChatOptions,
        hook: &str,
    ) {
        let middleware = self.middleware.clone();
        for mw in &middleware {
            let failed = {
                let mut cx = TurnContext {
                    services: HookServices { state: &mut self.state, events },
                    options: &mut *options,
                };
                let result = if hook == "before_turn" {
                    mw.before_turn(&mut cx).await
                } else {
                    mw.after_turn(&mut cx).await
                };
                result.err()
            };
            if let Some(e) = failed {
                let name = mw.name().to_string();
                capture_hook_failure(&middleware, &mut self.state, events, &name, hook, e).await;
            }
        }
    }

    async fn finish_completed(
        &mut self,
        events: &EventCoordinator,
        options: &mut ChatOptions,
        final_text: Option<&str>,
    ) -> TurnOutcome {
        if self.config.structured_output.enabled && self.config.structured_output.schema.is_some() {
            match final_text.map(serde_json::from_str::<serde_json::Value>) {
                Some(Ok(payload)) => {
                    let _ = events.emit(AgentEventKind::StructuredOutputProduced { payload });
                }
                Some(Err(e)) => {
                    let _ = events.emit(AgentEventKind::StructuredOutputFailed {
                        error: format!("final text is not valid JSON: {e}"),
                    });
                }
                None => {
                    let _ = events.emit(AgentEventKind::StructuredOutputFailed {
                        error: "turn produced no final text".to_string(),
                    });
                }
            }
        }
        self.run_turn_hooks(events, options, "after_turn").await;
        let _ = events.emit(AgentEventKind::TurnFinished);
        TurnOutcome::Completed
    }

    async fn finish_terminated(
        &mut self,
        events: &EventCoordinator,
        options: &mut ChatOptions,
    ) -> TurnOutcome {
        let reason = self
            .state
            .termination_reason
            .clone()
            .unwrap_or_else(|| "terminated".to_string());
        let _ = events.emit(AgentEventKind::Terminated { reason: reason.clone() });
        self.run_turn_hooks(events, options, "after_turn").await;
        let _ = events.emit(AgentEventKind::TurnFinished);
        TurnOutcome::Terminated { reason }
    }

    async fn finish_cancelled(
        &mut self,
        events: &EventCoordinator,
        options: &mut ChatOptions,
    ) -> TurnOutcome {
        // Close any dangling tool calls so the message list stays
        // consistent for the next turn or resume.
        close_open_tool_calls(&mut self.state);
        let _ = events.emit(AgentEventKind::Cancelled { iteration: self.state.iteration });
        self.run_turn_hooks(events, options, "after_turn").await;
        let _ = events.emit(AgentEventKind::TurnFinished);
        TurnOutcome::Cancelled
    }

    /// Persist the state at an iteration boundary.
    ///
    /// A write failure is logged and reported as an event; it fails the
    /// turn only when checkpointing is declared required.
    async fn write_checkpoint(&mut self, events: &EventCoordinator) -> anyhow::Result<()> {
        if !self.config.checkpointing.enabled {
            return Ok(());
        }
        let store = match &self.checkpoint_store {
            Some(s) => Arc::clone(s),
            None => return Ok(()),
        };
        let checkpoint = Checkpoint::capture(&self.state.conversation_id, &self.state);
        if let Err(e) = store.save(&checkpoint).await {
            warn!(error = %e, "checkpoint write failed");
            if self.config.checkpointing.required {
                let _ = events.emit(AgentEventKind::Fatal {
                    message: format!("required checkpoint write failed: {e}"),
                });
                let _ = events.emit(AgentEventKind::TurnFinished);
                return Err(e);
            }
            let _ = events.emit(AgentEventKind::MiddlewareError {
                middleware: "checkpointing".to_string(),
                hook: "iteration-boundary".to_string(),
                error: e.to_string(),
            });
        }
        Ok(())
    }
}

/// Match override results to calls by id; calls with no override get an
/// explanatory error result so every request stays answered.
fn synthesize_skipped_outputs(
    calls: &[ToolCall],
    overrides: Vec<ToolOutput>,
) -> Vec<ToolOutput> {
    let mut by_id: HashMap<String, ToolOutput> =
        overrides.into_iter().map(|o| (o.call_id.clone(), o)).collect();
    calls
        .iter()
        .map(|call| {
            by_id
                .remove(&call.id)
                .unwrap_or_else(|| ToolOutput::err(&call.id, "tool execution skipped"))
        })
        .collect()
}

/// Append an error result for every tool-call request that has none.
fn close_open_tool_calls(state: &mut AgentLoopState) {
    let answered: HashSet<String> = state
        .current_messages
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();
    let open: Vec<String> = state
        .current_messages
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolCall { tool_call_id, .. } if !answered.contains(tool_call_id) => {
                Some(tool_call_id.clone())
            }
            _ => None,
        })
        .collect();
    for id in open {
        state
            .current_messages
            .push(Message::tool_error(&id, "cancelled before execution"));
    }
}

#[derive(Debug)]
enum ModelCallError {
    Cancelled,
    Backend(CoreError),
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolCall {
        // Always resolve to a JSON object: a null or unparseable argument
        // payload would poison the conversation history on the next
        // request.
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => {
                    warn!(
                        tool_name = %self.name,
                        tool_call_id = %self.id,
                        error = %parse_err,
                        "model sent tool call with invalid JSON arguments; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        ToolCall { id: self.id, name: self.name, args }
    }
}
