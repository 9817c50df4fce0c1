// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use otto_config::CoreConfig;
use otto_tools::{validate_args, ToolCall, ToolHandler, ToolOutput, ToolSet};

use crate::coordinator::EventCoordinator;
use crate::error::CoreError;
use crate::events::AgentEventKind;
use crate::middleware::containers::{expanded_containers, record_activation};
use crate::middleware::{
    capture_hook_failure, fire_on_error, AfterFunctionContext, FunctionContext, HookServices,
    Middleware, ParallelBatchContext,
};
use crate::state::{AgentLoopState, CompletedFunction};

/// The outcome of one iteration's tool batch.
#[derive(Debug)]
pub(crate) struct BatchOutcome {
    /// One output per requested call, in request order.
    pub outputs: Vec<ToolOutput>,
    /// Set when a BeforeFunction hook chose to suspend the turn; no tool
    /// ran and `outputs` must be discarded.
    pub suspended: Option<String>,
}

/// How a single call will be handled after planning.
enum Planned {
    /// Resolved function, bound arguments, ready to execute.
    Ready { handler: Arc<dyn ToolHandler>, bound: ToolCall, parallel_safe: bool },
    /// Result produced without execution (container activation, unknown
    /// tool, validation failure, blocked call).  The optional exception
    /// marker is what AfterFunction observes.
    Immediate { output: ToolOutput, exception: Option<String>, run_hooks: bool },
}

/// Execute the batch of calls the model requested for one iteration.
///
/// Honours per-call middleware wrapping, the parallel-batch veto, the
/// unknown-tool policy, container activation, and the turn cancellation
/// signal.  Always yields exactly one output per call; cancelled or
/// abandoned calls get a cancellation error in their slot.
pub(crate) async fn execute_batch(
    tools: &ToolSet,
    middleware: &[Arc<dyn Middleware>],
    config: &CoreConfig,
    events: &EventCoordinator,
    state: &mut AgentLoopState,
    calls: &[ToolCall],
    cancel: &CancellationToken,
) -> Result<BatchOutcome, CoreError> {
    // At most one result payload per call id within a turn.
    let mut seen = HashSet::new();
    for call in calls {
        if !seen.insert(call.id.as_str()) {
            return Err(CoreError::StateConsistency(format!(
                "duplicate tool call id '{}' in one batch",
                call.id
            )));
        }
    }

    // Plan every call, then run BeforeFunction hooks in call order.
    let mut planned: Vec<Planned> = Vec::with_capacity(calls.len());
    for call in calls {
        planned.push(plan_call(tools, config, state, call));
    }

    for (call, plan) in calls.iter().zip(planned.iter_mut()) {
        let run_hooks = match plan {
            Planned::Ready { .. } => true,
            Planned::Immediate { run_hooks, .. } => *run_hooks,
        };
        if !run_hooks {
            continue;
        }
        let descriptor = tools.descriptor(&call.name);
        let mut block_execution = false;
        let mut override_result: Option<ToolOutput> = None;
        for mw in middleware {
            let mut cx = FunctionContext {
                services: HookServices { state: &mut *state, events },
                call,
                descriptor,
                block_execution,
                override_result: override_result.take(),
                suspend_request: None,
            };
            let hook_result = mw.before_function(&mut cx).await;
            block_execution = cx.block_execution;
            override_result = cx.override_result.take();
            let suspend = cx.suspend_request.take();
            if let Err(e) = hook_result {
                let name = mw.name().to_string();
                capture_hook_failure(middleware, state, events, &name, "before_function", e)
                    .await;
            }
            if suspend.is_some() {
                return Ok(BatchOutcome { outputs: Vec::new(), suspended: suspend });
            }
            if block_execution {
                break;
            }
        }
        if block_execution {
            let output = override_result
                .unwrap_or_else(|| ToolOutput::err(&call.id, "execution blocked"));
            *plan = Planned::Immediate {
                output,
                exception: Some("suppressed".to_string()),
                run_hooks: true,
            };
        }
    }

    // Parallel only when the batch has several executable calls, none
    // opted out, and no middleware vetoed it.
    let executable: Vec<usize> = planned
        .iter()
        .enumerate()
        .filter(|(_, p)| matches!(p, Planned::Ready { .. }))
        .map(|(i, _)| i)
        .collect();
    let mut parallel = executable.len() > 1
        && executable.iter().all(|&i| match &planned[i] {
            Planned::Ready { parallel_safe, .. } => *parallel_safe,
            Planned::Immediate { .. } => true,
        });
    if parallel {
        let mut allow_parallel = true;
        for mw in middleware {
            let mut cx = ParallelBatchContext {
                services: HookServices { state: &mut *state, events },
                calls,
                allow_parallel,
            };
            let hook_result = mw.before_parallel_batch(&mut cx).await;
            allow_parallel = cx.allow_parallel;
            if let Err(e) = hook_result {
                let name = mw.name().to_string();
                capture_hook_failure(middleware, state, events, &name, "before_parallel_batch", e)
                    .await;
            }
        }
        parallel = allow_parallel;
    }

    // Execute.  Tasks are isolated: one panic fills one slot.
    let mut results: Vec<(ToolOutput, Option<String>)> = Vec::with_capacity(planned.len());
    if parallel {
        let mut tasks = Vec::with_capacity(planned.len());
        for plan in &planned {
            match plan {
                Planned::Ready { handler, bound, .. } => {
                    let handler = Arc::clone(handler);
                    let call = bound.clone();
                    let child = cancel.child_token();
                    tasks.push(Some(tokio::spawn(
                        async move { handler.execute(&call, child).await },
                    )));
                }
                Planned::Immediate { .. } => tasks.push(None),
            }
        }
        for (i, task) in tasks.into_iter().enumerate() {
            match task {
                Some(mut task) => {
                    let joined = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        joined = &mut task => Some(joined),
                    };
                    let outcome = match joined {
                        None => {
                            task.abort();
                            (
                                ToolOutput::err(&calls[i].id, "cancelled before completion"),
                                Some("cancelled".to_string()),
                            )
                        }
                        Some(Ok(output)) => (output, None),
                        Some(Err(e)) => (
                            ToolOutput::err(
                                &calls[i].id,
                                format!("tool execution panicked: {e}"),
                            ),
                            Some(format!("panic: {e}")),
                        ),
                    };
                    results.push(outcome);
                }
                None => match &planned[i] {
                    Planned::Immediate { output, exception, .. } => {
                        results.push((output.clone(), exception.clone()))
                    }
                    Planned::Ready { .. } => unreachable!("ready plans spawn tasks"),
                },
            }
        }
    } else {
        for (i, plan) in planned.iter().enumerate() {
            match plan {
                Planned::Ready { handler, bound, .. } => {
                    if cancel.is_cancelled() {
                        results.push((
                            ToolOutput::err(&calls[i].id, "cancelled before execution"),
                            Some("cancelled".to_string()),
                        ));
                        continue;
                    }
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => (
                            ToolOutput::err(&calls[i].id, "cancelled before completion"),
                            Some("cancelled".to_string()),
                        ),
                        output = handler.execute(bound, cancel.child_token()) => (output, None),
                    };
                    results.push(outcome);
                }
                Planned::Immediate { output, exception, .. } => {
                    results.push((output.clone(), exception.clone()));
                }
            }
        }
    }

    // AfterFunction hooks in call order, then per-call bookkeeping.
    let mut outputs = Vec::with_capacity(results.len());
    for (i, (mut output, exception)) in results.into_iter().enumerate() {
        let call = &calls[i];
        let run_hooks = match &planned[i] {
            Planned::Ready { .. } => true,
            Planned::Immediate { run_hooks, .. } => *run_hooks,
        };
        if run_hooks {
            for mw in middleware {
                let failed = {
                    let mut cx = AfterFunctionContext {
                        services: HookServices { state: &mut *state, events },
                        call,
                        output: &mut output,
                        exception: exception.as_deref(),
                    };
                    mw.after_function(&mut cx).await.err()
                };
                if let Some(e) = failed {
                    let name = mw.name().to_string();
                    capture_hook_failure(middleware, state, events, &name, "after_function", e)
                        .await;
                }
            }
        }

        state.completed_functions.push(CompletedFunction {
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

        if output.is_error {
            let error = CoreError::ToolFailure {
                name: call.name.clone(),
                message: output.content.clone(),
            };
            fire_on_error(middleware, state, events, &error, "tool-executor").await;
        }
        outputs.push(output);
    }

    Ok(BatchOutcome { outputs, suspended: None })
}

/// Resolve one call into an execution plan.
fn plan_call(
    tools: &ToolSet,
    config: &CoreConfig,
    state: &mut AgentLoopState,
    call: &ToolCall,
) -> Planned {
    // Container activation: expand, record instructions, return the
    // activation payload.  Dynamic text is evaluated exactly once, here.
    if let Some(container) = tools.container(&call.name) {
        let function_result = container.function_result.resolve();
        let system_prompt = container.system_prompt.as_ref().map(|t| t.resolve());
        record_activation(state, &container.name, function_result.clone(), system_prompt);
        return Planned::Immediate {
            output: ToolOutput::ok(&call.id, function_result),
            exception: None,
            run_hooks: false,
        };
    }

    let expanded = expanded_containers(state);
    if !tools.is_function_visible(&call.name, &expanded) {
        warn!(tool = %call.name, "model requested a tool outside the visible set");
        if config.terminate_on_unknown_tool {
            state.terminate(format!("model requested unknown tool '{}'", call.name));
        }
        return Planned::Immediate {
            output: ToolOutput::err(
                &call.id,
                format!("unknown tool: '{}' is not available", call.name),
            ),
            exception: Some("unknown-tool".to_string()),
            run_hooks: false,
        };
    }

    let descriptor = match tools.descriptor(&call.name) {
        Some(d) => d,
        None => {
            return Planned::Immediate {
                output: ToolOutput::err(&call.id, format!("unknown tool: '{}'", call.name)),
                exception: Some("unknown-tool".to_string()),
                run_hooks: false,
            }
        }
    };
    match validate_args(descriptor, &call.args) {
        Ok(bound_args) => match tools.handler(&call.name) {
            Some(handler) => Planned::Ready {
                handler,
                bound: ToolCall { id: call.id.clone(), name: call.name.clone(), args: bound_args },
                parallel_safe: descriptor.parallel_safe,
            },
            None => Planned::Immediate {
                output: ToolOutput::err(&call.id, format!("unknown tool: '{}'", call.name)),
                exception: Some("unknown-tool".to_string()),
                run_hooks: false,
            },
        },
        Err(reason) => Planned::Immediate {
            output: ToolOutput::err(&call.id, format!("invalid arguments: {reason}")),
            exception: Some("validation".to_string()),
            run_hooks: true,
        },
    }
}

/// Cap a tool result at `cap_tokens` (4 chars per token), marking the cut.
pub(crate) fn truncate_output(content: &str, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let mut cut = cap_chars;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated after ~{cap_tokens} tokens]", &content[..cut])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::coordinator::ResponseRouter;
    use otto_tools::{ContainerDescriptor, ToolDescriptor, ToolSetBuilder};

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn execute(&self, call: &ToolCall, _cancel: CancellationToken) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl ToolHandler for SlowHandler {
        async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolOutput {
            tokio::select! {
                _ = cancel.cancelled() => ToolOutput::err(&call.id, "stopped"),
                _ = tokio::time::sleep(Duration::from_secs(30)) => ToolOutput::ok(&call.id, "slow done"),
            }
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl ToolHandler for PanicHandler {
        async fn execute(&self, _call: &ToolCall, _cancel: CancellationToken) -> ToolOutput {
            panic!("deliberate test panic");
        }
    }

    fn toolset() -> ToolSet {
        ToolSetBuilder::new()
            .register(
                ToolDescriptor::new(
                    "echo",
                    "echoes",
                    json!({"type": "object", "properties": {"x": {"type": "integer"}}, "required": ["x"]}),
                ),
                Arc::new(EchoHandler),
            )
            .register(
                ToolDescriptor::new("slow", "sleeps", json!({"type": "object"})),
                Arc::new(SlowHandler),
            )
            .register(
                ToolDescriptor::new("boom", "panics", json!({"type": "object"})),
                Arc::new(PanicHandler),
            )
            .register(
                ToolDescriptor::new("fetch", "gated", json!({"type": "object"})).with_parent("web"),
                Arc::new(EchoHandler),
            )
            .register_container(ContainerDescriptor::new(
                "web",
                "web tools",
                vec!["fetch".into()],
                "web unlocked",
            ))
            .build()
            .unwrap()
    }

    struct Harness {
        state: AgentLoopState,
        events: EventCoordinator,
        rx: mpsc::UnboundedReceiver<crate::events::AgentEvent>,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        Harness {
            state: AgentLoopState::new("otto", "conv"),
            events: EventCoordinator::new(tx, "otto", Arc::new(ResponseRouter::new())),
            rx,
        }
    }

    async fn run(
        h: &mut Harness,
        tools: &ToolSet,
        calls: &[ToolCall],
    ) -> Result<BatchOutcome, CoreError> {
        execute_batch(
            tools,
            &[],
            &CoreConfig::default(),
            &h.events,
            &mut h.state,
            calls,
            &CancellationToken::new(),
        )
        .await
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall { id: id.into(), name: name.into(), args }
    }

    #[tokio::test]
    async fn executes_a_valid_call() {
        let tools = toolset();
        let mut h = harness();
        let out = run(&mut h, &tools, &[call("c1", "echo", json!({"x": 1}))]).await.unwrap();
        assert_eq!(out.outputs.len(), 1);
        assert!(!out.outputs[0].is_error);
        assert!(out.outputs[0].content.contains("echo:"));
        assert_eq!(h.state.completed_functions.len(), 1);
        assert!(h.state.completed_functions[0].success);
    }

    #[tokio::test]
    async fn unknown_keys_discarded_before_execution() {
        let tools = toolset();
        let mut h = harness();
        let out = run(&mut h, &tools, &[call("c1", "echo", json!({"x": 1, "junk": true}))])
            .await
            .unwrap();
        assert!(!out.outputs[0].content.contains("junk"));
    }

    #[tokio::test]
    async fn missing_required_arg_fails_without_running() {
        let tools = toolset();
        let mut h = harness();
        let out = run(&mut h, &tools, &[call("c1", "echo", json!({}))]).await.unwrap();
        assert!(out.outputs[0].is_error);
        assert!(out.outputs[0].content.contains("missing required parameter"));
    }

    #[tokio::test]
    async fn unknown_tool_yields_synthetic_error() {
        let tools = toolset();
        let mut h = harness();
        let out = run(&mut h, &tools, &[call("c1", "nope", json!({}))]).await.unwrap();
        assert!(out.outputs[0].is_error);
        assert!(out.outputs[0].content.contains("unknown tool"));
        assert!(!h.state.is_terminated);
    }

    #[tokio::test]
    async fn unknown_tool_can_terminate_by_policy() {
        let tools = toolset();
        let mut h = harness();
        let config = CoreConfig { terminate_on_unknown_tool: true, ..Default::default() };
        let out = execute_batch(
            &tools,
            &[],
            &config,
            &h.events,
            &mut h.state,
            &[call("c1", "nope", json!({}))],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.outputs[0].is_error);
        assert!(h.state.is_terminated);
    }

    #[tokio::test]
    async fn hidden_child_is_unknown_until_container_expands() {
        let tools = toolset();
        let mut h = harness();
        let out = run(&mut h, &tools, &[call("c1", "fetch", json!({}))]).await.unwrap();
        assert!(out.outputs[0].is_error, "child hidden while container collapsed");

        // Activate the container, then the child resolves.
        let out = run(&mut h, &tools, &[call("c2", "web", json!({}))]).await.unwrap();
        assert_eq!(out.outputs[0].content, "web unlocked");
        let out = run(&mut h, &tools, &[call("c3", "fetch", json!({}))]).await.unwrap();
        assert!(!out.outputs[0].is_error);
    }

    #[tokio::test]
    async fn container_in_batch_reveals_child_for_later_call() {
        let tools = toolset();
        let mut h = harness();
        let calls =
            vec![call("c1", "web", json!({})), call("c2", "fetch", json!({}))];
        let out = run(&mut h, &tools, &calls).await.unwrap();
        assert_eq!(out.outputs[0].content, "web unlocked");
        assert!(!out.outputs[1].is_error, "activation earlier in the batch reveals the child");
    }

    #[tokio::test]
    async fn panic_fills_only_its_own_slot() {
        let tools = toolset();
        let mut h = harness();
        let calls = vec![
            call("c1", "echo", json!({"x": 1})),
            call("c2", "boom", json!({})),
        ];
        let out = run(&mut h, &tools, &calls).await.unwrap();
        assert!(!out.outputs[0].is_error);
        assert!(out.outputs[1].is_error);
        assert!(out.outputs[1].content.contains("panicked"));
    }

    #[tokio::test]
    async fn duplicate_call_ids_are_fatal() {
        let tools = toolset();
        let mut h = harness();
        let calls = vec![
            call("dup", "echo", json!({"x": 1})),
            call("dup", "echo", json!({"x": 2})),
        ];
        let err = run(&mut h, &tools, &calls).await.unwrap_err();
        assert!(matches!(err, CoreError::StateConsistency(_)));
    }

    #[tokio::test]
    async fn cancellation_fills_slots_with_errors() {
        let tools = toolset();
        let mut h = harness();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel2.cancel();
        });
        let out = execute_batch(
            &tools,
            &[],
            &CoreConfig::default(),
            &h.events,
            &mut h.state,
            &[call("c1", "slow", json!({}))],
            &cancel,
        )
        .await
        .unwrap();
        assert!(out.outputs[0].is_error);
    }

    #[tokio::test]
    async fn finished_events_emitted_per_call() {
        let tools = toolset();
        let mut h = harness();
        let _ = run(&mut h, &tools, &[call("c1", "echo", json!({"x": 1}))]).await.unwrap();
        let mut finished = 0;
        while let Ok(e) = h.rx.try_recv() {
            if matches!(e.kind, AgentEventKind::ToolCallFinished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    // ── Truncation ────────────────────────────────────────────────────────────

    #[test]
    fn short_output_untouched() {
        assert_eq!(truncate_output("short", 100), "short");
    }

    #[test]
    fn long_output_is_capped_with_marker() {
        let long = "x".repeat(10_000);
        let out = truncate_output(&long, 100);
        assert!(out.len() < long.len());
        assert!(out.contains("[output truncated"));
    }

    #[test]
    fn zero_cap_disables_truncation() {
        let long = "x".repeat(10_000);
        assert_eq!(truncate_output(&long, 0), long);
    }
}
