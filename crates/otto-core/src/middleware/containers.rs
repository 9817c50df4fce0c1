// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use otto_model::ToolSchema;
use otto_tools::{merge_protocol_block, protocol_block, strip_protocol_block, ToolSet};

use crate::middleware::{IterationContext, Middleware, TurnContext};
use crate::state::AgentLoopState;

pub const CONTAINER_VISIBILITY_KEY: &str = "container-visibility";

/// Text recorded when a container was activated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInstructions {
    pub function_result: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerVisibilityState {
    pub expanded_containers: BTreeSet<String>,
    /// Activation text per container.  Cleared at turn end; the expanded
    /// set itself survives so children stay visible on later turns.
    pub container_instructions: BTreeMap<String, ContainerInstructions>,
}

/// Record a container activation in the loop state.
///
/// Called by the tool executor when the model invokes a container:
/// expands it, and captures the resolved result/system-prompt text
/// (dynamic text is evaluated exactly once, here).
pub fn record_activation(
    state: &mut AgentLoopState,
    container: &str,
    function_result: String,
    system_prompt: Option<String>,
) {
    let name = container.to_string();
    state
        .middleware_state
        .update::<ContainerVisibilityState>(CONTAINER_VISIBILITY_KEY, |prev| {
            let mut next = prev.map(|p| (*p).clone()).unwrap_or_default();
            next.expanded_containers.insert(name.clone());
            next.container_instructions.insert(
                name.clone(),
                ContainerInstructions {
                    function_result: Some(function_result.clone()),
                    system_prompt: system_prompt.clone(),
                },
            );
            next
        });
}

/// The expanded-container set for the current state.
pub fn expanded_containers(state: &AgentLoopState) -> BTreeSet<String> {
    state
        .middleware_state
        .get::<ContainerVisibilityState>(CONTAINER_VISIBILITY_KEY)
        .map(|s| s.expanded_containers.clone())
        .unwrap_or_default()
}

/// Maintains the visible tool set and the "ACTIVE CONTAINER PROTOCOLS"
/// instruction block.
///
/// BeforeIteration recomputes tool visibility from the expanded set and
/// merges container system prompts into the request instructions under a
/// single alphabetized header.  AfterMessageTurn strips every protocol
/// fragment (stale rehydrated ones included) and clears the recorded
/// activation text.
pub struct ContainerVisibilityMiddleware {
    tools: Arc<ToolSet>,
}

impl ContainerVisibilityMiddleware {
    pub fn new(tools: Arc<ToolSet>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl Middleware for ContainerVisibilityMiddleware {
    fn name(&self) -> &str {
        "container-visibility"
    }

    fn state_key(&self) -> Option<&str> {
        Some(CONTAINER_VISIBILITY_KEY)
    }

    async fn before_iteration(&self, cx: &mut IterationContext<'_>) -> anyhow::Result<()> {
        let vis_state = cx
            .services
            .state
            .middleware_state
            .get::<ContainerVisibilityState>(CONTAINER_VISIBILITY_KEY);
        let expanded = vis_state
            .as_ref()
            .map(|s| s.expanded_containers.clone())
            .unwrap_or_default();

        cx.options.tools = self
            .tools
            .visible_schemas(&expanded)
            .into_iter()
            .map(|t| ToolSchema {
                name: t.name,
                description: t.description,
                parameters: t.parameters,
            })
            .collect();

        // Collect system prompts: activation-recorded text wins; for
        // expansions rehydrated from an earlier turn (instructions were
        // cleared) fall back to the declared container text.
        let mut prompts: BTreeMap<String, String> = BTreeMap::new();
        for name in &expanded {
            let recorded = vis_state
                .as_ref()
                .and_then(|s| s.container_instructions.get(name))
                .and_then(|i| i.system_prompt.clone());
            let text = match recorded {
                Some(t) => Some(t),
                None => self
                    .tools
                    .container(name)
                    .and_then(|c| c.system_prompt.as_ref())
                    .map(|t| t.resolve()),
            };
            if let Some(t) = text {
                prompts.insert(name.clone(), t);
            }
        }

        let base = cx.options.instructions.as_deref().and_then(strip_protocol_block);
        cx.options.instructions = match protocol_block(&prompts) {
            Some(block) => Some(merge_protocol_block(base.as_deref(), &block)),
            None => base,
        };
        Ok(())
    }

    async fn after_turn(&self, cx: &mut TurnContext<'_>) -> anyhow::Result<()> {
        cx.options.instructions =
            cx.options.instructions.as_deref().and_then(strip_protocol_block);
        if cx
            .services
            .state
            .middleware_state
            .contains(CONTAINER_VISIBILITY_KEY)
        {
            cx.services
                .state
                .middleware_state
                .update::<ContainerVisibilityState>(CONTAINER_VISIBILITY_KEY, |prev| {
                    let mut next = prev.map(|p| (*p).clone()).unwrap_or_default();
                    next.container_instructions.clear();
                    next
                });
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::coordinator::{EventCoordinator, ResponseRouter};
    use crate::middleware::HookServices;
    use otto_model::ChatOptions;
    use otto_tools::{
        ContainerDescriptor, ToolCall, ToolDescriptor, ToolHandler, ToolOutput, ToolSetBuilder,
        CONTAINER_PROTOCOL_HEADER,
    };

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn execute(&self, call: &ToolCall, _cancel: CancellationToken) -> ToolOutput {
            ToolOutput::ok(&call.id, "ok")
        }
    }

    fn toolset() -> Arc<ToolSet> {
        Arc::new(
            ToolSetBuilder::new()
                .register(
                    ToolDescriptor::new("calc", "math", json!({"type": "object"})),
                    Arc::new(NoopHandler),
                )
                .register(
                    ToolDescriptor::new("fetch", "http get", json!({"type": "object"}))
                        .with_parent("web"),
                    Arc::new(NoopHandler),
                )
                .register_container(
                    ContainerDescriptor::new(
                        "web",
                        "web tools",
                        vec!["fetch".into()],
                        "web tools unlocked",
                    )
                    .with_system_prompt("Always cite URLs."),
                )
                .build()
                .unwrap(),
        )
    }

    fn harness() -> (
        AgentLoopState,
        EventCoordinator,
        mpsc::UnboundedReceiver<crate::events::AgentEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = EventCoordinator::new(tx, "otto", Arc::new(ResponseRouter::new()));
        (AgentLoopState::new("otto", "conv"), coordinator, rx)
    }

    async fn run_before(
        mw: &ContainerVisibilityMiddleware,
        state: &mut AgentLoopState,
        events: &EventCoordinator,
        options: &mut ChatOptions,
    ) {
        let mut working = Vec::new();
        let mut cx = IterationContext {
            services: HookServices { state, events },
            iteration: 0,
            working_messages: &mut working,
            options,
            skip_llm_call: false,
            override_response: None,
        };
        mw.before_iteration(&mut cx).await.unwrap();
    }

    #[tokio::test]
    async fn collapsed_container_appears_as_tool() {
        let (mut state, events, _rx) = harness();
        let mw = ContainerVisibilityMiddleware::new(toolset());
        let mut options = ChatOptions::default();
        run_before(&mw, &mut state, &events, &mut options).await;

        let names: Vec<&str> = options.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["web", "calc"]);
        assert!(options.instructions.is_none(), "no protocols while collapsed");
    }

    #[tokio::test]
    async fn activation_expands_and_injects_protocols() {
        let (mut state, events, _rx) = harness();
        record_activation(
            &mut state,
            "web",
            "web tools unlocked".into(),
            Some("Always cite URLs.".into()),
        );
        let mw = ContainerVisibilityMiddleware::new(toolset());
        let mut options = ChatOptions::default();
        options.instructions = Some("Be terse.".into());
        run_before(&mw, &mut state, &events, &mut options).await;

        let names: Vec<&str> = options.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["calc", "fetch"], "expanded container disappears");
        let instructions = options.instructions.unwrap();
        assert!(instructions.starts_with("Be terse."));
        assert!(instructions.contains(CONTAINER_PROTOCOL_HEADER));
        assert!(instructions.contains("Always cite URLs."));
    }

    #[tokio::test]
    async fn reinjection_does_not_duplicate_the_block() {
        let (mut state, events, _rx) = harness();
        record_activation(&mut state, "web", "unlocked".into(), Some("Cite.".into()));
        let mw = ContainerVisibilityMiddleware::new(toolset());
        let mut options = ChatOptions::default();
        options.instructions = Some("Base.".into());
        run_before(&mw, &mut state, &events, &mut options).await;
        run_before(&mw, &mut state, &events, &mut options).await;

        let instructions = options.instructions.unwrap();
        assert_eq!(instructions.matches(CONTAINER_PROTOCOL_HEADER).count(), 1);
    }

    #[tokio::test]
    async fn after_turn_strips_protocols_and_clears_instructions() {
        let (mut state, events, _rx) = harness();
        record_activation(&mut state, "web", "unlocked".into(), Some("Cite.".into()));
        let mw = ContainerVisibilityMiddleware::new(toolset());
        let mut options = ChatOptions::default();
        options.instructions = Some("Base.".into());
        run_before(&mw, &mut state, &events, &mut options).await;

        let mut cx = TurnContext {
            services: HookServices { state: &mut state, events: &events },
            options: &mut options,
        };
        mw.after_turn(&mut cx).await.unwrap();

        assert_eq!(options.instructions.as_deref(), Some("Base."));
        let s = state
            .middleware_state
            .get::<ContainerVisibilityState>(CONTAINER_VISIBILITY_KEY)
            .unwrap();
        assert!(s.container_instructions.is_empty(), "activation text cleared at turn end");
        assert!(s.expanded_containers.contains("web"), "expansion survives the turn");
    }

    #[tokio::test]
    async fn stale_rehydrated_fragment_is_stripped() {
        let (mut state, events, _rx) = harness();
        let mw = ContainerVisibilityMiddleware::new(toolset());
        // Options rehydrated from an old session still carry a block.
        let mut options = ChatOptions::default();
        options.instructions = Some(format!(
            "Base.\n\n{CONTAINER_PROTOCOL_HEADER}\n\n### web\nstale text"
        ));
        let mut cx = TurnContext {
            services: HookServices { state: &mut state, events: &events },
            options: &mut options,
        };
        mw.after_turn(&mut cx).await.unwrap();
        assert_eq!(options.instructions.as_deref(), Some("Base."));
    }

    #[tokio::test]
    async fn rehydrated_expansion_falls_back_to_declared_prompt() {
        let (mut state, events, _rx) = harness();
        // Expanded in a previous turn; instructions were cleared at its end.
        record_activation(&mut state, "web", "unlocked".into(), None);
        let mw = ContainerVisibilityMiddleware::new(toolset());
        let mut options = ChatOptions::default();
        run_before(&mw, &mut state, &events, &mut options).await;
        let instructions = options.instructions.unwrap();
        assert!(instructions.contains("Always cite URLs."), "declared text fills the gap");
    }
}
