// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::events::{AgentEventKind, EventResponse};
use crate::middleware::{IterationContext, Middleware};

pub const CONTINUATION_KEY: &str = "continuation-permission";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationState {
    pub initial_limit: u32,
    pub current_extended_limit: u32,
}

/// Asks the caller for more iterations instead of terminating at the cap.
///
/// The effective iteration limit lives in this middleware's sub-state;
/// an extend-by-N response raises it, anything else terminates the turn.
pub struct ContinuationMiddleware {
    initial_limit: u32,
    timeout: Duration,
}

impl ContinuationMiddleware {
    pub fn new(initial_limit: u32, timeout: Duration) -> Self {
        Self { initial_limit, timeout }
    }
}

#[async_trait]
impl Middleware for ContinuationMiddleware {
    fn name(&self) -> &str {
        "continuation-permission"
    }

    fn state_key(&self) -> Option<&str> {
        Some(CONTINUATION_KEY)
    }

    async fn before_iteration(&self, cx: &mut IterationContext<'_>) -> anyhow::Result<()> {
        let initial = self.initial_limit;
        let limit = cx
            .services
            .state
            .middleware_state
            .get::<ContinuationState>(CONTINUATION_KEY)
            .map(|s| s.current_extended_limit)
            .unwrap_or(initial);

        if cx.iteration + 1 <= limit {
            return Ok(());
        }

        let request_id = cx.services.events.new_request_id();
        let request = AgentEventKind::ContinuationRequested {
            request_id: request_id.clone(),
            source_name: self.name().to_string(),
            iterations_used: cx.iteration,
            current_limit: limit,
        };

        let extend_by = match cx.services.events.emit_and_await(request, Some(self.timeout)).await {
            Ok(EventResponse::Continuation { extend_by }) => extend_by,
            Ok(_) => {
                warn!("mismatched response type for continuation request");
                0
            }
            Err(e) => {
                warn!(error = %e, "continuation request unresolved; terminating at limit");
                0
            }
        };

        let _ = cx.services.events.emit(AgentEventKind::ContinuationResolved {
            request_id,
            extended_by: extend_by,
        });

        if extend_by > 0 {
            cx.services
                .state
                .middleware_state
                .update::<ContinuationState>(CONTINUATION_KEY, |prev| {
                    let current =
                        prev.map(|p| p.current_extended_limit).unwrap_or(initial);
                    ContinuationState {
                        initial_limit: initial,
                        current_extended_limit: current + extend_by,
                    }
                });
        } else {
            cx.services.state.terminate(format!(
                "iteration limit reached ({limit} iterations used, no extension granted)"
            ));
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::coordinator::{EventCoordinator, ResponseRouter};
    use crate::middleware::HookServices;
    use crate::state::AgentLoopState;
    use otto_model::ChatOptions;

    struct Harness {
        state: AgentLoopState,
        coordinator: EventCoordinator,
        router: Arc<ResponseRouter>,
        rx: mpsc::UnboundedReceiver<crate::events::AgentEvent>,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(ResponseRouter::new());
        Harness {
            state: AgentLoopState::new("otto", "conv"),
            coordinator: EventCoordinator::new(tx, "otto", Arc::clone(&router)),
            router,
            rx,
        }
    }

    async fn run_before_iteration(
        mw: &ContinuationMiddleware,
        h: &mut Harness,
        iteration: u32,
    ) {
        let mut working = Vec::new();
        let mut options = ChatOptions::default();
        let mut cx = IterationContext {
            services: HookServices { state: &mut h.state, events: &h.coordinator },
            iteration,
            working_messages: &mut working,
            options: &mut options,
            skip_llm_call: false,
            override_response: None,
        };
        mw.before_iteration(&mut cx).await.unwrap();
    }

    #[tokio::test]
    async fn below_the_limit_nothing_happens() {
        let mut h = harness();
        let mw = ContinuationMiddleware::new(5, Duration::from_secs(1));
        run_before_iteration(&mw, &mut h, 3).await;
        assert!(!h.state.is_terminated);
        assert_eq!(h.router.pending_count(), 0);
    }

    #[tokio::test]
    async fn extension_raises_the_limit() {
        let mut h = harness();
        let mw = ContinuationMiddleware::new(3, Duration::from_secs(5));

        let router = Arc::clone(&h.router);
        let mut rx = std::mem::replace(&mut h.rx, mpsc::unbounded_channel().1);
        let responder = tokio::spawn(async move {
            loop {
                let e = rx.recv().await.expect("stream closed");
                if let AgentEventKind::ContinuationRequested { request_id, current_limit, .. } =
                    &e.kind
                {
                    assert_eq!(*current_limit, 3);
                    router
                        .respond(request_id, EventResponse::Continuation { extend_by: 4 })
                        .unwrap();
                    return rx;
                }
            }
        });

        // Iteration index 3 → would be the 4th iteration, past the limit of 3.
        run_before_iteration(&mw, &mut h, 3).await;
        assert!(!h.state.is_terminated);
        let s = h.state.middleware_state.get::<ContinuationState>(CONTINUATION_KEY).unwrap();
        assert_eq!(s.initial_limit, 3);
        assert_eq!(s.current_extended_limit, 7);

        // The raised limit lets iterations 3..=6 proceed without a new request.
        run_before_iteration(&mw, &mut h, 6).await;
        assert!(!h.state.is_terminated);
        let _rx = responder.await.unwrap();
    }

    #[tokio::test]
    async fn zero_extension_terminates() {
        let mut h = harness();
        let mw = ContinuationMiddleware::new(2, Duration::from_secs(5));

        let router = Arc::clone(&h.router);
        let mut rx = std::mem::replace(&mut h.rx, mpsc::unbounded_channel().1);
        let responder = tokio::spawn(async move {
            loop {
                let e = rx.recv().await.expect("stream closed");
                if let AgentEventKind::ContinuationRequested { request_id, .. } = &e.kind {
                    router
                        .respond(request_id, EventResponse::Continuation { extend_by: 0 })
                        .unwrap();
                    return rx;
                }
            }
        });

        run_before_iteration(&mw, &mut h, 2).await;
        assert!(h.state.is_terminated);
        assert!(h.state.termination_reason.unwrap().contains("iteration limit"));
        let _rx = responder.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_terminates_at_the_limit() {
        let mut h = harness();
        let mw = ContinuationMiddleware::new(1, Duration::from_millis(20));
        run_before_iteration(&mw, &mut h, 1).await;
        assert!(h.state.is_terminated);
    }
}
