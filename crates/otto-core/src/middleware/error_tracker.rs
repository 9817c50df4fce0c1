// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::events::AgentEventKind;
use crate::middleware::{AfterIterationContext, ErrorContext, Middleware};

pub const ERROR_TRACKING_KEY: &str = "error-tracking";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTrackerState {
    pub consecutive_failures: u32,
}

/// Terminates the turn after too many consecutive errors.
///
/// Every captured error (tool, middleware, backend) bumps the counter;
/// an iteration whose tool calls all succeeded resets it.
pub struct ErrorTrackerMiddleware {
    max_consecutive_errors: u32,
}

impl ErrorTrackerMiddleware {
    pub fn new(max_consecutive_errors: u32) -> Self {
        Self { max_consecutive_errors }
    }
}

#[async_trait]
impl Middleware for ErrorTrackerMiddleware {
    fn name(&self) -> &str {
        "error-tracker"
    }

    fn state_key(&self) -> Option<&str> {
        Some(ERROR_TRACKING_KEY)
    }

    async fn on_error(&self, cx: &mut ErrorContext<'_>) -> anyhow::Result<()> {
        let mut failures = 0;
        cx.services
            .state
            .middleware_state
            .update::<ErrorTrackerState>(ERROR_TRACKING_KEY, |prev| {
                failures = prev.map(|p| p.consecutive_failures).unwrap_or(0) + 1;
                ErrorTrackerState { consecutive_failures: failures }
            });

        if failures >= self.max_consecutive_errors {
            let reason = format!(
                "terminating after {failures} consecutive errors (limit {}): {}",
                self.max_consecutive_errors, cx.error
            );
            cx.services.state.terminate(reason.clone());

            // Observability: structured log line, a state snapshot for
            // post-mortem, and a user-visible notice on the stream.
            error!(
                agent = cx.services.agent_name(),
                failures,
                source = cx.source,
                "consecutive error limit reached; terminating turn"
            );
            let snapshot =
                serde_json::to_value(&*cx.services.state).unwrap_or(serde_json::Value::Null);
            let _ = cx.services.events.emit(AgentEventKind::StateSnapshot { state: snapshot });
            let _ = cx.services.events.emit(AgentEventKind::TextDelta {
                text: format!(
                    "\n[agent stopped: {failures} consecutive errors — last: {}]\n",
                    cx.error
                ),
            });
        }
        Ok(())
    }

    async fn after_iteration(&self, cx: &mut AfterIterationContext<'_>) -> anyhow::Result<()> {
        let all_succeeded = cx.results.iter().all(|r| !r.is_error);
        if all_succeeded {
            cx.services
                .state
                .middleware_state
                .update::<ErrorTrackerState>(ERROR_TRACKING_KEY, |_| ErrorTrackerState {
                    consecutive_failures: 0,
                });
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
