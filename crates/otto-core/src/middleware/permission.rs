// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use otto_tools::ToolOutput;

use crate::coordinator::AwaitError;
use crate::events::{AgentEventKind, EventResponse, PermissionDecision};
use crate::middleware::{FunctionContext, Middleware};

pub const PERMISSIONS_KEY: &str = "permissions";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionState {
    /// Tools granted for the rest of the session via allow-always.
    pub session_grants: BTreeSet<String>,
}

/// Gates permission-requiring tools behind a bidirectional request.
///
/// Deny blocks the call and injects the denial as its result, so the
/// model sees the tool "fail" and can pivot.  An unanswered request is a
/// deny by default; with `suspend_on_timeout` it suspends the turn
/// instead, to be resumed after the caller answers out of band.
pub struct PermissionMiddleware {
    timeout: Duration,
    suspend_on_timeout: bool,
}

impl PermissionMiddleware {
    pub fn new(timeout: Duration, suspend_on_timeout: bool) -> Self {
        Self { timeout, suspend_on_timeout }
    }
}

#[async_trait]
impl Middleware for PermissionMiddleware {
    fn name(&self) -> &str {
        "permissions"
    }

    fn state_key(&self) -> Option<&str> {
        Some(PERMISSIONS_KEY)
    }

    async fn before_function(&self, cx: &mut FunctionContext<'_>) -> anyhow::Result<()> {
        if cx.block_execution {
            return Ok(());
        }
        let requires = cx.descriptor.map(|d| d.requires_permission).unwrap_or(false);
        if !requires {
            return Ok(());
        }
        let granted = cx
            .services
            .state
            .middleware_state
            .get::<PermissionState>(PERMISSIONS_KEY)
            .map(|s| s.session_grants.contains(&cx.call.name))
            .unwrap_or(false);
        if granted {
            return Ok(());
        }

        let request_id = cx.services.events.new_request_id();
        let request = AgentEventKind::PermissionRequested {
            request_id: request_id.clone(),
            source_name: self.name().to_string(),
            call_id: cx.call.id.clone(),
            tool_name: cx.call.name.clone(),
            arguments: cx.call.args.clone(),
        };

        let decision = match cx.services.events.emit_and_await(request, Some(self.timeout)).await {
            Ok(EventResponse::Permission(d)) => d,
            Ok(_) => {
                warn!(tool = %cx.call.name, "mismatched response type for permission request");
                PermissionDecision::Deny
            }
            Err(AwaitError::Timeout { .. }) if self.suspend_on_timeout => {
                cx.suspend_request = Some(request_id);
                return Ok(());
            }
            Err(e) => {
                warn!(tool = %cx.call.name, error = %e, "permission request unresolved; denying");
                PermissionDecision::Deny
            }
        };

        let _ = cx.services.events.emit(AgentEventKind::PermissionResolved {
            request_id,
            decision,
        });

        match decision {
            PermissionDecision::AllowOnce => {}
            PermissionDecision::AllowAlways => {
                let name = cx.call.name.clone();
                cx.services
                    .state
                    .middleware_state
                    .update::<PermissionState>(PERMISSIONS_KEY, |prev| {
                        let mut next = prev.map(|p| (*p).clone()).unwrap_or_default();
                        next.session_grants.insert(name.clone());
                        next
                    });
            }
            PermissionDecision::Deny => {
                cx.block_execution = true;
                cx.override_result = Some(ToolOutput::err(
                    &cx.call.id,
                    format!("permission denied for tool '{}'", cx.call.name),
                ));
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
