// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use otto_tools::ToolOutput;

use crate::middleware::{FunctionContext, Middleware};

pub const CIRCUIT_BREAKER_KEY: &str = "circuit-breaker";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStreak {
    pub consecutive_count: u32,
    pub last_signature: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub tools: BTreeMap<String, ToolCallStreak>,
}

/// Suppresses a tool once the model repeats the identical call too many
/// times in a row.
///
/// The signature hashes tool name plus canonical argument JSON; a
/// different argument set resets the streak for that tool.
pub struct CircuitBreakerMiddleware {
    max_consecutive_identical_calls: u32,
}

impl CircuitBreakerMiddleware {
    pub fn new(max_consecutive_identical_calls: u32) -> Self {
        Self { max_consecutive_identical_calls }
    }
}

/// Hash `(tool_name, arguments)` into a stable hex signature.
///
/// serde_json renders object keys in sorted order, so two argument maps
/// with the same contents produce the same signature regardless of the
/// order the model emitted them in.
pub fn call_signature(name: &str, args: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    hasher.update(args.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit-breaker"
    }

    fn state_key(&self) -> Option<&str> {
        Some(CIRCUIT_BREAKER_KEY)
    }

    async fn before_function(&self, cx: &mut FunctionContext<'_>) -> anyhow::Result<()> {
        if cx.block_execution {
            return Ok(());
        }
        let signature = call_signature(&cx.call.name, &cx.call.args);
        let mut count = 0;
        let tool_name = cx.call.name.clone();
        cx.services
            .state
            .middleware_state
            .update::<CircuitBreakerState>(CIRCUIT_BREAKER_KEY, |prev| {
                let mut next = prev.map(|p| (*p).clone()).unwrap_or_default();
                let streak = next.tools.entry(tool_name.clone()).or_default();
                if streak.last_signature == signature {
                    streak.consecutive_count += 1;
                } else {
                    streak.last_signature = signature.clone();
                    streak.consecutive_count = 1;
                }
                count = streak.consecutive_count;
                next
            });

        if count >= self.max_consecutive_identical_calls {
            warn!(
                tool = %cx.call.name,
                count,
                "identical call repeated; suppressing execution"
            );
            cx.block_execution = true;
            cx.override_result = Some(ToolOutput::err(
                &cx.call.id,
                format!(
                    "call suppressed: '{}' was invoked with identical arguments {count} times \
                     in a row. Change the arguments or try a different approach.",
                    cx.call.name
                ),
            ));
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
