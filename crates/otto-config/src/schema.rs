// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    50
}

fn default_max_consecutive_errors() -> u32 {
    3
}

fn default_reduction_target_count() -> usize {
    20
}

fn default_reduction_threshold() -> usize {
    5
}

fn default_permission_timeout_secs() -> u64 {
    60
}

fn default_max_consecutive_identical_calls() -> u32 {
    3
}

fn default_tool_result_token_cap() -> usize {
    4096
}

/// Top-level configuration for one agent loop.
///
/// Every field has a serde default so a partial (or empty) document
/// deserialises into a usable configuration.  Collaborator objects
/// (chat client, checkpoint store, tool handlers) are wired at build
/// time, not configured here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Upper bound on model round-trips per turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Consecutive-failure threshold for the error-tracking middleware.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default)]
    pub history_reduction: HistoryReductionConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub continuation: ContinuationConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub checkpointing: CheckpointingConfig,
    #[serde(default)]
    pub structured_output: StructuredOutputConfig,
    /// Token cap applied to each tool result before it is appended to the
    /// conversation history.  Oversized results are truncated; 0 disables
    /// the cap entirely.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// When the model requests a tool that is not in the visible set, the
    /// default is to append a synthetic error result and keep iterating.
    /// Setting this promotes the unknown-tool case to a turn termination.
    #[serde(default)]
    pub terminate_on_unknown_tool: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_consecutive_errors: default_max_consecutive_errors(),
            history_reduction: HistoryReductionConfig::default(),
            permissions: PermissionsConfig::default(),
            continuation: ContinuationConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            checkpointing: CheckpointingConfig::default(),
            structured_output: StructuredOutputConfig::default(),
            tool_result_token_cap: default_tool_result_token_cap(),
            terminate_on_unknown_tool: false,
        }
    }
}

/// Strategy used to shrink the outgoing message list when the history
/// grows past `target_count + threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReductionStrategy {
    /// Deterministic: replace the prefix with a counted digest message.
    /// No model call is made — always succeeds regardless of history size.
    #[default]
    MessageCounting,
    /// Replace the prefix with a model-generated summary.  Falls back to
    /// message counting when the summary call fails or returns empty.
    Summarizing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryReductionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: ReductionStrategy,
    /// Number of recent messages preserved verbatim after a reduction.
    #[serde(default = "default_reduction_target_count")]
    pub target_count: usize,
    /// Slack above `target_count` before a reduction fires, so the loop
    /// does not re-reduce on every appended message.
    #[serde(default = "default_reduction_threshold")]
    pub threshold: usize,
}

impl Default for HistoryReductionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: ReductionStrategy::default(),
            target_count: default_reduction_target_count(),
            threshold: default_reduction_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long a permission request may stay unanswered before it is
    /// resolved by policy (deny, or suspend — see `suspend_on_timeout`).
    #[serde(default = "default_permission_timeout_secs")]
    pub timeout_secs: u64,
    /// When no responder answers within the timeout, suspend the turn
    /// (checkpoint + orderly stream end) instead of treating the request
    /// as denied.  The caller delivers the response out of band and
    /// resumes from the checkpoint.
    #[serde(default)]
    pub suspend_on_timeout: bool,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_permission_timeout_secs(),
            suspend_on_timeout: false,
        }
    }
}

/// Continuation permission: when enabled, reaching the iteration limit
/// asks the caller to extend the turn instead of terminating outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// How long an extension request may stay unanswered.  An unanswered
    /// request terminates the turn at the current limit.
    #[serde(default = "default_permission_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self { enabled: false, timeout_secs: default_permission_timeout_secs() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of back-to-back identical calls (same tool, same arguments)
    /// after which further calls to that tool are suppressed.
    #[serde(default = "default_max_consecutive_identical_calls")]
    pub max_consecutive_identical_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_consecutive_identical_calls: default_max_consecutive_identical_calls(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// When set, a failed checkpoint write fails the turn instead of
    /// being logged and ignored.
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredOutputConfig {
    #[serde(default)]
    pub enabled: bool,
    /// JSON Schema the final assistant text must conform to.
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
