// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Correlation envelope stamped onto every event at emit time.
///
/// `trace_id` is unique per turn (32 hex chars); `span_id` (16 hex) is
/// set only on structural events; an iteration span's `parent_span_id`
/// is the enclosing turn's span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub event_id: String,
    pub trace_id: String,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub agent_name: String,
}

/// Mint a 32-hex-char trace identifier.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Mint a 16-hex-char span identifier.
pub fn new_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Events emitted by the agent during a single turn.
/// Consumers subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub meta: EventMeta,
    pub kind: AgentEventKind,
}

/// Decision delivered in response to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionDecision {
    /// Run this one call.
    AllowOnce,
    /// Run this call and cache a grant for the rest of the session.
    AllowAlways,
    Deny,
}

/// Typed response delivered through the coordinator for a bidirectional
/// event, correlated by `request_id`.
#[derive(Debug, Clone)]
pub enum EventResponse {
    Permission(PermissionDecision),
    /// Extend the iteration limit by this many iterations (0 = stop).
    Continuation { extend_by: u32 },
    Clarification { answer: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventKind {
    TurnStarted,
    TurnFinished,
    IterationStarted {
        iteration: u32,
    },
    IterationFinished {
        iteration: u32,
    },
    /// A text chunk streamed from the model
    TextDelta {
        text: String,
    },
    /// A reasoning chunk streamed from the model
    ReasoningDelta {
        text: String,
    },
    /// The model has requested a tool call
    ToolCallStarted {
        call_id: String,
        name: String,
        arguments: Value,
    },
    /// Incremental argument text for a streaming tool call
    ToolCallArgsDelta {
        call_id: String,
        arguments: String,
    },
    /// A tool call finished (executed, suppressed, or rejected)
    ToolCallFinished {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// Bidirectional: a tool needs caller approval before running
    PermissionRequested {
        request_id: String,
        source_name: String,
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    PermissionResolved {
        request_id: String,
        decision: PermissionDecision,
    },
    /// Bidirectional: the iteration limit was reached; the caller may
    /// extend the turn
    ContinuationRequested {
        request_id: String,
        source_name: String,
        iterations_used: u32,
        current_limit: u32,
    },
    ContinuationResolved {
        request_id: String,
        extended_by: u32,
    },
    /// Bidirectional: the agent is asking the caller a question
    ClarificationRequested {
        request_id: String,
        source_name: String,
        question: String,
    },
    ClarificationResolved {
        request_id: String,
        answer: String,
    },
    /// Full serialized loop state, emitted at notable boundaries
    StateSnapshot {
        state: Value,
    },
    StructuredOutputRequested {
        schema: Value,
    },
    StructuredOutputProduced {
        payload: Value,
    },
    StructuredOutputFailed {
        error: String,
    },
    /// A middleware hook raised; the turn continues unless the middleware
    /// chose to terminate
    MiddlewareError {
        middleware: String,
        hook: String,
        error: String,
    },
    /// The turn ended for a reason other than a terminal assistant reply
    Terminated {
        reason: String,
    },
    Cancelled {
        iteration: u32,
    },
    /// Unrecoverable: the stream ends immediately after this event
    Fatal {
        message: String,
    },
}

impl AgentEventKind {
    /// Structural events open an observability span and always carry a
    /// span id.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::TurnStarted
                | Self::TurnFinished
                | Self::IterationStarted { .. }
                | Self::IterationFinished { .. }
                | Self::ToolCallStarted { .. }
        )
    }

    /// The correlation id for bidirectional request events.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::PermissionRequested { request_id, .. }
            | Self::ContinuationRequested { request_id, .. }
            | Self::ClarificationRequested { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_is_32_hex_chars() {
        let id = new_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn span_id_is_16_hex_chars() {
        let id = new_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn trace_ids_are_unique() {
        assert_ne!(new_trace_id(), new_trace_id());
    }

    #[test]
    fn structural_classification() {
        assert!(AgentEventKind::TurnStarted.is_structural());
        assert!(AgentEventKind::IterationStarted { iteration: 0 }.is_structural());
        assert!(AgentEventKind::ToolCallStarted {
            call_id: "c".into(),
            name: "t".into(),
            arguments: Value::Null
        }
        .is_structural());
        assert!(!AgentEventKind::TextDelta { text: "x".into() }.is_structural());
        assert!(!AgentEventKind::Terminated { reason: "r".into() }.is_structural());
    }

    #[test]
    fn request_id_extraction() {
        let kind = AgentEventKind::PermissionRequested {
            request_id: "r1".into(),
            source_name: "permissions".into(),
            call_id: "c1".into(),
            tool_name: "shell".into(),
            arguments: Value::Null,
        };
        assert_eq!(kind.request_id(), Some("r1"));
        assert_eq!(AgentEventKind::TurnStarted.request_id(), None);
    }

    #[test]
    fn kind_serializes_with_type_tag() {
        let json = serde_json::to_string(&AgentEventKind::IterationStarted { iteration: 2 }).unwrap();
        assert!(json.contains("\"type\":\"iteration_started\""));
        assert!(json.contains("\"iteration\":2"));
    }

    #[test]
    fn permission_decision_uses_kebab_case() {
        let json = serde_json::to_string(&PermissionDecision::AllowAlways).unwrap();
        assert_eq!(json, "\"allow-always\"");
    }
}
