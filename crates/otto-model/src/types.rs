use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: MessageContent::Text(text.into()) }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()) }
    }

    /// An assistant message that carries only a reasoning block.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Reasoning(text.into()) }
    }

    /// The assistant requesting one tool invocation.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall { name: name.into(), arguments: arguments.into() },
            },
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
                is_error: false,
            },
        }
    }

    /// A failed tool invocation.  The error text becomes the result payload
    /// so the model can read it and recover.
    pub fn tool_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: error.into(),
                is_error: true,
            },
        }
    }

    /// Return the plain text of this message, if it is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// The tool-call id carried by this message, for request and result
    /// content alike.
    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.content {
            MessageContent::ToolCall { tool_call_id, .. }
            | MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    /// Approximate token count used for reduction triggering.
    ///
    /// Uses a 4-chars-per-token heuristic with a minimum of 1.
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) | MessageContent::Reasoning(t) => t.len(),
            MessageContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            MessageContent::ToolResult { content, .. } => content.len(),
        };
        (chars / 4).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The content of a message.
///
/// - `Text` – plain string (most messages)
/// - `Reasoning` – model reasoning text, kept separate so consumers can
///   collapse or drop it without string inspection
/// - `ToolCall` – the assistant requests a tool invocation
/// - `ToolResult` – the result (or error) of a tool call
///
/// Adjacently tagged so that `Text` and `Reasoning` stay distinct on the
/// wire (untagged would collapse them into whichever string variant
/// deserialises first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Reasoning(String),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

// ─── Request options ──────────────────────────────────────────────────────────

/// Tool-choice mode forwarded to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// The model decides whether to call tools.
    #[default]
    Auto,
    /// Tool calls are disabled for this request.
    None,
    /// The model must call at least one tool.
    Any,
    /// The model must call the named tool.
    Specific(String),
}

/// Per-request options for a chat completion.
///
/// `instructions` is the request-scoped system text; the orchestrator and
/// middleware (container protocols, PII filter) rewrite it freely between
/// iterations without touching the persisted message history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub model_id: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop_sequences: Vec<String>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    /// JSON Schema for structured output, when requested.
    pub response_schema: Option<serde_json::Value>,
    pub instructions: Option<String>,
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A complete (non-streaming) response from the backend.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
    pub model_id: Option<String>,
    pub response_id: Option<String>,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// Role of the message being produced (first event of most streams).
    RoleStart(Role),
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A reasoning chunk streamed from the model
    ReasoningDelta(String),
    /// The model wants to call a tool.  Chunks for parallel calls are
    /// interleaved and distinguished by `index`; `id`/`name` may be empty
    /// on continuation chunks and `arguments` accumulates across deltas.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Provider-assigned response identifier.
    ResponseId(String),
    /// Provider-assigned message identifier.
    MessageId(String),
    Finish(FinishReason),
    /// Final usage statistics
    Usage(Usage),
    /// The stream finished normally
    Done,
    /// A recoverable error (non-fatal warning)
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn message_tool_call_carries_id_and_function() {
        let m = Message::tool_call("c1", "search", r#"{"q":"x"}"#);
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.tool_call_id(), Some("c1"));
        match &m.content {
            MessageContent::ToolCall { function, .. } => {
                assert_eq!(function.name, "search");
                assert_eq!(function.arguments, r#"{"q":"x"}"#);
            }
            _ => panic!("wrong content variant"),
        }
    }

    #[test]
    fn message_tool_result_is_not_error() {
        let m = Message::tool_result("c1", "contents");
        match &m.content {
            MessageContent::ToolResult { is_error, content, .. } => {
                assert!(!is_error);
                assert_eq!(content, "contents");
            }
            _ => panic!("wrong content variant"),
        }
    }

    #[test]
    fn message_tool_error_sets_flag() {
        let m = Message::tool_error("c1", "boom");
        match &m.content {
            MessageContent::ToolResult { is_error, .. } => assert!(is_error),
            _ => panic!("wrong content variant"),
        }
    }

    #[test]
    fn as_text_returns_none_for_tool_content() {
        assert!(Message::tool_result("c", "x").as_text().is_none());
        assert!(Message::tool_call("c", "f", "{}").as_text().is_none());
    }

    #[test]
    fn reasoning_message_is_not_plain_text() {
        let m = Message::reasoning("thinking…");
        assert!(m.as_text().is_none());
        assert!(matches!(&m.content, MessageContent::Reasoning(t) if t == "thinking…"));
    }

    // ── Token approximation ───────────────────────────────────────────────────

    #[test]
    fn approx_tokens_text_divides_by_four() {
        assert_eq!(Message::user("12345678").approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(Message::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_tool_call_uses_name_plus_args() {
        let m = Message::tool_call("id", "aaaa", "bbbbbbbb"); // 4 + 8 chars
        assert_eq!(m.approx_tokens(), 3);
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn message_round_trips_through_json() {
        let original = Message::tool_call("c1", "read_file", r#"{"path":"/tmp/x"}"#);
        let json = serde_json::to_string(&original).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn tool_result_round_trips_with_error_flag() {
        let original = Message::tool_error("c9", "denied");
        let json = serde_json::to_string(&original).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn reasoning_and_text_stay_distinct_on_the_wire() {
        let text = Message::assistant("out loud");
        let reasoning = Message::reasoning("to myself");
        let text_back: Message =
            serde_json::from_str(&serde_json::to_string(&text).unwrap()).unwrap();
        let reasoning_back: Message =
            serde_json::from_str(&serde_json::to_string(&reasoning).unwrap()).unwrap();
        assert_eq!(text_back, text);
        assert_eq!(reasoning_back, reasoning);
        assert!(text_back.as_text().is_some());
        assert!(reasoning_back.as_text().is_none());
    }

    #[test]
    fn tool_choice_default_is_auto() {
        assert_eq!(ToolChoice::default(), ToolChoice::Auto);
    }

    #[test]
    fn chat_options_default_has_no_tools() {
        let o = ChatOptions::default();
        assert!(o.tools.is_empty());
        assert!(o.instructions.is_none());
        assert!(o.response_schema.is_none());
    }
}
