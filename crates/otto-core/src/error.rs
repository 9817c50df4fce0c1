// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use thiserror::Error;

/// Error taxonomy of the execution core.
///
/// Tool and middleware failures never unwind a turn by default — they are
/// captured as result payloads / OnError triggers.  State-consistency
/// violations are the only fatal kind: the stream ends with a fatal event.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Network hiccup, 5xx, timeout.  Retried with backoff.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// The provider asked us to slow down.  Retried, honouring the
    /// provider-supplied delay when present.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Malformed request, missing parameter.  Not retried.
    #[error("client error: {0}")]
    Client(String),
    /// Invalid credentials.  Not retried; requires external intervention.
    #[error("authentication error: {0}")]
    Auth(String),
    /// A tool raised; captured as the result payload.
    #[error("tool '{name}' failed: {message}")]
    ToolFailure { name: String, message: String },
    /// A middleware hook raised; converted to an OnError trigger.
    #[error("middleware '{middleware}' failed in {hook}: {message}")]
    MiddlewareFailure {
        middleware: String,
        hook: String,
        message: String,
    },
    /// Invariant violation detected on deserialized state.  Fatal.
    #[error("state consistency violation: {0}")]
    StateConsistency(String),
}

impl CoreError {
    /// Whether the active retry policy may re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Fatal errors end the event stream with an explicit fatal event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StateConsistency(_))
    }
}

/// Classify a backend transport error by message inspection.
///
/// Concrete clients surface provider failures as `anyhow` errors whose
/// text carries the HTTP status or provider error type.  This mirrors how
/// context-overflow errors are detected: there is no richer signal
/// available through the abstract client interface.
pub fn classify_backend_error(err: &anyhow::Error) -> CoreError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();

    if lower.contains("429") || lower.contains("rate limit") || lower.contains("overloaded") {
        return CoreError::RateLimited {
            retry_after: extract_retry_after(&lower),
            message: msg,
        };
    }
    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        return CoreError::Auth(msg);
    }
    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("temporarily unavailable")
        || contains_server_status(&lower)
    {
        return CoreError::Transient(msg);
    }
    CoreError::Client(msg)
}

/// Look for a 5xx status code embedded in the error text.
fn contains_server_status(msg: &str) -> bool {
    ["500", "502", "503", "504"]
        .iter()
        .any(|code| msg.contains(code))
}

/// Parse a `retry after <n>s` / `retry-after: <n>` hint out of the text.
fn extract_retry_after(msg: &str) -> Option<Duration> {
    let idx = msg.find("retry after").or_else(|| msg.find("retry-after"))?;
    let rest = &msg[idx..];
    let digits: String = rest
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
