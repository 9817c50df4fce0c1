// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;

use otto_model::MessageContent;

use crate::middleware::{IterationContext, Middleware};

/// Rewrites obviously sensitive tokens out of the outgoing payload.
///
/// Only the working list is touched — the persisted history keeps the
/// original text, so this middleware owns no sub-state.
pub struct PiiFilterMiddleware {
    rules: Vec<(Regex, &'static str)>,
}

impl Default for PiiFilterMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiFilterMiddleware {
    pub fn new() -> Self {
        let compile = |p: &str| Regex::new(p).expect("static PII pattern must compile");
        Self {
            rules: vec![
                (
                    compile(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"),
                    "[redacted-email]",
                ),
                (compile(r"\b\d{3}-\d{2}-\d{4}\b"), "[redacted-ssn]"),
                (compile(r"(?i)bearer\s+[a-zA-Z0-9._~+/=-]{8,}"), "[redacted-token]"),
            ],
        }
    }

    fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (re, replacement) in &self.rules {
            out = re.replace_all(&out, *replacement).into_owned();
        }
        out
    }
}

#[async_trait]
impl Middleware for PiiFilterMiddleware {
    fn name(&self) -> &str {
        "pii-filter"
    }

    async fn before_iteration(&self, cx: &mut IterationContext<'_>) -> anyhow::Result<()> {
        for message in cx.working_messages.iter_mut() {
            match &mut message.content {
                MessageContent::Text(t) | MessageContent::Reasoning(t) => {
                    let scrubbed = self.scrub(t);
                    if scrubbed != *t {
                        *t = scrubbed;
                    }
                }
                MessageContent::ToolResult { content, .. } => {
                    let scrubbed = self.scrub(content);
                    if scrubbed != *content {
                        *content = scrubbed;
                    }
                }
                MessageContent::ToolCall { .. } => {}
            }
        }
        if let Some(instructions) = &cx.options.instructions {
            let scrubbed = self.scrub(instructions);
            if scrubbed != *instructions {
                cx.options.instructions = Some(scrubbed);
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
