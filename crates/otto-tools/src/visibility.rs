// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;

use crate::ToolSet;

/// A tool schema as emitted to the chat backend.  Mirrors the model
/// crate's schema type but keeps this crate independent from it.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSet {
    /// Compute the tool subset exposed to the model for one iteration.
    ///
    /// Rules:
    /// - a parentless tool or container is visible; a contained one only
    ///   while its parent is expanded
    /// - an expanded container disappears (its children take its slot)
    /// - emission order is stable: containers alphabetically, then
    ///   functions alphabetically
    pub fn visible_schemas(&self, expanded: &BTreeSet<String>) -> Vec<VisibleTool> {
        let parent_open = |parent: &Option<String>| match parent {
            None => true,
            Some(p) => expanded.contains(p),
        };

        let mut containers: Vec<VisibleTool> = self
            .containers()
            .filter(|c| parent_open(&c.parent_container) && !expanded.contains(&c.name))
            .map(|c| VisibleTool {
                name: c.name.clone(),
                description: c.description.clone(),
                // Containers take no arguments; calling one is the activation.
                parameters: json!({ "type": "object", "properties": {} }),
            })
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));

        let mut functions: Vec<VisibleTool> = self
            .descriptors()
            .filter(|d| parent_open(&d.parent_container))
            .map(|d| VisibleTool {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters: d.parameters.clone(),
            })
            .collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));

        containers.extend(functions);
        containers
    }

    /// True when `name` resolves to a visible function for the given
    /// expanded set.  Containers are resolvable but not "functions".
    pub fn is_function_visible(&self, name: &str, expanded: &BTreeSet<String>) -> bool {
        match self.descriptor(name) {
            Some(d) => match &d.parent_container {
                None => true,
                Some(p) => expanded.contains(p),
            },
            None => false,
        }
    }
}

// ─── Container protocol block ─────────────────────────────────────────────────

/// Header line under which all active container system prompts are merged
/// into the request instructions.
pub const CONTAINER_PROTOCOL_HEADER: &str = "ACTIVE CONTAINER PROTOCOLS";

/// Build the protocol block from recorded container system prompts,
/// alphabetized by container name.  Returns `None` when no container
/// contributed any text.
///
/// The block is always appended at the tail of the instructions, which is
/// what lets [`strip_protocol_block`] remove it (and any stale copy found
/// in rehydrated options) by truncating at the header.
pub fn protocol_block(prompts: &BTreeMap<String, String>) -> Option<String> {
    if prompts.is_empty() {
        return None;
    }
    let mut block = String::from(CONTAINER_PROTOCOL_HEADER);
    for (name, text) in prompts {
        block.push_str("\n\n### ");
        block.push_str(name);
        block.push('\n');
        block.push_str(text);
    }
    Some(block)
}

/// Append the protocol block to base instructions.
pub fn merge_protocol_block(base: Option<&str>, block: &str) -> String {
    match base {
        Some(b) if !b.is_empty() => format!("{b}\n\n{block}"),
        _ => block.to_string(),
    }
}

/// Remove every protocol fragment from an instructions string.
///
/// Returns `None` when nothing remains after stripping.
pub fn strip_protocol_block(instructions: &str) -> Option<String> {
    let stripped = match instructions.find(CONTAINER_PROTOCOL_HEADER) {
        Some(idx) => instructions[..idx].trim_end(),
        None => instructions.trim_end(),
    };
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
