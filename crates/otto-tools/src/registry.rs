// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::{ContainerDescriptor, ToolDescriptor, ToolHandler};

/// Build-time rejection reasons for a tool set.
#[derive(Debug, Error)]
pub enum ToolSetError {
    #[error("duplicate tool name: {0}")]
    DuplicateName(String),
    #[error("'{name}' references unknown parent container '{parent}'")]
    UnknownParentContainer { name: String, parent: String },
    #[error("container '{0}' declares no children")]
    EmptyContainer(String),
    #[error("container '{container}' references unknown function '{child}'")]
    UnknownContainerChild { container: String, child: String },
    #[error("tool '{name}' has a malformed parameter schema: {reason}")]
    MalformedSchema { name: String, reason: String },
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

/// Builder for a [`ToolSet`].
///
/// Registration is the explicit "load these tool packs" step: nothing is
/// discovered by attributes or module initialisers, and all containment
/// references are checked once, at `build()`.
#[derive(Default)]
pub struct ToolSetBuilder {
    tools: Vec<RegisteredTool>,
    containers: Vec<ContainerDescriptor>,
}

impl ToolSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.push(RegisteredTool { descriptor, handler });
        self
    }

    pub fn register_container(mut self, container: ContainerDescriptor) -> Self {
        self.containers.push(container);
        self
    }

    /// Validate and freeze the tool set.
    ///
    /// Rejects: duplicate names across functions and containers, parent
    /// references to nonexistent containers, containers with no (or
    /// unknown) children, and parameter schemas that are not JSON objects.
    pub fn build(self) -> Result<ToolSet, ToolSetError> {
        let mut functions: HashMap<String, RegisteredTool> = HashMap::new();
        let mut containers: HashMap<String, ContainerDescriptor> = HashMap::new();

        for c in self.containers {
            if containers.contains_key(&c.name) {
                return Err(ToolSetError::DuplicateName(c.name));
            }
            containers.insert(c.name.clone(), c);
        }

        for t in self.tools {
            let name = t.descriptor.name.clone();
            if functions.contains_key(&name) || containers.contains_key(&name) {
                return Err(ToolSetError::DuplicateName(name));
            }
            if !t.descriptor.parameters.is_object() {
                return Err(ToolSetError::MalformedSchema {
                    name,
                    reason: "parameters must be a JSON object".into(),
                });
            }
            functions.insert(name, t);
        }

        for (name, t) in &functions {
            if let Some(parent) = &t.descriptor.parent_container {
                if !containers.contains_key(parent) {
                    return Err(ToolSetError::UnknownParentContainer {
                        name: name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        for (name, c) in &containers {
            if c.function_names.is_empty() {
                return Err(ToolSetError::EmptyContainer(name.clone()));
            }
            for child in &c.function_names {
                if !functions.contains_key(child) {
                    return Err(ToolSetError::UnknownContainerChild {
                        container: name.clone(),
                        child: child.clone(),
                    });
                }
            }
            if let Some(parent) = &c.parent_container {
                if !containers.contains_key(parent) {
                    return Err(ToolSetError::UnknownParentContainer {
                        name: name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        Ok(ToolSet { functions, containers })
    }
}

/// Immutable, validated tool table scoped to one agent instance.
pub struct ToolSet {
    functions: HashMap<String, RegisteredTool>,
    containers: HashMap<String, ContainerDescriptor>,
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("containers", &self.containers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolSet {
    /// Empty set — for agents that run without tools.
    pub fn empty() -> Self {
        Self { functions: HashMap::new(), containers: HashMap::new() }
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.functions.get(name).map(|t| &t.descriptor)
    }

    pub fn container(&self, name: &str) -> Option<&ContainerDescriptor> {
        self.containers.get(name)
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.functions.get(name).map(|t| Arc::clone(&t.handler))
    }

    pub fn is_container(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.functions.values().map(|t| &t.descriptor)
    }

    pub(crate) fn containers(&self) -> impl Iterator<Item = &ContainerDescriptor> {
        self.containers.values()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
