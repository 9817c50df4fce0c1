// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::state::AgentLoopState;

/// Version written into every checkpoint document.  Readers refuse
/// documents newer than this.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// A self-describing snapshot of the loop state at an iteration boundary.
///
/// Messages live inside `execution_state.current_messages` only — they are
/// never duplicated elsewhere in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub schema_version: u32,
    pub session_id: String,
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub execution_state: AgentLoopState,
}

impl Checkpoint {
    /// Capture the given state under a fresh checkpoint id.
    pub fn capture(session_id: impl Into<String>, state: &AgentLoopState) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            session_id: session_id.into(),
            checkpoint_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            execution_state: state.clone(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a checkpoint document.
    ///
    /// Unknown fields are ignored; a `schemaVersion` newer than this
    /// reader understands is refused as a state-consistency error, as is
    /// a rehydrated state that fails invariant validation.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| CoreError::StateConsistency(format!("unparseable checkpoint: {e}")))?;
        let version = value
            .get("schemaVersion")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CoreError::StateConsistency("checkpoint has no schemaVersion".into()))?;
        if version > CHECKPOINT_SCHEMA_VERSION as u64 {
            return Err(CoreError::StateConsistency(format!(
                "checkpoint schema version {version} is newer than supported \
                 version {CHECKPOINT_SCHEMA_VERSION}"
            )));
        }
        let checkpoint: Checkpoint = serde_json::from_value(value)
            .map_err(|e| CoreError::StateConsistency(format!("malformed checkpoint: {e}")))?;
        checkpoint.execution_state.validate()?;
        Ok(checkpoint)
    }
}

/// Persistence collaborator.  The core defines the document shape and
/// when snapshots are taken; writers (file, DB, object store) live
/// outside the core.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;
    async fn load_latest(&self, session_id: &str) -> anyhow::Result<Option<Checkpoint>>;
}

/// In-memory store keeping the latest checkpoint per session.  Used by
/// tests and as the reference implementation of the store contract.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    latest: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.latest.lock().unwrap().len()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.latest
            .lock()
            .unwrap()
            .insert(checkpoint.session_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_latest(&self, session_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        Ok(self.latest.lock().unwrap().get(session_id).cloned())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
