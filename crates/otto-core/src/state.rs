// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use otto_model::Message;

use crate::error::CoreError;

/// One finished function call within the current turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedFunction {
    pub call_id: String,
    pub name: String,
    pub success: bool,
}

/// The value record threaded through every turn.
///
/// Mutated only by producing new values inside middleware hooks and
/// orchestrator steps; persisted at iteration boundaries; `current_messages`
/// always holds the full unreduced history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLoopState {
    pub run_id: String,
    pub conversation_id: String,
    pub agent_name: String,
    pub current_messages: Vec<Message>,
    /// Index of the iteration currently (or last) executed in this turn.
    pub iteration: u32,
    pub completed_functions: Vec<CompletedFunction>,
    pub is_terminated: bool,
    pub termination_reason: Option<String>,
    /// Whether the backend retains conversation state server-side.
    pub inner_client_tracks_history: bool,
    /// Number of leading `current_messages` the backend already holds.
    pub messages_sent_to_inner_client: usize,
    #[serde(default)]
    pub middleware_state: MiddlewareStateMap,
}

impl AgentLoopState {
    pub fn new(agent_name: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            agent_name: agent_name.into(),
            current_messages: Vec::new(),
            iteration: 0,
            completed_functions: Vec::new(),
            is_terminated: false,
            termination_reason: None,
            inner_client_tracks_history: false,
            messages_sent_to_inner_client: 0,
            middleware_state: MiddlewareStateMap::default(),
        }
    }

    /// Mark the turn terminated with a reason.  Later callers win; the
    /// first reason is kept because the earliest cause is the useful one.
    pub fn terminate(&mut self, reason: impl Into<String>) {
        if !self.is_terminated {
            self.is_terminated = true;
            self.termination_reason = Some(reason.into());
        }
    }

    /// Check the statically verifiable invariants after deserialization.
    ///
    /// A violation here is fatal: the stream ends with a fatal event
    /// rather than continuing on corrupt state.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.messages_sent_to_inner_client > self.current_messages.len() {
            return Err(CoreError::StateConsistency(format!(
                "messagesSentToInnerClient ({}) exceeds message count ({})",
                self.messages_sent_to_inner_client,
                self.current_messages.len()
            )));
        }
        if self.run_id.is_empty() || self.agent_name.is_empty() {
            return Err(CoreError::StateConsistency(
                "runId and agentName must be non-empty".into(),
            ));
        }
        if self.is_terminated && self.termination_reason.is_none() {
            return Err(CoreError::StateConsistency(
                "terminated state carries no termination reason".into(),
            ));
        }
        Ok(())
    }
}

// ─── Middleware sub-state map ─────────────────────────────────────────────────

/// One middleware's slice of the turn state.
///
/// The document is authoritative and is what gets serialized; the cache
/// holds the typed value materialized on first access so that repeated
/// reads within a process return the same instance.
struct StateSlot {
    doc: serde_json::Value,
    cache: OnceLock<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Clone for StateSlot {
    fn clone(&self) -> Self {
        let cache = OnceLock::new();
        if let Some(v) = self.cache.get() {
            let _ = cache.set(v.clone());
        }
        Self { doc: self.doc.clone(), cache }
    }
}

/// Mapping from a middleware's stable type-identifier to its sub-state.
///
/// After deserialization every entry is an opaque document; the typed
/// accessor materializes it lazily.  Unknown or missing keys are
/// tolerated — the accessor yields `None`.
#[derive(Default, Clone)]
pub struct MiddlewareStateMap {
    slots: HashMap<String, StateSlot>,
}

impl MiddlewareStateMap {
    /// Typed access with first-read materialization.
    ///
    /// The first call deserializes the stored document and caches the
    /// result; every subsequent call returns the same `Arc` instance.
    /// Returns `None` for absent keys and for documents that do not
    /// deserialize as `T`.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let slot = self.slots.get(key)?;
        let cached = slot.cache.get_or_init(|| {
            serde_json::from_value::<T>(slot.doc.clone())
                .ok()
                .map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
        });
        cached.as_ref()?.clone().downcast::<T>().ok()
    }

    /// Produce an updated sub-state value.
    ///
    /// `f` receives the current typed value (if any) and returns the
    /// replacement; both the document and the cache are refreshed so the
    /// next `get` observes the new instance immediately.
    pub fn update<T>(&mut self, key: &str, f: impl FnOnce(Option<Arc<T>>) -> T)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let current = self.get::<T>(key);
        let next = f(current);
        let doc = serde_json::to_value(&next).unwrap_or(serde_json::Value::Null);
        let cache = OnceLock::new();
        let _ = cache.set(Some(Arc::new(next) as Arc<dyn Any + Send + Sync>));
        self.slots.insert(key.to_string(), StateSlot { doc, cache });
    }

    /// Remove a sub-state entirely.
    pub fn remove(&mut self, key: &str) {
        self.slots.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(|k| k.as_str())
    }

    /// The raw document for a key (serialization view).
    pub fn document(&self, key: &str) -> Option<&serde_json::Value> {
        self.slots.get(key).map(|s| &s.doc)
    }
}

impl PartialEq for MiddlewareStateMap {
    /// Declared equality is document equality: two maps are equal when
    /// every key maps to the same serialized document.
    fn eq(&self, other: &Self) -> bool {
        self.slots.len() == other.slots.len()
            && self
                .slots
                .iter()
                .all(|(k, slot)| other.slots.get(k).map(|o| o.doc == slot.doc).unwrap_or(false))
    }
}

impl fmt::Debug for MiddlewareStateMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, slot) in &self.slots {
            map.entry(k, &slot.doc);
        }
        map.finish()
    }
}

impl Serialize for MiddlewareStateMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.slots.len()))?;
        for (k, slot) in &self.slots {
            map.serialize_entry(k, &slot.doc)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MiddlewareStateMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let docs: HashMap<String, serde_json::Value> = HashMap::deserialize(deserializer)?;
        let slots = docs
            .into_iter()
            .map(|(k, doc)| (k, StateSlot { doc, cache: OnceLock::new() }))
            .collect();
        Ok(Self { slots })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn new_state_has_unique_run_id() {
        let a = AgentLoopState::new("otto", "conv");
        let b = AgentLoopState::new("otto", "conv");
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn new_state_starts_clean() {
        let s = AgentLoopState::new("otto", "conv");
        assert!(s.current_messages.is_empty());
        assert_eq!(s.iteration, 0);
        assert!(!s.is_terminated);
        assert_eq!(s.messages_sent_to_inner_client, 0);
    }

    #[test]
    fn terminate_keeps_first_reason() {
        let mut s = AgentLoopState::new("otto", "conv");
        s.terminate("first");
        s.terminate("second");
        assert_eq!(s.termination_reason.as_deref(), Some("first"));
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn validate_accepts_fresh_state() {
        assert!(AgentLoopState::new("otto", "conv").validate().is_ok());
    }

    #[test]
    fn validate_rejects_sent_count_beyond_messages() {
        let mut s = AgentLoopState::new("otto", "conv");
        s.messages_sent_to_inner_client = 3;
        let err = s.validate().unwrap_err();
        assert!(matches!(err, CoreError::StateConsistency(_)));
    }

    #[test]
    fn validate_rejects_terminated_without_reason() {
        let mut s = AgentLoopState::new("otto", "conv");
        s.is_terminated = true;
        assert!(s.validate().is_err());
    }

    // ── Smart accessor ────────────────────────────────────────────────────────

    #[test]
    fn absent_key_yields_none() {
        let m = MiddlewareStateMap::default();
        assert!(m.get::<Counter>("missing").is_none());
    }

    #[test]
    fn update_then_get_round_trips() {
        let mut m = MiddlewareStateMap::default();
        m.update::<Counter>("c", |_| Counter { count: 1 });
        assert_eq!(m.get::<Counter>("c").unwrap().count, 1);
        m.update::<Counter>("c", |prev| Counter { count: prev.unwrap().count + 1 });
        assert_eq!(m.get::<Counter>("c").unwrap().count, 2);
    }

    #[test]
    fn repeated_get_returns_same_instance() {
        let mut m = MiddlewareStateMap::default();
        m.update::<Counter>("c", |_| Counter { count: 7 });
        // Round-trip through serialization so the slot starts deferred.
        let json = serde_json::to_string(&m).unwrap();
        let m2: MiddlewareStateMap = serde_json::from_str(&json).unwrap();
        let a = m2.get::<Counter>("c").unwrap();
        let b = m2.get::<Counter>("c").unwrap();
        assert!(Arc::ptr_eq(&a, &b), "first access must be cached");
    }

    #[test]
    fn mismatched_type_yields_none() {
        let mut m = MiddlewareStateMap::default();
        m.update::<Counter>("c", |_| Counter { count: 1 });
        let json = serde_json::to_string(&m).unwrap();
        let m2: MiddlewareStateMap = serde_json::from_str(&json).unwrap();

        #[derive(Debug, Serialize, Deserialize)]
        struct Wrong {
            other: String,
        }
        assert!(m2.get::<Wrong>("c").is_none());
    }

    #[test]
    fn document_equality_ignores_cache_state() {
        let mut a = MiddlewareStateMap::default();
        a.update::<Counter>("c", |_| Counter { count: 3 });
        let json = serde_json::to_string(&a).unwrap();
        let b: MiddlewareStateMap = serde_json::from_str(&json).unwrap();
        // `a` has a warm cache, `b` is fully deferred — still equal.
        assert_eq!(a, b);
    }

    // ── Full state round-trip ─────────────────────────────────────────────────

    #[test]
    fn state_serializes_camel_case() {
        let s = AgentLoopState::new("otto", "conv");
        let v = serde_json::to_value(&s).unwrap();
        assert!(v.get("runId").is_some());
        assert!(v.get("currentMessages").is_some());
        assert!(v.get("messagesSentToInnerClient").is_some());
        // null is distinct from absent: the reason is present as null.
        assert!(v.get("terminationReason").unwrap().is_null());
    }

    #[test]
    fn state_round_trip_preserves_messages_and_substate() {
        let mut s = AgentLoopState::new("otto", "conv");
        s.current_messages.push(Message::user("hello"));
        s.current_messages.push(Message::assistant("hi"));
        s.iteration = 4;
        s.middleware_state.update::<Counter>("error-tracking", |_| Counter { count: 2 });

        let json = serde_json::to_string(&s).unwrap();
        let back: AgentLoopState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.current_messages, s.current_messages);
        assert_eq!(back.iteration, 4);
        assert_eq!(back.middleware_state, s.middleware_state);
        assert_eq!(back.middleware_state.get::<Counter>("error-tracking").unwrap().count, 2);
    }

    #[test]
    fn unknown_substate_key_is_tolerated() {
        let json = r#"{"some-future-middleware": {"x": 1}}"#;
        let m: MiddlewareStateMap = serde_json::from_str(json).unwrap();
        assert!(m.contains("some-future-middleware"));
        assert!(m.get::<Counter>("some-future-middleware").is_none());
    }
}
