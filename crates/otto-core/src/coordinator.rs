// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::events::{
    new_span_id, new_trace_id, AgentEvent, AgentEventKind, EventMeta, EventResponse,
};

#[derive(Debug, Error)]
pub enum EmitError {
    /// The consumer dropped the stream.  Surfaces to the orchestrator as
    /// a cancellation.
    #[error("event stream closed")]
    StreamClosed,
}

#[derive(Debug, Error)]
pub enum AwaitError {
    #[error("no response for request {request_id} within the timeout")]
    Timeout { request_id: String },
    #[error("event stream closed while awaiting a response")]
    StreamClosed,
    /// The router dropped the sender without responding.
    #[error("responder dropped for request {request_id}")]
    ResponderDropped { request_id: String },
    #[error("event kind carries no request id")]
    NotBidirectional,
}

#[derive(Debug, Error)]
pub enum RespondError {
    #[error("request {0} was already resolved")]
    Duplicate(String),
    #[error("unknown request id {0}")]
    Unknown(String),
}

/// Correlated response delivery for bidirectional events.
///
/// Lives on the agent loop (not the per-turn coordinator) so callers can
/// hold a handle across turns and deliver responses out of band.  Each
/// pending request owns a `oneshot` sender that unblocks the awaiting
/// hook when resolved.
#[derive(Default)]
pub struct ResponseRouter {
    pending: Mutex<HashMap<String, oneshot::Sender<EventResponse>>>,
    resolved: Mutex<HashSet<String>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a response for `request_id`.
    fn register(&self, request_id: &str) -> oneshot::Receiver<EventResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id.to_string(), tx);
        rx
    }

    /// Deliver a response.  The first call for a request id resolves the
    /// awaiting hook; subsequent calls fail with a duplicate-response
    /// error.  Out-of-order delivery across distinct ids is fine.
    pub fn respond(&self, request_id: &str, response: EventResponse) -> Result<(), RespondError> {
        let sender = self.pending.lock().unwrap().remove(request_id);
        match sender {
            Some(tx) => {
                self.resolved.lock().unwrap().insert(request_id.to_string());
                // The receiver may have been dropped by a timeout that
                // raced this response; the request still counts as resolved.
                let _ = tx.send(response);
                Ok(())
            }
            None => {
                if self.resolved.lock().unwrap().contains(request_id) {
                    Err(RespondError::Duplicate(request_id.to_string()))
                } else {
                    Err(RespondError::Unknown(request_id.to_string()))
                }
            }
        }
    }

    /// Drop a pending request (await timed out or was cancelled).  A later
    /// `respond` for this id reports `Unknown`.
    fn forget(&self, request_id: &str) {
        self.pending.lock().unwrap().remove(request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Single-writer event broadcast for one turn.
///
/// Stamps every event with the turn's trace id and the appropriate span
/// context at emit time.  Emission is non-blocking; a closed stream is
/// reported so the orchestrator can treat it as a cancellation.
pub struct EventCoordinator {
    tx: mpsc::UnboundedSender<AgentEvent>,
    agent_name: String,
    trace_id: String,
    turn_span_id: String,
    iteration_span_id: Mutex<Option<String>>,
    router: std::sync::Arc<ResponseRouter>,
}

impl EventCoordinator {
    pub fn new(
        tx: mpsc::UnboundedSender<AgentEvent>,
        agent_name: impl Into<String>,
        router: std::sync::Arc<ResponseRouter>,
    ) -> Self {
        Self {
            tx,
            agent_name: agent_name.into(),
            trace_id: new_trace_id(),
            turn_span_id: new_span_id(),
            iteration_span_id: Mutex::new(None),
            router,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn turn_span_id(&self) -> &str {
        &self.turn_span_id
    }

    /// Open the span for the next iteration.  Subsequent non-structural
    /// events are parented to it until `end_iteration`.
    pub fn begin_iteration(&self) -> String {
        let span = new_span_id();
        *self.iteration_span_id.lock().unwrap() = Some(span.clone());
        span
    }

    pub fn end_iteration(&self) {
        *self.iteration_span_id.lock().unwrap() = None;
    }

    /// Emit one event, stamped with the current trace/span context.
    /// Events are emitted once and never replayed.
    pub fn emit(&self, kind: AgentEventKind) -> Result<(), EmitError> {
        let iteration_span = self.iteration_span_id.lock().unwrap().clone();
        let (span_id, parent_span_id) = match &kind {
            AgentEventKind::TurnStarted | AgentEventKind::TurnFinished => {
                (Some(self.turn_span_id.clone()), None)
            }
            AgentEventKind::IterationStarted { .. } | AgentEventKind::IterationFinished { .. } => {
                (iteration_span, Some(self.turn_span_id.clone()))
            }
            AgentEventKind::ToolCallStarted { .. } => {
                (Some(new_span_id()), iteration_span.or_else(|| Some(self.turn_span_id.clone())))
            }
            _ => (None, iteration_span.or_else(|| Some(self.turn_span_id.clone()))),
        };
        let event = AgentEvent {
            meta: EventMeta {
                event_id: Uuid::new_v4().to_string(),
                trace_id: self.trace_id.clone(),
                span_id,
                parent_span_id,
                timestamp: Utc::now(),
                agent_name: self.agent_name.clone(),
            },
            kind,
        };
        self.tx.send(event).map_err(|_| EmitError::StreamClosed)
    }

    /// Mint a request id for a bidirectional event.
    pub fn new_request_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Emit a bidirectional event and await its correlated response.
    ///
    /// `kind` must carry a request id.  With `timeout = None` the await is
    /// unbounded (cancellation still applies at the caller).  On timeout
    /// the pending entry is forgotten so a late response reports `Unknown`.
    pub async fn emit_and_await(
        &self,
        kind: AgentEventKind,
        timeout: Option<Duration>,
    ) -> Result<EventResponse, AwaitError> {
        let request_id = match kind.request_id() {
            Some(id) => id.to_string(),
            None => return Err(AwaitError::NotBidirectional),
        };
        let rx = self.router.register(&request_id);
        if self.emit(kind).is_err() {
            self.router.forget(&request_id);
            return Err(AwaitError::StreamClosed);
        }

        let result = match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(inner) => inner.map_err(|_| AwaitError::ResponderDropped {
                    request_id: request_id.clone(),
                }),
                Err(_) => {
                    self.router.forget(&request_id);
                    return Err(AwaitError::Timeout { request_id });
                }
            },
            None => rx.await.map_err(|_| AwaitError::ResponderDropped {
                request_id: request_id.clone(),
            }),
        };
        result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
