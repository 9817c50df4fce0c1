// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod checkpoint;
mod coordinator;
mod error;
mod events;
mod executor;
pub mod middleware;
mod orchestrator;
mod retry;
mod state;
mod subagent;

pub use checkpoint::{
    Checkpoint, CheckpointStore, MemoryCheckpointStore, CHECKPOINT_SCHEMA_VERSION,
};
pub use coordinator::{
    AwaitError, EmitError, EventCoordinator, RespondError, ResponseRouter,
};
pub use error::{classify_backend_error, CoreError};
pub use events::{
    new_span_id, new_trace_id, AgentEvent, AgentEventKind, EventMeta, EventResponse,
    PermissionDecision,
};
pub use middleware::circuit_breaker::{CircuitBreakerMiddleware, CircuitBreakerState};
pub use middleware::containers::{ContainerVisibilityMiddleware, ContainerVisibilityState};
pub use middleware::continuation::{ContinuationMiddleware, ContinuationState};
pub use middleware::error_tracker::{ErrorTrackerMiddleware, ErrorTrackerState};
pub use middleware::permission::{PermissionMiddleware, PermissionState};
pub use middleware::pii::PiiFilterMiddleware;
pub use middleware::reduction::{HistoryReductionMiddleware, HistoryReductionState};
pub use middleware::Middleware;
pub use orchestrator::{AgentLoop, AgentLoopBuilder, BuildError, TurnOutcome};
pub use retry::RetryPolicy;
pub use state::{AgentLoopState, CompletedFunction, MiddlewareStateMap};
pub use subagent::SubAgentTool;
