//! Notifications published by the coordinator

use crate::queue::{FlushResult, OperationKind};
use crate::vector_db::{CircuitState, CollectionKind};
use serde::Serialize;

/// Event surface for observers, delivered over a tokio broadcast channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ServiceEvent {
    #[serde(rename = "online")]
    Online,

    #[serde(rename = "offline")]
    Offline { reason: Option<String> },

    #[serde(rename = "recovering")]
    Recovering,

    #[serde(rename = "circuitStateChange")]
    CircuitStateChange { from: CircuitState, to: CircuitState },

    #[serde(rename = "operationQueued", rename_all = "camelCase")]
    OperationQueued { kind: OperationKind, queue_size: usize },

    #[serde(rename = "queueFlushed")]
    QueueFlushed(FlushResult),

    #[serde(rename = "dimension-mismatch")]
    DimensionMismatch {
        collection: CollectionKind,
        expected: usize,
        actual: usize,
    },

    /// Plain HTTP to a host that is not local
    #[serde(rename = "security-warning")]
    SecurityWarning { message: String },

    /// Server answers heartbeats but collection setup keeps failing
    #[serde(rename = "corruption-suspected")]
    CorruptionSuspected { error: String, auto_reset: bool },
}

impl ServiceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceEvent::Online => "online",
            ServiceEvent::Offline { .. } => "offline",
            ServiceEvent::Recovering => "recovering",
            ServiceEvent::CircuitStateChange { .. } => "circuitStateChange",
            ServiceEvent::OperationQueued { .. } => "operationQueued",
            ServiceEvent::QueueFlushed(_) => "queueFlushed",
            ServiceEvent::DimensionMismatch { .. } => "dimension-mismatch",
            ServiceEvent::SecurityWarning { .. } => "security-warning",
            ServiceEvent::CorruptionSuspected { .. } => "corruption-suspected",
        }
    }
}
