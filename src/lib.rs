//! Organizer VectorDB - resilient access layer over a remote vector store
//!
//! Keeps file and folder embeddings in two collections of a Chroma-compatible
//! server and stays usable while that server is down.
//!
//! ## Features
//!
//! - **Circuit Breaker Protection**: Stop calling a failing server, probe it after a cool-down
//! - **Offline Queue**: Writes made while offline are deduplicated, persisted and replayed by priority
//! - **Query Cache**: LRU + TTL cache of read results with entity-aware invalidation
//! - **Dimension Guard**: Each collection accepts one embedding dimension
//! - **Health Checks**: Periodic heartbeats that drive recovery
//! - **Automatic Recovery**: Collections forgotten by a restarted server are reopened transparently
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use organizer_vectordb::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_file("config.toml")?;
//!     let service = VectorDbService::connect(config).await?;
//!     service.initialize().await?;
//!
//!     let record = EmbeddingRecord::new("file:/docs/report.pdf", vec![0.1, 0.2, 0.3])
//!         .with_metadata("path", "/docs/report.pdf");
//!     service.upsert_file(record).await?;
//!
//!     let folders = service.query_folders("file:/docs/report.pdf", 5).await?;
//!     for folder in folders {
//!         println!("{} ({:.2})", folder.id, folder.score);
//!     }
//!
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod observability;
pub mod persist;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod vector_db;

pub use config::Config;
pub use error::{Result, ServiceError};
pub use service::VectorDbService;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{InvalidationBus, QueryCache};
    pub use crate::config::Config;
    pub use crate::error::{Result, ServiceError, ValidationError, VectorDbError};
    pub use crate::observability::{HealthStatus, ServiceHealth};
    pub use crate::queue::{FlushResult, OfflineQueue, Operation, OperationKind};
    pub use crate::service::{InitState, ServiceEvent, ServiceStats, VectorDbService, WriteOutcome};
    pub use crate::vector_db::{
        CircuitBreaker, CircuitState, CollectionKind, EmbeddingRecord, PathUpdate, QueryMatch, VectorStore,
    };
}
