//! # recordsync
//!
//! A session-oriented synchronization engine that keeps per-client mutable
//! records consistent with a remote, latency-heavy, eventually-consistent
//! key-value backend. Many independent processes can own, mutate and
//! persist the same logical record without overwriting each other's work:
//!
//! - **Lease locking** — one live owner per record, with stale-lock theft
//!   for crash recovery.
//! - **Dirty-path tracking** — mutations mark dotted key paths; saves apply
//!   them as a delta over whatever the backend currently holds.
//! - **Optimistic versioning** — a monotonically increasing `version`
//!   counter is the sole conflict-detection signal; a losing save raises a
//!   `conflict` notification instead of clobbering the newer write.
//! - **Migrations, validation, compression** — ordered schema transforms on
//!   load, declarative shape checks, and a tagged gzip wrapper for blobs.
//!
//! # Example
//!
//! ```
//! use recordsync::{MemoryBackend, SyncConfig, SyncEngine};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> recordsync::Result<()> {
//! tokio_test::block_on(async {
//!     let backend = Arc::new(MemoryBackend::new());
//!     let engine = SyncEngine::new(backend, SyncConfig::default())?
//!         .with_defaults(json!({"Coins": 0}));
//!
//!     engine.load("player:1").await?;
//!     engine.set("player:1", Some("Coins"), json!(100)).await?;
//!     engine.save("player:1", true).await?;
//!     Ok(())
//! })
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod core;
pub mod events;
pub mod lease;
pub mod migration;
pub mod persist;
pub mod runtime;
pub mod schema;
pub mod session;

pub use backend::{KvBackend, MemoryBackend, RetryPolicy};
pub use config::SyncConfig;
pub use crate::core::{Result, SyncError};
pub use events::{EventKind, EventListener, SyncEvent};
pub use lease::{Lease, LeaseManager};
pub use migration::{Migration, MigrationRegistry, MigrationReport};
pub use persist::{Compressor, GzipCompressor, SaveOutcome, SyncEngine};
pub use runtime::SyncRuntime;
pub use schema::{FieldSpec, FieldType, Schema};
pub use session::{SessionMeta, SessionStore, SetValidator};
