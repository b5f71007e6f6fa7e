//! HybridLog Core: Checkpointed Log-Structured Key-Value Engine
//!
//! An embedded key-value store where an in-memory hash index sits over an
//! append-only hybrid log, and checkpoints capture enough of that state to
//! rebuild it after a restart.
//!
//! # Architecture
//!
//! - **Read path**: Hash index lookup; small values inline, large values
//!   read from the object log by address
//! - **Write path**: Log record first, then index update
//! - **Checkpoints**: Fold-over (log tail only) or standalone (full index
//!   image), written atomically under `checkpoints/<token>/`
//! - **Snapshots**: A standalone checkpoint recovered into a detached engine,
//!   with a write buffer that commits back to the store
//! - **Sessions**: Bounded pool of per-thread engine handles
//!
//! Keys are ordered by unsigned byte comparison; `seek` scans forward or
//! backward from a bound.

pub mod checkpoint;
pub mod checkpointer;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod log;
pub mod object_log;
pub mod ordering;
pub mod platform_durability;
pub mod seek;
pub mod session;
pub mod snapshot;
pub mod store;

// Re-export key types for convenience
pub use checkpoint::{CheckpointInfo, CheckpointKind, CheckpointToken};
pub use checkpointer::{CheckpointerHandle, CheckpointerStats};
pub use config::Config;
pub use engine::Session;
pub use error::{HybridError, HybridResult};
pub use log::LogAddress;
pub use ordering::{KeyComparer, SeekDirection};
pub use seek::Seek;
pub use session::{Pooled, SessionPool};
pub use snapshot::{Snapshot, WriteBuffer};
pub use store::Store;
