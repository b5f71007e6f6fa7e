//! HybridLog host interface
//!
//! The persistence surface a host node programs against, implemented over
//! the HybridLog engine.
//!
//! # Architecture
//!
//! - `ReadOnlyStore` / `WriteStore`: byte-keyed reads, ordered seeks, writes
//! - `KvStore`: a store that can hand out snapshots
//! - `KvSnapshot`: an isolated view with buffered writes and `commit`
//! - `StoreProvider` / `ProviderRegistry`: open stores by provider name
//!
//! Engine failures reach the host as `HostError::Engine`.

pub mod error;
pub mod provider;
pub mod store;

pub use error::{HostError, HostResult};
pub use hybridlog_core::{Config, SeekDirection};
pub use provider::{HybridLogProvider, ProviderRegistry, StoreProvider};
pub use store::{KvSnapshot, KvStore, ReadOnlyStore, SeekIter, WriteStore};
