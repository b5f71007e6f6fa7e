//! Host persistence traits and their HybridLog implementations.
//!
//! A host sees a store as a byte-keyed map with ordered seeks and snapshots
//! that can be written to and committed back. Nothing here knows about
//! checkpoints or sessions.

use hybridlog_core::{SeekDirection, Snapshot, Store};

use crate::error::HostResult;

/// Boxed ordered iterator returned by [`ReadOnlyStore::seek`].
pub type SeekIter = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send>;

/// Read side shared by stores and snapshots.
pub trait ReadOnlyStore: Send + Sync {
    /// Value for `key`; `Ok(None)` when absent.
    fn try_get(&self, key: &[u8]) -> HostResult<Option<Vec<u8>>>;

    fn contains(&self, key: &[u8]) -> HostResult<bool> {
        Ok(self.try_get(key)?.is_some())
    }

    /// Entries from `prefix` onwards in `direction`; an empty prefix scans
    /// everything.
    fn seek(&self, prefix: &[u8], direction: SeekDirection) -> HostResult<SeekIter>;
}

pub trait WriteStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> HostResult<()>;
    fn delete(&self, key: &[u8]) -> HostResult<()>;
}

/// A point-in-time view whose writes reach the store only on commit.
pub trait KvSnapshot: ReadOnlyStore + WriteStore {
    /// Apply buffered writes to the store. Returns how many were applied.
    fn commit(&self) -> HostResult<usize>;
}

pub trait KvStore: ReadOnlyStore + WriteStore {
    fn get_snapshot(&self) -> HostResult<Box<dyn KvSnapshot>>;
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl ReadOnlyStore for Store {
    fn try_get(&self, key: &[u8]) -> HostResult<Option<Vec<u8>>> {
        Ok(self.get(key)?)
    }

    fn contains(&self, key: &[u8]) -> HostResult<bool> {
        Ok(Store::contains(self, key)?)
    }

    fn seek(&self, prefix: &[u8], direction: SeekDirection) -> HostResult<SeekIter> {
        Ok(Box::new(Store::seek(self, prefix, direction)?))
    }
}

impl WriteStore for Store {
    fn put(&self, key: &[u8], value: &[u8]) -> HostResult<()> {
        Ok(Store::put(self, key, value)?)
    }

    fn delete(&self, key: &[u8]) -> HostResult<()> {
        Ok(Store::delete(self, key)?)
    }
}

impl KvStore for Store {
    fn get_snapshot(&self) -> HostResult<Box<dyn KvSnapshot>> {
        Ok(Box::new(Store::get_snapshot(self)?))
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

impl ReadOnlyStore for Snapshot {
    fn try_get(&self, key: &[u8]) -> HostResult<Option<Vec<u8>>> {
        Ok(self.get(key)?)
    }

    fn contains(&self, key: &[u8]) -> HostResult<bool> {
        Ok(Snapshot::contains(self, key)?)
    }

    fn seek(&self, prefix: &[u8], direction: SeekDirection) -> HostResult<SeekIter> {
        Ok(Box::new(Snapshot::seek(self, prefix, direction)?))
    }
}

impl WriteStore for Snapshot {
    fn put(&self, key: &[u8], value: &[u8]) -> HostResult<()> {
        Ok(Snapshot::put(self, key, value)?)
    }

    fn delete(&self, key: &[u8]) -> HostResult<()> {
        Ok(Snapshot::delete(self, key)?)
    }
}

impl KvSnapshot for Snapshot {
    fn commit(&self) -> HostResult<usize> {
        Ok(Snapshot::commit(self)?)
    }
}
