//! Ordered range scans.
//!
//! The index is unordered, so a seek gathers every admitted entry and sorts
//! it before the first item is handed out. The caller's session is back in
//! the pool by the time a `Seek` exists.

use crate::ordering::{KeyComparer, SeekDirection};

/// Entries at or beyond a bound, in comparer order.
///
/// `Forward` yields keys `>= prefix` ascending; `Backward` yields keys
/// `<= prefix` descending. An empty prefix yields every key.
#[derive(Debug)]
pub struct Seek {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Seek {
    /// Filter `entries` against `prefix` and sort them for `direction`.
    pub fn new(mut entries: Vec<(Vec<u8>, Vec<u8>)>, prefix: &[u8], direction: SeekDirection) -> Self {
        let comparer = KeyComparer::for_direction(direction);
        entries.retain(|(key, _)| comparer.admits(key, prefix));
        comparer.sort_entries(&mut entries);
        Self { entries: entries.into_iter() }
    }

    /// Keys only, in scan order.
    pub fn keys(self) -> impl Iterator<Item = Vec<u8>> {
        self.map(|(key, _)| key)
    }
}

impl Iterator for Seek {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for Seek {}
