//! Key ordering, equality and hashing over raw byte strings.
//!
//! The index has no physical order, so every scan sorts its results here.
//! Comparison is byte-by-byte from index 0 and a strict prefix sorts before
//! any longer key that extends it. Equality and hashing depend only on content,
//! never on which allocation holds the bytes, which lets keys decoded from disk
//! match content-equal keys held in memory.

use std::cmp::Ordering;
use std::hash::{BuildHasher, Hasher};

/// Direction of a `seek` scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SeekDirection {
    /// Keys `>= prefix`, ascending
    #[default]
    Forward,
    /// Keys `<= prefix`, descending
    Backward,
}

/// Total order over byte keys. Stateless; pass it by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyComparer {
    /// Lexicographic byte order
    Forward,
    /// Negated lexicographic byte order
    Reverse,
}

impl KeyComparer {
    /// The comparer that sorts a scan in `direction`.
    pub fn for_direction(direction: SeekDirection) -> Self {
        match direction {
            SeekDirection::Forward => KeyComparer::Forward,
            SeekDirection::Backward => KeyComparer::Reverse,
        }
    }

    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        let ord = compare_bytes(a, b);
        match self {
            KeyComparer::Forward => ord,
            KeyComparer::Reverse => ord.reverse(),
        }
    }

    /// True when `key` is on the scan side of `bound` (inclusive).
    ///
    /// An empty bound admits every key.
    pub fn admits(self, key: &[u8], bound: &[u8]) -> bool {
        bound.is_empty() || self.compare(key, bound) != Ordering::Less
    }

    /// Sort `entries` by key under this comparer.
    pub fn sort_entries<V>(self, entries: &mut [(Vec<u8>, V)]) {
        entries.sort_unstable_by(|(a, _), (b, _)| self.compare(a, b));
    }
}

fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    let common = a.len().min(b.len());
    for i in 0..common {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Deep content equality. Agrees with `KeyComparer::compare(..) == Equal`.
pub fn keys_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a == b
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the key bytes.
pub fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = KeyHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// Content-only hasher (FNV-1a).
#[derive(Debug, Clone, Copy)]
pub struct KeyHasher {
    state: u64,
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self { state: FNV_OFFSET }
    }
}

impl Hasher for KeyHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state ^= b as u64;
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.state
    }
}

/// `BuildHasher` for maps keyed by byte strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildKeyHasher;

impl BuildHasher for BuildKeyHasher {
    type Hasher = KeyHasher;

    fn build_hasher(&self) -> KeyHasher {
        KeyHasher::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hash;

    #[test]
    fn test_prefix_sorts_first() {
        assert_eq!(KeyComparer::Forward.compare(b"ab", b"abc"), Ordering::Less);
        assert_eq!(KeyComparer::Forward.compare(b"abc", b"ab"), Ordering::Greater);
        assert_eq!(KeyComparer::Forward.compare(b"", b"a"), Ordering::Less);
    }

    #[test]
    fn test_reverse_negates() {
        let pairs: [(&[u8], &[u8]); 4] = [(b"a", b"b"), (b"b", b"a"), (b"x", b"x"), (b"ab", b"abc")];
        for (a, b) in pairs {
            assert_eq!(
                KeyComparer::Reverse.compare(a, b),
                KeyComparer::Forward.compare(a, b).reverse()
            );
        }
    }

    #[test]
    fn test_unsigned_byte_order() {
        // 0xFF must sort after 0x01; bytes are unsigned
        assert_eq!(KeyComparer::Forward.compare(&[0xFF], &[0x01]), Ordering::Greater);
    }

    #[test]
    fn test_equality_agrees_with_compare() {
        let keys: [&[u8]; 5] = [b"", b"a", b"ab", b"b", &[0x00, 0xFF]];
        for a in keys {
            for b in keys {
                assert_eq!(
                    keys_equal(a, b),
                    KeyComparer::Forward.compare(a, b) == Ordering::Equal
                );
            }
        }
    }

    #[test]
    fn test_hash_independent_of_allocation() {
        let held = b"storage-key".to_vec();
        let decoded: Vec<u8> = [b"storage-".as_slice(), b"key"].concat();
        assert_eq!(key_hash(&held), key_hash(&decoded));

        let build = BuildKeyHasher;
        let mut h1 = build.build_hasher();
        let mut h2 = build.build_hasher();
        held.hash(&mut h1);
        decoded.hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn test_admits_bounds() {
        assert!(KeyComparer::Forward.admits(b"b", b"b"));
        assert!(KeyComparer::Forward.admits(b"c", b"b"));
        assert!(!KeyComparer::Forward.admits(b"a", b"b"));
        assert!(KeyComparer::Reverse.admits(b"a", b"b"));
        assert!(!KeyComparer::Reverse.admits(b"c", b"b"));
        assert!(KeyComparer::Reverse.admits(b"zzz", b""));
    }

    #[test]
    fn test_sort_entries() {
        let mut entries = vec![
            (b"b".to_vec(), 2),
            (b"a".to_vec(), 1),
            (b"ab".to_vec(), 3),
        ];
        KeyComparer::Reverse.sort_entries(&mut entries);
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"ab".to_vec(), b"a".to_vec()]);
    }
}
