//! Precomputed-hash cache keys.
//!
//! Cache tables in this crate are `FxHashMap`s whose keys are often hashed
//! once and probed many times (pipeline identities, descriptor state keys,
//! module keybox keys). [`Hashed`] memoizes an xxh3 digest next to the key so
//! repeated probes and re-insertions never re-walk the key bytes; equality
//! stays structural.

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

/// xxh3 digest of a key's `Hash` byte stream.
#[must_use]
pub fn xxh_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = Xxh3::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A key paired with its memoized xxh3 digest.
///
/// `Hash` forwards the stored digest; `Eq` compares the underlying keys, so
/// hash collisions still resolve structurally.
#[derive(Debug, Clone)]
pub struct Hashed<K> {
    key: K,
    hash: u64,
}

impl<K: Hash> Hashed<K> {
    #[must_use]
    pub fn new(key: K) -> Self {
        let hash = xxh_key(&key);
        Self { key, hash }
    }
}

impl<K> Hashed<K> {
    /// Wraps a key whose digest was already computed elsewhere.
    #[must_use]
    pub fn precomputed(key: K, hash: u64) -> Self {
        Self { key, hash }
    }

    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[must_use]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl<K: PartialEq> PartialEq for Hashed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.key == other.key
    }
}

impl<K: Eq> Eq for Hashed<K> {}

impl<K> Hash for Hashed<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    #[test]
    fn hashed_probes_structurally() {
        let a = Hashed::new((1u32, 2u32));
        let b = Hashed::new((1u32, 2u32));
        let c = Hashed::new((1u32, 3u32));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut map = FxHashMap::default();
        map.insert(a, "x");
        assert_eq!(map.get(&b), Some(&"x"));
        assert_eq!(map.get(&c), None);
    }

    #[test]
    fn precomputed_matches_fresh() {
        let fresh = Hashed::new(42u64);
        let pre = Hashed::precomputed(42u64, fresh.hash_value());
        assert_eq!(fresh, pre);
    }
}
