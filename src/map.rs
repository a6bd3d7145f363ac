//! Bounded mapping interface and a fixed-capacity implementation.
//!
//! Registries that must not grow on the heap store their entries in a
//! [`FixedMap`]. Code that should not care about the compile-time
//! capacity depends on the [`BoundedMap`] trait instead.

use heapless::Vec;

use crate::error::{Error, Result};

/// Size-agnostic view of a fixed-capacity key/value table.
pub trait BoundedMap<K, V> {
    /// Maximum number of entries.
    fn capacity(&self) -> usize;

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    fn get(&self, key: &K) -> Option<&V>;

    /// Insert a new entry.
    ///
    /// Fails with [`Error::AlreadyExists`] for a duplicate key and with
    /// [`Error::ResourceExhausted`] at capacity. Existing entries are
    /// untouched on failure.
    fn try_insert(&mut self, key: K, value: V) -> Result<()>;

    fn remove(&mut self, key: &K) -> Option<V>;
}

/// Linear-scan map backed by a `heapless::Vec`.
pub struct FixedMap<K, V, const N: usize> {
    entries: Vec<(K, V), N>,
}

impl<K, V, const N: usize> FixedMap<K, V, N> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl<K, V, const N: usize> Default for FixedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq, V, const N: usize> BoundedMap<K, V> for FixedMap<K, V, N> {
    fn capacity(&self) -> usize {
        N
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn try_insert(&mut self, key: K, value: V) -> Result<()> {
        if self.get(&key).is_some() {
            return Err(Error::AlreadyExists);
        }
        self.entries
            .push((key, value))
            .map_err(|_| Error::ResourceExhausted)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.swap_remove(idx).1)
    }
}
