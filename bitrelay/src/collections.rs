//! Relay stores that give memory back after a burst.
//!
//! A busy mesh floods the dedup stores and the broadcast queue, then the
//! eviction sweep empties them again. These wrappers count removals since the
//! last insertion and call `shrink_to_fit` once 1/16 of the configured
//! capacity has been removed, so a quiet relay does not sit on the high-water
//! allocation.

use alloc::collections::VecDeque;
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};

use hashbrown::HashMap;

/// Removals needed before shrinking (1/16 of capacity, clamped to 1..=255).
const fn shrink_threshold(max_capacity: usize) -> u8 {
    let threshold = max_capacity / 16;
    if threshold == 0 {
        1
    } else if threshold > u8::MAX as usize {
        u8::MAX
    } else {
        threshold as u8
    }
}

fn saturating_count(removed: usize) -> u8 {
    removed.min(u8::MAX as usize) as u8
}

/// Retained broadcast queue. Entries leave only through [`retain`](Self::retain).
pub struct ShrinkingVecDeque<T> {
    inner: VecDeque<T>,
    removals_since_add: u8,
    shrink_threshold: u8,
}

impl<T> ShrinkingVecDeque<T> {
    pub fn with_max_capacity(max_capacity: usize) -> Self {
        Self {
            inner: VecDeque::new(),
            removals_since_add: 0,
            shrink_threshold: shrink_threshold(max_capacity),
        }
    }

    /// Append to the back. Resets the removal counter.
    pub fn push_back(&mut self, value: T) {
        self.removals_since_add = 0;
        self.inner.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }

    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.inner.len();
        self.inner.retain(|x| f(x));
        let removed = before - self.inner.len();
        if note_removed(&mut self.removals_since_add, self.shrink_threshold, removed) {
            self.inner.shrink_to_fit();
        }
    }
}

impl<T: PartialEq> ShrinkingVecDeque<T> {
    pub fn contains(&self, value: &T) -> bool {
        self.inner.contains(value)
    }
}

/// Adds `removed` to the counter; true when it is time to shrink.
fn note_removed(counter: &mut u8, threshold: u8, removed: usize) -> bool {
    if removed == 0 {
        return false;
    }
    *counter = counter.saturating_add(saturating_count(removed));
    if *counter >= threshold {
        *counter = 0;
        return true;
    }
    false
}

/// Dedup store keyed by message id or pass-along hash. Evicts its oldest
/// entry when full and shrinks after the sweep empties it.
pub struct ShrinkingHashMap<K, V, S = hashbrown::DefaultHashBuilder> {
    inner: HashMap<K, V, S>,
    max_capacity: usize,
    removals_since_add: u8,
    shrink_threshold: u8,
}

impl<K, V> ShrinkingHashMap<K, V, hashbrown::DefaultHashBuilder> {
    /// Create an empty map holding at most `max_capacity` entries.
    pub fn with_max_capacity(max_capacity: usize) -> Self {
        Self {
            inner: HashMap::new(),
            max_capacity,
            removals_since_add: 0,
            shrink_threshold: shrink_threshold(max_capacity),
        }
    }
}

impl<K, V, S> ShrinkingHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn values(&self) -> hashbrown::hash_map::Values<'_, K, V> {
        self.inner.values()
    }

    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        let before = self.inner.len();
        self.inner.retain(|k, v| f(k, v));
        let removed = before - self.inner.len();
        if note_removed(&mut self.removals_since_add, self.shrink_threshold, removed) {
            self.inner.shrink_to_fit();
        }
    }
}

impl<K, V, S> ShrinkingHashMap<K, V, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    /// Store-if-new. A key already present is left untouched; otherwise the
    /// entry with the smallest `age(value)` is evicted first when the map is
    /// full.
    ///
    /// Returns whether the value was inserted and the evicted key, if any.
    pub fn insert_new_bounded<B, F>(&mut self, key: K, value: V, mut age: F) -> (bool, Option<K>)
    where
        B: Ord,
        F: FnMut(&V) -> B,
    {
        if self.inner.contains_key(&key) {
            return (false, None);
        }
        let mut evicted = None;
        if self.inner.len() >= self.max_capacity {
            evicted = self.inner.iter().min_by_key(|(_, v)| age(v)).map(|(k, _)| k.clone());
        }
        if let Some(oldest) = &evicted {
            self.inner.remove(oldest);
        }
        self.removals_since_add = 0;
        self.inner.insert(key, value);
        (true, evicted)
    }
}
