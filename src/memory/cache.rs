//! Bounded embedding cache with value-weighted eviction.
//!
//! Keyed by a fast hash of the text. Hits bump a counter and refresh
//! recency; when full, the entry minimising `hits / max(1, age_seconds)`
//! is evicted: a frequently used old entry outlives a fresh one nobody
//! asked for twice. Entries older than the TTL are treated as misses.

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHasher};

struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
    hits: u64,
}

/// Not thread-safe by itself; the memory manager guards it with a mutex.
pub struct EmbeddingCache {
    capacity: usize,
    ttl: Duration,
    map: FxHashMap<u64, CacheEntry>,
    /// Recency order, oldest first. Small (≤ capacity), so linear
    /// reshuffles are fine.
    order: Vec<u64>,
}

impl EmbeddingCache {
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            map: FxHashMap::default(),
            order: Vec::new(),
        }
    }

    fn key_of(text: &str) -> u64 {
        let mut hasher = FxHasher::default();
        text.hash(&mut hasher);
        hasher.finish()
    }

    /// Cache lookup; a hit bumps the counter and moves the entry to the
    /// recency tail. Expired entries are dropped and reported as misses.
    pub fn get(&mut self, text: &str) -> Option<Vec<f32>> {
        let key = Self::key_of(text);
        let expired = match self.map.get(&key) {
            None => return None,
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
        };
        if expired {
            self.remove(key);
            return None;
        }
        let entry = self.map.get_mut(&key)?;
        entry.hits += 1;
        let vector = entry.vector.clone();
        self.touch(key);
        Some(vector)
    }

    /// Insert, evicting the lowest-value entry when full.
    pub fn insert(&mut self, text: &str, vector: Vec<f32>) {
        let key = Self::key_of(text);
        if self.map.contains_key(&key) {
            if let Some(entry) = self.map.get_mut(&key) {
                entry.vector = vector;
                entry.inserted_at = Instant::now();
            }
            self.touch(key);
            return;
        }
        if self.map.len() >= self.capacity {
            self.evict_lowest_value();
        }
        self.map.insert(
            key,
            CacheEntry {
                vector,
                inserted_at: Instant::now(),
                hits: 0,
            },
        );
        self.order.push(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn touch(&mut self, key: u64) {
        if let Some(pos) = self.order.iter().position(|&k| k == key) {
            self.order.remove(pos);
            self.order.push(key);
        }
    }

    fn remove(&mut self, key: u64) {
        self.map.remove(&key);
        if let Some(pos) = self.order.iter().position(|&k| k == key) {
            self.order.remove(pos);
        }
    }

    fn evict_lowest_value(&mut self) {
        let victim = self
            .order
            .iter()
            .min_by(|&&a, &&b| {
                let score_a = self.value_score(a);
                let score_b = self.value_score(b);
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied();
        if let Some(key) = victim {
            self.remove(key);
        }
    }

    fn value_score(&self, key: u64) -> f64 {
        match self.map.get(&key) {
            Some(entry) => {
                let age = entry.inserted_at.elapsed().as_secs().max(1);
                entry.hits as f64 / age as f64
            }
            None => f64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_returns_the_vector_and_counts() {
        let mut cache = EmbeddingCache::new(4, Duration::from_secs(60));
        cache.insert("hello", vec![1.0, 2.0]);
        assert_eq!(cache.get("hello"), Some(vec![1.0, 2.0]));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut cache = EmbeddingCache::new(2, Duration::from_secs(60));
        cache.insert("a", vec![1.0]);
        cache.insert("b", vec![2.0]);
        cache.insert("c", vec![3.0]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn frequently_hit_entries_survive_eviction() {
        let mut cache = EmbeddingCache::new(2, Duration::from_secs(60));
        cache.insert("popular", vec![1.0]);
        cache.insert("ignored", vec![2.0]);
        for _ in 0..5 {
            cache.get("popular");
        }
        cache.insert("newcomer", vec![3.0]);
        assert!(cache.get("popular").is_some());
        assert!(cache.get("ignored").is_none());
    }

    #[test]
    fn expired_entries_are_misses() {
        let mut cache = EmbeddingCache::new(4, Duration::from_millis(0));
        cache.insert("ephemeral", vec![1.0]);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("ephemeral"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_refreshes_in_place() {
        let mut cache = EmbeddingCache::new(2, Duration::from_secs(60));
        cache.insert("a", vec![1.0]);
        cache.insert("a", vec![9.0]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), Some(vec![9.0]));
    }
}
