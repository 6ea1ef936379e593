//! Fixed-capacity LRU cache with per-entry insertion timestamps.
//!
//! The cache only evicts by recency. Staleness is the caller's call: every hit carries
//! the instant it was stored so the caller can compare its age against whatever TTL it owns.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A cached value together with the instant it was stored.
#[derive(Clone, Debug)]
pub struct CacheHit<V> {
    pub value: V,
    pub inserted_at: Instant,
}

impl<V> CacheHit<V> {
    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Node<K, V> {
    key: K,
    value: V,
    inserted_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Slab of nodes threaded into a doubly linked recency list.
/// `head` is the most recently used entry, `tail` the eviction candidate.
struct Inner<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            stats: CacheStats::default(),
        }
    }

    fn node(&self, idx: usize) -> Option<&Node<K, V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K, V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn detach(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.node_mut(nx) {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(n) = self.node_mut(idx) {
            n.prev = None;
            n.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(n) = self.node_mut(idx) {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.node_mut(h) {
                n.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn remove_slot(&mut self, idx: usize) -> Option<Node<K, V>> {
        self.detach(idx);
        let node = self.slots.get_mut(idx).and_then(Option::take)?;
        self.index.remove(&node.key);
        self.free.push(idx);
        Some(node)
    }

    fn allocate(&mut self, node: Node<K, V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }
}

/// Thread-safe LRU cache. One coarse lock per instance; every operation is O(1).
pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Capacity is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Looks up `key` and marks it most recently used. Never expires by age.
    pub fn get(&self, key: &K) -> Option<CacheHit<V>> {
        let mut inner = self.inner.lock();
        let found = inner.index.get(key).copied();
        let Some(idx) = found else {
            inner.stats.misses += 1;
            return None;
        };
        inner.detach(idx);
        inner.push_front(idx);
        inner.stats.hits += 1;
        inner.node(idx).map(|n| CacheHit {
            value: n.value.clone(),
            inserted_at: n.inserted_at,
        })
    }

    /// Inserts or replaces `key`, stamping it with the current instant.
    pub fn set(&self, key: K, value: V) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let existing = inner.index.get(&key).copied();
        if let Some(idx) = existing {
            if let Some(n) = inner.node_mut(idx) {
                n.value = value;
                n.inserted_at = now;
            }
            inner.detach(idx);
            inner.push_front(idx);
            return;
        }
        if inner.index.len() >= self.capacity {
            if let Some(tail) = inner.tail {
                inner.remove_slot(tail);
                inner.stats.evictions += 1;
            }
        }
        let idx = inner.allocate(Node {
            key: key.clone(),
            value,
            inserted_at: now,
            prev: None,
            next: None,
        });
        inner.push_front(idx);
        inner.index.insert(key, idx);
    }

    pub fn delete(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let found = inner.index.get(key).copied();
        match found {
            Some(idx) => inner.remove_slot(idx).is_some(),
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let stats = inner.stats;
        *inner = Inner::new(self.capacity);
        inner.stats = stats;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn size(&self) -> usize {
        self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<K> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.index.len());
        let mut cursor = inner.head;
        while let Some(idx) = cursor {
            let Some(node) = inner.node(idx) else { break };
            out.push(node.key.clone());
            cursor = node.next;
        }
        out
    }
}
