/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Recency-ordered bounded map.
//!
//! An index-based LRU: entries live in a slot arena threaded by an intrusive
//! doubly-linked list, so promoting an entry on access moves two indices and
//! never reallocates. Eviction is driven by the caller through
//! [`pop_lru_where`](BoundedLRUCache::pop_lru_where), whose predicate lets
//! the reference-list block cache refuse to drop dirty blocks.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Slot<K, V> {
    key: K,
    /// `Some` while the slot is linked; taken on removal so the arena can
    /// reuse the slot without a copy.
    value: Option<V>,
    /// Towards more recently used.
    prev: usize,
    /// Towards less recently used.
    next: usize,
}

/// Bounded map with least-recently-used ordering and caller-controlled
/// eviction.
pub struct BoundedLRUCache<K: Copy + Eq + Hash, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Slot<K, V>>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
}

impl<K: Copy + Eq + Hash, V> BoundedLRUCache<K, V> {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity.min(1024)),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The bound given at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the cache is at its bound.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
    }

    fn push_front(&mut self, index: usize) {
        self.slots[index].prev = NIL;
        self.slots[index].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = index;
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
    }

    fn touch(&mut self, index: usize) {
        if self.head != index {
            self.unlink(index);
            self.push_front(index);
        }
    }

    /// Returns the value for `key` and promotes it to most recent.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.touch(index);
        self.slots[index].value.as_ref()
    }

    /// Mutable variant of [`get`](BoundedLRUCache::get).
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = *self.map.get(key)?;
        self.touch(index);
        self.slots[index].value.as_mut()
    }

    /// Whether `key` is present. Does not promote.
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts or overwrites `key`, promoting it to most recent. The caller
    /// is expected to make room first when the cache is full.
    pub fn push(&mut self, key: K, value: V) {
        if let Some(&index) = self.map.get(&key) {
            self.slots[index].value = Some(value);
            self.touch(index);
            return;
        }
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Slot {
                    key,
                    value: Some(value),
                    prev: NIL,
                    next: NIL,
                };
                index
            }
            None => {
                self.slots.push(Slot {
                    key,
                    value: Some(value),
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }
        };
        self.map.insert(key, index);
        self.push_front(index);
    }

    /// Removes and returns the least-recently-used entry whose key satisfies
    /// `evictable`, or `None` if every entry is refused.
    pub fn pop_lru_where(&mut self, evictable: impl Fn(&K) -> bool) -> Option<(K, V)> {
        let mut index = self.tail;
        while index != NIL {
            if evictable(&self.slots[index].key) {
                let key = self.slots[index].key;
                self.unlink(index);
                self.map.remove(&key);
                self.free.push(index);
                return self.slots[index].value.take().map(|value| (key, value));
            }
            index = self.slots[index].prev;
        }
        None
    }

    /// Removes `key` and returns its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.map.remove(key)?;
        self.unlink(index);
        self.free.push(index);
        self.slots[index].value.take()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }
}
