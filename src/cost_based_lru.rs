//! a [CostBasedLru] is an Lru cache which uses the cost of the items in the cache to decide when to evict.
//!
//! It backs the in-RAM tier of [crate::TieredTextureCache], where the cost is the size of the compressed bytes, and
//! the manager's outcome history, where every entry costs 1.
//!
//! This is implemented as a vec-backed doubly linked list with free slots chained through the same vec, plus an
//! index from key to slot. Keys are small and `Copy` (asset identifiers), so they are stored inline.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;

struct Slot<K, V> {
    key: K,
    item: Arc<V>,
    cost: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Entry<K, V> {
    /// Free, pointing at the next free slot.
    Free(Option<usize>),
    Used(Slot<K, V>),
}

impl<K, V> Entry<K, V> {
    fn used(&self) -> &Slot<K, V> {
        match self {
            Entry::Used(s) => s,
            Entry::Free(_) => panic!("Entry should be occupied"),
        }
    }

    fn used_mut(&mut self) -> &mut Slot<K, V> {
        match self {
            Entry::Used(s) => s,
            Entry::Free(_) => panic!("Entry should be occupied"),
        }
    }
}

pub struct CostBasedLru<K: Hash + Eq + Copy, V> {
    entries: Vec<Entry<K, V>>,
    index: HashMap<K, usize, RandomState>,
    /// Evict from the tail until the total cost is at most this.
    max_cost: u64,
    current_cost: u64,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used, evicted first.
    tail: Option<usize>,
    free_head: Option<usize>,
}

impl<K: Hash + Eq + Copy, V> CostBasedLru<K, V> {
    pub fn new(max_cost: u64) -> CostBasedLru<K, V> {
        CostBasedLru {
            entries: Vec::new(),
            index: Default::default(),
            max_cost,
            current_cost: 0,
            head: None,
            tail: None,
            free_head: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn current_cost(&self) -> u64 {
        self.current_cost
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    /// Change the budget, evicting immediately if it shrank.
    pub fn set_max_cost(&mut self, max_cost: u64) {
        self.max_cost = max_cost;
        self.maybe_evict();
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Read an item without making it more recent.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        Some(self.entries[ind].used().item.clone())
    }

    /// Read an item, making it the most recent.
    pub fn get(&mut self, key: &K) -> Option<Arc<V>> {
        let ind = *self.index.get(key)?;
        self.unlink(ind);
        self.push_front(ind);
        Some(self.entries[ind].used().item.clone())
    }

    /// Add an entry to the cache. Return the old entry if this key was already present.
    ///
    /// An item whose cost alone exceeds the budget is evicted straight away, along with everything else.
    pub fn insert(&mut self, key: K, value: V, cost: u64) -> Option<Arc<V>> {
        let old = self.remove(&key);
        let ind = self.take_free();
        self.entries[ind] = Entry::Used(Slot {
            key,
            item: Arc::new(value),
            cost,
            prev: None,
            next: None,
        });
        self.push_front(ind);
        self.index.insert(key, ind);
        self.current_cost += cost;
        self.maybe_evict();
        old
    }

    pub fn remove(&mut self, key: &K) -> Option<Arc<V>> {
        let ind = self.index.remove(key)?;
        Some(self.release(ind))
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let mut ind = self.head;
        std::iter::from_fn(move || {
            let slot = self.entries[ind?].used();
            ind = slot.next;
            Some((&slot.key, &*slot.item))
        })
    }

    fn take_free(&mut self) -> usize {
        if let Some(f) = self.free_head {
            self.free_head = match self.entries[f] {
                Entry::Free(next) => next,
                Entry::Used(_) => panic!("Free list points at an occupied entry"),
            };
            return f;
        }
        self.entries.push(Entry::Free(None));
        self.entries.len() - 1
    }

    fn unlink(&mut self, ind: usize) {
        let (prev, next) = {
            let s = self.entries[ind].used();
            (s.prev, s.next)
        };
        match prev {
            Some(p) => self.entries[p].used_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].used_mut().prev = prev,
            None => self.tail = prev,
        }
        let s = self.entries[ind].used_mut();
        s.prev = None;
        s.next = None;
    }

    fn push_front(&mut self, ind: usize) {
        let old_head = self.head;
        {
            let s = self.entries[ind].used_mut();
            s.prev = None;
            s.next = old_head;
        }
        if let Some(h) = old_head {
            self.entries[h].used_mut().prev = Some(ind);
        }
        self.head = Some(ind);
        if self.tail.is_none() {
            self.tail = Some(ind);
        }
    }

    /// Unlink an occupied slot and put it on the free list. The caller has already removed it from the index.
    fn release(&mut self, ind: usize) -> Arc<V> {
        self.unlink(ind);
        let old = std::mem::replace(&mut self.entries[ind], Entry::Free(self.free_head));
        self.free_head = Some(ind);
        match old {
            Entry::Used(slot) => {
                self.current_cost -= slot.cost;
                slot.item
            }
            Entry::Free(_) => panic!("Should have been occupied"),
        }
    }

    fn maybe_evict(&mut self) {
        while self.current_cost > self.max_cost {
            let victim = match self.tail {
                Some(t) => t,
                None => panic!("Not enough entries to explain cost"),
            };
            let key = self.entries[victim].used().key;
            self.index.remove(&key);
            self.release(victim);
        }
    }
}
