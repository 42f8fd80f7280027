//! In-flight probe tracking shared by the UDP and ICMP probers.
//!
//! A table pairs a key → send-time map with a FIFO ordered by send time, so
//! correlation is by full key while ageing out walks the front of the queue.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct InflightTable<K> {
    entries: HashMap<K, Instant>,
    order: VecDeque<(K, Instant)>,
}

impl<K> Default for InflightTable<K> {
    fn default() -> Self {
        InflightTable {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> InflightTable<K> {
    pub fn new() -> Self {
        InflightTable::default()
    }

    pub fn record(&mut self, key: K, sent_at: Instant) {
        self.entries.insert(key.clone(), sent_at);
        self.order.push_back((key, sent_at));
    }

    /// Correlate a response: remove and return the matching send time.
    pub fn take(&mut self, key: &K) -> Option<Instant> {
        self.entries.remove(key)
    }

    /// Discard entries older than `max_age`. The FIFO is insertion-ordered
    /// by send time, so the scan stops at the first young entry.
    pub fn purge(&mut self, max_age: Duration, now: Instant) {
        while let Some((key, sent_at)) = self.order.front() {
            if now.duration_since(*sent_at) <= max_age {
                break;
            }
            self.entries.remove(key);
            let _ = self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
