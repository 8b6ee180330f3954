//! Keyed, cancel-on-replace expiry timers for transient UI state.
//!
//! Each key owns at most one live timer. Scheduling a key that already has a
//! timer aborts the old task first, so an occurrence extends the window rather
//! than stacking a second expiry. Fired timers carry a generation number; the
//! owner calls [`TimerManager::complete`] when handling the expiry and ignores
//! it if a newer occurrence has replaced that generation in the meantime.

use std::{collections::HashMap, hash::Hash, time::Duration};

use tokio::task::JoinHandle;
use tracing::trace;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct TimerManager<K> {
    entries: HashMap<K, TimerEntry>,
    next_generation: u64,
}

impl<K> TimerManager<K>
where
    K: Copy + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Starts (or restarts) the timer for `key`. `on_fire` runs on the runtime
    /// once `delay` elapses without the key being rescheduled or cancelled.
    pub fn schedule<F>(&mut self, key: K, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(K, u64) + Send + 'static,
    {
        self.cancel(&key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(key, generation);
        });
        trace!(?key, generation, "timers: scheduled");
        self.entries.insert(key, TimerEntry { generation, handle });
        generation
    }

    /// Retires the timer if `generation` is still the live one for `key`.
    pub fn complete(&mut self, key: K, generation: u64) -> bool {
        match self.entries.get(&key) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let keys: Vec<K> = self
            .entries
            .keys()
            .filter(|key| predicate(key))
            .copied()
            .collect();
        for key in &keys {
            self.cancel(key);
        }
        keys.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }
}

impl<K> Default for TimerManager<K>
where
    K: Copy + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for TimerManager<K> {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
    }
}
