//! Bounded in-process cache of hydrated tasks.
//!
//! Two caps apply at once: an entry count and an approximate memory budget
//! (the serialized JSON size of each task). When either would be exceeded the
//! entry with the lowest `hits / age_ms` score is evicted, one at a time, until
//! both hold. Entries older than the TTL are treated as misses and dropped.

use crate::libs::config::CacheConfig;
use crate::libs::task::Task;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    task: Task,
    inserted_at: Instant,
    hits: u64,
    size: usize,
}

impl CacheEntry {
    /// Age is floored at 1ms so fresh entries get a finite score.
    fn score(&self, now: Instant) -> f64 {
        let age_ms = now.duration_since(self.inserted_at).as_millis().max(1) as f64;
        self.hits as f64 / age_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    memory: usize,
    hits: u64,
    misses: u64,
}

pub struct TaskCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    max_memory: usize,
    ttl: Duration,
}

impl TaskCache {
    pub fn new(config: &CacheConfig) -> Self {
        TaskCache {
            state: Mutex::new(CacheState::default()),
            max_entries: config.max_entries,
            max_memory: config.max_memory_bytes,
            ttl: Duration::from_millis(config.ttl_ms),
        }
    }

    /// Returns a fresh copy of the cached task. Expired entries count as a
    /// miss and are removed.
    pub fn get(&self, path: &str) -> Option<Task> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(path) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => {
                state.misses += 1;
                return None;
            }
        };
        if expired {
            remove_entry(&mut state, path);
            state.misses += 1;
            return None;
        }

        state.hits += 1;
        let entry = state.entries.get_mut(path)?;
        entry.hits += 1;
        Some(entry.task.clone())
    }

    /// Inserts or replaces `task` with a zero hit count, evicting by score
    /// until both caps hold. A task larger than the whole memory budget is not
    /// cached.
    pub fn put(&self, task: &Task) {
        let size = encoded_size(task);
        let mut state = self.state.lock();
        self.insert(&mut state, task, size);
    }

    /// Caches a task read outside any transaction, unless the cache already
    /// holds a newer version of it (a commit that landed after the read).
    pub fn put_if_newer(&self, task: &Task) {
        let size = encoded_size(task);
        let mut state = self.state.lock();
        let newer_cached = state
            .entries
            .get(&task.path)
            .is_some_and(|entry| entry.task.metadata.version > task.metadata.version);
        if !newer_cached {
            self.insert(&mut state, task, size);
        }
    }

    fn insert(&self, state: &mut CacheState, task: &Task, size: usize) {
        remove_entry(state, &task.path);
        if self.max_entries == 0 || size > self.max_memory {
            return;
        }

        let now = Instant::now();
        while !state.entries.is_empty()
            && (state.entries.len() + 1 > self.max_entries || state.memory + size > self.max_memory)
        {
            let victim = state
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.score(now)
                        .total_cmp(&b.score(now))
                        .then_with(|| a.inserted_at.cmp(&b.inserted_at))
                })
                .map(|(path, _)| path.clone());
            match victim {
                Some(path) => remove_entry(state, &path),
                None => break,
            }
        }

        state.memory += size;
        state.entries.insert(
            task.path.clone(),
            CacheEntry {
                task: task.clone(),
                inserted_at: now,
                hits: 0,
                size,
            },
        );
    }

    pub fn invalidate(&self, path: &str) {
        remove_entry(&mut self.state.lock(), path);
    }

    /// Drops every entry and resets the hit/miss counters.
    pub fn clear(&self) {
        *self.state.lock() = CacheState::default();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            memory_bytes: state.memory,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 { 0.0 } else { state.hits as f64 / lookups as f64 },
        }
    }
}

fn encoded_size(task: &Task) -> usize {
    serde_json::to_vec(task).map(|bytes| bytes.len()).unwrap_or(0)
}

fn remove_entry(state: &mut CacheState, path: &str) {
    if let Some(entry) = state.entries.remove(path) {
        state.memory = state.memory.saturating_sub(entry.size);
    }
}
