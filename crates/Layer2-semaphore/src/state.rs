//! Semaphore queue state
//!
//! The durable state is a capacity plus an arrival-ordered queue of entries.
//! Admission is strictly FIFO: the prefix of the queue whose cumulative
//! weight fits within capacity holds the semaphore, everyone behind it waits.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One participant in the queue, waiting or holding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique per acquisition attempt
    pub id: String,

    /// Human-readable owner, shown by `conveyor queue`
    pub description: String,

    /// Capacity units consumed while holding
    pub weight: u32,

    /// When the entry first joined
    pub joined_at: DateTime<Utc>,

    /// Last lease renewal; stale entries are pruned by other participants
    pub renewed_at: DateTime<Utc>,
}

/// Full durable state of one semaphore queue file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    pub capacity: u32,
    pub queue: Vec<QueueEntry>,
}

impl QueueState {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            queue: Vec::new(),
        }
    }

    /// Zero-based arrival position of `id`, if present
    pub fn position(&self, id: &str) -> Option<usize> {
        self.queue.iter().position(|entry| entry.id == id)
    }

    /// Whether `id` currently holds the semaphore. An entry is granted when
    /// the cumulative weight up to and including it fits within capacity;
    /// at no point does the granted prefix exceed capacity. Entries heavier
    /// than the whole capacity are rejected before they ever join.
    pub fn granted(&self, id: &str) -> bool {
        let mut used = 0u64;
        for entry in &self.queue {
            if entry.id == id {
                return used + u64::from(entry.weight) <= u64::from(self.capacity);
            }
            used += u64::from(entry.weight);
        }
        false
    }

    /// Append `id` if absent, otherwise refresh its lease
    pub fn join_or_renew(&mut self, id: &str, description: &str, weight: u32, now: DateTime<Utc>) {
        match self.queue.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => entry.renewed_at = now,
            None => self.queue.push(QueueEntry {
                id: id.to_string(),
                description: description.to_string(),
                weight,
                joined_at: now,
                renewed_at: now,
            }),
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.queue.retain(|entry| entry.id != id);
    }

    /// Drop entries whose lease expired; covers holders that crashed without
    /// releasing, on this host or any other.
    pub fn prune_stale(&mut self, lease: Duration, now: DateTime<Utc>) {
        self.queue.retain(|entry| now - entry.renewed_at <= lease);
    }
}
