//! Semaphore acquisition and release
//!
//! Acquisition joins the durable queue and polls until the entry is within
//! capacity. Held entries carry a lease: waiters renew on every poll, holders
//! renew from a background task, and any participant prunes expired entries
//! during its own read-modify-write. A holder that crashes therefore blocks
//! the queue for at most one lease.

use crate::state::QueueState;
use crate::store::{QueuePath, QueueStore};
use chrono::Utc;
use conveyor_exec::{KillSignal, TaskLogger};
use conveyor_foundation::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FAILURE_CAP: u32 = 5;

/// Acquisition parameters
#[derive(Debug, Clone)]
pub struct SemaphoreOptions {
    /// Capacity written when the queue file does not exist yet; an existing
    /// file keeps whatever capacity it already has
    pub capacity: u32,

    /// Capacity units this acquisition consumes
    pub weight: u32,

    /// Shown by `conveyor queue` next to the entry
    pub description: String,

    pub poll_interval: Duration,
    pub lease: Duration,
    pub renew_interval: Duration,

    /// Consecutive transient store failures tolerated before giving up
    pub max_consecutive_failures: u32,
}

impl SemaphoreOptions {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            capacity: 1,
            weight: 1,
            description: description.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease: DEFAULT_LEASE,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            max_consecutive_failures: DEFAULT_FAILURE_CAP,
        }
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to one queue file
pub struct Semaphore {
    path: QueuePath,
    options: SemaphoreOptions,
}

fn lease_of(options: &SemaphoreOptions) -> chrono::Duration {
    chrono::Duration::seconds(options.lease.as_secs() as i64)
}

impl Semaphore {
    pub fn new(path: QueuePath, options: SemaphoreOptions) -> Self {
        Self { path, options }
    }

    /// Join the queue and wait until granted. Position changes are reported
    /// through `logger`; the kill signal aborts the wait and leaves the
    /// queue.
    pub async fn acquire(
        &self,
        logger: &TaskLogger,
        kill: &KillSignal,
    ) -> Result<SemaphoreTicket> {
        // An entry heavier than the whole queue could never be admitted
        // without breaching capacity, so it must not join at all.
        if self.options.weight > self.options.capacity {
            return Err(Error::Config(format!(
                "{}: weight {} exceeds capacity {}",
                self.path, self.options.weight, self.options.capacity
            )));
        }
        let id = Uuid::new_v4().simple().to_string();
        let store: Arc<dyn QueueStore> = Arc::from(self.path.store());
        let lease = lease_of(&self.options);
        let weight = self.options.weight;
        let description = self.options.description.clone();

        let mut failures = 0u32;
        let mut last_position: Option<usize> = None;
        loop {
            let joined = store
                .update(self.options.capacity, &mut |mut state| {
                    let now = Utc::now();
                    state.prune_stale(lease, now);
                    state.join_or_renew(&id, &description, weight, now);
                    state
                })
                .await;
            match joined {
                Ok(state) => {
                    failures = 0;
                    if state.granted(&id) {
                        break;
                    }
                    if let Some(position) = state.position(&id) {
                        if last_position != Some(position) {
                            logger.line(format!(
                                "Position in queue: {} (capacity {})",
                                position, state.capacity
                            ));
                            last_position = Some(position);
                        }
                    }
                }
                Err(err @ Error::SemaphoreCorrupt(_)) => return Err(err),
                Err(err @ (Error::Io(_) | Error::SemaphoreUnavailable(_))) => {
                    failures += 1;
                    if failures >= self.options.max_consecutive_failures {
                        return Err(Error::SemaphoreUnavailable(format!(
                            "{}: giving up after {} failed polls: {}",
                            self.path, failures, err
                        )));
                    }
                    warn!("semaphore poll on {} failed: {}", self.path, err);
                }
                Err(err) => return Err(err),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = kill.wait() => {
                    let removed = store
                        .update(self.options.capacity, &mut |mut state| {
                            state.remove(&id);
                            state
                        })
                        .await;
                    if let Err(err) = removed {
                        warn!("could not leave queue {} on cancel: {}", self.path, err);
                    }
                    return Err(Error::Cancelled);
                }
            }
        }

        Ok(SemaphoreTicket::held(
            id,
            store,
            self.path.clone(),
            &self.options,
        ))
    }
}

/// Proof of a held semaphore; releases the entry when released or dropped
pub struct SemaphoreTicket {
    id: String,
    store: Arc<dyn QueueStore>,
    path: QueuePath,
    capacity: u32,
    released: AtomicBool,
    renew: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SemaphoreTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreTicket")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl SemaphoreTicket {
    fn held(
        id: String,
        store: Arc<dyn QueueStore>,
        path: QueuePath,
        options: &SemaphoreOptions,
    ) -> Self {
        let renew = tokio::spawn(renew_loop(
            id.clone(),
            Arc::clone(&store),
            path.clone(),
            options.capacity,
            lease_of(options),
            options.renew_interval,
        ));
        Self {
            id,
            store,
            path,
            capacity: options.capacity,
            released: AtomicBool::new(false),
            renew: Some(renew),
        }
    }

    /// Leave the queue, freeing capacity for the next waiter
    pub async fn release(mut self) -> Result<()> {
        if let Some(renew) = self.renew.take() {
            renew.abort();
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let id = self.id.clone();
        self.store
            .update(self.capacity, &mut |mut state| {
                state.remove(&id);
                state
            })
            .await
            .map(drop)
    }
}

impl Drop for SemaphoreTicket {
    fn drop(&mut self) {
        if let Some(renew) = self.renew.take() {
            renew.abort();
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.id.clone();
        let removed = self.store.update_blocking(self.capacity, &mut |mut state| {
            state.remove(&id);
            state
        });
        if let Err(err) = removed {
            warn!("could not release queue entry on {}: {}", self.path, err);
        }
    }
}

/// Keeps a holder's lease fresh until the ticket goes away
async fn renew_loop(
    id: String,
    store: Arc<dyn QueueStore>,
    path: QueuePath,
    capacity: u32,
    lease: chrono::Duration,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        let renewed = store
            .update(capacity, &mut |mut state: QueueState| {
                let now = Utc::now();
                state.prune_stale(lease, now);
                if let Some(entry) = state.queue.iter_mut().find(|entry| entry.id == id) {
                    entry.renewed_at = now;
                }
                state
            })
            .await;
        if let Err(err) = renewed {
            warn!("lease renewal on {} failed: {}", path, err);
        }
    }
}

/// Inspect a queue without touching it: no file is created and expired
/// leases are filtered from the report only, never pruned from disk. An
/// absent file is reported as an empty single-slot queue.
pub async fn read_queue(path: &QueuePath) -> Result<QueueState> {
    let lease = chrono::Duration::seconds(DEFAULT_LEASE.as_secs() as i64);
    let mut state = path.store().read(1).await?;
    state.prune_stale(lease, Utc::now());
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_exec::RunLog;
    use std::path::PathBuf;

    fn fast_options(description: &str) -> SemaphoreOptions {
        SemaphoreOptions::new(description).poll_interval(Duration::from_millis(20))
    }

    fn queue_in(dir: &tempfile::TempDir) -> QueuePath {
        QueuePath::Local(dir.path().join("q"))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = queue_in(&dir);
        let log = RunLog::new();

        let sem = Semaphore::new(path.clone(), fast_options("first").capacity(2));
        let ticket = sem
            .acquire(&log.logger("first"), &KillSignal::new())
            .await
            .unwrap();

        let state = read_queue(&path).await.unwrap();
        assert_eq!(state.capacity, 2);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].description, "first");

        ticket.release().await.unwrap();
        let state = read_queue(&path).await.unwrap();
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_admitted_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = queue_in(&dir);
        let log = RunLog::new();

        let holder = Semaphore::new(path.clone(), fast_options("holder"))
            .acquire(&log.logger("holder"), &KillSignal::new())
            .await
            .unwrap();

        let waiting_path = path.clone();
        let waiter_log = log.logger("waiter");
        let waiter = tokio::spawn(async move {
            Semaphore::new(waiting_path, fast_options("waiter"))
                .acquire(&waiter_log, &KillSignal::new())
                .await
        });

        // Let the waiter join and report its position
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = read_queue(&path).await.unwrap();
        assert_eq!(state.queue.len(), 2);
        assert!(!state.granted(&state.queue[1].id));
        let rendered: Vec<String> = log.lines().iter().map(|l| l.line.clone()).collect();
        assert!(rendered
            .iter()
            .any(|line| line == "Position in queue: 1 (capacity 1)"));

        holder.release().await.unwrap();
        let ticket = waiter.await.unwrap().unwrap();
        ticket.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_aborts_wait_and_leaves_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = queue_in(&dir);
        let log = RunLog::new();

        let holder = Semaphore::new(path.clone(), fast_options("holder"))
            .acquire(&log.logger("holder"), &KillSignal::new())
            .await
            .unwrap();

        let kill = KillSignal::new();
        let waiting_path = path.clone();
        let waiter_log = log.logger("waiter");
        let waiter_kill = kill.clone();
        let waiter = tokio::spawn(async move {
            Semaphore::new(waiting_path, fast_options("waiter"))
                .acquire(&waiter_log, &waiter_kill)
                .await
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        kill.kill();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let state = read_queue(&path).await.unwrap();
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].description, "holder");
        holder.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_ticket_leaves_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = queue_in(&dir);
        let log = RunLog::new();

        let ticket = Semaphore::new(path.clone(), fast_options("dropped"))
            .acquire(&log.logger("dropped"), &KillSignal::new())
            .await
            .unwrap();
        drop(ticket);

        let state = read_queue(&path).await.unwrap();
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn test_read_queue_leaves_configured_capacity_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = queue_in(&dir);

        // Inspecting before anyone joined must not create the file
        assert!(read_queue(&path).await.unwrap().queue.is_empty());
        assert!(!dir.path().join("q").exists());

        let log = RunLog::new();
        let ticket = Semaphore::new(path.clone(), fast_options("wide").capacity(4))
            .acquire(&log.logger("wide"), &KillSignal::new())
            .await
            .unwrap();
        let state = read_queue(&path).await.unwrap();
        assert_eq!(state.capacity, 4);
        ticket.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_overweight_acquire_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new();

        let err = Semaphore::new(queue_in(&dir), fast_options("wide").capacity(2).weight(3))
            .acquire(&log.logger("wide"), &KillSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!dir.path().join("q").exists());
    }

    #[tokio::test]
    async fn test_corrupt_queue_file_fails_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("q");
        std::fs::write(&file, "{broken").unwrap();
        let log = RunLog::new();

        let err = Semaphore::new(QueuePath::Local(file), fast_options("task"))
            .acquire(&log.logger("task"), &KillSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SemaphoreCorrupt(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store_gives_up() {
        let missing = PathBuf::from("/nonexistent-dir/conveyor/q");
        let log = RunLog::new();
        let mut options = fast_options("task");
        options.max_consecutive_failures = 2;

        let err = Semaphore::new(QueuePath::Local(missing), options)
            .acquire(&log.logger("task"), &KillSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SemaphoreUnavailable(_)));
    }
}
