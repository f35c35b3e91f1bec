//! Durable FIFO semaphore queue
//!
//! Cross-host concurrency limits backed by a single queue file, local or
//! reached over ssh. Participants join in arrival order, the prefix that fits
//! within capacity holds the semaphore, and lease expiry reclaims entries
//! from crashed holders.

pub mod semaphore;
pub mod state;
pub mod store;

pub use semaphore::{read_queue, Semaphore, SemaphoreOptions, SemaphoreTicket};
pub use state::{QueueEntry, QueueState};
pub use store::{LocalStore, QueuePath, QueueStore, SshStore};
