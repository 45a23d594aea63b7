//! StripeFS Purge Queue
//!
//! When a client unlinks a file or directory, the metadata transaction must
//! commit quickly even though the inode may be backed by millions of stripe
//! objects. This crate performs the actual deletions asynchronously: purge
//! intents are appended to a journal, made durable, and then drained under
//! throttling so foreground client I/O is not starved. The journal's expiry
//! pointer only advances past records whose deletions have completed, so a
//! crash resumes with all unfinished work intact.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  push   ┌─────────────────┐
//! │ metadata txn ├────────►│ intent codec     │
//! └──────────────┘         └────────┬────────┘
//!                                   │ append + flush
//!                          ┌────────▼────────┐
//!                          │ journal          │  expire/trim ◄──┐
//!                          └────────┬────────┘                  │
//!                                   │ consume (throttled)       │
//!                          ┌────────▼────────┐   completion ────┘
//!                          │ dispatcher       ├──► object store ops
//!                          └─────────────────┘
//! ```

pub mod item;
pub mod journal;
pub mod metrics;
pub mod queue;

pub use item::{PurgeAction, PurgeItem};
pub use journal::{Journaler, MemJournal};
pub use metrics::PurgeMetrics;
pub use queue::PurgeQueue;
