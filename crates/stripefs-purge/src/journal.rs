//! Journal client for the purge queue
//!
//! The queue is both the producer and the consumer over a single journal
//! instance: `write_pos` marks where the next append lands, `read_pos` what
//! has been consumed, and `expire_pos` the prefix that will never be
//! re-read and may be reclaimed. Sharing one instance means the consumer
//! never has to re-read the head to learn about its own appends.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::{debug, trace};

use stripefs_common::{Error, Result};

/// Append-log contract backing the purge queue
///
/// Implementations frame records themselves; callers hand over opaque
/// payloads and get them back verbatim.
#[async_trait]
pub trait Journaler: Send + Sync {
    /// Recover cursor state from the backing store.
    /// `Err(Error::JournalNotFound)` means the journal has never been
    /// written; other errors propagate.
    async fn recover(&self) -> Result<()>;

    /// Bootstrap an empty journal in the resilient on-disk format and
    /// persist its head.
    async fn create(&self) -> Result<()>;

    /// Buffer one record for append; O(1). Durability comes from `flush`.
    /// Returns the write position after the record.
    fn append_entry(&self, payload: Bytes) -> u64;

    /// Make all buffered appends durable. Implementations batch internally,
    /// so calling this after every append is cheap.
    async fn flush(&self) -> Result<()>;

    /// Whether `try_read_entry` would currently return a record.
    fn is_readable(&self) -> bool;

    /// Resolves once the journal becomes readable. At most one waiter may
    /// be outstanding at a time; callers guard against re-registration.
    async fn wait_for_readable(&self) -> Result<()>;

    /// Pop the next record, if one is readable.
    fn try_read_entry(&self) -> Result<Option<Bytes>>;

    /// Offset of the next byte to read, i.e. just past the most recently
    /// read record.
    fn read_pos(&self) -> u64;

    /// Offset where the next append will land.
    fn write_pos(&self) -> u64;

    /// Bytes before `off` will never be re-read.
    fn set_expire_pos(&self, off: u64);

    /// Current expiry position.
    fn expire_pos(&self) -> u64;

    /// Reclaim storage up to the expiry position.
    fn trim(&self);

    /// A freshly opened journal is read-only until `set_writeable`.
    fn is_readonly(&self) -> bool;

    fn set_writeable(&self);

    /// Drop pending waiters and refuse further I/O.
    fn shutdown(&self);
}

/// Record framing overhead of the in-memory journal: a 4-byte length prefix.
const RECORD_HEADER_SIZE: u64 = 4;

struct MemRecord {
    /// Journal offset just past this record
    end_pos: u64,
    payload: Bytes,
}

#[derive(Default)]
struct MemJournalState {
    created: bool,
    writeable: bool,
    shut_down: bool,
    /// Appended but not yet flushed
    buffered: VecDeque<MemRecord>,
    /// Flushed and not yet read
    readable: VecDeque<MemRecord>,
    write_pos: u64,
    flush_pos: u64,
    read_pos: u64,
    expire_pos: u64,
    trimmed_pos: u64,
}

/// In-memory [`Journaler`]
///
/// Implements the full contract without durability; used by the test suite
/// and by tooling that replays purge intents outside a live cluster.
#[derive(Default)]
pub struct MemJournal {
    state: Mutex<MemJournalState>,
    readable_wake: Notify,
}

impl MemJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Journal offset up to which storage has been reclaimed.
    pub fn trimmed_pos(&self) -> u64 {
        self.state.lock().trimmed_pos
    }
}

#[async_trait]
impl Journaler for MemJournal {
    async fn recover(&self) -> Result<()> {
        let st = self.state.lock();
        if st.shut_down {
            return Err(Error::ShuttingDown);
        }
        if !st.created {
            return Err(Error::JournalNotFound);
        }
        debug!(
            "recovered journal: write_pos={} read_pos={} expire_pos={}",
            st.write_pos, st.read_pos, st.expire_pos
        );
        Ok(())
    }

    async fn create(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.shut_down {
            return Err(Error::ShuttingDown);
        }
        st.created = true;
        debug!("created empty journal");
        Ok(())
    }

    fn append_entry(&self, payload: Bytes) -> u64 {
        let mut st = self.state.lock();
        debug_assert!(st.writeable, "append to read-only journal");
        let len = payload.len();
        st.write_pos += RECORD_HEADER_SIZE + len as u64;
        let end_pos = st.write_pos;
        st.buffered.push_back(MemRecord { end_pos, payload });
        trace!("appended {len} byte record, write_pos now {end_pos}");
        end_pos
    }

    async fn flush(&self) -> Result<()> {
        let flushed = {
            let mut st = self.state.lock();
            if st.shut_down {
                return Err(Error::ShuttingDown);
            }
            let n = st.buffered.len();
            while let Some(rec) = st.buffered.pop_front() {
                st.flush_pos = rec.end_pos;
                st.readable.push_back(rec);
            }
            n
        };
        if flushed > 0 {
            self.readable_wake.notify_waiters();
        }
        Ok(())
    }

    fn is_readable(&self) -> bool {
        let st = self.state.lock();
        st.read_pos < st.flush_pos
    }

    async fn wait_for_readable(&self) -> Result<()> {
        loop {
            let notified = self.readable_wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.state.lock();
                if st.shut_down {
                    return Err(Error::ShuttingDown);
                }
                if st.read_pos < st.flush_pos {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn try_read_entry(&self) -> Result<Option<Bytes>> {
        let mut st = self.state.lock();
        if st.shut_down {
            return Err(Error::ShuttingDown);
        }
        match st.readable.pop_front() {
            Some(rec) => {
                st.read_pos = rec.end_pos;
                Ok(Some(rec.payload))
            }
            None => Ok(None),
        }
    }

    fn read_pos(&self) -> u64 {
        self.state.lock().read_pos
    }

    fn write_pos(&self) -> u64 {
        self.state.lock().write_pos
    }

    fn set_expire_pos(&self, off: u64) {
        let mut st = self.state.lock();
        debug_assert!(off >= st.expire_pos, "expiry must be monotonic");
        st.expire_pos = off;
    }

    fn expire_pos(&self) -> u64 {
        self.state.lock().expire_pos
    }

    fn trim(&self) {
        let mut st = self.state.lock();
        if st.trimmed_pos < st.expire_pos {
            trace!("trimming {}..{}", st.trimmed_pos, st.expire_pos);
            st.trimmed_pos = st.expire_pos;
        }
    }

    fn is_readonly(&self) -> bool {
        !self.state.lock().writeable
    }

    fn set_writeable(&self) {
        self.state.lock().writeable = true;
    }

    fn shutdown(&self) {
        self.state.lock().shut_down = true;
        self.readable_wake.notify_waiters();
    }
}

/// Frame a payload the way the in-memory journal stores it. Only used by
/// tests that need to inspect raw record sizes.
#[must_use]
pub fn framed_len(payload: &Bytes) -> u64 {
    RECORD_HEADER_SIZE + payload.len() as u64
}
