//! The purge queue
//!
//! Single-lock, callback-driven core: one mutex serializes all state
//! transitions, journal and object store I/O run as tasks, and their
//! completions re-acquire the lock to finish. The lock is never held
//! across an await.
//!
//! The queue must live on a tokio runtime; dispatch and completion paths
//! spawn tasks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use stripefs_client::{striper, ObjectStore, RankMap};
use stripefs_common::config::{
    KEY_MAX_PURGE_FILES, KEY_MAX_PURGE_OPS, KEY_MAX_PURGE_OPS_PER_PG,
};
use stripefs_common::{
    Error, Frag, FragTree, ObjectLocator, PoolId, PurgeConfig, Result, SnapContext,
};

use crate::item::{PurgeAction, PurgeItem};
use crate::journal::Journaler;
use crate::metrics::PurgeMetrics;

/// One record being executed against the object store
struct InFlight {
    item: PurgeItem,
    /// Op cost charged at dispatch; the same value is refunded at
    /// completion even if the config changed in between
    cost: u32,
}

struct QueueState {
    config: PurgeConfig,
    /// Executing records, keyed by the journal offset just past each record.
    /// Ordered so the smallest key is always the oldest unfinished record.
    in_flight: BTreeMap<u64, InFlight>,
    /// Records that completed while an older one was still executing; the
    /// expiry pointer sweeps through them once the older record finishes
    completed_ahead: BTreeSet<u64>,
    /// Sum of the costs of everything in `in_flight`
    ops_in_flight: u32,
    /// Current dynamic op ceiling; zero until the first map-driven update
    max_purge_ops: u64,
    /// Guards against registering two journal readability waiters
    readable_waiter: bool,
    /// Set when the journal yields an undecodable record; consumption halts
    /// rather than risk skipping records
    damaged: bool,
}

/// Rate-limited, journaled execution of deferred deletions
///
/// Producers [`push`](PurgeQueue::push) purge intents; the queue makes them
/// durable, then drains them by issuing object store removals under an op
/// and item budget. The journal expiry pointer only moves past records
/// whose deletions finished, so a crash replays unfinished work.
pub struct PurgeQueue {
    rank: u32,
    /// Pool holding directory fragment objects
    metadata_pool: PoolId,
    journaler: Arc<dyn Journaler>,
    objecter: Arc<dyn ObjectStore>,
    metrics: Arc<PurgeMetrics>,
    state: Mutex<QueueState>,
}

impl PurgeQueue {
    #[must_use]
    pub fn new(
        rank: u32,
        metadata_pool: PoolId,
        config: PurgeConfig,
        journaler: Arc<dyn Journaler>,
        objecter: Arc<dyn ObjectStore>,
        metrics: Arc<PurgeMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rank,
            metadata_pool,
            journaler,
            objecter,
            metrics,
            state: Mutex::new(QueueState {
                config,
                in_flight: BTreeMap::new(),
                completed_ahead: BTreeSet::new(),
                ops_in_flight: 0,
                max_purge_ops: 0,
                readable_waiter: false,
                damaged: false,
            }),
        })
    }

    /// Sanity-check configuration before the queue starts working.
    pub fn init(&self) {
        let st = self.state.lock();
        if st.config.filer_max_purge_ops == 0 {
            warn!("filer_max_purge_ops is 0; stripe purges will not be charged to the op budget");
        }
        debug!(
            "rank {} purge queue ready (max_purge_files={})",
            self.rank, st.config.max_purge_files
        );
    }

    /// Recover the journal, bootstrapping an empty one on first run.
    pub async fn open(&self) -> Result<()> {
        debug!("rank {} opening purge queue", self.rank);
        match self.journaler.recover().await {
            Ok(()) => {
                debug!("open complete");
                self.journaler.set_writeable();
                Ok(())
            }
            Err(Error::JournalNotFound) => {
                info!("purge queue journal not found, assuming this is an upgrade and creating it");
                self.journaler.set_writeable();
                self.journaler.create().await
            }
            Err(e) => Err(e),
        }
    }

    /// Append an intent and make it durable. Returns once the journal has
    /// flushed; the deletions themselves happen later, under throttling.
    pub async fn push(self: &Arc<Self>, item: PurgeItem) -> Result<()> {
        debug!("pushing inode {} to purge queue", item.ino);

        // callers must have awaited open() before using us
        if self.journaler.is_readonly() {
            return Err(Error::JournalReadOnly);
        }

        let payload = item.encode();
        {
            let mut st = self.state.lock();
            self.journaler.append_entry(payload);
            // maybe go ahead and start on it right away
            self.consume(&mut st);
        }

        // flush calls are not 1:1 with IOs, the journal batches internally,
        // so just call every time
        self.journaler.flush().await
    }

    /// True iff nothing is executing and the journal is fully consumed.
    /// Holds only for the instant of the call.
    pub fn is_idle(&self) -> bool {
        let st = self.state.lock();
        st.in_flight.is_empty() && self.journaler.read_pos() == self.journaler.write_pos()
    }

    /// Tear down the journal. In-flight object store ops are not cancelled;
    /// their completions find the queue through shared ownership and finish
    /// against the shut-down journal as no-ops.
    pub fn shutdown(&self) {
        debug!("rank {} purge queue shutting down", self.rank);
        self.journaler.shutdown();
    }

    /// Recompute the op ceiling from cluster topology:
    /// placement groups across all data pools, divided among active ranks,
    /// times the per-PG budget.
    pub fn update_op_limit(&self, rank_map: &RankMap) {
        let mut st = self.state.lock();
        self.update_op_limit_locked(&mut st, rank_map);
    }

    fn update_op_limit_locked(&self, st: &mut QueueState, rank_map: &RankMap) {
        let osd_map = self.objecter.osd_map();

        let mut pg_count: u64 = 0;
        for &pool in &rank_map.data_pools {
            match osd_map.pg_num(pool) {
                Some(pgs) => pg_count += u64::from(pgs),
                // the object store map can lag the rank map; the pool gets
                // counted once the newer map arrives
                None => warn!(
                    "data pool {pool} not present in object store map epoch {}",
                    osd_map.epoch
                ),
            }
        }

        let ranks = f64::from(rank_map.max_active_ranks.max(1));
        let mut limit = (pg_count as f64 / ranks * st.config.max_purge_ops_per_pg) as u64;
        if st.config.max_purge_ops > 0 {
            limit = limit.min(st.config.max_purge_ops);
        }
        debug!(
            "op limit now {limit} ({pg_count} pgs across {} ranks)",
            rank_map.max_active_ranks
        );
        st.max_purge_ops = limit;
    }

    /// Apply a configuration change. Op-budget knobs trigger a limit
    /// recomputation; an item-budget change kicks a dormant queue, since
    /// the limit may have gone from zero to positive.
    pub fn handle_conf_change(
        self: &Arc<Self>,
        changed: &[&str],
        config: PurgeConfig,
        rank_map: &RankMap,
    ) {
        let mut st = self.state.lock();
        st.config = config;

        if changed.contains(&KEY_MAX_PURGE_OPS) || changed.contains(&KEY_MAX_PURGE_OPS_PER_PG) {
            self.update_op_limit_locked(&mut st, rank_map);
        } else if changed.contains(&KEY_MAX_PURGE_FILES) && st.in_flight.is_empty() {
            debug!(
                "scheduling consume wake-up (max_purge_files={})",
                st.config.max_purge_files
            );
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                let mut st = queue.state.lock();
                queue.consume(&mut st);
            });
        }
    }

    /// Whether a new record should be pulled from the journal now.
    fn can_consume(st: &QueueState) -> bool {
        trace!(
            "{}/{} ops, {}/{} files",
            st.ops_in_flight,
            st.max_purge_ops,
            st.in_flight.len(),
            st.config.max_purge_files
        );

        if st.damaged {
            return false;
        }

        if st.in_flight.is_empty() && st.config.max_purge_files > 0 {
            // always permit consumption when nothing is executing, so the
            // op limit can never be set so low as to forbid all progress;
            // deliberate pausing is done by zeroing max_purge_files
            return true;
        }

        if u64::from(st.ops_in_flight) >= st.max_purge_ops {
            trace!(
                "throttling on op limit {}/{}",
                st.ops_in_flight,
                st.max_purge_ops
            );
            return false;
        }

        if st.in_flight.len() as u64 >= st.config.max_purge_files {
            trace!(
                "throttling on file limit {}/{}",
                st.in_flight.len(),
                st.config.max_purge_files
            );
            return false;
        }

        true
    }

    /// Pull and dispatch records while the budgets allow. Exits when the
    /// journal has nothing readable (arranging exactly one wake-up) or when
    /// the budgets fill; completions re-enter.
    fn consume(self: &Arc<Self>, st: &mut QueueState) {
        while Self::can_consume(st) {
            if !self.journaler.is_readable() {
                debug!("not readable right now");
                // we are both the writer and the reader of this journal, so
                // the head never needs re-reading; wait for our own flush
                if !st.readable_waiter {
                    st.readable_waiter = true;
                    let queue = Arc::clone(self);
                    tokio::spawn(async move {
                        let readable = queue.journaler.wait_for_readable().await;
                        let mut st = queue.state.lock();
                        st.readable_waiter = false;
                        if readable.is_ok() {
                            queue.consume(&mut st);
                        }
                    });
                }
                return;
            }

            let record = match self.journaler.try_read_entry() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    // just confirmed readable; a missing record means the
                    // journal state is inconsistent and continuing could
                    // skip entries
                    error!(
                        "journal readable but no record at {:#x}, halting purge queue",
                        self.journaler.read_pos()
                    );
                    st.damaged = true;
                    return;
                }
                Err(e) => {
                    debug!("journal read failed: {e}");
                    return;
                }
            };

            let item = match PurgeItem::decode(&record) {
                Ok(item) => item,
                Err(e) => {
                    error!(
                        "corrupt purge record ending at {:#x}: {e}; halting purge queue",
                        self.journaler.read_pos()
                    );
                    st.damaged = true;
                    return;
                }
            };

            trace!("executing item for inode {}", item.ino);
            self.execute_item(st, item, self.journaler.read_pos());
        }

        debug!("cannot consume right now");
    }

    /// Op cost of one record. An accounting proxy for load, not an exact op
    /// count; dispatch and completion use the same value.
    fn calculate_ops(config: &PurgeConfig, item: &PurgeItem) -> u32 {
        match item.action {
            PurgeAction::Directory => {
                let leaves = if item.fragtree.is_leaf(Frag::ROOT) {
                    0
                } else {
                    item.fragtree.leaves().len()
                };
                // the root object plus one per leaf
                1 + leaves as u32
            }
            _ => {
                let num = if item.size > 0 {
                    striper::object_count(&item.layout, item.size)
                } else {
                    1
                };
                // stripe deletions are capped by the client's own limit
                let mut ops = num.min(u64::from(config.filer_max_purge_ops)) as u32;
                // the backtrace object
                ops += 1;
                if item.action != PurgeAction::TruncateFile {
                    ops += item.old_pools.len() as u32;
                }
                ops
            }
        }
    }

    /// Charge the budgets and issue the object store ops for one record.
    /// A single joint completion fires once every sub-operation finishes.
    fn execute_item(self: &Arc<Self>, st: &mut QueueState, item: PurgeItem, expire_to: u64) {
        let cost = Self::calculate_ops(&st.config, &item);
        st.in_flight.insert(
            expire_to,
            InFlight {
                item: item.clone(),
                cost,
            },
        );
        self.metrics.set_executing(st.in_flight.len() as u64);
        st.ops_in_flight += cost;
        self.metrics.set_executing_ops(u64::from(st.ops_in_flight));

        let now = SystemTime::now();
        let mut subs: Vec<BoxFuture<'static, Result<()>>> = Vec::new();

        match item.action {
            PurgeAction::File => {
                let num = if item.size > 0 {
                    striper::object_count(&item.layout, item.size)
                } else {
                    0
                };
                if num > 0 {
                    debug!(
                        "purging 0~{} objects 0~{num} snapc {} on {}",
                        item.size, item.snapc, item.ino
                    );
                    let objecter = Arc::clone(&self.objecter);
                    let (ino, layout, snapc) = (item.ino, item.layout.clone(), item.snapc.clone());
                    subs.push(Box::pin(async move {
                        objecter
                            .purge_range(ino, &layout, &snapc, 0, num, now, 0)
                            .await
                    }));
                }

                // the backtrace lives on stripe object zero, so a purge with
                // no pool namespace already deleted it; only skip the
                // explicit remove when configured to
                let oid = item.ino.backtrace_name();
                let covered = num > 0 && item.layout.pool_namespace.is_empty();
                if !(st.config.drop_covered_backtrace && covered) {
                    let locator = ObjectLocator::new(item.layout.pool);
                    debug!(
                        "removing backtrace object {oid} pool {} snapc {}",
                        locator.pool, item.snapc
                    );
                    let objecter = Arc::clone(&self.objecter);
                    let (oid, snapc) = (oid.clone(), item.snapc.clone());
                    subs.push(Box::pin(async move {
                        objecter.remove(&oid, &locator, &snapc, now, 0).await
                    }));
                }

                // prior pools may still hold a backtrace object
                for &pool in &item.old_pools {
                    debug!(
                        "removing backtrace object {oid} old pool {pool} snapc {}",
                        item.snapc
                    );
                    let objecter = Arc::clone(&self.objecter);
                    let (oid, snapc) = (oid.clone(), item.snapc.clone());
                    let locator = ObjectLocator::new(pool);
                    subs.push(Box::pin(async move {
                        objecter.remove(&oid, &locator, &snapc, now, 0).await
                    }));
                }
            }
            PurgeAction::Directory => {
                let mut frags = if item.fragtree.is_leaf(Frag::ROOT) {
                    Vec::new()
                } else {
                    item.fragtree.leaves()
                };
                frags.push(Frag::ROOT);
                for frag in frags {
                    let oid = item.ino.dirfrag_name(frag);
                    debug!("removing dirfrag {oid}");
                    let objecter = Arc::clone(&self.objecter);
                    let locator = ObjectLocator::new(self.metadata_pool);
                    // dirfrag objects live outside any snapshot
                    let snapc = SnapContext::NULL;
                    subs.push(Box::pin(async move {
                        objecter.remove(&oid, &locator, &snapc, now, 0).await
                    }));
                }
            }
            PurgeAction::TruncateFile => {
                let num = striper::object_count(&item.layout, item.size);
                debug!(
                    "truncating 0~{} objects 0~{num} snapc {} on {}",
                    item.size, item.snapc, item.ino
                );

                // keep the first object: it carries the backtrace
                if num > 1 {
                    let objecter = Arc::clone(&self.objecter);
                    let (ino, layout, snapc) = (item.ino, item.layout.clone(), item.snapc.clone());
                    subs.push(Box::pin(async move {
                        objecter
                            .purge_range(ino, &layout, &snapc, 1, num - 1, now, 0)
                            .await
                    }));
                }
                let objecter = Arc::clone(&self.objecter);
                let (ino, layout, snapc) = (item.ino, item.layout.clone(), item.snapc.clone());
                let length = u64::from(item.layout.object_size);
                subs.push(Box::pin(async move {
                    objecter
                        .zero(ino, &layout, &snapc, 0, length, now, 0, true)
                        .await
                }));
            }
            PurgeAction::Unknown(raw) => {
                error!(
                    "invalid action {raw} in purge queue for inode {}, dropping it",
                    item.ino
                );
                // erase the record so later completions can advance past
                // it, and refund its charge
                st.in_flight.remove(&expire_to);
                self.metrics.set_executing(st.in_flight.len() as u64);
                st.ops_in_flight -= cost;
                self.metrics.set_executing_ops(u64::from(st.ops_in_flight));
                return;
            }
        }
        debug_assert!(!subs.is_empty());

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            for result in join_all(subs).await {
                if let Err(e) = result {
                    // purge ops are idempotent; failures show up as slow
                    // drain, not as stuck records
                    warn!("purge sub-operation failed: {e}");
                }
            }
            queue.execute_item_complete(expire_to);
        });
    }

    /// Joint-completion handler: retire the record, advance expiry if it
    /// was the oldest, and try to consume more.
    fn execute_item_complete(self: &Arc<Self>, expire_to: u64) {
        debug!("complete at {:#x}", expire_to);
        let mut st = self.state.lock();

        let was_oldest = st.in_flight.keys().next() == Some(&expire_to);
        let Some(done) = st.in_flight.remove(&expire_to) else {
            error!("completion for unknown journal offset {:#x}", expire_to);
            return;
        };
        debug!("completed item for inode {}", done.item.ino);

        if was_oldest {
            // this was the lowest journal position in flight, so expiry can
            // advance here, and on through any newer records that finished
            // while waiting for this one
            let mut expire = expire_to;
            let horizon = st.in_flight.keys().next().copied();
            while let Some(&k) = st.completed_ahead.first() {
                if horizon.is_some_and(|h| k >= h) {
                    break;
                }
                st.completed_ahead.remove(&k);
                expire = k;
            }
            self.journaler.set_expire_pos(expire);
            self.journaler.trim();
        } else {
            st.completed_ahead.insert(expire_to);
        }

        st.ops_in_flight -= done.cost;
        self.metrics.set_executing_ops(u64::from(st.ops_in_flight));
        self.metrics.set_executing(st.in_flight.len() as u64);
        self.metrics.inc_executed();

        self.consume(&mut st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemJournal;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use stripefs_client::maps::OsdMapView;
    use stripefs_common::{FileLayout, InodeId, ObjectName};
    use tokio::sync::watch;

    const MIB: u64 = 1024 * 1024;
    const METADATA_POOL: i64 = 7;

    #[derive(Clone, Debug, PartialEq)]
    enum RecordedOp {
        Remove {
            oid: String,
            pool: i64,
            snap_seq: u64,
        },
        PurgeRange {
            ino: u64,
            first: u64,
            count: u64,
        },
        Zero {
            ino: u64,
            offset: u64,
            length: u64,
            truncate: bool,
        },
    }

    /// Records every op and can hold completions per inode so tests can
    /// drive out-of-order finishes.
    #[derive(Default)]
    struct MockStore {
        ops: Mutex<Vec<RecordedOp>>,
        gates: Mutex<HashMap<u64, (watch::Sender<bool>, watch::Receiver<bool>)>>,
        map: Mutex<Arc<OsdMapView>>,
        fail_removes: AtomicBool,
    }

    impl MockStore {
        fn hold(&self, ino: u64) {
            self.gates.lock().insert(ino, watch::channel(false));
        }

        fn release(&self, ino: u64) {
            if let Some((tx, _)) = self.gates.lock().get(&ino) {
                let _ = tx.send(true);
            }
        }

        async fn gate(&self, ino: u64) {
            let rx = self.gates.lock().get(&ino).map(|(_, rx)| rx.clone());
            if let Some(mut rx) = rx {
                let _ = rx.wait_for(|open| *open).await;
            }
        }

        fn recorded(&self) -> Vec<RecordedOp> {
            self.ops.lock().clone()
        }

        fn set_map(&self, map: OsdMapView) {
            *self.map.lock() = Arc::new(map);
        }

        fn set_fail_removes(&self) {
            self.fail_removes.store(true, Ordering::Relaxed);
        }
    }

    fn ino_of(oid: &ObjectName) -> u64 {
        let hex = oid.as_str().split('.').next().unwrap();
        u64::from_str_radix(hex, 16).unwrap()
    }

    #[async_trait]
    impl ObjectStore for MockStore {
        async fn remove(
            &self,
            oid: &ObjectName,
            locator: &ObjectLocator,
            snapc: &SnapContext,
            _mtime: SystemTime,
            _flags: u32,
        ) -> Result<()> {
            self.ops.lock().push(RecordedOp::Remove {
                oid: oid.to_string(),
                pool: locator.pool.as_i64(),
                snap_seq: snapc.seq,
            });
            self.gate(ino_of(oid)).await;
            if self.fail_removes.load(Ordering::Relaxed) {
                return Err(Error::ObjectStore("injected remove failure".into()));
            }
            Ok(())
        }

        async fn purge_range(
            &self,
            ino: InodeId,
            _layout: &FileLayout,
            _snapc: &SnapContext,
            first_obj: u64,
            count: u64,
            _mtime: SystemTime,
            _flags: u32,
        ) -> Result<()> {
            self.ops.lock().push(RecordedOp::PurgeRange {
                ino: ino.as_u64(),
                first: first_obj,
                count,
            });
            self.gate(ino.as_u64()).await;
            Ok(())
        }

        async fn zero(
            &self,
            ino: InodeId,
            _layout: &FileLayout,
            _snapc: &SnapContext,
            offset: u64,
            length: u64,
            _mtime: SystemTime,
            _flags: u32,
            truncate_hint: bool,
        ) -> Result<()> {
            self.ops.lock().push(RecordedOp::Zero {
                ino: ino.as_u64(),
                offset,
                length,
                truncate: truncate_hint,
            });
            self.gate(ino.as_u64()).await;
            Ok(())
        }

        fn osd_map(&self) -> Arc<OsdMapView> {
            self.map.lock().clone()
        }
    }

    struct Fixture {
        queue: Arc<PurgeQueue>,
        journal: Arc<MemJournal>,
        store: Arc<MockStore>,
        metrics: Arc<PurgeMetrics>,
    }

    async fn fixture(config: PurgeConfig) -> Fixture {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let journal = Arc::new(MemJournal::new());
        let store = Arc::new(MockStore::default());
        let metrics = Arc::new(PurgeMetrics::new());
        let queue = PurgeQueue::new(
            0,
            PoolId::new(METADATA_POOL),
            config,
            Arc::clone(&journal) as Arc<dyn Journaler>,
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Arc::clone(&metrics),
        );
        queue.init();
        queue.open().await.unwrap();
        Fixture {
            queue,
            journal,
            store,
            metrics,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for condition");
    }

    fn data_layout() -> FileLayout {
        FileLayout::default_for_pool(PoolId::new(3))
    }

    fn file_item(ino: u64, size: u64) -> PurgeItem {
        PurgeItem::purge_file(InodeId::new(ino), size, data_layout(), Vec::new(), SnapContext::NULL)
    }

    #[tokio::test]
    async fn test_push_requires_open() {
        let journal = Arc::new(MemJournal::new());
        let queue = PurgeQueue::new(
            0,
            PoolId::new(METADATA_POOL),
            PurgeConfig::default(),
            Arc::clone(&journal) as Arc<dyn Journaler>,
            Arc::new(MockStore::default()) as Arc<dyn ObjectStore>,
            Arc::new(PurgeMetrics::new()),
        );
        assert!(matches!(
            queue.push(file_item(1, 0)).await,
            Err(Error::JournalReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_open_bootstraps_missing_journal() {
        let f = fixture(PurgeConfig::default()).await;
        // open() took the create path; the journal now recovers cleanly
        f.journal.recover().await.unwrap();
        assert!(!f.journal.is_readonly());
        assert!(f.queue.is_idle());
    }

    #[tokio::test]
    async fn test_single_file_purge() {
        let f = fixture(PurgeConfig::default()).await;
        f.store.hold(0x100);

        f.queue.push(file_item(0x100, 8 * MIB)).await.unwrap();
        wait_for(|| f.store.recorded().len() == 2).await;

        // two stripe objects capped at 10, plus the backtrace
        assert_eq!(f.metrics.executing_ops(), 3);
        assert_eq!(f.metrics.executing(), 1);

        let ops = f.store.recorded();
        assert!(ops.contains(&RecordedOp::PurgeRange {
            ino: 0x100,
            first: 0,
            count: 2
        }));
        assert!(ops.contains(&RecordedOp::Remove {
            oid: "100.00000000".to_string(),
            pool: 3,
            snap_seq: 0
        }));

        f.store.release(0x100);
        wait_for(|| f.queue.is_idle()).await;
        assert_eq!(f.metrics.executed(), 1);
        assert_eq!(f.metrics.executing_ops(), 0);
        assert_eq!(f.journal.expire_pos(), f.journal.write_pos());
    }

    #[tokio::test]
    async fn test_file_purge_old_pools() {
        let f = fixture(PurgeConfig::default()).await;
        let item = PurgeItem::purge_file(
            InodeId::new(0x110),
            4 * MIB,
            data_layout(),
            vec![PoolId::new(1), PoolId::new(2)],
            SnapContext::new(5, vec![4]),
        );
        f.queue.push(item).await.unwrap();
        wait_for(|| f.queue.is_idle()).await;

        let ops = f.store.recorded();
        assert_eq!(ops.len(), 4);
        for pool in [3, 1, 2] {
            assert!(ops.contains(&RecordedOp::Remove {
                oid: "110.00000000".to_string(),
                pool,
                snap_seq: 5
            }));
        }
    }

    #[tokio::test]
    async fn test_backtrace_fast_path_flag() {
        let config = PurgeConfig {
            drop_covered_backtrace: true,
            ..PurgeConfig::default()
        };
        let f = fixture(config).await;

        // stripe purge with no namespace already covers object zero
        f.queue.push(file_item(0x120, 8 * MIB)).await.unwrap();
        wait_for(|| f.queue.is_idle()).await;
        assert_eq!(
            f.store.recorded(),
            vec![RecordedOp::PurgeRange {
                ino: 0x120,
                first: 0,
                count: 2
            }]
        );

        // an empty file issues no purge, so the backtrace must go explicitly
        f.queue.push(file_item(0x121, 0)).await.unwrap();
        wait_for(|| f.queue.is_idle()).await;
        assert!(f.store.recorded().contains(&RecordedOp::Remove {
            oid: "121.00000000".to_string(),
            pool: 3,
            snap_seq: 0
        }));
    }

    #[tokio::test]
    async fn test_truncate_preserves_backtrace() {
        let f = fixture(PurgeConfig::default()).await;
        f.store.hold(0x200);

        let item = PurgeItem::truncate(
            InodeId::new(0x200),
            12 * MIB,
            data_layout(),
            SnapContext::NULL,
        );
        f.queue.push(item).await.unwrap();
        wait_for(|| f.store.recorded().len() == 2).await;

        // three stripe objects: purge 1..3, zero the first
        assert_eq!(f.metrics.executing_ops(), 4);
        let ops = f.store.recorded();
        assert!(ops.contains(&RecordedOp::PurgeRange {
            ino: 0x200,
            first: 1,
            count: 2
        }));
        assert!(ops.contains(&RecordedOp::Zero {
            ino: 0x200,
            offset: 0,
            length: 4 * MIB,
            truncate: true
        }));

        f.store.release(0x200);
        wait_for(|| f.queue.is_idle()).await;
        assert_eq!(f.journal.expire_pos(), f.journal.write_pos());
    }

    #[tokio::test]
    async fn test_purge_dir_fragments() {
        let f = fixture(PurgeConfig::default()).await;
        f.store.hold(0x300);

        let mut tree = FragTree::new();
        tree.split(Frag::ROOT, 1);
        f.queue
            .push(PurgeItem::purge_dir(InodeId::new(0x300), tree))
            .await
            .unwrap();
        wait_for(|| f.store.recorded().len() == 3).await;

        // root plus two leaves
        assert_eq!(f.metrics.executing_ops(), 3);
        let ops = f.store.recorded();
        for oid in ["300.01000000", "300.01800000", "300.00000000"] {
            assert!(
                ops.contains(&RecordedOp::Remove {
                    oid: oid.to_string(),
                    pool: METADATA_POOL,
                    snap_seq: 0
                }),
                "missing dirfrag remove for {oid}"
            );
        }

        f.store.release(0x300);
        wait_for(|| f.queue.is_idle()).await;
    }

    #[tokio::test]
    async fn test_purge_dir_unsplit_root() {
        let f = fixture(PurgeConfig::default()).await;
        f.queue
            .push(PurgeItem::purge_dir(InodeId::new(0x310), FragTree::new()))
            .await
            .unwrap();
        wait_for(|| f.queue.is_idle()).await;

        assert_eq!(
            f.store.recorded(),
            vec![RecordedOp::Remove {
                oid: "310.00000000".to_string(),
                pool: METADATA_POOL,
                snap_seq: 0
            }]
        );
    }

    #[tokio::test]
    async fn test_out_of_order_completion() {
        let f = fixture(PurgeConfig::default()).await;
        let mut map = OsdMapView::new(1);
        map.upsert_pool(PoolId::new(3), 24);
        f.store.set_map(map);
        f.queue
            .update_op_limit(&RankMap::new(1, 1, vec![PoolId::new(3)]));

        for ino in [0xa, 0xb, 0xc] {
            f.store.hold(ino);
        }
        for ino in [0xa, 0xb, 0xc] {
            f.queue.push(file_item(ino, 4 * MIB)).await.unwrap();
        }
        wait_for(|| f.metrics.executing() == 3).await;
        assert_eq!(f.journal.expire_pos(), 0);

        // completing newer records must not advance expiry past the oldest
        f.store.release(0xb);
        wait_for(|| f.metrics.executed() == 1).await;
        assert_eq!(f.journal.expire_pos(), 0);
        assert_eq!(f.metrics.executing(), 2);

        f.store.release(0xc);
        wait_for(|| f.metrics.executed() == 2).await;
        assert_eq!(f.journal.expire_pos(), 0);

        // the oldest completes last: expiry sweeps past all three
        f.store.release(0xa);
        wait_for(|| f.metrics.executed() == 3).await;
        wait_for(|| f.journal.expire_pos() == f.journal.write_pos()).await;
        assert!(f.queue.is_idle());
        assert_eq!(f.journal.trimmed_pos(), f.journal.write_pos());
        assert_eq!(f.metrics.executing_ops(), 0);
    }

    #[tokio::test]
    async fn test_admin_pause_and_resume() {
        let config = PurgeConfig {
            max_purge_files: 0,
            ..PurgeConfig::default()
        };
        let f = fixture(config).await;

        // pushes still append and flush, but nothing dispatches
        f.queue.push(file_item(0x50, 4 * MIB)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.store.recorded().is_empty());
        assert_eq!(f.metrics.executing(), 0);
        assert!(!f.queue.is_idle());

        // raising the limit kicks the dormant queue
        f.queue.handle_conf_change(
            &[KEY_MAX_PURGE_FILES],
            PurgeConfig::default(),
            &RankMap::default(),
        );
        wait_for(|| f.queue.is_idle()).await;
        assert_eq!(f.store.recorded().len(), 2);
        assert_eq!(f.metrics.executed(), 1);
    }

    #[tokio::test]
    async fn test_oversized_item_dispatches_alone() {
        let f = fixture(PurgeConfig::default()).await;
        let mut map = OsdMapView::new(1);
        map.upsert_pool(PoolId::new(3), 4);
        f.store.set_map(map);
        // 4 PGs, 1 rank, 0.5 per PG: op limit 2
        f.queue
            .update_op_limit(&RankMap::new(1, 1, vec![PoolId::new(3)]));

        // cost 11 exceeds the limit, but an empty queue always makes progress
        f.store.hold(0x999);
        f.queue.push(file_item(0x999, 40 * MIB)).await.unwrap();
        wait_for(|| f.metrics.executing() == 1).await;
        assert_eq!(f.metrics.executing_ops(), 11);

        // while it runs, further pushes stay queued
        f.queue.push(file_item(0x5, 4 * MIB)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.metrics.executing(), 1);
        assert!(!f
            .store
            .recorded()
            .contains(&RecordedOp::PurgeRange { ino: 0x5, first: 0, count: 1 }));

        f.store.release(0x999);
        wait_for(|| f.metrics.executed() == 2).await;
        wait_for(|| f.queue.is_idle()).await;
    }

    #[tokio::test]
    async fn test_serial_drain_without_op_limit() {
        // no map update has happened, so max_purge_ops is still zero and
        // only the empty-queue rule admits work
        let f = fixture(PurgeConfig::default()).await;
        f.store.hold(0xa1);
        f.store.hold(0xa2);

        f.queue.push(file_item(0xa1, 4 * MIB)).await.unwrap();
        f.queue.push(file_item(0xa2, 4 * MIB)).await.unwrap();
        wait_for(|| f.metrics.executing() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.metrics.executing(), 1);

        f.store.release(0xa1);
        wait_for(|| f.metrics.executed() == 1 && f.metrics.executing() == 1).await;

        f.store.release(0xa2);
        wait_for(|| f.queue.is_idle()).await;
        assert_eq!(f.metrics.executed(), 2);
    }

    #[tokio::test]
    async fn test_unknown_action_dropped() {
        let f = fixture(PurgeConfig::default()).await;

        let mut unknown = file_item(0x400, 4 * MIB);
        unknown.action = PurgeAction::Unknown(9);
        f.queue.push(unknown).await.unwrap();
        f.queue.push(file_item(0x401, 4 * MIB)).await.unwrap();

        wait_for(|| f.metrics.executed() == 1).await;
        wait_for(|| f.journal.expire_pos() == f.journal.write_pos()).await;

        // no ops for the dropped record, and its charge was refunded
        assert!(f
            .store
            .recorded()
            .iter()
            .all(|op| !matches!(op, RecordedOp::PurgeRange { ino: 0x400, .. })
                && !matches!(op, RecordedOp::Remove { oid, .. } if oid.starts_with("400."))));
        assert_eq!(f.metrics.executing_ops(), 0);
        assert!(f.queue.is_idle());
    }

    #[tokio::test]
    async fn test_corrupt_record_halts_queue() {
        let f = fixture(PurgeConfig::default()).await;

        // a record demanding a far-future decoder
        f.journal
            .append_entry(Bytes::from_static(&[0xff, 0xff, 0, 0, 0, 0]));
        f.journal.flush().await.unwrap();

        f.queue.push(file_item(0x500, 4 * MIB)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the queue halts rather than skip past the bad record
        assert!(f.store.recorded().is_empty());
        assert_eq!(f.metrics.executed(), 0);
        assert!(!f.queue.is_idle());
    }

    #[tokio::test]
    async fn test_op_failure_does_not_block_expiry() {
        let f = fixture(PurgeConfig::default()).await;
        f.store.set_fail_removes();

        f.queue.push(file_item(0x600, 0)).await.unwrap();
        wait_for(|| f.metrics.executed() == 1).await;

        // removes are idempotent, so a failure still retires the record
        assert_eq!(f.journal.expire_pos(), f.journal.write_pos());
        assert_eq!(f.metrics.executing_ops(), 0);
        assert!(f.queue.is_idle());
    }

    #[tokio::test]
    async fn test_update_op_limit_formula() {
        let f = fixture(PurgeConfig::default()).await;
        let mut map = OsdMapView::new(5);
        map.upsert_pool(PoolId::new(1), 64);
        f.store.set_map(map);

        // pool 2 is missing from the object store map and must be skipped
        let rank_map = RankMap::new(1, 2, vec![PoolId::new(1), PoolId::new(2)]);
        f.queue.update_op_limit(&rank_map);
        assert_eq!(f.queue.state.lock().max_purge_ops, 16);

        // a rank map with no active ranks must not zero the divisor
        f.queue
            .update_op_limit(&RankMap::new(2, 0, vec![PoolId::new(1)]));
        assert_eq!(f.queue.state.lock().max_purge_ops, 32);
    }

    #[tokio::test]
    async fn test_update_op_limit_hard_ceiling() {
        let config = PurgeConfig {
            max_purge_ops: 10,
            ..PurgeConfig::default()
        };
        let f = fixture(config).await;
        let mut map = OsdMapView::new(1);
        map.upsert_pool(PoolId::new(1), 64);
        f.store.set_map(map);

        let rank_map = RankMap::new(1, 2, vec![PoolId::new(1)]);
        f.queue.update_op_limit(&rank_map);
        assert_eq!(f.queue.state.lock().max_purge_ops, 10);

        // a zero ceiling disables the clamp
        f.queue.handle_conf_change(
            &[KEY_MAX_PURGE_OPS],
            PurgeConfig {
                max_purge_ops: 0,
                ..PurgeConfig::default()
            },
            &rank_map,
        );
        assert_eq!(f.queue.state.lock().max_purge_ops, 16);
    }

    #[tokio::test]
    async fn test_conf_change_recomputes_limit() {
        let f = fixture(PurgeConfig::default()).await;
        let mut map = OsdMapView::new(1);
        map.upsert_pool(PoolId::new(1), 10);
        f.store.set_map(map);
        let rank_map = RankMap::new(1, 1, vec![PoolId::new(1)]);

        f.queue.handle_conf_change(
            &[KEY_MAX_PURGE_OPS_PER_PG],
            PurgeConfig {
                max_purge_ops_per_pg: 2.0,
                ..PurgeConfig::default()
            },
            &rank_map,
        );
        assert_eq!(f.queue.state.lock().max_purge_ops, 20);
    }

    #[tokio::test]
    async fn test_is_idle() {
        let f = fixture(PurgeConfig::default()).await;
        assert!(f.queue.is_idle());

        f.store.hold(0x700);
        f.queue.push(file_item(0x700, 4 * MIB)).await.unwrap();
        assert!(!f.queue.is_idle());

        f.store.release(0x700);
        wait_for(|| f.queue.is_idle()).await;
    }
}
