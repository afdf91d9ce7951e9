use filestor::{
    BucketId, DocumentId, FileStorConfig, FileStorHandler, LockMode, LockedMessage, MergeNode,
    MessageKind, OperationExecutor, PersistenceWorkerPool, ReplyCollector, ResultCode, ReturnCode,
    StorageMessage, StorageReply, WorkerContext,
};
use parking_lot::Mutex;
use smallvec::smallvec;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn stress_scale() -> usize {
    std::env::var("FILESTOR_STRESS_SCALE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(1)
}

fn scaled(base: usize) -> usize {
    base.saturating_mul(stress_scale())
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
struct Holders {
    exclusive: u32,
    shared: u32,
}

/// Records every bucket's live holders and flags any overlap that the
/// bucket lock should have prevented.
#[derive(Default)]
struct ExclusionChecker {
    holders: Mutex<HashMap<BucketId, Holders>>,
    violations: AtomicU64,
    max_shared: AtomicU32,
}

impl ExclusionChecker {
    fn enter(&self, bucket: BucketId, mode: LockMode) {
        let mut holders = self.holders.lock();
        let entry = holders.entry(bucket).or_default();
        match mode {
            LockMode::Exclusive => {
                if entry.exclusive > 0 || entry.shared > 0 {
                    self.violations.fetch_add(1, Ordering::Relaxed);
                }
                entry.exclusive += 1;
            }
            LockMode::Shared => {
                if entry.exclusive > 0 {
                    self.violations.fetch_add(1, Ordering::Relaxed);
                }
                entry.shared += 1;
                self.max_shared.fetch_max(entry.shared, Ordering::Relaxed);
            }
        }
    }

    fn leave(&self, bucket: BucketId, mode: LockMode) {
        let mut holders = self.holders.lock();
        let entry = holders.entry(bucket).or_default();
        match mode {
            LockMode::Exclusive => entry.exclusive -= 1,
            LockMode::Shared => entry.shared -= 1,
        }
    }
}

impl OperationExecutor for ExclusionChecker {
    fn execute(&self, _ctx: &WorkerContext, locked: LockedMessage) -> Option<StorageReply> {
        let (bucket, mode) = (locked.lock.bucket(), locked.lock.mode());
        self.enter(bucket, mode);
        std::thread::sleep(Duration::from_micros(200));
        self.leave(bucket, mode);
        Some(locked.message.make_reply(ReturnCode::ok()))
    }
}

#[test]
fn concurrent_workers_never_mix_lock_modes() {
    let replies = Arc::new(ReplyCollector::new());
    let config = FileStorConfig {
        num_stripes: 4,
        threads_per_stripe: 3,
        ..FileStorConfig::development()
    };
    let handler = Arc::new(FileStorHandler::new(config, replies.clone()).expect("config"));
    let checker = Arc::new(ExclusionChecker::default());
    let mut pool =
        PersistenceWorkerPool::start(Arc::clone(&handler), checker.clone()).expect("start workers");

    let total = scaled(2_000);
    let buckets: Vec<BucketId> = (0..16).map(|n| BucketId::new(16, n)).collect();
    std::thread::scope(|s| {
        for producer in 0..4usize {
            let handler = &handler;
            let buckets = &buckets;
            s.spawn(move || {
                for i in (producer..total).step_by(4) {
                    let bucket = buckets[i % buckets.len()];
                    let document_id = DocumentId::new(format!("id:stress:doc::{i}"));
                    let kind = if i % 3 == 0 {
                        MessageKind::Put {
                            document_id,
                            timestamp: i as u64,
                        }
                    } else {
                        MessageKind::Get { document_id }
                    };
                    let priority = (i % 7) as u8 * 30;
                    handler
                        .schedule(StorageMessage::new(bucket, kind).with_priority(priority))
                        .expect("handler open");
                }
            });
        }
    });

    wait_for("all replies", || replies.len() == total);
    pool.shutdown();
    assert_eq!(checker.violations.load(Ordering::Relaxed), 0);
    assert_eq!(replies.count_with(ResultCode::Ok), total);
    assert_eq!(handler.held_lock_count(), 0);
    assert_eq!(handler.queue_size(), 0);
    assert_eq!(handler.get_active_operations_stats(false).active_size(), 0);
}

/// Tracks how many merges run at once on each stripe.
struct MergeGauge {
    active: Vec<AtomicU32>,
    peak: Vec<AtomicU32>,
}

impl MergeGauge {
    fn new(stripes: usize) -> Self {
        Self {
            active: (0..stripes).map(|_| AtomicU32::new(0)).collect(),
            peak: (0..stripes).map(|_| AtomicU32::new(0)).collect(),
        }
    }
}

impl OperationExecutor for MergeGauge {
    fn execute(&self, ctx: &WorkerContext, locked: LockedMessage) -> Option<StorageReply> {
        let stripe = ctx.stripe_index;
        let now = self.active[stripe].fetch_add(1, Ordering::AcqRel) + 1;
        self.peak[stripe].fetch_max(now, Ordering::AcqRel);
        std::thread::sleep(Duration::from_millis(1));
        self.active[stripe].fetch_sub(1, Ordering::AcqRel);
        Some(locked.message.make_reply(ReturnCode::ok()))
    }
}

#[test]
fn merge_admission_cap_holds_under_load() {
    let replies = Arc::new(ReplyCollector::new());
    let config = FileStorConfig {
        num_stripes: 2,
        threads_per_stripe: 6,
        max_merges_per_stripe: 2,
        ..FileStorConfig::development()
    };
    let handler = Arc::new(FileStorHandler::new(config, replies.clone()).expect("config"));
    let gauge = Arc::new(MergeGauge::new(2));
    let mut pool =
        PersistenceWorkerPool::start(Arc::clone(&handler), gauge.clone()).expect("start workers");

    let total = scaled(200);
    for n in 0..total {
        let merge = StorageMessage::new(
            BucketId::new(20, n as u64),
            MessageKind::MergeBucket {
                nodes: smallvec![MergeNode::new(0), MergeNode::new(1)],
                max_timestamp: n as u64,
            },
        );
        handler.schedule(merge).expect("handler open");
    }

    wait_for("merge replies", || replies.len() == total);
    pool.shutdown();
    for stripe in 0..2 {
        assert!(gauge.peak[stripe].load(Ordering::Acquire) <= 2);
        assert_eq!(handler.active_merges_on_stripe(stripe), 0);
    }
    assert_eq!(replies.count_with(ResultCode::Ok), total);
}
