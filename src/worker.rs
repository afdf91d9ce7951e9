use crate::error::{FileStorError, ResultCode};
use crate::handler::{FileStorHandler, LockedMessage};
use crate::message::StorageReply;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error};

/// Executes one dequeued operation against persistence. The bucket lock
/// (and throttle token) are released when `locked` is dropped; returning a
/// reply sends it through the handler's sender.
pub trait OperationExecutor: Send + Sync {
    fn execute(&self, ctx: &WorkerContext, locked: LockedMessage) -> Option<StorageReply>;
}

/// Identifies the worker an operation runs on.
#[derive(Clone)]
pub struct WorkerContext {
    pub handler: Arc<FileStorHandler>,
    pub stripe_index: usize,
    pub thread_index: usize,
}

/// `threads_per_stripe` threads bound to each stripe, pulling operations
/// until shut down or the handler closes.
pub struct PersistenceWorkerPool {
    stop: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    threads: Vec<JoinHandle<()>>,
}

impl PersistenceWorkerPool {
    pub fn start(
        handler: Arc<FileStorHandler>,
        executor: Arc<dyn OperationExecutor>,
    ) -> Result<Self, FileStorError> {
        let stop = Arc::new(AtomicBool::new(false));
        let processed = Arc::new(AtomicU64::new(0));
        let per_stripe = handler.config().threads_per_stripe.max(1);
        let mut pool = Self {
            stop: Arc::clone(&stop),
            processed: Arc::clone(&processed),
            threads: Vec::with_capacity(handler.num_stripes() * per_stripe),
        };
        for stripe_index in 0..handler.num_stripes() {
            for thread_index in 0..per_stripe {
                let ctx = WorkerContext {
                    handler: Arc::clone(&handler),
                    stripe_index,
                    thread_index,
                };
                let executor = Arc::clone(&executor);
                let stop = Arc::clone(&stop);
                let processed = Arc::clone(&processed);
                let spawned = std::thread::Builder::new()
                    .name(format!("filestor-{stripe_index}-{thread_index}"))
                    .spawn(move || run_worker(ctx, executor, stop, processed));
                match spawned {
                    Ok(handle) => pool.threads.push(handle),
                    Err(source) => {
                        pool.shutdown();
                        return Err(FileStorError::WorkerSpawn { source });
                    }
                }
            }
        }
        debug!(threads = pool.threads.len(), "persistence workers started");
        Ok(pool)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Operations handed to the executor so far, panicked ones included.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Stops every worker after its current operation and joins it.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for PersistenceWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    ctx: WorkerContext,
    executor: Arc<dyn OperationExecutor>,
    stop: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
) {
    let wait = ctx.handler.config().get_next_message_wait();
    while !stop.load(Ordering::Acquire) && !ctx.handler.is_closed() {
        let Some(locked) = ctx
            .handler
            .get_next_message(ctx.stripe_index, Instant::now() + wait)
        else {
            continue;
        };
        let bucket = locked.message.bucket();
        let message_type = locked.message.message_type();
        let panic_reply = locked.message.make_failure(
            ResultCode::InternalFailure,
            "persistence worker panicked while executing operation",
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| executor.execute(&ctx, locked)));
        processed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(Some(reply)) => ctx.handler.sender().send_reply(reply),
            Ok(None) => {}
            Err(_) => {
                error!(
                    stripe = ctx.stripe_index,
                    thread = ctx.thread_index,
                    %bucket,
                    %message_type,
                    "persistence operation panicked"
                );
                ctx.handler.sender().send_reply(panic_reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OperationExecutor, PersistenceWorkerPool, WorkerContext};
    use crate::bucket::{BucketId, DocumentId};
    use crate::config::FileStorConfig;
    use crate::error::{ResultCode, ReturnCode};
    use crate::handler::{FileStorHandler, LockedMessage};
    use crate::message::{MessageKind, ReplyCollector, StorageMessage, StorageReply};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct Acknowledge;

    impl OperationExecutor for Acknowledge {
        fn execute(&self, ctx: &WorkerContext, locked: LockedMessage) -> Option<StorageReply> {
            assert_eq!(locked.lock.stripe_index(), ctx.stripe_index);
            Some(locked.message.make_reply(ReturnCode::ok()))
        }
    }

    struct Explode;

    impl OperationExecutor for Explode {
        fn execute(&self, _ctx: &WorkerContext, _locked: LockedMessage) -> Option<StorageReply> {
            panic!("disk on fire");
        }
    }

    fn put(n: u64) -> StorageMessage {
        StorageMessage::new(
            BucketId::new(16, n),
            MessageKind::Put {
                document_id: DocumentId::new(format!("id:test:doc::{n}")),
                timestamp: n,
            },
        )
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn workers_drain_every_stripe() {
        let replies = Arc::new(ReplyCollector::new());
        let config = FileStorConfig {
            num_stripes: 3,
            threads_per_stripe: 2,
            ..FileStorConfig::development()
        };
        let handler = Arc::new(FileStorHandler::new(config, replies.clone()).expect("config"));
        let mut pool =
            PersistenceWorkerPool::start(Arc::clone(&handler), Arc::new(Acknowledge)).expect("start");
        assert_eq!(pool.thread_count(), 6);

        for n in 0..50 {
            handler.schedule(put(n)).expect("open");
        }
        wait_for(|| replies.len() == 50);
        assert_eq!(replies.count_with(ResultCode::Ok), 50);
        assert_eq!(pool.processed(), 50);
        pool.shutdown();
        assert_eq!(pool.thread_count(), 0);
        assert_eq!(handler.held_lock_count(), 0);
    }

    #[test]
    fn panicking_executor_is_answered_and_releases_the_lock() {
        let replies = Arc::new(ReplyCollector::new());
        let config = FileStorConfig {
            num_stripes: 1,
            ..FileStorConfig::development()
        };
        let handler = Arc::new(FileStorHandler::new(config, replies.clone()).expect("config"));
        let _pool =
            PersistenceWorkerPool::start(Arc::clone(&handler), Arc::new(Explode)).expect("start");

        handler.schedule(put(1)).expect("open");
        handler.schedule(put(1)).expect("open");
        wait_for(|| replies.count_with(ResultCode::InternalFailure) == 2);
        assert_eq!(handler.held_lock_count(), 0);
    }

    #[test]
    fn workers_exit_when_handler_closes() {
        let replies = Arc::new(ReplyCollector::new());
        let handler =
            Arc::new(FileStorHandler::new(FileStorConfig::development(), replies).expect("config"));
        let mut pool =
            PersistenceWorkerPool::start(Arc::clone(&handler), Arc::new(Acknowledge)).expect("start");
        handler.close();
        let started = Instant::now();
        pool.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
