use super::lock::{BucketLock, LockEntry, LockMode, LockTable};
use super::queue::{MessageEntry, PriorityQueue, QueueKey};
use super::{Lifecycle, LockedMessage, ScheduleAsyncResult};
use crate::bucket::BucketId;
use crate::error::ResultCode;
use crate::message::{MessageId, MessageSender, StorageReply};
use crate::stats::ActiveOperationsStats;
use crate::throttle::{ThrottleToken, ThrottlerSwitch};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct StripeState {
    pub(crate) queue: PriorityQueue,
    pub(crate) locks: LockTable,
    pub(crate) active_merges: u32,
    pub(crate) stats: ActiveOperationsStats,
}

enum Blocker {
    /// Waiting for the queue or the lock table to change.
    Queue,
    /// Every lockable entry lacked a throttle token.
    Throttle,
}

enum Scan {
    Dispatch(LockedMessage),
    Blocked(Blocker),
}

/// One independently locked shard of scheduler state. Every queue or lock
/// table transition happens under `state`.
pub(crate) struct Stripe {
    index: usize,
    pub(super) state: Mutex<StripeState>,
    queue_cond: Condvar,
    release_cond: Condvar,
    cached_queue_size: AtomicUsize,
    sender: Arc<dyn MessageSender>,
    throttlers: Arc<ThrottlerSwitch>,
    lifecycle: Arc<Lifecycle>,
    max_active_merges: u32,
    throttle_apply_bucket_diff: bool,
}

impl Stripe {
    pub(super) fn new(
        index: usize,
        sender: Arc<dyn MessageSender>,
        throttlers: Arc<ThrottlerSwitch>,
        lifecycle: Arc<Lifecycle>,
        max_active_merges: u32,
        throttle_apply_bucket_diff: bool,
    ) -> Self {
        Self {
            index,
            state: Mutex::new(StripeState::default()),
            queue_cond: Condvar::new(),
            release_cond: Condvar::new(),
            cached_queue_size: AtomicUsize::new(0),
            sender,
            throttlers,
            lifecycle,
            max_active_merges,
            throttle_apply_bucket_diff,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Returns false without queueing once the handler is closed. The flag
    /// is read under `state` so no entry can slip in after the close drain.
    pub(super) fn schedule(&self, entry: MessageEntry) -> bool {
        let mut state = self.state.lock();
        if self.lifecycle.is_closed() {
            return false;
        }
        state.queue.push(entry);
        self.set_cached_queue_size(&state);
        drop(state);
        self.queue_cond.notify_one();
        true
    }

    /// Returns the highest-priority dispatchable entry, locked. Waits at
    /// most once (bounded by `deadline`) when nothing is dispatchable.
    pub(super) fn get_next_message(self: &Arc<Self>, deadline: Instant) -> Option<LockedMessage> {
        let mut expired = Vec::new();
        let mut reserved = None;
        let mut dispatched = None;
        let mut state = self.state.lock();
        for attempt in 0..2 {
            if self.lifecycle.is_closed() {
                break;
            }
            let blocker = if self.lifecycle.is_paused() {
                Blocker::Queue
            } else {
                match self.scan(&mut state, reserved.take(), &mut expired) {
                    Scan::Dispatch(locked) => {
                        dispatched = Some(locked);
                        break;
                    }
                    Scan::Blocked(blocker) => blocker,
                }
            };
            if attempt > 0 {
                break;
            }
            match blocker {
                Blocker::Queue => {
                    self.queue_cond.wait_until(&mut state, deadline);
                }
                Blocker::Throttle => {
                    let throttler = Arc::clone(self.throttlers.active());
                    let token = MutexGuard::unlocked(&mut state, || {
                        throttler.blocking_acquire_one(deadline)
                    });
                    if token.is_valid() {
                        reserved = Some(token);
                    }
                }
            }
        }
        drop(state);
        self.reply_expired(expired);
        dispatched
    }

    fn scan(
        self: &Arc<Self>,
        state: &mut StripeState,
        mut reserved: Option<ThrottleToken>,
        expired: &mut Vec<MessageEntry>,
    ) -> Scan {
        let now = Instant::now();
        let mut timed_out: Vec<QueueKey> = Vec::new();
        let mut blocked_by_locks = false;
        let mut blocked_by_throttle = false;
        let mut chosen = None;
        for (key, entry) in state.queue.iter() {
            if entry.is_expired(now) {
                timed_out.push(*key);
                continue;
            }
            if self.is_inhibited(&state.locks, state.active_merges, entry) {
                blocked_by_locks = true;
                continue;
            }
            let message_type = entry.message.message_type();
            if message_type.is_throttle_controlled(self.throttle_apply_bucket_diff) {
                let token = reserved
                    .take()
                    .unwrap_or_else(|| self.throttlers.active().try_acquire_one_now());
                if !token.is_valid() {
                    blocked_by_throttle = true;
                    continue;
                }
                chosen = Some((*key, Some(token)));
            } else {
                chosen = Some((*key, None));
            }
            break;
        }
        for key in &timed_out {
            if let Some(entry) = state.queue.remove(key) {
                expired.push(entry);
            }
        }
        if let Some((key, token)) = chosen
            && let Some(entry) = state.queue.remove(&key)
        {
            let lock = self.acquire_for(state, &entry);
            self.set_cached_queue_size(state);
            return Scan::Dispatch(LockedMessage::new(lock, entry.into_message(), token));
        }
        self.set_cached_queue_size(state);
        if blocked_by_throttle && !blocked_by_locks {
            Scan::Blocked(Blocker::Throttle)
        } else {
            Scan::Blocked(Blocker::Queue)
        }
    }

    pub(super) fn schedule_and_get_next_async_message(
        self: &Arc<Self>,
        entry: MessageEntry,
    ) -> ScheduleAsyncResult {
        let mut expired = Vec::new();
        let mut state = self.state.lock();
        if self.lifecycle.is_closed() {
            return ScheduleAsyncResult {
                was_scheduled: false,
                async_message: None,
            };
        }
        state.queue.push(entry);
        let dispatched = if self.lifecycle.accepts_dispatch() {
            self.next_async(&mut state, &mut expired)
        } else {
            None
        };
        self.set_cached_queue_size(&state);
        drop(state);
        if dispatched.is_none() {
            self.queue_cond.notify_one();
        }
        self.reply_expired(expired);
        ScheduleAsyncResult {
            was_scheduled: true,
            async_message: dispatched,
        }
    }

    /// Non-blocking dispatch for operations that need no worker thread.
    /// Makes exactly one throttle attempt.
    pub(super) fn get_next_async_message(self: &Arc<Self>) -> Option<LockedMessage> {
        let mut expired = Vec::new();
        let mut state = self.state.lock();
        let dispatched = if self.lifecycle.accepts_dispatch() {
            self.next_async(&mut state, &mut expired)
        } else {
            None
        };
        self.set_cached_queue_size(&state);
        drop(state);
        self.reply_expired(expired);
        dispatched
    }

    fn next_async(
        self: &Arc<Self>,
        state: &mut StripeState,
        expired: &mut Vec<MessageEntry>,
    ) -> Option<LockedMessage> {
        let now = Instant::now();
        let mut timed_out: Vec<QueueKey> = Vec::new();
        let mut candidate = None;
        for (key, entry) in state.queue.iter() {
            if entry.is_expired(now) {
                timed_out.push(*key);
                continue;
            }
            if self.is_inhibited(&state.locks, state.active_merges, entry) {
                continue;
            }
            candidate = Some((*key, entry.message.message_type()));
            break;
        }
        for key in &timed_out {
            if let Some(entry) = state.queue.remove(key) {
                expired.push(entry);
            }
        }
        let (key, message_type) = candidate?;
        if !message_type.is_async_eligible() {
            return None;
        }
        let token = if message_type.is_throttle_controlled(self.throttle_apply_bucket_diff) {
            let token = self.throttlers.active().try_acquire_one_now();
            if !token.is_valid() {
                return None;
            }
            Some(token)
        } else {
            None
        };
        let entry = state.queue.remove(&key)?;
        let lock = self.acquire_for(state, &entry);
        Some(LockedMessage::new(lock, entry.into_message(), token))
    }

    fn is_inhibited(&self, locks: &LockTable, active_merges: u32, entry: &MessageEntry) -> bool {
        let message_type = entry.message.message_type();
        locks.is_locked(entry.bucket, message_type.lock_mode())
            || (message_type.counts_toward_merge_limit()
                && active_merges >= self.max_active_merges)
    }

    fn acquire_for(self: &Arc<Self>, state: &mut StripeState, entry: &MessageEntry) -> BucketLock {
        let message_type = entry.message.message_type();
        self.acquire(
            state,
            entry.bucket,
            message_type.lock_mode(),
            LockEntry {
                acquired_at: Instant::now(),
                priority: entry.priority,
                message_type: Some(message_type),
                msg_id: entry.message.id(),
            },
            message_type.counts_toward_merge_limit(),
        )
    }

    fn acquire(
        self: &Arc<Self>,
        state: &mut StripeState,
        bucket: BucketId,
        mode: LockMode,
        entry: LockEntry,
        takes_merge_slot: bool,
    ) -> BucketLock {
        let msg_id = entry.msg_id;
        state.locks.acquire(bucket, mode, entry);
        if takes_merge_slot {
            state.active_merges += 1;
        }
        state.stats.operation_started();
        BucketLock::new(Arc::clone(self), bucket, mode, msg_id, takes_merge_slot)
    }

    /// Blocks until `bucket` can be locked in `mode`, bypassing the queue.
    pub(super) fn lock(self: &Arc<Self>, bucket: BucketId, mode: LockMode) -> BucketLock {
        let mut state = self.state.lock();
        while state.locks.is_locked(bucket, mode) {
            self.release_cond.wait(&mut state);
        }
        let entry = LockEntry {
            acquired_at: Instant::now(),
            priority: 0,
            message_type: None,
            msg_id: MessageId::next(),
        };
        self.acquire(&mut state, bucket, mode, entry, false)
    }

    pub(super) fn release(&self, bucket: BucketId, mode: LockMode, msg_id: MessageId, merge_slot: bool) {
        let mut state = self.state.lock();
        let entry = state.locks.release(bucket, mode, msg_id);
        if merge_slot {
            Self::return_merge_slot(&mut state);
        }
        state.stats.operation_done(entry.acquired_at.elapsed());
        drop(state);
        self.notify_all();
    }

    pub(super) fn release_merge_slot(&self) {
        let mut state = self.state.lock();
        Self::return_merge_slot(&mut state);
        drop(state);
        self.queue_cond.notify_all();
    }

    fn return_merge_slot(state: &mut StripeState) {
        assert!(state.active_merges > 0, "active merge count underflow");
        state.active_merges -= 1;
    }

    /// Removes queued abortable entries whose bucket matches `pred` and
    /// returns the replies to send once no stripe mutex is held.
    pub(super) fn abort(&self, pred: &dyn Fn(BucketId) -> bool) -> Vec<StorageReply> {
        let mut state = self.state.lock();
        let aborted = state
            .queue
            .extract_if(|e| e.message.message_type().is_abortable() && pred(e.bucket));
        self.set_cached_queue_size(&state);
        let replies: Vec<StorageReply> = aborted
            .iter()
            .map(|e| {
                e.message.make_failure(
                    ResultCode::Aborted,
                    "operation aborted because its bucket is being removed or moved",
                )
            })
            .collect();
        drop(state);
        if !replies.is_empty() {
            self.release_cond.notify_all();
        }
        replies
    }

    /// Blocks until no held lock is on a bucket matching `pred`.
    pub(super) fn wait_inactive(&self, pred: &dyn Fn(BucketId) -> bool) {
        let mut state = self.state.lock();
        while state.locks.any_bucket(pred) {
            self.release_cond.wait(&mut state);
        }
    }

    pub(super) fn wait_until_no_locks(&self) {
        let mut state = self.state.lock();
        while state.locks.held_count() > 0 {
            self.release_cond.wait(&mut state);
        }
    }

    /// Blocks until the queue is empty and no lock is held.
    pub(super) fn flush(&self) {
        let mut state = self.state.lock();
        while !state.queue.is_empty() || state.locks.held_count() > 0 {
            self.release_cond.wait(&mut state);
        }
    }

    /// Empties the queue for shutdown, failing every entry.
    pub(super) fn drain_for_close(&self) -> Vec<StorageReply> {
        let mut state = self.state.lock();
        let drained = state.queue.drain();
        self.set_cached_queue_size(&state);
        drop(state);
        self.notify_all();
        drained
            .iter()
            .map(|e| e.message.make_failure(ResultCode::Aborted, "storage node is shutting down"))
            .collect()
    }

    fn reply_expired(&self, expired: Vec<MessageEntry>) {
        if expired.is_empty() {
            return;
        }
        let now = Instant::now();
        for entry in &expired {
            let queued_ms = entry.queued_for(now).as_millis();
            debug!(
                stripe = self.index,
                bucket = %entry.bucket,
                message_type = %entry.message.message_type(),
                queued_ms,
                "operation timed out in queue"
            );
            self.sender.send_reply(entry.message.make_failure(
                ResultCode::Timeout,
                format!(
                    "operation timed out after {queued_ms} ms in queue (timeout {} ms)",
                    entry.message.timeout().as_millis()
                ),
            ));
        }
        self.release_cond.notify_all();
    }

    pub(super) fn notify_all(&self) {
        self.queue_cond.notify_all();
        self.release_cond.notify_all();
    }

    pub(super) fn set_cached_queue_size(&self, state: &StripeState) {
        self.cached_queue_size
            .store(state.queue.len(), Ordering::Relaxed);
    }

    pub(super) fn queue_size(&self) -> usize {
        self.cached_queue_size.load(Ordering::Relaxed)
    }

    pub(super) fn held_lock_count(&self) -> usize {
        self.state.lock().locks.held_count()
    }

    pub(super) fn active_merges(&self) -> u32 {
        self.state.lock().active_merges
    }

    pub(super) fn is_locked(&self, bucket: BucketId, mode: LockMode) -> bool {
        self.state.lock().locks.is_locked(bucket, mode)
    }

    pub(super) fn lock_holders(&self, bucket: BucketId) -> (usize, usize) {
        self.state.lock().locks.holders(bucket)
    }

    pub(super) fn stats(&self, reset_min_max: bool) -> ActiveOperationsStats {
        let mut state = self.state.lock();
        let snapshot = state.stats;
        if reset_min_max {
            state.stats.reset_min_max();
        }
        snapshot
    }

    pub(super) fn write_status(&self, out: &mut String, verbose: bool) {
        let state = self.state.lock();
        let now = Instant::now();
        let _ = writeln!(
            out,
            "stripe {}: {} queued, {} locks held on {} buckets, {} active merges",
            self.index,
            state.queue.len(),
            state.locks.held_count(),
            state.locks.locked_buckets(),
            state.active_merges
        );
        if !verbose {
            return;
        }
        for (_, entry) in state.queue.iter() {
            let _ = writeln!(
                out,
                "  queued {} {} priority {} for {} ms (id {})",
                entry.message.message_type(),
                entry.bucket,
                entry.priority,
                entry.queued_for(now).as_millis(),
                entry.message.id()
            );
        }
        for (bucket, mode, lock) in state.locks.iter() {
            let holder = lock
                .message_type
                .map_or("administrative", |t| t.as_str());
            let _ = writeln!(
                out,
                "  locked {bucket} {mode} by {holder} priority {} for {} ms (id {})",
                lock.priority,
                now.saturating_duration_since(lock.acquired_at).as_millis(),
                lock.msg_id
            );
        }
    }
}
