//! Per-node operation scheduler: striped priority queues, bucket locks,
//! the merge registry, and split/join remapping.

mod coordinator;
pub mod lock;
mod merges;
pub mod queue;
mod remap;
mod stripe;

use crate::bucket::{BucketId, DocumentId};
use crate::config::FileStorConfig;
use crate::error::{FileStorError, ResultCode, ReturnCode};
use crate::merge_status::{MergeNodes, MergeStatus};
use crate::message::{MessageSender, StorageMessage, StorageReply};
use crate::stats::ActiveOperationsStats;
use crate::throttle::{DynamicThrottleParams, SharedThrottler, ThrottleToken, ThrottlerSwitch};
use coordinator::StripeGuardSet;
use lock::{BucketLock, LockMode};
use merges::MergeRegistry;
use queue::MessageEntry;
use remap::{RemapDecision, RemapTarget, decide};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use stripe::Stripe;
use tracing::{debug, info};

pub use merges::SharedMergeStatus;

/// Open/paused/closed flags shared by the handler and its stripes.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    closed: AtomicBool,
    pause_depth: AtomicUsize,
}

impl Lifecycle {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.pause_depth.load(Ordering::Acquire) > 0
    }

    pub(crate) fn accepts_dispatch(&self) -> bool {
        !self.is_closed() && !self.is_paused()
    }

    /// Returns false if already closed.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn pause(&self) {
        self.pause_depth.fetch_add(1, Ordering::AcqRel);
    }

    fn resume(&self) {
        let _ = self
            .pause_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
    }
}

/// A dequeued operation together with the lock (and throttle token, for
/// throttled classes) it was dispatched under. Dropping it releases both.
#[derive(Debug)]
pub struct LockedMessage {
    pub lock: BucketLock,
    pub message: StorageMessage,
    pub throttle_token: Option<ThrottleToken>,
}

impl LockedMessage {
    pub(crate) fn new(
        lock: BucketLock,
        message: StorageMessage,
        throttle_token: Option<ThrottleToken>,
    ) -> Self {
        Self {
            lock,
            message,
            throttle_token,
        }
    }
}

#[derive(Debug)]
pub struct ScheduleAsyncResult {
    pub was_scheduled: bool,
    pub async_message: Option<LockedMessage>,
}

/// What happened to the entries queued for a split or joined bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapOutcome {
    pub retargeted: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Returned by [`FileStorHandler::pause`]; dispatch resumes when it drops.
#[must_use = "dropping the guard resumes dispatch immediately"]
pub struct ResumeGuard<'a> {
    handler: &'a FileStorHandler,
}

impl ResumeGuard<'_> {
    pub fn resume(self) {}
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        self.handler.resume();
    }
}

pub struct FileStorHandler {
    config: FileStorConfig,
    stripes: Vec<Arc<Stripe>>,
    sender: Arc<dyn MessageSender>,
    throttlers: Arc<ThrottlerSwitch>,
    lifecycle: Arc<Lifecycle>,
    merges: MergeRegistry,
}

impl FileStorHandler {
    pub fn new(
        config: FileStorConfig,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Self, FileStorError> {
        config.validate()?;
        let throttlers = Arc::new(ThrottlerSwitch::new(
            config.dynamic_throttling,
            config.use_dynamic_operation_throttling,
        ));
        let lifecycle = Arc::new(Lifecycle::default());
        let stripes = (0..config.num_stripes)
            .map(|index| {
                Arc::new(Stripe::new(
                    index,
                    Arc::clone(&sender),
                    Arc::clone(&throttlers),
                    Arc::clone(&lifecycle),
                    config.max_merges_per_stripe,
                    config.throttle_apply_bucket_diff_ops,
                ))
            })
            .collect();
        Ok(Self {
            config,
            stripes,
            sender,
            throttlers,
            lifecycle,
            merges: MergeRegistry::default(),
        })
    }

    pub fn config(&self) -> &FileStorConfig {
        &self.config
    }

    pub fn sender(&self) -> &Arc<dyn MessageSender> {
        &self.sender
    }

    pub fn num_stripes(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    pub fn is_paused(&self) -> bool {
        self.lifecycle.is_paused()
    }

    /// Stripe owning `bucket`. Uses a mixed hash so sequential bucket ids
    /// do not pile onto one stripe.
    pub fn stripe_index(&self, bucket: BucketId) -> usize {
        (bucket.stripe_hash() % self.stripes.len() as u64) as usize
    }

    fn stripe_for(&self, bucket: BucketId) -> &Arc<Stripe> {
        &self.stripes[self.stripe_index(bucket)]
    }

    fn stripe(&self, stripe_index: usize) -> &Arc<Stripe> {
        assert!(
            stripe_index < self.stripes.len(),
            "stripe index {stripe_index} out of range ({} stripes)",
            self.stripes.len()
        );
        &self.stripes[stripe_index]
    }

    /// Queues `message` on its bucket's stripe. Fails only once closed.
    pub fn schedule(&self, message: StorageMessage) -> Result<(), FileStorError> {
        let bucket = message.bucket();
        if self
            .stripe_for(bucket)
            .schedule(MessageEntry::new(message, Instant::now()))
        {
            Ok(())
        } else {
            debug!(%bucket, "rejecting operation, handler closed");
            Err(FileStorError::Closed)
        }
    }

    /// Queues `message`, then tries to hand back the stripe's next
    /// operation if it can run without a worker thread.
    pub fn schedule_and_get_next_async_message(
        &self,
        message: StorageMessage,
    ) -> ScheduleAsyncResult {
        let bucket = message.bucket();
        let result = self
            .stripe_for(bucket)
            .schedule_and_get_next_async_message(MessageEntry::new(message, Instant::now()));
        if !result.was_scheduled {
            debug!(%bucket, "rejecting operation, handler closed");
        }
        result
    }

    pub fn get_next_message(&self, stripe_index: usize, deadline: Instant) -> Option<LockedMessage> {
        self.stripe(stripe_index).get_next_message(deadline)
    }

    pub fn get_next_async_message(&self, stripe_index: usize) -> Option<LockedMessage> {
        self.stripe(stripe_index).get_next_async_message()
    }

    /// Blocks until `bucket` can be locked in `mode`, bypassing the queue.
    pub fn lock(&self, bucket: BucketId, mode: LockMode) -> BucketLock {
        self.stripe_for(bucket).lock(bucket, mode)
    }

    /// Stops dispatch and waits until no bucket lock is held on any stripe.
    /// Pauses nest; dispatch resumes when the last guard drops.
    pub fn pause(&self) -> ResumeGuard<'_> {
        self.lifecycle.pause();
        info!("pausing persistence dispatch");
        for stripe in &self.stripes {
            stripe.wait_until_no_locks();
        }
        ResumeGuard { handler: self }
    }

    fn resume(&self) {
        self.lifecycle.resume();
        if !self.lifecycle.is_paused() {
            info!("resuming persistence dispatch");
        }
        for stripe in &self.stripes {
            stripe.notify_all();
        }
    }

    /// Rejects further scheduling, fails everything still queued and every
    /// registered merge with ABORTED, and wakes all waiters.
    pub fn close(&self) {
        if !self.lifecycle.close() {
            return;
        }
        self.throttlers.shutdown();
        let mut failed = 0usize;
        for stripe in &self.stripes {
            for reply in stripe.drain_for_close() {
                self.sender.send_reply_direct(reply);
                failed += 1;
            }
        }
        self.clear_merge_statuses(&ReturnCode::new(
            ResultCode::Aborted,
            "storage node is shutting down",
        ));
        info!(failed_queued = failed, "persistence handler closed");
    }

    /// Waits until every queue is empty and no lock is held. Never returns
    /// while dispatch is paused and operations are queued.
    pub fn flush(&self, drain_merges: bool) {
        info!(drain_merges, "flushing persistence queues");
        for stripe in &self.stripes {
            stripe.flush();
        }
        if drain_merges {
            self.clear_merge_statuses(&ReturnCode::new(
                ResultCode::Aborted,
                "merge aborted by flush",
            ));
        }
    }

    /// Fails every queued abortable operation whose bucket matches `pred`,
    /// then waits for running operations on matching buckets to finish.
    pub fn abort_queued_operations(&self, pred: &dyn Fn(BucketId) -> bool) {
        let mut aborted = 0usize;
        for stripe in &self.stripes {
            for reply in stripe.abort(pred) {
                self.sender.send_reply_direct(reply);
                aborted += 1;
            }
        }
        debug!(aborted, "aborted queued operations");
        for stripe in &self.stripes {
            stripe.wait_inactive(pred);
        }
    }

    /// Re-homes operations queued for `source` after it was split into
    /// `target1` and `target2`. `route` maps a document to its bucket.
    pub fn remap_queue_after_split(
        &self,
        source: BucketId,
        target1: BucketId,
        target2: BucketId,
        route: &dyn Fn(&DocumentId) -> BucketId,
    ) -> RemapOutcome {
        self.remap(
            source,
            RemapTarget::Split {
                target1,
                target2,
                route,
            },
        )
    }

    pub fn remap_queue_after_join(&self, source: BucketId, target: BucketId) -> RemapOutcome {
        self.remap(source, RemapTarget::Join { target })
    }

    fn remap(&self, source: BucketId, target: RemapTarget<'_>) -> RemapOutcome {
        let source_stripe = self.stripe_index(source);
        let mut indices = vec![source_stripe];
        indices.extend(target.buckets().into_iter().map(|b| self.stripe_index(b)));

        let mut outcome = RemapOutcome::default();
        let mut replies: Vec<StorageReply> = Vec::new();
        {
            let mut guards = StripeGuardSet::acquire(&self.stripes, &indices);
            let entries = guards.state_mut(source_stripe).queue.take_bucket(source);
            for mut entry in entries {
                match decide(entry.message(), &target) {
                    RemapDecision::Retarget(bucket) => {
                        debug!(
                            %source,
                            target = %bucket,
                            message_type = %entry.message().message_type(),
                            "retargeting queued operation"
                        );
                        entry.retarget(bucket);
                        let index = self.stripe_index(bucket);
                        guards.state_mut(index).queue.push(entry);
                        outcome.retargeted += 1;
                    }
                    RemapDecision::Fail(result) => {
                        debug!(
                            %source,
                            message_type = %entry.message().message_type(),
                            result = %result,
                            "failing queued operation on remap"
                        );
                        replies.push(entry.message().make_reply(result));
                        outcome.failed += 1;
                    }
                    RemapDecision::Drop => {
                        outcome.dropped += 1;
                    }
                }
            }
        }
        for reply in replies {
            self.sender.send_reply(reply);
        }
        self.clear_merge_status(
            source,
            Some(&ReturnCode::new(
                ResultCode::BucketDeleted,
                format!("bucket was {} during merge", target.verb()),
            )),
        );
        outcome
    }

    /// Fresh merge bookkeeping that times out after `merge_timeout_ms`.
    pub fn new_merge_status(&self, nodes: MergeNodes, max_timestamp: u64) -> MergeStatus {
        MergeStatus::new(nodes, max_timestamp, self.config.merge_timeout())
    }

    /// Registers a merge for `bucket`.
    pub fn add_merge_status(
        &self,
        bucket: BucketId,
        status: MergeStatus,
    ) -> Result<SharedMergeStatus, FileStorError> {
        if self.lifecycle.is_closed() {
            return Err(FileStorError::Closed);
        }
        self.merges.add(bucket, status)
    }

    pub fn edit_merge_status(&self, bucket: BucketId) -> Result<SharedMergeStatus, FileStorError> {
        self.merges
            .get(bucket)
            .ok_or(FileStorError::MergeNotFound { bucket })
    }

    pub fn is_merging(&self, bucket: BucketId) -> bool {
        self.merges.contains(bucket)
    }

    pub fn num_active_merges(&self) -> usize {
        self.merges.len()
    }

    /// Drops the merge for `bucket`. With `result`, parked replies are
    /// answered with it. Returns whether a merge was registered.
    pub fn clear_merge_status(&self, bucket: BucketId, result: Option<&ReturnCode>) -> bool {
        match self.merges.remove(bucket, result) {
            Some(replies) => {
                for reply in replies {
                    self.sender.send_reply(reply);
                }
                true
            }
            None => false,
        }
    }

    pub fn clear_merge_statuses(&self, result: &ReturnCode) {
        for reply in self.merges.remove_all(result) {
            self.sender.send_reply(reply);
        }
    }

    /// Fails every merge running past its timeout with TIMEOUT.
    pub fn clear_timed_out_merges(&self) -> usize {
        let expired = self.merges.timed_out(Instant::now());
        let mut cleared = 0;
        for bucket in expired {
            let result = ReturnCode::new(ResultCode::Timeout, format!("merge of {bucket} timed out"));
            if self.clear_merge_status(bucket, Some(&result)) {
                cleared += 1;
            }
        }
        cleared
    }

    pub fn operation_throttler(&self) -> &Arc<dyn SharedThrottler> {
        self.throttlers.active()
    }

    pub fn use_dynamic_operation_throttling(&self, enabled: bool) {
        self.throttlers.set_use_dynamic(enabled);
    }

    pub fn reconfigure_dynamic_throttler(
        &self,
        params: &DynamicThrottleParams,
    ) -> Result<(), FileStorError> {
        params.validate()?;
        self.throttlers.reconfigure(params);
        Ok(())
    }

    /// Active-operation stats merged across stripes.
    pub fn get_active_operations_stats(&self, reset_min_max: bool) -> ActiveOperationsStats {
        let mut total = ActiveOperationsStats::default();
        for stripe in &self.stripes {
            total.merge(&stripe.stats(reset_min_max));
        }
        total
    }

    pub fn queue_size(&self) -> usize {
        self.stripes.iter().map(|s| s.queue_size()).sum()
    }

    pub fn stripe_queue_size(&self, stripe_index: usize) -> usize {
        self.stripe(stripe_index).queue_size()
    }

    pub fn held_lock_count(&self) -> usize {
        self.stripes.iter().map(|s| s.held_lock_count()).sum()
    }

    pub fn active_merges_on_stripe(&self, stripe_index: usize) -> u32 {
        self.stripe(stripe_index).active_merges()
    }

    /// Whether a new `mode` lock on `bucket` would have to wait.
    pub fn is_locked(&self, bucket: BucketId, mode: LockMode) -> bool {
        self.stripe_for(bucket).is_locked(bucket, mode)
    }

    /// (exclusive, shared) holder counts for `bucket`.
    pub fn lock_holders(&self, bucket: BucketId) -> (usize, usize) {
        self.stripe_for(bucket).lock_holders(bucket)
    }

    /// Human-readable dump of queues, locks, merges and throttling.
    pub fn status_report(&self, verbose: bool) -> String {
        let mut out = String::new();
        let throttler = self.throttlers.active();
        let _ = writeln!(
            out,
            "persistence handler: {} stripes, closed={}, paused={}",
            self.stripes.len(),
            self.lifecycle.is_closed(),
            self.lifecycle.is_paused()
        );
        let _ = writeln!(
            out,
            "throttler: {} window={} active={} waiting={}",
            if self.throttlers.uses_dynamic() {
                "dynamic"
            } else {
                "unlimited"
            },
            throttler.current_window_size(),
            throttler.current_active_token_count(),
            throttler.waiting_threads()
        );
        for stripe in &self.stripes {
            stripe.write_status(&mut out, verbose);
        }
        self.merges.write_status(&mut out, verbose);
        out
    }
}

impl Drop for FileStorHandler {
    fn drop(&mut self) {
        self.close();
    }
}
