use super::stripe::Stripe;
use crate::bucket::BucketId;
use crate::message::{MessageId, MessageType};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Exclusive => f.write_str("exclusive"),
            LockMode::Shared => f.write_str("shared"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LockEntry {
    pub(crate) acquired_at: Instant,
    pub(crate) priority: u8,
    /// `None` for administrative locks taken outside the queue.
    pub(crate) message_type: Option<MessageType>,
    pub(crate) msg_id: MessageId,
}

/// Lock state of one bucket: one exclusive holder, or any number of
/// shared holders, never both.
#[derive(Debug, Default)]
pub(crate) struct MultiLockEntry {
    exclusive: Option<LockEntry>,
    shared: HashMap<MessageId, LockEntry>,
}

impl MultiLockEntry {
    fn is_empty(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }

    fn held(&self) -> usize {
        usize::from(self.exclusive.is_some()) + self.shared.len()
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    buckets: HashMap<BucketId, MultiLockEntry>,
}

impl LockTable {
    /// Whether a new `mode` lock on `bucket` would conflict with a held one.
    pub(crate) fn is_locked(&self, bucket: BucketId, mode: LockMode) -> bool {
        match self.buckets.get(&bucket) {
            None => false,
            Some(entry) => match mode {
                LockMode::Exclusive => true,
                LockMode::Shared => entry.exclusive.is_some(),
            },
        }
    }

    pub(crate) fn acquire(&mut self, bucket: BucketId, mode: LockMode, entry: LockEntry) {
        let slot = self.buckets.entry(bucket).or_default();
        match mode {
            LockMode::Exclusive => {
                assert!(
                    slot.is_empty(),
                    "exclusive lock on {bucket} requested while {} lock(s) held",
                    slot.held()
                );
                slot.exclusive = Some(entry);
            }
            LockMode::Shared => {
                assert!(
                    slot.exclusive.is_none(),
                    "shared lock on {bucket} requested while exclusively locked"
                );
                let msg_id = entry.msg_id;
                let previous = slot.shared.insert(msg_id, entry);
                assert!(
                    previous.is_none(),
                    "message {msg_id} already holds a shared lock on {bucket}"
                );
            }
        }
    }

    pub(crate) fn release(&mut self, bucket: BucketId, mode: LockMode, msg_id: MessageId) -> LockEntry {
        let Some(slot) = self.buckets.get_mut(&bucket) else {
            panic!("releasing {mode} lock on {bucket} which holds no locks");
        };
        let released = match mode {
            LockMode::Exclusive => match slot.exclusive.take() {
                Some(entry) if entry.msg_id == msg_id => entry,
                Some(entry) => panic!(
                    "message {msg_id} releasing exclusive lock on {bucket} held by {}",
                    entry.msg_id
                ),
                None => panic!("releasing exclusive lock on {bucket} which is not held"),
            },
            LockMode::Shared => match slot.shared.remove(&msg_id) {
                Some(entry) => entry,
                None => panic!("message {msg_id} holds no shared lock on {bucket}"),
            },
        };
        if slot.is_empty() {
            self.buckets.remove(&bucket);
        }
        released
    }

    pub(crate) fn held_count(&self) -> usize {
        self.buckets.values().map(MultiLockEntry::held).sum()
    }

    pub(crate) fn locked_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn any_bucket(&self, mut pred: impl FnMut(BucketId) -> bool) -> bool {
        self.buckets.keys().any(|b| pred(*b))
    }

    pub(crate) fn holders(&self, bucket: BucketId) -> (usize, usize) {
        self.buckets.get(&bucket).map_or((0, 0), |e| {
            (usize::from(e.exclusive.is_some()), e.shared.len())
        })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (BucketId, LockMode, &LockEntry)> {
        self.buckets.iter().flat_map(|(bucket, entry)| {
            entry
                .exclusive
                .iter()
                .map(move |e| (*bucket, LockMode::Exclusive, e))
                .chain(entry.shared.values().map(move |e| (*bucket, LockMode::Shared, e)))
        })
    }
}

const NO_MERGE_SLOT: u8 = 0;
const MERGE_SLOT_HELD: u8 = 1;
const MERGE_SLOT_RELEASED: u8 = 2;

/// Scoped capability for one bucket lock. Dropping it releases the lock.
///
/// A lock taken by a merge-classified operation also holds one of the
/// stripe's merge admission slots. The slot moves through
/// held -> released exactly once, either via
/// [`BucketLock::signal_operation_sync_phase_done`] or on drop.
pub struct BucketLock {
    stripe: Arc<Stripe>,
    bucket: BucketId,
    mode: LockMode,
    msg_id: MessageId,
    merge_slot: AtomicU8,
}

impl BucketLock {
    pub(crate) fn new(
        stripe: Arc<Stripe>,
        bucket: BucketId,
        mode: LockMode,
        msg_id: MessageId,
        holds_merge_slot: bool,
    ) -> Self {
        Self {
            stripe,
            bucket,
            mode,
            msg_id,
            merge_slot: AtomicU8::new(if holds_merge_slot {
                MERGE_SLOT_HELD
            } else {
                NO_MERGE_SLOT
            }),
        }
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn msg_id(&self) -> MessageId {
        self.msg_id
    }

    pub fn stripe_index(&self) -> usize {
        self.stripe.index()
    }

    pub fn holds_merge_slot(&self) -> bool {
        self.merge_slot.load(Ordering::Acquire) == MERGE_SLOT_HELD
    }

    /// The merge-relevant synchronous part of the operation is finished;
    /// give the merge admission slot back while the bucket stays locked.
    /// Only the first call has an effect.
    pub fn signal_operation_sync_phase_done(&self) {
        if self
            .merge_slot
            .compare_exchange(
                MERGE_SLOT_HELD,
                MERGE_SLOT_RELEASED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.stripe.release_merge_slot();
        }
    }
}

impl std::fmt::Debug for BucketLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketLock")
            .field("stripe", &self.stripe.index())
            .field("bucket", &self.bucket)
            .field("mode", &self.mode)
            .field("msg_id", &self.msg_id)
            .field("holds_merge_slot", &self.holds_merge_slot())
            .finish()
    }
}

impl Drop for BucketLock {
    fn drop(&mut self) {
        let merge_slot = std::mem::replace(self.merge_slot.get_mut(), MERGE_SLOT_RELEASED);
        self.stripe.release(
            self.bucket,
            self.mode,
            self.msg_id,
            merge_slot == MERGE_SLOT_HELD,
        );
    }
}
