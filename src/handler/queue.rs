use crate::bucket::BucketId;
use crate::message::StorageMessage;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// A queued operation. Owned by the queue until a worker dequeues it.
#[derive(Debug)]
pub struct MessageEntry {
    pub(crate) message: StorageMessage,
    pub(crate) bucket: BucketId,
    pub(crate) priority: u8,
    pub(crate) enqueued_at: Instant,
}

impl MessageEntry {
    pub fn new(message: StorageMessage, enqueued_at: Instant) -> Self {
        Self {
            bucket: message.bucket(),
            priority: message.priority(),
            message,
            enqueued_at,
        }
    }

    pub fn message(&self) -> &StorageMessage {
        &self.message
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn queued_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    /// Replies never expire; commands expire once queued for their timeout.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        !self.message.message_type().is_reply() && self.queued_for(now) >= self.message.timeout()
    }

    pub(crate) fn retarget(&mut self, bucket: BucketId) {
        self.message.set_bucket(bucket);
        self.bucket = bucket;
    }

    pub(crate) fn into_message(self) -> StorageMessage {
        self.message
    }
}

/// Ordering key: priority first, insertion order within a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    priority: u8,
    seq: u64,
}

/// Priority-ordered entries plus a bucket index kept in step on every
/// insert and removal.
#[derive(Debug, Default)]
pub(crate) struct PriorityQueue {
    entries: BTreeMap<QueueKey, MessageEntry>,
    by_bucket: HashMap<BucketId, BTreeSet<QueueKey>>,
    next_seq: u64,
}

impl PriorityQueue {
    pub(crate) fn push(&mut self, entry: MessageEntry) -> QueueKey {
        let key = QueueKey {
            priority: entry.priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.by_bucket.entry(entry.bucket).or_default().insert(key);
        self.entries.insert(key, entry);
        key
    }

    pub(crate) fn remove(&mut self, key: &QueueKey) -> Option<MessageEntry> {
        let entry = self.entries.remove(key)?;
        self.unindex(entry.bucket, key);
        Some(entry)
    }

    fn unindex(&mut self, bucket: BucketId, key: &QueueKey) {
        if let Some(keys) = self.by_bucket.get_mut(&bucket) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_bucket.remove(&bucket);
            }
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&QueueKey, &MessageEntry)> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn bucket_len(&self, bucket: BucketId) -> usize {
        self.by_bucket.get(&bucket).map_or(0, BTreeSet::len)
    }

    /// Removes every entry for `bucket`, in dispatch order.
    pub(crate) fn take_bucket(&mut self, bucket: BucketId) -> Vec<MessageEntry> {
        let Some(keys) = self.by_bucket.remove(&bucket) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .collect()
    }

    /// Removes every entry matching `pred`, in dispatch order.
    pub(crate) fn extract_if(
        &mut self,
        mut pred: impl FnMut(&MessageEntry) -> bool,
    ) -> Vec<MessageEntry> {
        let keys: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|&(_, e)| pred(e))
            .map(|(k, _)| *k)
            .collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<MessageEntry> {
        self.by_bucket.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
