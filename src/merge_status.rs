use crate::error::ReturnCode;
use crate::message::StorageReply;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub type MergeNodes = SmallVec<[MergeNode; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeNode {
    pub index: u16,
    /// Source-only nodes contribute entries but never receive them.
    pub source_only: bool,
}

impl MergeNode {
    pub fn new(index: u16) -> Self {
        Self {
            index,
            source_only: false,
        }
    }

    pub fn source_only(index: u16) -> Self {
        Self {
            index,
            source_only: true,
        }
    }
}

/// A candidate document version in a merge. Bit `i` of `has_mask` is set
/// when the i-th participant already has this version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffEntry {
    pub timestamp: u64,
    pub gid: u64,
    pub has_mask: u16,
    pub flags: u16,
}

impl DiffEntry {
    pub fn new(timestamp: u64, gid: u64, has_mask: u16) -> Self {
        Self {
            timestamp,
            gid,
            has_mask,
            flags: 0,
        }
    }

    fn same_version(&self, other: &DiffEntry) -> bool {
        self.timestamp == other.timestamp && self.gid == other.gid
    }
}

/// Per-bucket bookkeeping for an in-progress multi-node merge.
#[derive(Debug)]
pub struct MergeStatus {
    reply: Option<StorageReply>,
    nodes: MergeNodes,
    max_timestamp: u64,
    diff: VecDeque<DiffEntry>,
    pending_get_diff: Option<StorageReply>,
    pending_apply_diff: Option<StorageReply>,
    timeout: Duration,
    start_time: Instant,
}

impl MergeStatus {
    pub fn new(nodes: MergeNodes, max_timestamp: u64, timeout: Duration) -> Self {
        assert!(nodes.len() <= 16, "merge supports at most 16 participants");
        Self {
            reply: None,
            nodes,
            max_timestamp,
            diff: VecDeque::new(),
            pending_get_diff: None,
            pending_apply_diff: None,
            timeout,
            start_time: Instant::now(),
        }
    }

    pub fn nodes(&self) -> &[MergeNode] {
        &self.nodes
    }

    pub fn max_timestamp(&self) -> u64 {
        self.max_timestamp
    }

    pub fn observe_timestamp(&mut self, timestamp: u64) {
        self.max_timestamp = self.max_timestamp.max(timestamp);
    }

    /// Only the node that initiated the merge holds the final reply.
    pub fn is_first_node(&self) -> bool {
        self.reply.is_some()
    }

    pub fn set_reply(&mut self, reply: StorageReply) {
        self.reply = Some(reply);
    }

    pub fn take_reply(&mut self) -> Option<StorageReply> {
        self.reply.take()
    }

    pub fn full_mask(&self) -> u16 {
        if self.nodes.len() >= 16 {
            u16::MAX
        } else {
            (1u16 << self.nodes.len()) - 1
        }
    }

    pub fn diff(&self) -> &VecDeque<DiffEntry> {
        &self.diff
    }

    pub fn add_to_diff(&mut self, entries: impl IntoIterator<Item = DiffEntry>) {
        self.diff.extend(entries);
    }

    /// Folds the result of an applied diff part back into the candidate
    /// list. Entries now held by every node in `applied_mask` are dropped;
    /// others get their has-mask refreshed. Returns whether anything changed.
    pub fn remove_from_diff(&mut self, part: &[DiffEntry], applied_mask: u16) -> bool {
        let mut altered = false;
        for applied in part {
            let Some(pos) = self.diff.iter().position(|e| e.same_version(applied)) else {
                continue;
            };
            if applied.has_mask & applied_mask == applied_mask {
                self.diff.remove(pos);
                altered = true;
            } else if self.diff[pos].has_mask != applied.has_mask {
                self.diff[pos].has_mask = applied.has_mask;
                altered = true;
            }
        }
        altered
    }

    pub fn park_get_diff_reply(&mut self, reply: StorageReply) {
        assert!(
            self.pending_get_diff.is_none(),
            "get bucket diff reply already parked"
        );
        self.pending_get_diff = Some(reply);
    }

    pub fn take_get_diff_reply(&mut self) -> Option<StorageReply> {
        self.pending_get_diff.take()
    }

    pub fn park_apply_diff_reply(&mut self, reply: StorageReply) {
        assert!(
            self.pending_apply_diff.is_none(),
            "apply bucket diff reply already parked"
        );
        self.pending_apply_diff = Some(reply);
    }

    pub fn take_apply_diff_reply(&mut self) -> Option<StorageReply> {
        self.pending_apply_diff.take()
    }

    /// Takes the merge reply and every parked sub-reply, stamped with `result`.
    pub fn fail_parked_replies(&mut self, result: &ReturnCode) -> Vec<StorageReply> {
        [
            self.reply.take(),
            self.pending_get_diff.take(),
            self.pending_apply_diff.take(),
        ]
        .into_iter()
        .flatten()
        .map(|mut reply| {
            reply.set_result(result.clone());
            reply
        })
        .collect()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start_time) >= self.timeout
    }
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "nodes [")?;
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", node.index)?;
            if node.source_only {
                write!(f, " (source only)")?;
            }
        }
        write!(
            f,
            "], max timestamp {}, {} diff entries",
            self.max_timestamp,
            self.diff.len()
        )?;
        if self.reply.is_some() {
            write!(f, ", first node")?;
        }
        if self.pending_get_diff.is_some() {
            write!(f, ", get diff reply parked")?;
        }
        if self.pending_apply_diff.is_some() {
            write!(f, ", apply diff reply parked")?;
        }
        write!(
            f,
            ", running {} ms of {} ms",
            self.elapsed().as_millis(),
            self.timeout.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{DiffEntry, MergeNode, MergeStatus};
    use crate::bucket::BucketId;
    use crate::error::{ResultCode, ReturnCode};
    use crate::message::{MessageId, MessageType, StorageReply};
    use smallvec::smallvec;
    use std::time::{Duration, Instant};

    fn three_node_status() -> MergeStatus {
        MergeStatus::new(
            smallvec![MergeNode::new(0), MergeNode::new(1), MergeNode::source_only(2)],
            100,
            Duration::from_secs(60),
        )
    }

    fn reply(message_type: MessageType) -> StorageReply {
        StorageReply::new(
            MessageId::next(),
            message_type,
            BucketId::new(16, 1),
            ReturnCode::ok(),
        )
    }

    #[test]
    fn remove_from_diff_drops_fully_applied_entries() {
        let mut status = three_node_status();
        status.add_to_diff([
            DiffEntry::new(10, 1, 0b001),
            DiffEntry::new(20, 2, 0b010),
            DiffEntry::new(30, 3, 0b100),
        ]);
        let applied = [DiffEntry::new(10, 1, 0b011), DiffEntry::new(30, 3, 0b101)];
        assert!(status.remove_from_diff(&applied, 0b011));
        let left: Vec<_> = status.diff().iter().map(|e| (e.timestamp, e.has_mask)).collect();
        assert_eq!(left, vec![(20, 0b010), (30, 0b101)]);
        assert!(!status.remove_from_diff(&applied[1..], 0b011));
    }

    #[test]
    fn remove_from_diff_ignores_unknown_versions() {
        let mut status = three_node_status();
        status.add_to_diff([DiffEntry::new(10, 1, 0b001)]);
        assert!(!status.remove_from_diff(&[DiffEntry::new(10, 2, 0b111)], 0b111));
        assert_eq!(status.diff().len(), 1);
    }

    #[test]
    fn failing_parked_replies_stamps_every_reply() {
        let mut status = three_node_status();
        status.set_reply(reply(MessageType::MergeBucket));
        status.park_apply_diff_reply(reply(MessageType::ApplyBucketDiff));
        assert!(status.is_first_node());
        let failed = status.fail_parked_replies(&ReturnCode::new(ResultCode::Aborted, "abort"));
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|r| r.result.code == ResultCode::Aborted));
        assert!(!status.is_first_node());
        assert!(status.take_apply_diff_reply().is_none());
    }

    #[test]
    fn timeout_is_measured_from_start() {
        let status = MergeStatus::new(smallvec![MergeNode::new(0)], 0, Duration::ZERO);
        assert!(status.is_timed_out(Instant::now()));
        assert_eq!(status.full_mask(), 0b1);
        let status = three_node_status();
        assert!(!status.is_timed_out(Instant::now()));
        assert!(status.to_string().contains("2 (source only)"));
    }
}
