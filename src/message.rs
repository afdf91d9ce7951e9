use crate::bucket::{BucketId, DocumentId};
use crate::error::{ResultCode, ReturnCode};
use crate::handler::lock::LockMode;
use crate::merge_status::{DiffEntry, MergeNodes};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_PRIORITY: u8 = 120;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload-free tag for every operation kind the scheduler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Put,
    Update,
    Remove,
    Get,
    RemoveLocation,
    CreateIterator,
    CreateBucket,
    DeleteBucket,
    MergeBucket,
    GetBucketDiff,
    ApplyBucketDiff,
    SplitBucket,
    JoinBuckets,
    SetBucketState,
    ReadBucketInfo,
    RecheckBucketInfo,
    GetBucketDiffReply,
    ApplyBucketDiffReply,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Put => "Put",
            MessageType::Update => "Update",
            MessageType::Remove => "Remove",
            MessageType::Get => "Get",
            MessageType::RemoveLocation => "RemoveLocation",
            MessageType::CreateIterator => "CreateIterator",
            MessageType::CreateBucket => "CreateBucket",
            MessageType::DeleteBucket => "DeleteBucket",
            MessageType::MergeBucket => "MergeBucket",
            MessageType::GetBucketDiff => "GetBucketDiff",
            MessageType::ApplyBucketDiff => "ApplyBucketDiff",
            MessageType::SplitBucket => "SplitBucket",
            MessageType::JoinBuckets => "JoinBuckets",
            MessageType::SetBucketState => "SetBucketState",
            MessageType::ReadBucketInfo => "ReadBucketInfo",
            MessageType::RecheckBucketInfo => "RecheckBucketInfo",
            MessageType::GetBucketDiffReply => "GetBucketDiffReply",
            MessageType::ApplyBucketDiffReply => "ApplyBucketDiffReply",
        }
    }

    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageType::GetBucketDiffReply | MessageType::ApplyBucketDiffReply
        )
    }

    pub fn lock_mode(self) -> LockMode {
        match self {
            MessageType::Get | MessageType::CreateIterator | MessageType::ReadBucketInfo => {
                LockMode::Shared
            }
            _ => LockMode::Exclusive,
        }
    }

    /// Whether a queued instance may be discarded by a bucket abort.
    pub fn is_abortable(self) -> bool {
        match self {
            MessageType::Put
            | MessageType::Update
            | MessageType::Remove
            | MessageType::Get
            | MessageType::RemoveLocation
            | MessageType::CreateIterator
            | MessageType::DeleteBucket
            | MessageType::SetBucketState
            | MessageType::ReadBucketInfo
            | MessageType::RecheckBucketInfo => true,
            MessageType::CreateBucket
            | MessageType::MergeBucket
            | MessageType::GetBucketDiff
            | MessageType::ApplyBucketDiff
            | MessageType::SplitBucket
            | MessageType::JoinBuckets
            | MessageType::GetBucketDiffReply
            | MessageType::ApplyBucketDiffReply => false,
        }
    }

    pub fn is_merge_related(self) -> bool {
        matches!(
            self,
            MessageType::MergeBucket
                | MessageType::GetBucketDiff
                | MessageType::ApplyBucketDiff
                | MessageType::GetBucketDiffReply
                | MessageType::ApplyBucketDiffReply
        )
    }

    /// Merge commands occupy one of the stripe's merge admission slots.
    /// Replies belong to merges that already hold a slot.
    pub fn counts_toward_merge_limit(self) -> bool {
        matches!(
            self,
            MessageType::MergeBucket | MessageType::GetBucketDiff | MessageType::ApplyBucketDiff
        )
    }

    pub fn is_throttle_controlled(self, throttle_apply_bucket_diff: bool) -> bool {
        match self {
            MessageType::Put | MessageType::Update | MessageType::Remove => true,
            MessageType::ApplyBucketDiff => throttle_apply_bucket_diff,
            _ => false,
        }
    }

    /// Operations that may be dispatched straight from the scheduling thread.
    pub fn is_async_eligible(self) -> bool {
        matches!(
            self,
            MessageType::Put | MessageType::Update | MessageType::Remove
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Put {
        document_id: DocumentId,
        timestamp: u64,
    },
    Update {
        document_id: DocumentId,
        timestamp: u64,
    },
    Remove {
        document_id: DocumentId,
        timestamp: u64,
    },
    Get {
        document_id: DocumentId,
    },
    RemoveLocation {
        selection: String,
    },
    CreateIterator {
        selection: String,
    },
    CreateBucket {
        active: bool,
    },
    DeleteBucket,
    MergeBucket {
        nodes: MergeNodes,
        max_timestamp: u64,
    },
    GetBucketDiff {
        nodes: MergeNodes,
        max_timestamp: u64,
        diff: Vec<DiffEntry>,
    },
    ApplyBucketDiff {
        nodes: MergeNodes,
        diff: Vec<DiffEntry>,
    },
    SplitBucket {
        min_split_bits: u8,
        max_split_bits: u8,
    },
    JoinBuckets {
        sources: (BucketId, BucketId),
    },
    SetBucketState {
        active: bool,
    },
    ReadBucketInfo,
    RecheckBucketInfo,
    GetBucketDiffReply {
        in_reply_to: MessageId,
        diff: Vec<DiffEntry>,
        result: ReturnCode,
    },
    ApplyBucketDiffReply {
        in_reply_to: MessageId,
        diff: Vec<DiffEntry>,
        result: ReturnCode,
    },
}

impl MessageKind {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageKind::Put { .. } => MessageType::Put,
            MessageKind::Update { .. } => MessageType::Update,
            MessageKind::Remove { .. } => MessageType::Remove,
            MessageKind::Get { .. } => MessageType::Get,
            MessageKind::RemoveLocation { .. } => MessageType::RemoveLocation,
            MessageKind::CreateIterator { .. } => MessageType::CreateIterator,
            MessageKind::CreateBucket { .. } => MessageType::CreateBucket,
            MessageKind::DeleteBucket => MessageType::DeleteBucket,
            MessageKind::MergeBucket { .. } => MessageType::MergeBucket,
            MessageKind::GetBucketDiff { .. } => MessageType::GetBucketDiff,
            MessageKind::ApplyBucketDiff { .. } => MessageType::ApplyBucketDiff,
            MessageKind::SplitBucket { .. } => MessageType::SplitBucket,
            MessageKind::JoinBuckets { .. } => MessageType::JoinBuckets,
            MessageKind::SetBucketState { .. } => MessageType::SetBucketState,
            MessageKind::ReadBucketInfo => MessageType::ReadBucketInfo,
            MessageKind::RecheckBucketInfo => MessageType::RecheckBucketInfo,
            MessageKind::GetBucketDiffReply { .. } => MessageType::GetBucketDiffReply,
            MessageKind::ApplyBucketDiffReply { .. } => MessageType::ApplyBucketDiffReply,
        }
    }

    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            MessageKind::Put { document_id, .. }
            | MessageKind::Update { document_id, .. }
            | MessageKind::Remove { document_id, .. }
            | MessageKind::Get { document_id } => Some(document_id),
            _ => None,
        }
    }
}

/// An operation as handed to the scheduler by the network layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageMessage {
    id: MessageId,
    bucket: BucketId,
    priority: u8,
    timeout: Duration,
    kind: MessageKind,
}

impl StorageMessage {
    pub fn new(bucket: BucketId, kind: MessageKind) -> Self {
        Self {
            id: MessageId::next(),
            bucket,
            priority: DEFAULT_PRIORITY,
            timeout: DEFAULT_TIMEOUT,
            kind,
        }
    }

    /// Lower values are dispatched first.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.message_type().lock_mode()
    }

    pub fn document_id(&self) -> Option<&DocumentId> {
        self.kind.document_id()
    }

    pub(crate) fn set_bucket(&mut self, bucket: BucketId) {
        self.bucket = bucket;
    }

    /// Builds the reply that answers this message. A queued reply-kind
    /// message is forwarded as a reply to the command it answers.
    pub fn make_reply(&self, result: ReturnCode) -> StorageReply {
        let (msg_id, message_type) = match &self.kind {
            MessageKind::GetBucketDiffReply { in_reply_to, .. } => {
                (*in_reply_to, MessageType::GetBucketDiff)
            }
            MessageKind::ApplyBucketDiffReply { in_reply_to, .. } => {
                (*in_reply_to, MessageType::ApplyBucketDiff)
            }
            _ => (self.id, self.message_type()),
        };
        StorageReply {
            msg_id,
            message_type,
            bucket: self.bucket,
            result,
        }
    }

    pub fn make_failure(&self, code: ResultCode, message: impl Into<String>) -> StorageReply {
        self.make_reply(ReturnCode::new(code, message))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageReply {
    pub msg_id: MessageId,
    /// Type of the command this reply answers.
    pub message_type: MessageType,
    pub bucket: BucketId,
    pub result: ReturnCode,
}

impl StorageReply {
    pub fn new(
        msg_id: MessageId,
        message_type: MessageType,
        bucket: BucketId,
        result: ReturnCode,
    ) -> Self {
        Self {
            msg_id,
            message_type,
            bucket,
            result,
        }
    }

    pub fn set_result(&mut self, result: ReturnCode) {
        self.result = result;
    }
}

/// Reply path back towards the network layer.
pub trait MessageSender: Send + Sync {
    fn send_reply(&self, reply: StorageReply);

    /// Bypasses any reply-side batching.
    fn send_reply_direct(&self, reply: StorageReply) {
        self.send_reply(reply);
    }
}

/// Keeps every reply in memory, in send order.
#[derive(Debug, Default)]
pub struct ReplyCollector {
    replies: Mutex<Vec<StorageReply>>,
}

impl ReplyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.replies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.lock().is_empty()
    }

    pub fn take(&self) -> Vec<StorageReply> {
        std::mem::take(&mut *self.replies.lock())
    }

    pub fn count_with(&self, code: ResultCode) -> usize {
        self.replies
            .lock()
            .iter()
            .filter(|r| r.result.code == code)
            .count()
    }
}

impl MessageSender for ReplyCollector {
    fn send_reply(&self, reply: StorageReply) {
        self.replies.lock().push(reply);
    }
}
