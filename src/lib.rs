pub mod bucket;
pub mod config;
pub mod error;
pub mod handler;
pub mod merge_status;
pub mod message;
pub mod stats;
pub mod throttle;
pub mod worker;

pub use bucket::{BucketId, DocumentId};
pub use config::FileStorConfig;
pub use error::{FileStorError, FileStorErrorCode, ResultCode, ReturnCode};
pub use handler::lock::{BucketLock, LockMode};
pub use handler::{
    FileStorHandler, LockedMessage, RemapOutcome, ResumeGuard, ScheduleAsyncResult,
    SharedMergeStatus,
};
pub use merge_status::{DiffEntry, MergeNode, MergeNodes, MergeStatus};
pub use message::{
    DEFAULT_PRIORITY, DEFAULT_TIMEOUT, MessageId, MessageKind, MessageSender, MessageType,
    ReplyCollector, StorageMessage, StorageReply,
};
pub use stats::{ActiveOperationsStats, SampleStats};
pub use throttle::{
    DynamicThrottleParams, DynamicThrottler, SharedThrottler, ThrottleToken, ThrottlerSwitch,
    UnlimitedThrottler,
};
pub use worker::{OperationExecutor, PersistenceWorkerPool, WorkerContext};
