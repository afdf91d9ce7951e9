use crate::bucket::BucketId;
use thiserror::Error;

/// Outcome carried by every reply produced by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    Timeout,
    BucketNotFound,
    BucketDeleted,
    Aborted,
    Busy,
    InternalFailure,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::Timeout => "timeout",
            ResultCode::BucketNotFound => "bucket_not_found",
            ResultCode::BucketDeleted => "bucket_deleted",
            ResultCode::Aborted => "aborted",
            ResultCode::Busy => "busy",
            ResultCode::InternalFailure => "internal_failure",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnCode {
    pub code: ResultCode,
    pub message: String,
}

impl ReturnCode {
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStorErrorCode {
    InvalidConfig,
    Closed,
    MergeAlreadyActive,
    MergeNotFound,
    WorkerSpawn,
}

impl FileStorErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStorErrorCode::InvalidConfig => "invalid_config",
            FileStorErrorCode::Closed => "closed",
            FileStorErrorCode::MergeAlreadyActive => "merge_already_active",
            FileStorErrorCode::MergeNotFound => "merge_not_found",
            FileStorErrorCode::WorkerSpawn => "worker_spawn",
        }
    }
}

#[derive(Debug, Error)]
pub enum FileStorError {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("file stor handler is closed")]
    Closed,
    #[error("merge already active for {bucket}")]
    MergeAlreadyActive { bucket: BucketId },
    #[error("no merge registered for {bucket}")]
    MergeNotFound { bucket: BucketId },
    #[error("failed to spawn persistence worker: {source}")]
    WorkerSpawn {
        #[source]
        source: std::io::Error,
    },
}

impl FileStorError {
    pub fn code(&self) -> FileStorErrorCode {
        match self {
            FileStorError::InvalidConfig { .. } => FileStorErrorCode::InvalidConfig,
            FileStorError::Closed => FileStorErrorCode::Closed,
            FileStorError::MergeAlreadyActive { .. } => FileStorErrorCode::MergeAlreadyActive,
            FileStorError::MergeNotFound { .. } => FileStorErrorCode::MergeNotFound,
            FileStorError::WorkerSpawn { .. } => FileStorErrorCode::WorkerSpawn,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Result code to put on a reply when this error terminates an operation.
    pub fn result_code(&self) -> ResultCode {
        match self {
            FileStorError::InvalidConfig { .. } => ResultCode::InternalFailure,
            FileStorError::Closed => ResultCode::Aborted,
            FileStorError::MergeAlreadyActive { .. } => ResultCode::Busy,
            FileStorError::MergeNotFound { .. } => ResultCode::BucketNotFound,
            FileStorError::WorkerSpawn { .. } => ResultCode::InternalFailure,
        }
    }
}
