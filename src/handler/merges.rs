use crate::bucket::BucketId;
use crate::error::{FileStorError, ReturnCode};
use crate::merge_status::MergeStatus;
use crate::message::StorageReply;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub type SharedMergeStatus = Arc<Mutex<MergeStatus>>;

/// Bucket -> in-progress merge. Guarded by its own mutex, never taken
/// while a stripe mutex is held, and released before any status mutex is
/// locked.
#[derive(Debug, Default)]
pub(super) struct MergeRegistry {
    statuses: Mutex<HashMap<BucketId, SharedMergeStatus>>,
}

impl MergeRegistry {
    pub(super) fn add(
        &self,
        bucket: BucketId,
        status: MergeStatus,
    ) -> Result<SharedMergeStatus, FileStorError> {
        let mut statuses = self.statuses.lock();
        if statuses.contains_key(&bucket) {
            warn!(%bucket, "merge already registered for bucket");
            return Err(FileStorError::MergeAlreadyActive { bucket });
        }
        let shared = Arc::new(Mutex::new(status));
        statuses.insert(bucket, Arc::clone(&shared));
        debug!(%bucket, active = statuses.len(), "merge registered");
        Ok(shared)
    }

    pub(super) fn get(&self, bucket: BucketId) -> Option<SharedMergeStatus> {
        self.statuses.lock().get(&bucket).cloned()
    }

    pub(super) fn contains(&self, bucket: BucketId) -> bool {
        self.statuses.lock().contains_key(&bucket)
    }

    pub(super) fn len(&self) -> usize {
        self.statuses.lock().len()
    }

    /// Removes the status for `bucket`. With a `result`, every reply parked
    /// in it is stamped with that result and returned for sending.
    pub(super) fn remove(
        &self,
        bucket: BucketId,
        result: Option<&ReturnCode>,
    ) -> Option<Vec<StorageReply>> {
        let removed = self.statuses.lock().remove(&bucket)?;
        let Some(result) = result else {
            debug!(%bucket, "merge cleared");
            return Some(Vec::new());
        };
        let replies = removed.lock().fail_parked_replies(result);
        warn!(%bucket, result = %result, parked = replies.len(), "merge cleared with error");
        Some(replies)
    }

    pub(super) fn remove_all(&self, result: &ReturnCode) -> Vec<StorageReply> {
        let drained: Vec<(BucketId, SharedMergeStatus)> =
            self.statuses.lock().drain().collect();
        let mut replies = Vec::new();
        for (bucket, status) in drained {
            let failed = status.lock().fail_parked_replies(result);
            warn!(%bucket, result = %result, parked = failed.len(), "merge cleared with error");
            replies.extend(failed);
        }
        replies
    }

    pub(super) fn timed_out(&self, now: Instant) -> Vec<BucketId> {
        let statuses: Vec<(BucketId, SharedMergeStatus)> = self
            .statuses
            .lock()
            .iter()
            .map(|(b, s)| (*b, Arc::clone(s)))
            .collect();
        statuses
            .into_iter()
            .filter(|(_, status)| status.lock().is_timed_out(now))
            .map(|(bucket, _)| bucket)
            .collect()
    }

    pub(super) fn write_status(&self, out: &mut String, verbose: bool) {
        let statuses: Vec<(BucketId, SharedMergeStatus)> = self
            .statuses
            .lock()
            .iter()
            .map(|(b, s)| (*b, Arc::clone(s)))
            .collect();
        let _ = writeln!(out, "merges: {} active", statuses.len());
        if verbose {
            for (bucket, status) in statuses {
                let _ = writeln!(out, "  {bucket}: {}", status.lock());
            }
        }
    }
}
