use crate::bucket::{BucketId, DocumentId};
use crate::error::{ResultCode, ReturnCode};
use crate::message::{MessageKind, StorageMessage};

/// Where queued operations for a split or joined source bucket go.
pub(super) enum RemapTarget<'r> {
    Split {
        target1: BucketId,
        target2: BucketId,
        route: &'r dyn Fn(&DocumentId) -> BucketId,
    },
    Join {
        target: BucketId,
    },
}

impl RemapTarget<'_> {
    pub(super) fn buckets(&self) -> Vec<BucketId> {
        match self {
            RemapTarget::Split {
                target1, target2, ..
            } => vec![*target1, *target2],
            RemapTarget::Join { target } => vec![*target],
        }
    }

    pub(super) fn verb(&self) -> &'static str {
        match self {
            RemapTarget::Split { .. } => "split",
            RemapTarget::Join { .. } => "joined",
        }
    }
}

#[derive(Debug, PartialEq)]
pub(super) enum RemapDecision {
    Retarget(BucketId),
    Fail(ReturnCode),
    Drop,
}

pub(super) fn decide(message: &StorageMessage, target: &RemapTarget<'_>) -> RemapDecision {
    let verb = target.verb();
    match message.kind() {
        MessageKind::Put { document_id, .. }
        | MessageKind::Update { document_id, .. }
        | MessageKind::Remove { document_id, .. }
        | MessageKind::Get { document_id } => match target {
            RemapTarget::Split {
                target1,
                target2,
                route,
            } => {
                let routed = route(document_id);
                if target1.contains(routed) {
                    RemapDecision::Retarget(*target1)
                } else if target2.contains(routed) {
                    RemapDecision::Retarget(*target2)
                } else {
                    RemapDecision::Fail(ReturnCode::new(
                        ResultCode::BucketNotFound,
                        format!("document {document_id} belongs to neither split target"),
                    ))
                }
            }
            RemapTarget::Join { target } => RemapDecision::Retarget(*target),
        },
        MessageKind::RemoveLocation { .. } => match target {
            RemapTarget::Split { .. } => RemapDecision::Fail(ReturnCode::new(
                ResultCode::BucketNotFound,
                "bucket was split while a multi-document operation was queued",
            )),
            RemapTarget::Join { target } => RemapDecision::Retarget(*target),
        },
        MessageKind::CreateIterator { .. } => RemapDecision::Fail(ReturnCode::new(
            ResultCode::BucketNotFound,
            format!("bucket was {verb} while iteration was queued"),
        )),
        MessageKind::MergeBucket { .. }
        | MessageKind::GetBucketDiff { .. }
        | MessageKind::ApplyBucketDiff { .. }
        | MessageKind::GetBucketDiffReply { .. }
        | MessageKind::ApplyBucketDiffReply { .. } => RemapDecision::Fail(ReturnCode::new(
            ResultCode::BucketDeleted,
            format!("bucket was {verb} during merge"),
        )),
        MessageKind::RecheckBucketInfo => match target {
            RemapTarget::Split { .. } => RemapDecision::Drop,
            RemapTarget::Join { target } => RemapDecision::Retarget(*target),
        },
        MessageKind::SetBucketState { .. } | MessageKind::ReadBucketInfo => match target {
            RemapTarget::Split { .. } => RemapDecision::Fail(ReturnCode::new(
                ResultCode::BucketDeleted,
                "bucket was split",
            )),
            RemapTarget::Join { target } => RemapDecision::Retarget(*target),
        },
        MessageKind::CreateBucket { .. }
        | MessageKind::DeleteBucket
        | MessageKind::SplitBucket { .. }
        | MessageKind::JoinBuckets { .. } => RemapDecision::Fail(ReturnCode::new(
            ResultCode::BucketDeleted,
            format!("bucket was {verb} while {} was queued", message.message_type()),
        )),
    }
}
