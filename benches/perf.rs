use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use filestor::{
    BucketId, DocumentId, FileStorConfig, FileStorHandler, MessageKind, ReplyCollector,
    StorageMessage,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const QUEUED_OPS: u64 = 1_024;

fn handler(num_stripes: usize) -> FileStorHandler {
    let config = FileStorConfig {
        num_stripes,
        get_next_message_wait_ms: 1,
        ..FileStorConfig::default()
    };
    FileStorHandler::new(config, Arc::new(ReplyCollector::new())).expect("config")
}

fn put(n: u64) -> StorageMessage {
    StorageMessage::new(
        BucketId::new(20, n),
        MessageKind::Put {
            document_id: DocumentId::new(format!("id:bench:doc::{n}")),
            timestamp: n,
        },
    )
    .with_priority((n % 255) as u8)
}

fn bench_schedule_and_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("filestor");

    group.bench_function("schedule_then_dequeue_single", |b| {
        let handler = handler(4);
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let message = put(n);
            let stripe = handler.stripe_index(message.bucket());
            handler.schedule(message).expect("open");
            let deadline = Instant::now() + Duration::from_millis(1);
            black_box(handler.get_next_message(stripe, deadline));
        });
    });

    group.bench_function("drain_1024_queued", |b| {
        b.iter_batched(
            || {
                let handler = handler(1);
                for n in 0..QUEUED_OPS {
                    handler.schedule(put(n)).expect("open");
                }
                handler
            },
            |handler| {
                let deadline = Instant::now() + Duration::from_millis(1);
                while let Some(locked) = handler.get_next_message(0, deadline) {
                    black_box(locked);
                }
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("async_dispatch", |b| {
        let handler = handler(4);
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            black_box(handler.schedule_and_get_next_async_message(put(n)));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_schedule_and_dequeue);
criterion_main!(benches);
