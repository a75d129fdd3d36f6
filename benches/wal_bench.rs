use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use shardwal::{
    Point, ReplayRequest, ShardId, StorageEngine, Wal, WalConfig, WalError, WalReader, WalWriter,
    WritePayload,
};
use tempfile::tempdir;

struct NullEngine;

#[async_trait::async_trait]
impl StorageEngine for NullEngine {
    async fn apply(&self, _request: &ReplayRequest) -> Result<(), WalError> {
        Ok(())
    }
}

fn open_wal(rt: &tokio::runtime::Runtime, dir: &std::path::Path) -> Wal {
    let config = WalConfig::new(dir)
        .with_truncate_at_start(true)
        .with_max_segment_size(100 * 1024 * 1024)
        .with_sync_on_write(false);
    rt.block_on(Wal::open(config, Arc::new(NullEngine))).unwrap()
}

fn payload() -> WritePayload {
    let value = r#"{"user": "123456", "name": "bob", "number": "123456789"}"#;
    WritePayload::new(
        "events.login",
        vec![Point::new(1_700_000_000, value.as_bytes().to_vec())],
    )
}

fn bench_append(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let dir = tempdir().unwrap();
    let wal = open_wal(&rt, dir.path());
    let shard = ShardId(0);
    let payload = payload();

    c.bench_function("append_request", |b| {
        b.to_async(&rt).iter(|| async {
            wal.append(shard, payload.clone()).await.unwrap();
        });
    });
}

fn bench_replay(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let dir = tempdir().unwrap();
    let wal = open_wal(&rt, dir.path());
    let shard = ShardId(0);

    // Pre-fill WAL with 1000 requests
    for _i in 0..1000 {
        rt.block_on(wal.append(shard, payload())).unwrap();
    }

    c.bench_function("replay_1000_linear", |b| {
        b.to_async(&rt).iter(|| async {
            let mut count = 0;
            for res in wal.replay_from(0, false).await {
                let _ = res.unwrap();
                count += 1;
            }
            assert_eq!(count, 1000);
        });
    });
}

fn bench_append_1000(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let dir = tempdir().unwrap();
    let wal = open_wal(&rt, dir.path());
    let shard = ShardId(0);
    let payload = payload();

    c.bench_function("append_1000_requests", |b| {
        b.to_async(&rt).iter(|| async {
            for _i in 0..1000 {
                wal.append(shard, payload.clone()).await.unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_append, bench_append_1000, bench_replay);
criterion_main!(benches);
