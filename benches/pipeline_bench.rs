//! Benchmarks for the Waypoint ingest path
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use tempfile::tempdir;
use tokio_util::codec::{Decoder, Encoder};

use waypoint::server::Utf8FrameCodec;
use waypoint::{
    BackingStore, BatchedWriter, DeviceId, DeviceSession, DispatchHub, GpsRecord, LiveHub,
    MemoryStore, SqliteStore, WriterConfig,
};

const UPDATE: &str = r#"{"timestamp":1000,"lat":49.2,"lon":-123.1,"altitude":10.0,"speed":0.0}"#;

fn create_test_records(count: usize) -> Vec<GpsRecord> {
    (0..count)
        .map(|i| {
            GpsRecord::new(
                DeviceId::new("bench"),
                "127.0.0.1:40000".parse().unwrap(),
                i as i64,
                49.2,
                -123.1,
                10.0,
                0.0,
            )
        })
        .collect()
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    group.bench_function("encode_update", |b| {
        let mut buf = BytesMut::with_capacity(256);
        b.iter(|| {
            buf.clear();
            Utf8FrameCodec.encode(black_box(UPDATE), &mut buf).unwrap();
        });
    });

    group.bench_function("decode_update", |b| {
        let mut encoded = BytesMut::new();
        Utf8FrameCodec.encode(UPDATE, &mut encoded).unwrap();
        b.iter(|| {
            let mut buf = encoded.clone();
            Utf8FrameCodec.decode(black_box(&mut buf)).unwrap()
        });
    });

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("session_update_to_writer_and_live", |b| {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::new(BatchedWriter::new(store, WriterConfig::default()));
        rt.block_on(writer.connect()).unwrap();
        let hub = Arc::new(DispatchHub::new());
        hub.register(writer.clone());
        hub.register(Arc::new(LiveHub::default()));

        let mut session = DeviceSession::new("127.0.0.1:40000".parse().unwrap(), hub);
        session.handle_message(r#"{"id":"bench"}"#).unwrap();

        b.iter(|| {
            session.handle_message(black_box(UPDATE)).unwrap();
            if writer.pending_len() >= 10_000 {
                rt.block_on(writer.flush()).unwrap();
            }
        });
    });

    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("flush");

    for size in [100, 1000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("memory_{}", size), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let store = Arc::new(MemoryStore::new());
                    let writer = BatchedWriter::new(store, WriterConfig::default());
                    writer.connect().await.unwrap();
                    let records = create_test_records(size);

                    let start = std::time::Instant::now();
                    for _ in 0..iters {
                        for record in &records {
                            writer.append(record.clone());
                        }
                        writer.flush().await.unwrap();
                    }
                    start.elapsed()
                })
            });
        });

        group.bench_function(format!("sqlite_{}", size), |b| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let dir = tempdir().unwrap();
                    let store = SqliteStore::new(dir.path().join("bench.db"));
                    store.connect().await.unwrap();
                    let records = create_test_records(size);

                    let start = std::time::Instant::now();
                    for _ in 0..iters {
                        store.insert_many(black_box(&records)).await.unwrap();
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec, bench_dispatch, bench_flush);
criterion_main!(benches);
