//! Chunk Log Benchmarks
//!
//! ## What We Benchmark
//!
//! ### 1. Append (`chunk_append`)
//! - Appends a chunk's worth of 8KB frames and drains the write loop
//!
//! ### 2. Recovery (`chunk_recover`)
//! - Reopens a finalized chunk from its index, and from a deleted index (rescan)
//!
//! ### 3. Read (`chunk_read`)
//! - Reads every record of a finalized chunk back from disk
//!
//! ## Running Benchmarks
//!
//! ```bash
//! cargo bench -p framehouse-storage --bench chunk_log_bench
//! ```

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use framehouse_core::{FrameType, NalRecord};
use framehouse_storage::{ChunkId, ChunkLog, Signal};
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn frame(seq: u64, payload: usize) -> NalRecord {
    NalRecord {
        rate: 1,
        time: 1_700_000_000_000_000 + seq as i64 * 33_333,
        frame_type: if seq % 30 == 0 {
            FrameType::Keyframe
        } else {
            FrameType::Interframe
        },
        width: 1920,
        height: 1080,
        sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x28]),
        pps: Bytes::from_static(&[0x68, 0xee, 0x3c, 0x80]),
        nal: Bytes::from(vec![0x5A; payload]),
        add_seq_num: seq,
    }
}

async fn write_chunk(dir: &std::path::Path, count: u64) -> ChunkId {
    let first = frame(0, 8 * 1024);
    let chunk = ChunkLog::create(dir, &first, false).await.unwrap();
    for seq in 0..count {
        chunk.append(&frame(seq, 8 * 1024)).unwrap();
    }
    chunk.finalize().unwrap();
    chunk.drain().await.unwrap();
    chunk.id()
}

fn bench_chunk_append(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("chunk_append");

    for count in [100u64, 600] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&runtime).iter(|| async move {
                let dir = TempDir::new().unwrap();
                black_box(write_chunk(dir.path(), count).await);
            });
        });
    }

    group.finish();
}

fn bench_chunk_recover(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("chunk_recover");

    let dir = TempDir::new().unwrap();
    let id = runtime.block_on(write_chunk(dir.path(), 600));

    group.bench_function("index_ok", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(ChunkLog::recover(dir.path(), id, false).await.unwrap());
        });
    });

    group.bench_function("rescan", |b| {
        let (_, index_path) = ChunkLog::paths(dir.path(), &id);
        b.to_async(&runtime).iter(|| {
            let index_path = index_path.clone();
            async {
                tokio::fs::remove_file(index_path).await.unwrap();
                black_box(ChunkLog::recover(dir.path(), id, false).await.unwrap());
            }
        });
    });

    group.finish();
}

fn bench_chunk_read(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("chunk_read");

    let dir = TempDir::new().unwrap();
    let id = runtime.block_on(write_chunk(dir.path(), 600));
    let chunk = runtime
        .block_on(ChunkLog::recover(dir.path(), id, false))
        .unwrap()
        .unwrap();
    let entries = chunk.entries();

    group.throughput(Throughput::Elements(entries.len() as u64));
    group.bench_function("all_records", |b| {
        b.to_async(&runtime).iter(|| async {
            let cancel = Signal::new();
            black_box(chunk.read_records(&entries, &cancel).await.unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_chunk_append, bench_chunk_recover, bench_chunk_read);
criterion_main!(benches);
