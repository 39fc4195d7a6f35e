//! Codec and Range Benchmarks
//!
//! ## What We Benchmark
//!
//! ### 1. Record encoding (`record_encode`)
//! - Encodes frames of typical sizes (interframe ~8KB, keyframe ~120KB)
//!
//! ### 2. Log scanning (`scan_records`)
//! - Rebuilds the index of a full chunk, as recovery does after a crash
//!
//! ### 3. Span merging (`range_add_or_extend`)
//! - Appends one frame span at a time, the steady-state ingest pattern
//!
//! ## Running Benchmarks
//!
//! ```bash
//! cargo bench -p framehouse-core --bench codec_bench
//! ```

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use framehouse_core::codec::{encode_record, scan_records};
use framehouse_core::{FrameType, NalRecord, RangeSet, Span};

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

fn bench_record_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_encode");
    for size in [8 * 1024, 120 * 1024] {
        let record = frame(1, size);
        group.throughput(Throughput::Bytes(record.encoded_len()));
        group.bench_with_input(BenchmarkId::from_parameter(size), &record, |b, record| {
            b.iter(|| black_box(encode_record(record)));
        });
    }
    group.finish();
}

fn bench_scan_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_records");
    for count in [600usize, 6_000] {
        let mut log = Vec::new();
        for seq in 0..count {
            log.extend_from_slice(&encode_record(&frame(seq as u64, 2_048)));
        }
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &log, |b, log| {
            b.iter(|| black_box(scan_records(log).unwrap()));
        });
    }
    group.finish();
}

fn bench_range_add_or_extend(c: &mut Criterion) {
    c.bench_function("range_add_or_extend", |b| {
        b.iter(|| {
            let mut set = RangeSet::for_rate(1);
            let mut last = 0i64;
            for i in 1..10_000i64 {
                // a 20 second outage every 1000 frames
                let time = i * 33_333 + (i / 1_000) * 20_000_000;
                let first = if time - last < set.min_gap() { last } else { time };
                set.add_or_extend(Span::new(first, time, 1)).unwrap();
                last = time;
            }
            black_box(set.len())
        });
    });
}

criterion_group!(
    benches,
    bench_record_encode,
    bench_scan_records,
    bench_range_add_or_extend
);
criterion_main!(benches);
