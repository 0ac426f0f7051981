use std::io::Cursor;

use aicf_core::parse::{collect, RecordIter};
use aicf_core::Shutdown;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn record_file(records: usize) -> Vec<u8> {
    let mut out = String::new();
    let mut line = 1usize;
    for i in 0..records {
        let body = [
            format!("@CONVERSATION:c{i:06}"),
            "timestamp=2025-01-01T00:00:00Z".to_string(),
            format!("messages={}", i % 40),
            format!("summary=sync {i} covered deploy cadence and cache sizing"),
            format!("insight {i}|architecture|HIGH|HIGH|semantic"),
            String::new(),
        ];
        for part in body {
            out.push_str(&format!("{line}|{part}\n"));
            line += 1;
        }
    }
    out.into_bytes()
}

fn parse_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("aicf-core");

    for records in [100usize, 1_000, 10_000] {
        let data = record_file(records);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("parse_records", records),
            &data,
            |b, data| {
                b.iter(|| {
                    let iter =
                        RecordIter::new(Cursor::new(data.as_slice()), Shutdown::new());
                    let (records, findings) = collect(iter).unwrap();
                    assert!(findings.is_empty());
                    records.len()
                })
            },
        );
    }
    group.finish();
}

criterion_group!(name = benches;
                 config = Criterion::default();
                 targets = parse_bench);
criterion_main!(benches);
