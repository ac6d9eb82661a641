//! Criterion benchmarks for the modlink message codec.
//!
//! Measures how long a client stub spends filling a request buffer and how
//! long a dispatcher spends reading it back, for a small call and for a
//! sample-heavy event.
//!
//! Run with:
//! ```bash
//! cargo bench --package modlink-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use modlink_core::{wire_record, MessageBuffer, MessageNum, ProtocolDescriptor};

#[derive(Debug, Clone, PartialEq)]
struct Sample {
    sensor: u16,
    timestamp_us: u64,
    values: Vec<f64>,
    label: String,
}
wire_record!(Sample {
    sensor,
    timestamp_us,
    values,
    label
});

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn make_sample(values: usize) -> Sample {
    Sample {
        sensor: 3,
        timestamp_us: 1_700_000_000_000,
        values: (0..values).map(|i| i as f64 * 0.5).collect(),
        label: "seam-tracker".to_string(),
    }
}

fn encode(buf: &mut MessageBuffer, sample: &Sample) -> usize {
    buf.clear();
    buf.set_message_number(MessageNum(1));
    buf.write(sample).expect("fixture fits");
    buf.finalize_size()
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_sample");
    for values in [4usize, 64, 1024] {
        let sample = make_sample(values);
        let mut buf = MessageBuffer::new(64 * 1024);
        group.bench_with_input(BenchmarkId::from_parameter(values), &sample, |b, s| {
            b.iter(|| encode(&mut buf, black_box(s)))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_sample");
    for values in [4usize, 64, 1024] {
        let mut buf = MessageBuffer::new(64 * 1024);
        encode(&mut buf, &make_sample(values));
        let frame = buf.to_frame();
        let mut rx = MessageBuffer::new(64 * 1024);
        group.bench_with_input(BenchmarkId::from_parameter(values), &frame, |b, f| {
            b.iter(|| {
                rx.load_frame(black_box(f)).expect("valid frame");
                rx.verify_checksum().expect("intact frame");
                rx.read::<Sample>().expect("decodes")
            })
        });
    }
    group.finish();
}

fn bench_descriptor(c: &mut Criterion) {
    let descriptor = ProtocolDescriptor::native("station-a", 12).with_region("xfer-a-1");
    let mut buf = MessageBuffer::new(256);
    c.bench_function("descriptor_write_read", |b| {
        b.iter(|| {
            buf.clear();
            buf.write(black_box(&descriptor)).expect("fits");
            buf.rewind();
            buf.read::<ProtocolDescriptor>().expect("decodes")
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_descriptor);
criterion_main!(benches);
