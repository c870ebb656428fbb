//! Codec benchmarks for cloudlink-protocol.

use bytes::BytesMut;
use cloudlink_protocol::{codec, Opcode, Packet};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_encode_masked(c: &mut Criterion) {
    let payload = vec![0u8; 64];

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("masked_64B", |b| {
        b.iter(|| codec::encode(black_box(&payload), Opcode::Binary, true))
    });
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    let encoded = codec::encode(&[0u8; 4096], Opcode::Binary, false);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("unmasked_4KiB", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(black_box(&encoded[..]));
            codec::decode_from(&mut buf, codec::MAX_FRAME_SIZE).unwrap()
        })
    });
    group.finish();
}

fn bench_parse_batch(c: &mut Criterion) {
    let batch: String = (0..10)
        .map(|i| format!("{{\"method\":\"set\",\"name\":\"☁ var{i}\",\"value\":\"{i}\"}}\n"))
        .collect();

    c.bench_function("parse_batch_10", |b| {
        b.iter(|| Packet::parse_batch(black_box(&batch)))
    });
}

criterion_group!(
    benches,
    bench_encode_masked,
    bench_decode_stream,
    bench_parse_batch
);
criterion_main!(benches);
