use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use inkmesh_preview::{
    decode_batch, encode_batch, CursorPacket, Packet, PeerId, PointPacket, StrokeBook,
};
use tokio::time::Instant;

fn bench_point_encode(c: &mut Criterion) {
    let packet = Packet::Point(PointPacket::new("abcd1234", 0.25, 0.75, 0.5));

    c.bench_function("point_encode_22B", |b| {
        b.iter(|| black_box(black_box(&packet).encode().unwrap()))
    });
}

fn bench_point_decode(c: &mut Criterion) {
    let bytes = Packet::Point(PointPacket::new("abcd1234", 0.25, 0.75, 0.5))
        .encode()
        .unwrap();

    c.bench_function("point_decode_22B", |b| {
        b.iter(|| black_box(Packet::decode(black_box(&bytes))))
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let packet = Packet::Cursor(CursorPacket::new(0.5, 0.5, true));

    c.bench_function("cursor_encode_11B", |b| {
        b.iter(|| black_box(black_box(&packet).encode().unwrap()))
    });
}

fn bench_reject_garbage(c: &mut Criterion) {
    let garbage = vec![0xFFu8; 22];

    c.bench_function("decode_reject_unknown_tag", |b| {
        b.iter(|| black_box(Packet::decode(black_box(&garbage))))
    });
}

fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_batch");
    for size in [8usize, 64, 256] {
        let points: Vec<PointPacket> = (0..size)
            .map(|i| PointPacket::new("stroke-1", i as f32 / size as f32, 0.5, 1.0))
            .collect();
        let encoded = encode_batch(&points).unwrap();

        group.bench_with_input(BenchmarkId::new("encode", size), &points, |b, points| {
            b.iter(|| black_box(encode_batch(black_box(points)).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, bytes| {
            b.iter(|| black_box(decode_batch(black_box(bytes))))
        });
    }
    group.finish();
}

fn bench_stroke_book_apply(c: &mut Criterion) {
    let peers: Vec<PeerId> = (0..8).map(|i| PeerId::from(format!("peer-{i}"))).collect();
    let point = Packet::Point(PointPacket::new("abcd1234", 0.1, 0.2, 0.3));

    c.bench_function("stroke_book_apply_8_peers", |b| {
        let mut book = StrokeBook::new(Duration::from_secs(5));
        let now = Instant::now();
        let mut i = 0usize;
        b.iter(|| {
            let peer = &peers[i % peers.len()];
            i += 1;
            black_box(book.apply(peer, black_box(&point), now));
        });
    });
}

fn bench_stroke_book_sweep(c: &mut Criterion) {
    c.bench_function("stroke_book_sweep_1000_strokes", |b| {
        let start = Instant::now();
        b.iter_batched(
            || {
                let mut book = StrokeBook::new(Duration::from_secs(5));
                let peer = PeerId::from("peer");
                for i in 0..1000 {
                    let id = format!("s{i:07}");
                    book.apply_point(&peer, &PointPacket::new(id.as_str(), 0.0, 0.0, 0.0), start);
                }
                book
            },
            |mut book| black_box(book.sweep_idle(start + Duration::from_secs(6))),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_point_encode,
    bench_point_decode,
    bench_cursor_encode,
    bench_reject_garbage,
    bench_batch,
    bench_stroke_book_apply,
    bench_stroke_book_sweep,
);

criterion_main!(benches);
