// Criterion benchmarks for wirerpc-common
//
// Run benchmarks with:
//   cargo bench -p wirerpc-common

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio_util::codec::Decoder;
use wirerpc_common::{Codec, FrameCodec, Request, Response, Serializer};

fn bench_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_request");
    let frames = FrameCodec::new();

    for (name, codec) in [
        ("binary", Codec::binary()),
        ("json", Codec::json()),
        ("postcard", Codec::postcard()),
    ] {
        let request = Request::new(8, vec![0xABu8; 256]).with_request_id(123);
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            let mut buf = BytesMut::with_capacity(4096);
            b.iter(|| {
                buf.clear();
                frames
                    .encode_with(&mut buf, |dst| codec.write_request(dst, black_box(&request)))
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn bench_decode_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_response");

    for size in [16usize, 1024, 64 * 1024] {
        let codec = Codec::binary();
        let frames = FrameCodec::new();
        let mut wire = BytesMut::new();
        frames
            .encode_with(&mut wire, |dst| {
                codec.write_response(dst, &Response::ok(7, vec![1u8; size]))
            })
            .unwrap();
        let wire = wire.freeze();

        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut src = BytesMut::from(&wire[..]);
                let payload = FrameCodec::new().decode(&mut src).unwrap().unwrap();
                black_box(codec.read_response(payload.freeze()).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_request, bench_decode_response);
criterion_main!(benches);
