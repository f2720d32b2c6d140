//! Benchmarks for the message codec and sink fan-out
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sensor_fleet::sink::MemorySink;
use sensor_fleet::transport::framing::{self, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
use sensor_fleet::{Message, SinkAggregator};

fn sample_message() -> Message {
    Message::reading(3, "Load", 0.734_512_9, "2024-05-01_12:30:45:123456")
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let message = sample_message();
    let encoded = message.serialize().unwrap();

    group.bench_function("serialize", |b| b.iter(|| black_box(&message).serialize().unwrap()));
    group.bench_function("deserialize", |b| {
        b.iter(|| Message::deserialize(black_box(&encoded)).unwrap())
    });

    for count in [1usize, 64, 1024] {
        let mut stream = Vec::new();
        for _ in 0..count {
            framing::write_frame(&mut stream, &encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
        }
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("decode_frames", count), &stream, |b, stream| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
                let mut reader = stream.as_slice();
                let mut decoded = 0;
                while let Some(frame) = framing::read_frame_blocking(&mut decoder, &mut reader).unwrap() {
                    black_box(Message::deserialize(&frame).unwrap());
                    decoded += 1;
                }
                decoded
            })
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    let message = sample_message();

    for children in [1usize, 4, 16] {
        let aggregator = SinkAggregator::new();
        let sinks: Vec<MemorySink> = (0..children).map(|_| MemorySink::new()).collect();
        for sink in &sinks {
            aggregator.add(sink.clone()).unwrap();
        }

        group.throughput(Throughput::Elements(children as u64));
        group.bench_with_input(BenchmarkId::new("append", children), &aggregator, |b, aggregator| {
            b.iter(|| {
                aggregator.append(black_box(&message)).unwrap();
                if sinks[0].len() > 100_000 {
                    sinks.iter().for_each(MemorySink::clear);
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_codec, bench_fan_out);
criterion_main!(benches);
