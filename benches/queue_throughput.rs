//! Hot-path throughput benchmarks.
//!
//! Measures queue enqueue/dequeue per discipline, envelope codecs, and the
//! isolated-worker frame round trip using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Cursor;

use courier_core::envelope::{
    EnvelopeCodec, JsonCodec, MsgPackCodec, Priority, CONTENT_TYPE_TEXT,
};
use courier_core::queue::MessageQueue;
use courier_core::supervisor::codec::{read_frame, write_frame, FRAME_PROCESS};
use courier_core::types::{QueueKind, QueueSettings};
use courier_core::{Envelope, ParserRegistry};

const MAX_FRAME: u32 = 5 * 1024 * 1024;
const BATCH: usize = 1000;

fn envelope(size: usize) -> Envelope {
    Envelope::builder(CONTENT_TYPE_TEXT, vec![b'x'; size])
        .source("bench")
        .destination("sink")
        .build(&ParserRegistry::with_builtins())
        .unwrap()
}

fn bench_queue(c: &mut Criterion) {
    let base = envelope(256);
    let batch: Vec<Envelope> = (0..BATCH)
        .map(|i| base.with_priority(Priority::new((i % 10) as u8).unwrap()))
        .collect();

    let mut group = c.benchmark_group("queue_fill_drain");
    for kind in [QueueKind::Fifo, QueueKind::Lifo, QueueKind::Priority, QueueKind::Unordered] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{kind:?}")), &kind, |b, &kind| {
            b.iter(|| {
                let queue = MessageQueue::new(
                    "bench",
                    QueueSettings {
                        kind,
                        capacity: BATCH,
                        ..Default::default()
                    },
                );
                for envelope in &batch {
                    queue.try_enqueue(envelope.clone()).unwrap();
                }
                let mut drained = 0;
                while let Some(entry) = queue.try_dequeue() {
                    black_box(entry.envelope());
                    drained += 1;
                }
                drained
            });
        });
    }
    group.finish();
}

fn bench_codecs(c: &mut Criterion) {
    let codecs: [&dyn EnvelopeCodec; 2] = [&JsonCodec, &MsgPackCodec];
    let sizes: &[usize] = &[64, 4096, 65536];

    let mut group = c.benchmark_group("envelope_codec");
    for codec in codecs {
        for &size in sizes {
            let env = envelope(size);
            group.bench_with_input(
                BenchmarkId::new(codec.name(), size),
                &env,
                |b, env| {
                    b.iter(|| {
                        let bytes = codec.encode(black_box(env)).unwrap();
                        codec.decode(&bytes).unwrap()
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_frame_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let payload = MsgPackCodec.encode(&envelope(1024)).unwrap();

    c.bench_function("process_frame_round_trip_1kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut buf = Vec::with_capacity(payload.len() + 5);
                write_frame(&mut buf, FRAME_PROCESS, black_box(&payload))
                    .await
                    .unwrap();
                let mut cursor = Cursor::new(buf);
                read_frame(&mut cursor, MAX_FRAME).await.unwrap()
            })
        });
    });
}

criterion_group!(benches, bench_queue, bench_codecs, bench_frame_round_trip);
criterion_main!(benches);
