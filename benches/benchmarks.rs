//! Performance benchmarks for ChatMesh backend
//!
//! Run with: cargo bench

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chatmesh_backend::{
    heartbeat::{decide, HeartbeatPolicy},
    models::{ChatMessage, SessionType},
    protocol::{ClientFrame, ServerFrame},
    router::PushRequest,
    wheel::Ring,
};

/// Schedule N keys, then advance one full revolution
fn bench_wheel_schedule_and_expire(c: &mut Criterion) {
    let mut group = c.benchmark_group("time_wheel");

    for key_count in [1_000usize, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(*key_count as u64));

        let keys: Vec<String> = (0..*key_count).map(|i| format!("conn-{}", i)).collect();

        group.bench_with_input(
            BenchmarkId::new("insert_then_fire", key_count),
            &keys,
            |b, keys| {
                b.iter(|| {
                    let mut ring = Ring::new(600, Duration::from_millis(100));
                    for (i, key) in keys.iter().enumerate() {
                        let delay = Duration::from_millis(100 * (i % 600) as u64);
                        ring.insert(key.clone(), i, delay);
                    }
                    let mut fired = 0;
                    for _ in 0..600 {
                        fired += ring.advance().len();
                    }
                    black_box(fired)
                })
            },
        );

        group.bench_with_input(
            BenchmarkId::new("reschedule", key_count),
            &keys,
            |b, keys| {
                let mut ring = Ring::new(600, Duration::from_millis(100));
                for key in keys {
                    ring.insert(key.clone(), 0usize, Duration::from_secs(10));
                }
                b.iter(|| {
                    for key in keys {
                        ring.insert(key.clone(), 1, Duration::from_secs(30));
                    }
                })
            },
        );
    }

    group.finish();
}

fn bench_heartbeat_decide(c: &mut Criterion) {
    let policy = HeartbeatPolicy {
        interval: Duration::from_secs(10),
        timeout: Duration::from_secs(30),
        tick: Duration::from_millis(100),
    };

    c.bench_function("heartbeat_decide", |b| {
        b.iter(|| {
            for secs in [0u64, 5, 10, 25, 31] {
                black_box(decide(Duration::from_secs(black_box(secs)), &policy));
            }
        })
    });
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");

    let inbound = r#"{"type":"message","session_type":"single","target_id":42,"content":"see you at noon"}"#;
    group.bench_function("parse_client_message", |b| {
        b.iter(|| ClientFrame::parse(black_box(inbound)))
    });

    let frame = ServerFrame::Message(ChatMessage::new(
        7,
        SessionType::Group,
        500,
        "x".repeat(256),
    ));
    group.bench_function("encode_server_message", |b| b.iter(|| black_box(&frame).encode()));

    let envelope = frame.encode();
    group.bench_function("push_request_roundtrip", |b| {
        b.iter(|| {
            let request = PushRequest::new(chatmesh_backend::connection::ConnectionId(1), &envelope);
            request.envelope()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_wheel_schedule_and_expire,
    bench_heartbeat_decide,
    bench_frames,
);
criterion_main!(benches);
