use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

// Import from the sfu library
use sfu::broadcaster::ForwardedTrack;
use sfu::id_types::{RoomId, UserId};
use sfu::media_setup::MediaSetup;
use sfu::registry::RoomRegistry;

// 1. Benchmark Packet Cloning (Hot Path Simulation)
// Simulates the cost of cloning a packet for each subscriber
fn bench_packet_cloning(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_operations");

    // Create a typical video packet (approx 1200 bytes)
    let payload = vec![0u8; 1200];
    let packet = Packet {
        header: Header {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type: 96,
            sequence_number: 1234,
            timestamp: 987654321,
            ssrc: 11223344,
            ..Default::default()
        },
        payload: Bytes::from(payload),
    };

    group.bench_function("clone_packet", |b| {
        b.iter(|| {
            let _ = packet.clone();
        })
    });

    group.finish();
}

// 2. Benchmark Arc vs String Cloning (Optimization Candidate)
// Validates whether switching to Arc<str> assumes significant savings
fn bench_string_cloning(c: &mut Criterion) {
    let mut group = c.benchmark_group("string_vs_arc");
    // Typical User ID length
    let user_id = "user_123456789_abcdef_long_string";

    group.bench_function("clone_string", |b| {
        let s = user_id.to_string();
        b.iter(|| {
            let _ = s.clone();
        })
    });

    group.bench_function("clone_arc_str", |b| {
        let s: Arc<str> = Arc::from(user_id);
        b.iter(|| {
            let _ = s.clone();
        })
    });

    group.finish();
}

async fn forwarded_track_with_writers(rt: &Runtime, count: usize) -> Arc<ForwardedTrack> {
    let api = MediaSetup::create_webrtc_api();
    let config = MediaSetup::get_rtc_config();
    let pc = rt.block_on(api.new_peer_connection(config)).unwrap();
    let forwarded = Arc::new(ForwardedTrack::new(
        "video",
        Default::default(),
        Arc::new(pc),
        12345,
    ));
    for i in 0..count {
        let local = Arc::new(TrackLocalStaticRTP::new(
            Default::default(),
            format!("track-{}", i),
            format!("stream-{}", i),
        ));
        forwarded
            .add_writer(UserId::from(format!("subscriber-{}", i)), local)
            .await;
    }
    forwarded
}

// 3. Benchmark Forwarded-Track Fan-Out (Async Hot Path)
// Measures the broadcast loop with 100 subscribers
fn bench_broadcast_loop(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let forwarded = rt.block_on(forwarded_track_with_writers(&rt, 100));

    let packet = Packet {
        header: Header {
            ssrc: 12345,
            ..Default::default()
        },
        payload: Bytes::from(vec![0u8; 1200]),
    };

    let mut group = c.benchmark_group("forwarded_track");
    group.bench_function("broadcast_100_subscribers", |b| {
        b.to_async(&rt).iter(|| {
            let packet = packet.clone();
            let forwarded = forwarded.clone();
            async move {
                forwarded.broadcast(packet).await;
            }
        })
    });

    group.finish();
}

// 4. Benchmark Room Registry (State Operations)
// Measures the performance of concurrent room lookup/creation (DashMap)
fn bench_room_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("room_registry");

    group.bench_function("get_or_create_existing", |b| {
        let registry = RoomRegistry::new();
        let room_id = RoomId::from("bench_room");
        registry.get_or_create(&room_id);

        b.iter(|| {
            let _ = registry.get_or_create(&room_id);
        })
    });

    group.bench_function("get_or_create_distinct_rooms", |b| {
        let registry = RoomRegistry::new();
        let mut i = 0;
        b.iter(|| {
            i += 1;
            let room_id = RoomId::from(format!("room_{}", i % 10000));
            let _ = registry.get_or_create(&room_id);
        })
    });

    group.finish();
}

// 5. Benchmark Broadcast Scaling (Linearity Check)
fn bench_broadcast_scaling(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("broadcast_scaling");
    group.sample_size(10); // Reduce sample size for heavy tests to save time

    for subscriber_count in [500, 1000, 5000].iter() {
        group.bench_with_input(
            criterion::BenchmarkId::from_parameter(subscriber_count),
            subscriber_count,
            |b, &count| {
                let forwarded = rt.block_on(forwarded_track_with_writers(&rt, count));
                let packet = Packet {
                    header: Header {
                        ssrc: 12345,
                        ..Default::default()
                    },
                    payload: Bytes::from(vec![0u8; 1200]),
                };

                b.to_async(&rt).iter(|| {
                    let packet = packet.clone();
                    let forwarded = forwarded.clone();
                    async move {
                        forwarded.broadcast(packet).await;
                    }
                })
            },
        );
    }

    group.finish();
}

// 6. Benchmark Keyframe Request Path
// Measures the cost of the PLI send triggered on a new subscriber / packet loss
fn bench_keyframe_request(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let forwarded = rt.block_on(async {
        let api = MediaSetup::create_webrtc_api();
        let config = MediaSetup::get_rtc_config();
        let pc = api.new_peer_connection(config).await.unwrap();
        Arc::new(ForwardedTrack::new(
            "video",
            Default::default(),
            Arc::new(pc),
            12345,
        ))
    });

    let mut group = c.benchmark_group("keyframe_request");
    group.bench_function("request_keyframe", |b| {
        b.to_async(&rt).iter(|| {
            let forwarded = forwarded.clone();
            async move {
                forwarded.request_keyframe().await;
            }
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_cloning,
    bench_string_cloning,
    bench_broadcast_loop,
    bench_room_registry,
    bench_broadcast_scaling,
    bench_keyframe_request
);
criterion_main!(benches);
