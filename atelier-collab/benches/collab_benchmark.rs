use criterion::{black_box, criterion_group, criterion_main, Criterion};
use atelier_collab::awareness::Awareness;
use atelier_collab::broadcast::BroadcastGroup;
use atelier_collab::channel::RoomFrame;
use atelier_collab::protocol;
use atelier_collab::storage::{MirrorBackend, RocksMirror, StoreConfig};
use atelier_collab::OfflineQueue;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn bench_envelope_encode(c: &mut Criterion) {
    let update = vec![0u8; 64]; // Typical small update

    c.bench_function("sync_update_encode_64B", |b| {
        b.iter(|| {
            black_box(protocol::encode_sync(black_box(&update)));
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = protocol::encode_sync(&vec![0u8; 64]);

    c.bench_function("sync_update_decode_64B", |b| {
        b.iter(|| {
            black_box(protocol::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let mut remote = Awareness::new(2);
    remote.set_local_state(Some(json!({ "name": "bench", "cursor": [120.5, 80.25] })));
    let frame = protocol::encode_awareness(remote.encode_update(&[2]));

    c.bench_function("awareness_decode_apply", |b| {
        b.iter(|| {
            let mut local = Awareness::new(1);
            if let protocol::Message::Awareness(update) = protocol::decode(black_box(&frame)).unwrap() {
                black_box(local.apply_update(update).unwrap());
            }
        })
    });
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048, None);

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_peer("bench", Uuid::new_v4()).await.unwrap());
                }

                let from = Uuid::new_v4();
                for i in 0..1000u64 {
                    let frame = RoomFrame {
                        from,
                        payload: Arc::new(vec![i as u8; 64]),
                    };
                    group.broadcast(black_box(frame));
                }
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_enqueue_drain", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000u32 {
                queue.enqueue(black_box(i.to_le_bytes().to_vec()));
            }
            black_box(queue.drain());
        })
    });
}

fn bench_mirror_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mirror = RocksMirror::open(StoreConfig::for_testing(dir.path())).unwrap();
    let update = vec![7u8; 256];

    c.bench_function("mirror_append_256B", |b| {
        b.iter(|| {
            black_box(mirror.append("bench", black_box(&update)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_awareness_apply,
    bench_broadcast,
    bench_offline_queue,
    bench_mirror_append,
);
criterion_main!(benches);
