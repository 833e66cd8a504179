use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use atelier_core::collab::{SharedDocument, UpdateOrigin};
use atelier_core::{CanvasItem, ItemPatch, NewItem};

fn test_item(n: usize) -> CanvasItem {
    CanvasItem::from_new(
        format!("item-{n}"),
        "bench-project",
        &NewItem {
            x: n as f64 * 10.0,
            y: n as f64 * 5.0,
            width: Some(50.0),
            height: Some(50.0),
            ..NewItem::default()
        },
    )
}

fn bench_local_edits(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push_item", |b| {
        // Measures appending to an ever-growing document.
        let doc = SharedDocument::new();
        let mut n = 0;
        b.iter(|| {
            doc.push_item(black_box(&test_item(n)), UpdateOrigin::Local);
            n += 1;
        })
    });

    group.bench_function("update_item_position", |b| {
        let doc = SharedDocument::new();
        for n in 0..500 {
            doc.push_item(&test_item(n), UpdateOrigin::Local);
        }
        let mut x = 0.0;
        b.iter(|| {
            x += 1.0;
            doc.update_item(black_box("item-250"), &ItemPatch::position(x, x), UpdateOrigin::Local);
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("CRDT Operations");
    group.throughput(Throughput::Elements(1));

    let source = SharedDocument::new();
    source.push_item(&test_item(0), UpdateOrigin::Local);
    let update = source.encode_state_as_update();

    group.bench_function("apply_remote_update", |b| {
        // Re-applying the same update is idempotent.
        let dest = SharedDocument::new();
        b.iter(|| {
            dest.apply_update(black_box(&update), UpdateOrigin::Remote).unwrap();
        })
    });

    group.bench_function("read_items_500", |b| {
        let doc = SharedDocument::new();
        for n in 0..500 {
            doc.push_item(&test_item(n), UpdateOrigin::Local);
        }
        b.iter(|| black_box(doc.items()))
    });

    group.finish();
}

criterion_group!(benches, bench_local_edits, bench_apply_remote);
criterion_main!(benches);
