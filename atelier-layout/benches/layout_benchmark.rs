use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use atelier_core::{CanvasItem, NewItem};
use atelier_layout::{compute_snap, DragBox};

fn scatter(n: usize) -> Vec<CanvasItem> {
    (0..n)
        .map(|i| {
            CanvasItem::from_new(
                format!("item-{i}"),
                "bench",
                &NewItem {
                    x: ((i * 37) % 4000) as f64,
                    y: ((i * 53) % 3000) as f64,
                    width: Some(120.0),
                    height: Some(80.0),
                    ..NewItem::default()
                },
            )
        })
        .collect()
}

/// Benchmark: one drag frame against N items
fn bench_compute_snap(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_snap");

    for count in [100, 1_000, 10_000] {
        let items = scatter(count);
        let dragged = DragBox {
            id: "dragged".into(),
            x: 1234.0,
            y: 987.0,
            width: 200.0,
            height: 150.0,
        };
        group.bench_with_input(BenchmarkId::from_parameter(count), &items, |b, items| {
            b.iter(|| compute_snap(black_box(&dragged), black_box(items), 5.0, 1.0));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compute_snap);
criterion_main!(benches);
