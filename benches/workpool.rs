use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use skelter::frame::BbFrame;
use skelter::pool::Workpool;

fn bench(c: &mut Criterion) {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let bounds: Vec<i64> = (0..4096).map(|_| rng.i64(0..1_000_000)).collect();

    c.bench_function("workpool_insert_pop_4096", |b| {
        b.iter(|| {
            let mut pool = Workpool::new();

            for (id, &bound) in bounds.iter().enumerate() {
                pool.insert(
                    BbFrame::new(id as i64, -1, 0, black_box(bound)),
                    |a, b| a < b,
                );
            }

            while !pool.is_empty() {
                let _ = black_box(pool.pop(|a, b| a < b).unwrap());
            }
        })
    });
}

criterion_group!(benches, bench);
criterion_main!(benches);
