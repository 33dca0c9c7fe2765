use criterion::{black_box, criterion_group, criterion_main, Criterion};
use protoclust::{ClusterConfig, Clusterer, ParamDesc, ProtoStyle};
use rand::prelude::*;

fn bench_cluster_samples(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_samples");

    // Generate synthetic data: four gaussian-ish blobs in four dimensions.
    let mut rng = StdRng::seed_from_u64(42);
    let n = 600;
    let d = 4;
    let data: Vec<Vec<f32>> = (0..n)
        .map(|i| {
            let center = 0.2 + 0.2 * (i % 4) as f32;
            (0..d)
                .map(|_| center + 0.03 * (rng.random::<f32>() - 0.5))
                .collect()
        })
        .collect();

    let config = ClusterConfig {
        proto_style: ProtoStyle::Elliptical,
        min_samples: 0.0,
        max_illegal: 1.0,
        independence: 1.0,
        confidence: 0.001,
    };

    group.bench_function("tree_and_prototypes_n600_d4", |b| {
        b.iter(|| {
            let mut clusterer =
                Clusterer::new((0..d).map(|_| ParamDesc::linear(0.0, 1.0)).collect());
            for (i, point) in data.iter().enumerate() {
                clusterer.add_sample(point, i as u32).unwrap();
            }
            black_box(clusterer.cluster_samples(black_box(&config)));
        })
    });

    group.finish();
}

criterion_group!(benches, bench_cluster_samples);
criterion_main!(benches);
