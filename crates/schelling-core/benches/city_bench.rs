use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use schelling_core::{City, SchellingConfig};
use std::time::Duration;

fn bench_city_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("city_step");
    let samples: usize = std::env::var("SCHELLING_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    group.sample_size(samples);
    group.measurement_time(Duration::from_secs(10));
    let steps: usize = std::env::var("SCHELLING_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(16);

    for &houses in &[2_500_usize, 10_000, 40_000] {
        group.bench_function(format!("steps{steps}_houses{houses}"), |b| {
            b.iter_batched(
                || {
                    let config = SchellingConfig {
                        population_size: houses,
                        similarity_threshold: 0.5,
                        rng_seed: Some(0xBEEF),
                        history_capacity: 1,
                        ..SchellingConfig::default()
                    };
                    City::new(config).expect("city")
                },
                |mut city| {
                    for _ in 0..steps {
                        city.step().expect("step");
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_city_steps);
criterion_main!(benches);
