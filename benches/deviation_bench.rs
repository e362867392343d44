use alloy_primitives::{I256, U256};
use criterion::{Criterion, criterion_group, criterion_main};
use feed_keeper::execution::gas_price::percentile;
use feed_keeper::logic::{deviation_percentage, median, median_timestamp};
use lazy_static::lazy_static;
use std::hint::black_box;

lazy_static! {
    static ref BEACON_VALUES: Vec<I256> = (0..21i64).map(|i| I256::try_from(1_000_000 + (i * 7_919) % 5_003).unwrap()).collect();
    static ref BEACON_TIMESTAMPS: Vec<u64> = (0..21u64).map(|i| 1_700_000_000 + (i * 97) % 300).collect();
    static ref GAS_SAMPLES: Vec<U256> = (0..900u64).map(|i| U256::from(20_000_000_000u64 + (i * 104_729) % 9_000_000_000)).collect();
}

fn benchmark_deviation(c: &mut Criterion) {
    let mut group = c.benchmark_group("deviation");

    group.bench_function("median_21_beacons", |b| b.iter(|| median(black_box(&BEACON_VALUES))));
    group.bench_function("median_timestamp_21_beacons", |b| b.iter(|| median_timestamp(black_box(&BEACON_TIMESTAMPS))));
    group.bench_function("deviation_percentage", |b| {
        let on_chain = I256::try_from(1_000_000).unwrap();
        let off_chain = I256::try_from(1_012_345).unwrap();
        b.iter(|| deviation_percentage(black_box(on_chain), black_box(off_chain), I256::ZERO))
    });
    group.finish();
}

fn benchmark_gas_percentile(c: &mut Criterion) {
    let mut group = c.benchmark_group("gas_price");
    group.sample_size(50);

    group.bench_function("percentile_80_of_900", |b| b.iter(|| percentile(80, black_box(&GAS_SAMPLES))));
    group.finish();
}

criterion_group!(benches, benchmark_deviation, benchmark_gas_percentile);
criterion_main!(benches);
