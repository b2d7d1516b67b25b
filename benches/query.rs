//! Benchmarks for index construction and query throughput.
//!
//! Synthetic descriptors only; absolute numbers depend heavily on how
//! clustered real descriptors are, so treat these as regression guards
//! rather than end-to-end figures.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use retina::{BuildOptions, Descriptors, IndexOptions, QueryOptions, VisualIndex};

const DIM: usize = 128;

fn random_descriptors(n: usize, seed: u64) -> Descriptors {
    let mut rng = StdRng::seed_from_u64(seed);
    let flat: Vec<u8> = (0..n * DIM).map(|_| rng.random()).collect();
    Descriptors::from_flat(flat, DIM).unwrap()
}

fn build_options() -> BuildOptions {
    BuildOptions {
        num_visual_words: 256,
        branching: 16,
        num_iterations: 8,
        seed: 42,
        ..BuildOptions::default()
    }
}

fn populated_index(num_images: usize) -> VisualIndex {
    let mut index = VisualIndex::new();
    index.build(&build_options(), &random_descriptors(2_000, 1)).unwrap();
    for image_id in 0..num_images {
        let descs = random_descriptors(200, 100 + image_id as u64);
        index
            .add(&IndexOptions::default(), image_id as u32, None, &descs)
            .unwrap();
    }
    index.prepare().unwrap();
    index
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(10);

    for &n in &[1_000usize, 4_000] {
        let training = random_descriptors(n, 7);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &training, |b, training| {
            b.iter(|| {
                let mut index = VisualIndex::new();
                index.build(&build_options(), black_box(training)).unwrap();
                index
            });
        });
    }
    group.finish();
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");
    group.sample_size(20);

    let mut index = VisualIndex::new();
    index.build(&build_options(), &random_descriptors(2_000, 1)).unwrap();
    let descs = random_descriptors(200, 9);

    let mut next_id = 0u32;
    group.throughput(Throughput::Elements(descs.len() as u64));
    group.bench_function("200_descriptors", |b| {
        b.iter(|| {
            index
                .add(&IndexOptions::default(), next_id, None, black_box(&descs))
                .unwrap();
            next_id += 1;
        });
    });
    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");
    group.sample_size(20);

    let query = random_descriptors(200, 11);
    for &num_images in &[10usize, 50] {
        let index = populated_index(num_images);
        group.throughput(Throughput::Elements(query.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_images),
            &index,
            |b, index| {
                b.iter(|| index.query(&QueryOptions::default(), black_box(&query)).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_build, bench_add, bench_query);
criterion_main!(benches);
