//! Performance benchmarks for datshare
//!
//! Tracks hashing throughput, full index builds, incremental updates and
//! snapshot resumes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use datshare::hasher;
use datshare::index::{ArchiveIndex, Change};
use datshare::types::{Entry, RelPath};
use datshare::walker::Walker;
use datshare::{NoopListener, ShareBuilder, DEFAULT_CONTROL_DIR};
use std::fs;
use std::hint::black_box;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Deterministic pseudo-random bytes
fn content(seed: u64, size: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..size)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn populate(root: &Path, file_count: usize) {
    for i in 0..file_count {
        let dir = root.join(format!("dir_{}", i % 16));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("file_{}.bin", i)), content(i as u64, 100 + (i * 37) % 900)).unwrap();
    }
}

/// Synthetic entries laid out like a dataset, without touching disk
fn synthetic_entries(file_count: usize) -> Vec<Entry> {
    let mut entries = Vec::with_capacity(file_count + 64);
    for d in 0..64 {
        entries.push(Entry::directory(RelPath::new(&format!("d{:02}", d)), 0));
    }
    for i in 0..file_count {
        let path = RelPath::new(&format!("d{:02}/f{:06}", i % 64, i));
        let digest = hasher::hash_bytes(&(i as u64).to_be_bytes());
        entries.push(Entry::file(path, 1 + i as u64, digest, 0));
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

/// Benchmark raw content hashing
fn bench_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashing");
    for size in [4 * 1024, 256 * 1024, 4 * 1024 * 1024].iter() {
        let data = content(*size as u64, *size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(hasher::hash_bytes(data)));
        });
    }
    group.finish();
}

/// Benchmark building an index from entries
fn bench_index_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_build");
    group.sample_size(20);
    for file_count in [1_000, 10_000, 50_000].iter() {
        let entries = synthetic_entries(*file_count);
        group.bench_with_input(BenchmarkId::from_parameter(file_count), &entries, |b, entries| {
            b.iter(|| black_box(ArchiveIndex::build(entries.iter().cloned(), &NoopListener)));
        });
    }
    group.finish();
}

/// Benchmark a single-file update against a large index
fn bench_incremental_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_update");
    for file_count in [1_000, 10_000, 50_000].iter() {
        let base = ArchiveIndex::build(synthetic_entries(*file_count), &NoopListener);
        let path = RelPath::new(&format!("d00/f{:06}", 0));
        group.bench_with_input(BenchmarkId::from_parameter(file_count), &base, |b, base| {
            b.iter_batched(
                || base.clone(),
                |mut index| {
                    let entry = Entry::file(path.clone(), 7, hasher::hash_bytes(b"changed"), 1);
                    black_box(index.apply(vec![Change::Upsert(entry)]))
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

/// Benchmark walking and hashing a real tree
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    group.measurement_time(Duration::from_secs(3));
    group.sample_size(20);
    for file_count in [100, 1_000].iter() {
        let temp_dir = TempDir::new().unwrap();
        populate(temp_dir.path(), *file_count);
        let walker = Walker::new(temp_dir.path().to_path_buf(), DEFAULT_CONTROL_DIR);
        let prior = ArchiveIndex::build(walker.scan(None).unwrap().entries, &NoopListener);

        group.bench_with_input(BenchmarkId::new("cold", file_count), &walker, |b, walker| {
            b.iter(|| black_box(walker.scan(None).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("reuse", file_count), &walker, |b, walker| {
            b.iter(|| black_box(walker.scan(Some(&prior)).unwrap()));
        });
    }
    group.finish();
}

/// Benchmark a resumed snapshot including persistence
fn bench_snapshot_resume(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_resume");
    group.measurement_time(Duration::from_secs(3));
    group.sample_size(10);
    let temp_dir = TempDir::new().unwrap();
    populate(temp_dir.path(), 500);

    group.bench_function("500_files", |b| {
        b.iter(|| {
            let outcome = ShareBuilder::new(temp_dir.path())
                .listener(Arc::new(NoopListener))
                .build()
                .unwrap()
                .snapshot()
                .unwrap();
            black_box(outcome)
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_hashing,
    bench_index_build,
    bench_incremental_update,
    bench_scan,
    bench_snapshot_resume
);
criterion_main!(benches);
