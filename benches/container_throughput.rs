//! Container Throughput Benchmarks
//!
//! Encryption and decryption throughput of the segmented container format,
//! plus the SHA-256 part checksum the uploader computes per part.
//!
//! Run with: `cargo bench --bench container_throughput`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use grz_pipeline::crypt::{decrypt_stream, encrypt_stream, RecipientSecretKey};
use grz_pipeline::progress::sha256_base64;

const SIZES: [usize; 3] = [64 * 1024, 1024 * 1024, 8 * 1024 * 1024];

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn bench_encrypt(c: &mut Criterion) {
    let secret = RecipientSecretKey::generate();
    let recipient = secret.public_key();

    let mut group = c.benchmark_group("encrypt");
    group.measurement_time(Duration::from_secs(10));

    for size in SIZES {
        let data = sample(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                let mut out = Vec::with_capacity(size + size / 1024 + 256);
                encrypt_stream(&mut data.as_slice(), &mut out, data.len() as u64, &recipient).unwrap();
                black_box(out)
            });
        });
    }

    group.finish();
}

fn bench_decrypt(c: &mut Criterion) {
    let secret = RecipientSecretKey::generate();
    let recipient = secret.public_key();

    let mut group = c.benchmark_group("decrypt");
    group.measurement_time(Duration::from_secs(10));

    for size in SIZES {
        let data = sample(size);
        let mut container = Vec::new();
        encrypt_stream(&mut data.as_slice(), &mut container, size as u64, &recipient).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &container, |b, container| {
            b.iter(|| {
                let mut out = Vec::with_capacity(size);
                decrypt_stream(&mut container.as_slice(), &mut out, &secret).unwrap();
                black_box(out)
            });
        });
    }

    group.finish();
}

fn bench_part_checksum(c: &mut Criterion) {
    let part = sample(5 * 1024 * 1024);

    let mut group = c.benchmark_group("part_checksum");
    group.throughput(Throughput::Bytes(part.len() as u64));
    group.bench_function("sha256_base64/5MiB", |b| {
        b.iter(|| black_box(sha256_base64(black_box(&part))))
    });
    group.finish();
}

criterion_group!(benches, bench_encrypt, bench_decrypt, bench_part_checksum);
criterion_main!(benches);
