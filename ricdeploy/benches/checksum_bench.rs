//! Benchmarks for artifact digests.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ricdeploy::checksum::{ChecksumVerifier, DigestAlgorithm};

fn checksum_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");
    for size in [4 * 1024, 1024 * 1024] {
        let bytes = vec![0x5a_u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        for algorithm in [DigestAlgorithm::Sha256, DigestAlgorithm::Md5] {
            let verifier = ChecksumVerifier::new(algorithm);
            group.bench_with_input(BenchmarkId::new(algorithm.to_string(), size), &bytes, |b, bytes| {
                b.iter(|| black_box(verifier.digest(bytes)));
            });
        }
    }
    group.finish();

    let source = vec![0x5a_u8; 64 * 1024];
    let dest = source.clone();
    let verifier = ChecksumVerifier::new(DigestAlgorithm::Sha256);
    c.bench_function("verify_64k", |b| {
        b.iter(|| black_box(verifier.verify(&source, &dest).is_match()));
    });
}

criterion_group!(benches, checksum_benchmark);
criterion_main!(benches);
