// Admission-path benchmarks.
//
// Covers challenge solving at a few difficulties, proof verification, and
// the sign/verify pair every handshake and join request pays for.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use dedi_protocol::crypto::kms::{sign_payload, verify_payload, Kms, MemoryKms};
use dedi_protocol::crypto::pow::{PowSolver, Sha256Solver};

const PREFIX: &[u8] = b"dfe041b4f60cb54d082e542b109e392a";

fn bench_solve(c: &mut Criterion) {
    let solver = Sha256Solver::new();
    let mut group = c.benchmark_group("pow/solve");
    group.sample_size(10);

    for difficulty in [8u32, 12, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(difficulty),
            &difficulty,
            |b, &difficulty| {
                b.iter(|| solver.solve(PREFIX, difficulty).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let solver = Sha256Solver::new();
    let nonce = solver.solve(PREFIX, 16).unwrap();

    c.bench_function("pow/verify", |b| {
        b.iter(|| solver.verify(PREFIX, &nonce, 16));
    });
}

fn bench_sign_verify(c: &mut Criterion) {
    let kms = MemoryKms::generate();
    let payload = ("network-1", "http://10.0.0.7:8720", 1_760_000_000_000i64);
    let signature = sign_payload(&kms, &payload).unwrap();
    let public_key = kms.public_key();

    c.bench_function("kms/sign_payload", |b| {
        b.iter(|| sign_payload(&kms, &payload).unwrap());
    });
    c.bench_function("kms/verify_payload", |b| {
        b.iter(|| verify_payload(&kms, &payload, &signature, &public_key));
    });
}

criterion_group!(benches, bench_solve, bench_verify, bench_sign_verify);
criterion_main!(benches);
