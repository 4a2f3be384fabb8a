//! Benchmarks for the reassembly engine.
//!
//! Run with: cargo bench --bench defrag

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use frag6::{FragmentList, Ipv6Defrag, IPV6_HEADER_LEN};

fn make_header(src_last: u8, dst_last: u8) -> Vec<u8> {
    let mut header = vec![0u8; IPV6_HEADER_LEN];
    header[0] = 0x60;
    header[6] = 44;
    header[7] = 64;
    header[23] = src_last;
    header[39] = dst_last;
    header
}

fn make_engine() -> Ipv6Defrag {
    let defrag = Ipv6Defrag::new(4096).expect("nonzero table size");
    defrag.set_enforce_minimum_mtu(false);
    defrag
}

// ===== FragmentList Benchmarks =====

fn bench_fragment_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragment_insert");

    let payload = [0x41u8; 128];

    group.bench_function("in_order_16", |b| {
        b.iter(|| {
            let mut list = FragmentList::new();
            for i in 0..16u16 {
                let offset = i * 128;
                list.insert(black_box(&payload), offset, offset + 128);
            }
            list
        })
    });

    group.bench_function("reverse_order_16", |b| {
        b.iter(|| {
            let mut list = FragmentList::new();
            for i in (0..16u16).rev() {
                let offset = i * 128;
                list.insert(black_box(&payload), offset, offset + 128);
            }
            list
        })
    });

    group.finish();
}

// ===== Engine Benchmarks =====

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");

    let header = make_header(1, 2);
    let payload = [0x41u8; 512];

    for fragments in [2u16, 8, 32] {
        group.bench_with_input(
            BenchmarkId::new("datagram", fragments),
            &fragments,
            |b, &fragments| {
                b.iter(|| {
                    let defrag = make_engine();
                    let mut out = None;
                    for i in 0..fragments {
                        out = defrag.manage_fragment(
                            black_box(&header),
                            black_box(&payload[..]),
                            i * 512,
                            i + 1 != fragments,
                            7,
                            6,
                            0,
                        );
                    }
                    out.expect("datagram completes on the last fragment")
                })
            },
        );
    }

    group.finish();
}

// Steady-state: many sources in flight, fragments landing round-robin.
fn bench_interleaved_sources(c: &mut Criterion) {
    let mut group = c.benchmark_group("interleaved_sources");

    let headers: Vec<Vec<u8>> = (0..64u8).map(|i| make_header(i, 2)).collect();
    let payload = [0x41u8; 512];

    group.bench_function("64_sources", |b| {
        b.iter(|| {
            let defrag = make_engine();
            for half in 0..2u16 {
                for header in &headers {
                    let _ = defrag.manage_fragment(
                        black_box(header),
                        black_box(&payload[..]),
                        half * 512,
                        half == 0,
                        7,
                        6,
                        0,
                    );
                }
            }
            defrag.used_memory()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fragment_insert,
    bench_reassembly,
    bench_interleaved_sources
);
criterion_main!(benches);
