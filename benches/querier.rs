// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use criterion::{
    black_box,
    criterion_group,
    criterion_main,
    BenchmarkId,
    Criterion,
    Throughput,
};
use rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use tempfile::TempDir;
use trident::{
    DiffKind,
    Kb,
    KbBuilder,
    KbConfig,
    PairItr,
    PairItrExt,
    Permutation,
};

static N_TRIPLES: usize = 200_000;
static N_SUBJECTS: u64 = 20_000;
static N_PREDICATES: u64 = 50;

fn build_kb(updates: bool) -> (TempDir, Kb) {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = SmallRng::seed_from_u64(42);
    let mut builder = KbBuilder::new(dir.path(), KbConfig::for_writing()).unwrap();
    for _ in 0..N_TRIPLES {
        let s = rng.gen_range(0..N_SUBJECTS);
        let p = N_SUBJECTS + rng.gen_range(0..N_PREDICATES);
        let o = rng.gen_range(0..N_SUBJECTS);
        builder.add_triple(s, p, o).unwrap();
    }
    builder.build().unwrap();
    let kb = Kb::open(dir.path(), KbConfig::default()).unwrap();

    if updates {
        let added: Vec<[i64; 3]> = (0..5_000)
            .map(|_| {
                [
                    rng.gen_range(0..N_SUBJECTS) as i64,
                    (N_SUBJECTS + rng.gen_range(0..N_PREDICATES)) as i64,
                    rng.gen_range(0..N_SUBJECTS) as i64,
                ]
            })
            .collect();
        let removed: Vec<[i64; 3]> = added.iter().step_by(3).map(|t| [t[0], t[1], t[2]]).collect();
        kb.apply_update(DiffKind::Addition, added).unwrap();
        kb.apply_update(DiffKind::Deletion, removed).unwrap();
    }
    (dir, kb)
}

fn drain(itr: &mut dyn PairItr) -> u64 {
    let mut n = 0;
    while itr.has_next().unwrap() {
        itr.next().unwrap();
        n += 1;
    }
    n
}

pub fn querier_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("querier_scan");
    group.sample_size(10);
    for updates in [false, true] {
        let (_dir, kb) = build_kb(updates);
        for perm in [Permutation::Spo, Permutation::Pos, Permutation::Osp] {
            group.throughput(Throughput::Elements(N_TRIPLES as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{perm}"), if updates { "updates" } else { "base" }),
                &perm,
                |b, perm| {
                    let mut q = kb.query().unwrap();
                    b.iter(|| {
                        let mut itr = q.get(*perm, -1, -1, -1).unwrap();
                        black_box(drain(itr.as_mut()))
                    })
                },
            );
        }
    }
    group.finish();
}

pub fn querier_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("querier_lookup");
    for updates in [false, true] {
        let (_dir, kb) = build_kb(updates);
        let label = if updates { "updates" } else { "base" };
        let mut rng = SmallRng::seed_from_u64(7);

        group.bench_function(BenchmarkId::new("subject", label), |b| {
            let mut q = kb.query().unwrap();
            b.iter(|| {
                let s = rng.gen_range(0..N_SUBJECTS) as i64;
                let mut itr = q.get(Permutation::Spo, s, -1, -1).unwrap();
                black_box(drain(itr.as_mut()))
            })
        });

        group.bench_function(BenchmarkId::new("predicate_groups", label), |b| {
            let mut q = kb.query().unwrap();
            b.iter(|| {
                let p = (N_SUBJECTS + rng.gen_range(0..N_PREDICATES)) as i64;
                let mut itr = q.get(Permutation::Pos, -1, p, -1).unwrap();
                itr.ignore_second_column().unwrap();
                black_box(itr.cardinality().unwrap())
            })
        });

        group.bench_function(BenchmarkId::new("card", label), |b| {
            let mut q = kb.query().unwrap();
            b.iter(|| {
                let o = rng.gen_range(0..N_SUBJECTS) as i64;
                black_box(q.get_card(-1, -1, o).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, querier_scan, querier_lookup);
criterion_main!(benches);
