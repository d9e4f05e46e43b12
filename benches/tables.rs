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
    config::THRESHOLD_TO_OFFLOAD,
    itr::TableItr,
    table::{
        inserter::inserter_for,
        storage::TableStorage,
        strategy::{
            StorageStrat,
            TableLayout,
        },
    },
    KbConfig,
    PairItr,
    PairItrExt,
};

static SIZES: [usize; 3] = [1_000, 10_000, 100_000];
static LAYOUTS: [TableLayout; 3] = [TableLayout::Row, TableLayout::Cluster, TableLayout::Column];

/// A table of `n` sorted pairs spread over roughly `n / 16` groups.
fn pairs(n: usize) -> Vec<(u64, u64)> {
    let mut rng = SmallRng::seed_from_u64(n as u64);
    let mut out: Vec<(u64, u64)> = (0..n)
        .map(|_| (rng.gen_range(0..(n as u64 / 16).max(1)), rng.gen_range(0..1 << 30)))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

struct Written {
    _dir: TempDir,
    storage: TableStorage,
    strat: StorageStrat,
    file: u16,
    mark: u64,
    len: usize,
}

fn write_table(layout: TableLayout, pairs: &[(u64, u64)]) -> Written {
    let dir = tempfile::tempdir().unwrap();
    let strat = StorageStrat::with_layout(layout, pairs).unwrap();
    let writer = TableStorage::open(dir.path(), &KbConfig::for_writing()).unwrap();
    let inserter = inserter_for(strat, THRESHOLD_TO_OFFLOAD, dir.path().to_path_buf());
    let (file, mark) = writer.start_append(7, strat, inserter).unwrap();
    for (v1, v2) in pairs {
        writer.append(*v1, *v2).unwrap();
    }
    writer.stop_append().unwrap();
    writer.stop_insert().unwrap();
    drop(writer);

    let storage = TableStorage::open(dir.path(), &KbConfig::default()).unwrap();
    Written {
        _dir: dir,
        storage,
        strat,
        file,
        mark,
        len: pairs.len(),
    }
}

fn open(w: &Written) -> TableItr {
    let data = w.storage.get_table(w.file, w.mark, None).unwrap();
    TableItr::new(data, w.strat, 7).unwrap()
}

pub fn table_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_scan");
    for size in SIZES.iter() {
        let data = pairs(*size);
        for layout in LAYOUTS.iter() {
            let written = write_table(*layout, &data);
            group.throughput(Throughput::Elements(written.len as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{layout:?}"), size),
                &written,
                |b, w| {
                    b.iter(|| {
                        let mut itr = open(w);
                        let mut sum = 0i64;
                        while itr.has_next().unwrap() {
                            itr.next().unwrap();
                            sum = sum.wrapping_add(itr.value2());
                        }
                        black_box(sum)
                    })
                },
            );
        }
    }
    group.finish();
}

pub fn table_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_seek");
    for size in SIZES.iter() {
        let data = pairs(*size);
        let targets: Vec<(u64, u64)> = data.iter().step_by(97).copied().collect();
        for layout in LAYOUTS.iter() {
            let written = write_table(*layout, &data);
            group.bench_with_input(
                BenchmarkId::new(format!("{layout:?}"), size),
                &written,
                |b, w| {
                    b.iter(|| {
                        let mut itr = open(w);
                        for (v1, v2) in targets.iter() {
                            itr.moveto(*v1 as i64, *v2 as i64).unwrap();
                            if itr.has_next().unwrap() {
                                itr.next().unwrap();
                            }
                        }
                        black_box(itr.value1())
                    })
                },
            );
        }
    }
    group.finish();
}

pub fn table_groups(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_groups");
    let data = pairs(SIZES[1]);
    for layout in LAYOUTS.iter() {
        let written = write_table(*layout, &data);
        group.bench_function(format!("{layout:?}"), |b| {
            b.iter(|| {
                let mut itr = open(&written);
                itr.ignore_second_column().unwrap();
                black_box(itr.cardinality().unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, table_scan, table_seek, table_groups);
criterion_main!(benches);
