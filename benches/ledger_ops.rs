//! Benchmarks for the space ledger and budget accounting

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flashlog::core::budget::{Budget, Reclaim};
use flashlog::core::ledger::{Ledger, LedgerGeometry};
use flashlog::{BudgetRequest, Config, LedgerStats, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn config(main_eus: u32) -> Config {
    Config::small(128 * 1024, main_eus)
}

/// Ledger with every unit partly written and partly dirty
fn churned(config: &Config, seed: u64) -> Ledger {
    let mut ledger = Ledger::format(LedgerGeometry::from_config(config));
    let mut rng = StdRng::seed_from_u64(seed);
    for eu in config.main_first()..config.main_first() + config.main_eus {
        let free = rng.gen_range(0..config.eu_size / 16) * 8;
        let dirty = rng.gen_range(0..(config.eu_size - free) / 8) * 8;
        ledger.change(eu, Some(free), Some(dirty), None).unwrap();
    }
    ledger
}

fn bench_ledger_change(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_change");

    for main_eus in [64u32, 1024, 4096].iter() {
        let config = config(*main_eus);
        let mut ledger = churned(&config, 1);
        let mut rng = StdRng::seed_from_u64(2);
        group.bench_with_input(BenchmarkId::from_parameter(main_eus), main_eus, |b, &main_eus| {
            b.iter(|| {
                let eu = config.main_first() + rng.gen_range(0..main_eus);
                let dirty = rng.gen_range(0..config.eu_size / 16) * 8;
                black_box(ledger.change(eu, Some(0), Some(dirty), None).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_ledger_find_dirty(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_find_dirty");

    for main_eus in [64u32, 1024, 4096].iter() {
        let config = config(*main_eus);
        let mut ledger = churned(&config, 3);
        group.bench_with_input(BenchmarkId::from_parameter(main_eus), main_eus, |b, _| {
            b.iter(|| black_box(ledger.find_dirty(config.eu_size / 4, false, &|_| false)));
        });
    }

    group.finish();
}

fn bench_ledger_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_prepare_commit");
    group.sample_size(20);

    for main_eus in [64u32, 1024].iter() {
        let config = config(*main_eus);
        group.bench_with_input(BenchmarkId::from_parameter(main_eus), main_eus, |b, _| {
            b.iter_with_setup(
                || churned(&config, 4),
                |mut ledger| {
                    let mut sqnum = 0u64;
                    let write = ledger
                        .prepare_commit(&mut || {
                            sqnum += 1;
                            sqnum
                        })
                        .unwrap();
                    black_box(write.map(|w| w.bytes.len()));
                },
            );
        });
    }

    group.finish();
}

struct Roomy(LedgerStats);

impl Reclaim for Roomy {
    fn space(&self) -> LedgerStats {
        self.0
    }

    fn writeback(&self) -> Result<bool> {
        Ok(false)
    }

    fn gc_one(&self) -> Result<bool> {
        Ok(false)
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

fn bench_budget_reserve_release(c: &mut Criterion) {
    let config = config(1024);
    let budget = Budget::new(&config, 0);
    let space = Roomy(Ledger::format(LedgerGeometry::from_config(&config)).stats());
    let req = BudgetRequest::new(1, 4096, 512);

    c.bench_function("budget_reserve_release", |b| {
        b.iter(|| {
            budget.reserve(black_box(&req), &space).unwrap();
            budget.release(&req);
        });
    });
}

criterion_group!(
    benches,
    bench_ledger_change,
    bench_ledger_find_dirty,
    bench_ledger_commit,
    bench_budget_reserve_release
);
criterion_main!(benches);
