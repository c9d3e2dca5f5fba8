//! Property-based tests for space budgeting
//!
//! Reservations must be conserved: whatever is reserved and later released
//! leaves no growth behind except the index growth waiting for a commit,
//! and an admitted reservation always fits the space that is available.

use flashlog::core::budget::{Budget, Reclaim};
use flashlog::core::ledger::{Ledger, LedgerGeometry};
use flashlog::{BudgetRequest, Config, LedgerStats, MemDevice, MountMode, Result, StorageError, Store};
use proptest::prelude::*;
use std::cell::Cell;
use std::sync::Arc;

/// Space that never changes, with a reclamation ladder that finds nothing
struct Fixed {
    stats: LedgerStats,
    attempts: Cell<u32>,
}

impl Reclaim for Fixed {
    fn space(&self) -> LedgerStats {
        self.stats
    }

    fn writeback(&self) -> Result<bool> {
        self.attempts.set(self.attempts.get() + 1);
        Ok(false)
    }

    fn gc_one(&self) -> Result<bool> {
        Ok(false)
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Op {
    Reserve(BudgetRequest),
    Release(usize),
}

fn request() -> impl Strategy<Value = BudgetRequest> {
    (0..4u32, 0..24_000u64, 0..8_000u64, any::<bool>()).prop_map(|(entries, data, dirtied, fast)| {
        let req = BudgetRequest::new(entries, data, dirtied);
        if fast {
            req.fast()
        } else {
            req
        }
    })
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => request().prop_map(Op::Reserve),
        2 => any::<usize>().prop_map(Op::Release),
    ]
}

fn fresh_space(config: &Config) -> Fixed {
    Fixed {
        stats: Ledger::format(LedgerGeometry::from_config(config)).stats(),
        attempts: Cell::new(0),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_reservations_are_conserved(ops in prop::collection::vec(op_strategy(), 1..100)) {
        let config = Config::small(4096, 64);
        let budget = Budget::new(&config, 0);
        let space = fresh_space(&config);
        let mut held: Vec<BudgetRequest> = Vec::new();
        let mut released_idx = 0u64;

        for op in ops {
            match op {
                Op::Reserve(req) => match budget.reserve(&req, &space) {
                    Ok(()) => {
                        let snap = budget.snapshot();
                        prop_assert!(snap.data_growth + snap.dd_growth <= budget.available_space(&space.stats));
                        held.push(req);
                    }
                    Err(StorageError::NoSpace) => {
                        prop_assert!(!req.is_empty());
                        if !req.fast {
                            prop_assert!(budget.is_nospace());
                        }
                    }
                    Err(e) => panic!("unexpected error {}", e),
                },
                Op::Release(i) if !held.is_empty() => {
                    let req = held.swap_remove(i % held.len());
                    budget.release(&req);
                    released_idx += budget.idx_growth(&req);
                    prop_assert!(!budget.is_nospace());
                }
                Op::Release(_) => {}
            }
        }

        for req in held.drain(..) {
            released_idx += budget.idx_growth(&req);
            budget.release(&req);
        }
        let snap = budget.snapshot();
        prop_assert_eq!(snap.idx_growth, 0);
        prop_assert_eq!(snap.data_growth, 0);
        prop_assert_eq!(snap.dd_growth, 0);
        prop_assert_eq!(snap.uncommitted_idx, released_idx);
    }

    #[test]
    fn prop_commit_consumes_uncommitted_growth(entries in prop::collection::vec(1..8u32, 1..40)) {
        let config = Config::small(4096, 64);
        let budget = Budget::new(&config, 0);
        let space = fresh_space(&config);
        let mut growth = 0;
        for n in &entries {
            let req = BudgetRequest::new(*n, 64, 0);
            budget.reserve(&req, &space).unwrap();
            budget.release(&req);
            growth += budget.idx_growth(&req);
        }
        prop_assert_eq!(budget.uncommitted_idx(), growth);

        budget.commit_done(4096, growth);
        let snap = budget.snapshot();
        prop_assert_eq!(snap.uncommitted_idx, 0);
        prop_assert_eq!(snap.old_idx_size, 4096);
    }
}

#[test]
fn test_oversized_request_climbs_the_ladder() {
    let config = Config::small(4096, 16);
    let budget = Budget::new(&config, 0);
    let space = fresh_space(&config);

    let req = BudgetRequest::new(1, config.main_bytes(), 0);
    assert!(matches!(budget.reserve(&req, &space), Err(StorageError::NoSpace)));
    assert_eq!(space.attempts.get(), config.budget_retries);
    assert!(budget.is_nospace());

    space.attempts.set(0);
    assert!(budget.reserve(&req.fast(), &space).is_err());
    assert_eq!(space.attempts.get(), 0);
}

#[test]
fn test_store_budget_round_trip() {
    let config = Config::small(4096, 16);
    let dev = Arc::new(MemDevice::for_config(&config));
    Store::format(&*dev, &config).unwrap();
    let store = Store::mount(dev, config.clone(), MountMode::ReadWrite).unwrap();

    let before = store.budget_snapshot();
    let available = store.available_space();
    let req = BudgetRequest::new(2, 1000, 500);
    store.reserve_budget(&req).unwrap();
    let during = store.budget_snapshot();
    assert_eq!(during.data_growth, before.data_growth + req.new_data);
    assert_eq!(during.dd_growth, before.dd_growth + req.dirtied);
    store.release_budget(&req);
    let after = store.budget_snapshot();
    assert_eq!(after.data_growth, before.data_growth);
    assert_eq!(after.dd_growth, before.dd_growth);
    assert_eq!(after.idx_growth, before.idx_growth);
    assert!(after.uncommitted_idx > before.uncommitted_idx);
    assert!(store.available_space() <= available);

    let too_big = BudgetRequest::new(0, config.main_bytes(), 0);
    assert!(matches!(store.reserve_budget(&too_big), Err(StorageError::NoSpace)));
    // Running out of space is not a failure of the volume
    assert!(!store.is_read_only());
    store.write_data(3, 0, b"still writable").unwrap();
}
