//! Seeded concurrent workload against the counts store.
//!
//! Writers apply random deltas under interleaved checkpoints and cache flushes;
//! the final counts must equal the baseline plus every applied delta, before and
//! after a restart.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use graphcounts::storage::{
    node_key, relationship_key, CountUpdater, CounterMetrics, CountsKey, CountsStore,
    CountsStoreOptions, Rebuilder, ANY_LABEL,
};
use graphcounts::types::{Result, TxId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const SEED: u64 = 0x5EED_C0DE;
const THREADS: u64 = 4;
const TXS_PER_THREAD: usize = 150;
const BASELINE: i64 = 1_000;

struct Baseline {
    last_committed: TxId,
    counts: Vec<(CountsKey, i64)>,
}

impl Rebuilder for Baseline {
    fn last_committed_tx_id(&self) -> TxId {
        self.last_committed
    }

    fn rebuild(&self, updater: &mut CountUpdater<'_>) -> Result<()> {
        for (key, count) in &self.counts {
            updater.increment(key, *count)?;
        }
        Ok(())
    }
}

fn universe() -> Vec<CountsKey> {
    let mut keys: Vec<CountsKey> = (-1..6).map(node_key).collect();
    for start in [ANY_LABEL, 0, 1] {
        for rel_type in [ANY_LABEL, 0, 1] {
            keys.push(relationship_key(start, rel_type, ANY_LABEL));
        }
    }
    keys
}

/// Deltas of one transaction. Keys from the upper half of the universe start at
/// zero and only see a +1/-1 pair, so they always net out to absent.
fn transaction(rng: &mut ChaCha8Rng, keys: &[CountsKey]) -> Vec<(CountsKey, i64)> {
    let seeded = keys.len() / 2;
    let mut changes = Vec::new();
    for _ in 0..rng.gen_range(1..6) {
        let key = keys[rng.gen_range(0..seeded)];
        changes.push((key, rng.gen_range(-3..=3)));
    }
    let transient = keys[rng.gen_range(seeded..keys.len())];
    changes.push((transient, 1));
    changes.push((transient, -1));
    changes
}

fn run_workload(options: CountsStoreOptions) -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("counts.db");
    let keys = universe();
    let seeded = keys.len() / 2;
    let baseline = Baseline {
        last_committed: TxId(10),
        counts: keys[..seeded].iter().map(|k| (*k, BASELINE)).collect(),
    };

    let mut expected: BTreeMap<CountsKey, i64> = baseline.counts.iter().copied().collect();
    for t in 0..THREADS {
        let mut rng = ChaCha8Rng::seed_from_u64(SEED + t);
        for _ in 0..TXS_PER_THREAD {
            for (key, delta) in transaction(&mut rng, &keys) {
                *expected.entry(key).or_insert(0) += delta;
            }
        }
    }
    expected.retain(|_, count| *count != 0);

    let store = Arc::new(CountsStore::open(&path, options.clone())?);
    store.start(&baseline)?;
    let next_tx = AtomicU64::new(11);
    let writers_done = AtomicBool::new(false);

    thread::scope(|scope| {
        let writers: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = &store;
                let keys = &keys;
                let next_tx = &next_tx;
                scope.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(SEED + t);
                    for _ in 0..TXS_PER_THREAD {
                        let changes = transaction(&mut rng, keys);
                        let tx = TxId(next_tx.fetch_add(1, Ordering::SeqCst));
                        let mut updater = store.updater(tx, true)?.expect("fresh transaction");
                        for (key, delta) in &changes {
                            updater.increment(key, *delta)?;
                        }
                        updater.close()?;
                    }
                    Ok(())
                })
            })
            .collect();

        let checkpointer = scope.spawn(|| -> Result<()> {
            while !writers_done.load(Ordering::SeqCst) {
                store.checkpoint()?;
                thread::yield_now();
            }
            Ok(())
        });

        for writer in writers {
            writer.join().expect("writer thread").expect("writer result");
        }
        writers_done.store(true, Ordering::SeqCst);
        checkpointer
            .join()
            .expect("checkpoint thread")
            .expect("checkpoint result");
    });

    let last_tx = TxId(10 + THREADS * TXS_PER_THREAD as u64);
    assert_eq!(store.tx_id(), last_tx);
    assert_eq!(visit(&store)?, expected);
    store.checkpoint()?;
    assert_eq!(visit(&store)?, expected);
    for (key, count) in &expected {
        assert_eq!(store.read(key)?, *count);
    }
    store.close()?;

    let reopened = CountsStore::open(&path, options)?;
    reopened.start(&Baseline {
        last_committed: last_tx,
        counts: Vec::new(),
    })?;
    assert_eq!(visit(&reopened)?, expected);
    Ok(())
}

fn visit(store: &CountsStore) -> Result<BTreeMap<CountsKey, i64>> {
    let mut seen = BTreeMap::new();
    let mut previous: Option<CountsKey> = None;
    store.visit_all_counts(|key, count| {
        assert!(previous.map_or(true, |p| p < *key), "visit out of order");
        previous = Some(*key);
        assert_ne!(count, 0, "zero counts are not visited");
        seen.insert(*key, count);
    })?;
    Ok(seen)
}

#[test]
fn concurrent_deltas_with_checkpoints_match_baseline_plus_sum() -> Result<()> {
    run_workload(CountsStoreOptions::default().sync_on_checkpoint(false))
}

#[test]
fn concurrent_deltas_with_cache_flushes_match_baseline_plus_sum() -> Result<()> {
    run_workload(
        CountsStoreOptions::default()
            .sync_on_checkpoint(false)
            .max_cache_size(4),
    )
}

#[test]
fn oversized_cache_is_merged_without_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("counts.db");
    let metrics = Arc::new(CounterMetrics::default());
    let options = CountsStoreOptions::default()
        .max_cache_size(10)
        .metrics(metrics.clone());
    let store = CountsStore::open(&path, options)?;
    store.start(&Baseline {
        last_committed: TxId(1),
        counts: Vec::new(),
    })?;

    for tx in 2..=30u64 {
        let mut updater = store.updater(TxId(tx), true)?.expect("fresh transaction");
        for offset in 0..3 {
            updater.increment(&node_key((tx * 3 + offset) as i32), 1)?;
        }
        updater.close()?;
    }
    assert!(metrics.cache_flushes.load(Ordering::Relaxed) >= 1);
    assert_eq!(metrics.checkpoints.load(Ordering::Relaxed), 0);
    assert_eq!(store.read(&node_key(6))?, 1);
    assert_eq!(store.read(&node_key(92))?, 1);

    store.checkpoint()?;
    store.close()?;
    let reopened = CountsStore::open(&path, CountsStoreOptions::default())?;
    reopened.start(&Baseline {
        last_committed: TxId(30),
        counts: Vec::new(),
    })?;
    assert_eq!(reopened.read(&node_key(50))?, 1);
    let mut total = 0;
    reopened.visit_all_counts(|_, count| total += count)?;
    assert_eq!(total, 29 * 3);
    Ok(())
}
