#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use graphcounts::storage::{
    node_key, CountUpdater, CountsKey, CountsStore, CountsStoreOptions, Rebuilder,
};
use graphcounts::types::{Result, TxId};
use tempfile::tempdir;

struct Baseline(Vec<(CountsKey, i64)>);

impl Rebuilder for Baseline {
    fn last_committed_tx_id(&self) -> TxId {
        TxId(1)
    }

    fn rebuild(&self, updater: &mut CountUpdater<'_>) -> Result<()> {
        for (key, count) in &self.0 {
            updater.increment(key, *count)?;
        }
        Ok(())
    }
}

fn started_store(dir: &tempfile::TempDir, baseline: &[(CountsKey, i64)]) -> Result<Arc<CountsStore>> {
    let store = CountsStore::open(
        dir.path().join("counts.db"),
        CountsStoreOptions::default().sync_on_checkpoint(false),
    )?;
    store.start(&Baseline(baseline.to_vec()))?;
    Ok(Arc::new(store))
}

#[test]
fn checkpoint_waits_for_open_updaters_and_holds_back_new_ones() -> Result<()> {
    let dir = tempdir()?;
    let store = started_store(&dir, &[(node_key(1), 10)])?;
    let key = node_key(1);

    let open_updater_closing = Arc::new(AtomicBool::new(false));
    let checkpoint_done = Arc::new(AtomicBool::new(false));
    let holding = Arc::new(Barrier::new(2));

    thread::scope(|scope| -> Result<()> {
        let holder = {
            let store = Arc::clone(&store);
            let closing = Arc::clone(&open_updater_closing);
            let holding = Arc::clone(&holding);
            scope.spawn(move || -> Result<()> {
                let mut updater = store.updater(TxId(2), true)?.expect("fresh transaction");
                updater.increment(&key, 5)?;
                holding.wait();
                thread::sleep(Duration::from_millis(150));
                closing.store(true, Ordering::SeqCst);
                updater.close()
            })
        };

        holding.wait();
        let checkpointer = {
            let store = Arc::clone(&store);
            let closing = Arc::clone(&open_updater_closing);
            let done = Arc::clone(&checkpoint_done);
            scope.spawn(move || -> Result<()> {
                let stats = store.checkpoint()?;
                assert!(closing.load(Ordering::SeqCst), "checkpoint ran past an open updater");
                assert_eq!(stats.highest_gap_free, TxId(2));
                done.store(true, Ordering::SeqCst);
                Ok(())
            })
        };

        // Give the checkpoint time to queue up behind the open updater.
        thread::sleep(Duration::from_millis(50));
        let mut late = store.updater(TxId(3), true)?.expect("fresh transaction");
        assert!(
            open_updater_closing.load(Ordering::SeqCst),
            "new updater overtook a waiting checkpoint"
        );
        // Reads never wait on the updater lock.
        assert_eq!(store.read(&key)?, 15);
        late.increment(&key, 1)?;
        late.close()?;

        holder.join().expect("holder thread")?;
        checkpointer.join().expect("checkpoint thread")?;
        Ok(())
    })?;

    assert!(checkpoint_done.load(Ordering::SeqCst));
    assert_eq!(store.read(&key)?, 16);
    assert_eq!(store.tx_id(), TxId(3));
    Ok(())
}

#[test]
fn thread_holding_an_updater_opens_another_while_checkpoint_waits() -> Result<()> {
    let dir = tempdir()?;
    let key = node_key(1);
    let store = started_store(&dir, &[(key, 1)])?;
    let (opened_tx, opened_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let holder = {
        let store = Arc::clone(&store);
        thread::spawn(move || -> Result<()> {
            let mut first = store.updater(TxId(2), true)?.expect("fresh transaction");
            first.increment(&key, 1)?;
            opened_tx.send(()).expect("report opened");
            go_rx.recv().expect("checkpoint queued");
            let mut second = store.updater(TxId(3), true)?.expect("fresh transaction");
            second.increment(&key, 1)?;
            second.close()?;
            first.close()?;
            done_tx.send(()).expect("report done");
            Ok(())
        })
    };

    opened_rx.recv().expect("first updater opened");
    let checkpointer = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.checkpoint())
    };
    // Give the checkpoint time to queue up behind the first updater.
    thread::sleep(Duration::from_millis(50));
    go_tx.send(()).expect("signal holder");

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second updater blocked behind a waiting checkpoint");
    holder.join().expect("holder thread")?;
    let stats = checkpointer.join().expect("checkpoint thread")?;
    assert_eq!(stats.highest_gap_free, TxId(3));
    assert_eq!(store.read(&key)?, 3);
    assert_eq!(store.tx_id(), TxId(3));
    Ok(())
}

#[test]
fn nested_updater_skips_cache_flush_instead_of_blocking_itself() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(CountsStore::open(
        dir.path().join("counts.db"),
        CountsStoreOptions::default()
            .sync_on_checkpoint(false)
            .max_cache_size(2),
    )?);
    store.start(&Baseline(Vec::new()))?;
    let (done_tx, done_rx) = mpsc::channel();

    let worker = {
        let store = Arc::clone(&store);
        thread::spawn(move || -> Result<()> {
            let mut outer = store.updater(TxId(2), true)?.expect("fresh transaction");
            for label in 0..3 {
                outer.increment(&node_key(label), 1)?;
            }
            // Id 10 checks the cache size, which is above the limit.
            let mut inner = store.updater(TxId(10), true)?.expect("fresh transaction");
            inner.increment(&node_key(3), 1)?;
            inner.close()?;
            outer.close()?;
            done_tx.send(()).expect("report done");
            Ok(())
        })
    };

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("nested updater waited on its own cache flush");
    worker.join().expect("worker thread")?;
    assert_eq!(store.read(&node_key(3))?, 1);
    // The next non-nested check flushes as usual.
    let mut updater = store.updater(TxId(20), true)?.expect("fresh transaction");
    updater.close()?;
    assert_eq!(store.read(&node_key(0))?, 1);
    Ok(())
}

#[test]
fn reads_stay_consistent_while_checkpoints_merge() -> Result<()> {
    let dir = tempdir()?;
    let keys: Vec<CountsKey> = (0..32).map(node_key).collect();
    let baseline: Vec<_> = keys.iter().map(|k| (*k, 100)).collect();
    let store = started_store(&dir, &baseline)?;
    let next_tx = AtomicU64::new(2);
    let writers_done = AtomicBool::new(false);

    thread::scope(|scope| {
        let mut writers = Vec::new();
        for _ in 0..4 {
            writers.push(scope.spawn(|| -> Result<()> {
                for _ in 0..200 {
                    let tx = TxId(next_tx.fetch_add(1, Ordering::SeqCst));
                    let mut updater = store.updater(tx, true)?.expect("fresh transaction");
                    // Each transaction moves one unit between a pair of keys.
                    let from = keys[(tx.0 % 32) as usize];
                    let to = keys[((tx.0 * 7) % 32) as usize];
                    updater.increment(&from, -1)?;
                    updater.increment(&to, 1)?;
                    updater.close()?;
                }
                Ok(())
            }));
        }

        let checkpointer = scope.spawn(|| -> Result<usize> {
            let mut checkpoints = 0;
            while !writers_done.load(Ordering::SeqCst) {
                store.checkpoint()?;
                checkpoints += 1;
            }
            Ok(checkpoints)
        });

        let reader = scope.spawn(|| -> Result<()> {
            while !writers_done.load(Ordering::SeqCst) {
                for key in &keys {
                    assert!(store.read(key)? >= 0);
                }
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
        reader.join().expect("reader thread").expect("reader result");
    });

    store.checkpoint()?;
    let total: i64 = keys
        .iter()
        .map(|k| store.read(k))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sum();
    assert_eq!(total, 32 * 100);
    assert_eq!(store.tx_id(), TxId(801));
    Ok(())
}
