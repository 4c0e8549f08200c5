#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Barrier;
use std::thread;

use gbptree::primitives::pager::Unlimited;
use gbptree::{CollectingVisitor, GbpTree, GbpTreeOptions, Result};
use tempfile::tempdir;

const READERS: usize = 4;
const KEYS: u64 = 3_000;
const BATCH: u64 = 25;
/// Keys at or above this are churned by the writer and ignored by readers.
const SCRATCH: u64 = 1_000_000;

fn open(dir: &std::path::Path) -> Result<GbpTree<u64, u64>> {
    GbpTree::open(
        dir.join("concurrent.gbpt"),
        GbpTreeOptions {
            page_size: Some(512),
            ..GbpTreeOptions::default()
        },
    )
}

/// Readers must always see sorted, duplicate-free results that include every
/// key published before their seek started.
#[test]
fn seeks_see_a_consistent_view_while_writing() -> Result<()> {
    let dir = tempdir()?;
    let tree = open(dir.path())?;
    let published = AtomicU64::new(0);
    let done = AtomicBool::new(false);
    let barrier = Barrier::new(READERS + 1);

    thread::scope(|scope| -> Result<()> {
        let mut readers = Vec::new();
        for _ in 0..READERS {
            readers.push(scope.spawn(|| -> Result<u64> {
                barrier.wait();
                let mut scans = 0u64;
                while !done.load(Ordering::Acquire) || scans == 0 {
                    let floor = published.load(Ordering::Acquire);
                    let mut cursor = tree.seek(&0, &SCRATCH)?;
                    let mut expected = 0u64;
                    while cursor.next()? {
                        let key = *cursor.key().expect("positioned cursor has a key");
                        assert_eq!(key, expected, "gap or duplicate in ascending scan");
                        assert_eq!(cursor.value(), Some(&(key * 7)));
                        expected += 1;
                    }
                    assert!(expected >= floor, "saw {expected} keys, {floor} were published");
                    scans += 1;
                }
                Ok(scans)
            }));
        }

        barrier.wait();
        let mut next = 0u64;
        while next < KEYS {
            {
                let mut writer = tree.writer()?;
                for key in next..next + BATCH {
                    writer.put(&key, &(key * 7))?;
                    writer.put(&(SCRATCH + key), &key)?;
                }
                for key in next..next + BATCH {
                    writer.remove(&(SCRATCH + key))?;
                }
            }
            next += BATCH;
            published.store(next, Ordering::Release);
            if next % (BATCH * 20) == 0 {
                tree.checkpoint(&Unlimited, None)?;
            }
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            let scans = reader.join().expect("reader panicked")?;
            assert!(scans > 0);
        }
        Ok(())
    })?;

    let mut visitor = CollectingVisitor::default();
    let summary = tree.consistency_check(&mut visitor)?;
    assert!(visitor.findings.is_empty(), "{:?}", visitor.findings);
    assert_eq!(summary.entries, KEYS);
    Ok(())
}

#[test]
fn descending_seeks_during_writes() -> Result<()> {
    let dir = tempdir()?;
    let tree = open(dir.path())?;
    {
        let mut writer = tree.writer()?;
        for key in (0..KEYS).step_by(2) {
            writer.put(&key, &(key * 7))?;
        }
    }
    tree.checkpoint(&Unlimited, None)?;
    let done = AtomicBool::new(false);

    thread::scope(|scope| -> Result<()> {
        let reader = scope.spawn(|| -> Result<()> {
            while !done.load(Ordering::Acquire) {
                let mut cursor = tree.seek(&KEYS, &0)?;
                let mut last = u64::MAX;
                let mut evens = 0u64;
                while cursor.next()? {
                    let key = *cursor.key().expect("positioned cursor has a key");
                    assert!(key < last, "descending scan went backwards");
                    last = key;
                    if key % 2 == 0 {
                        evens += 1;
                    }
                }
                // Even keys other than 0 are never touched by the writer.
                assert_eq!(evens, KEYS / 2 - 1);
            }
            Ok(())
        });

        for key in (1..KEYS).step_by(2) {
            tree.writer()?.put(&key, &(key * 7))?;
        }
        for key in (1..KEYS).step_by(4) {
            tree.writer()?.remove(&key)?;
        }
        done.store(true, Ordering::Release);
        reader.join().expect("reader panicked")
    })?;

    let keys: Vec<u64> = tree
        .seek(&0, &KEYS)?
        .entries()
        .map(|entry| entry.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    let expected: Vec<u64> = (0..KEYS).filter(|k| k % 2 == 0 || k % 4 == 3).collect();
    assert_eq!(keys, expected);
    Ok(())
}
