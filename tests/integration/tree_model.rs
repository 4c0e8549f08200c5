#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

use gbptree::primitives::pager::Unlimited;
use gbptree::{CollectingVisitor, GbpTree, GbpTreeOptions, Result};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn open(path: &Path, page_size: u32) -> Result<GbpTree<u64, u64>> {
    GbpTree::open(
        path,
        GbpTreeOptions {
            page_size: Some(page_size),
            ..GbpTreeOptions::default()
        },
    )
}

fn findings(tree: &GbpTree<u64, u64>) -> Result<usize> {
    let mut visitor = CollectingVisitor::default();
    tree.consistency_check(&mut visitor)?;
    if !visitor.findings.is_empty() {
        eprintln!("{:?}", visitor.findings);
    }
    Ok(visitor.findings.len())
}

#[test]
fn hundred_thousand_random_pairs_with_midpoint_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let tree = open(&dir.path().join("random.gbpt"), 8192)?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x4742_5054);
    let mut reference = BTreeMap::new();
    const PAIRS: usize = 100_000;

    let mut writer = tree.writer()?;
    for i in 0..PAIRS {
        if i == PAIRS / 2 {
            writer.close();
            tree.checkpoint(&Unlimited, None)?;
            writer = tree.writer()?;
        }
        let key: u64 = rng.gen();
        let value: u64 = rng.gen();
        writer.put(&key, &value)?;
        reference.insert(key, value);
    }
    writer.close();

    assert_eq!(findings(&tree)?, 0);
    let mut cursor = tree.seek_range(Bound::Unbounded, Bound::Unbounded)?;
    let mut expected = reference.iter();
    while cursor.next()? {
        let (key, value) = expected.next().expect("tree holds more entries than inserted");
        assert_eq!(cursor.key(), Some(key));
        assert_eq!(cursor.value(), Some(value));
    }
    assert!(expected.next().is_none());
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Put(u64, u64),
    Remove(u64),
    Checkpoint,
    Reopen,
    Crash,
    Range(u64, u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        8 => (0u64..200, any::<u64>()).prop_map(|(k, v)| Op::Put(k, v)),
        4 => (0u64..200).prop_map(Op::Remove),
        1 => Just(Op::Checkpoint),
        1 => Just(Op::Reopen),
        1 => Just(Op::Crash),
        2 => (0u64..220, 0u64..220).prop_map(|(a, b)| Op::Range(a, b)),
    ]
}

fn model_range(model: &BTreeMap<u64, u64>, from: u64, to: u64) -> Vec<(u64, u64)> {
    if from <= to {
        model.range(from..to).map(|(k, v)| (*k, *v)).collect()
    } else {
        model
            .range((Bound::Excluded(to), Bound::Included(from)))
            .rev()
            .map(|(k, v)| (*k, *v))
            .collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]
    #[test]
    fn tree_behaves_like_a_btreemap_across_restarts(
        ops in prop::collection::vec(op_strategy(), 1..150)
    ) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.gbpt");
        let mut tree = open(&path, 256).expect("open");
        let mut live = BTreeMap::new();
        let mut durable = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(key, value) => {
                    tree.writer().expect("writer").put(&key, &value).expect("put");
                    live.insert(key, value);
                }
                Op::Remove(key) => {
                    let removed = tree.writer().expect("writer").remove(&key).expect("remove");
                    prop_assert_eq!(removed, live.remove(&key));
                }
                Op::Checkpoint => {
                    tree.checkpoint(&Unlimited, None).expect("checkpoint");
                    durable = live.clone();
                }
                Op::Reopen => {
                    tree.checkpoint(&Unlimited, None).expect("checkpoint");
                    tree.close().expect("close");
                    drop(tree);
                    durable = live.clone();
                    tree = open(&path, 256).expect("reopen");
                    prop_assert!(!tree.was_dirty_on_startup());
                }
                Op::Crash => {
                    tree.simulate_crash().expect("crash");
                    drop(tree);
                    live = durable.clone();
                    tree = open(&path, 256).expect("recover");
                    prop_assert!(tree.was_dirty_on_startup());
                }
                Op::Range(from, to) => {
                    let actual: Vec<(u64, u64)> = tree
                        .seek(&from, &to)
                        .expect("seek")
                        .entries()
                        .collect::<Result<_>>()
                        .expect("scan");
                    prop_assert_eq!(actual, model_range(&live, from, to));
                }
            }
        }

        let all: BTreeMap<u64, u64> = tree
            .seek(&0, &u64::MAX)
            .expect("seek")
            .entries()
            .collect::<Result<_>>()
            .expect("scan");
        prop_assert_eq!(all, live);
        prop_assert_eq!(findings(&tree).expect("check"), 0);
    }
}
