#![allow(missing_docs)]

use gbptree::primitives::pager::Unlimited;
use gbptree::{CheckSummary, CollectingVisitor, GbpTree, GbpTreeOptions, Result};
use tempfile::tempdir;

fn small_tree(dir: &std::path::Path) -> Result<GbpTree<u64, u64>> {
    GbpTree::open(
        dir.join("structure.gbpt"),
        GbpTreeOptions {
            page_size: Some(256),
            ..GbpTreeOptions::default()
        },
    )
}

fn checked(tree: &GbpTree<u64, u64>) -> Result<CheckSummary> {
    let mut visitor = CollectingVisitor::default();
    let summary = tree.consistency_check(&mut visitor)?;
    assert!(visitor.findings.is_empty(), "{:?}", visitor.findings);
    Ok(summary)
}

fn scan(tree: &GbpTree<u64, u64>, from: u64, to: u64) -> Result<Vec<u64>> {
    tree.seek(&from, &to)?
        .entries()
        .map(|entry| entry.map(|(k, _)| k))
        .collect()
}

#[test]
fn root_with_three_children_after_two_leaf_splits() -> Result<()> {
    let dir = tempdir()?;
    let tree = small_tree(dir.path())?;
    let mut next = 0u64;
    while tree.stats().leaf_splits() < 2 {
        tree.writer()?.put(&next, &next)?;
        next += 1;
        assert!(next < 1_000, "leaves never split");
    }

    let summary = checked(&tree)?;
    assert_eq!(summary.depth, 2);
    assert_eq!(summary.root_keys, 2, "root should have three children");
    assert_eq!(summary.leaves, 3);
    assert_eq!(tree.stats().snapshot().root_splits, 1);
    assert_eq!(scan(&tree, 0, next)?, (0..next).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn ascending_inserts_grow_a_third_level() -> Result<()> {
    let dir = tempdir()?;
    let tree = small_tree(dir.path())?;
    let mut next = 0u64;
    while tree.stats().snapshot().internal_splits == 0 {
        tree.writer()?.put(&next, &(next * 3))?;
        next += 1;
        assert!(next < 10_000, "internal nodes never split");
    }
    let summary = checked(&tree)?;
    assert_eq!(summary.depth, 3);
    assert_eq!(summary.entries, next);
    assert_eq!(scan(&tree, 0, next)?, (0..next).collect::<Vec<_>>());
    let reversed: Vec<u64> = (1..next).rev().collect();
    assert_eq!(scan(&tree, next - 1, 0)?, reversed);
    Ok(())
}

#[test]
fn structure_survives_interleaved_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let tree = small_tree(dir.path())?;
    for round in 0..8u64 {
        {
            let mut writer = tree.writer()?;
            for key in (round..400).step_by(8) {
                writer.put(&key, &round)?;
            }
            for key in (0..400).step_by(13) {
                writer.remove(&key)?;
            }
        }
        checked(&tree)?;
        tree.checkpoint(&Unlimited, None)?;
    }
    let expected: Vec<u64> = (0..400).filter(|k| k % 13 != 0).collect();
    assert_eq!(scan(&tree, 0, 400)?, expected);
    assert!(tree.stats().snapshot().checkpoints >= 8);
    Ok(())
}

#[test]
fn emptied_tree_accepts_new_content() -> Result<()> {
    let dir = tempdir()?;
    let tree = small_tree(dir.path())?;
    {
        let mut writer = tree.writer()?;
        for key in 0..300u64 {
            writer.put(&key, &key)?;
        }
    }
    tree.checkpoint(&Unlimited, None)?;
    {
        let mut writer = tree.writer()?;
        for key in (0..300u64).rev() {
            assert_eq!(writer.remove(&key)?, Some(key));
        }
    }
    let summary = checked(&tree)?;
    assert_eq!(summary.depth, 1);
    assert_eq!(summary.entries, 0);

    {
        let mut writer = tree.writer()?;
        for key in 1000..1020u64 {
            writer.put(&key, &key)?;
        }
    }
    assert_eq!(scan(&tree, 0, u64::MAX)?, (1000..1020).collect::<Vec<_>>());
    checked(&tree)?;
    Ok(())
}
