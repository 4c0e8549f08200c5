#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use gbptree::primitives::pager::Unlimited;
use gbptree::storage::btree::describe_file;
use gbptree::{CollectingVisitor, GbpTree, GbpTreeError, GbpTreeOptions, Result};
use tempfile::tempdir;

fn options() -> GbpTreeOptions {
    GbpTreeOptions {
        page_size: Some(256),
        ..GbpTreeOptions::default()
    }
}

fn keys(tree: &GbpTree<u64, u64>) -> Result<Vec<u64>> {
    tree.seek(&0, &u64::MAX)?
        .entries()
        .map(|entry| entry.map(|(k, _)| k))
        .collect()
}

fn assert_clean(tree: &GbpTree<u64, u64>) -> Result<()> {
    let mut visitor = CollectingVisitor::default();
    tree.consistency_check(&mut visitor)?;
    assert!(visitor.findings.is_empty(), "{:?}", visitor.findings);
    Ok(())
}

/// Checkpoints keys `0..100`, then writes `100..300` and removes the even
/// keys below 50 before crashing.
fn crash_after_unchecked_writes(path: &Path, options: GbpTreeOptions) -> Result<()> {
    let tree: GbpTree<u64, u64> = GbpTree::open(path, options)?;
    {
        let mut writer = tree.writer()?;
        for key in 0..100u64 {
            writer.put(&key, &key)?;
        }
    }
    tree.checkpoint(&Unlimited, None)?;
    {
        let mut writer = tree.writer()?;
        for key in 100..300u64 {
            writer.put(&key, &key)?;
        }
        for key in (0..50u64).step_by(2) {
            writer.remove(&key)?;
        }
    }
    tree.simulate_crash()
}

#[test]
fn crash_rolls_back_to_last_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("crash.gbpt");
    crash_after_unchecked_writes(&path, options())?;

    let tree: GbpTree<u64, u64> = GbpTree::open(&path, options())?;
    assert!(tree.was_dirty_on_startup());
    let report = tree.cleanup_report().expect("foreground cleanup finished in open");
    assert!(report.pages_visited > 0);
    assert!(report.pointers_cleaned > 0, "{report:?}");
    assert_eq!(keys(&tree)?, (0..100).collect::<Vec<_>>());
    assert_clean(&tree)?;

    {
        let mut writer = tree.writer()?;
        for key in 100..400u64 {
            writer.put(&key, &(key + 1))?;
        }
    }
    tree.checkpoint(&Unlimited, None)?;
    assert_clean(&tree)?;
    tree.close()?;

    let tree: GbpTree<u64, u64> = GbpTree::open(&path, options())?;
    assert!(!tree.was_dirty_on_startup());
    assert_eq!(keys(&tree)?, (0..400).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn repeated_crashes_never_lose_checkpointed_data() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("repeated.gbpt");
    let mut checkpointed = 0u64;
    for round in 0..5u64 {
        let tree: GbpTree<u64, u64> = GbpTree::open(&path, options())?;
        assert_eq!(keys(&tree)?, (0..checkpointed).collect::<Vec<_>>());
        assert_clean(&tree)?;
        {
            let mut writer = tree.writer()?;
            for key in checkpointed..checkpointed + 60 {
                writer.put(&key, &round)?;
            }
        }
        tree.checkpoint(&Unlimited, None)?;
        checkpointed += 60;
        {
            let mut writer = tree.writer()?;
            for key in 0..checkpointed {
                writer.remove(&key)?;
            }
        }
        tree.simulate_crash()?;
    }
    Ok(())
}

#[test]
fn background_cleanup_reports_when_finished() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("background.gbpt");
    crash_after_unchecked_writes(&path, options())?;

    let tree: GbpTree<u64, u64> = GbpTree::open(
        &path,
        GbpTreeOptions {
            cleanup_in_background: true,
            ..options()
        },
    )?;
    assert!(tree.was_dirty_on_startup());
    tree.wait_for_cleanup();
    let report = tree.cleanup_report().expect("cleanup finished");
    assert!(report.pointers_cleaned > 0);
    tree.checkpoint(&Unlimited, None)?;
    assert_eq!(keys(&tree)?, (0..100).collect::<Vec<_>>());
    assert_clean(&tree)?;
    Ok(())
}

#[test]
fn read_only_open_of_crashed_file_leaves_it_untouched() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ro-crash.gbpt");
    crash_after_unchecked_writes(&path, options())?;
    let before = describe_file(&path)?;
    assert!(!before.clean);

    {
        let tree: GbpTree<u64, u64> = GbpTree::open(
            &path,
            GbpTreeOptions {
                read_only: true,
                ..options()
            },
        )?;
        assert!(tree.was_dirty_on_startup());
        assert!(tree.cleanup_report().is_none());
        assert_eq!(keys(&tree)?, (0..100).collect::<Vec<_>>());
    }

    let after = describe_file(&path)?;
    assert_eq!(before.state_version, after.state_version);
    assert_eq!(before.generations, after.generations);
    Ok(())
}

#[test]
fn failed_background_cleanup_keeps_the_file_dirty() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("failed-cleanup.gbpt");
    {
        let tree: GbpTree<u64, u64> = GbpTree::open(&path, options())?;
        {
            let mut writer = tree.writer()?;
            for key in 0..200u64 {
                writer.put(&key, &key)?;
            }
        }
        tree.checkpoint(&Unlimited, None)?;
        {
            let mut writer = tree.writer()?;
            for key in 200..400u64 {
                writer.put(&key, &key)?;
            }
        }
        tree.simulate_crash()?;
    }

    // Zero the page type of the checkpointed root so the cleanup walk fails.
    let info = describe_file(&path)?;
    {
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(info.root.0 * u64::from(info.meta.page_size)))?;
        file.write_all(&[0])?;
        file.sync_all()?;
    }

    {
        let tree: GbpTree<u64, u64> = GbpTree::open(
            &path,
            GbpTreeOptions {
                cleanup_in_background: true,
                ..options()
            },
        )?;
        assert!(tree.was_dirty_on_startup());
        tree.wait_for_cleanup();
        assert!(tree.cleanup_report().is_none());
        assert!(matches!(
            tree.checkpoint(&Unlimited, None),
            Err(GbpTreeError::CleanupFailed(_))
        ));
        tree.close()?;
    }
    assert!(!describe_file(&path)?.clean);

    let tree: GbpTree<u64, u64> = GbpTree::open(
        &path,
        GbpTreeOptions {
            read_only: true,
            ..options()
        },
    )?;
    assert!(tree.was_dirty_on_startup());
    Ok(())
}
