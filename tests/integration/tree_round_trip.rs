#![allow(missing_docs)]

use std::ops::Bound;

use gbptree::primitives::pager::Unlimited;
use gbptree::storage::btree::{describe_file, read_header};
use gbptree::{GbpTree, GbpTreeError, GbpTreeOptions, Result};
use tempfile::tempdir;

#[test]
fn values_survive_close_and_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("round-trip.gbpt");
    {
        let tree: GbpTree<u64, u64> = GbpTree::open(&path, GbpTreeOptions::default())?;
        let mut writer = tree.writer()?;
        for key in 0..5_000u64 {
            writer.put(&key, &(key ^ 0xABCD))?;
        }
        writer.close();
        tree.checkpoint(&Unlimited, None)?;
        tree.close()?;
    }

    let tree: GbpTree<u64, u64> = GbpTree::open(&path, GbpTreeOptions::default())?;
    assert!(!tree.was_dirty_on_startup());
    let mut cursor = tree.seek(&0, &5_000)?;
    let mut expected = 0u64;
    while cursor.next()? {
        assert_eq!(cursor.key(), Some(&expected));
        assert_eq!(cursor.value(), Some(&(expected ^ 0xABCD)));
        expected += 1;
    }
    assert_eq!(expected, 5_000);
    Ok(())
}

#[test]
fn close_without_checkpoint_discards_changes() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("closed.gbpt");
    {
        let tree: GbpTree<u64, u64> = GbpTree::open(&path, GbpTreeOptions::default())?;
        tree.writer()?.put(&1, &10)?;
        tree.checkpoint(&Unlimited, None)?;
        let mut writer = tree.writer()?;
        writer.put(&7, &70)?;
        writer.close();
        tree.close()?;
    }
    assert!(!describe_file(&path)?.clean);
    let tree: GbpTree<u64, u64> = GbpTree::open(&path, GbpTreeOptions::default())?;
    assert!(tree.was_dirty_on_startup());
    let entries: Vec<(u64, u64)> = tree.seek(&0, &100)?.entries().collect::<Result<_>>()?;
    assert_eq!(entries, vec![(1, 10)]);
    Ok(())
}

#[test]
fn signed_keys_order_numerically() -> Result<()> {
    let dir = tempdir()?;
    let tree: GbpTree<i64, i64> =
        GbpTree::open(dir.path().join("signed.gbpt"), GbpTreeOptions::default())?;
    {
        let mut writer = tree.writer()?;
        for key in [3i64, -1, i64::MIN, 0, i64::MAX, -200] {
            writer.put(&key, &(key / 2))?;
        }
    }
    let keys: Vec<i64> = tree
        .seek_range(Bound::Unbounded, Bound::Unbounded)?
        .entries()
        .map(|entry| entry.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    assert_eq!(keys, vec![i64::MIN, -200, -1, 0, 3, i64::MAX]);

    let descending: Vec<i64> = tree
        .seek(&1, &-300)?
        .entries()
        .map(|entry| entry.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    assert_eq!(descending, vec![0, -1, -200]);
    Ok(())
}

#[test]
fn string_keys_with_unit_values() -> Result<()> {
    let dir = tempdir()?;
    let tree: GbpTree<String, ()> =
        GbpTree::open(dir.path().join("set.gbpt"), GbpTreeOptions::default())?;
    {
        let mut writer = tree.writer()?;
        for word in ["pear", "apple", "fig", "banana", "apple"] {
            writer.put(&word.to_string(), &())?;
        }
    }
    let words: Vec<String> = tree
        .seek(&"b".to_string(), &"g".to_string())?
        .entries()
        .map(|entry| entry.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    assert_eq!(words, vec!["banana".to_string(), "fig".to_string()]);
    Ok(())
}

#[test]
fn header_and_file_description() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("described.gbpt");
    let tree: GbpTree<u64, u64> = GbpTree::open(
        &path,
        GbpTreeOptions {
            page_size: Some(4096),
            initial_header: b"index:v1".to_vec(),
            ..GbpTreeOptions::default()
        },
    )?;
    tree.checkpoint(&Unlimited, Some(b"index:v2"))?;
    assert_eq!(tree.header(), b"index:v2");
    assert_eq!(read_header(&path)?, b"index:v2");

    let info = describe_file(&path)?;
    assert_eq!(info.meta.page_size, 4096);
    assert_eq!(info.header_len, 8);
    assert!(!info.clean, "file is still open");
    assert_eq!(info.generations, tree.generations());

    tree.close()?;
    let info = describe_file(&path)?;
    assert!(info.clean);
    Ok(())
}

#[test]
fn read_only_open_refuses_writes() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ro.gbpt");
    {
        let tree: GbpTree<u64, u64> = GbpTree::open(&path, GbpTreeOptions::default())?;
        tree.writer()?.put(&1, &1)?;
        tree.checkpoint(&Unlimited, None)?;
    }
    let before = describe_file(&path)?;
    let tree: GbpTree<u64, u64> = GbpTree::open(
        &path,
        GbpTreeOptions {
            read_only: true,
            ..GbpTreeOptions::default()
        },
    )?;
    assert!(matches!(tree.writer(), Err(GbpTreeError::ReadOnly)));
    assert!(matches!(
        tree.checkpoint(&Unlimited, None),
        Err(GbpTreeError::ReadOnly)
    ));
    let entries: Vec<(u64, u64)> = tree.seek(&0, &10)?.entries().collect::<Result<_>>()?;
    assert_eq!(entries, vec![(1, 1)]);
    tree.close()?;
    let after = describe_file(&path)?;
    assert_eq!(before.state_version, after.state_version);
    Ok(())
}

#[test]
fn missing_file_without_create_is_not_found() -> Result<()> {
    let dir = tempdir()?;
    let result = GbpTree::<u64, u64>::open(
        dir.path().join("absent.gbpt"),
        GbpTreeOptions {
            create_if_missing: false,
            ..GbpTreeOptions::default()
        },
    );
    match result {
        Err(GbpTreeError::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::NotFound),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("open should fail"),
    }
    Ok(())
}
