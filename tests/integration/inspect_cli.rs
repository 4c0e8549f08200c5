#![allow(missing_docs)]

use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use gbptree::primitives::pager::Unlimited;
use gbptree::{GbpTree, GbpTreeOptions};
use serde_json::Value;
use tempfile::TempDir;

fn setup_tree(name: &str, keys: u64) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(format!("{name}.gbpt"));
    let tree: GbpTree<u64, u64> = GbpTree::open(
        &path,
        GbpTreeOptions {
            page_size: Some(512),
            initial_header: b"inspect-me".to_vec(),
            ..GbpTreeOptions::default()
        },
    )
    .expect("open tree");
    {
        let mut writer = tree.writer().expect("writer");
        for key in 0..keys {
            writer.put(&key, &(key * 2)).expect("put");
        }
    }
    tree.checkpoint(&Unlimited, None).expect("checkpoint");
    tree.close().expect("close");
    (dir, path)
}

#[test]
fn info_json_reports_clean_file() {
    let (_dir, path) = setup_tree("info", 200);
    let output = cargo_bin_cmd!("gbptree-inspect")
        .args(["--format", "json", "info"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["meta"]["page_size"].as_u64(), Some(512));
    assert_eq!(json["clean"].as_bool(), Some(true));
    assert_eq!(json["header_len"].as_u64(), Some(10));
    let stable = json["generations"]["stable"].as_u64().expect("stable");
    let unstable = json["generations"]["unstable"].as_u64().expect("unstable");
    assert_eq!(unstable, stable + 1);
}

#[test]
fn info_text_names_the_file() {
    let (_dir, path) = setup_tree("info-text", 10);
    let output = cargo_bin_cmd!("gbptree-inspect")
        .arg("info")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("page size"));
    assert!(text.contains("clean shutdown"));
}

#[test]
fn header_prints_stored_blob() {
    let (_dir, path) = setup_tree("header", 5);
    let output = cargo_bin_cmd!("gbptree-inspect")
        .arg("header")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8(output).expect("utf8").trim(), "inspect-me");
}

#[test]
fn check_detects_layout_and_counts_entries() {
    let (_dir, path) = setup_tree("check", 500);
    let output = cargo_bin_cmd!("gbptree-inspect")
        .args(["--format", "json", "check"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["layout"].as_str(), Some("u64 -> u64"));
    assert_eq!(json["summary"]["entries"].as_u64(), Some(500));
    assert!(json["findings"].as_array().expect("findings").is_empty());
    assert_eq!(json["truncated"].as_bool(), Some(false));
}

#[test]
fn check_leaves_file_untouched() {
    let (_dir, path) = setup_tree("check-ro", 50);
    let before = gbptree::storage::btree::describe_file(&path).expect("describe");
    cargo_bin_cmd!("gbptree-inspect")
        .arg("check")
        .arg(&path)
        .assert()
        .success();
    let after = gbptree::storage::btree::describe_file(&path).expect("describe");
    assert_eq!(before.state_version, after.state_version);
    assert!(after.clean);
}

#[test]
fn missing_file_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    cargo_bin_cmd!("gbptree-inspect")
        .arg("info")
        .arg(dir.path().join("absent.gbpt"))
        .assert()
        .failure();
}

#[test]
fn header_set_replaces_the_blob() {
    let (_dir, path) = setup_tree("header-set", 5);
    let output = cargo_bin_cmd!("gbptree-inspect")
        .args(["header", "--set", "rewritten"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8(output).expect("utf8").trim(), "rewritten");
    let info = gbptree::storage::btree::describe_file(&path).expect("describe");
    assert!(info.clean);
    assert_eq!(info.header_len, 9);
}

#[test]
fn check_reports_dirty_startup_on_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dirty.gbpt");
    {
        let tree: GbpTree<u64, u64> = GbpTree::open(
            &path,
            GbpTreeOptions {
                page_size: Some(512),
                ..GbpTreeOptions::default()
            },
        )
        .expect("open tree");
        tree.writer().expect("writer").put(&1, &1).expect("put");
        tree.checkpoint(&Unlimited, None).expect("checkpoint");
        tree.simulate_crash().expect("crash");
    }
    let output = cargo_bin_cmd!("gbptree-inspect")
        .args(["--format", "json", "check", "--report-dirty"])
        .arg(&path)
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    let findings = json["findings"].as_array().expect("findings");
    assert_eq!(findings[0].as_str(), Some("DirtyOnStartup"));
}
