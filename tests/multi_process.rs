//! End-to-end scenarios that need real separate OS processes rather than a
//! second in-process handle, re-invoking this test binary with an
//! environment-variable role switch (the common pattern for multi-process
//! Rust shared-memory tests).

use std::collections::HashMap;

use sharedmap::{SharedMap, SharedMapConfig};

fn run_as_child(role: &str) -> bool {
    std::env::var("SHAREDMAP_IT_ROLE").as_deref() == Ok(role)
}

fn unique_name(prefix: &str) -> String {
    let file = tempfile::NamedTempFile::new().expect("create temp file for a collision-free name");
    let stem = file.path().file_name().unwrap().to_string_lossy().replace('.', "-");
    format!("/sharedmap-it-{prefix}-{stem}")
}

fn respawn(test_name: &str, role: &str, map_name: &str) -> std::process::ExitStatus {
    std::process::Command::new(std::env::current_exe().unwrap())
        .arg(test_name)
        .arg("--exact")
        .arg("--nocapture")
        .env("SHAREDMAP_IT_ROLE", role)
        .env("SHAREDMAP_IT_NAME", map_name)
        .status()
        .expect("failed to respawn test binary as a child process")
}

#[test]
fn two_process_counting() {
    if run_as_child("writer_b") {
        let name = std::env::var("SHAREDMAP_IT_NAME").unwrap();
        let b: SharedMap<i64, i64> =
            SharedMap::new(SharedMapConfig::new().name(name).auto_unlink(false)).unwrap();
        for k in 50..100 {
            b.set(k, k).unwrap();
        }
        b.close();
        return;
    }

    let name = unique_name("two-process");
    let a: SharedMap<i64, i64> = SharedMap::new(SharedMapConfig::new().name(name.clone())).unwrap();
    for k in 0..50 {
        a.set(k, k).unwrap();
    }

    let status = respawn("two_process_counting", "writer_b", &name);
    assert!(status.success());

    assert_eq!(a.len().unwrap(), 100);
    let snapshot: HashMap<i64, i64> = a.snapshot().unwrap();
    let expected: HashMap<i64, i64> = (0..100).map(|k| (k, k)).collect();
    assert_eq!(snapshot, expected);

    a.unlink().unwrap();
}

#[test]
fn huge_value_visible_to_an_attaching_process() {
    if run_as_child("reader") {
        let name = std::env::var("SHAREDMAP_IT_NAME").unwrap();
        let reader: SharedMap<String, String> =
            SharedMap::new(SharedMapConfig::new().name(name).auto_unlink(false)).unwrap();
        let value = reader.get(&"huge".to_string()).unwrap().expect("value should be present");
        assert_eq!(value.len(), 1_000_000);
        reader.close();
        return;
    }

    let name = unique_name("huge");
    let writer: SharedMap<String, String> = SharedMap::new(
        SharedMapConfig::new().name(name.clone()).buffer_size(10_000),
    )
    .unwrap();
    writer.set("huge".to_string(), " ".repeat(1_000_000)).unwrap();
    assert_eq!(writer.status().dump_counter, 1);

    let status = respawn("huge_value_visible_to_an_attaching_process", "reader", &name);
    assert!(status.success());

    writer.unlink().unwrap();
}
