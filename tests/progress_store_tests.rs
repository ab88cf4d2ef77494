//! Progress store and run lock tests
//!
//! Covers the on-disk behaviour a resumed run depends on: atomic replacement,
//! leftovers from an interrupted save, corrupt records and lock contention.

use std::fs;

use tempfile::TempDir;

use migrun::{FileProgressStore, MigrationError, ProgressStore, RunLock};

fn store_in(dir: &TempDir) -> FileProgressStore {
    FileProgressStore::new(dir.path().join("state").join("migration_save_progress"))
}

#[test]
fn test_save_creates_missing_directory() {
    let dir = TempDir::new().unwrap();
    let mut store = store_in(&dir);

    store.save(1).unwrap();
    assert!(store.path().exists());
    assert_eq!(store.load().unwrap(), Some(1));
}

#[test]
fn test_each_save_replaces_the_record() {
    let dir = TempDir::new().unwrap();
    let mut store = store_in(&dir);

    for step in [1, 2, 5, 11, 12] {
        store.save(step).unwrap();
        assert_eq!(store.load().unwrap(), Some(step));
    }
    let raw = fs::read_to_string(store.path()).unwrap();
    assert_eq!(raw, r#"{"current_step":12}"#);
}

#[test]
fn test_stale_scratch_file_is_ignored() {
    let dir = TempDir::new().unwrap();
    let mut store = store_in(&dir);
    store.save(4).unwrap();

    // A save interrupted before its rename leaves only the scratch file
    fs::write(store.temp_path(), r#"{"current_st"#).unwrap();
    assert_eq!(store.load().unwrap(), Some(4));

    // The next save overwrites it and cleans up
    store.save(5).unwrap();
    assert_eq!(store.load().unwrap(), Some(5));
    assert!(!store.temp_path().exists());
}

#[test]
fn test_scratch_file_without_record_is_a_fresh_start() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    fs::write(store.temp_path(), r#"{"current_step":9}"#).unwrap();

    assert_eq!(store.load().unwrap(), None);
}

#[test]
fn test_corrupt_record_is_reported_not_guessed() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    fs::create_dir_all(store.path().parent().unwrap()).unwrap();

    for garbage in ["", "12", "{}", r#"{"current_step":-1}"#, "not json"] {
        fs::write(store.path(), garbage).unwrap();
        match store.load() {
            Err(MigrationError::StoreCorrupt { path, .. }) => assert_eq!(path, store.path()),
            other => panic!("expected StoreCorrupt for {garbage:?}, got {:?}", other),
        }
    }
}

#[test]
fn test_corrupt_record_maps_to_its_exit_code() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    fs::write(store.path(), "garbage").unwrap();

    let err = store.load().unwrap_err();
    assert_eq!(err.exit_code(), migrun::error::EXIT_STORE_CORRUPT);
}

#[test]
fn test_clear_then_save_starts_over() {
    let dir = TempDir::new().unwrap();
    let mut store = store_in(&dir);

    store.save(7).unwrap();
    store.clear().unwrap();
    assert_eq!(store.load().unwrap(), None);

    store.save(1).unwrap();
    assert_eq!(store.load().unwrap(), Some(1));
}

#[test]
fn test_lock_contention_names_the_holder() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    let lock_path = RunLock::path_for(store.path());

    let held = RunLock::acquire(&lock_path).unwrap();
    let recorded = fs::read_to_string(&lock_path).unwrap();
    assert_eq!(recorded.trim(), std::process::id().to_string());

    let err = RunLock::acquire(&lock_path).unwrap_err();
    assert_eq!(err.exit_code(), migrun::error::EXIT_CONCURRENT_RUN);
    match err {
        MigrationError::ConcurrentRunDetected { lock_path: p, holder } => {
            assert_eq!(p, lock_path);
            assert_eq!(holder, Some(std::process::id()));
        }
        other => panic!("expected ConcurrentRunDetected, got {:?}", other),
    }

    drop(held);
    assert_eq!(fs::read_to_string(&lock_path).unwrap(), "");
    let _again = RunLock::acquire(&lock_path).unwrap();
}

#[test]
fn test_leftover_lock_file_does_not_block() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);
    let lock_path = RunLock::path_for(store.path());

    // Left behind by a killed run: the file exists but nobody holds the flock
    fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    fs::write(&lock_path, "999999\n").unwrap();

    let lock = RunLock::acquire(&lock_path).unwrap();
    let recorded = fs::read_to_string(lock.path()).unwrap();
    assert_eq!(recorded.trim(), std::process::id().to_string());
}
