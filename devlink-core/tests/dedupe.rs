//! Persistence round-trip coverage for the incoming-message dedupe set,
//! exercised through the crate's public API only.

use devlink_core::dedupe::DedupeSet;

#[test]
fn dedupe_set_survives_a_reload_across_process_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("incoming-message-dedupe.json");

    {
        let mut set = DedupeSet::load(&path).unwrap();
        assert!(!set.check_and_insert("ALICE1A", 1001, "2026-08-01T00:00:00Z").unwrap());
        assert!(!set.check_and_insert("ALICE1A", 1002, "2026-08-01T00:00:01Z").unwrap());
    }

    let mut reloaded = DedupeSet::load(&path).unwrap();
    assert_eq!(reloaded.len(), 2);
    assert!(reloaded.check_and_insert("ALICE1A", 1001, "2026-08-01T00:00:02Z").unwrap());
    assert!(!reloaded.check_and_insert("ALICE1A", 1003, "2026-08-01T00:00:03Z").unwrap());

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("\"version\": 1"));
    assert!(raw.contains("ALICE1A#1003"));
}
