//! Incoming-message dedupe set (C9) and the evolving-reply anchor table.
//!
//! The dedupe set is a bounded, insertion-ordered set of `IDENTITY#messageId`
//! keys with FIFO eviction at capacity 4,096, persisted to disk as JSON after
//! every insertion. The evolving-reply table is purely in-memory: it tracks
//! the anchor message for an in-progress group reply stream and expires
//! entries 15 minutes after their last update.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::storage::atomic_write;

/// Capacity of the incoming-message dedupe set.
pub const DEDUPE_CAPACITY: usize = 4096;

/// TTL for an evolving-reply anchor entry after its last update.
pub const EVOLVING_REPLY_TTL: Duration = Duration::from_secs(15 * 60);

/// On-disk JSON shape for the dedupe set.
#[derive(Serialize, Deserialize)]
struct DedupeFile {
    version: u32,
    #[serde(rename = "updatedAt")]
    updated_at: String,
    keys: Vec<String>,
}

/// A bounded FIFO-eviction set of seen `(identity, messageId)` pairs.
///
/// Insertion order is preserved so the oldest entry is always the first to
/// be evicted once `DEDUPE_CAPACITY` is reached.
pub struct DedupeSet {
    path: PathBuf,
    order: VecDeque<String>,
    seen: std::collections::HashSet<String>,
}

impl DedupeSet {
    /// Build the canonical dedupe key for a sender identity and message id.
    pub fn key(identity: &str, message_id: u64) -> String {
        format!("{identity}#{message_id}")
    }

    /// Load the dedupe set from `path`, tolerating a missing file, an empty
    /// file, or the legacy bare-array-of-keys format.
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut set = Self { path, order: VecDeque::new(), seen: std::collections::HashSet::new() };

        let raw = match fs::read_to_string(&set.path) {
            Ok(raw) if !raw.trim().is_empty() => raw,
            Ok(_) => return Ok(set),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(set),
            Err(e) => return Err(e),
        };

        let keys = if let Ok(file) = serde_json::from_str::<DedupeFile>(&raw) {
            file.keys
        } else if let Ok(legacy) = serde_json::from_str::<Vec<String>>(&raw) {
            legacy
        } else {
            tracing::warn!(path = %set.path.display(), "dedupe file is malformed, starting empty");
            Vec::new()
        };

        for key in keys {
            set.seen.insert(key.clone());
            set.order.push_back(key);
        }
        while set.order.len() > DEDUPE_CAPACITY {
            if let Some(evicted) = set.order.pop_front() {
                set.seen.remove(&evicted);
            }
        }
        Ok(set)
    }

    /// Check whether `identity`/`message_id` has already been seen. If not,
    /// record it, evict the oldest entry if over capacity, and persist the
    /// updated set to disk.
    ///
    /// Returns `true` if this is a duplicate (the caller should skip
    /// surfacing the message but still send the ack).
    pub fn check_and_insert(&mut self, identity: &str, message_id: u64, now_iso: &str) -> io::Result<bool> {
        let key = Self::key(identity, message_id);
        if self.seen.contains(&key) {
            return Ok(true);
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        if self.order.len() > DEDUPE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.persist(now_iso)?;
        Ok(false)
    }

    fn persist(&self, now_iso: &str) -> io::Result<()> {
        let file = DedupeFile {
            version: 1,
            updated_at: now_iso.to_string(),
            keys: self.order.iter().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        atomic_write(&self.path, &json)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize { self.order.len() }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
}

// ─── Evolving-reply table ─────────────────────────────────────────────────────

/// Key identifying one evolving-reply stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EvolvingReplyKey {
    /// Account the reply is being sent on behalf of.
    pub account_id: String,
    /// Chat (group) the reply targets.
    pub chat_id: String,
    /// The inbound message that triggered this reply stream.
    pub trigger_message_id: u64,
}

/// State of one in-progress evolving-reply stream.
#[derive(Clone, Debug)]
pub struct EvolvingReplyEntry {
    /// The group message id that later edits reference.
    pub anchor_message_id: u64,
    /// The full text last sent for this anchor.
    pub last_text: String,
    /// When this entry was last updated.
    pub last_updated_at: SystemTime,
}

/// In-memory table of anchor entries for in-progress evolving replies,
/// pruned opportunistically on every insert.
#[derive(Default)]
pub struct EvolvingReplyTable {
    entries: std::collections::HashMap<EvolvingReplyKey, EvolvingReplyEntry>,
}

impl EvolvingReplyTable {
    /// Construct an empty table.
    pub fn new() -> Self { Self::default() }

    /// Look up the current anchor for `key`, if any and not expired.
    pub fn get(&self, key: &EvolvingReplyKey, now: SystemTime) -> Option<&EvolvingReplyEntry> {
        self.entries.get(key).filter(|e| !is_expired(e, now))
    }

    /// Insert or update the anchor entry for `key`, pruning expired entries
    /// from the rest of the table first.
    pub fn upsert(&mut self, key: EvolvingReplyKey, anchor_message_id: u64, text: String, now: SystemTime) {
        self.prune(now);
        self.entries.insert(key, EvolvingReplyEntry {
            anchor_message_id,
            last_text: text,
            last_updated_at: now,
        });
    }

    /// Remove `key` (e.g. after a `final` chunk drains it).
    pub fn remove(&mut self, key: &EvolvingReplyKey) -> Option<EvolvingReplyEntry> {
        self.entries.remove(key)
    }

    /// Drop every entry for `account_id` (session disconnect cancellation).
    pub fn clear_account(&mut self, account_id: &str) {
        self.entries.retain(|k, _| k.account_id != account_id);
    }

    /// Remove expired entries.
    pub fn prune(&mut self, now: SystemTime) {
        self.entries.retain(|_, e| !is_expired(e, now));
    }

    /// Number of live entries (no pruning performed).
    pub fn len(&self) -> usize { self.entries.len() }
}

fn is_expired(entry: &EvolvingReplyEntry, now: SystemTime) -> bool {
    now.duration_since(entry.last_updated_at)
        .map(|age| age > EVOLVING_REPLY_TTL)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_dedupe_key_is_not_a_duplicate_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incoming-message-dedupe.json");
        let mut set = DedupeSet::load(&path).unwrap();
        assert!(set.is_empty());

        let dup = set.check_and_insert("UNITTEST", 42, "2026-08-01T00:00:00Z").unwrap();
        assert!(!dup);
        assert_eq!(set.len(), 1);

        let reloaded = DedupeSet::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn repeated_key_is_reported_as_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedupe.json");
        let mut set = DedupeSet::load(&path).unwrap();
        assert!(!set.check_and_insert("A", 1, "t0").unwrap());
        assert!(set.check_and_insert("A", 1, "t1").unwrap());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn capacity_overflow_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedupe.json");
        let mut set = DedupeSet::load(&path).unwrap();
        for i in 0..DEDUPE_CAPACITY as u64 + 1 {
            set.check_and_insert("A", i, "t").unwrap();
        }
        assert_eq!(set.len(), DEDUPE_CAPACITY);
        // the very first key inserted (id 0) must have been evicted
        assert!(!set.seen.contains(&DedupeSet::key("A", 0)));
        assert!(set.seen.contains(&DedupeSet::key("A", DEDUPE_CAPACITY as u64)));
    }

    #[test]
    fn legacy_array_format_loads_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedupe.json");
        fs::write(&path, r#"["A#1", "A#2"]"#).unwrap();
        let set = DedupeSet::load(&path).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let set = DedupeSet::load(&path).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn evolving_reply_entry_expires_after_ttl() {
        let mut table = EvolvingReplyTable::new();
        let key = EvolvingReplyKey {
            account_id: "acct".into(),
            chat_id: "chat".into(),
            trigger_message_id: 7,
        };
        let t0 = SystemTime::now();
        table.upsert(key.clone(), 100, "hello".into(), t0);
        assert!(table.get(&key, t0).is_some());

        let later = t0 + EVOLVING_REPLY_TTL + Duration::from_secs(1);
        assert!(table.get(&key, later).is_none());
    }

    #[test]
    fn clear_account_drops_only_that_accounts_entries() {
        let mut table = EvolvingReplyTable::new();
        let now = SystemTime::now();
        table.upsert(
            EvolvingReplyKey { account_id: "a".into(), chat_id: "c".into(), trigger_message_id: 1 },
            10, "x".into(), now,
        );
        table.upsert(
            EvolvingReplyKey { account_id: "b".into(), chat_id: "c".into(), trigger_message_id: 2 },
            20, "y".into(), now,
        );
        table.clear_account("a");
        assert_eq!(table.len(), 1);
    }
}
