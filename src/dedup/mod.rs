//! Idempotency/dedup store (C2).
//!
//! An in-memory map keyed by `requestId`, backed by an append-only JSONL
//! write-ahead journal replayed (best-effort) on startup. A single mutex
//! guards the map and the journal append together so the two never drift.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DedupError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalLine {
    #[serde(rename = "requestId")]
    request_id: String,
    ts: u64,
    response: Value,
}

struct Entry {
    ts: u64,
    response: Value,
}

struct Inner {
    map: HashMap<String, Entry>,
    journal: std::fs::File,
}

pub struct DedupStore {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_entries: usize,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl DedupStore {
    pub fn open(journal_path: &Path, ttl: Duration, max_entries: usize) -> Result<Self, DedupError> {
        if let Some(parent) = journal_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DedupError::Journal(e.to_string()))?;
            }
        }

        let mut map = HashMap::new();
        if journal_path.exists() {
            let file = std::fs::File::open(journal_path)
                .map_err(|e| DedupError::Journal(e.to_string()))?;
            let cutoff = now_unix().saturating_sub(ttl.as_secs());
            for line in std::io::BufReader::new(file).lines() {
                let Ok(line) = line else { continue };
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<JournalLine>(&line) else {
                    continue;
                };
                if parsed.ts < cutoff {
                    continue;
                }
                map.insert(
                    parsed.request_id,
                    Entry {
                        ts: parsed.ts,
                        response: parsed.response,
                    },
                );
            }
        }

        let journal = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal_path)
            .map_err(|e| DedupError::Journal(e.to_string()))?;

        Ok(DedupStore {
            inner: Mutex::new(Inner { map, journal }),
            ttl,
            max_entries,
        })
    }

    /// In-memory only, for tests that don't want a journal file.
    pub fn in_memory(ttl: Duration, max_entries: usize) -> Self {
        let journal = tempfile_journal();
        DedupStore {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                journal,
            }),
            ttl,
            max_entries,
        }
    }

    pub fn get(&self, request_id: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        self.gc_locked(&mut inner);
        inner.map.get(request_id).map(|e| e.response.clone())
    }

    pub fn put(&self, request_id: &str, response: &Value) {
        let mut inner = self.inner.lock().unwrap();
        self.gc_locked(&mut inner);

        let ts = now_unix();
        if inner.map.len() >= self.max_entries && !inner.map.contains_key(request_id) {
            if let Some(oldest_key) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.ts)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest_key);
            }
        }

        inner.map.insert(
            request_id.to_string(),
            Entry {
                ts,
                response: response.clone(),
            },
        );

        let line = JournalLine {
            request_id: request_id.to_string(),
            ts,
            response: response.clone(),
        };
        if let Ok(serialized) = serde_json::to_string(&line) {
            // Journal I/O errors must never fail the dispatch that triggered them.
            let _ = writeln!(inner.journal, "{serialized}");
        }
    }

    fn gc_locked(&self, inner: &mut Inner) {
        let cutoff = now_unix().saturating_sub(self.ttl.as_secs());
        inner.map.retain(|_, e| e.ts >= cutoff);
    }
}

fn tempfile_journal() -> std::fs::File {
    let path = std::env::temp_dir().join(format!("uegw-dedup-{}.jsonl", uuid::Uuid::new_v4()));
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("temp dedup journal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn put_then_get_round_trips() {
        let store = DedupStore::in_memory(Duration::from_secs(600), 2048);
        store.put("r1", &json!({"ok": true}));
        assert_eq!(store.get("r1"), Some(json!({"ok": true})));
    }

    #[test]
    fn expired_entries_disappear() {
        let store = DedupStore::in_memory(Duration::from_secs(0), 2048);
        store.put("r1", &json!({"ok": true}));
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(store.get("r1"), None);
    }

    #[test]
    fn eviction_drops_oldest_when_over_capacity() {
        let store = DedupStore::in_memory(Duration::from_secs(600), 2);
        store.put("r1", &json!(1));
        std::thread::sleep(Duration::from_millis(1100));
        store.put("r2", &json!(2));
        std::thread::sleep(Duration::from_millis(1100));
        store.put("r3", &json!(3));
        assert_eq!(store.get("r1"), None);
        assert_eq!(store.get("r2"), Some(json!(2)));
        assert_eq!(store.get("r3"), Some(json!(3)));
    }

    #[test]
    fn journal_replay_recovers_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.jsonl");
        {
            let store = DedupStore::open(&path, Duration::from_secs(600), 2048).unwrap();
            store.put("r1", &json!({"x": 1}));
        }
        let store2 = DedupStore::open(&path, Duration::from_secs(600), 2048).unwrap();
        assert_eq!(store2.get("r1"), Some(json!({"x": 1})));
    }

    #[test]
    fn journal_replay_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.jsonl");
        std::fs::write(&path, "not json\n{\"requestId\":\"r2\",\"ts\":9999999999,\"response\":{}}\n").unwrap();
        let store = DedupStore::open(&path, Duration::from_secs(600), 2048).unwrap();
        assert_eq!(store.get("r2"), Some(json!({})));
    }
}
