//! The discovered-hub catalog: an in-memory map backed by a JSON cache file.
//!
//! Grounded on `original_source/rrc_web/backend.py`'s
//! `load_discovered_hubs`/`save_discovered_hubs`/`cleanup_stale_hubs`
//! (validation rules on load, staleness cleanup) plus
//! `crates/ochra-daemon/src/config.rs`'s load-falls-back-to-default pattern
//! for turning any load failure into an empty starting state rather than a
//! fatal error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use rrc_protocol::{MAX_TOTAL_DISCOVERED_HUBS, STALE_HUB_THRESHOLD_SECS};

const MAX_CACHE_FILE_BYTES: u64 = 1024 * 1024;
const MAX_TIMESTAMP_SKEW_SECS: f64 = 300.0;

/// A single discovered hub record, as persisted to the cache file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveredHub {
    pub hash: String,
    pub name: String,
    pub aspect: String,
    pub last_seen: f64,
}

/// Validate and convert one raw cache entry, returning `None` if it is
/// missing a required field, has the wrong type, or has an out-of-range
/// `last_seen`.
fn validate_entry(hash_hex: &str, entry: &serde_json::Value, now: f64) -> Option<DiscoveredHub> {
    let obj = entry.as_object()?;
    let hash = obj.get("hash")?.as_str()?.to_string();
    let name = obj.get("name")?.as_str()?.to_string();
    let last_seen = obj.get("last_seen")?.as_f64()?;
    let aspect = obj.get("aspect").and_then(|v| v.as_str()).unwrap_or("rrc.hub").to_string();

    if hash_hex.len() != hash.len() {
        return None;
    }
    if last_seen < 0.0 || last_seen > now + MAX_TIMESTAMP_SKEW_SECS {
        return None;
    }

    Some(DiscoveredHub {
        hash,
        name,
        aspect,
        last_seen,
    })
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The catalog of hubs discovered via announce, persisted as JSON.
pub struct HubCatalog {
    path: PathBuf,
    hubs: HashMap<String, DiscoveredHub>,
}

impl HubCatalog {
    /// Load the catalog from `path`, falling back to an empty catalog on
    /// any read/parse/validation failure — a missing or corrupt cache file
    /// is never fatal.
    pub fn load(path: &Path) -> Self {
        let hubs = Self::load_validated(path).unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            hubs,
        }
    }

    /// Parse and validate the cache file entry by entry, so one malformed
    /// record drops only itself rather than discarding the whole catalog.
    /// Mirrors `load_discovered_hubs`: a record must carry `hash`/`name`/
    /// `last_seen`, `last_seen` must be numeric and within
    /// `[0, now + MAX_TIMESTAMP_SKEW_SECS]`, and the hash used as the map key
    /// must be the same length as the record's own `hash` field (a loose
    /// sanity check, not exact equality — the original tolerates a stored
    /// key/value drift that exact equality would reject outright).
    fn load_validated(path: &Path) -> Option<HashMap<String, DiscoveredHub>> {
        let metadata = std::fs::metadata(path).ok()?;
        if metadata.len() > MAX_CACHE_FILE_BYTES {
            tracing::warn!(bytes = metadata.len(), "hub cache file too large, resetting");
            return None;
        }

        let contents = std::fs::read_to_string(path).ok()?;
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&contents).ok()?;

        let now = now_secs();
        let mut validated = HashMap::with_capacity(raw.len());
        for (hash_hex, entry) in raw {
            match validate_entry(&hash_hex, &entry, now) {
                Some(hub) => {
                    validated.insert(hash_hex, hub);
                }
                None => {
                    tracing::debug!(hash = %hash_hex, "dropping malformed hub cache entry");
                }
            }
        }
        Some(validated)
    }

    /// Record (or refresh) a hub observed via announce, evict over capacity
    /// by least-recently-seen, and persist.
    pub fn record(&mut self, hash_hex: String, name: String, aspect: &str) -> DiscoveredHub {
        let hub = DiscoveredHub {
            hash: hash_hex.clone(),
            name,
            aspect: aspect.to_string(),
            last_seen: now_secs(),
        };
        self.hubs.insert(hash_hex, hub.clone());
        self.evict_over_capacity();
        self.save();
        hub
    }

    fn evict_over_capacity(&mut self) {
        while self.hubs.len() > MAX_TOTAL_DISCOVERED_HUBS {
            let oldest = self
                .hubs
                .iter()
                .min_by(|a, b| {
                    a.1.last_seen
                        .partial_cmp(&b.1.last_seen)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(hash_hex, _)| hash_hex.clone());
            let Some(hash_hex) = oldest else { break };
            self.hubs.remove(&hash_hex);
        }
    }

    /// Remove hubs not seen in over `STALE_HUB_THRESHOLD_SECS`, persisting
    /// only if anything changed.
    pub fn cleanup_stale(&mut self) {
        let now = now_secs();
        let stale: Vec<String> = self
            .hubs
            .iter()
            .filter(|(_, hub)| now - hub.last_seen > STALE_HUB_THRESHOLD_SECS as f64)
            .map(|(hash_hex, _)| hash_hex.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        for hash_hex in &stale {
            self.hubs.remove(hash_hex);
        }
        tracing::info!(count = stale.len(), "removed stale hub(s) from cache");
        self.save();
    }

    pub fn hubs(&self) -> impl Iterator<Item = &DiscoveredHub> {
        self.hubs.values()
    }

    pub fn get(&self, hash_hex: &str) -> Option<&DiscoveredHub> {
        self.hubs.get(hash_hex)
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    fn save(&self) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                tracing::error!(error = %err, "failed to create hub cache directory");
                return;
            }
        }
        match serde_json::to_string_pretty(&self.hubs) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&self.path, json) {
                    tracing::error!(error = %err, "failed to save discovered hubs");
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to serialize discovered hubs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn scratch_path() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("rrc-discovery-test-{}-{n}.json", std::process::id()))
    }

    #[test]
    fn record_then_reload_round_trips() {
        let path = scratch_path();
        let mut catalog = HubCatalog::load(&path);
        assert!(catalog.is_empty());
        catalog.record("abcd".to_string(), "Test Hub".to_string(), "rrc.hub");

        let reloaded = HubCatalog::load(&path);
        let hub = reloaded.get("abcd").expect("hub persisted");
        assert_eq!(hub.name, "Test Hub");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_yields_empty_catalog() {
        let path = std::env::temp_dir().join("rrc-discovery-does-not-exist.json");
        let _ = std::fs::remove_file(&path);
        let catalog = HubCatalog::load(&path);
        assert!(catalog.is_empty());
    }

    #[test]
    fn eviction_keeps_catalog_at_capacity() {
        let path = scratch_path();
        let mut catalog = HubCatalog::load(&path);
        for i in 0..(MAX_TOTAL_DISCOVERED_HUBS + 5) {
            catalog.record(format!("hub{i}"), format!("Hub {i}"), "rrc.hub");
        }
        assert_eq!(catalog.len(), MAX_TOTAL_DISCOVERED_HUBS);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cleanup_stale_removes_old_entries() {
        let path = scratch_path();
        let mut catalog = HubCatalog::load(&path);
        catalog.hubs.insert(
            "stale".to_string(),
            DiscoveredHub {
                hash: "stale".to_string(),
                name: "Old Hub".to_string(),
                aspect: "rrc.hub".to_string(),
                last_seen: now_secs() - (STALE_HUB_THRESHOLD_SECS as f64 + 10.0),
            },
        );
        catalog.record("fresh".to_string(), "Fresh Hub".to_string(), "rrc.hub");

        catalog.cleanup_stale();
        assert!(catalog.get("stale").is_none());
        assert!(catalog.get("fresh").is_some());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn invalid_hash_length_mismatch_is_dropped_on_load() {
        let path = scratch_path();
        std::fs::write(
            &path,
            r#"{"short": {"hash": "much-longer-hash-value", "name": "X", "aspect": "rrc.hub", "last_seen": 1.0}}"#,
        )
        .expect("write fixture");
        let catalog = HubCatalog::load(&path);
        assert!(catalog.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn one_malformed_entry_does_not_discard_the_rest() {
        let path = scratch_path();
        std::fs::write(
            &path,
            r#"{
                "good": {"hash": "good", "name": "Good Hub", "aspect": "rrc.hub", "last_seen": 1.0},
                "bad": {"hash": "bad", "name": "Bad Hub"}
            }"#,
        )
        .expect("write fixture");
        let catalog = HubCatalog::load(&path);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("good").is_some());
        assert!(catalog.get("bad").is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn future_last_seen_beyond_skew_is_dropped() {
        let path = scratch_path();
        let far_future = now_secs() + MAX_TIMESTAMP_SKEW_SECS + 100.0;
        std::fs::write(
            &path,
            format!(
                r#"{{"future": {{"hash": "future", "name": "X", "aspect": "rrc.hub", "last_seen": {far_future}}}}}"#
            ),
        )
        .expect("write fixture");
        let catalog = HubCatalog::load(&path);
        assert!(catalog.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
