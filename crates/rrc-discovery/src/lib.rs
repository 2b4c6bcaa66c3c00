//! Hub discovery: decoding announce `app_data` into display names and
//! maintaining a persisted catalog of discovered hubs.

pub mod announce;
pub mod catalog;

pub use catalog::{DiscoveredHub, HubCatalog};

/// Decode `event` into a display name and record it in `catalog`, returning
/// the stored record, or `None` if the announce was rejected (malformed or
/// oversized `app_data`) — in which case the catalog is left untouched and
/// no record is produced. The aspect filter a daemon registered the announce
/// handler under is passed through so the catalog entry records where it
/// came from.
pub fn observe_announce(
    catalog: &mut HubCatalog,
    event: &rrc_mesh::AnnounceEvent,
    aspect: &str,
) -> Option<DiscoveredHub> {
    let hash_hex = hex::encode(&event.destination_hash);
    match announce::parse_hub_name(&event.app_data, &hash_hex) {
        announce::AnnounceOutcome::Reject => None,
        announce::AnnounceOutcome::Accept(name) => Some(catalog.record(hash_hex, name, aspect)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    #[test]
    fn observe_announce_records_into_catalog() {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "rrc-discovery-observe-test-{}-{n}.json",
            std::process::id()
        ));
        let mut catalog = HubCatalog::load(&path);

        let event = rrc_mesh::AnnounceEvent {
            destination_hash: vec![0xab, 0xcd],
            app_data: b"Friendly Hub".to_vec(),
        };
        let recorded = observe_announce(&mut catalog, &event, "rrc.hub").expect("accepted");
        assert_eq!(recorded.name, "Friendly Hub");
        assert_eq!(recorded.hash, "abcd");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn observe_announce_rejects_malformed_app_data() {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "rrc-discovery-observe-reject-test-{}-{n}.json",
            std::process::id()
        ));
        let mut catalog = HubCatalog::load(&path);

        let event = rrc_mesh::AnnounceEvent {
            destination_hash: vec![0xab, 0xcd],
            app_data: vec![0xff, 0xfe, 0xfd],
        };
        assert!(observe_announce(&mut catalog, &event, "rrc.hub").is_none());
        assert!(catalog.is_empty());

        let _ = std::fs::remove_file(&path);
    }
}
