//! Decode a hub announce's opaque `app_data` into a display name, or reject
//! the announce outright.
//!
//! Grounded on `original_source/rrc_web/backend.py`'s `HubAnnounceHandler`:
//! the same CBOR-map / CBOR-list / CBOR-string / raw-UTF-8 fallback chain,
//! but preserving its distinction between "no name found, synthesize one"
//! (app_data absent, or well-formed but nameless) and "malformed or hostile,
//! drop the whole announce" (oversized app_data, oversized/ill-typed CBOR
//! shapes, undecodable non-CBOR bytes) — the Python handler `return`s
//! immediately (no catalog update, no `hub_discovered` event) in every case
//! of the latter kind.

use ciborium::value::Value;

use rrc_protocol::{sanitize, MAX_ANNOUNCE_APP_DATA};

const MAX_NESTED_VALUE_BYTES: usize = 1000;
const MAX_MAP_OR_LIST_ENTRIES: usize = 20;
const MAX_BARE_STRING_CHARS: usize = 200;

fn fallback_name(hash_hex: &str) -> String {
    format!("Hub {}", &hash_hex[..hash_hex.len().min(8)])
}

/// The result of inspecting one announce's `app_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Accept the announce under this display name (already sanitized).
    Accept(String),
    /// The announce is malformed or exceeds a size/shape guard. Drop it
    /// entirely: no catalog update, no event.
    Reject,
}

/// Decide whether to accept a hub announce and, if so, what display name to
/// record it under.
pub fn parse_hub_name(app_data: &[u8], hash_hex: &str) -> AnnounceOutcome {
    if app_data.is_empty() {
        return AnnounceOutcome::Accept(fallback_name(hash_hex));
    }
    if app_data.len() > MAX_ANNOUNCE_APP_DATA {
        tracing::warn!(bytes = app_data.len(), "rejecting oversized announce app_data");
        return AnnounceOutcome::Reject;
    }

    match ciborium::de::from_reader::<Value, _>(app_data) {
        Ok(value) => match hub_name_from_cbor(&value) {
            CborOutcome::Reject => {
                tracing::warn!("rejecting malformed announce app_data shape");
                AnnounceOutcome::Reject
            }
            CborOutcome::Name(name) => AnnounceOutcome::Accept(sanitize_or_fallback(&name, hash_hex)),
            CborOutcome::NoName => AnnounceOutcome::Accept(fallback_name(hash_hex)),
        },
        Err(_) => match std::str::from_utf8(app_data) {
            Ok(s) => AnnounceOutcome::Accept(sanitize_or_fallback(s, hash_hex)),
            Err(_) => {
                tracing::debug!("announce app_data is neither valid CBOR nor UTF-8, rejecting");
                AnnounceOutcome::Reject
            }
        },
    }
}

fn sanitize_or_fallback(name: &str, hash_hex: &str) -> String {
    sanitize::sanitize_display(name, 200).unwrap_or_else(|| fallback_name(hash_hex))
}

enum CborOutcome {
    Reject,
    Name(String),
    NoName,
}

fn encoded_len(value: &Value) -> usize {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map(|()| buf.len()).unwrap_or(usize::MAX)
}

fn hub_name_from_cbor(value: &Value) -> CborOutcome {
    match value {
        Value::Map(entries) => {
            if entries.len() > MAX_MAP_OR_LIST_ENTRIES {
                return CborOutcome::Reject;
            }
            for (key, value) in entries {
                if !matches!(key, Value::Text(_) | Value::Integer(_) | Value::Bytes(_)) {
                    return CborOutcome::Reject;
                }
                if matches!(value, Value::Map(_) | Value::Array(_))
                    && encoded_len(value) > MAX_NESTED_VALUE_BYTES
                {
                    return CborOutcome::Reject;
                }
            }
            let get = |key: &str| {
                entries.iter().find_map(|(k, v)| {
                    (k.as_text() == Some(key))
                        .then(|| v.as_text().map(str::to_string))
                        .flatten()
                })
            };
            if get("proto").as_deref() == Some("rrc") {
                if let Some(hub) = get("hub") {
                    return CborOutcome::Name(hub);
                }
            }
            match get("name").or_else(|| get("n")).or_else(|| get("hub")) {
                Some(name) => CborOutcome::Name(name),
                None => CborOutcome::NoName,
            }
        }
        Value::Array(items) => {
            if items.len() > MAX_MAP_OR_LIST_ENTRIES {
                return CborOutcome::Reject;
            }
            match items.last().and_then(Value::as_text) {
                Some(s) => CborOutcome::Name(s.to_string()),
                None => CborOutcome::NoName,
            }
        }
        Value::Text(s) => {
            if s.chars().count() > MAX_BARE_STRING_CHARS {
                CborOutcome::Reject
            } else {
                CborOutcome::Name(s.clone())
            }
        }
        _ => CborOutcome::NoName,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cbor(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).expect("encode");
        buf
    }

    #[test]
    fn empty_app_data_accepts_fallback() {
        assert_eq!(
            parse_hub_name(&[], "abcdef0123456789"),
            AnnounceOutcome::Accept("Hub abcdef01".to_string())
        );
    }

    #[test]
    fn rrc_proto_map_wins() {
        let map = Value::Map(vec![
            (Value::Text("proto".into()), Value::Text("rrc".into())),
            (Value::Text("hub".into()), Value::Text("Mesh Cafe".into())),
        ]);
        assert_eq!(
            parse_hub_name(&cbor(&map), "abcdef0123456789"),
            AnnounceOutcome::Accept("Mesh Cafe".to_string())
        );
    }

    #[test]
    fn name_key_fallback_in_map() {
        let map = Value::Map(vec![(Value::Text("name".into()), Value::Text("Plain Hub".into()))]);
        assert_eq!(
            parse_hub_name(&cbor(&map), "abcdef0123456789"),
            AnnounceOutcome::Accept("Plain Hub".to_string())
        );
    }

    #[test]
    fn map_without_name_keys_accepts_fallback() {
        let map = Value::Map(vec![(Value::Text("other".into()), Value::Text("x".into()))]);
        assert_eq!(
            parse_hub_name(&cbor(&map), "abcdef0123456789"),
            AnnounceOutcome::Accept("Hub abcdef01".to_string())
        );
    }

    #[test]
    fn list_uses_last_string_element() {
        let list = Value::Array(vec![Value::Integer(1.into()), Value::Text("Listed Hub".into())]);
        assert_eq!(
            parse_hub_name(&cbor(&list), "abcdef0123456789"),
            AnnounceOutcome::Accept("Listed Hub".to_string())
        );
    }

    #[test]
    fn bare_string_is_used_directly() {
        let text = Value::Text("Text Hub".into());
        assert_eq!(
            parse_hub_name(&cbor(&text), "abcdef0123456789"),
            AnnounceOutcome::Accept("Text Hub".to_string())
        );
    }

    #[test]
    fn raw_utf8_fallback_when_not_cbor() {
        assert_eq!(
            parse_hub_name(b"Raw UTF-8 Hub", "abcdef0123456789"),
            AnnounceOutcome::Accept("Raw UTF-8 Hub".to_string())
        );
    }

    #[test]
    fn invalid_utf8_non_cbor_is_rejected() {
        let invalid = vec![0xff, 0xfe, 0xfd];
        assert_eq!(parse_hub_name(&invalid, "abcdef0123456789"), AnnounceOutcome::Reject);
    }

    #[test]
    fn oversized_app_data_is_rejected() {
        let huge = vec![0u8; MAX_ANNOUNCE_APP_DATA + 1];
        assert_eq!(parse_hub_name(&huge, "abcdef0123456789"), AnnounceOutcome::Reject);
    }

    #[test]
    fn oversized_map_is_rejected() {
        let entries: Vec<_> = (0..25)
            .map(|i| (Value::Text(i.to_string()), Value::Text("x".into())))
            .collect();
        let map = Value::Map(entries);
        assert_eq!(parse_hub_name(&cbor(&map), "abcdef0123456789"), AnnounceOutcome::Reject);
    }

    #[test]
    fn oversized_list_is_rejected() {
        let items: Vec<_> = (0..25).map(|i| Value::Integer(i.into())).collect();
        let list = Value::Array(items);
        assert_eq!(parse_hub_name(&cbor(&list), "abcdef0123456789"), AnnounceOutcome::Reject);
    }

    #[test]
    fn oversized_string_is_rejected() {
        let text = Value::Text("x".repeat(201));
        assert_eq!(parse_hub_name(&cbor(&text), "abcdef0123456789"), AnnounceOutcome::Reject);
    }

    #[test]
    fn invalid_map_key_type_is_rejected() {
        let map = Value::Map(vec![(Value::Bool(true), Value::Text("x".into()))]);
        assert_eq!(parse_hub_name(&cbor(&map), "abcdef0123456789"), AnnounceOutcome::Reject);
    }

    #[test]
    fn oversized_nested_value_is_rejected() {
        let nested = Value::Array((0..500).map(|i| Value::Integer(i.into())).collect());
        let map = Value::Map(vec![(Value::Text("blob".into()), nested)]);
        assert_eq!(parse_hub_name(&cbor(&map), "abcdef0123456789"), AnnounceOutcome::Reject);
    }
}
