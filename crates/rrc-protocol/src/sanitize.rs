//! Normalization and sanitization of user-supplied strings: room names,
//! free-text chat bodies, display names, and hex-encoded hashes.

/// Strip and lowercase a room name. Returns `None` if the result is empty.
pub fn normalize_room(s: &str) -> Option<String> {
    let normalized = s.trim().to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Strip a free-text chat/notice body and reject control characters other
/// than tab/LF/CR, NUL, and the Unicode non-characters U+FFFE/U+FFFF.
/// Returns `None` if the result is empty or exceeds `max` characters.
pub fn sanitize_text(s: &str, max: usize) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.chars().count() > max {
        return None;
    }
    for c in trimmed.chars() {
        let code = c as u32;
        if code < 32 && !matches!(code, 9 | 10 | 13) {
            return None;
        }
        if code == 0 || code == 0xFFFE || code == 0xFFFF {
            return None;
        }
    }
    Some(trimmed.to_string())
}

/// Strip, truncate to `max` characters, and drop control characters and the
/// Unicode non-characters from a display name (hub name or nickname). More
/// permissive than [`sanitize_text`]: truncates rather than rejecting
/// overlength input, since these are display-only. Returns `None` if the
/// cleaned result is empty.
pub fn sanitize_display(s: &str, max: usize) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    let truncated: String = trimmed.chars().take(max).collect();

    let cleaned: String = truncated
        .chars()
        .filter(|c| {
            let code = *c as u32;
            !(code < 32 || code == 0x7F || code == 0xFFFE || code == 0xFFFF)
        })
        .collect();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Parse a hex-encoded hash, stripping `:` and whitespace first. Fails on
/// odd length or non-hex characters.
pub fn parse_hex_hash(s: &str) -> Option<Vec<u8>> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect();
    hex::decode(cleaned).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_room_trims_and_lowercases() {
        assert_eq!(normalize_room("  General  "), Some("general".to_string()));
    }

    #[test]
    fn normalize_room_rejects_empty() {
        assert_eq!(normalize_room("   "), None);
    }

    #[test]
    fn normalize_room_is_idempotent() {
        let once = normalize_room("  General ").unwrap();
        let twice = normalize_room(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_text_rejects_control_chars() {
        assert_eq!(sanitize_text("hi\u{0007}there", 100), None);
    }

    #[test]
    fn sanitize_text_allows_tab_lf_cr() {
        assert_eq!(
            sanitize_text("line1\nline2\ttabbed", 100),
            Some("line1\nline2\ttabbed".to_string())
        );
    }

    #[test]
    fn sanitize_text_rejects_over_max() {
        let long = "x".repeat(11);
        assert_eq!(sanitize_text(&long, 10), None);
    }

    #[test]
    fn sanitize_text_rejects_non_characters() {
        assert_eq!(sanitize_text("bad\u{FFFE}", 100), None);
    }

    #[test]
    fn sanitize_display_truncates_instead_of_rejecting() {
        let long = "x".repeat(10);
        assert_eq!(sanitize_display(&long, 5), Some("xxxxx".to_string()));
    }

    #[test]
    fn sanitize_display_drops_control_chars() {
        assert_eq!(sanitize_display("ab\x01cd", 10), Some("abcd".to_string()));
    }

    #[test]
    fn sanitize_display_none_when_all_dropped() {
        assert_eq!(sanitize_display("\x01\x02", 10), None);
    }

    #[test]
    fn parse_hex_hash_strips_colons_and_spaces() {
        let parsed = parse_hex_hash("aa:bb cc:dd").expect("valid hex");
        assert_eq!(parsed, vec![0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn parse_hex_hash_rejects_odd_length() {
        assert_eq!(parse_hex_hash("abc"), None);
    }

    #[test]
    fn parse_hex_hash_rejects_non_hex() {
        assert_eq!(parse_hex_hash("zzzz"), None);
    }
}
