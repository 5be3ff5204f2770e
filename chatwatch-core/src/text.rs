// Text normalization and content hashing used for duplicate detection

use sha2::{Digest, Sha256};

/// Trims and collapses every whitespace run into a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic digest of the case-folded, normalized text scoped to a channel.
///
/// The channel id is mixed in so identical text posted in two channels is
/// tracked as two separate patterns.
pub fn compute_content_hash(text: &str, channel_id: &str) -> String {
    let normalized = normalize_text(text).to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(format!("::{}", channel_id).as_bytes());
    hex::encode(hasher.finalize())
}

/// Truncates to at most `max_chars` characters, appending `...` when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = trimmed.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  disk \t full\n\n on   db-1 "), "disk full on db-1");
        assert_eq!(normalize_text(" \n\t "), "");
    }

    #[test]
    fn test_hash_ignores_case_and_spacing() {
        let a = compute_content_hash("Disk FULL on db-1", "C1");
        let b = compute_content_hash("  disk   full on DB-1 ", "C1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_is_scoped_to_channel() {
        let a = compute_content_hash("disk full", "C1");
        let b = compute_content_hash("disk full", "C2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 120), "short");
        let long = "é".repeat(130);
        let cut = preview(&long, 120);
        assert_eq!(cut.chars().count(), 120);
        assert!(cut.ends_with("..."));
    }
}
