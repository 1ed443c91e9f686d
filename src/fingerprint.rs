//! Stable dedupe key over a message's identifying fields.
//!
//! The fingerprint must survive re-downloads of the same logical message and
//! stay usable when `Message-Id` is missing or duplicated, so it hashes a
//! canonical tuple of headers plus an optional raw body prefix.

use mailparse::{addrparse, MailAddr};
use sha2::{Digest, Sha256};

const FIELD_SEPARATOR: u8 = 0x1f;

#[derive(Clone, Copy, Debug)]
pub struct Fingerprinter {
    /// How many leading bytes of the raw message participate in the hash.
    /// Zero disables the body tail entirely.
    body_prefix_bytes: usize,
}

impl Fingerprinter {
    pub fn new(body_prefix_bytes: usize) -> Self {
        Self { body_prefix_bytes }
    }

    /// Computes the 64-hex dedupe key.
    ///
    /// Fields are joined with a single `\x1f` unit separator, in order:
    /// normalized `Message-Id` (or empty), `Date` as UTC epoch seconds
    /// (0 when unparseable), normalized `From`, whitespace-collapsed
    /// `Subject`, byte size, raw body prefix.
    pub fn fingerprint(
        &self,
        message_id: Option<&str>,
        date_epoch: Option<i64>,
        from: Option<&str>,
        subject: Option<&str>,
        raw: &[u8],
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(message_id.unwrap_or("").as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(date_epoch.unwrap_or(0).to_string().as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(from.map(normalize_address).unwrap_or_default().as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(
            subject
                .map(collapse_whitespace)
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(raw.len().to_string().as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        let prefix_len = self.body_prefix_bytes.min(raw.len());
        hasher.update(&raw[..prefix_len]);
        hex::encode(hasher.finalize())
    }
}

/// Lowercases a `Message-Id` and strips the surrounding angle brackets.
/// Whitespace-only input normalizes to `None`.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let stripped = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed);
    let normalized = stripped.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Extracts the lowercased addr-spec from an address header. Falls back to
/// the trimmed, lowercased raw value when the header does not parse.
pub fn normalize_address(raw: &str) -> String {
    if let Ok(addrs) = addrparse(raw) {
        for addr in addrs.iter() {
            match addr {
                MailAddr::Single(info) => return info.addr.to_ascii_lowercase(),
                MailAddr::Group(group) => {
                    if let Some(first) = group.addrs.first() {
                        return first.addr.to_ascii_lowercase();
                    }
                }
            }
        }
    }
    raw.trim().to_ascii_lowercase()
}

pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_normalization() {
        assert_eq!(
            normalize_message_id("<ABC@Example.COM>"),
            Some("abc@example.com".to_string())
        );
        assert_eq!(
            normalize_message_id("plain-id@host"),
            Some("plain-id@host".to_string())
        );
        assert_eq!(normalize_message_id("   "), None);
    }

    #[test]
    fn address_normalization_extracts_addr_spec() {
        assert_eq!(
            normalize_address("Alice Example <Alice@Example.com>"),
            "alice@example.com"
        );
        assert_eq!(normalize_address("bob@d.com"), "bob@d.com");
    }

    #[test]
    fn fingerprint_is_stable() {
        let fp = Fingerprinter::new(4096);
        let raw = b"From: a@d.com\r\n\r\nhello";
        let one = fp.fingerprint(
            Some("abc@d.com"),
            Some(1_704_067_200),
            Some("a@d.com"),
            Some("hi"),
            raw,
        );
        let two = fp.fingerprint(
            Some("abc@d.com"),
            Some(1_704_067_200),
            Some("a@d.com"),
            Some("hi"),
            raw,
        );
        assert_eq!(one, two);
        assert_eq!(one.len(), 64);
        assert!(one.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn any_field_change_alters_fingerprint() {
        let fp = Fingerprinter::new(4096);
        let raw = b"body bytes";
        let base = fp.fingerprint(Some("id"), Some(1), Some("a@d.com"), Some("s"), raw);
        assert_ne!(
            base,
            fp.fingerprint(Some("id2"), Some(1), Some("a@d.com"), Some("s"), raw)
        );
        assert_ne!(
            base,
            fp.fingerprint(Some("id"), Some(2), Some("a@d.com"), Some("s"), raw)
        );
        assert_ne!(
            base,
            fp.fingerprint(Some("id"), Some(1), Some("b@d.com"), Some("s"), raw)
        );
        assert_ne!(
            base,
            fp.fingerprint(Some("id"), Some(1), Some("a@d.com"), Some("t"), raw)
        );
        assert_ne!(
            base,
            fp.fingerprint(Some("id"), Some(1), Some("a@d.com"), Some("s"), b"other bytes ")
        );
    }

    #[test]
    fn missing_message_id_still_hashes() {
        let fp = Fingerprinter::new(0);
        let a = fp.fingerprint(None, Some(1), Some("a@d.com"), Some("s"), b"x");
        let b = fp.fingerprint(None, Some(1), Some("a@d.com"), Some("s"), b"x");
        assert_eq!(a, b);
    }

    #[test]
    fn zero_prefix_ignores_body_content_but_not_size() {
        let fp = Fingerprinter::new(0);
        let a = fp.fingerprint(Some("id"), Some(1), None, None, b"aaaa");
        let b = fp.fingerprint(Some("id"), Some(1), None, None, b"bbbb");
        let c = fp.fingerprint(Some("id"), Some(1), None, None, b"ccccc");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
