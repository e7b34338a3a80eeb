//! Minimal header parsing, Message-ID normalization, content fingerprinting, and
//! address filtering (spec.md §4.1). Grounded on `original_source/utils/email.py`
//! and `utils/fingerprint.py`; header decoding uses `mailparse` the way the
//! teacher's `sanitize` module does.

use std::collections::HashSet;

use mailparse::{parse_mail, MailHeaderMap};
use sha2::{Digest, Sha256};

/// The fixed minimal header set parsed per message (spec.md §4.1).
#[derive(Clone, Debug, Default)]
pub struct MinimalHeaders {
    pub date_raw: Option<String>,
    pub date_iso: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub delivered_to: Option<String>,
    pub x_original_to: Option<String>,
    pub envelope_to: Option<String>,
    pub subject: Option<String>,
    pub message_id_norm: Option<String>,
}

/// Parse the minimal header set from raw RFC822 bytes. Header values are
/// best-effort RFC 2047 decoded by `mailparse`; undecodable values pass through
/// unchanged rather than failing the parse.
pub fn parse_minimal_headers(raw: &[u8]) -> MinimalHeaders {
    let parsed = match parse_mail(raw) {
        Ok(p) => p,
        Err(_) => return MinimalHeaders::default(),
    };
    let headers = &parsed.headers;

    let date_raw = headers.get_first_value("Date");
    let date_iso = date_raw.as_deref().and_then(normalize_date_iso);

    MinimalHeaders {
        date_raw,
        date_iso,
        from: headers.get_first_value("From"),
        to: headers.get_first_value("To"),
        cc: headers.get_first_value("Cc"),
        bcc: headers.get_first_value("Bcc"),
        delivered_to: headers.get_first_value("Delivered-To"),
        x_original_to: headers.get_first_value("X-Original-To"),
        envelope_to: headers.get_first_value("Envelope-To"),
        subject: headers.get_first_value("Subject"),
        message_id_norm: normalize_message_id(headers.get_first_value("Message-ID").as_deref()),
    }
}

/// Parse an RFC 2822 `Date` header into a timezone-aware ISO-8601 string.
fn normalize_date_iso(raw: &str) -> Option<String> {
    chrono::DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.to_rfc3339())
}

/// Normalize a `Message-ID` header value for stable cross-run comparisons
/// (spec.md §4.1): truncate at first whitespace, strip one enclosing pair of
/// angle brackets, lowercase, re-wrap in angle brackets.
pub fn normalize_message_id(value: Option<&str>) -> Option<String> {
    let v = value?.trim();
    if v.is_empty() {
        return None;
    }
    let v = v.split_whitespace().next().unwrap_or("");
    let inner = v.strip_prefix('<').and_then(|s| s.strip_suffix('>')).unwrap_or(v);
    let inner = inner.trim();
    if inner.is_empty() {
        return None;
    }
    Some(format!("<{}>", inner.to_lowercase()))
}

/// Locate the body: bytes following the first `\r?\n\r?\n` header/body split.
/// If no split is found, the whole message is treated as the "body".
fn split_body(raw: &[u8]) -> &[u8] {
    let needle_crlf = b"\r\n\r\n";
    let needle_lf = b"\n\n";
    if let Some(pos) = find_subslice(raw, needle_crlf) {
        return &raw[pos + needle_crlf.len()..];
    }
    if let Some(pos) = find_subslice(raw, needle_lf) {
        return &raw[pos + needle_lf.len()..];
    }
    raw
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Up to `max_bytes` of the body, per spec.md §4.1.
pub fn body_prefix(raw: &[u8], max_bytes: usize) -> Vec<u8> {
    if max_bytes == 0 {
        return Vec::new();
    }
    let body = split_body(raw);
    let n = max_bytes.min(body.len());
    body[..n].to_vec()
}

/// Result of fingerprinting a raw message (spec.md §4.1).
#[derive(Clone, Debug)]
pub struct FingerprintResult {
    pub fingerprint: String,
    pub message_id_norm: Option<String>,
    pub headers: MinimalHeaders,
}

/// Compute the stable duplicate-detection fingerprint for a raw RFC822 message.
///
/// Canonical form, joined by `\n`: (normalized date ISO, or raw date, or empty),
/// From, To, Subject, decimal length of `raw`. A trailing `\n` and up to
/// `body_bytes` bytes of the message body are appended before hashing with
/// SHA-256 (spec.md §4.1).
pub fn fingerprint(raw: &[u8], body_bytes: usize) -> FingerprintResult {
    let headers = parse_minimal_headers(raw);

    let canonical = [
        headers
            .date_iso
            .clone()
            .or_else(|| headers.date_raw.clone())
            .unwrap_or_default(),
        headers.from.clone().unwrap_or_default(),
        headers.to.clone().unwrap_or_default(),
        headers.subject.clone().unwrap_or_default(),
        raw.len().to_string(),
    ]
    .join("\n");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(b"\n");
    hasher.update(body_prefix(raw, body_bytes));
    let digest = hex::encode(hasher.finalize());

    FingerprintResult {
        fingerprint: digest,
        message_id_norm: headers.message_id_norm.clone(),
        headers,
    }
}

/// SHA-256 hex digest of raw bytes, used by the evidence store and `verify`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of a file's contents, used by the evidence store and
/// `verify` to re-hash existing `.eml` files without loading callers' buffers.
pub fn sha256_file_hex(path: &std::path::Path) -> std::io::Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Extract lowercased email addresses from a header value, handling
/// display-name + angle-bracket forms and comma-separated lists.
pub fn extract_email_addresses(value: Option<&str>) -> HashSet<String> {
    let mut out = HashSet::new();
    let Some(value) = value else { return out };
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let addr = if let (Some(start), Some(end)) = (part.rfind('<'), part.rfind('>')) {
            if end > start {
                &part[start + 1..end]
            } else {
                part
            }
        } else {
            part
        };
        let addr = addr.trim().trim_matches(|c| c == '"' || c == '\'');
        if addr.is_empty() || !addr.contains('@') {
            continue;
        }
        out.insert(addr.to_lowercase());
    }
    out
}

/// Selects messages by sender/recipient address membership (spec.md §4.1).
#[derive(Clone, Debug)]
pub struct AddressFilter {
    pub target_addresses: HashSet<String>,
    pub include_sender: bool,
    pub include_recipients: bool,
}

impl AddressFilter {
    pub fn matches(&self, headers: &MinimalHeaders) -> bool {
        if self.target_addresses.is_empty() {
            return true;
        }

        if self.include_sender
            && !extract_email_addresses(headers.from.as_deref())
                .is_disjoint(&self.target_addresses)
        {
            return true;
        }

        if self.include_recipients {
            let mut candidates = HashSet::new();
            candidates.extend(extract_email_addresses(headers.to.as_deref()));
            candidates.extend(extract_email_addresses(headers.cc.as_deref()));
            candidates.extend(extract_email_addresses(headers.bcc.as_deref()));
            candidates.extend(extract_email_addresses(headers.delivered_to.as_deref()));
            candidates.extend(extract_email_addresses(headers.x_original_to.as_deref()));
            candidates.extend(extract_email_addresses(headers.envelope_to.as_deref()));
            if !candidates.is_disjoint(&self.target_addresses) {
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_message_id() {
        assert_eq!(
            normalize_message_id(Some(" <ABC@EXAMPLE.COM> ")),
            Some("<abc@example.com>".to_string())
        );
        assert_eq!(
            normalize_message_id(Some("<a@b> extra")),
            Some("<a@b>".to_string())
        );
        assert_eq!(normalize_message_id(Some("")), None);
        assert_eq!(normalize_message_id(Some("   ")), None);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let raw = b"Date: Mon, 1 Jan 2024 10:00:00 +0000\r\nFrom: a@b.com\r\nTo: c@d.com\r\nSubject: hi\r\n\r\nbody text here";
        let a = fingerprint(raw, 16);
        let b = fingerprint(raw, 16);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn fingerprint_differs_on_body_change() {
        let raw_a = b"Date: Mon, 1 Jan 2024 10:00:00 +0000\r\nFrom: a@b.com\r\nTo: c@d.com\r\nSubject: hi\r\n\r\nbody one";
        let raw_b = b"Date: Mon, 1 Jan 2024 10:00:00 +0000\r\nFrom: a@b.com\r\nTo: c@d.com\r\nSubject: hi\r\n\r\nbody two";
        let a = fingerprint(raw_a, 16);
        let b = fingerprint(raw_b, 16);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn extracts_addresses_from_display_name_lists() {
        let value = Some("Andrew <andrew@vectorfy.co>, \"Other\" <other@example.com>");
        let addrs = extract_email_addresses(value);
        assert!(addrs.contains("andrew@vectorfy.co"));
        assert!(addrs.contains("other@example.com"));
    }

    #[test]
    fn address_filter_empty_targets_accepts_all() {
        let filter = AddressFilter {
            target_addresses: HashSet::new(),
            include_sender: true,
            include_recipients: true,
        };
        let headers = MinimalHeaders::default();
        assert!(filter.matches(&headers));
    }

    #[test]
    fn address_filter_matches_recipient() {
        let mut targets = HashSet::new();
        targets.insert("andrew@vectorfy.co".to_string());
        let filter = AddressFilter {
            target_addresses: targets,
            include_sender: true,
            include_recipients: true,
        };
        let mut headers = MinimalHeaders::default();
        headers.to = Some("Andrew <andrew@vectorfy.co>".to_string());
        assert!(filter.matches(&headers));

        headers.to = Some("someoneelse@example.com".to_string());
        assert!(!filter.matches(&headers));
    }
}
