//! Pure, testable parsers for IMAP LIST/SELECT/SEARCH/FETCH responses
//! (spec.md §4.4/§8). Grounded on `original_source/imap/client.py`'s regexes
//! and the teacher's general habit of keeping wire parsing free of I/O.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{AppError, AppResult};

static LIST_MAILBOX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\* LIST \([^)]*\)\s+(?P<delim>NIL|"[^"]*"|[^\s]+)\s+(?P<name>.+)$"#).unwrap()
});
static LITERAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\{(\d+)\}$").unwrap());
static FETCH_LITERAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\d+)\}$").unwrap());
static UIDVALIDITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[UIDVALIDITY (\d+)\]").unwrap());
static UIDNEXT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[UIDNEXT (\d+)\]").unwrap());
static EXISTS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\*\s+(\d+)\s+EXISTS").unwrap());

/// SELECT response metadata (spec.md §4.4).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectInfo {
    pub uidvalidity: Option<u32>,
    pub uidnext: Option<u32>,
    pub exists: Option<u32>,
}

fn line_str(line: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(line)
}

/// Parse `* LIST (...) <delim> <name>` untagged responses into mailbox names,
/// in first-seen order, deduplicated. Handles quoted names, unquoted atoms,
/// and `{N}` literal names whose payload is the following response line
/// (spec.md §4.4, §8 scenarios 1–2).
pub fn parse_list_response(lines: &[Vec<u8>]) -> Vec<String> {
    let mut out = Vec::new();
    let mut idx = 0usize;

    while idx < lines.len() {
        let raw_line = line_str(&lines[idx]).trim().to_string();
        if raw_line.starts_with('+') {
            idx += 1;
            continue;
        }

        let candidate = if raw_line.starts_with('(') {
            format!("* LIST {raw_line}")
        } else {
            raw_line.clone()
        };

        let Some(captures) = LIST_MAILBOX_RE.captures(&candidate) else {
            idx += 1;
            continue;
        };

        let mut name_token = captures.name("name").unwrap().as_str().trim().to_string();

        if name_token.contains('"') {
            if let Some(first_quote) = name_token.find('"') {
                if let Some(second_quote) = name_token[first_quote + 1..].find('"') {
                    let _ = second_quote;
                    if let Some(last_quote) = name_token.rfind('"') {
                        if last_quote > first_quote {
                            name_token = name_token[first_quote..=last_quote].to_string();
                        }
                    }
                }
            }
        } else if let Some(last_tok) = name_token.split_whitespace().last() {
            name_token = last_tok.to_string();
        }

        let (raw_name, consumed) = if LITERAL_RE.is_match(&name_token) {
            if idx + 1 >= lines.len() {
                break;
            }
            (line_str(&lines[idx + 1]).trim().to_string(), 2)
        } else {
            (name_token, 1)
        };

        if let Some(name) = decode_mailbox_name(&raw_name) {
            out.push(name);
        }
        idx += consumed;
    }

    let mut seen = std::collections::HashSet::new();
    out.into_iter().filter(|name| seen.insert(name.clone())).collect()
}

fn decode_mailbox_name(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("NIL") {
        return None;
    }

    let unquoted = if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value[1..value.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
    } else {
        value.to_string()
    };

    Some(decode_modified_utf7(&unquoted))
}

/// Best-effort modified UTF-7 decode (RFC 3501 §5.1.3). Falls back to the
/// input unchanged if it does not look encoded or decoding fails partway.
fn decode_modified_utf7(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }

    let mut out = String::new();
    let bytes = input.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] != b'&' {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }

        if i + 1 < bytes.len() && bytes[i + 1] == b'-' {
            out.push('&');
            i += 2;
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end] != b'-' {
            end += 1;
        }
        let segment = &input[start..end];
        match decode_b64_utf16be(segment) {
            Some(decoded) => out.push_str(&decoded),
            None => return input.to_string(),
        }
        i = if end < bytes.len() { end + 1 } else { end };
    }

    out
}

fn decode_b64_utf16be(segment: &str) -> Option<String> {
    let modified: String = segment.chars().map(|c| if c == ',' { '/' } else { c }).collect();
    let padded = match modified.len() % 4 {
        0 => modified,
        n => modified + &"=".repeat(4 - n),
    };
    let bytes = base64_decode(&padded)?;
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Minimal standard-alphabet base64 decoder (no external crate dependency
/// needed purely for mailbox-name decoding).
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    fn val(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let stripped = input.trim_end_matches('=');
    let mut bits: u32 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::new();

    for &b in stripped.as_bytes() {
        let v = val(b)?;
        bits = (bits << 6) | v as u32;
        bit_count += 6;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push(((bits >> bit_count) & 0xFF) as u8);
        }
    }
    Some(out)
}

/// Build the UID SEARCH criteria token list from a configured search query
/// (spec.md §4.4): a whitespace/shell-style split, falling back to `["ALL"]`
/// on an unmatched quote or empty input. Grounded on
/// `original_source/imap/client.py`'s `shlex.split(search_query) if
/// search_query.strip() else ["ALL"]` / `except ValueError: ["ALL"]`.
pub fn build_search_criteria(query: &str) -> Vec<String> {
    if query.trim().is_empty() {
        return vec!["ALL".to_string()];
    }
    shell_split(query).unwrap_or_else(|| vec!["ALL".to_string()])
}

/// Minimal POSIX-ish shell tokenizer: single quotes are literal, double
/// quotes allow `\"`/`\\` escapes, unquoted `\` escapes the next character.
/// Returns `None` on an unterminated quote.
fn shell_split(input: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => {
                if c == '"' {
                    quote = None;
                } else if c == '\\' {
                    match chars.peek() {
                        Some('"') | Some('\\') => current.push(chars.next().unwrap()),
                        _ => current.push('\\'),
                    }
                } else {
                    current.push(c);
                }
            }
            _ => {
                if c.is_whitespace() {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                    continue;
                } else if c == '\'' || c == '"' {
                    quote = Some(c);
                } else if c == '\\' {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                } else {
                    current.push(c);
                }
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return None;
    }
    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}

/// Extract UIDVALIDITY/UIDNEXT/EXISTS from SELECT response lines
/// (spec.md §4.4).
pub fn parse_select_response(lines: &[Vec<u8>]) -> SelectInfo {
    let mut info = SelectInfo::default();
    for line in lines {
        let text = line_str(line);
        if info.uidvalidity.is_none() {
            if let Some(c) = UIDVALIDITY_RE.captures(&text) {
                info.uidvalidity = c.get(1).and_then(|m| m.as_str().parse().ok());
            }
        }
        if info.uidnext.is_none() {
            if let Some(c) = UIDNEXT_RE.captures(&text) {
                info.uidnext = c.get(1).and_then(|m| m.as_str().parse().ok());
            }
        }
        if info.exists.is_none() {
            if let Some(c) = EXISTS_RE.captures(&text) {
                info.exists = c.get(1).and_then(|m| m.as_str().parse().ok());
            }
        }
    }
    info
}

/// Collect UIDs from `* SEARCH` continuation lines (spec.md §4.4). Returns an
/// empty list if no digits are present anywhere.
pub fn parse_search_response(lines: &[Vec<u8>]) -> Vec<u32> {
    let mut uids = Vec::new();
    for line in lines {
        let text = line_str(line);
        let mut parts: Vec<&str> = text.split_whitespace().collect();
        if parts.len() >= 2 && parts[0] == "*" && parts[1].eq_ignore_ascii_case("SEARCH") {
            parts = parts[2..].to_vec();
        }
        if !parts.is_empty() && parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit())) {
            uids.extend(parts.iter().filter_map(|p| p.parse::<u32>().ok()));
        }
    }
    uids
}

/// Extract the literal payload from a `UID FETCH ... (BODY.PEEK[])` response
/// (spec.md §4.4). Looks for a line ending in `{N}` followed by an N-byte
/// line; falls back to the longest non-boundary line, rejecting anything
/// under 64 bytes.
pub fn extract_fetch_literal(lines: &[Vec<u8>]) -> AppResult<Vec<u8>> {
    if lines.is_empty() {
        return Err(AppError::Parse("IMAP response had no lines".into()));
    }

    for (idx, line) in lines.iter().enumerate() {
        let text = line_str(line);
        if let Some(c) = FETCH_LITERAL_RE.captures(&text) {
            let size: usize = c.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            if idx + 1 >= lines.len() {
                break;
            }
            let literal = &lines[idx + 1];
            if literal.len() == size {
                return Ok(literal.clone());
            }
        }
    }

    let candidates: Vec<&Vec<u8>> = lines
        .iter()
        .filter(|line| {
            let text = line_str(line);
            !text.contains("FETCH") && !matches!(text.trim(), ")" | "")
        })
        .collect();

    let pool: Vec<&Vec<u8>> = if candidates.is_empty() {
        lines.iter().collect()
    } else {
        candidates
    };

    let literal = pool
        .into_iter()
        .max_by_key(|line| line.len())
        .cloned()
        .unwrap_or_default();

    if literal.len() < 64 {
        return Err(AppError::Parse(format!(
            "IMAP response contained no literal payload ({} lines)",
            lines.len()
        )));
    }
    Ok(literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<Vec<u8>> {
        raw.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn list_parsing_scenario() {
        let input = lines(&[
            r#"* LIST (\HasNoChildren) "/" "INBOX""#,
            r#"* LIST (\HasNoChildren) "/" "Sent Messages""#,
            r#"* LIST (\Noselect) NIL "Archive""#,
            r#"* LIST (\HasNoChildren) "/" INBOX"#,
        ]);
        assert_eq!(
            parse_list_response(&input),
            vec!["INBOX".to_string(), "Sent Messages".to_string(), "Archive".to_string()]
        );
    }

    #[test]
    fn list_literal_scenario() {
        let input = lines(&[r#"* LIST (\HasNoChildren) "/" {12}"#, "Sent Messages"]);
        assert_eq!(parse_list_response(&input), vec!["Sent Messages".to_string()]);
    }

    #[test]
    fn select_parsing_extracts_fields_case_insensitively() {
        let input = lines(&[
            "* OK [uidvalidity 7] UIDs valid",
            "* 42 EXISTS",
            "* OK [UIDNEXT 100] Predicted next UID",
        ]);
        let info = parse_select_response(&input);
        assert_eq!(info.uidvalidity, Some(7));
        assert_eq!(info.uidnext, Some(100));
        assert_eq!(info.exists, Some(42));
    }

    #[test]
    fn search_criteria_splits_on_whitespace() {
        assert_eq!(
            build_search_criteria(r#"SINCE 1-Jan-2020 FROM "a b""#),
            vec!["SINCE", "1-Jan-2020", "FROM", "a b"]
        );
    }

    #[test]
    fn search_criteria_falls_back_to_all_on_empty_or_bad_quoting() {
        assert_eq!(build_search_criteria(""), vec!["ALL"]);
        assert_eq!(build_search_criteria("   "), vec!["ALL"]);
        assert_eq!(build_search_criteria(r#"FROM "unterminated"#), vec!["ALL"]);
    }

    #[test]
    fn search_parsing_collects_digits() {
        let input = lines(&["* SEARCH 1 2 3 42"]);
        assert_eq!(parse_search_response(&input), vec![1, 2, 3, 42]);
    }

    #[test]
    fn search_parsing_empty_when_no_digits() {
        let input = lines(&["* SEARCH"]);
        assert!(parse_search_response(&input).is_empty());
    }

    #[test]
    fn fetch_literal_extraction_by_declared_size() {
        let payload = vec![b'x'; 70];
        let input = vec![
            b"* 1 FETCH (UID 5 BODY[] {70}".to_vec(),
            payload.clone(),
            b")".to_vec(),
        ];
        assert_eq!(extract_fetch_literal(&input).unwrap(), payload);
    }

    #[test]
    fn fetch_literal_fallback_rejects_short_payloads() {
        let input = vec![b"* 1 FETCH (UID 5)".to_vec(), b"short".to_vec()];
        assert!(extract_fetch_literal(&input).is_err());
    }
}
