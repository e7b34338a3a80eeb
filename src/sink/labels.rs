//! IMAP folder → Gmail label mapping and a label name→id cache (spec.md
//! §4.5). Grounded on `original_source/gmail/labels.py`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{AppError, AppResult};
use crate::types::SystemLabel;

static UNSAFE_LABEL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w./ -]+").unwrap());

/// Map an IMAP folder name to a namespaced Gmail custom label name.
pub fn folder_to_custom_label(prefix: &str, folder: &str) -> String {
    let trimmed = folder.trim().trim_matches('/');
    let safe = UNSAFE_LABEL_CHARS.replace_all(trimmed, "_").replace('\\', "_");
    if prefix.is_empty() {
        safe
    } else {
        format!("{prefix}/{safe}")
    }
}

/// Map an IMAP folder name to Gmail system labels, if any (spec.md §4.5).
pub fn folder_to_system_labels(folder: &str) -> Vec<SystemLabel> {
    let lowered = folder.trim().to_lowercase();

    if lowered == "inbox" {
        return vec![SystemLabel::Inbox];
    }
    if lowered == "sent" || lowered.starts_with("sent") || lowered.contains("sent messages") {
        return vec![SystemLabel::Sent];
    }
    if lowered.contains("trash") || lowered == "deleted messages" || lowered == "deleted" {
        return vec![SystemLabel::Trash];
    }
    if lowered.contains("junk") || lowered.contains("spam") {
        return vec![SystemLabel::Spam];
    }
    if lowered.contains("draft") {
        return vec![SystemLabel::Draft];
    }

    Vec::new()
}

/// Fetches and creates Gmail labels, caching name→id lookups for the
/// lifetime of a run (spec.md §4.5).
#[derive(Debug, Default)]
pub struct LabelCache {
    name_to_id: HashMap<String, String>,
}

impl LabelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache contents from a `users.labels.list` response body.
    /// Labels missing `name` or `id` are ignored rather than failing the
    /// refresh.
    pub fn load_from_response(&mut self, body: &serde_json::Value) {
        self.name_to_id.clear();
        let Some(labels) = body.get("labels").and_then(|v| v.as_array()) else {
            return;
        };
        for label in labels {
            if let (Some(name), Some(id)) = (
                label.get("name").and_then(|v| v.as_str()),
                label.get("id").and_then(|v| v.as_str()),
            ) {
                self.name_to_id.insert(name.to_string(), id.to_string());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.name_to_id.get(name).map(|s| s.as_str())
    }

    pub fn insert(&mut self, name: &str, id: &str) {
        self.name_to_id.insert(name.to_string(), id.to_string());
    }

    /// Validate a label name before a create call; blank names are rejected.
    pub fn validate_name(name: &str) -> AppResult<&str> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(AppError::Ingest("label name must not be blank".into()));
        }
        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_label_strips_slashes_and_sanitizes() {
        assert_eq!(folder_to_custom_label("iCloud", "/Sent Messages/"), "iCloud/Sent_Messages");
        assert_eq!(folder_to_custom_label("", "Family*Stuff"), "Family_Stuff");
    }

    #[test]
    fn system_labels_recognize_common_folder_names() {
        assert_eq!(folder_to_system_labels("INBOX"), vec![SystemLabel::Inbox]);
        assert_eq!(folder_to_system_labels("Sent Messages"), vec![SystemLabel::Sent]);
        assert_eq!(folder_to_system_labels("Deleted Messages"), vec![SystemLabel::Trash]);
        assert_eq!(folder_to_system_labels("Junk"), vec![SystemLabel::Spam]);
        assert_eq!(folder_to_system_labels("Drafts"), vec![SystemLabel::Draft]);
        assert!(folder_to_system_labels("Family").is_empty());
    }

    #[test]
    fn cache_loads_tolerating_missing_fields() {
        let mut cache = LabelCache::new();
        let body = serde_json::json!({
            "labels": [
                {"name": "INBOX", "id": "INBOX"},
                {"name": "only-name"},
                {"id": "only-id"},
                {"name": "iCloud/Archive", "id": "Label_12"},
            ]
        });
        cache.load_from_response(&body);
        assert_eq!(cache.get("INBOX"), Some("INBOX"));
        assert_eq!(cache.get("iCloud/Archive"), Some("Label_12"));
        assert_eq!(cache.get("only-name"), None);
    }
}
