use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of message lifecycle states (spec.md §3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Discovered,
    Downloaded,
    Imported,
    SkippedDuplicate,
    SkippedFiltered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Discovered => "discovered",
            MessageStatus::Downloaded => "downloaded",
            MessageStatus::Imported => "imported",
            MessageStatus::SkippedDuplicate => "skipped_duplicate",
            MessageStatus::SkippedFiltered => "skipped_filtered",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "discovered" => MessageStatus::Discovered,
            "downloaded" => MessageStatus::Downloaded,
            "imported" => MessageStatus::Imported,
            "skipped_duplicate" => MessageStatus::SkippedDuplicate,
            "skipped_filtered" => MessageStatus::SkippedFiltered,
            "failed" => MessageStatus::Failed,
            _ => return None,
        })
    }
}

/// A folder's scan checkpoint (spec.md §3 `Folder`).
#[derive(Clone, Debug)]
pub struct FolderRow {
    pub name: String,
    pub uidvalidity: Option<u32>,
    pub last_uid_seen: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A tracked message (spec.md §3 `Message`).
#[derive(Clone, Debug)]
pub struct MessageRow {
    pub id: i64,
    pub folder: String,
    pub uid: u32,
    pub uidvalidity: Option<u32>,
    pub status: MessageStatus,
    pub message_id_norm: Option<String>,
    pub fingerprint: String,
    pub eml_path: Option<String>,
    pub eml_sha256: Option<String>,
    pub size_bytes: Option<u32>,
    pub sink_message_id: Option<String>,
    pub sink_thread_id: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Gmail's two ingest endpoints (spec.md §4.5).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkIngestMode {
    Import,
    Insert,
}

impl SinkIngestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkIngestMode::Import => "import",
            SinkIngestMode::Insert => "insert",
        }
    }
}

/// Source Gmail uses for `internalDate` on ingest (spec.md §4.5/§6).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SinkInternalDateSource {
    DateHeader,
    ReceivedTime,
}

impl SinkInternalDateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkInternalDateSource::DateHeader => "dateHeader",
            SinkInternalDateSource::ReceivedTime => "receivedTime",
        }
    }
}

/// Gmail system label identifiers (spec.md §4.5).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SystemLabel {
    Inbox,
    Sent,
    Trash,
    Spam,
    Draft,
}

impl SystemLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemLabel::Inbox => "INBOX",
            SystemLabel::Sent => "SENT",
            SystemLabel::Trash => "TRASH",
            SystemLabel::Spam => "SPAM",
            SystemLabel::Draft => "DRAFT",
        }
    }
}

/// JSON report emitted by the `report` subcommand (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryReport {
    pub created_at: DateTime<Utc>,
    pub sqlite_path: String,
    pub counts: std::collections::BTreeMap<String, i64>,
    pub evidence_mismatches: i64,
}

pub fn now_ts() -> DateTime<Utc> {
    Utc::now()
}
