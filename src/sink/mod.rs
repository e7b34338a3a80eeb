//! Gmail ingest sink (spec.md §4.5, §1 "Polymorphism"). `SinkClient` and
//! `CredentialProvider` are trait seams so the orchestrator never depends on
//! the concrete Gmail REST client; grounded on
//! `original_source/gmail/ingest.py`'s `GmailIngester`.

pub mod labels;

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::errors::{AppError, AppResult};
use crate::retry::{retry_async, RetryPolicy};
use crate::types::{SinkIngestMode, SinkInternalDateSource};
use labels::LabelCache;

/// Result of a successful Gmail import/insert call.
#[derive(Clone, Debug)]
pub struct IngestResult {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub label_ids: Vec<String>,
}

/// Supplies a live OAuth2 access token, refreshing as needed. Implemented by
/// [`crate::oauth::GoogleCredentialProvider`].
pub trait CredentialProvider: Send + Sync {
    fn access_token(&self) -> BoxFuture<'_, AppResult<String>>;
}

/// The sink side of the pipeline: import messages, ensure labels exist.
pub trait SinkClient: Send + Sync {
    fn import_message<'a>(
        &'a self,
        eml_path: &'a Path,
        label_ids: &'a [String],
        mode: SinkIngestMode,
        date_source: SinkInternalDateSource,
    ) -> BoxFuture<'a, AppResult<IngestResult>>;

    fn ensure_label<'a>(&'a self, name: &'a str) -> BoxFuture<'a, AppResult<String>>;
}

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const GMAIL_UPLOAD_BASE: &str = "https://gmail.googleapis.com/upload/gmail/v1";

/// Gmail REST API sink client (spec.md §4.5). `user_id` is normally the
/// target mailbox's email address, or the literal `"me"`.
pub struct GmailSinkClient {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    user_id: String,
    labels: Mutex<LabelCache>,
    retry_policy: RetryPolicy,
}

impl GmailSinkClient {
    pub async fn new(
        http: reqwest::Client,
        credentials: Arc<dyn CredentialProvider>,
        user_id: String,
    ) -> AppResult<Self> {
        let client = GmailSinkClient {
            http,
            credentials,
            user_id,
            labels: Mutex::new(LabelCache::new()),
            retry_policy: RetryPolicy::default(),
        };
        client.refresh_labels().await?;
        Ok(client)
    }

    async fn bearer(&self) -> AppResult<String> {
        self.credentials.access_token().await
    }

    async fn refresh_labels(&self) -> AppResult<()> {
        let token = self.bearer().await?;
        let url = format!("{GMAIL_API_BASE}/users/{}/labels", self.user_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::TransientIo(format!("listing Gmail labels: {e}")))?;
        let body = parse_response_json(resp, "listing Gmail labels").await?;
        self.labels.lock().await.load_from_response(&body);
        Ok(())
    }

    async fn ensure_label_impl(&self, name: &str) -> AppResult<String> {
        let normalized = LabelCache::validate_name(name)?.to_string();

        if let Some(id) = self.labels.lock().await.get(&normalized) {
            return Ok(id.to_string());
        }

        let token = self.bearer().await?;
        let url = format!("{GMAIL_API_BASE}/users/{}/labels", self.user_id);
        let body = serde_json::json!({
            "name": normalized,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::TransientIo(format!("creating Gmail label {normalized}: {e}")))?;
        let created = parse_response_json(resp, "creating Gmail label").await?;
        let id = created
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Ingest(format!("unexpected label create response: {created}")))?
            .to_string();

        self.labels.lock().await.insert(&normalized, &id);
        Ok(id)
    }

    async fn import_message_impl(
        &self,
        eml_path: &Path,
        label_ids: &[String],
        mode: SinkIngestMode,
        date_source: SinkInternalDateSource,
    ) -> AppResult<IngestResult> {
        let raw = tokio::fs::read(eml_path)
            .await
            .map_err(|e| AppError::Ingest(format!("reading {}: {e}", eml_path.display())))?;

        let endpoint = match mode {
            SinkIngestMode::Import => "import",
            SinkIngestMode::Insert => "insert",
        };

        let metadata = if label_ids.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::json!({ "labelIds": label_ids })
        };

        let metadata_part = reqwest::multipart::Part::text(metadata.to_string())
            .mime_str("application/json")
            .map_err(|e| AppError::Unexpected(e.to_string()))?;
        let media_part = reqwest::multipart::Part::bytes(raw)
            .mime_str("message/rfc822")
            .map_err(|e| AppError::Unexpected(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("metadata", metadata_part)
            .part("media", media_part);

        let token = self.bearer().await?;
        let url = format!(
            "{GMAIL_UPLOAD_BASE}/users/{}/messages/{endpoint}?uploadType=multipart&internalDateSource={}",
            self.user_id,
            date_source.as_str()
        );

        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::TransientIo(format!("Gmail {endpoint} request failed: {e}")))?;
        let body = parse_response_json(resp, &format!("Gmail {endpoint}")).await?;

        let message_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Ingest(format!("unexpected Gmail {endpoint} response: {body}")))?
            .to_string();
        let thread_id = body.get("threadId").and_then(|v| v.as_str()).map(String::from);
        let label_ids = body
            .get("labelIds")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        Ok(IngestResult {
            message_id,
            thread_id,
            label_ids,
        })
    }
}

async fn parse_response_json(resp: reqwest::Response, context: &str) -> AppResult<serde_json::Value> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| AppError::TransientIo(format!("reading response body while {context}: {e}")))?;

    if !status.is_success() {
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(AppError::TransientIo(format!("{context} returned {status}: {text}")));
        }
        return Err(AppError::Ingest(format!("{context} returned {status}: {text}")));
    }

    serde_json::from_str(&text)
        .map_err(|e| AppError::Ingest(format!("parsing response while {context}: {e} (body: {text})")))
}

impl SinkClient for GmailSinkClient {
    fn import_message<'a>(
        &'a self,
        eml_path: &'a Path,
        label_ids: &'a [String],
        mode: SinkIngestMode,
        date_source: SinkInternalDateSource,
    ) -> BoxFuture<'a, AppResult<IngestResult>> {
        Box::pin(async move {
            retry_async(self.retry_policy, "gmail-import", |_attempt| {
                self.import_message_impl(eml_path, label_ids, mode, date_source)
            })
            .await
        })
    }

    fn ensure_label<'a>(&'a self, name: &'a str) -> BoxFuture<'a, AppResult<String>> {
        Box::pin(async move {
            retry_async(self.retry_policy, "gmail-ensure-label", |_attempt| {
                self.ensure_label_impl(name)
            })
            .await
        })
    }
}
