//! Coordinates IMAP fetching, evidence storage, and Gmail ingestion
//! (spec.md §4.6). Grounded on
//! `original_source/pipeline/orchestrator.py`'s `MigrationOrchestrator`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::config::AppSettings;
use crate::errors::AppError;
use crate::evidence::EvidenceStore;
use crate::imap::ImapPool;
use crate::mail::{self, AddressFilter};
use crate::oauth::GoogleCredentialProvider;
use crate::retry::{retry_async, RetryPolicy};
use crate::sink::labels::{folder_to_custom_label, folder_to_system_labels};
use crate::sink::{GmailSinkClient, SinkClient};
use crate::storage::db::Database;
use crate::types::{MessageStatus, SinkIngestMode, SinkInternalDateSource};

/// Shared Gmail ingestion handles threaded through mailbox workers, absent
/// entirely in dry-run mode.
#[derive(Clone)]
struct GmailHandles {
    sink: Arc<dyn SinkClient>,
    queue: mpsc::Sender<GmailWorkItem>,
    label_prefix: String,
    mode: SinkIngestMode,
    date_source: SinkInternalDateSource,
}

struct GmailWorkItem {
    message_id: i64,
    eml_path: PathBuf,
    label_ids: Vec<String>,
}

/// Drives one end-to-end migration run (spec.md §4.6).
pub struct Orchestrator {
    settings: AppSettings,
}

impl Orchestrator {
    pub fn new(settings: AppSettings) -> Self {
        Self { settings }
    }

    pub async fn run(&self, dry_run: bool, reset: bool) -> anyhow::Result<()> {
        info!(dry_run, reset, "migration starting");
        self.settings.storage.ensure_dirs()?;

        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let cancelled = cancelled.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight UIDs and shutting down");
                    cancelled.store(true, Ordering::SeqCst);
                }
            });
        }

        let db = Database::open(&self.settings.storage.sqlite_path).await?;

        if reset {
            let count = db.reset_skipped_and_failed().await?;
            info!(count, "reset skipped/failed messages and folder checkpoints");
        }

        let evidence = EvidenceStore::new(self.settings.storage.evidence_dir.clone());

        let pool = Arc::new(
            ImapPool::connect(
                &self.settings.imap.host,
                self.settings.imap.port,
                &self.settings.imap.username,
                &self.settings.imap.app_password,
                self.settings.imap.connections as usize,
            )
            .await?,
        );
        info!(connections = self.settings.imap.connections, "IMAP connections established");

        let gmail = if dry_run {
            None
        } else {
            let credentials = GoogleCredentialProvider::from_stored(
                &self.settings.gmail.credentials_file,
                &self.settings.gmail.target_user_email,
            )
            .await?;
            let sink = GmailSinkClient::new(
                reqwest::Client::new(),
                Arc::new(credentials),
                self.settings.gmail.target_user_email.clone(),
            )
            .await?;
            info!(user = %self.settings.gmail.target_user_email, "Gmail API client ready");
            Some(Arc::new(sink) as Arc<dyn SinkClient>)
        };

        let (tx, rx) = mpsc::channel::<GmailWorkItem>(self.settings.concurrency.queue_maxsize as usize);
        let rx = Arc::new(Mutex::new(rx));

        let mut gmail_worker_handles = Vec::new();
        let gmail_handles = gmail.map(|sink| GmailHandles {
            sink,
            queue: tx,
            label_prefix: self.settings.gmail.label_prefix.clone(),
            mode: self.settings.gmail.mode,
            date_source: self.settings.gmail.internal_date_source,
        });

        if let Some(handles) = &gmail_handles {
            for idx in 0..self.settings.concurrency.gmail_workers {
                let db = db.clone();
                let sink = handles.sink.clone();
                let rx = rx.clone();
                let mode = handles.mode;
                let date_source = handles.date_source;
                gmail_worker_handles.push(tokio::spawn(async move {
                    gmail_worker(idx, rx, db, sink, mode, date_source).await;
                }));
            }
        } else {
            // No Gmail workers in dry-run mode; `rx` is simply never drained.
            drop(rx);
        }

        let mailboxes = {
            let mut session = pool.checkout().await?;
            session.list_mailboxes().await?
        };
        let mailboxes = self.filter_mailboxes(mailboxes);

        if mailboxes.is_empty() {
            warn!("no mailboxes discovered");
        } else {
            let addr_filter = AddressFilter {
                target_addresses: self.settings.filter.target_addresses.clone(),
                include_sender: self.settings.filter.include_sender,
                include_recipients: self.settings.filter.include_recipients,
            };

            let mut mailbox_tasks = Vec::new();
            for mailbox in mailboxes {
                let pool = pool.clone();
                let db = db.clone();
                let evidence = evidence.clone();
                let gmail_handles = gmail_handles.clone();
                let addr_filter = addr_filter.clone();
                let imap_settings = self.settings.imap.clone();
                let body_bytes = self.settings.storage.fingerprint_body_bytes;
                let fetch_concurrency = self.settings.concurrency.imap_fetch_concurrency as usize;
                let cancelled = cancelled.clone();

                mailbox_tasks.push(tokio::spawn(async move {
                    if let Err(e) = process_mailbox(
                        pool,
                        db,
                        evidence,
                        mailbox.clone(),
                        imap_settings,
                        body_bytes,
                        fetch_concurrency,
                        addr_filter,
                        gmail_handles,
                        dry_run,
                        cancelled,
                    )
                    .await
                    {
                        error!(mailbox = %mailbox, error = %e, "mailbox worker failed");
                    }
                }));
            }
            for task in mailbox_tasks {
                let _ = task.await;
            }
        }

        if let Some(handles) = gmail_handles {
            drop(handles.queue);
            for handle in gmail_worker_handles {
                let _ = handle.await;
            }
        }

        pool.logout_all().await;

        let counts = db.counts_by_status().await?;
        info!("migration finished");
        for (status, count) in counts {
            info!(status = %status, count, "final status count");
        }

        if cancelled.load(Ordering::SeqCst) {
            return Err(AppError::Interrupted.into());
        }
        Ok(())
    }

    fn filter_mailboxes(&self, mailboxes: Vec<String>) -> Vec<String> {
        let include: std::collections::HashSet<&str> = self
            .settings
            .imap
            .folder_include
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        let exclude: std::collections::HashSet<&str> = self
            .settings
            .imap
            .folder_exclude
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        mailboxes
            .into_iter()
            .filter(|mailbox| {
                if !include.is_empty() && !include.contains(mailbox.as_str()) {
                    return false;
                }
                !exclude.contains(mailbox.as_str())
            })
            .collect()
    }
}

async fn process_mailbox(
    pool: Arc<ImapPool>,
    db: Database,
    evidence: EvidenceStore,
    mailbox: String,
    imap_settings: crate::config::ImapSettings,
    body_bytes: usize,
    fetch_concurrency: usize,
    addr_filter: AddressFilter,
    gmail: Option<GmailHandles>,
    dry_run: bool,
    cancelled: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let folder_row = db.get_folder(&mailbox).await?;
    let start_uid = folder_row
        .as_ref()
        .and_then(|f| f.last_uid_seen)
        .map(|u| u + 1)
        .unwrap_or(1);

    db.update_folder_checkpoint(
        &mailbox,
        folder_row.as_ref().and_then(|f| f.uidvalidity),
        folder_row.as_ref().and_then(|f| f.last_uid_seen),
    )
    .await?;

    let criteria = crate::imap::parse::build_search_criteria(&imap_settings.search_query);
    let (uidvalidity, mut uids) = {
        let mut session = pool.checkout().await?;
        let info = session.select(&mailbox).await?;
        let uids = session.uid_search(&criteria).await?;
        (info.uidvalidity, uids)
    };
    uids.retain(|&uid| uid >= start_uid);
    uids.sort_unstable();

    let sem = Arc::new(Semaphore::new(fetch_concurrency));
    let retry_policy = RetryPolicy::default();

    for batch in uids.chunks(imap_settings.batch_size as usize) {
        if cancelled.load(Ordering::SeqCst) {
            info!(%mailbox, "stopping mailbox worker early: no new UID batches will start");
            break;
        }

        let mut tasks = Vec::new();
        for &uid in batch {
            let pool = pool.clone();
            let db = db.clone();
            let evidence = evidence.clone();
            let sem = sem.clone();
            let addr_filter = addr_filter.clone();
            let gmail = gmail.clone();
            let mailbox = mailbox.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("imap fetch semaphore closed");
                process_uid(
                    pool,
                    db,
                    evidence,
                    mailbox,
                    uid,
                    uidvalidity,
                    body_bytes,
                    addr_filter,
                    gmail,
                    retry_policy,
                    dry_run,
                )
                .await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        if let Some(&max_uid) = batch.iter().max() {
            db.update_folder_checkpoint(&mailbox, uidvalidity, Some(max_uid)).await?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_uid(
    pool: Arc<ImapPool>,
    db: Database,
    evidence: EvidenceStore,
    mailbox: String,
    uid: u32,
    uidvalidity: Option<u32>,
    body_bytes: usize,
    addr_filter: AddressFilter,
    gmail: Option<GmailHandles>,
    retry_policy: RetryPolicy,
    dry_run: bool,
) {
    let raw = match retry_async(retry_policy, "imap-fetch", |_attempt| {
        let pool = pool.clone();
        async move {
            let mut session = pool.checkout().await?;
            session.uid_fetch_rfc822(uid).await
        }
    })
    .await
    {
        Ok(raw) => raw,
        Err(e) => {
            error!(%mailbox, uid, error = %e, "failed to fetch UID after retries");
            return;
        }
    };

    let fp = mail::fingerprint(&raw, body_bytes);
    let msg_row = match db
        .upsert_message_discovered(
            &mailbox,
            uid,
            uidvalidity,
            fp.message_id_norm.as_deref(),
            &fp.fingerprint,
            Some(raw.len() as u32),
        )
        .await
    {
        Ok(row) => row,
        Err(e) => {
            error!(%mailbox, uid, error = %e, "failed to record discovered message");
            return;
        }
    };

    if msg_row.status == MessageStatus::Imported {
        return;
    }

    if !addr_filter.matches(&fp.headers) {
        let _ = db
            .mark_skipped_filtered(
                msg_row.id,
                &format!("filtered out by target_addresses={:?}", addr_filter.target_addresses),
            )
            .await;
        return;
    }

    match db.find_existing_imported(fp.message_id_norm.as_deref(), &fp.fingerprint).await {
        Ok(Some(existing)) if existing != msg_row.id => {
            let _ = db
                .mark_skipped_duplicate(msg_row.id, &format!("duplicate of imported row id={existing}"))
                .await;
            return;
        }
        Ok(_) => {}
        Err(e) => {
            error!(%mailbox, uid, error = %e, "duplicate lookup failed");
            return;
        }
    }

    let written = match evidence.write_immutable(&mailbox, uidvalidity, uid, &raw) {
        Ok(w) => w,
        Err(e) => {
            let _ = db.mark_failed(msg_row.id, &e.to_string()).await;
            return;
        }
    };
    if let Err(e) = db.mark_downloaded(msg_row.id, &written.path, &written.sha256).await {
        error!(%mailbox, uid, error = %e, "failed to record downloaded message");
    }

    if dry_run {
        return;
    }

    let Some(gmail) = gmail else { return };

    let mut label_ids: Vec<String> = folder_to_system_labels(&mailbox)
        .into_iter()
        .map(|l| l.as_str().to_string())
        .collect();

    let custom_name = folder_to_custom_label(&gmail.label_prefix, &mailbox);
    match gmail.sink.ensure_label(&custom_name).await {
        Ok(id) => label_ids.push(id),
        Err(e) => {
            let _ = db.mark_failed(msg_row.id, &e.to_string()).await;
            return;
        }
    }
    label_ids.sort();
    label_ids.dedup();

    let item = GmailWorkItem {
        message_id: msg_row.id,
        eml_path: written.path,
        label_ids,
    };
    if gmail.queue.send(item).await.is_err() {
        let _ = db.mark_failed(msg_row.id, "gmail ingest queue closed unexpectedly").await;
    }
}

async fn gmail_worker(
    worker_idx: u32,
    rx: Arc<Mutex<mpsc::Receiver<GmailWorkItem>>>,
    db: Database,
    sink: Arc<dyn SinkClient>,
    mode: SinkIngestMode,
    date_source: SinkInternalDateSource,
) {
    loop {
        let item = rx.lock().await.recv().await;
        let Some(item) = item else { break };

        match sink.import_message(&item.eml_path, &item.label_ids, mode, date_source).await {
            Ok(result) => {
                if let Err(e) = db
                    .mark_imported(item.message_id, &result.message_id, result.thread_id.as_deref(), &result.label_ids)
                    .await
                {
                    error!(worker_idx, error = %e, "failed to record imported message");
                }
            }
            Err(e) => {
                let _ = db
                    .mark_failed(item.message_id, &format!("[gmail_worker={worker_idx}] {e}"))
                    .await;
            }
        }
    }
}
