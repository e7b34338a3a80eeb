use migrator::storage::db::Database;
use migrator::types::MessageStatus;

async fn open_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("state.sqlite3")).await.unwrap();
    (dir, db)
}

#[tokio::test]
async fn message_advances_from_discovery_through_import() {
    let (_dir, db) = open_db().await;
    db.upsert_folder("INBOX", Some(7), Some(0)).await.unwrap();

    let msg = db
        .upsert_message_discovered("INBOX", 10, Some(7), Some("<a@b>"), "fp-a", Some(512))
        .await
        .unwrap();
    assert_eq!(msg.status, MessageStatus::Discovered);

    db.mark_downloaded(msg.id, std::path::Path::new("/evidence/INBOX/10-7.eml"), "deadbeef")
        .await
        .unwrap();
    let downloaded = db.get_message(msg.id).await.unwrap().unwrap();
    assert_eq!(downloaded.status, MessageStatus::Downloaded);
    assert_eq!(downloaded.eml_sha256.as_deref(), Some("deadbeef"));

    db.mark_imported(msg.id, "gmail-msg-1", Some("gmail-thread-1"), &["Label_1".to_string()])
        .await
        .unwrap();
    let imported = db.get_message(msg.id).await.unwrap().unwrap();
    assert_eq!(imported.status, MessageStatus::Imported);
    assert_eq!(imported.sink_message_id.as_deref(), Some("gmail-msg-1"));

    let counts = db.counts_by_status().await.unwrap();
    assert_eq!(counts.get("imported"), Some(&1));
}

#[tokio::test]
async fn duplicate_across_folders_is_detected_by_message_id_before_import() {
    let (_dir, db) = open_db().await;

    let original = db
        .upsert_message_discovered("INBOX", 1, Some(1), Some("<dup@x>"), "fp-dup", None)
        .await
        .unwrap();
    db.mark_imported(original.id, "gmail-orig", None, &[]).await.unwrap();

    let copy = db
        .upsert_message_discovered("Archive", 1, Some(1), Some("<dup@x>"), "fp-dup", None)
        .await
        .unwrap();

    let existing = db
        .find_existing_imported(Some("<dup@x>"), "fp-dup")
        .await
        .unwrap();
    assert_eq!(existing, Some(original.id));
    assert_ne!(existing, Some(copy.id));

    db.mark_skipped_duplicate(copy.id, "duplicate of already-imported message")
        .await
        .unwrap();
    let skipped = db.get_message(copy.id).await.unwrap().unwrap();
    assert_eq!(skipped.status, MessageStatus::SkippedDuplicate);
}

#[tokio::test]
async fn reset_requeues_filtered_failed_and_duplicate_rows_but_not_imported() {
    let (_dir, db) = open_db().await;
    db.upsert_folder("INBOX", Some(3), Some(99)).await.unwrap();

    let filtered = db
        .upsert_message_discovered("INBOX", 1, Some(3), None, "fp-1", None)
        .await
        .unwrap();
    db.mark_skipped_filtered(filtered.id, "sender not in allowlist").await.unwrap();

    let failed = db
        .upsert_message_discovered("INBOX", 2, Some(3), None, "fp-2", None)
        .await
        .unwrap();
    db.mark_failed(failed.id, "connection reset").await.unwrap();

    let imported = db
        .upsert_message_discovered("INBOX", 3, Some(3), None, "fp-3", None)
        .await
        .unwrap();
    db.mark_imported(imported.id, "gmail-3", None, &[]).await.unwrap();

    let reset_count = db.reset_skipped_and_failed().await.unwrap();
    assert_eq!(reset_count, 2);

    assert_eq!(
        db.get_message(filtered.id).await.unwrap().unwrap().status,
        MessageStatus::Discovered
    );
    assert_eq!(
        db.get_message(failed.id).await.unwrap().unwrap().status,
        MessageStatus::Discovered
    );
    assert_eq!(
        db.get_message(imported.id).await.unwrap().unwrap().status,
        MessageStatus::Imported
    );

    let folder = db.get_folder("INBOX").await.unwrap().unwrap();
    assert_eq!(folder.last_uid_seen, Some(0));
}
