use std::fs;
use std::os::unix::fs::PermissionsExt;

use migrator::evidence::EvidenceStore;
use migrator::errors::AppError;

#[test]
fn evidence_files_survive_interleaved_folders_and_uidvalidity_resets() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::new(dir.path().to_path_buf());

    let inbox_v1 = store.write_immutable("INBOX", Some(100), 1, b"first inbox message").unwrap();
    let inbox_v2 = store.write_immutable("INBOX", Some(200), 1, b"second uidvalidity epoch").unwrap();
    let sent = store.write_immutable("Sent Messages", Some(100), 1, b"a sent message").unwrap();

    assert_ne!(inbox_v1.path, inbox_v2.path, "a UIDVALIDITY change must address a distinct file");
    assert_ne!(inbox_v1.path, sent.path);
    assert!(sent.path.to_string_lossy().contains("Sent_Messages"));

    for written in [&inbox_v1, &inbox_v2, &sent] {
        let perms = fs::metadata(&written.path).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o444, "evidence file must be read-only");
    }

    // No leftover temp files after a clean write.
    let leftovers: Vec<_> = fs::read_dir(dir.path().join("INBOX"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn rewriting_same_identity_with_different_bytes_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::new(dir.path().to_path_buf());

    store.write_immutable("Archive", Some(9), 5, b"original bytes").unwrap();
    let err = store.write_immutable("Archive", Some(9), 5, b"tampered bytes").unwrap_err();
    assert!(matches!(err, AppError::EvidenceMismatch(_)));

    // The original file must be untouched by the failed rewrite attempt.
    let on_disk = fs::read(dir.path().join("Archive").join("9-5.eml")).unwrap();
    assert_eq!(on_disk, b"original bytes");
}
