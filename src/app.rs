//! Subcommand dispatch (spec.md §6): `migrate`, `sink-auth`, `verify`, `report`.

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::{Cli, Command};
use crate::config::AppSettings;
use crate::errors::AppError;
use crate::mail::sha256_file_hex;
use crate::oauth::{fetch_user_email, GoogleCredentialProvider};
use crate::orchestrator::Orchestrator;
use crate::report;
use crate::storage::db::Database;
use crate::types::MessageStatus;

pub async fn run(cli: Cli) -> Result<()> {
    let settings = AppSettings::load(cli.env_file.as_deref())?;

    match cli.command {
        Command::Migrate { dry_run, reset } => run_migrate(settings, dry_run, reset).await,
        Command::SinkAuth => run_sink_auth(settings).await,
        Command::Verify => run_verify(settings).await,
        Command::Report => run_report(settings).await,
    }
}

async fn run_migrate(settings: AppSettings, dry_run: bool, reset: bool) -> Result<()> {
    let orchestrator = Orchestrator::new(settings);
    orchestrator.run(dry_run, reset).await
}

async fn run_sink_auth(settings: AppSettings) -> Result<()> {
    let provider = GoogleCredentialProvider::authorize_interactive(
        &settings.gmail.credentials_file,
        &settings.gmail.target_user_email,
    )
    .await
    .map_err(anyhow::Error::from)?;

    let token = {
        use crate::sink::CredentialProvider;
        provider.access_token().await.map_err(anyhow::Error::from)?
    };
    let email = fetch_user_email(&token).await.map_err(anyhow::Error::from)?;

    println!("Authorized as {email}");
    if email.to_lowercase() != settings.gmail.target_user_email.to_lowercase() {
        println!(
            "warning: authorized account ({email}) does not match configured target_user_email ({})",
            settings.gmail.target_user_email
        );
    }
    Ok(())
}

async fn run_verify(settings: AppSettings) -> Result<()> {
    let db = Database::open(&settings.storage.sqlite_path).await?;

    let mut checked = 0u64;
    let mut mismatches = 0u64;
    for status in [
        MessageStatus::Downloaded,
        MessageStatus::Imported,
        MessageStatus::SkippedDuplicate,
        MessageStatus::SkippedFiltered,
        MessageStatus::Failed,
    ] {
        for row in db.iter_messages(Some(status)).await? {
            let (Some(path), Some(expected)) = (row.eml_path.as_deref(), row.eml_sha256.as_deref()) else {
                continue;
            };
            checked += 1;
            match sha256_file_hex(std::path::Path::new(path)) {
                Ok(actual) if actual == expected => {}
                Ok(actual) => {
                    mismatches += 1;
                    println!("MISMATCH id={} folder={} uid={} path={path} expected={expected} actual={actual}",
                        row.id, row.folder, row.uid);
                }
                Err(e) => {
                    mismatches += 1;
                    println!("MISSING id={} folder={} uid={} path={path}: {e}", row.id, row.folder, row.uid);
                }
            }
        }
    }

    info!(checked, mismatches, "evidence verification finished");
    if mismatches > 0 {
        return Err(AppError::EvidenceMismatch(format!("{mismatches} of {checked} evidence files failed verification")).into());
    }
    Ok(())
}

async fn run_report(settings: AppSettings) -> Result<()> {
    let db = Database::open(&settings.storage.sqlite_path).await?;
    let path = report::write_summary(&db, &settings.storage.reports_dir)
        .await
        .with_context(|| "writing summary report")?;
    println!("{}", path.display());
    Ok(())
}
