//! `MIG_`-prefixed, `__`-nested environment variable settings, hand-parsed with
//! `std::env::var` in the teacher's `config/mod.rs` idiom rather than a
//! `config`/`envy` crate. Grounded on original `config/settings.py`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, AppResult};
use crate::types::{SinkIngestMode, SinkInternalDateSource};

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> AppResult<T> {
    match env_var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("{key} is not valid: {raw:?}"))),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_var(key) {
        None => default,
        Some(raw) => raw == "1" || raw.eq_ignore_ascii_case("true"),
    }
}

fn require_ranged(key: &str, value: i64, min: i64, max: i64) -> AppResult<()> {
    if value < min || value > max {
        return Err(AppError::Config(format!(
            "{key} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

fn split_folder_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// IMAP connection and fetch settings (spec.md §6).
#[derive(Clone, Debug)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub app_password: String,
    pub ssl: bool,
    pub folder_include: Vec<String>,
    pub folder_exclude: Vec<String>,
    pub connections: u32,
    pub batch_size: u32,
    pub search_query: String,
}

impl ImapSettings {
    fn load() -> AppResult<Self> {
        let username = env_var("MIG_IMAP__USERNAME")
            .ok_or_else(|| AppError::Config("MIG_IMAP__USERNAME is required".into()))?;
        let app_password = env_var("MIG_IMAP__APP_PASSWORD")
            .ok_or_else(|| AppError::Config("MIG_IMAP__APP_PASSWORD is required".into()))?;

        let connections = env_parse::<u32>("MIG_IMAP__CONNECTIONS", 2)?;
        require_ranged("MIG_IMAP__CONNECTIONS", connections as i64, 1, 10)?;

        let batch_size = env_parse::<u32>("MIG_IMAP__BATCH_SIZE", 50)?;
        require_ranged("MIG_IMAP__BATCH_SIZE", batch_size as i64, 1, 500)?;

        Ok(Self {
            host: env_var("MIG_IMAP__HOST").unwrap_or_else(|| "imap.mail.me.com".to_string()),
            port: env_parse("MIG_IMAP__PORT", 993u16)?,
            username,
            app_password,
            ssl: env_bool("MIG_IMAP__SSL", true),
            folder_include: split_folder_list(env_var("MIG_IMAP__FOLDER_INCLUDE")),
            folder_exclude: split_folder_list(env_var("MIG_IMAP__FOLDER_EXCLUDE")),
            connections,
            batch_size,
            search_query: env_var("MIG_IMAP__SEARCH_QUERY").unwrap_or_else(|| "ALL".to_string()),
        })
    }
}

/// Gmail OAuth and ingestion settings (spec.md §6).
#[derive(Clone, Debug)]
pub struct GmailSettings {
    pub target_user_email: String,
    pub credentials_file: PathBuf,
    pub token_file: PathBuf,
    pub mode: SinkIngestMode,
    pub internal_date_source: SinkInternalDateSource,
    pub label_prefix: String,
}

impl GmailSettings {
    fn load() -> AppResult<Self> {
        let target_user_email = env_var("MIG_GMAIL__TARGET_USER_EMAIL")
            .ok_or_else(|| AppError::Config("MIG_GMAIL__TARGET_USER_EMAIL is required".into()))?;
        if !target_user_email.contains('@') {
            return Err(AppError::Config(
                "MIG_GMAIL__TARGET_USER_EMAIL must look like an email address".into(),
            ));
        }

        let credentials_file: PathBuf = env_var("MIG_GMAIL__CREDENTIALS_FILE")
            .ok_or_else(|| AppError::Config("MIG_GMAIL__CREDENTIALS_FILE is required".into()))?
            .into();
        if !credentials_file.is_file() {
            return Err(AppError::Config(format!(
                "credentials_file does not exist: {}",
                credentials_file.display()
            )));
        }

        let mode = match env_var("MIG_GMAIL__MODE").as_deref() {
            None | Some("import") => SinkIngestMode::Import,
            Some("insert") => SinkIngestMode::Insert,
            Some(other) => {
                return Err(AppError::Config(format!("invalid MIG_GMAIL__MODE: {other}")))
            }
        };

        let internal_date_source = match env_var("MIG_GMAIL__INTERNAL_DATE_SOURCE").as_deref() {
            None | Some("dateHeader") => SinkInternalDateSource::DateHeader,
            Some("receivedTime") => SinkInternalDateSource::ReceivedTime,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "invalid MIG_GMAIL__INTERNAL_DATE_SOURCE: {other}"
                )))
            }
        };

        let label_prefix = env_var("MIG_GMAIL__LABEL_PREFIX").unwrap_or_else(|| "iCloud".to_string());
        let label_prefix = label_prefix.trim().to_string();
        if label_prefix.is_empty() {
            return Err(AppError::Config("label_prefix must not be blank".into()));
        }

        Ok(Self {
            target_user_email,
            credentials_file,
            token_file: env_var("MIG_GMAIL__TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".secrets/gmail-token.json")),
            mode,
            internal_date_source,
            label_prefix,
        })
    }
}

/// Evidence store and report storage settings (spec.md §6).
#[derive(Clone, Debug)]
pub struct StorageSettings {
    pub root_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub sqlite_path: PathBuf,
    pub fingerprint_body_bytes: usize,
}

fn absolute(path: PathBuf) -> AppResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| AppError::Config(format!("cannot resolve current directory: {e}")))?;
    Ok(cwd.join(path))
}

impl StorageSettings {
    fn load() -> AppResult<Self> {
        let root_dir = absolute(
            env_var("MIG_STORAGE__ROOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
        )?;

        let evidence_dir = match env_var("MIG_STORAGE__EVIDENCE_DIR_OVERRIDE") {
            Some(p) => absolute(PathBuf::from(p))?,
            None => root_dir.join("evidence"),
        };
        let reports_dir = match env_var("MIG_STORAGE__REPORTS_DIR_OVERRIDE") {
            Some(p) => absolute(PathBuf::from(p))?,
            None => root_dir.join("reports"),
        };
        let sqlite_path = match env_var("MIG_STORAGE__SQLITE_PATH_OVERRIDE") {
            Some(p) => absolute(PathBuf::from(p))?,
            None => root_dir.join("state.sqlite3"),
        };

        let fingerprint_body_bytes = env_parse::<usize>("MIG_STORAGE__FINGERPRINT_BODY_BYTES", 4096)?;
        require_ranged(
            "MIG_STORAGE__FINGERPRINT_BODY_BYTES",
            fingerprint_body_bytes as i64,
            0,
            1024 * 1024,
        )?;

        Ok(Self {
            root_dir,
            evidence_dir,
            reports_dir,
            sqlite_path,
            fingerprint_body_bytes,
        })
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.evidence_dir)?;
        std::fs::create_dir_all(&self.reports_dir)?;
        if let Some(parent) = self.sqlite_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Concurrency limits for IMAP/Gmail operations (spec.md §5/§6).
#[derive(Clone, Copy, Debug)]
pub struct ConcurrencySettings {
    pub gmail_workers: u32,
    pub imap_fetch_concurrency: u32,
    pub queue_maxsize: u32,
}

impl ConcurrencySettings {
    fn load() -> AppResult<Self> {
        let gmail_workers = env_parse::<u32>("MIG_CONCURRENCY__GMAIL_WORKERS", 10)?;
        require_ranged("MIG_CONCURRENCY__GMAIL_WORKERS", gmail_workers as i64, 1, 50)?;

        let imap_fetch_concurrency = env_parse::<u32>("MIG_CONCURRENCY__IMAP_FETCH_CONCURRENCY", 5)?;
        require_ranged(
            "MIG_CONCURRENCY__IMAP_FETCH_CONCURRENCY",
            imap_fetch_concurrency as i64,
            1,
            50,
        )?;

        let queue_maxsize = env_parse::<u32>("MIG_CONCURRENCY__QUEUE_MAXSIZE", 1000)?;
        require_ranged("MIG_CONCURRENCY__QUEUE_MAXSIZE", queue_maxsize as i64, 1, 10_000)?;

        Ok(Self {
            gmail_workers,
            imap_fetch_concurrency,
            queue_maxsize,
        })
    }
}

/// Logging configuration (ambient, spec.md "carry an ambient stack").
#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub level: String,
    pub json_logs: bool,
}

impl LoggingSettings {
    fn load() -> AppResult<Self> {
        Ok(Self {
            level: env_var("MIG_LOGGING__LEVEL").unwrap_or_else(|| "info".to_string()),
            json_logs: env_bool("MIG_LOGGING__JSON_LOGS", true),
        })
    }
}

/// Address-based message selection (spec.md §4.1/§6).
#[derive(Clone, Debug)]
pub struct FilterSettings {
    pub target_addresses: HashSet<String>,
    pub include_sender: bool,
    pub include_recipients: bool,
}

fn parse_target_addresses(raw: Option<String>) -> AppResult<Vec<String>> {
    let Some(raw) = raw else { return Ok(Vec::new()) };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(stripped) = raw.strip_prefix('[') {
        let _ = stripped;
        let values: Vec<String> = serde_json::from_str(raw)
            .map_err(|e| AppError::Config(format!("invalid target_addresses JSON: {e}")))?;
        return Ok(values);
    }
    Ok(raw
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect())
}

impl FilterSettings {
    fn load() -> AppResult<Self> {
        let raw = parse_target_addresses(env_var("MIG_FILTER__TARGET_ADDRESSES"))?;

        let mut seen = HashSet::new();
        let mut target_addresses = HashSet::new();
        for addr in raw {
            let lowered = addr.trim().to_lowercase();
            if lowered.is_empty() {
                continue;
            }
            if !lowered.contains('@') {
                return Err(AppError::Config(format!(
                    "invalid email address in target_addresses: {addr:?}"
                )));
            }
            if seen.insert(lowered.clone()) {
                target_addresses.insert(lowered);
            }
        }

        Ok(Self {
            target_addresses,
            include_sender: env_bool("MIG_FILTER__INCLUDE_SENDER", true),
            include_recipients: env_bool("MIG_FILTER__INCLUDE_RECIPIENTS", true),
        })
    }
}

/// Top-level application settings tree (spec.md §6).
#[derive(Clone, Debug)]
pub struct AppSettings {
    pub imap: ImapSettings,
    pub gmail: GmailSettings,
    pub storage: StorageSettings,
    pub concurrency: ConcurrencySettings,
    pub logging: LoggingSettings,
    pub filter: FilterSettings,
}

impl AppSettings {
    /// Load settings from process environment, optionally after loading an
    /// env file first (spec.md §6 `--env-file`).
    pub fn load(env_file: Option<&Path>) -> AppResult<Self> {
        match env_file {
            Some(path) => {
                dotenvy::from_path(path)
                    .map_err(|e| AppError::Config(format!("cannot read env file: {e}")))?;
            }
            None => {
                let _ = dotenvy::dotenv();
            }
        }

        Ok(Self {
            imap: ImapSettings::load()?,
            gmail: GmailSettings::load()?,
            storage: StorageSettings::load()?,
            concurrency: ConcurrencySettings::load()?,
            logging: LoggingSettings::load()?,
            filter: FilterSettings::load()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_target_addresses() {
        let parsed = parse_target_addresses(Some(r#"["a@b.com", "c@d.com"]"#.to_string())).unwrap();
        assert_eq!(parsed, vec!["a@b.com".to_string(), "c@d.com".to_string()]);
    }

    #[test]
    fn parses_comma_separated_target_addresses() {
        let parsed = parse_target_addresses(Some(" a@b.com, c@d.com ".to_string())).unwrap();
        assert_eq!(parsed, vec!["a@b.com".to_string(), "c@d.com".to_string()]);
    }

    #[test]
    fn empty_target_addresses_is_empty_vec() {
        assert!(parse_target_addresses(None).unwrap().is_empty());
        assert!(parse_target_addresses(Some("   ".to_string())).unwrap().is_empty());
    }
}
