use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("transient io error: {0}")]
    TransientIo(String),
    #[error("evidence mismatch: {0}")]
    EvidenceMismatch(String),
    #[error("ingest error: {0}")]
    Ingest(String),
    #[error("imap parse error: {0}")]
    Parse(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
    #[error("interrupted")]
    Interrupted,
}

impl AppError {
    /// Exit code this error should produce at the CLI boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Interrupted => 130,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::TransientIo(e.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Unexpected(format!("database error: {e}"))
    }
}
