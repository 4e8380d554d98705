use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid CNPJ: {0}")]
    InvalidCnpj(String),

    #[error("invalid document category: {0}")]
    InvalidCategory(String),

    #[error("invalid schedule time (expected HH:MM): {0}")]
    InvalidTime(String),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("missing config file xml-sync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("subscriber {0} has no custody API credential configured")]
    #[diagnostic(help("add a credential to the subscriber record before triggering a run"))]
    MissingCredential(String),

    #[error("subscriber not found: {0}")]
    SubscriberNotFound(String),

    #[error("tax identifier not found or inactive: {0}")]
    TaxIdentifierNotFound(String),

    #[error("a run is already in progress for subscriber {0}")]
    RunInProgress(String),

    #[error("custody API request failed: {0}")]
    SourceHttp(String),

    #[error("custody API returned status {status}: {message}")]
    SourceStatus { status: u16, message: String },

    #[error("custody API gave up after {attempts} attempts: {last_error}")]
    SourceExhausted { attempts: u32, last_error: String },

    #[error("failed to parse document: {0}")]
    Parse(String),

    #[error("outcome not found: {0}")]
    OutcomeNotFound(String),

    #[error("outcome store error: {0}")]
    Store(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("invalid schedule expression: {0}")]
    Schedule(String),
}

impl SyncError {
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SyncError::MissingCredential(_)
                | SyncError::SubscriberNotFound(_)
                | SyncError::TaxIdentifierNotFound(_)
                | SyncError::InvalidCnpj(_)
                | SyncError::InvalidCategory(_)
                | SyncError::InvalidTime(_)
                | SyncError::MissingConfig
                | SyncError::ConfigRead(_)
                | SyncError::ConfigParse(_)
        )
    }
}
