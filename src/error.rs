use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("input is neither a JSON file nor a directory: {0}")]
    InvalidInput(String),

    #[error("failed to read query file {path}: {message}")]
    InputRead { path: String, message: String },

    #[error("failed to parse query file {path}: {message}")]
    InputParse { path: String, message: String },

    #[error("failed to read failure ledger {path}: {message}")]
    LedgerRead { path: String, message: String },

    #[error("failed to parse failure ledger {path}: {message}")]
    LedgerParse { path: String, message: String },

    #[error("probe request failed: {0}")]
    ProbeHttp(String),

    #[error("arXiv request failed: {0}")]
    SearchHttp(String),

    #[error("failed to parse arXiv response: {0}")]
    SearchParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("non-utf8 path: {0}")]
    NonUtf8Path(String),
}
