// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors decoding an inbound protocol message. Never fatal: the caller
/// logs and drops the message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message JSON: {message}")]
    MalformedJson { message: String },

    #[error("Message of type '{kind}' is missing field '{field}'")]
    MissingField { kind: String, field: &'static str },

    #[error("Message of type '{kind}' has invalid field '{field}': {message}")]
    InvalidField {
        kind: String,
        field: &'static str,
        message: String,
    },
}

impl ProtocolError {
    pub fn missing(kind: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField {
            kind: kind.into(),
            field,
        }
    }

    pub fn invalid(kind: impl Into<String>, field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            kind: kind.into(),
            field,
            message: message.into(),
        }
    }
}

/// Errors from the key-value store backing checkpoints.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Permission denied accessing store entry: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error accessing store entry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store entry '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("Invalid store key '{key}'")]
    InvalidKey { key: String },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors loading watcher configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Invalid config value for '{field}': {message}")]
    Invalid { field: &'static str, message: String },

    #[error("Data directory not found")]
    DataDirNotFound,
}

impl ConfigError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}
