//! Error taxonomy for certificate and CA operations.
//!
//! Everything except [`CertError::ConsumerUnreachable`] aborts the current
//! operation. Unreachable consumers are recovered by the assignment router and
//! never surface from a cascading removal.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Which half of an uploaded pair failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PemKind {
    Certificate,
    PrivateKey,
}

impl std::fmt::Display for PemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PemKind::Certificate => write!(f, "certificate"),
            PemKind::PrivateKey => write!(f, "private key"),
        }
    }
}

/// Failure reported by an external collaborator (config store, website
/// manager, plugin registry).
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("{kind} '{reference}' not found")]
    NotFound {
        kind: &'static str,
        reference: String,
    },

    #[error("{0}")]
    Failed(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CertError {
    #[error("could not read {kind} for '{name}': {message}")]
    Parse {
        kind: PemKind,
        name: String,
        message: String,
    },

    #[error("{what} '{name}' not found at {}", path.display())]
    NotFound {
        what: &'static str,
        name: String,
        path: PathBuf,
    },

    #[error("certificate authority for '{domain}' is unavailable: {source}")]
    CaUnavailable {
        domain: String,
        #[source]
        source: Box<CertError>,
    },

    #[error("a certificate named '{name}' already exists")]
    DuplicateName { name: String },

    #[error("consumer {consumer} is unreachable: {reason}")]
    ConsumerUnreachable { consumer: String, reason: String },

    #[error("permission denied on {}: {source}", path.display())]
    Permission {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to persist configuration: {0}")]
    Config(#[source] ConsumerError),

    #[error("consumer {consumer} failed: {source}")]
    Consumer {
        consumer: String,
        #[source]
        source: ConsumerError,
    },

    #[error("failed to generate material for '{name}': {reason}")]
    Generation { name: String, reason: String },

    #[error("private key for '{name}' does not match its certificate")]
    KeyMismatch { name: String },

    #[error("invalid certificate name '{0}'")]
    InvalidName(String),

    #[error("invalid hostname '{0}'")]
    InvalidHostname(String),

    #[error("unsupported key type {0}")]
    UnsupportedKeyType(String),

    #[error(transparent)]
    Openssl(#[from] openssl::error::ErrorStack),
}

pub type Result<T> = std::result::Result<T, CertError>;

impl CertError {
    /// Wrap a filesystem error, keeping permission failures distinct.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        if source.kind() == io::ErrorKind::PermissionDenied {
            CertError::Permission { path, source }
        } else {
            CertError::Io { path, source }
        }
    }

    pub fn not_found(what: &'static str, name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        CertError::NotFound {
            what,
            name: name.into(),
            path: path.as_ref().to_path_buf(),
        }
    }
}
