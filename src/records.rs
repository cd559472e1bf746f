//! Cached record types for certificates, authorities and their assignments.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use openssl::pkey::{Id, PKeyRef, Private};
use serde::{Deserialize, Serialize};

use crate::error::{CertError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    Rsa,
    Dsa,
    Ec,
    Unknown,
}

impl KeyType {
    pub fn of(key: &PKeyRef<Private>) -> Self {
        match key.id() {
            Id::RSA => KeyType::Rsa,
            Id::DSA => KeyType::Dsa,
            Id::EC => KeyType::Ec,
            _ => KeyType::Unknown,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeyType::Rsa => "RSA",
            KeyType::Dsa => "DSA",
            KeyType::Ec => "EC",
            KeyType::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for KeyType {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RSA" => Ok(KeyType::Rsa),
            "DSA" => Ok(KeyType::Dsa),
            "EC" => Ok(KeyType::Ec),
            other => Err(CertError::UnsupportedKeyType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumerType {
    AdminUi,
    Website,
    Plugin,
}

/// A consumer actively serving a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "ref", rename_all = "snake_case")]
pub enum Assignment {
    AdminUi,
    Website(String),
    Plugin(String),
}

impl Assignment {
    pub fn consumer_type(&self) -> ConsumerType {
        match self {
            Assignment::AdminUi => ConsumerType::AdminUi,
            Assignment::Website(_) => ConsumerType::Website,
            Assignment::Plugin(_) => ConsumerType::Plugin,
        }
    }

    pub fn consumer_ref(&self) -> Option<&str> {
        match self {
            Assignment::AdminUi => None,
            Assignment::Website(site) => Some(site.as_str()),
            Assignment::Plugin(id) => Some(id.as_str()),
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assignment::AdminUi => write!(f, "admin UI"),
            Assignment::Website(site) => write!(f, "website '{}'", site),
            Assignment::Plugin(id) => write!(f, "plugin '{}'", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub name: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub key_type: KeyType,
    pub key_length: u32,
    pub subject_common_name: String,
    pub expiry: DateTime<Utc>,
    pub sha1_fingerprint: String,
    pub md5_fingerprint: String,
    pub assignments: Vec<Assignment>,
}

impl Certificate {
    pub fn is_assigned_to(&self, assignment: &Assignment) -> bool {
        self.assignments.contains(assignment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateAuthority {
    /// Base domain the authority signs for, e.g. `example.org`.
    pub name: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub expiry: DateTime<Utc>,
}

/// Equality filter over record fields. `None` matches anything.
pub trait Filter<T> {
    fn matches(&self, record: &T) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct CertificateFilter {
    pub name: Option<String>,
    pub key_type: Option<KeyType>,
    pub subject_common_name: Option<String>,
    pub consumer_type: Option<ConsumerType>,
}

impl CertificateFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn assigned_to(consumer_type: ConsumerType) -> Self {
        Self {
            consumer_type: Some(consumer_type),
            ..Self::default()
        }
    }
}

impl Filter<Certificate> for CertificateFilter {
    fn matches(&self, cert: &Certificate) -> bool {
        self.name.as_ref().map_or(true, |n| *n == cert.name)
            && self.key_type.map_or(true, |k| k == cert.key_type)
            && self
                .subject_common_name
                .as_ref()
                .map_or(true, |cn| *cn == cert.subject_common_name)
            && self.consumer_type.map_or(true, |t| {
                cert.assignments.iter().any(|a| a.consumer_type() == t)
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthorityFilter {
    pub name: Option<String>,
}

impl AuthorityFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl Filter<CertificateAuthority> for AuthorityFilter {
    fn matches(&self, ca: &CertificateAuthority) -> bool {
        self.name.as_ref().map_or(true, |n| *n == ca.name)
    }
}
