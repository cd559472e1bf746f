//! Material store: lazily populated cache of certificate and CA records.
//!
//! Each namespace starts [`NamespaceState::Empty`] and is filled by a full
//! filesystem scan on first read. After that it is kept up to date by the
//! managers, which call [`CertificateNamespace::append`] and friends only after
//! the matching file operation succeeded. Nothing invalidates a namespace
//! except an explicit [`MaterialStore::invalidate`].
//!
//! The two namespaces have independent locks. A caller holding both must take
//! the certificates lock first.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use openssl::pkey::PKey;
use openssl::x509::X509;

use crate::configs::Directories;
use crate::consumers::Consumers;
use crate::error::Result;
use crate::fingerprint::key_fingerprint;
use crate::inspect;
use crate::material_files::{self, FilePolicy};
use crate::records::{Assignment, Certificate, CertificateAuthority, Filter, KeyType};

pub const CERT_EXTENSION: &str = "crt";
pub const KEY_EXTENSION: &str = "key";
pub const CA_CERT_EXTENSION: &str = "pem";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Certificates,
    Authorities,
}

#[derive(Debug)]
pub enum NamespaceState<T> {
    Empty,
    Populated(Vec<T>),
}

impl<T> NamespaceState<T> {
    pub fn is_populated(&self) -> bool {
        matches!(self, NamespaceState::Populated(_))
    }
}

pub struct MaterialStore {
    directories: Directories,
    policy: FilePolicy,
    consumers: Consumers,
    certificates: Mutex<NamespaceState<Certificate>>,
    authorities: Mutex<NamespaceState<CertificateAuthority>>,
}

impl MaterialStore {
    /// Create the material directories if needed and return an empty store.
    pub fn open(directories: Directories, policy: FilePolicy, consumers: Consumers) -> Result<Self> {
        for dir in [
            &directories.cert_dir,
            &directories.key_dir,
            &directories.ca_cert_dir,
            &directories.ca_key_dir,
        ] {
            material_files::ensure_dir(dir)?;
        }
        tracing::debug!(cert_dir = %directories.cert_dir.display(), "material store opened");

        Ok(Self {
            directories,
            policy,
            consumers,
            certificates: Mutex::new(NamespaceState::Empty),
            authorities: Mutex::new(NamespaceState::Empty),
        })
    }

    pub fn directories(&self) -> &Directories {
        &self.directories
    }

    pub fn policy(&self) -> &FilePolicy {
        &self.policy
    }

    pub fn consumers(&self) -> &Consumers {
        &self.consumers
    }

    pub fn cert_path(&self, name: &str) -> PathBuf {
        self.directories
            .cert_dir
            .join(format!("{}.{}", name, CERT_EXTENSION))
    }

    pub fn key_path(&self, name: &str) -> PathBuf {
        self.directories
            .key_dir
            .join(format!("{}.{}", name, KEY_EXTENSION))
    }

    pub fn ca_cert_path(&self, domain: &str) -> PathBuf {
        self.directories
            .ca_cert_dir
            .join(format!("{}.{}", domain, CA_CERT_EXTENSION))
    }

    pub fn ca_key_path(&self, domain: &str) -> PathBuf {
        self.directories
            .ca_key_dir
            .join(format!("{}.{}", domain, KEY_EXTENSION))
    }

    /// Lock the certificates namespace for a scan-or-mutate operation.
    pub fn certificates(&self) -> CertificateNamespace<'_> {
        CertificateNamespace {
            store: self,
            state: self
                .certificates
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Lock the authorities namespace for a scan-or-mutate operation.
    pub fn authorities(&self) -> AuthorityNamespace<'_> {
        AuthorityNamespace {
            store: self,
            state: self
                .authorities
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn list_certificates(&self, filter: &dyn Filter<Certificate>) -> Result<Vec<Certificate>> {
        self.certificates().list(filter)
    }

    pub fn list_authorities(
        &self,
        filter: &dyn Filter<CertificateAuthority>,
    ) -> Result<Vec<CertificateAuthority>> {
        self.authorities().list(filter)
    }

    /// Drop a namespace back to `Empty`; the next read rescans the disk.
    pub fn invalidate(&self, namespace: Namespace) {
        match namespace {
            Namespace::Certificates => *self.certificates().state = NamespaceState::Empty,
            Namespace::Authorities => *self.authorities().state = NamespaceState::Empty,
        }
        tracing::info!(?namespace, "cache invalidated");
    }

    pub fn is_populated(&self, namespace: Namespace) -> bool {
        match namespace {
            Namespace::Certificates => self.certificates().state.is_populated(),
            Namespace::Authorities => self.authorities().state.is_populated(),
        }
    }

    fn scan_certificates(&self) -> Result<Vec<Certificate>> {
        let mut assigned = self.consumers.derive_assignments();

        let mut certs = Vec::new();
        for (name, cert_path) in
            material_files::list_with_extension(&self.directories.cert_dir, CERT_EXTENSION)?
        {
            let key_path = self.key_path(&name);
            match load_certificate(&name, &cert_path, &key_path) {
                Ok(mut cert) => {
                    cert.assignments = assigned.remove(&name).unwrap_or_default();
                    certs.push(cert);
                }
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "skipping certificate");
                }
            }
        }
        tracing::info!(count = certs.len(), "scanned certificates");
        Ok(certs)
    }

    fn scan_authorities(&self) -> Result<Vec<CertificateAuthority>> {
        let mut authorities = Vec::new();
        for (name, cert_path) in
            material_files::list_with_extension(&self.directories.ca_cert_dir, CA_CERT_EXTENSION)?
        {
            let key_path = self.ca_key_path(&name);
            if !key_path.is_file() {
                tracing::warn!(name = %name, path = %key_path.display(), "skipping authority without key");
                continue;
            }
            match load_authority(&name, &cert_path, &key_path) {
                Ok(ca) => authorities.push(ca),
                Err(e) => tracing::warn!(name = %name, error = %e, "skipping authority"),
            }
        }
        tracing::info!(count = authorities.len(), "scanned certificate authorities");
        Ok(authorities)
    }
}

/// Parse a certificate/key pair from disk into a record with no assignments.
pub fn load_certificate(name: &str, cert_path: &Path, key_path: &Path) -> Result<Certificate> {
    let cert_pem = material_files::read("certificate", name, cert_path)?;
    let key_pem = material_files::read("key", name, key_path)?;
    let cert = X509::from_pem(&cert_pem)?;
    let key = PKey::private_key_from_pem(&key_pem)?;
    let fingerprints = key_fingerprint(&key)?;

    Ok(Certificate {
        name: name.to_string(),
        cert_path: cert_path.to_path_buf(),
        key_path: key_path.to_path_buf(),
        key_type: KeyType::of(&key),
        key_length: key.bits(),
        subject_common_name: inspect::subject_common_name(&cert),
        expiry: inspect::expiry(&cert)?,
        sha1_fingerprint: fingerprints.sha1,
        md5_fingerprint: fingerprints.md5,
        assignments: Vec::new(),
    })
}

fn load_authority(name: &str, cert_path: &Path, key_path: &Path) -> Result<CertificateAuthority> {
    let cert_pem = material_files::read("authority certificate", name, cert_path)?;
    let cert = X509::from_pem(&cert_pem)?;
    Ok(CertificateAuthority {
        name: name.to_string(),
        cert_path: cert_path.to_path_buf(),
        key_path: key_path.to_path_buf(),
        expiry: inspect::expiry(&cert)?,
    })
}

/// Locked view of the certificates namespace.
pub struct CertificateNamespace<'a> {
    store: &'a MaterialStore,
    state: MutexGuard<'a, NamespaceState<Certificate>>,
}

impl CertificateNamespace<'_> {
    fn records(&mut self) -> Result<&mut Vec<Certificate>> {
        if let NamespaceState::Empty = *self.state {
            let scanned = self.store.scan_certificates()?;
            *self.state = NamespaceState::Populated(scanned);
        }
        match &mut *self.state {
            NamespaceState::Populated(records) => Ok(records),
            NamespaceState::Empty => unreachable!("namespace populated above"),
        }
    }

    pub fn list(&mut self, filter: &dyn Filter<Certificate>) -> Result<Vec<Certificate>> {
        Ok(self
            .records()?
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    pub fn get(&mut self, name: &str) -> Result<Option<Certificate>> {
        Ok(self.records()?.iter().find(|c| c.name == name).cloned())
    }

    pub fn contains(&mut self, name: &str) -> Result<bool> {
        Ok(self.records()?.iter().any(|c| c.name == name))
    }

    /// Record a certificate whose files were just written.
    pub fn append(&mut self, cert: Certificate) {
        if let NamespaceState::Populated(records) = &mut *self.state {
            records.retain(|c| c.name != cert.name);
            records.push(cert);
        }
    }

    /// Forget a certificate whose files were just deleted.
    pub fn remove(&mut self, name: &str) -> Option<Certificate> {
        match &mut *self.state {
            NamespaceState::Populated(records) => {
                let index = records.iter().position(|c| c.name == name)?;
                Some(records.remove(index))
            }
            NamespaceState::Empty => None,
        }
    }

    /// Move `assignment` to `holder`, dropping it from every other record.
    pub fn reassign(&mut self, holder: &str, assignment: &Assignment) {
        if let NamespaceState::Populated(records) = &mut *self.state {
            for cert in records.iter_mut() {
                if cert.name == holder {
                    if !cert.assignments.contains(assignment) {
                        cert.assignments.push(assignment.clone());
                    }
                } else {
                    cert.assignments.retain(|a| a != assignment);
                }
            }
        }
    }

    /// Drop `assignment` from every record.
    pub fn unassign(&mut self, assignment: &Assignment) {
        if let NamespaceState::Populated(records) = &mut *self.state {
            for cert in records.iter_mut() {
                cert.assignments.retain(|a| a != assignment);
            }
        }
    }
}

/// Locked view of the authorities namespace.
pub struct AuthorityNamespace<'a> {
    store: &'a MaterialStore,
    state: MutexGuard<'a, NamespaceState<CertificateAuthority>>,
}

impl AuthorityNamespace<'_> {
    fn records(&mut self) -> Result<&mut Vec<CertificateAuthority>> {
        if let NamespaceState::Empty = *self.state {
            let scanned = self.store.scan_authorities()?;
            *self.state = NamespaceState::Populated(scanned);
        }
        match &mut *self.state {
            NamespaceState::Populated(records) => Ok(records),
            NamespaceState::Empty => unreachable!("namespace populated above"),
        }
    }

    pub fn list(
        &mut self,
        filter: &dyn Filter<CertificateAuthority>,
    ) -> Result<Vec<CertificateAuthority>> {
        Ok(self
            .records()?
            .iter()
            .filter(|ca| filter.matches(ca))
            .cloned()
            .collect())
    }

    pub fn get(&mut self, name: &str) -> Result<Option<CertificateAuthority>> {
        Ok(self.records()?.iter().find(|ca| ca.name == name).cloned())
    }

    pub fn append(&mut self, ca: CertificateAuthority) {
        if let NamespaceState::Populated(records) = &mut *self.state {
            records.retain(|c| c.name != ca.name);
            records.push(ca);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<CertificateAuthority> {
        match &mut *self.state {
            NamespaceState::Populated(records) => {
                let index = records.iter().position(|ca| ca.name == name)?;
                Some(records.remove(index))
            }
            NamespaceState::Empty => None,
        }
    }
}
