//! Certificate Manager
//!
//! Creates CA-signed leaf certificates, imports uploaded ones, and removes
//! them again. Every write lands on disk before the cache is touched; every
//! removal deactivates consumers before the files go away.
//!
//! # Example
//! ```no_run
//! # use certkeeper::certificate_manager::CertificateManager;
//! # use certkeeper::generate_leaf::SubjectFields;
//! # use certkeeper::records::KeyType;
//! # fn example(manager: &CertificateManager) -> certkeeper::error::Result<()> {
//! let cert = manager.create(
//!     "files",
//!     SubjectFields::common_name("files.example.org"),
//!     KeyType::Rsa,
//!     2048,
//!     "files.example.org",
//! )?;
//! manager.remove(&cert)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::x509::X509;

use crate::assignment::{AssignmentRouter, Outcome};
use crate::authority_manager::AuthorityManager;
use crate::configs::IssuanceDefaults;
use crate::error::{CertError, PemKind, Result};
use crate::generate_leaf::{LeafBuilder, SubjectFields};
use crate::material_files::{self, PemFile};
use crate::records::{Assignment, Certificate, CertificateAuthority, Filter, KeyType};
use crate::storage::{self, MaterialStore};

pub struct CertificateManager {
    store: Arc<MaterialStore>,
    authorities: Arc<AuthorityManager>,
    router: Arc<AssignmentRouter>,
    issuance: IssuanceDefaults,
}

impl CertificateManager {
    pub fn new(
        store: Arc<MaterialStore>,
        authorities: Arc<AuthorityManager>,
        router: Arc<AssignmentRouter>,
        issuance: IssuanceDefaults,
    ) -> Self {
        Self {
            store,
            authorities,
            router,
            issuance,
        }
    }

    pub fn list(&self, filter: &dyn Filter<Certificate>) -> Result<Vec<Certificate>> {
        self.store.list_certificates(filter)
    }

    pub fn get(&self, name: &str) -> Result<Certificate> {
        self.store
            .certificates()
            .get(name)?
            .ok_or_else(|| CertError::not_found("certificate", name, self.store.cert_path(name)))
    }

    /// Issue a new leaf for `hostname`, signed by the CA of its base domain.
    ///
    /// The CA is created on demand. The new certificate has no assignments.
    pub fn create(
        &self,
        name: &str,
        subject: SubjectFields,
        key_type: KeyType,
        key_length: u32,
        hostname: &str,
    ) -> Result<Certificate> {
        validate_name(name)?;
        let domain = base_domain(hostname)?;
        if !matches!(key_type, KeyType::Rsa | KeyType::Dsa) {
            return Err(CertError::UnsupportedKeyType(key_type.to_string()));
        }

        let mut certs = self.store.certificates();
        self.ensure_unused(&mut certs, name)?;

        let ca_unavailable = |source: CertError| CertError::CaUnavailable {
            domain: domain.clone(),
            source: Box::new(source),
        };
        let ca = self
            .authorities
            .find_or_create(&domain)
            .map_err(ca_unavailable)?;
        let (ca_key, ca_cert) = self.authorities.load_material(&ca).map_err(ca_unavailable)?;

        let (key, cert) = LeafBuilder::new(&ca_key, &ca_cert)
            .subject(subject)
            .organization(self.issuance.organization.as_str())
            .hostname(hostname)
            .key(key_type, key_length)
            .validity_days(self.issuance.leaf_validity_days)
            .serial(self.authorities.serials().next_asn1()?)
            .build()
            .map_err(|e| CertError::Generation {
                name: name.to_string(),
                reason: format!("{:#}", e),
            })?;

        let cert_path = self.store.cert_path(name);
        let key_path = self.store.key_path(name);
        material_files::write_pair(
            PemFile {
                path: &cert_path,
                contents: &cert.to_pem()?,
            },
            PemFile {
                path: &key_path,
                contents: &key.private_key_to_pem_pkcs8()?,
            },
            self.store.policy(),
        )?;

        let record = storage::load_certificate(name, &cert_path, &key_path)?;
        certs.append(record.clone());
        tracing::info!(
            name = %name,
            hostname = %hostname,
            authority = %ca.name,
            key_type = %record.key_type,
            "created certificate"
        );
        Ok(record)
    }

    /// Import a pre-signed certificate and key, then apply `assign`.
    ///
    /// `chain_pem` is appended to the certificate file, separated by a newline
    /// if `cert_pem` does not already end with one. Once the files are written
    /// the upload stands: an assignment whose consumer is gone or fails is
    /// logged and left off the returned record.
    pub fn upload(
        &self,
        name: &str,
        cert_pem: &str,
        key_pem: &str,
        chain_pem: Option<&str>,
        assign: &[Assignment],
    ) -> Result<Certificate> {
        validate_name(name)?;
        let cert = X509::from_pem(cert_pem.as_bytes())
            .map_err(|e| parse_error(PemKind::Certificate, name, e))?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes())
            .map_err(|e| parse_error(PemKind::PrivateKey, name, e))?;
        if !cert.public_key()?.public_eq(&key) {
            return Err(CertError::KeyMismatch {
                name: name.to_string(),
            });
        }

        let mut certs = self.store.certificates();
        self.ensure_unused(&mut certs, name)?;

        let cert_path = self.store.cert_path(name);
        let key_path = self.store.key_path(name);
        material_files::write_pair(
            PemFile {
                path: &cert_path,
                contents: with_chain(cert_pem, chain_pem).as_bytes(),
            },
            PemFile {
                path: &key_path,
                contents: key_pem.as_bytes(),
            },
            self.store.policy(),
        )?;

        let mut record = storage::load_certificate(name, &cert_path, &key_path)?;
        certs.append(record.clone());
        tracing::info!(name = %name, key_type = %record.key_type, "uploaded certificate");

        for assignment in assign {
            match self.router.apply_locked(&mut certs, &record, assignment) {
                Ok(Outcome::Done) if !record.is_assigned_to(assignment) => {
                    record.assignments.push(assignment.clone());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(name = %name, assignment = %assignment, error = %e, "failed to apply assignment");
                }
            }
        }
        Ok(record)
    }

    /// Deactivate every consumer of `cert`, then delete its files.
    ///
    /// The consumers are read fresh and merged with the assignments cached
    /// for that name.
    /// The certificates namespace stays locked from that read until the
    /// record is evicted. Consumer failures are logged and do not stop the
    /// deletion. Removing a certificate that is already gone succeeds.
    pub fn remove(&self, cert: &Certificate) -> Result<()> {
        let mut certs = self.store.certificates();

        let mut assignments = self
            .router
            .derive_assignments()
            .remove(&cert.name)
            .unwrap_or_default();
        let cached = match certs.get(&cert.name) {
            Ok(record) => record.map(|r| r.assignments).unwrap_or_default(),
            Err(e) => {
                tracing::warn!(name = %cert.name, error = %e, "could not read cached assignments");
                Vec::new()
            }
        };
        for assignment in cached {
            if !assignments.contains(&assignment) {
                assignments.push(assignment);
            }
        }

        for assignment in &assignments {
            if let Err(e) = self.router.revert_locked(&mut certs, assignment) {
                tracing::warn!(name = %cert.name, assignment = %assignment, error = %e, "failed to revert assignment");
            }
        }

        material_files::remove_pair(&cert.cert_path, &cert.key_path)?;
        certs.remove(&cert.name);
        tracing::info!(name = %cert.name, reverted = assignments.len(), "removed certificate");
        Ok(())
    }

    /// Delete a CA. Certificates it signed are left alone.
    pub fn remove_authority(&self, ca: &CertificateAuthority) -> Result<()> {
        self.authorities.remove(ca)
    }

    fn ensure_unused(&self, certs: &mut storage::CertificateNamespace<'_>, name: &str) -> Result<()> {
        if certs.contains(name)? || self.store.cert_path(name).exists() {
            return Err(CertError::DuplicateName {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_error(kind: PemKind, name: &str, error: ErrorStack) -> CertError {
    CertError::Parse {
        kind,
        name: name.to_string(),
        message: error.to_string(),
    }
}

fn with_chain(cert_pem: &str, chain_pem: Option<&str>) -> String {
    let mut contents = cert_pem.to_string();
    if let Some(chain) = chain_pem.filter(|c| !c.trim().is_empty()) {
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(chain);
    }
    contents
}

/// Certificate names double as file stems.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CertError::InvalidName(name.to_string()))
    }
}

/// The last two labels of `hostname`, or the hostname itself if it has one.
pub fn base_domain(hostname: &str) -> Result<String> {
    let labels: Vec<&str> = hostname.split('.').collect();
    let well_formed = !hostname.is_empty()
        && labels.iter().all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !well_formed {
        return Err(CertError::InvalidHostname(hostname.to_string()));
    }
    let start = labels.len().saturating_sub(2);
    Ok(labels[start..].join("."))
}
