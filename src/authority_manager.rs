//! Domain certificate authorities: one self-signed CA per base domain,
//! created the first time a leaf for that domain is requested.

use std::sync::Arc;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::configs::IssuanceDefaults;
use crate::error::{CertError, Result};
use crate::generate_authority::AuthorityBuilder;
use crate::inspect;
use crate::material_files::{self, PemFile};
use crate::records::{CertificateAuthority, Filter};
use crate::serial::SerialCounter;
use crate::storage::MaterialStore;

pub struct AuthorityManager {
    store: Arc<MaterialStore>,
    issuance: IssuanceDefaults,
    serials: Arc<SerialCounter>,
}

impl AuthorityManager {
    pub fn new(
        store: Arc<MaterialStore>,
        issuance: IssuanceDefaults,
        serials: Arc<SerialCounter>,
    ) -> Self {
        Self {
            store,
            issuance,
            serials,
        }
    }

    pub fn serials(&self) -> &Arc<SerialCounter> {
        &self.serials
    }

    pub fn list(&self, filter: &dyn Filter<CertificateAuthority>) -> Result<Vec<CertificateAuthority>> {
        self.store.list_authorities(filter)
    }

    /// Return the CA for `base_domain`, generating and persisting it first if
    /// none exists. The authorities lock is held throughout, so concurrent
    /// callers for the same domain get the same CA.
    pub fn find_or_create(&self, base_domain: &str) -> Result<CertificateAuthority> {
        let mut authorities = self.store.authorities();
        if let Some(ca) = authorities.get(base_domain)? {
            tracing::debug!(domain = %base_domain, "reusing certificate authority");
            return Ok(ca);
        }

        let (key, cert) = AuthorityBuilder::new(base_domain)
            .organization(self.issuance.organization.as_str())
            .key_bits(self.issuance.ca_key_bits)
            .validity_days(self.issuance.ca_validity_days)
            .serial(self.serials.next_asn1()?)
            .build()
            .map_err(|e| CertError::Generation {
                name: base_domain.to_string(),
                reason: format!("{:#}", e),
            })?;

        let cert_path = self.store.ca_cert_path(base_domain);
        let key_path = self.store.ca_key_path(base_domain);
        let cert_pem = cert.to_pem()?;
        let key_pem = key.private_key_to_pem_pkcs8()?;
        material_files::write_pair(
            PemFile {
                path: &cert_path,
                contents: &cert_pem,
            },
            PemFile {
                path: &key_path,
                contents: &key_pem,
            },
            self.store.policy(),
        )?;

        let ca = CertificateAuthority {
            name: base_domain.to_string(),
            cert_path,
            key_path,
            expiry: inspect::expiry(&cert)?,
        };
        authorities.append(ca.clone());
        tracing::info!(domain = %base_domain, expiry = %ca.expiry, "created certificate authority");
        Ok(ca)
    }

    /// Read back the CA's key and certificate for signing.
    pub fn load_material(&self, ca: &CertificateAuthority) -> Result<(PKey<Private>, X509)> {
        let key_pem = material_files::read("authority key", &ca.name, &ca.key_path)?;
        let cert_pem = material_files::read("authority certificate", &ca.name, &ca.cert_path)?;
        let key = PKey::private_key_from_pem(&key_pem)?;
        let cert = X509::from_pem(&cert_pem)?;
        Ok((key, cert))
    }

    /// Delete the CA's files and forget it. Already-deleted files are fine.
    pub fn remove(&self, ca: &CertificateAuthority) -> Result<()> {
        let mut authorities = self.store.authorities();
        material_files::remove_pair(&ca.cert_path, &ca.key_path)?;
        authorities.remove(&ca.name);
        tracing::info!(domain = %ca.name, "removed certificate authority");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::Directories;
    use crate::consumers::{Consumers, TomlConfigStore};
    use crate::material_files::FilePolicy;
    use crate::records::AuthorityFilter;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> AuthorityManager {
        let config = Arc::new(TomlConfigStore::open(dir.path().join("settings.toml")).unwrap());
        let store = MaterialStore::open(
            Directories::under(dir.path()),
            FilePolicy::without_group(),
            Consumers::standalone(config),
        )
        .unwrap();
        let issuance = IssuanceDefaults {
            ca_key_bits: 1024,
            ..IssuanceDefaults::default()
        };
        AuthorityManager::new(Arc::new(store), issuance, Arc::new(SerialCounter::new()))
    }

    #[test]
    fn test_find_or_create_is_memoized() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let first = manager.find_or_create("example.org").unwrap();
        let second = manager.find_or_create("example.org").unwrap();
        assert_eq!(first, second);
        assert!(first.cert_path.is_file());
        assert!(first.key_path.is_file());
        assert_eq!(manager.list(&AuthorityFilter::all()).unwrap().len(), 1);
    }

    #[test]
    fn test_material_is_self_signed_ca() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let ca = manager.find_or_create("example.org").unwrap();

        let (key, cert) = manager.load_material(&ca).unwrap();
        assert!(cert.verify(&key).unwrap());
        assert_eq!(inspect::subject_common_name(&cert), "example.org");

        let text = String::from_utf8(cert.to_text().unwrap()).unwrap();
        assert!(text.contains("CA:TRUE, pathlen:0"));
        assert!(text.contains("Certificate Sign, CRL Sign"));
    }

    #[test]
    fn test_created_ca_survives_rescan() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let ca = manager.find_or_create("example.org").unwrap();

        manager
            .store
            .invalidate(crate::storage::Namespace::Authorities);
        let scanned = manager.list(&AuthorityFilter::named("example.org")).unwrap();
        assert_eq!(scanned, vec![ca]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let ca = manager.find_or_create("example.org").unwrap();

        manager.remove(&ca).unwrap();
        manager.remove(&ca).unwrap();
        assert!(!ca.cert_path.exists());
        assert!(manager.list(&AuthorityFilter::all()).unwrap().is_empty());
    }

    #[test]
    fn test_load_material_reports_missing_key() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let ca = manager.find_or_create("example.org").unwrap();
        std::fs::remove_file(&ca.key_path).unwrap();

        assert!(matches!(
            manager.load_material(&ca),
            Err(CertError::NotFound { .. })
        ));
    }

    #[test]
    fn test_concurrent_find_or_create_makes_one_authority() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let found: Vec<CertificateAuthority> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| manager.find_or_create("example.org").unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(found.iter().all(|ca| *ca == found[0]));

        let count = |path: &std::path::Path| std::fs::read_dir(path).unwrap().count();
        let dirs = manager.store.directories();
        assert_eq!(count(&dirs.ca_cert_dir), 1);
        assert_eq!(count(&dirs.ca_key_dir), 1);
        assert_eq!(manager.list(&AuthorityFilter::all()).unwrap().len(), 1);
    }
}
