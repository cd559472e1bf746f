//! Certkeeper - Certificate and CA Lifecycle Manager
//!
//! Issues, stores, fingerprints, assigns and removes the TLS material used by
//! a personal server: its admin UI, the websites it hosts and its plugins.
//!
//! # Overview
//!
//! Every leaf certificate is signed by a self-signed authority for the base
//! domain of its hostname. Authorities are created on first use:
//!
//! ```text
//! Domain CA (self-signed, CN=example.org, pathlen=0)
//!   ├── files.example.org (CA=false)
//!   └── mail.example.org  (CA=false)
//! Domain CA (self-signed, CN=other.org, pathlen=0)
//!   └── sub.other.org     (CA=false)
//! ```
//!
//! Uploaded certificates are stored as given and trusted as-is.
//!
//! # Module Overview
//!
//! - [`storage`]: lazily populated cache of certificates and authorities over
//!   the material directories
//! - [`authority_manager`]: find-or-create of domain CAs
//! - [`certificate_manager`]: create, upload and remove leaf certificates
//! - [`assignment`]: apply and revert assignments to the admin UI, websites
//!   and plugins
//! - [`consumers`]: collaborator traits plus the TOML settings store
//! - [`generate_authority`], [`generate_leaf`]: openssl certificate builders
//! - [`fingerprint`]: SHA-1 and MD5 key fingerprints
//!
//! # Files
//!
//! The filesystem is the only durable state. Assignments are never stored;
//! they are derived from the consumers whenever the cache is rebuilt.
//!
//! ```text
//! <cert_dir>/<name>.crt       leaf certificate (plus uploaded chain)
//! <key_dir>/<name>.key        leaf private key
//! <ca_cert_dir>/<domain>.pem  authority certificate
//! <ca_key_dir>/<domain>.key   authority private key
//! ```
//!
//! Pairs are written atomically with mode `0660` and the TLS group.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use certkeeper::configs::AppConfig;
//! use certkeeper::consumers::{Consumers, TomlConfigStore};
//! use certkeeper::generate_leaf::SubjectFields;
//! use certkeeper::records::{Assignment, KeyType};
//! use certkeeper::Certkeeper;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let settings = Arc::new(TomlConfigStore::open(&config.settings_path)?);
//!     let keeper = Certkeeper::from_config(&config, Consumers::standalone(settings))?;
//!
//!     let cert = keeper.certificates.create(
//!         "panel",
//!         SubjectFields::common_name("panel.example.org"),
//!         KeyType::Rsa,
//!         2048,
//!         "panel.example.org",
//!     )?;
//!     keeper.router.apply(&cert, &Assignment::AdminUi)?;
//!     Ok(())
//! }
//! ```

pub mod assignment;
pub mod authority_manager;
pub mod certificate_manager;
pub mod configs;
pub mod consumers;
pub mod error;
pub mod fingerprint;
pub mod generate_authority;
pub mod generate_leaf;
pub mod inspect;
pub mod material_files;
pub mod records;
pub mod serial;
pub mod storage;

use std::sync::Arc;

use assignment::AssignmentRouter;
use authority_manager::AuthorityManager;
use certificate_manager::CertificateManager;
use configs::{AppConfig, Directories, IssuanceDefaults};
use consumers::Consumers;
use material_files::FilePolicy;
use serial::SerialCounter;
use storage::MaterialStore;

/// The components wired around one shared [`MaterialStore`].
pub struct Certkeeper {
    pub store: Arc<MaterialStore>,
    pub authorities: Arc<AuthorityManager>,
    pub router: Arc<AssignmentRouter>,
    pub certificates: CertificateManager,
}

impl Certkeeper {
    pub fn open(
        directories: Directories,
        issuance: IssuanceDefaults,
        policy: FilePolicy,
        consumers: Consumers,
    ) -> error::Result<Self> {
        let store = Arc::new(MaterialStore::open(directories, policy, consumers)?);
        let authorities = Arc::new(AuthorityManager::new(
            Arc::clone(&store),
            issuance.clone(),
            Arc::new(SerialCounter::new()),
        ));
        let router = Arc::new(AssignmentRouter::new(Arc::clone(&store)));
        let certificates = CertificateManager::new(
            Arc::clone(&store),
            Arc::clone(&authorities),
            Arc::clone(&router),
            issuance,
        );
        Ok(Self {
            store,
            authorities,
            router,
            certificates,
        })
    }

    /// Open with the configured directories, issuance defaults and TLS group.
    pub fn from_config(config: &AppConfig, consumers: Consumers) -> error::Result<Self> {
        Self::open(
            config.directories.clone(),
            config.issuance.clone(),
            FilePolicy::for_group(&config.issuance.tls_group),
            consumers,
        )
    }
}
