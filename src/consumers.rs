//! Collaborators that consume certificates, and the settings they are
//! configured through.
//!
//! Assignment state is never stored by this crate. It is read back from these
//! collaborators by [`Consumers::derive_assignments`] every time it is needed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use toml::{Table, Value};

use crate::error::ConsumerError;
use crate::records::{Assignment, Certificate};

pub const ADMIN_UI_SECTION: &str = "admin_ui";
pub const ADMIN_UI_CERT_FILE: &str = "cert_file";
pub const ADMIN_UI_CERT_KEY: &str = "cert_key";
pub const ADMIN_UI_SSL_ENABLED: &str = "ssl_enabled";
pub const PLUGIN_CERT_KEY: &str = "cert";
pub const PLUGIN_SECTION_PREFIX: &str = "ssl_";

/// Settings section that records which certificate a plugin serves.
pub fn plugin_section(plugin_id: &str) -> String {
    format!("{}{}", PLUGIN_SECTION_PREFIX, plugin_id)
}

/// Sectioned key/value settings. `set` only stages a change; `save` makes it
/// durable.
pub trait ConfigStore: Send + Sync {
    fn sections(&self) -> Vec<String>;
    fn get(&self, section: &str, key: &str) -> Option<Value>;
    fn set(&self, section: &str, key: &str, value: Value);
    fn save(&self) -> Result<(), ConsumerError>;
}

/// A hosted website with TLS enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSite {
    pub name: String,
    pub cert_name: String,
}

pub trait WebsiteManager: Send + Sync {
    fn sites_with_tls(&self) -> Result<Vec<TlsSite>, ConsumerError>;
    fn enable_tls(&self, site: &str, cert: &Certificate) -> Result<(), ConsumerError>;
    fn disable_tls(&self, site: &str) -> Result<(), ConsumerError>;
    fn reload_proxy(&self) -> Result<(), ConsumerError>;
}

/// A running plugin that can serve TLS.
pub trait TlsPlugin: Send + Sync {
    fn id(&self) -> &str;
    fn enable_tls(&self, cert: &Certificate) -> Result<(), ConsumerError>;
    fn disable_tls(&self) -> Result<(), ConsumerError>;
}

pub trait PluginRegistry: Send + Sync {
    fn plugin_ids(&self) -> Vec<String>;
    fn get(&self, id: &str) -> Option<Arc<dyn TlsPlugin>>;
}

/// Everything a certificate can be assigned to.
#[derive(Clone)]
pub struct Consumers {
    pub config: Arc<dyn ConfigStore>,
    pub websites: Arc<dyn WebsiteManager>,
    pub plugins: Arc<dyn PluginRegistry>,
}

impl Consumers {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        websites: Arc<dyn WebsiteManager>,
        plugins: Arc<dyn PluginRegistry>,
    ) -> Self {
        Self {
            config,
            websites,
            plugins,
        }
    }

    /// Only the settings store; no websites and no plugins.
    pub fn standalone(config: Arc<dyn ConfigStore>) -> Self {
        Self::new(
            config,
            Arc::new(NoWebsites),
            Arc::new(StaticPluginRegistry::default()),
        )
    }

    /// Map of certificate name to the consumers currently serving it.
    ///
    /// Each consumer is read on its own. One that cannot be listed is logged
    /// and contributes nothing, so the others still show up.
    pub fn derive_assignments(&self) -> HashMap<String, Vec<Assignment>> {
        let mut assigned: HashMap<String, Vec<Assignment>> = HashMap::new();

        match self.websites.sites_with_tls() {
            Ok(sites) => {
                for site in sites {
                    assigned
                        .entry(site.cert_name)
                        .or_default()
                        .push(Assignment::Website(site.name));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not list websites, omitting website assignments");
            }
        }

        for id in self.known_plugin_ids() {
            let cert_name = self
                .config
                .get(&plugin_section(&id), PLUGIN_CERT_KEY)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            if !cert_name.is_empty() {
                assigned
                    .entry(cert_name)
                    .or_default()
                    .push(Assignment::Plugin(id));
            }
        }

        if let Some(cert_name) = self.admin_ui_certificate() {
            assigned
                .entry(cert_name)
                .or_default()
                .push(Assignment::AdminUi);
        }

        assigned
    }

    /// Loaded plugins plus any plugin that still has a TLS settings section.
    fn known_plugin_ids(&self) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = self.plugins.plugin_ids().into_iter().collect();
        ids.extend(
            self.config
                .sections()
                .into_iter()
                .filter_map(|section| section.strip_prefix(PLUGIN_SECTION_PREFIX).map(str::to_string))
                .filter(|id| !id.is_empty()),
        );
        ids
    }

    /// Name of the certificate the admin UI serves, if TLS is enabled for it.
    pub fn admin_ui_certificate(&self) -> Option<String> {
        let enabled = self
            .config
            .get(ADMIN_UI_SECTION, ADMIN_UI_SSL_ENABLED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !enabled {
            return None;
        }
        let cert_file = self
            .config
            .get(ADMIN_UI_SECTION, ADMIN_UI_CERT_FILE)
            .and_then(|v| v.as_str().map(str::to_string))?;
        Path::new(&cert_file)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Settings kept in a TOML document on disk.
pub struct TomlConfigStore {
    path: PathBuf,
    document: Mutex<Table>,
}

impl TomlConfigStore {
    /// Load `path`, starting from an empty document when it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConsumerError> {
        let path = path.into();
        let document = match fs::read_to_string(&path) {
            Ok(text) => text
                .parse::<Table>()
                .map_err(|e| ConsumerError::Failed(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Table::new(),
            Err(e) => return Err(ConsumerError::Io(e)),
        };
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for TomlConfigStore {
    fn sections(&self) -> Vec<String> {
        let document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        document
            .iter()
            .filter(|(_, value)| value.is_table())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn get(&self, section: &str, key: &str) -> Option<Value> {
        let document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        document
            .get(section)
            .and_then(|s| s.as_table())
            .and_then(|s| s.get(key))
            .cloned()
    }

    fn set(&self, section: &str, key: &str, value: Value) {
        let mut document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = document
            .entry(section.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        if let Value::Table(table) = entry {
            table.insert(key.to_string(), value);
        }
    }

    fn save(&self) -> Result<(), ConsumerError> {
        let text = {
            let document = self.document.lock().unwrap_or_else(PoisonError::into_inner);
            toml::to_string_pretty(&*document)
                .map_err(|e| ConsumerError::Failed(format!("failed to serialize settings: {}", e)))?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, text)?;
        Ok(())
    }
}

/// Website manager for hosts that serve no websites.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWebsites;

impl WebsiteManager for NoWebsites {
    fn sites_with_tls(&self) -> Result<Vec<TlsSite>, ConsumerError> {
        Ok(Vec::new())
    }

    fn enable_tls(&self, site: &str, _cert: &Certificate) -> Result<(), ConsumerError> {
        Err(ConsumerError::NotFound {
            kind: "website",
            reference: site.to_string(),
        })
    }

    fn disable_tls(&self, site: &str) -> Result<(), ConsumerError> {
        Err(ConsumerError::NotFound {
            kind: "website",
            reference: site.to_string(),
        })
    }

    fn reload_proxy(&self) -> Result<(), ConsumerError> {
        Ok(())
    }
}

/// Plugins registered up front by the host application.
#[derive(Default)]
pub struct StaticPluginRegistry {
    plugins: Mutex<BTreeMap<String, Arc<dyn TlsPlugin>>>,
}

impl StaticPluginRegistry {
    pub fn register(&self, plugin: Arc<dyn TlsPlugin>) {
        self.plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin.id().to_string(), plugin);
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn TlsPlugin>> {
        self.plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }
}

impl PluginRegistry for StaticPluginRegistry {
    fn plugin_ids(&self) -> Vec<String> {
        self.plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn get(&self, id: &str) -> Option<Arc<dyn TlsPlugin>> {
        self.plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}
