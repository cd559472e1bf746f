//! Assignment Router
//!
//! Applies and reverts certificate assignments against the consumers that
//! serve them. [`AssignmentRouter::apply`] and [`AssignmentRouter::revert`]
//! are the only entry points; each picks the binding for the assignment's
//! consumer type and, once the consumer has been updated, mirrors the change
//! into the material store cache.
//!
//! Websites and plugins can disappear between listing and use. A missing one
//! is reported as [`CertError::ConsumerUnreachable`] by the binding, logged
//! here, and skipped. The admin UI lives in the settings store and is always
//! reachable, but a failed settings save is returned to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use toml::Value;

use crate::consumers::{
    plugin_section, Consumers, ADMIN_UI_CERT_FILE, ADMIN_UI_CERT_KEY, ADMIN_UI_SECTION,
    ADMIN_UI_SSL_ENABLED, PLUGIN_CERT_KEY,
};
use crate::error::{CertError, ConsumerError, Result};
use crate::records::{Assignment, Certificate};
use crate::storage::{CertificateNamespace, MaterialStore};

/// What happened to a consumer during apply or revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// The consumer was gone; nothing changed.
    Skipped,
}

/// Per-consumer-type behaviour behind the router.
trait Binding {
    fn apply(&self, consumers: &Consumers, cert: &Certificate) -> Result<()>;
    fn revert(&self, consumers: &Consumers) -> Result<()>;
}

struct AdminUiBinding;

struct WebsiteBinding<'a> {
    site: &'a str,
}

struct PluginBinding<'a> {
    id: &'a str,
}

fn binding_for(assignment: &Assignment) -> Box<dyn Binding + '_> {
    match assignment {
        Assignment::AdminUi => Box::new(AdminUiBinding),
        Assignment::Website(site) => Box::new(WebsiteBinding { site: site.as_str() }),
        Assignment::Plugin(id) => Box::new(PluginBinding { id: id.as_str() }),
    }
}

/// Map a collaborator failure, turning "not found" into unreachable.
fn consumer_failure(consumer: String, error: ConsumerError) -> CertError {
    match error {
        e @ ConsumerError::NotFound { .. } => CertError::ConsumerUnreachable {
            consumer,
            reason: e.to_string(),
        },
        source => CertError::Consumer { consumer, source },
    }
}

fn save_settings(consumers: &Consumers) -> Result<()> {
    consumers.config.save().map_err(CertError::Config)
}

impl Binding for AdminUiBinding {
    fn apply(&self, consumers: &Consumers, cert: &Certificate) -> Result<()> {
        let config = &consumers.config;
        config.set(
            ADMIN_UI_SECTION,
            ADMIN_UI_CERT_FILE,
            Value::from(cert.cert_path.display().to_string()),
        );
        config.set(
            ADMIN_UI_SECTION,
            ADMIN_UI_CERT_KEY,
            Value::from(cert.key_path.display().to_string()),
        );
        config.set(ADMIN_UI_SECTION, ADMIN_UI_SSL_ENABLED, Value::Boolean(true));
        save_settings(consumers)
    }

    fn revert(&self, consumers: &Consumers) -> Result<()> {
        let config = &consumers.config;
        config.set(ADMIN_UI_SECTION, ADMIN_UI_CERT_FILE, Value::from(""));
        config.set(ADMIN_UI_SECTION, ADMIN_UI_CERT_KEY, Value::from(""));
        config.set(ADMIN_UI_SECTION, ADMIN_UI_SSL_ENABLED, Value::Boolean(false));
        save_settings(consumers)
    }
}

impl WebsiteBinding<'_> {
    fn label(&self) -> String {
        format!("website '{}'", self.site)
    }

    fn reload(&self, consumers: &Consumers) -> Result<()> {
        consumers
            .websites
            .reload_proxy()
            .map_err(|e| consumer_failure("reverse proxy".to_string(), e))
    }
}

impl Binding for WebsiteBinding<'_> {
    fn apply(&self, consumers: &Consumers, cert: &Certificate) -> Result<()> {
        consumers
            .websites
            .enable_tls(self.site, cert)
            .map_err(|e| consumer_failure(self.label(), e))?;
        self.reload(consumers)
    }

    fn revert(&self, consumers: &Consumers) -> Result<()> {
        consumers
            .websites
            .disable_tls(self.site)
            .map_err(|e| consumer_failure(self.label(), e))?;
        self.reload(consumers)
    }
}

impl PluginBinding<'_> {
    fn label(&self) -> String {
        format!("plugin '{}'", self.id)
    }

    fn unreachable(&self) -> CertError {
        CertError::ConsumerUnreachable {
            consumer: self.label(),
            reason: "plugin is not loaded".to_string(),
        }
    }
}

impl Binding for PluginBinding<'_> {
    fn apply(&self, consumers: &Consumers, cert: &Certificate) -> Result<()> {
        consumers.config.set(
            &plugin_section(self.id),
            PLUGIN_CERT_KEY,
            Value::from(cert.name.as_str()),
        );
        save_settings(consumers)?;

        let plugin = consumers
            .plugins
            .get(self.id)
            .ok_or_else(|| self.unreachable())?;
        plugin
            .enable_tls(cert)
            .map_err(|e| consumer_failure(self.label(), e))
    }

    fn revert(&self, consumers: &Consumers) -> Result<()> {
        consumers
            .config
            .set(&plugin_section(self.id), PLUGIN_CERT_KEY, Value::from(""));
        save_settings(consumers)?;

        let plugin = consumers
            .plugins
            .get(self.id)
            .ok_or_else(|| self.unreachable())?;
        plugin
            .disable_tls()
            .map_err(|e| consumer_failure(self.label(), e))
    }
}

pub struct AssignmentRouter {
    store: Arc<MaterialStore>,
}

impl AssignmentRouter {
    pub fn new(store: Arc<MaterialStore>) -> Self {
        Self { store }
    }

    /// Make `cert` the certificate served by `assignment`'s consumer. Any
    /// certificate previously holding the same assignment loses it.
    pub fn apply(&self, cert: &Certificate, assignment: &Assignment) -> Result<Outcome> {
        let mut certs = self.store.certificates();
        self.apply_locked(&mut certs, cert, assignment)
    }

    /// [`apply`](Self::apply) for a caller already holding the certificates
    /// namespace. The guard stays held across the consumer update and the
    /// cache change, so two applies of one assignment cannot interleave.
    pub fn apply_locked(
        &self,
        certs: &mut CertificateNamespace<'_>,
        cert: &Certificate,
        assignment: &Assignment,
    ) -> Result<Outcome> {
        let consumers = self.store.consumers();
        match binding_for(assignment).apply(consumers, cert) {
            Ok(()) => {}
            Err(CertError::ConsumerUnreachable { consumer, reason }) => {
                tracing::warn!(name = %cert.name, consumer = %consumer, reason = %reason, "skipping assignment");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        }

        certs.reassign(&cert.name, assignment);
        tracing::info!(name = %cert.name, assignment = %assignment, "certificate assigned");
        Ok(Outcome::Done)
    }

    /// Stop `assignment`'s consumer from serving any certificate.
    pub fn revert(&self, assignment: &Assignment) -> Result<Outcome> {
        let mut certs = self.store.certificates();
        self.revert_locked(&mut certs, assignment)
    }

    /// [`revert`](Self::revert) under a held certificates namespace.
    pub fn revert_locked(
        &self,
        certs: &mut CertificateNamespace<'_>,
        assignment: &Assignment,
    ) -> Result<Outcome> {
        let consumers = self.store.consumers();
        let outcome = match binding_for(assignment).revert(consumers) {
            Ok(()) => Outcome::Done,
            Err(CertError::ConsumerUnreachable { consumer, reason }) => {
                tracing::warn!(consumer = %consumer, reason = %reason, "consumer gone during revert");
                Outcome::Skipped
            }
            Err(e) => return Err(e),
        };

        certs.unassign(assignment);
        tracing::info!(assignment = %assignment, "assignment reverted");
        Ok(outcome)
    }

    /// Certificate name to assignments, read from the live consumers.
    pub fn derive_assignments(&self) -> HashMap<String, Vec<Assignment>> {
        self.store.consumers().derive_assignments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::Directories;
    use crate::consumers::{
        ConfigStore, NoWebsites, StaticPluginRegistry, TlsPlugin, TlsSite, TomlConfigStore,
        WebsiteManager,
    };
    use crate::material_files::FilePolicy;
    use crate::records::{CertificateFilter, ConsumerType, KeyType};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeSites {
        enabled: Mutex<Vec<TlsSite>>,
        reloads: AtomicUsize,
    }

    impl WebsiteManager for FakeSites {
        fn sites_with_tls(&self) -> std::result::Result<Vec<TlsSite>, ConsumerError> {
            Ok(self.enabled.lock().unwrap().clone())
        }

        fn enable_tls(&self, site: &str, cert: &Certificate) -> std::result::Result<(), ConsumerError> {
            if site == "missing" {
                return Err(ConsumerError::NotFound {
                    kind: "website",
                    reference: site.to_string(),
                });
            }
            let mut enabled = self.enabled.lock().unwrap();
            enabled.retain(|s| s.name != site);
            enabled.push(TlsSite {
                name: site.to_string(),
                cert_name: cert.name.clone(),
            });
            Ok(())
        }

        fn disable_tls(&self, site: &str) -> std::result::Result<(), ConsumerError> {
            self.enabled.lock().unwrap().retain(|s| s.name != site);
            Ok(())
        }

        fn reload_proxy(&self) -> std::result::Result<(), ConsumerError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakePlugin {
        serving: Mutex<Option<String>>,
    }

    impl TlsPlugin for FakePlugin {
        fn id(&self) -> &str {
            "xmpp"
        }

        fn enable_tls(&self, cert: &Certificate) -> std::result::Result<(), ConsumerError> {
            *self.serving.lock().unwrap() = Some(cert.name.clone());
            Ok(())
        }

        fn disable_tls(&self) -> std::result::Result<(), ConsumerError> {
            *self.serving.lock().unwrap() = None;
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: Arc<TomlConfigStore>,
        sites: Arc<FakeSites>,
        plugin: Arc<FakePlugin>,
        store: Arc<MaterialStore>,
        router: AssignmentRouter,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(TomlConfigStore::open(dir.path().join("settings.toml")).unwrap());
        let sites = Arc::new(FakeSites::default());
        let plugin = Arc::new(FakePlugin::default());
        let registry = Arc::new(StaticPluginRegistry::default());
        registry.register(plugin.clone());

        let consumers = Consumers::new(config.clone(), sites.clone(), registry);
        let store = Arc::new(
            MaterialStore::open(
                Directories::under(dir.path()),
                FilePolicy::without_group(),
                consumers,
            )
            .unwrap(),
        );
        let router = AssignmentRouter::new(store.clone());
        Fixture {
            _dir: dir,
            config,
            sites,
            plugin,
            store,
            router,
        }
    }

    /// Cache a record directly; the router never touches material files.
    fn cached(store: &MaterialStore, name: &str) -> Certificate {
        let cert = Certificate {
            name: name.to_string(),
            cert_path: store.cert_path(name),
            key_path: store.key_path(name),
            key_type: KeyType::Rsa,
            key_length: 1024,
            subject_common_name: format!("{}.example.org", name),
            expiry: Utc::now(),
            sha1_fingerprint: String::new(),
            md5_fingerprint: String::new(),
            assignments: Vec::new(),
        };
        let mut certs = store.certificates();
        certs.list(&CertificateFilter::all()).unwrap();
        certs.append(cert.clone());
        cert
    }

    fn holders(store: &MaterialStore, consumer_type: ConsumerType) -> Vec<String> {
        store
            .list_certificates(&CertificateFilter::assigned_to(consumer_type))
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    #[test]
    fn test_admin_ui_apply_writes_settings() {
        let f = fixture();
        let cert = cached(&f.store, "panel");

        assert_eq!(f.router.apply(&cert, &Assignment::AdminUi).unwrap(), Outcome::Done);

        let reopened = TomlConfigStore::open(f.config.path()).unwrap();
        assert_eq!(
            reopened.get(ADMIN_UI_SECTION, ADMIN_UI_SSL_ENABLED),
            Some(Value::Boolean(true))
        );
        assert_eq!(
            reopened.get(ADMIN_UI_SECTION, ADMIN_UI_CERT_FILE),
            Some(Value::from(cert.cert_path.display().to_string()))
        );
        assert_eq!(holders(&f.store, ConsumerType::AdminUi), vec!["panel"]);
    }

    #[test]
    fn test_second_admin_ui_assignment_supersedes() {
        let f = fixture();
        let first = cached(&f.store, "old");
        let second = cached(&f.store, "new");

        f.router.apply(&first, &Assignment::AdminUi).unwrap();
        f.router.apply(&second, &Assignment::AdminUi).unwrap();

        assert_eq!(holders(&f.store, ConsumerType::AdminUi), vec!["new"]);
        assert_eq!(f.store.consumers().admin_ui_certificate().as_deref(), Some("new"));
    }

    #[test]
    fn test_admin_ui_revert_disables_tls() {
        let f = fixture();
        let cert = cached(&f.store, "panel");
        f.router.apply(&cert, &Assignment::AdminUi).unwrap();

        f.router.revert(&Assignment::AdminUi).unwrap();
        assert_eq!(
            f.config.get(ADMIN_UI_SECTION, ADMIN_UI_SSL_ENABLED),
            Some(Value::Boolean(false))
        );
        assert!(holders(&f.store, ConsumerType::AdminUi).is_empty());
    }

    #[test]
    fn test_website_apply_and_revert_reload_once_each() {
        let f = fixture();
        let cert = cached(&f.store, "blog");
        let site = Assignment::Website("blog.example.org".to_string());

        f.router.apply(&cert, &site).unwrap();
        assert_eq!(f.sites.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(f.sites.enabled.lock().unwrap().len(), 1);

        f.router.revert(&site).unwrap();
        assert_eq!(f.sites.reloads.load(Ordering::SeqCst), 2);
        assert!(f.sites.enabled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_website_is_skipped() {
        let f = fixture();
        let cert = cached(&f.store, "blog");

        let outcome = f
            .router
            .apply(&cert, &Assignment::Website("missing".to_string()))
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(f.sites.reloads.load(Ordering::SeqCst), 0);
        assert!(holders(&f.store, ConsumerType::Website).is_empty());
    }

    #[test]
    fn test_plugin_apply_records_setting_and_enables() {
        let f = fixture();
        let cert = cached(&f.store, "chat");
        let plugin = Assignment::Plugin("xmpp".to_string());

        f.router.apply(&cert, &plugin).unwrap();
        assert_eq!(f.plugin.serving.lock().unwrap().as_deref(), Some("chat"));
        assert_eq!(
            f.config.get(&plugin_section("xmpp"), PLUGIN_CERT_KEY),
            Some(Value::from("chat"))
        );
        let derived = f.router.derive_assignments();
        assert_eq!(derived.get("chat"), Some(&vec![plugin.clone()]));

        f.router.revert(&plugin).unwrap();
        assert_eq!(*f.plugin.serving.lock().unwrap(), None);
        assert!(f.router.derive_assignments().is_empty());
    }

    #[test]
    fn test_unloaded_plugin_is_skipped() {
        let f = fixture();
        let cert = cached(&f.store, "chat");

        let outcome = f
            .router
            .apply(&cert, &Assignment::Plugin("irc".to_string()))
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(
            f.router
                .revert(&Assignment::Plugin("irc".to_string()))
                .unwrap(),
            Outcome::Skipped
        );
    }

    #[test]
    fn test_no_websites_reports_unreachable() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(TomlConfigStore::open(dir.path().join("s.toml")).unwrap());
        let store = Arc::new(
            MaterialStore::open(
                Directories::under(dir.path()),
                FilePolicy::without_group(),
                Consumers::new(
                    config,
                    Arc::new(NoWebsites),
                    Arc::new(StaticPluginRegistry::default()),
                ),
            )
            .unwrap(),
        );
        let router = AssignmentRouter::new(store);
        assert_eq!(
            router
                .revert(&Assignment::Website("blog".to_string()))
                .unwrap(),
            Outcome::Skipped
        );
    }

    /// Settings store that stalls after pointing the admin UI at "old".
    struct StallingConfig {
        inner: TomlConfigStore,
    }

    impl ConfigStore for StallingConfig {
        fn sections(&self) -> Vec<String> {
            self.inner.sections()
        }

        fn get(&self, section: &str, key: &str) -> Option<Value> {
            self.inner.get(section, key)
        }

        fn set(&self, section: &str, key: &str, value: Value) {
            let stall = key == ADMIN_UI_CERT_FILE
                && value.as_str().is_some_and(|v| v.ends_with("/old.crt"));
            self.inner.set(section, key, value);
            if stall {
                std::thread::sleep(Duration::from_millis(200));
            }
        }

        fn save(&self) -> std::result::Result<(), ConsumerError> {
            self.inner.save()
        }
    }

    #[test]
    fn test_concurrent_admin_ui_applies_leave_one_holder() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(StallingConfig {
            inner: TomlConfigStore::open(dir.path().join("settings.toml")).unwrap(),
        });
        let store = Arc::new(
            MaterialStore::open(
                Directories::under(dir.path()),
                FilePolicy::without_group(),
                Consumers::new(
                    config.clone(),
                    Arc::new(NoWebsites),
                    Arc::new(StaticPluginRegistry::default()),
                ),
            )
            .unwrap(),
        );
        let router = AssignmentRouter::new(store.clone());
        let old = cached(&store, "old");
        let new = cached(&store, "new");

        std::thread::scope(|scope| {
            let first = scope.spawn(|| router.apply(&old, &Assignment::AdminUi).unwrap());
            std::thread::sleep(Duration::from_millis(50));
            router.apply(&new, &Assignment::AdminUi).unwrap();
            first.join().unwrap();
        });

        let stem = |key: &str| {
            let path = config.get(ADMIN_UI_SECTION, key).unwrap();
            Path::new(path.as_str().unwrap())
                .file_stem()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        };
        assert_eq!(stem(ADMIN_UI_CERT_FILE), stem(ADMIN_UI_CERT_KEY));

        let served = store.consumers().admin_ui_certificate().unwrap();
        assert_eq!(holders(&store, ConsumerType::AdminUi), vec![served]);
    }
}
