//! Site configuration store and service registry.
//!
//! Two read-only collaborators of the dispatch subsystem live here: the
//! key-value site configuration (`site.json`) and the service registry
//! (`services.json`). Both are plain JSON files loaded once; neither is
//! mutated after load.

#![forbid(unsafe_code)]

use ops_proto::ServiceDescriptor;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Environment variables prefixed with this override site keys, e.g.
/// `OPSMAN_DEPLOY_ROOT` overrides the `deploy_root` entry.
const ENV_PREFIX: &str = "OPSMAN_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("service '{0}' not found in registry")]
    ServiceNotFound(String),

    #[error("config error: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// ─── Site configuration ──────────────────────────────────────────────────────

/// Key-value site configuration.
///
/// Missing keys yield `None`, never an error. Well-known keys: `site_id`,
/// `site_location`, `site_suffix`, `deploy_root`, `httpd_init_script`,
/// `installer`.
#[derive(Debug, Clone, Default)]
pub struct SiteConfig {
    values: HashMap<String, String>,
}

impl SiteConfig {
    /// Load from a JSON object of string values, then apply `OPSMAN_*`
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let values: HashMap<String, String> = serde_json::from_str(&data)?;
        debug!(count = values.len(), path = %path.display(), "loaded site config");

        let mut config = Self { values };
        config.apply_overrides(std::env::vars());
        Ok(config)
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Fold `OPSMAN_<KEY>` pairs into the store, lowercasing the key.
    fn apply_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (var, value) in vars {
            if let Some(key) = var.strip_prefix(ENV_PREFIX) {
                self.values.insert(key.to_ascii_lowercase(), value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Convenience for keys with a fallback value.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }
}

// ─── Service registry ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegistryFile {
    services: Vec<ServiceDescriptor>,
}

/// The registry of manageable services, in file order.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
    /// Load from a `{ "services": [ ... ] }` JSON file. Service names must
    /// be unique.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let file: RegistryFile = serde_json::from_str(&data)?;
        debug!(count = file.services.len(), path = %path.display(), "loaded service registry");
        Self::from_services(file.services)
    }

    pub fn from_services(services: Vec<ServiceDescriptor>) -> Result<Self, ConfigError> {
        let mut seen = HashMap::new();
        for service in &services {
            if seen.insert(service.name.as_str(), ()).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service name '{}'",
                    service.name
                )));
            }
        }
        Ok(Self { services })
    }

    pub fn get_service(&self, name: &str) -> Result<&ServiceDescriptor, ConfigError> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::ServiceNotFound(name.to_string()))
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(content.as_bytes()).expect("write");
        path
    }

    fn descriptor(name: &str, hosts: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            description: String::new(),
            handler: "httpd".to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
        }
    }

    #[test]
    fn test_site_config_get() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(&dir, "site.json", r#"{ "site_id": "pdbe", "deploy_root": "/opt/deploy" }"#);

        let config = SiteConfig::load(&path).expect("load");
        assert_eq!(config.get("site_id"), Some("pdbe"));
        assert_eq!(config.get("no_such_key"), None);
        assert_eq!(config.get_or("installer", "pip"), "pip");
    }

    #[test]
    fn test_site_config_env_override() {
        let mut config = SiteConfig::from_map(
            [("site_id".to_string(), "pdbe".to_string())].into_iter().collect(),
        );
        config.apply_overrides(
            [
                ("OPSMAN_SITE_ID".to_string(), "rcsb".to_string()),
                ("UNRELATED_VAR".to_string(), "x".to_string()),
            ]
            .into_iter(),
        );

        assert_eq!(config.get("site_id"), Some("rcsb"));
        assert_eq!(config.get("unrelated_var"), None);
    }

    #[test]
    fn test_site_config_missing_file() {
        let err = SiteConfig::load(Path::new("/nonexistent/site.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_site_config_malformed_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(&dir, "site.json", "{ not json");

        let err = SiteConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_registry_lookup_and_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(
            &dir,
            "services.json",
            r#"{
                "services": [
                    { "name": "apache", "description": "web server", "handler": "httpd", "hosts": [] },
                    { "name": "web", "handler": "httpd", "hosts": ["node1", "node2"] }
                ]
            }"#,
        );

        let registry = ServiceRegistry::load(&path).expect("load");
        assert_eq!(registry.services().len(), 2);
        assert_eq!(registry.services()[0].name, "apache");

        let web = registry.get_service("web").expect("get");
        assert_eq!(web.hosts, vec!["node1", "node2"]);
    }

    #[test]
    fn test_registry_unknown_service() {
        let registry = ServiceRegistry::from_services(vec![descriptor("apache", &[])]).expect("build");
        let err = registry.get_service("foo").unwrap_err();
        assert!(matches!(err, ConfigError::ServiceNotFound(name) if name == "foo"));
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let err = ServiceRegistry::from_services(vec![
            descriptor("apache", &[]),
            descriptor("apache", &["node1"]),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
