//! Per-hostname SMTP policy.
//!
//! [`HostsSettings`] is built once at startup and only read afterwards. Any
//! hostname without its own entry gets the `default` entry.

mod error;
#[cfg(feature = "with-yaml")]
mod file;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

pub use error::SettingsError;
pub use types::{DEFAULT_HOSTNAME, HostSettings};

#[derive(Debug, Clone)]
pub struct HostsSettings {
    default: Arc<HostSettings>,
    hosts: HashMap<String, Arc<HostSettings>>,
}

impl Default for HostsSettings {
    fn default() -> Self {
        Self {
            default: Arc::new(HostSettings::default()),
            hosts: HashMap::new(),
        }
    }
}

impl HostsSettings {
    /// Build the collection. Entries named `default` are skipped, `default`
    /// itself must carry that name.
    pub fn new<I>(default: HostSettings, entries: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = HostSettings>,
    {
        if !default.is_default() {
            return Err(SettingsError::MalformedDefault(default.hostname));
        }
        default.validate()?;
        let mut hosts = HashMap::new();
        for mut entry in entries {
            if entry.is_default() {
                continue;
            }
            entry.hostname = entry.hostname.to_lowercase();
            entry.validate()?;
            hosts.insert(entry.hostname.clone(), Arc::new(entry));
        }
        Ok(Self {
            default: Arc::new(default),
            hosts,
        })
    }

    pub fn find_for_hostname(&self, hostname: &str) -> Arc<HostSettings> {
        self.hosts
            .get(&hostname.to_lowercase())
            .unwrap_or(&self.default)
            .clone()
    }

    pub fn default_settings(&self) -> &Arc<HostSettings> {
        &self.default
    }

    /// Hostnames flagged `unreliable` in configuration.
    pub fn unreliable_hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .values()
            .filter(|settings| settings.unreliable)
            .map(|settings| settings.hostname.as_str())
    }
}
