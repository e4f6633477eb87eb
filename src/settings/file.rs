use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::{DEFAULT_HOSTNAME, HostSettings, HostsSettings, SettingsError};

/// `hosts.yaml` layout. Each key is a hostname; `default` sets values for
/// every host that has no entry, and is the base the other entries inherit.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostsFile {
    hosts: BTreeMap<String, Option<HostOverrides>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct HostOverrides {
    max_connections: Option<usize>,
    max_reconnects: Option<u32>,
    #[serde(rename = "resetAfterVerifications")]
    reset_after: Option<u32>,
    #[serde(rename = "closeAfterVerifications")]
    close_after: Option<u32>,
    /// Seconds.
    inactive_timeout: Option<f64>,
    random_user: Option<String>,
    from_email: Option<String>,
    from_host: Option<String>,
    unreliable: Option<bool>,
}

impl HostOverrides {
    fn apply(self, hostname: &str, base: &HostSettings) -> Result<HostSettings, SettingsError> {
        let mut settings = HostSettings::inherit(hostname, base);
        if let Some(value) = self.max_connections {
            settings.max_connections = value;
        }
        if let Some(value) = self.max_reconnects {
            settings.max_reconnects = value;
        }
        if let Some(value) = self.reset_after {
            settings.reset_after = value;
        }
        if let Some(value) = self.close_after {
            settings.close_after = value;
        }
        if let Some(seconds) = self.inactive_timeout {
            settings.inactive_timeout = Duration::try_from_secs_f64(seconds).map_err(|_| {
                SettingsError::invalid(hostname, format!("invalid inactiveTimeout {seconds}"))
            })?;
        }
        if let Some(value) = self.random_user {
            settings.random_user = value;
        }
        if let Some(value) = self.from_email {
            settings.from_email = value;
        }
        if let Some(value) = self.from_host {
            settings.from_host = value;
        }
        if let Some(value) = self.unreliable {
            settings.unreliable = value;
        }
        Ok(settings)
    }
}

impl HostsSettings {
    pub fn from_yaml_str(input: &str) -> Result<Self, SettingsError> {
        let mut file: HostsFile =
            serde_yaml::from_str(input).map_err(|source| SettingsError::Yaml { source })?;

        let default = match file.hosts.remove(DEFAULT_HOSTNAME) {
            Some(overrides) => overrides
                .unwrap_or_default()
                .apply(DEFAULT_HOSTNAME, &HostSettings::default())?,
            None => HostSettings::default(),
        };

        let mut entries = Vec::with_capacity(file.hosts.len());
        for (hostname, overrides) in file.hosts {
            entries.push(overrides.unwrap_or_default().apply(&hostname, &default)?);
        }
        Self::new(default, entries)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&input)
    }
}
