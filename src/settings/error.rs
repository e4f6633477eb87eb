use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings for '{hostname}': {reason}")]
    Invalid { hostname: String, reason: String },
    #[error("default settings must be named 'default', got '{0}'")]
    MalformedDefault(String),
    #[error("reading hosts file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "with-yaml")]
    #[error("hosts file parse failed: {source}")]
    Yaml {
        #[source]
        source: serde_yaml::Error,
    },
}

impl SettingsError {
    pub(crate) fn invalid(hostname: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            hostname: hostname.to_string(),
            reason: reason.into(),
        }
    }
}
