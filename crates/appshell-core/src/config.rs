//! Worker configuration: cache naming and the app shell manifest

use appshell_storage::validate_generation_name;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::CoreError;

/// Resources needed to render the application without network access
pub const DEFAULT_APP_SHELL: &[&str] = &[
    "/",
    "/index.html",
    "/css/styles.css",
    "/js/app.js",
    "/manifest.json",
    "/icons/icon-192x192.png",
    "/icons/icon-512x512.png",
];

/// Configuration for one deployed version of the worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Static part of every generation name
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,
    /// Version token; bumping it invalidates every older generation
    #[serde(default = "default_version")]
    pub version: String,
    /// Paths fetched and cached at install time, in order
    #[serde(default = "default_app_shell")]
    pub app_shell: Vec<String>,
    /// Document served for offline HTML navigations
    #[serde(default = "default_shell_document")]
    pub shell_document: String,
    /// Take over from the active worker as soon as install completes
    #[serde(default = "default_force_takeover")]
    pub force_takeover: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: default_cache_prefix(),
            version: default_version(),
            app_shell: default_app_shell(),
            shell_document: default_shell_document(),
            force_takeover: default_force_takeover(),
        }
    }
}

fn default_cache_prefix() -> String {
    "appcache".to_string()
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_app_shell() -> Vec<String> {
    DEFAULT_APP_SHELL.iter().map(|p| p.to_string()).collect()
}

fn default_shell_document() -> String {
    "/index.html".to_string()
}

fn default_force_takeover() -> bool {
    true
}

impl WorkerConfig {
    /// Name of the generation this version owns, e.g. `appcache-v1`
    pub fn generation_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Same configuration with a different version token
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.version.is_empty() {
            return Err(CoreError::InvalidConfig("version must not be empty".to_string()));
        }

        validate_generation_name(&self.generation_name())
            .map_err(|e| CoreError::InvalidConfig(e.to_string()))?;

        let mut seen = HashSet::new();
        for path in &self.app_shell {
            if !path.starts_with('/') {
                return Err(CoreError::InvalidConfig(format!(
                    "app shell path must start with '/': {}",
                    path
                )));
            }
            if !seen.insert(path.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "duplicate app shell path: {}",
                    path
                )));
            }
        }

        if !seen.contains(self.shell_document.as_str()) {
            return Err(CoreError::InvalidConfig(format!(
                "shell document {} is not part of the app shell",
                self.shell_document
            )));
        }

        Ok(())
    }
}
