//! Tenant configuration: recognized options, TOML loading, validation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Supported specification releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FhirRelease {
    R4,
    R4B,
    #[default]
    R5,
}

impl FhirRelease {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::R4 => "R4",
            Self::R4B => "R4B",
            Self::R5 => "R5",
        }
    }

    /// Publication version string advertised in the capability document.
    pub fn fhir_version(&self) -> &'static str {
        match self {
            Self::R4 => "4.0.1",
            Self::R4B => "4.3.0",
            Self::R5 => "5.0.0",
        }
    }
}

impl std::fmt::Display for FhirRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_formats() -> Vec<String> {
    vec![
        "application/fhir+json".to_string(),
        "application/fhir+xml".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

/// All recognized per-tenant options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TenantSettings {
    /// Tenant name, addressable in the request context. Required.
    pub controller_name: String,
    /// Public base URL of the tenant. Required.
    pub base_url: String,
    #[serde(default)]
    pub fhir_version: FhirRelease,
    #[serde(default = "default_formats")]
    pub supported_formats: Vec<String>,
    /// Cap on subscription lifetime; 0 means no cap.
    #[serde(default)]
    pub max_subscription_expiration_minutes: i64,
    /// Capacity-eviction threshold; 0 disables eviction.
    #[serde(default)]
    pub max_resource_count: usize,
    #[serde(default = "default_true")]
    pub allow_create_as_update: bool,
    #[serde(default)]
    pub allow_existing_id: bool,
    /// Honor `If-Modified-Since` / matching `If-None-Match` with 304.
    #[serde(default)]
    pub support_not_changed: bool,
    /// Exempt startup-loaded content from capacity eviction and deletion.
    #[serde(default)]
    pub protect_loaded_content: bool,
    #[serde(default)]
    pub smart_required: bool,
    #[serde(default)]
    pub smart_allowed: bool,
    /// Directory of `.json`/`.xml` payloads loaded at startup.
    #[serde(default)]
    pub load_directory: Option<PathBuf>,
}

impl TenantSettings {
    pub fn new(controller_name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            controller_name: controller_name.into(),
            base_url: base_url.into(),
            fhir_version: FhirRelease::default(),
            supported_formats: default_formats(),
            max_subscription_expiration_minutes: 0,
            max_resource_count: 0,
            allow_create_as_update: true,
            allow_existing_id: false,
            support_not_changed: false,
            protect_loaded_content: false,
            smart_required: false,
            smart_allowed: false,
            load_directory: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller_name.trim().is_empty() {
            return Err(ConfigError::invalid("controller-name must not be empty"));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| ConfigError::invalid(format!("base-url '{}': {e}", self.base_url)))?;
        if self.smart_required && !self.smart_allowed {
            return Err(ConfigError::invalid(
                "smart-required implies smart-allowed",
            ));
        }
        Ok(())
    }

    /// Base URL without a trailing slash, as used for location headers and
    /// search self-links.
    pub fn base_url_trimmed(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Top-level configuration file: one or more named tenants.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default)]
    pub tenants: HashMap<String, TenantSettings>,
}

impl ServerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        for (name, tenant) in &config.tenants {
            tenant.validate().map_err(|e| {
                ConfigError::invalid(format!("tenant '{name}': {e}"))
            })?;
        }
        debug!(tenants = config.tenants.len(), "configuration loaded");
        Ok(config)
    }

    pub fn single(settings: TenantSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let mut tenants = HashMap::new();
        tenants.insert(settings.controller_name.clone(), settings);
        Ok(Self { tenants })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let settings = TenantSettings::new("r5", "http://localhost:5826/fhir/r5");
        assert!(settings.validate().is_ok());
        assert_eq!(settings.fhir_version, FhirRelease::R5);
        assert!(settings.allow_create_as_update);
        assert!(!settings.allow_existing_id);
        assert_eq!(settings.max_resource_count, 0);
    }

    #[test]
    fn validation_rejects_bad_input() {
        let empty_name = TenantSettings::new("  ", "http://localhost/fhir");
        assert!(empty_name.validate().is_err());

        let bad_url = TenantSettings::new("r5", "not a url");
        assert!(bad_url.validate().is_err());

        let mut smart = TenantSettings::new("r5", "http://localhost/fhir");
        smart.smart_required = true;
        assert!(smart.validate().is_err());
        smart.smart_allowed = true;
        assert!(smart.validate().is_ok());
    }

    #[test]
    fn base_url_is_trimmed() {
        let settings = TenantSettings::new("r5", "http://localhost/fhir/r5/");
        assert_eq!(settings.base_url_trimmed(), "http://localhost/fhir/r5");
    }

    #[test]
    fn release_versions() {
        assert_eq!(FhirRelease::R4.fhir_version(), "4.0.1");
        assert_eq!(FhirRelease::R5.fhir_version(), "5.0.0");
        assert_eq!(FhirRelease::R4B.to_string(), "R4B");
    }

    #[test]
    fn loads_toml_with_multiple_tenants() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[tenants.r5]
controller-name = "r5"
base-url = "http://localhost:5826/fhir/r5"
max-resource-count = 1000
protect-loaded-content = true

[tenants.r4]
controller-name = "r4"
base-url = "http://localhost:5826/fhir/r4"
fhir-version = "R4"
"#
        )
        .unwrap();

        let config = ServerConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.tenants.len(), 2);
        let r5 = &config.tenants["r5"];
        assert_eq!(r5.max_resource_count, 1000);
        assert!(r5.protect_loaded_content);
        assert_eq!(config.tenants["r4"].fhir_version, FhirRelease::R4);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[tenants.r5]
controller-name = "r5"
base-url = "http://localhost:5826/fhir/r5"
no-such-option = true
"#
        )
        .unwrap();
        assert!(ServerConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn invalid_tenant_fails_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[tenants.bad]
controller-name = "bad"
base-url = "::nope::"
"#
        )
        .unwrap();
        assert!(ServerConfig::load_from_file(file.path()).is_err());
    }
}
