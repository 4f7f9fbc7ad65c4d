//! Configuration schema for wacpack
//!
//! Every section and field has a default, so a partial (or missing) config
//! file is always valid input.

use super::template::{self, TemplateVars};
use crate::artifact::DEFAULT_AUTHOR;
use crate::registry::{Credentials, StaticCredentials};
use crate::types::Reference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration structure for wacpack
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct WacpackConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub artifact: ArtifactConfig,

    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// OCI image layout directory on disk
    #[default]
    Layout,
    /// OCI distribution HTTP API
    Distribution,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryConfig {
    #[serde(default)]
    pub kind: RegistryKind,

    /// Layout directory; defaults to ~/.config/wacpack/layout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_dir: Option<PathBuf>,

    /// Host used for references without one
    #[serde(default = "default_registry_host")]
    pub default_registry: String,

    /// Use plain HTTP for every host
    #[serde(default)]
    pub insecure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Credentials per service account, for dependencies that name one
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accounts: BTreeMap<String, AccountConfig>,
}

/// Credentials for one service account
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    /// Host the credentials apply to; any host when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl AccountConfig {
    pub fn credentials(&self) -> Option<StaticCredentials> {
        Some(StaticCredentials {
            registry: self.registry.clone(),
            credentials: credentials_of(&self.username, &self.password, &self.token)?,
        })
    }
}

fn credentials_of(
    username: &Option<String>,
    password: &Option<String>,
    token: &Option<String>,
) -> Option<Credentials> {
    match (username, password, token) {
        (Some(username), Some(password), None) => Some(Credentials::Basic {
            username: username.clone(),
            password: password.clone(),
        }),
        (None, None, Some(token)) => Some(Credentials::Bearer(token.clone())),
        _ => None,
    }
}

fn default_registry_host() -> String {
    "localhost:5000".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            kind: RegistryKind::default(),
            layout_dir: None,
            default_registry: default_registry_host(),
            insecure: false,
            username: None,
            password: None,
            token: None,
            accounts: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    /// Static credentials for the default registry, if configured
    pub fn credentials(&self) -> Option<StaticCredentials> {
        Some(StaticCredentials {
            registry: Some(self.default_registry.clone()),
            credentials: credentials_of(&self.username, &self.password, &self.token)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolsConfig {
    /// Idle instances kept per tool
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
}

fn default_max_idle() -> usize {
    4
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfig {
            max_idle: default_max_idle(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactConfig {
    #[serde(default = "default_author")]
    pub author: String,
}

fn default_author() -> String {
    DEFAULT_AUTHOR.to_string()
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        ArtifactConfig {
            author: default_author(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishConfig {
    /// Target reference for requests without one
    ///
    /// Placeholders: `{namespace}`, `{name}`, `{uid}`, `{generation}`,
    /// `{kind}` (lowercased) and `{group}`.
    #[serde(default = "default_repository_template")]
    pub repository_template: String,
}

fn default_repository_template() -> String {
    "{namespace}/{name}:latest".to_string()
}

impl Default for PublishConfig {
    fn default() -> Self {
        PublishConfig {
            repository_template: default_repository_template(),
        }
    }
}

impl PublishConfig {
    pub fn target_for(&self, vars: &TemplateVars) -> Result<Reference, String> {
        let expanded = template::expand(&self.repository_template, vars)?;
        expanded
            .parse()
            .map_err(|e| format!("template produced invalid reference '{}': {}", expanded, e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubled on each further attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    200
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl WacpackConfig {
    /// Validate the configuration for common errors
    ///
    /// Returns Ok(()) if valid, or Err with a list of error messages
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.registry.default_registry.trim().is_empty() {
            errors.push("registry.default_registry must not be empty".to_string());
        }
        match (
            &self.registry.username,
            &self.registry.password,
            &self.registry.token,
        ) {
            (None, None, None) | (Some(_), Some(_), None) | (None, None, Some(_)) => {}
            (_, _, Some(_)) => {
                errors.push("registry.token cannot be combined with username/password".to_string())
            }
            _ => errors.push("registry.username and registry.password must be set together".to_string()),
        }

        for (name, account) in &self.registry.accounts {
            if account.credentials().is_none() {
                errors.push(format!(
                    "registry.accounts.{}: set username and password, or token",
                    name
                ));
            }
        }

        if self.artifact.author.trim().is_empty() {
            errors.push("artifact.author must not be empty".to_string());
        }

        let sample = TemplateVars {
            namespace: "default".to_string(),
            name: "sample".to_string(),
            uid: "00000000-0000-0000-0000-000000000000".to_string(),
            generation: 1,
            kind: "Composition".to_string(),
            group: crate::types::DEFAULT_GROUP.to_string(),
        };
        if let Err(e) = self.publish.target_for(&sample) {
            errors.push(format!("publish.repository_template: {}", e));
        }

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = WacpackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.kind, RegistryKind::Layout);
        assert_eq!(config.tools.max_idle, 4);
        assert_eq!(config.artifact.author, "wacpack");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: WacpackConfig = toml::from_str(
            r#"
[registry]
kind = "distribution"
insecure = true

[retry]
max_attempts = 2
"#,
        )
        .unwrap();
        assert_eq!(config.registry.kind, RegistryKind::Distribution);
        assert!(config.registry.insecure);
        assert_eq!(config.registry.default_registry, "localhost:5000");
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.backoff_ms, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = WacpackConfig::default();
        config.artifact.author = " ".to_string();
        config.retry.max_attempts = 0;
        config.publish.repository_template = "{namespace}/{unknown}".to_string();
        config.registry.username = Some("me".to_string());

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("author")));
        assert!(errors.iter().any(|e| e.contains("max_attempts")));
        assert!(errors.iter().any(|e| e.contains("unknown")));
        assert!(errors.iter().any(|e| e.contains("password")));
    }

    #[test]
    fn test_credentials() {
        let mut registry = RegistryConfig::default();
        assert!(registry.credentials().is_none());

        registry.token = Some("t".to_string());
        let creds = registry.credentials().unwrap();
        assert_eq!(creds.credentials, Credentials::Bearer("t".to_string()));
        assert_eq!(creds.registry.as_deref(), Some("localhost:5000"));
    }

    #[test]
    fn test_service_accounts() {
        let config: WacpackConfig = toml::from_str(
            r#"
[registry.accounts.builder]
registry = "ghcr.io"
token = "abc"

[registry.accounts.broken]
username = "only-user"
"#,
        )
        .unwrap();
        let builder = config.registry.accounts["builder"].credentials().unwrap();
        assert_eq!(builder.registry.as_deref(), Some("ghcr.io"));

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("accounts.broken"));
    }

    #[test]
    fn test_target_for_request() {
        let publish = PublishConfig {
            repository_template: "apps/{kind}/{name}:g{generation}".to_string(),
        };
        let vars = TemplateVars {
            namespace: "team".to_string(),
            name: "web".to_string(),
            uid: "u".to_string(),
            generation: 7,
            kind: "Composition".to_string(),
            group: "g".to_string(),
        };
        let target = publish.target_for(&vars).unwrap();
        assert_eq!(target.to_string(), "apps/composition/web:g7");
    }
}
