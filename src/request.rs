//! Composition requests
//!
//! A request names the composition being built and lists its dependencies.
//! Requests are read from TOML:
//!
//! ```toml
//! [composition]
//! name = "app"
//! target = "localhost:5000/apps/app:v1"
//! plug = {}
//!
//! [[composition.dependencies]]
//! component = "handler"
//! oci = { image = "localhost:5000/components/handler:v1" }
//!
//! [[composition.dependencies]]
//! component = "settings"
//! config = { values = { greeting = "hello" } }
//! ```

use crate::error::PipelineError;
use crate::types::{DEFAULT_NAMESPACE, Digest, Reference, ResourceIdentity, ResourceRef};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

pub const COMPOSITION_KIND: &str = "Composition";

/// Marker selecting plug composition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plug {}

/// How resolved dependencies are wired together
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// First dependency is the socket, the rest are plugs
    Plug,
    /// A WAC document referring to dependencies by name
    Script(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plug: Option<Plug>,
    #[serde(default, rename = "wac", skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl CompositionSpec {
    pub fn mode(&self) -> Result<Mode, PipelineError> {
        match (&self.plug, &self.script) {
            (Some(_), None) => Ok(Mode::Plug),
            (None, Some(script)) => Ok(Mode::Script(script.clone())),
            (Some(_), Some(_)) => Err(PipelineError::Invalid(
                "only one of .spec[plug, wac] may be set".to_string(),
            )),
            (None, None) => Err(PipelineError::Invalid(
                "one of .spec[plug, wac] is required".to_string(),
            )),
        }
    }

    /// Check the mode and dependency names, descending into nested compositions
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mode = self.mode()?;
        if mode == Mode::Plug && self.dependencies.is_empty() {
            return Err(PipelineError::Invalid(
                "plug requires at least one dependency".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for dependency in &self.dependencies {
            if dependency.component.trim().is_empty() {
                return Err(PipelineError::Invalid(
                    "dependency component name must not be empty".to_string(),
                ));
            }
            if !seen.insert(dependency.component.as_str()) {
                return Err(PipelineError::Invalid(format!(
                    "duplicate dependency component '{}'",
                    dependency.component
                )));
            }
            if let DependencySource::NestedComposition(nested) = &dependency.source {
                nested.validate().map_err(|e| {
                    PipelineError::Invalid(format!("{}: {}", dependency.component, e))
                })?;
            }
        }
        Ok(())
    }
}

/// A named slot filled by exactly one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDependency", into = "RawDependency")]
pub struct Dependency {
    pub component: String,
    pub source: DependencySource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencySource {
    /// Pre-built binary in a registry
    DirectImage {
        image: Reference,
        /// Named credential set used to pull the image
        service_account: Option<String>,
    },
    /// Another component-like resource
    ComponentRef(ResourceRef),
    /// Key/value pairs served through `wasi:config/store`
    GeneratedConfig { values: BTreeMap<String, String> },
    NestedComposition(Box<CompositionSpec>),
}

impl DependencySource {
    pub fn describe(&self) -> String {
        match self {
            DependencySource::DirectImage { image, .. } => format!("image {}", image),
            DependencySource::ComponentRef(reference) => reference.to_string(),
            DependencySource::GeneratedConfig { values } => {
                format!("config with {} value(s)", values.len())
            }
            DependencySource::NestedComposition(spec) => {
                format!("composition of {} dependencies", spec.dependencies.len())
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawDependency {
    component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oci: Option<OciSource>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    reference: Option<RefSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<ConfigSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    composition: Option<Box<CompositionSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OciSource {
    image: Reference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(default = "default_ref_kind")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    name: String,
}

fn default_ref_kind() -> String {
    "Component".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigSource {
    #[serde(default)]
    values: BTreeMap<String, String>,
}

impl TryFrom<RawDependency> for Dependency {
    type Error = String;

    fn try_from(raw: RawDependency) -> Result<Self, Self::Error> {
        let RawDependency {
            component,
            oci,
            reference,
            config,
            composition,
        } = raw;

        let mut sources = Vec::new();
        if let Some(oci) = oci {
            sources.push(DependencySource::DirectImage {
                image: oci.image,
                service_account: oci.service_account,
            });
        }
        if let Some(r) = reference {
            let mut target = ResourceRef::new(
                &r.kind,
                r.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE),
                &r.name,
            );
            if let Some(group) = r.group {
                target.group = group;
            }
            sources.push(DependencySource::ComponentRef(target));
        }
        if let Some(config) = config {
            sources.push(DependencySource::GeneratedConfig {
                values: config.values,
            });
        }
        if let Some(spec) = composition {
            sources.push(DependencySource::NestedComposition(spec));
        }

        match sources.len() {
            1 => Ok(Dependency {
                component,
                source: sources.remove(0),
            }),
            0 => Err(format!(
                "dependency '{}' needs one of oci, ref, config, composition",
                component
            )),
            _ => Err(format!(
                "dependency '{}' may set only one of oci, ref, config, composition",
                component
            )),
        }
    }
}

impl From<Dependency> for RawDependency {
    fn from(dependency: Dependency) -> Self {
        let mut raw = RawDependency {
            component: dependency.component,
            ..Default::default()
        };
        match dependency.source {
            DependencySource::DirectImage {
                image,
                service_account,
            } => {
                raw.oci = Some(OciSource {
                    image,
                    service_account,
                })
            }
            DependencySource::ComponentRef(r) => {
                raw.reference = Some(RefSource {
                    group: Some(r.group),
                    kind: r.kind,
                    namespace: Some(r.namespace),
                    name: r.name,
                })
            }
            DependencySource::GeneratedConfig { values } => {
                raw.config = Some(ConfigSource { values })
            }
            DependencySource::NestedComposition(spec) => raw.composition = Some(spec),
        }
        raw
    }
}

/// A composition to build and publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionRequest {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Stable unique id; derived from namespace and name when omitted
    #[serde(default)]
    pub uid: String,
    #[serde(default = "default_generation")]
    pub generation: i64,
    /// Tag to publish to; the configured repository template is used otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Reference>,
    #[serde(flatten)]
    pub spec: CompositionSpec,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_generation() -> i64 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestFile {
    composition: CompositionRequest,
}

impl CompositionRequest {
    pub fn parse(text: &str) -> Result<Self> {
        let file: RequestFile = toml::from_str(text).context("Failed to parse composition request")?;
        let mut request = file.composition;
        validate_name(&request.name).context("Invalid composition name")?;
        validate_name(&request.namespace).context("Invalid namespace")?;
        if request.uid.is_empty() {
            request.uid = derive_uid(&request.namespace, &request.name);
        }
        Ok(request)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid request: {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        let file = RequestFile {
            composition: self.clone(),
        };
        toml::to_string_pretty(&file).context("Failed to serialize composition request")
    }

    /// State store key: `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(COMPOSITION_KIND, &self.namespace, &self.name)
    }

    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            uid: self.uid.clone(),
            reference: self.reference(),
        }
    }
}

/// Resource names are lowercase alphanumerics and hyphens, up to 63 characters
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("name cannot be empty");
    }
    if name.len() > 63 {
        anyhow::bail!("name '{}' is longer than 63 characters", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        anyhow::bail!(
            "name '{}' may only contain lowercase letters, digits and hyphens",
            name
        );
    }
    if name.starts_with('-') || name.ends_with('-') {
        anyhow::bail!("name '{}' cannot start or end with a hyphen", name);
    }
    Ok(())
}

/// Stable uid for resources that were not assigned one
pub fn derive_uid(namespace: &str, name: &str) -> String {
    let digest = Digest::of(format!("{}/{}", namespace, name).as_bytes());
    let hex = digest.encoded();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
