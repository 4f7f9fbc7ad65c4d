//! Wasm OCI artifact packaging
//!
//! A packed artifact is a single-layer OCI image:
//!
//! - the layer is the raw wasm binary (`application/wasm`)
//! - the config is a [`WasmConfig`] recording the extracted interfaces
//! - the manifest references both by digest and size
//!
//! The image digest is the sha256 of the serialized manifest, so packing the
//! same binary always yields the same digest.

use crate::tools::wit_tools::is_component;
use crate::tools::{ToolError, Tools};
use crate::types::{Digest, Wit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const WASM_CONFIG_MEDIA_TYPE: &str = "application/vnd.wasm.config.v0+json";
pub const WASM_LAYER_MEDIA_TYPE: &str = "application/wasm";
pub const WASM_ARCHITECTURE: &str = "wasm";
pub const WASM_MODULE_OS: &str = "wasip1";
pub const WASM_COMPONENT_OS: &str = "wasip2";
pub const DEFAULT_AUTHOR: &str = "wacpack";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("failed to extract WIT: {0}")]
    Tool(#[from] ToolError),

    #[error("malformed {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported manifest: {0}")]
    Unsupported(String),

    #[error("{what} digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        what: &'static str,
        expected: Digest,
        actual: Digest,
    },
}

/// Config document of a wasm artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmConfig {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    pub architecture: String,
    pub os: String,
    #[serde(
        rename = "layerDigests",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub layer_digests: Vec<Digest>,
    #[serde(default)]
    pub component: WasmConfigComponent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmConfigComponent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_imports: Vec<String>,
    #[serde(default)]
    pub target: Option<String>,
}

impl WasmConfig {
    pub fn wit(&self) -> Wit {
        Wit {
            imports: self.component.imports.clone(),
            exports: self.component.exports.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn for_bytes(media_type: &str, bytes: &[u8]) -> Self {
        Descriptor {
            media_type: media_type.to_string(),
            digest: Digest::of(bytes),
            size: bytes.len() as u64,
            annotations: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, ArtifactError> {
        serde_json::from_slice(bytes).map_err(|source| ArtifactError::Json {
            what: "image manifest",
            source,
        })
    }
}

/// Serialized parts of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub manifest: Vec<u8>,
    pub config: Vec<u8>,
    pub layer: Vec<u8>,
}

impl Image {
    /// Content address of the image: the digest of its manifest
    pub fn digest(&self) -> Digest {
        Digest::of(&self.manifest)
    }

    pub fn parsed_manifest(&self) -> Result<ImageManifest, ArtifactError> {
        ImageManifest::parse(&self.manifest)
    }
}

/// A packed binary with its decoded config
#[derive(Debug, Clone)]
pub struct PackedArtifact {
    pub image: Image,
    pub config: WasmConfig,
}

impl PackedArtifact {
    pub fn digest(&self) -> Digest {
        self.image.digest()
    }
}

/// Fixed creation time so identical binaries pack to identical digests
fn created() -> DateTime<Utc> {
    DateTime::from_timestamp(1, 0).unwrap_or_default()
}

/// Build the image for `binary` from already-extracted interfaces
pub fn build_image(binary: Vec<u8>, wit: &Wit, author: &str) -> Result<PackedArtifact, ArtifactError> {
    let layer = Descriptor::for_bytes(WASM_LAYER_MEDIA_TYPE, &binary);
    let os = if is_component(&binary) {
        WASM_COMPONENT_OS
    } else {
        WASM_MODULE_OS
    };

    let config = WasmConfig {
        created: created(),
        author: author.to_string(),
        architecture: WASM_ARCHITECTURE.to_string(),
        os: os.to_string(),
        layer_digests: vec![layer.digest.clone()],
        component: WasmConfigComponent {
            exports: wit.exports.clone(),
            imports: wit.imports.clone(),
            optional_imports: Vec::new(),
            target: None,
        },
    };
    let config_bytes = serde_json::to_vec(&config).map_err(|source| ArtifactError::Json {
        what: "wasm config",
        source,
    })?;

    let manifest = ImageManifest {
        schema_version: 2,
        media_type: Some(IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
        config: Descriptor::for_bytes(WASM_CONFIG_MEDIA_TYPE, &config_bytes),
        layers: vec![layer],
    };
    let manifest_bytes = serde_json::to_vec(&manifest).map_err(|source| ArtifactError::Json {
        what: "image manifest",
        source,
    })?;

    Ok(PackedArtifact {
        image: Image {
            manifest: manifest_bytes,
            config: config_bytes,
            layer: binary,
        },
        config,
    })
}

/// Decode the config document of an image
pub fn parse_config(bytes: &[u8]) -> Result<WasmConfig, ArtifactError> {
    serde_json::from_slice(bytes).map_err(|source| ArtifactError::Json {
        what: "wasm config",
        source,
    })
}

fn verify(what: &'static str, expected: &Digest, bytes: &[u8]) -> Result<(), ArtifactError> {
    let actual = Digest::of(bytes);
    if &actual != expected {
        return Err(ArtifactError::DigestMismatch {
            what,
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

/// Check that the manifest describes a single wasm layer
pub fn validate_manifest(manifest: &ImageManifest) -> Result<&Descriptor, ArtifactError> {
    if manifest.schema_version != 2 {
        return Err(ArtifactError::Unsupported(format!(
            "schema version {}",
            manifest.schema_version
        )));
    }
    if let Some(media_type) = &manifest.media_type
        && media_type != IMAGE_MANIFEST_MEDIA_TYPE
    {
        return Err(ArtifactError::Unsupported(format!(
            "manifest media type {}",
            media_type
        )));
    }
    if manifest.config.media_type != WASM_CONFIG_MEDIA_TYPE {
        return Err(ArtifactError::Unsupported(format!(
            "config media type {}",
            manifest.config.media_type
        )));
    }
    match manifest.layers.as_slice() {
        [layer] if layer.media_type == WASM_LAYER_MEDIA_TYPE => Ok(layer),
        [layer] => Err(ArtifactError::Unsupported(format!(
            "layer media type {}",
            layer.media_type
        ))),
        layers => Err(ArtifactError::Unsupported(format!(
            "expected exactly one layer, found {}",
            layers.len()
        ))),
    }
}

/// Recover the binary and config from an image, verifying every digest
pub fn unpack(image: &Image) -> Result<(Vec<u8>, WasmConfig), ArtifactError> {
    let manifest = image.parsed_manifest()?;
    let layer = validate_manifest(&manifest)?;

    verify("config", &manifest.config.digest, &image.config)?;
    verify("layer", &layer.digest, &image.layer)?;

    let config = parse_config(&image.config)?;
    if !config.layer_digests.is_empty() && !config.layer_digests.contains(&layer.digest) {
        return Err(ArtifactError::Unsupported(
            "config does not reference the wasm layer".to_string(),
        ));
    }

    Ok((image.layer.clone(), config))
}

/// Packs binaries, extracting their interfaces with the embedded tools
#[derive(Clone)]
pub struct Packager {
    tools: Tools,
    author: String,
}

impl Packager {
    pub fn new(tools: Tools, author: impl Into<String>) -> Self {
        Packager {
            tools,
            author: author.into(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub async fn pack(
        &self,
        binary: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<PackedArtifact, ArtifactError> {
        let wit = crate::wit::extract_imports_exports(&self.tools, &binary, cancel).await?;
        tracing::debug!(
            imports = wit.imports.len(),
            exports = wit.exports.len(),
            "Extracted interfaces for packaging"
        );
        build_image(binary, &wit, &self.author)
    }
}
