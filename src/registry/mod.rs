//! Registry client
//!
//! Registries are addressed through a small set of primitives (manifests and
//! blobs by reference). The artifact level operations, `resolve_digest`,
//! `pull`, `pull_config`, `push` and `copy`, are provided on top of them so
//! every backend shares the same verification rules.
//!
//! ## Backends
//!
//! - [`layout::LayoutRegistry`] - an OCI image layout directory on disk
//! - [`distribution::DistributionRegistry`] - the OCI distribution HTTP API

pub mod distribution;
pub mod layout;

use crate::artifact::{self, ArtifactError, Image, ImageManifest, WasmConfig};
use crate::types::{Digest, Reference};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid artifact: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("malformed registry data: {0}")]
    Malformed(String),
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RegistryError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Credentials presented to a registry host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Supplies credentials per registry host
///
/// How credentials are obtained is up to the implementation.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, registry: &str) -> Option<Credentials>;
}

/// No credentials for any host
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn credentials(&self, _registry: &str) -> Option<Credentials> {
        None
    }
}

/// Fixed credentials, optionally limited to one host
pub struct StaticCredentials {
    pub registry: Option<String>,
    pub credentials: Credentials,
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, registry: &str) -> Option<Credentials> {
        match &self.registry {
            Some(host) if host != registry => None,
            _ => Some(self.credentials.clone()),
        }
    }
}

/// Credential providers by service account name
///
/// Dependencies without an account use the default provider.
#[derive(Clone)]
pub struct CredentialSet {
    default: Arc<dyn CredentialProvider>,
    accounts: HashMap<String, Arc<dyn CredentialProvider>>,
}

impl CredentialSet {
    pub fn new(default: Arc<dyn CredentialProvider>) -> Self {
        CredentialSet {
            default,
            accounts: HashMap::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(Arc::new(Anonymous))
    }

    pub fn with_account(mut self, name: impl Into<String>, provider: Arc<dyn CredentialProvider>) -> Self {
        self.accounts.insert(name.into(), provider);
        self
    }

    pub fn default_provider(&self) -> &dyn CredentialProvider {
        self.default.as_ref()
    }

    /// `None` when a named account is unknown
    pub fn for_account(&self, account: Option<&str>) -> Option<&dyn CredentialProvider> {
        match account {
            None => Some(self.default.as_ref()),
            Some(name) => self.accounts.get(name).map(|p| p.as_ref()),
        }
    }
}

/// Result of pulling an artifact
#[derive(Debug, Clone)]
pub struct Pulled {
    /// Digest-pinned reference the artifact was read from
    pub reference: Reference,
    pub bytes: Vec<u8>,
    pub config: WasmConfig,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Digest of the manifest a reference currently points at
    async fn head_manifest(
        &self,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<Digest, RegistryError>;

    async fn get_manifest(
        &self,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<Vec<u8>, RegistryError>;

    async fn get_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        credentials: &dyn CredentialProvider,
    ) -> Result<Vec<u8>, RegistryError>;

    async fn put_blob(
        &self,
        reference: &Reference,
        bytes: &[u8],
        credentials: &dyn CredentialProvider,
    ) -> Result<Digest, RegistryError>;

    /// Store a manifest and point the reference's tag at it
    async fn put_manifest(
        &self,
        reference: &Reference,
        manifest: &[u8],
        credentials: &dyn CredentialProvider,
    ) -> Result<Digest, RegistryError>;

    /// Pin a reference to a digest, looking up tags when needed
    async fn resolve_digest(
        &self,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<Reference, RegistryError> {
        if let Some(digest) = &reference.digest {
            return Ok(reference.with_digest(digest.clone()));
        }
        let digest = self.head_manifest(reference, credentials).await?;
        Ok(reference.with_digest(digest))
    }

    /// Fetch all parts of an image
    async fn pull_image(
        &self,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<(Reference, Image), RegistryError> {
        let pinned = self.resolve_digest(reference, credentials).await?;
        let manifest = self.get_verified_manifest(&pinned, credentials).await?;
        let parsed = ImageManifest::parse(&manifest)?;
        let layer = artifact::validate_manifest(&parsed)?;

        let config = self
            .get_blob(&pinned, &parsed.config.digest, credentials)
            .await?;
        let layer = self.get_blob(&pinned, &layer.digest, credentials).await?;
        Ok((
            pinned,
            Image {
                manifest,
                config,
                layer,
            },
        ))
    }

    /// Fetch and unpack a wasm artifact
    async fn pull(
        &self,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<Pulled, RegistryError> {
        let (pinned, image) = self.pull_image(reference, credentials).await?;
        let (bytes, config) = artifact::unpack(&image)?;
        tracing::debug!(reference = %pinned, size = bytes.len(), "Pulled artifact");
        Ok(Pulled {
            reference: pinned,
            bytes,
            config,
        })
    }

    /// Fetch only the config document of a wasm artifact
    async fn pull_config(
        &self,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<WasmConfig, RegistryError> {
        let pinned = self.resolve_digest(reference, credentials).await?;
        let manifest = self.get_verified_manifest(&pinned, credentials).await?;
        let parsed = ImageManifest::parse(&manifest)?;
        artifact::validate_manifest(&parsed)?;
        let config = self
            .get_blob(&pinned, &parsed.config.digest, credentials)
            .await?;
        if !parsed.config.digest.verify(&config) {
            return Err(RegistryError::Malformed(format!(
                "config blob does not match {}",
                parsed.config.digest
            )));
        }
        Ok(artifact::parse_config(&config)?)
    }

    /// Upload an image and tag it, returning the digest-pinned reference
    ///
    /// Blobs go first; the manifest write is what makes the image visible.
    async fn push(
        &self,
        reference: &Reference,
        image: &Image,
        credentials: &dyn CredentialProvider,
    ) -> Result<Reference, RegistryError> {
        artifact::unpack(image)?;
        self.put_blob(reference, &image.layer, credentials).await?;
        self.put_blob(reference, &image.config, credentials).await?;
        let digest = self
            .put_manifest(reference, &image.manifest, credentials)
            .await?;
        tracing::info!(reference = %reference, digest = %digest, "Pushed artifact");
        Ok(reference.with_digest(digest))
    }

    /// Copy an artifact between references, possibly across registries
    async fn copy(
        &self,
        from: &Reference,
        to: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<Reference, RegistryError> {
        let (_, image) = self.pull_image(from, credentials).await?;
        self.push(to, &image, credentials).await
    }

    #[doc(hidden)]
    async fn get_verified_manifest(
        &self,
        pinned: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<Vec<u8>, RegistryError> {
        let manifest = self.get_manifest(pinned, credentials).await?;
        if let Some(digest) = &pinned.digest
            && !digest.verify(&manifest)
        {
            return Err(RegistryError::Malformed(format!(
                "manifest does not match {}",
                digest
            )));
        }
        Ok(manifest)
    }
}
