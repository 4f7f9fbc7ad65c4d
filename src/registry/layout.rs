//! OCI image layout registry
//!
//! Stores artifacts in a directory following the OCI image layout:
//!
//! ```text
//! <root>/oci-layout
//! <root>/index.json
//! <root>/blobs/sha256/<hex>
//! ```
//!
//! Tags are recorded as `org.opencontainers.image.ref.name` annotations of
//! the form `repository:tag`. The registry host of a reference is ignored.

use super::{CredentialProvider, Registry, RegistryError};
use crate::artifact::{Descriptor, IMAGE_MANIFEST_MEDIA_TYPE};
use crate::types::{Digest, Reference};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageIndex {
    schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        ImageIndex {
            schema_version: 2,
            media_type: Some(INDEX_MEDIA_TYPE.to_string()),
            manifests: Vec::new(),
        }
    }
}

fn ref_name(descriptor: &Descriptor) -> Option<&str> {
    descriptor
        .annotations
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .map(String::as_str)
}

pub struct LayoutRegistry {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl LayoutRegistry {
    /// Open (and create if missing) a layout rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let root = root.into();
        let blobs = root.join("blobs").join("sha256");
        tokio::fs::create_dir_all(&blobs)
            .await
            .map_err(|e| RegistryError::io(&blobs, e))?;

        let marker = root.join("oci-layout");
        if !tokio::fs::try_exists(&marker)
            .await
            .map_err(|e| RegistryError::io(&marker, e))?
        {
            tokio::fs::write(&marker, br#"{"imageLayoutVersion":"1.0.0"}"#)
                .await
                .map_err(|e| RegistryError::io(&marker, e))?;
        }

        Ok(LayoutRegistry {
            root,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.encoded())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    async fn read_index(&self) -> Result<ImageIndex, RegistryError> {
        let path = self.index_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| RegistryError::Malformed(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ImageIndex::default()),
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }

    /// Replace index.json via rename so readers never see a partial file
    async fn write_index(&self, index: &ImageIndex) -> Result<(), RegistryError> {
        let path = self.index_path();
        let tmp = self.root.join("index.json.tmp");
        let bytes = serde_json::to_vec_pretty(index)
            .map_err(|e| RegistryError::Malformed(e.to_string()))?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| RegistryError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RegistryError::io(&path, e))
    }

    async fn write_blob(&self, bytes: &[u8]) -> Result<Digest, RegistryError> {
        let digest = Digest::of(bytes);
        let path = self.blob_path(&digest);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| RegistryError::io(&path, e))?
        {
            return Ok(digest);
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| RegistryError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RegistryError::io(&path, e))?;
        Ok(digest)
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
        let path = self.blob_path(digest);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RegistryError::NotFound(format!("blob {}", digest)))
            }
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }

    /// All tagged references in the layout, as `repository:tag`
    pub async fn tags(&self) -> Result<Vec<String>, RegistryError> {
        let index = self.read_index().await?;
        Ok(index
            .manifests
            .iter()
            .filter_map(|d| ref_name(d).map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl Registry for LayoutRegistry {
    async fn head_manifest(
        &self,
        reference: &Reference,
        _credentials: &dyn CredentialProvider,
    ) -> Result<Digest, RegistryError> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }
        let name = reference.layout_name();
        let index = self.read_index().await?;
        index
            .manifests
            .iter()
            .find(|d| ref_name(d) == Some(name.as_str()))
            .map(|d| d.digest.clone())
            .ok_or_else(|| RegistryError::NotFound(format!("image {}", reference)))
    }

    async fn get_manifest(
        &self,
        reference: &Reference,
        credentials: &dyn CredentialProvider,
    ) -> Result<Vec<u8>, RegistryError> {
        let digest = self.head_manifest(reference, credentials).await?;
        self.read_blob(&digest).await
    }

    async fn get_blob(
        &self,
        _reference: &Reference,
        digest: &Digest,
        _credentials: &dyn CredentialProvider,
    ) -> Result<Vec<u8>, RegistryError> {
        self.read_blob(digest).await
    }

    async fn put_blob(
        &self,
        _reference: &Reference,
        bytes: &[u8],
        _credentials: &dyn CredentialProvider,
    ) -> Result<Digest, RegistryError> {
        self.write_blob(bytes).await
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        manifest: &[u8],
        _credentials: &dyn CredentialProvider,
    ) -> Result<Digest, RegistryError> {
        let digest = self.write_blob(manifest).await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        let name = reference.tag.as_ref().map(|_| reference.layout_name());

        match &name {
            Some(name) => index
                .manifests
                .retain(|d| ref_name(d) != Some(name.as_str())),
            None => index
                .manifests
                .retain(|d| !(ref_name(d).is_none() && d.digest == digest)),
        }
        index.manifests.push(Descriptor {
            media_type: IMAGE_MANIFEST_MEDIA_TYPE.to_string(),
            digest: digest.clone(),
            size: manifest.len() as u64,
            annotations: name.map(|n| BTreeMap::from([(REF_NAME_ANNOTATION.to_string(), n)])),
        });
        self.write_index(&index).await?;

        Ok(digest)
    }
}
