//! In-memory resource store with optional JSON persistence

use super::{Resource, ResourceLookup};
use crate::types::ResourceRef;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    resources: Vec<Resource>,
    #[serde(default)]
    tracks: Vec<Track>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Track {
    reference: ResourceRef,
    by: ResourceRef,
}

#[derive(Default)]
struct Inner {
    resources: BTreeMap<ResourceRef, Resource>,
    tracks: BTreeMap<ResourceRef, BTreeSet<ResourceRef>>,
}

impl Inner {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            resources: self.resources.values().cloned().collect(),
            tracks: self
                .tracks
                .iter()
                .flat_map(|(reference, by)| {
                    by.iter().map(|b| Track {
                        reference: reference.clone(),
                        by: b.clone(),
                    })
                })
                .collect(),
        }
    }
}

pub struct ResourceStore {
    inner: RwLock<Inner>,
    path: Option<PathBuf>,
}

impl ResourceStore {
    pub fn in_memory() -> Self {
        ResourceStore {
            inner: RwLock::new(Inner::default()),
            path: None,
        }
    }

    /// Load resources from `path`, saving back to it on every change
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot: Snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse resources: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read resources: {}", path.display()));
            }
        };

        let mut inner = Inner::default();
        for resource in snapshot.resources {
            inner.resources.insert(resource.reference(), resource);
        }
        for track in snapshot.tracks {
            inner
                .tracks
                .entry(track.reference)
                .or_default()
                .insert(track.by);
        }

        Ok(ResourceStore {
            inner: RwLock::new(inner),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or replace a resource
    pub async fn put(&self, resource: Resource) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.resources.insert(resource.reference(), resource);
        self.persist(&inner).await
    }

    pub async fn remove(&self, reference: &ResourceRef) -> Result<Option<Resource>> {
        let mut inner = self.inner.write().await;
        let removed = inner.resources.remove(reference);
        inner.tracks.remove(reference);
        for by in inner.tracks.values_mut() {
            by.remove(reference);
        }
        self.persist(&inner).await?;
        Ok(removed)
    }

    pub async fn list(&self) -> Vec<Resource> {
        self.inner.read().await.resources.values().cloned().collect()
    }

    async fn persist(&self, inner: &Inner) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&inner.snapshot())
            .context("Failed to serialize resources")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write resources: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace resources: {}", path.display()))
    }
}

#[async_trait]
impl ResourceLookup for ResourceStore {
    async fn get(&self, reference: &ResourceRef) -> Option<Resource> {
        self.inner.read().await.resources.get(reference).cloned()
    }

    async fn track(&self, reference: &ResourceRef, by: &ResourceRef) {
        let mut inner = self.inner.write().await;
        let added = inner
            .tracks
            .entry(reference.clone())
            .or_default()
            .insert(by.clone());
        if added && let Err(e) = self.persist(&inner).await {
            tracing::warn!(reference = %reference, error = %format!("{:#}", e), "Failed to persist track");
        }
    }

    async fn trackers(&self, reference: &ResourceRef) -> Vec<ResourceRef> {
        self.inner
            .read()
            .await
            .tracks
            .get(reference)
            .map(|by| by.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{COMPONENT_KIND, Component, ResourceMeta};
    use crate::status::ComponentStatus;
    use tempfile::TempDir;

    fn greeter() -> Resource {
        Resource::Component(Component {
            metadata: ResourceMeta::new("default", "greeter"),
            image: "repo/greeter:v1".parse().unwrap(),
            status: ComponentStatus::default(),
        })
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = ResourceStore::in_memory();
        let reference = ResourceRef::new(COMPONENT_KIND, "default", "greeter");
        assert!(store.get(&reference).await.is_none());

        store.put(greeter()).await.unwrap();
        assert_eq!(store.get(&reference).await, Some(greeter()));
        assert_eq!(store.list().await.len(), 1);

        let removed = store.remove(&reference).await.unwrap();
        assert!(removed.is_some());
        assert!(store.get(&reference).await.is_none());
    }

    #[tokio::test]
    async fn test_tracking_is_deduplicated() {
        let store = ResourceStore::in_memory();
        let target = ResourceRef::new(COMPONENT_KIND, "default", "greeter");
        let owner = ResourceRef::new("Composition", "default", "app");
        store.track(&target, &owner).await;
        store.track(&target, &owner).await;
        assert_eq!(store.trackers(&target).await, vec![owner]);
    }

    #[tokio::test]
    async fn test_persists_across_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("resources.json");
        let target = ResourceRef::new(COMPONENT_KIND, "default", "greeter");
        let owner = ResourceRef::new("Composition", "default", "app");

        {
            let store = ResourceStore::open(&path).await.unwrap();
            store.put(greeter()).await.unwrap();
            store.track(&target, &owner).await;
        }

        let reopened = ResourceStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(&target).await, Some(greeter()));
        assert_eq!(reopened.trackers(&target).await, vec![owner]);
    }
}
