//! Component-like resources
//!
//! Dependencies may point at other managed resources instead of images.
//! Only some kinds can serve as a component; those expose their identity,
//! generation, published image and readiness through [`ComponentLike`].
//! Resources of any other kind are reported as not being components.

pub mod store;

pub use store::ResourceStore;

use crate::request::{COMPOSITION_KIND, CompositionSpec, derive_uid};
use crate::status::{ComponentStatus, Readiness};
use crate::trace::ComponentSpan;
use crate::types::{Reference, ResourceIdentity, ResourceRef, Wit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const COMPONENT_KIND: &str = "Component";
pub const CONFIG_STORE_KIND: &str = "ConfigStore";

/// Object metadata shared by all kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    #[serde(default = "default_generation")]
    pub generation: i64,
}

fn default_generation() -> i64 {
    1
}

impl ResourceMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        ResourceMeta {
            uid: derive_uid(namespace, name),
            namespace: namespace.to_string(),
            name: name.to_string(),
            generation: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecSummary {
    pub generation: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSummary {
    pub observed_generation: i64,
    pub image: Option<Reference>,
    pub wit: Option<Wit>,
    pub trace: Vec<ComponentSpan>,
}

/// A resource that can fill a dependency slot
pub trait ComponentLike: Send + Sync {
    fn identity(&self) -> ResourceIdentity;
    fn spec_summary(&self) -> SpecSummary;
    fn status_summary(&self) -> StatusSummary;
    fn readiness(&self) -> Readiness;
}

fn summarize(status: &ComponentStatus) -> StatusSummary {
    StatusSummary {
        observed_generation: status.observed_generation,
        image: status.image.clone(),
        wit: status.wit.clone(),
        trace: status.trace.clone(),
    }
}

fn identity_of(meta: &ResourceMeta, kind: &str) -> ResourceIdentity {
    ResourceIdentity {
        uid: meta.uid.clone(),
        reference: ResourceRef::new(kind, &meta.namespace, &meta.name),
    }
}

/// A component published from a registry image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub metadata: ResourceMeta,
    pub image: Reference,
    #[serde(default)]
    pub status: ComponentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition {
    pub metadata: ResourceMeta,
    #[serde(default)]
    pub spec: CompositionSpec,
    #[serde(default)]
    pub status: ComponentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStore {
    pub metadata: ResourceMeta,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub status: ComponentStatus,
}

/// A resource of a kind that cannot act as a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherResource {
    pub group: String,
    pub kind: String,
    pub metadata: ResourceMeta,
}

macro_rules! component_like {
    ($ty:ty, $kind:expr) => {
        impl ComponentLike for $ty {
            fn identity(&self) -> ResourceIdentity {
                identity_of(&self.metadata, $kind)
            }

            fn spec_summary(&self) -> SpecSummary {
                SpecSummary {
                    generation: self.metadata.generation,
                }
            }

            fn status_summary(&self) -> StatusSummary {
                summarize(&self.status)
            }

            fn readiness(&self) -> Readiness {
                self.status.readiness()
            }
        }
    };
}

component_like!(Component, COMPONENT_KIND);
component_like!(Composition, COMPOSITION_KIND);
component_like!(ConfigStore, CONFIG_STORE_KIND);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    Component(Component),
    Composition(Composition),
    ConfigStore(ConfigStore),
    Other(OtherResource),
}

impl Resource {
    pub fn metadata(&self) -> &ResourceMeta {
        match self {
            Resource::Component(r) => &r.metadata,
            Resource::Composition(r) => &r.metadata,
            Resource::ConfigStore(r) => &r.metadata,
            Resource::Other(r) => &r.metadata,
        }
    }

    pub fn reference(&self) -> ResourceRef {
        let meta = self.metadata();
        match self {
            Resource::Component(_) => ResourceRef::new(COMPONENT_KIND, &meta.namespace, &meta.name),
            Resource::Composition(_) => {
                ResourceRef::new(COMPOSITION_KIND, &meta.namespace, &meta.name)
            }
            Resource::ConfigStore(_) => {
                ResourceRef::new(CONFIG_STORE_KIND, &meta.namespace, &meta.name)
            }
            Resource::Other(other) => ResourceRef {
                group: other.group.clone(),
                kind: other.kind.clone(),
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            },
        }
    }

    pub fn as_component_like(&self) -> Option<&dyn ComponentLike> {
        match self {
            Resource::Component(r) => Some(r),
            Resource::Composition(r) => Some(r),
            Resource::ConfigStore(r) => Some(r),
            Resource::Other(_) => None,
        }
    }
}

/// Lookup and tracking of resources referenced by compositions
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    async fn get(&self, reference: &ResourceRef) -> Option<Resource>;

    /// Record that `by` depends on `reference`
    async fn track(&self, reference: &ResourceRef, by: &ResourceRef);

    /// Resources that depend on `reference`
    async fn trackers(&self, reference: &ResourceRef) -> Vec<ResourceRef>;
}
