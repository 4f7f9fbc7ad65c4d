//! Shared fixtures for wacpack integration tests
//!
//! Components are assembled from WAT, packed and pushed into an OCI layout
//! in a temporary directory.

#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wacpack::artifact::Packager;
use wacpack::pipeline::Pipeline;
use wacpack::registry::layout::LayoutRegistry;
use wacpack::registry::{Anonymous, CredentialSet, Registry};
use wacpack::request::CompositionRequest;
use wacpack::resources::{Component, Resource, ResourceMeta, ResourceStore};
use wacpack::state::MemoryStateStore;
use wacpack::status::{ComponentStatus, READY};
use wacpack::tools::Tools;
use wacpack::types::Reference;

/// Imports `example:greet/greeter` and exports nothing
pub const SOCKET_WAT: &str = r#"(component
    (import "example:greet/greeter" (instance
        (export "greet" (func (result string)))
    ))
)"#;

/// Exports `example:greet/greeter`
pub const PLUG_WAT: &str = r#"(component
    (core module $m
        (memory (export "memory") 1)
        (data (i32.const 16) "hi")
        (func (export "greet") (result i32)
            (i32.store (i32.const 0) (i32.const 16))
            (i32.store (i32.const 4) (i32.const 2))
            (i32.const 0))
        (func (export "realloc") (param i32 i32 i32 i32) (result i32) (i32.const 64))
    )
    (core instance $i (instantiate $m))
    (alias core export $i "memory" (core memory $mem))
    (alias core export $i "realloc" (core func $realloc))
    (type $greet (func (result string)))
    (func $greet (type $greet)
        (canon lift (core func $i "greet") (memory $mem) (realloc $realloc)))
    (instance $greeter (export "greet" (func $greet)))
    (export "example:greet/greeter" (instance $greeter))
)"#;

pub struct Fixture {
    pub temp: TempDir,
    pub registry: Arc<LayoutRegistry>,
    pub resources: Arc<ResourceStore>,
    pub state: Arc<MemoryStateStore>,
    pub tools: Tools,
}

impl Fixture {
    pub async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let registry = LayoutRegistry::open(temp.path().join("layout")).await.unwrap();
        Fixture {
            temp,
            registry: Arc::new(registry),
            resources: Arc::new(ResourceStore::in_memory()),
            state: Arc::new(MemoryStateStore::new()),
            tools: Tools::embedded(2),
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.registry.clone(),
            self.resources.clone(),
            self.state.clone(),
            self.tools.clone(),
            CredentialSet::anonymous(),
        )
    }

    /// Assemble, pack and push `wat` to `tag`, returning the pinned reference
    pub async fn push_wat(&self, tag: &str, wat: &str) -> Reference {
        let binary = wat::parse_str(wat).unwrap();
        let packed = Packager::new(self.tools.clone(), "test")
            .pack(binary, &CancellationToken::new())
            .await
            .unwrap();
        self.registry
            .push(&tag.parse().unwrap(), &packed.image, &Anonymous)
            .await
            .unwrap()
    }

    /// Push the socket and plug components under `components/`
    pub async fn push_socket_and_plug(&self) -> (Reference, Reference) {
        let socket = self.push_wat("components/socket:v1", SOCKET_WAT).await;
        let plug = self.push_wat("components/plug:v1", PLUG_WAT).await;
        (socket, plug)
    }

    /// Register a ready component resource for an already pushed image
    pub async fn add_component(&self, name: &str, image: &Reference) -> Component {
        let config = self.registry.pull_config(image, &Anonymous).await.unwrap();
        let mut status = ComponentStatus {
            observed_generation: 1,
            image: Some(image.clone()),
            wit: Some(config.wit()),
            ..Default::default()
        };
        status.mark_true(READY);
        let component = Component {
            metadata: ResourceMeta::new("default", name),
            image: image.clone(),
            status,
        };
        self.resources
            .put(Resource::Component(component.clone()))
            .await
            .unwrap();
        component
    }
}

/// Parse a request from the body of its `[composition]` table
pub fn request(body: &str) -> CompositionRequest {
    CompositionRequest::parse(&format!("[composition]\n{}", body)).unwrap()
}
