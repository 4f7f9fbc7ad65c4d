//! Resource store commands and status reporting

use super::{Environment, interrupt_token, print_conditions, restart_dependents, trace_lines};
use crate::resources::{
    COMPONENT_KIND, CONFIG_STORE_KIND, Component, ConfigStore, Resource, ResourceLookup,
    ResourceMeta,
};
use crate::status::{ComponentStatus, READY};
use crate::types::{Reference, ResourceRef};
use anyhow::{Context, Result};

/// Register a component backed by a registry image
///
/// The image is resolved to a digest up front so that compositions
/// referencing the component always pull the same bytes.
pub async fn add(env: &Environment, namespace: &str, name: &str, image: &str) -> Result<()> {
    let image: Reference = image
        .parse()
        .with_context(|| format!("Invalid image reference '{}'", image))?;
    let credentials = env.credentials.default_provider();
    let pinned = env
        .registry
        .resolve_digest(&image, credentials)
        .await
        .with_context(|| format!("Failed to resolve {}", image))?;
    let config = env
        .registry
        .pull_config(&pinned, credentials)
        .await
        .with_context(|| format!("Failed to read config of {}", pinned))?;

    let reference = ResourceRef::new(COMPONENT_KIND, namespace, name);
    let mut metadata = ResourceMeta::new(namespace, name);
    if let Some(Resource::Component(existing)) = env.resources.get(&reference).await {
        metadata.generation = existing.metadata.generation + 1;
    }

    let mut status = ComponentStatus {
        observed_generation: metadata.generation,
        image: Some(pinned.clone()),
        wit: Some(config.wit()),
        ..Default::default()
    };
    status.initialize_conditions(&[]);
    status.mark_true(READY);

    env.resources
        .put(Resource::Component(Component {
            metadata,
            image,
            status,
        }))
        .await
        .context("Failed to save resource")?;

    println!("✅ Registered {} → {}", reference, pinned);
    restart_dependents(env, &reference).await
}

/// Register a config store and publish the component serving its values
pub async fn add_config(
    env: &Environment,
    namespace: &str,
    name: &str,
    pairs: &[String],
) -> Result<()> {
    let values = super::artifact::parse_values(pairs)?;
    let reference = ResourceRef::new(CONFIG_STORE_KIND, namespace, name);
    let mut metadata = ResourceMeta::new(namespace, name);
    if let Some(Resource::ConfigStore(existing)) = env.resources.get(&reference).await {
        metadata.generation = existing.metadata.generation + 1;
    }

    let mut store = ConfigStore {
        metadata,
        values,
        status: ComponentStatus::default(),
    };
    store.status = env
        .pipeline()
        .publish_config_store(&store, &interrupt_token())
        .await
        .with_context(|| format!("Failed to publish {}", reference))?;
    let image = store
        .status
        .image
        .as_ref()
        .map(|i| i.to_string())
        .unwrap_or_default();

    env.resources
        .put(Resource::ConfigStore(store))
        .await
        .context("Failed to save resource")?;

    println!("✅ Registered {} → {}", reference, image);
    restart_dependents(env, &reference).await
}

pub async fn list(env: &Environment) -> Result<()> {
    let resources = env.resources.list().await;
    if resources.is_empty() {
        println!("No resources registered");
        println!("\nAdd one with: wacpack resource add <name> <image>");
        return Ok(());
    }

    println!("Resources:");
    for resource in &resources {
        let ready = match resource.as_component_like() {
            Some(component) => component.readiness().status.to_string(),
            None => "-".to_string(),
        };
        let image = match resource {
            Resource::Component(c) => c.status.image.as_ref().unwrap_or(&c.image).to_string(),
            Resource::Composition(c) => c
                .status
                .image
                .as_ref()
                .map(|i| i.to_string())
                .unwrap_or_default(),
            Resource::ConfigStore(c) => c
                .status
                .image
                .as_ref()
                .map(|i| i.to_string())
                .unwrap_or_default(),
            Resource::Other(_) => String::new(),
        };
        println!("  {:<40} {:<8} {}", resource.reference().to_string(), ready, image);
    }
    Ok(())
}

pub async fn remove(env: &Environment, kind: &str, namespace: &str, name: &str) -> Result<()> {
    let reference = ResourceRef::new(kind, namespace, name);
    if env.resources.get(&reference).await.is_none() {
        anyhow::bail!("{} is not registered", reference);
    }
    // dependents are looked up before removal drops their tracks
    restart_dependents(env, &reference).await?;
    env.resources.remove(&reference).await?;
    println!("✅ Removed {}", reference);
    Ok(())
}

/// Print the persisted pipeline status of a request (`namespace/name`)
pub async fn status(env: &Environment, key: &str, json: bool) -> Result<()> {
    let key = if key.contains('/') {
        key.to_string()
    } else {
        format!("{}/{}", crate::types::DEFAULT_NAMESPACE, key)
    };
    let status = env
        .pipeline()
        .status(&key)
        .await?
        .with_context(|| format!("No pipeline state for {}", key))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{} (observed generation {})", key, status.observed_generation);
    print_conditions(&status);
    if let Some(image) = &status.image {
        println!("  image: {}", image);
    }
    if !status.dependencies.is_empty() {
        println!("  dependencies:");
        for dependency in &status.dependencies {
            let source = dependency
                .image
                .as_ref()
                .map(|i| i.to_string())
                .unwrap_or_else(|| "(generated)".to_string());
            println!("    {:<20} {}", dependency.component, source);
        }
    }
    if !status.trace.is_empty() {
        println!("  trace:");
        for line in trace_lines(&status.trace) {
            println!("    {}", line);
        }
    }
    Ok(())
}
