//! CLI command implementations
//!
//! Each submodule backs one group of `wacpack` subcommands. [`Environment`]
//! wires the registry, resource store, state store and tools from config.

pub mod artifact;
pub mod compose;
pub mod resource;

use crate::config::{self, RegistryKind, WacpackConfig};
use crate::pipeline::Pipeline;
use crate::registry::distribution::DistributionRegistry;
use crate::registry::layout::LayoutRegistry;
use crate::registry::{CredentialSet, Registry};
use crate::resources::ResourceStore;
use crate::state::FileStateStore;
use crate::status::ComponentStatus;
use crate::trace::ComponentSpan;
use crate::types::ResourceRef;
use crate::tools::Tools;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a command needs, built from the user's config
pub struct Environment {
    pub config: WacpackConfig,
    pub registry: Arc<dyn Registry>,
    pub resources: Arc<ResourceStore>,
    pub state: Arc<FileStateStore>,
    pub tools: Tools,
    pub credentials: CredentialSet,
}

impl Environment {
    /// Build from the config file and default locations
    pub async fn load() -> Result<Self> {
        let config = config::load_config()?;
        let resources = config::get_resources_path()?;
        let state = FileStateStore::default_location()?;
        Self::from_config(config, resources, state).await
    }

    pub async fn from_config(
        config: WacpackConfig,
        resources_path: PathBuf,
        state: FileStateStore,
    ) -> Result<Self> {
        let registry: Arc<dyn Registry> = match config.registry.kind {
            RegistryKind::Layout => {
                let dir = match &config.registry.layout_dir {
                    Some(dir) => dir.clone(),
                    None => config::get_layout_dir()?,
                };
                let layout = LayoutRegistry::open(&dir)
                    .await
                    .with_context(|| format!("Failed to open OCI layout: {}", dir.display()))?;
                tracing::debug!("Using OCI layout at {}", dir.display());
                Arc::new(layout)
            }
            RegistryKind::Distribution => Arc::new(DistributionRegistry::new(
                config.registry.default_registry.clone(),
                config.registry.insecure,
            )),
        };

        let mut credentials = match config.registry.credentials() {
            Some(creds) => CredentialSet::new(Arc::new(creds)),
            None => CredentialSet::anonymous(),
        };
        for (name, account) in &config.registry.accounts {
            match account.credentials() {
                Some(creds) => credentials = credentials.with_account(name, Arc::new(creds)),
                None => tracing::warn!("Ignoring service account '{}' without credentials", name),
            }
        }

        let resources = ResourceStore::open(resources_path).await?;

        Ok(Environment {
            tools: Tools::embedded(config.tools.max_idle),
            registry,
            resources: Arc::new(resources),
            state: Arc::new(state),
            credentials,
            config,
        })
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.registry.clone(),
            self.resources.clone(),
            self.state.clone(),
            self.tools.clone(),
            self.credentials.clone(),
        )
        .with_author(&self.config.artifact.author)
        .with_publish(self.config.publish.clone())
    }
}

/// Token cancelled on Ctrl-C
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

/// Restart the compositions that depend on `changed` and list them
pub async fn restart_dependents(env: &Environment, changed: &ResourceRef) -> Result<()> {
    let restarted = env
        .pipeline()
        .invalidate_dependents(changed)
        .await
        .with_context(|| format!("Failed to restart dependents of {}", changed))?;
    for dependent in &restarted {
        println!("  ↻ {} will recompose on its next run", dependent);
    }
    Ok(())
}

/// Render a provenance trace as indented lines, one per span
pub fn trace_lines(trace: &[ComponentSpan]) -> Vec<String> {
    fn walk(trace: &[ComponentSpan], depth: usize, lines: &mut Vec<String>) {
        for span in trace {
            let mut line = format!("{:indent$}{}", "", span.reference(), indent = depth * 2);
            if let Some(digest) = &span.digest {
                line.push_str(&format!(" {}", digest));
            }
            if span.cycle_omitted {
                line.push_str(" (cycle omitted)");
            }
            lines.push(line);
            walk(&span.trace, depth + 1, lines);
        }
    }

    let mut lines = Vec::new();
    walk(trace, 0, &mut lines);
    lines
}

/// Print conditions as an aligned table
pub fn print_conditions(status: &ComponentStatus) {
    for condition in &status.conditions {
        let detail = match (condition.reason.is_empty(), condition.message.is_empty()) {
            (true, true) => String::new(),
            (false, true) => condition.reason.clone(),
            (_, false) => format!("{}: {}", condition.reason, condition.message),
        };
        println!(
            "  {:<22} {:<8} {}",
            condition.kind,
            condition.status.to_string(),
            detail
        );
    }
}
