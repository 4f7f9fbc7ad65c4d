//! `wacpack compose`: drive a composition request through the pipeline

use super::{Environment, interrupt_token, print_conditions, restart_dependents};
use crate::pipeline::Progress;
use crate::request::CompositionRequest;
use crate::resources::{Composition, Resource, ResourceMeta};
use crate::state::Phase;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub struct ComposeOptions {
    pub request: PathBuf,
    pub output: Option<PathBuf>,
    pub no_push: bool,
    pub reset: bool,
}

pub async fn run(env: &Environment, options: ComposeOptions) -> Result<()> {
    let request = CompositionRequest::load(&options.request)?;
    let key = request.key();
    let pipeline = env.pipeline();

    if options.no_push && options.output.is_none() {
        anyhow::bail!("--no-push requires --output");
    }

    if options.reset {
        pipeline
            .reset(&key)
            .await
            .with_context(|| format!("Failed to reset {}", key))?;
        tracing::info!(request = %key, "Reset pipeline state");
    }

    let cancel = interrupt_token();
    let until = if options.no_push {
        Phase::Packaging
    } else {
        Phase::Complete
    };
    let outcome = pipeline
        .run_until(&request, until, &env.config.retry, &cancel)
        .await;

    let status = pipeline.status(&key).await?;
    println!("{} (generation {})", key, request.generation);
    if let Some(status) = &status {
        print_conditions(status);
    }

    let progress = outcome.with_context(|| format!("Composition {} failed", key))?;

    if let Some(output) = &options.output {
        let composed = pipeline
            .composed(&key)
            .await?
            .context("Pipeline finished without a composed component")?;
        write_output(output, &composed).await?;
        println!("Wrote {} ({} bytes)", output.display(), composed.len());
    }

    match progress {
        Progress::Complete(image) => {
            if let Some(status) = status {
                let resource = Resource::Composition(Composition {
                    metadata: ResourceMeta {
                        uid: request.uid.clone(),
                        namespace: request.namespace.clone(),
                        name: request.name.clone(),
                        generation: request.generation,
                    },
                    spec: request.spec.clone(),
                    status,
                });
                env.resources
                    .put(resource)
                    .await
                    .context("Failed to record composition resource")?;
            }
            println!("✅ Published {}", image);
            restart_dependents(env, &request.reference()).await?;
        }
        Progress::Pending(phase) => {
            println!("Stopped before {:?}; nothing was pushed", phase);
        }
    }

    Ok(())
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
