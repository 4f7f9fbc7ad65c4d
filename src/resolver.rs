//! Dependency resolution
//!
//! Turns each dependency slot of a composition into concrete component bytes.
//! References to other resources are gated on cycle detection first, then on
//! the referenced resource having caught up with its spec and being ready.

use crate::compose::Composer;
use crate::error::{PipelineError, Position, registry_call};
use crate::registry::{CredentialSet, Registry};
use crate::request::{CompositionSpec, Dependency, DependencySource};
use crate::resources::ResourceLookup;
use crate::status::ConditionStatus;
use crate::tools::Tools;
use crate::trace::{self, ComponentSpan};
use crate::types::{Reference, ResolvedComponent, ResourceIdentity, ResourceRef};
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A resolved dependency and the trace after visiting it
#[derive(Debug, Clone)]
pub struct Resolution {
    pub component: ResolvedComponent,
    pub trace: Vec<ComponentSpan>,
}

#[derive(Clone)]
pub struct DependencyResolver {
    registry: Arc<dyn Registry>,
    resources: Arc<dyn ResourceLookup>,
    tools: Tools,
    credentials: CredentialSet,
    composer: Composer,
}

impl DependencyResolver {
    pub fn new(
        registry: Arc<dyn Registry>,
        resources: Arc<dyn ResourceLookup>,
        tools: Tools,
        credentials: CredentialSet,
    ) -> Self {
        DependencyResolver {
            registry,
            resources,
            composer: Composer::new(tools.clone()),
            tools,
            credentials,
        }
    }

    /// Resolve one dependency of `owner`
    ///
    /// `trace` is never modified; the returned resolution carries the
    /// updated copy.
    pub async fn resolve(
        &self,
        dependency: &Dependency,
        owner: &ResourceIdentity,
        trace: &[ComponentSpan],
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<Resolution, PipelineError> {
        tracing::debug!(
            request = %owner.reference,
            dependency = %dependency.component,
            source = %dependency.source.describe(),
            "Resolving dependency {}",
            position
        );

        match &dependency.source {
            DependencySource::DirectImage {
                image,
                service_account,
            } => {
                let component = self
                    .resolve_image(
                        &dependency.component,
                        image,
                        service_account.as_deref(),
                        position,
                        cancel,
                    )
                    .await?;
                Ok(Resolution {
                    component,
                    trace: trace.to_vec(),
                })
            }
            DependencySource::ComponentRef(reference) => {
                self.resolve_reference(&dependency.component, reference, owner, trace, position, cancel)
                    .await
            }
            DependencySource::GeneratedConfig { values } => {
                let component = self
                    .resolve_config(&dependency.component, values, position, cancel)
                    .await?;
                Ok(Resolution {
                    component,
                    trace: trace.to_vec(),
                })
            }
            DependencySource::NestedComposition(spec) => {
                self.resolve_nested(&dependency.component, spec, owner, trace.to_vec(), position, cancel)
                    .await
            }
        }
    }

    async fn resolve_image(
        &self,
        name: &str,
        image: &Reference,
        service_account: Option<&str>,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<ResolvedComponent, PipelineError> {
        let credentials = self.credentials.for_account(service_account).ok_or_else(|| {
            PipelineError::Invalid(format!(
                "service account '{}' has no credentials {}",
                service_account.unwrap_or_default(),
                position
            ))
        })?;

        let pinned = registry_call(
            format!("failed to resolve image {} {}", image, position),
            cancel,
            self.registry.resolve_digest(image, credentials),
        )
        .await?;
        let pulled = registry_call(
            format!("failed to pull image {} {}", pinned, position),
            cancel,
            self.registry.pull(&pinned, credentials),
        )
        .await?;

        let wit = pulled.config.wit();
        Ok(ResolvedComponent::new(
            name,
            Some(pulled.reference),
            pulled.bytes,
            wit,
        ))
    }

    async fn resolve_reference(
        &self,
        name: &str,
        reference: &ResourceRef,
        owner: &ResourceIdentity,
        trace: &[ComponentSpan],
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<Resolution, PipelineError> {
        let Some(resource) = self.resources.get(reference).await else {
            return Err(PipelineError::NotFound(format!(
                "{} not found {}",
                reference, position
            )));
        };
        let Some(component) = resource.as_component_like() else {
            return Err(PipelineError::NotComponent(format!(
                "{} is not a component {}",
                reference, position
            )));
        };

        self.resources.track(reference, &owner.reference).await;

        let status = component.status_summary();
        let span = ComponentSpan::synthesize(
            &component.identity(),
            status.image.as_ref().and_then(|i| i.digest.clone()),
            status.trace.clone(),
        );
        let (has_cycle, updated) = trace::check_and_append(trace, span, &owner.uid);
        if has_cycle {
            return Err(PipelineError::CycleDetected {
                message: format!(
                    "{} references {} through a cycle {}",
                    owner.reference, reference, position
                ),
                trace: updated,
            });
        }

        let generation = component.spec_summary().generation;
        if generation != status.observed_generation {
            return Err(PipelineError::Blocked(format!(
                "{} generation {} not yet observed (at {}) {}",
                reference, generation, status.observed_generation, position
            )));
        }

        let readiness = component.readiness();
        match readiness.status {
            ConditionStatus::True => {}
            ConditionStatus::False => {
                return Err(PipelineError::NotReady {
                    message: format!(
                        "{} is not ready: {} {}",
                        reference, readiness.message, position
                    ),
                    durable: true,
                });
            }
            ConditionStatus::Unknown => {
                return Err(PipelineError::NotReady {
                    message: format!("{} is not ready yet {}", reference, position),
                    durable: false,
                });
            }
        }

        let Some(image) = status.image else {
            return Err(PipelineError::ImageMissing(format!(
                "{} is ready but reports no image {}",
                reference, position
            )));
        };

        let credentials = self.credentials.default_provider();
        let pulled = registry_call(
            format!("failed to pull image {} for {} {}", image, reference, position),
            cancel,
            self.registry.pull(&image, credentials),
        )
        .await?;

        let wit = match status.wit {
            Some(wit) => wit,
            None => {
                tracing::debug!(%reference, "No WIT on status, using the pulled config");
                pulled.config.wit()
            }
        };
        Ok(Resolution {
            component: ResolvedComponent::new(name, Some(pulled.reference), pulled.bytes, wit),
            trace: updated,
        })
    }

    async fn resolve_config(
        &self,
        name: &str,
        values: &BTreeMap<String, String>,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<ResolvedComponent, PipelineError> {
        let bytes = self
            .tools
            .synthesize_config(values, cancel)
            .await
            .map_err(|e| PipelineError::tool(format!("failed to build config {}", position), e))?;
        let wit = crate::wit::extract_imports_exports(&self.tools, &bytes, cancel)
            .await
            .map_err(|e| PipelineError::tool(format!("failed to extract WIT {}", position), e))?;
        Ok(ResolvedComponent::new(name, None, bytes, wit))
    }

    /// Resolve and compose a nested composition, threading the same trace
    fn resolve_nested<'a>(
        &'a self,
        name: &'a str,
        spec: &'a CompositionSpec,
        owner: &'a ResourceIdentity,
        mut trace: Vec<ComponentSpan>,
        position: Position,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Resolution, PipelineError>> {
        async move {
            let mode = spec
                .mode()
                .map_err(|e| PipelineError::Invalid(format!("{}: {} {}", name, e, position)))?;

            let total = spec.dependencies.len();
            let mut resolved = Vec::with_capacity(total);
            for (index, dependency) in spec.dependencies.iter().enumerate() {
                let resolution = self
                    .resolve(dependency, owner, &trace, Position::new(index, total), cancel)
                    .await?;
                trace = resolution.trace;
                resolved.push(resolution.component);
            }

            let bytes = self.composer.compose(&resolved, &mode, cancel).await?;
            let wit = crate::wit::extract_imports_exports(&self.tools, &bytes, cancel)
                .await
                .map_err(|e| {
                    PipelineError::tool(format!("failed to extract WIT {}", position), e)
                })?;
            Ok(Resolution {
                component: ResolvedComponent::new(name, None, bytes, wit),
                trace,
            })
        }
        .boxed()
    }
}
