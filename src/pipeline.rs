//! Resumable composition pipeline
//!
//! A request moves through three phases: resolve each dependency in order,
//! compose, then package and publish. Every call to [`Pipeline::step`] does
//! one unit of work and persists what it produced, so a pass can stop at any
//! point (error, cancellation, process exit) and pick up where it left off.

use crate::artifact::Packager;
use crate::compose::Composer;
use crate::config::TemplateVars;
use crate::config::schema::{PublishConfig, RetryConfig};
use crate::error::{PipelineError, Position, registry_call};
use crate::registry::{CredentialSet, Registry};
use crate::request::{COMPOSITION_KIND, CompositionRequest};
use crate::resolver::DependencyResolver;
use crate::resources::{CONFIG_STORE_KIND, ConfigStore, ResourceLookup};
use crate::state::{Phase, PipelineState, StateStore};
use crate::status::{
    COMPOSED, COMPOSITION_CONDITIONS, ComponentStatus, DEPENDENCIES_RESOLVED, DependencyStatus,
    PACKAGED,
};
use crate::tools::Tools;
use crate::types::{DEFAULT_GROUP, Reference, ResourceRef};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a successful step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// More work remains; the pipeline is now in this phase
    Pending(Phase),
    /// Published at this digest-pinned reference
    Complete(Reference),
}

pub struct Pipeline {
    resolver: DependencyResolver,
    composer: Composer,
    packager: Packager,
    registry: Arc<dyn Registry>,
    resources: Arc<dyn ResourceLookup>,
    state: Arc<dyn StateStore>,
    tools: Tools,
    credentials: CredentialSet,
    publish: PublishConfig,
}

impl Pipeline {
    pub fn new(
        registry: Arc<dyn Registry>,
        resources: Arc<dyn ResourceLookup>,
        state: Arc<dyn StateStore>,
        tools: Tools,
        credentials: CredentialSet,
    ) -> Self {
        Pipeline {
            resolver: DependencyResolver::new(
                registry.clone(),
                resources.clone(),
                tools.clone(),
                credentials.clone(),
            ),
            composer: Composer::new(tools.clone()),
            packager: Packager::new(tools.clone(), crate::artifact::DEFAULT_AUTHOR),
            registry,
            resources,
            state,
            tools,
            credentials,
            publish: PublishConfig::default(),
        }
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.packager = self.packager.with_author(author);
        self
    }

    pub fn with_publish(mut self, publish: PublishConfig) -> Self {
        self.publish = publish;
        self
    }

    /// Persisted status of a request, if it has run
    pub async fn status(&self, key: &str) -> Result<Option<ComponentStatus>, PipelineError> {
        Ok(self.load(key).await?.map(|s| s.status))
    }

    /// Phase a request has reached at its current generation
    ///
    /// `None` when it has never run or its stored progress belongs to an
    /// older generation.
    pub async fn phase(
        &self,
        request: &CompositionRequest,
    ) -> Result<Option<Phase>, PipelineError> {
        Ok(self
            .load(&request.key())
            .await?
            .filter(|s| s.generation == request.generation)
            .map(|s| s.phase))
    }

    /// Forget all progress for a request
    pub async fn reset(&self, key: &str) -> Result<(), PipelineError> {
        self.state
            .remove(key)
            .await
            .map_err(|e| PipelineError::State(e.to_string()))
    }

    /// Advance `request` by one step
    pub async fn step(
        &self,
        request: &CompositionRequest,
        cancel: &CancellationToken,
    ) -> Result<Progress, PipelineError> {
        let key = request.key();
        let mut state = match self.load(&key).await? {
            Some(state) if state.generation == request.generation => state,
            Some(state) => {
                tracing::info!(
                    request = %key,
                    from = state.generation,
                    to = request.generation,
                    "Generation changed, restarting pipeline"
                );
                fresh_state(request.generation)
            }
            None => fresh_state(request.generation),
        };

        if let Err(err) = request.spec.validate() {
            let condition = match state.phase {
                Phase::Resolving => DEPENDENCIES_RESOLVED,
                Phase::Composing => COMPOSED,
                Phase::Packaging | Phase::Complete => PACKAGED,
            };
            return Err(self.fail(&key, state, condition, err).await);
        }

        match state.phase {
            Phase::Resolving => self.resolve_next(request, state, cancel).await,
            Phase::Composing => self.compose(request, state, cancel).await,
            Phase::Packaging => self.package(request, state, cancel).await,
            Phase::Complete => match state.published.clone() {
                Some(published) => Ok(Progress::Complete(published)),
                None => {
                    // a complete state without a published reference cannot be resumed
                    state.phase = Phase::Packaging;
                    self.package(request, state, cancel).await
                }
            },
        }
    }

    /// Restart every composition that tracks `changed`
    ///
    /// Each tracker with persisted progress starts over at its next run, so
    /// it re-resolves against the changed resource. Its last published image
    /// stays on status until then. Returns the restarted requests.
    pub async fn invalidate_dependents(
        &self,
        changed: &ResourceRef,
    ) -> Result<Vec<ResourceRef>, PipelineError> {
        let mut restarted = Vec::new();
        for tracker in self.resources.trackers(changed).await {
            if tracker.group != DEFAULT_GROUP || tracker.kind != COMPOSITION_KIND {
                continue;
            }
            let key = format!("{}/{}", tracker.namespace, tracker.name);
            let Some(previous) = self.load(&key).await? else {
                continue;
            };

            let mut state = fresh_state(previous.generation);
            state.status.image = previous.status.image;
            state.status.wit = previous.status.wit;
            state.status.mark_unknown(
                DEPENDENCIES_RESOLVED,
                "DependencyChanged",
                format!("{} changed", changed),
            );
            self.save(&key, &state).await?;
            tracing::info!(
                request = %key,
                dependency = %changed,
                "Dependency changed, restarting pipeline"
            );
            restarted.push(tracker);
        }
        Ok(restarted)
    }

    /// Build, package and push the component serving a config store's values
    ///
    /// Returns the ready status to record on the store.
    pub async fn publish_config_store(
        &self,
        store: &ConfigStore,
        cancel: &CancellationToken,
    ) -> Result<ComponentStatus, PipelineError> {
        let meta = &store.metadata;
        let bytes = self
            .tools
            .synthesize_config(&store.values, cancel)
            .await
            .map_err(|e| PipelineError::tool(format!("failed to build config {}", meta.name), e))?;
        let packed = self
            .packager
            .pack(bytes, cancel)
            .await
            .map_err(|e| PipelineError::artifact("failed to package config", e))?;

        let target = self.target_for(TemplateVars {
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
            generation: meta.generation,
            kind: CONFIG_STORE_KIND.to_string(),
            group: DEFAULT_GROUP.to_string(),
        })?;
        let image = registry_call(
            format!("failed to push {}", target),
            cancel,
            self.registry
                .push(&target, &packed.image, self.credentials.default_provider()),
        )
        .await?;
        tracing::info!(store = %meta.name, image = %image, "Published config store");

        let mut status = ComponentStatus {
            observed_generation: meta.generation,
            image: Some(image),
            wit: Some(packed.config.wit()),
            ..Default::default()
        };
        status.initialize_conditions(&[]);
        status.mark_true(crate::status::READY);
        Ok(status)
    }

    /// Step until complete, retrying transient failures with backoff
    pub async fn run_to_completion(
        &self,
        request: &CompositionRequest,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<Reference, PipelineError> {
        match self.run_until(request, Phase::Complete, retry, cancel).await? {
            Progress::Complete(reference) => Ok(reference),
            Progress::Pending(phase) => Err(PipelineError::State(format!(
                "pipeline stopped in phase {:?}",
                phase
            ))),
        }
    }

    /// Step until the pipeline reaches `until` (or completes)
    ///
    /// A request whose persisted progress already sits at `until` is not
    /// stepped at all.
    ///
    /// Retryable failures are retried up to `retry.max_attempts` times in a
    /// row, waiting `backoff_ms` doubled per attempt. Durable failures and
    /// cancellation return immediately.
    pub async fn run_until(
        &self,
        request: &CompositionRequest,
        until: Phase,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<Progress, PipelineError> {
        let mut attempts = 0u32;
        loop {
            if until != Phase::Complete && self.phase(request).await? == Some(until) {
                return Ok(Progress::Pending(until));
            }
            match self.step(request, cancel).await {
                Ok(Progress::Complete(reference)) => return Ok(Progress::Complete(reference)),
                Ok(Progress::Pending(phase)) if phase == until => {
                    return Ok(Progress::Pending(phase));
                }
                Ok(Progress::Pending(phase)) => {
                    tracing::debug!(request = %request.key(), phase = ?phase, "Step complete");
                    attempts = 0;
                }
                Err(err) if err.is_retryable() && !matches!(err, PipelineError::Cancelled) => {
                    attempts += 1;
                    if attempts >= retry.max_attempts {
                        return Err(err);
                    }
                    let delay = backoff(retry.backoff_ms, attempts);
                    tracing::warn!(
                        request = %request.key(),
                        reason = err.reason(),
                        attempt = attempts,
                        "Retrying in {:?}: {}",
                        delay,
                        err
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Composed bytes of a request, once the compose phase has run
    pub async fn composed(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        Ok(self.load(key).await?.and_then(|s| s.composed))
    }

    async fn resolve_next(
        &self,
        request: &CompositionRequest,
        mut state: PipelineState,
        cancel: &CancellationToken,
    ) -> Result<Progress, PipelineError> {
        let key = request.key();
        let dependencies = &request.spec.dependencies;
        let total = dependencies.len();

        if state.cursor < total {
            let dependency = &dependencies[state.cursor];
            let position = Position::new(state.cursor, total);
            let resolution = match self
                .resolver
                .resolve(dependency, &request.identity(), &state.trace, position, cancel)
                .await
            {
                Ok(resolution) => resolution,
                Err(err) => return Err(self.fail(&key, state, DEPENDENCIES_RESOLVED, err).await),
            };

            tracing::info!(
                request = %key,
                dependency = %dependency.component,
                digest = %resolution.component.digest,
                "Resolved dependency {}",
                position
            );
            state.status.dependencies.push(DependencyStatus {
                component: resolution.component.name.clone(),
                image: resolution.component.image.clone(),
                wit: resolution.component.wit.clone(),
            });
            state.resolved.push(resolution.component);
            state.trace = resolution.trace;
            state.status.trace = state.trace.clone();
            state.cursor += 1;
        }

        if state.cursor < total {
            state.status.mark_unknown(
                DEPENDENCIES_RESOLVED,
                "Resolving",
                format!("resolved {} of {}", state.cursor, total),
            );
        } else {
            state.status.mark_true(DEPENDENCIES_RESOLVED);
            state.phase = Phase::Composing;
        }
        let phase = state.phase;
        self.save(&key, &state).await?;
        Ok(Progress::Pending(phase))
    }

    async fn compose(
        &self,
        request: &CompositionRequest,
        mut state: PipelineState,
        cancel: &CancellationToken,
    ) -> Result<Progress, PipelineError> {
        let key = request.key();
        let composed = match request.spec.mode() {
            Ok(mode) => self.composer.compose(&state.resolved, &mode, cancel).await,
            Err(err) => Err(err),
        };
        let composed = match composed {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.fail(&key, state, COMPOSED, err).await),
        };

        tracing::info!(request = %key, size = composed.len(), "Composed dependencies");
        state.composed = Some(composed);
        state.status.mark_true(COMPOSED);
        state.phase = Phase::Packaging;
        self.save(&key, &state).await?;
        Ok(Progress::Pending(Phase::Packaging))
    }

    async fn package(
        &self,
        request: &CompositionRequest,
        mut state: PipelineState,
        cancel: &CancellationToken,
    ) -> Result<Progress, PipelineError> {
        let key = request.key();
        let published = match self.publish_composed(request, &state, cancel).await {
            Ok(published) => published,
            Err(err) => return Err(self.fail(&key, state, PACKAGED, err).await),
        };
        let (reference, wit) = published;

        tracing::info!(request = %key, image = %reference, "Published composition");
        state.status.image = Some(reference.clone());
        state.status.wit = Some(wit);
        state.status.mark_true(PACKAGED);
        state.published = Some(reference.clone());
        state.phase = Phase::Complete;
        self.save(&key, &state).await?;
        Ok(Progress::Complete(reference))
    }

    async fn publish_composed(
        &self,
        request: &CompositionRequest,
        state: &PipelineState,
        cancel: &CancellationToken,
    ) -> Result<(Reference, crate::types::Wit), PipelineError> {
        let composed = state.composed.clone().ok_or_else(|| {
            PipelineError::State("packaging phase without a composed component".to_string())
        })?;
        let target = self.target(request)?;

        let packed = self
            .packager
            .pack(composed, cancel)
            .await
            .map_err(|e| PipelineError::artifact("failed to package composition", e))?;
        let reference = registry_call(
            format!("failed to push {}", target),
            cancel,
            self.registry
                .push(&target, &packed.image, self.credentials.default_provider()),
        )
        .await?;
        Ok((reference, packed.config.wit()))
    }

    fn target(&self, request: &CompositionRequest) -> Result<Reference, PipelineError> {
        if let Some(target) = &request.target {
            return Ok(target.clone());
        }
        self.target_for(TemplateVars {
            namespace: request.namespace.clone(),
            name: request.name.clone(),
            uid: request.uid.clone(),
            generation: request.generation,
            kind: COMPOSITION_KIND.to_string(),
            group: DEFAULT_GROUP.to_string(),
        })
    }

    fn target_for(&self, vars: TemplateVars) -> Result<Reference, PipelineError> {
        self.publish.target_for(&vars).map_err(PipelineError::Invalid)
    }

    /// Record a failed step on the status and hand the error back
    ///
    /// Only the status is written; the cursor, trace and outputs stay as
    /// they were before the step.
    async fn fail(
        &self,
        key: &str,
        mut state: PipelineState,
        condition: &str,
        err: PipelineError,
    ) -> PipelineError {
        if !err.updates_status() {
            tracing::debug!(request = %key, "{}", err);
            return err;
        }

        let message = err.to_string();
        if err.is_retryable() {
            state.status.mark_unknown(condition, err.reason(), message);
            tracing::warn!(request = %key, reason = err.reason(), "{}", err);
        } else {
            state.status.mark_false(condition, err.reason(), message);
            tracing::error!(request = %key, reason = err.reason(), "{}", err);
        }
        if let PipelineError::CycleDetected { trace, .. } = &err {
            state.status.trace = trace.clone();
        }

        match self.save(key, &state).await {
            Ok(()) => err,
            Err(save_err) => {
                tracing::error!(request = %key, "Failed to record status: {}", save_err);
                err
            }
        }
    }

    async fn load(&self, key: &str) -> Result<Option<PipelineState>, PipelineError> {
        self.state
            .load(key)
            .await
            .map_err(|e| PipelineError::State(e.to_string()))
    }

    async fn save(&self, key: &str, state: &PipelineState) -> Result<(), PipelineError> {
        self.state
            .save(key, state)
            .await
            .map_err(|e| PipelineError::State(e.to_string()))
    }
}

fn fresh_state(generation: i64) -> PipelineState {
    let mut state = PipelineState::new(generation);
    state.status.observed_generation = generation;
    state.status.initialize_conditions(&COMPOSITION_CONDITIONS);
    state
}

fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis(base_ms.saturating_mul(factor))
}
