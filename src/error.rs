//! Pipeline errors
//!
//! Every failure the pipeline reports is classified two ways: whether the
//! caller should retry the step, and which reason the status condition shows.

use crate::artifact::ArtifactError;
use crate::registry::RegistryError;
use crate::tools::ToolError;
use crate::trace::ComponentSpan;
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How a caller should treat a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient; run the step again later
    Retry,
    /// Will not change without a change to the request or its dependencies
    Durable,
}

/// Position of a dependency within its list, shown as `(i of n)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub index: usize,
    pub total: usize,
}

impl Position {
    /// `index` is zero based
    pub fn new(index: usize, total: usize) -> Self {
        Position { index, total }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} of {})", self.index + 1, self.total)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    NotComponent(String),

    #[error("{0}")]
    Blocked(String),

    #[error("{message}")]
    NotReady { message: String, durable: bool },

    #[error("{0}")]
    ImageMissing(String),

    #[error("{message}")]
    CycleDetected {
        message: String,
        trace: Vec<ComponentSpan>,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("{context}: {source}")]
    Tool {
        context: String,
        #[source]
        source: ToolError,
    },

    #[error("{context}: {source}")]
    Registry {
        context: String,
        #[source]
        source: RegistryError,
    },

    #[error("{context}: {source}")]
    Artifact {
        context: String,
        #[source]
        source: ArtifactError,
    },

    #[error("state store: {0}")]
    State(String),

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::Blocked(_)
            | PipelineError::Registry { .. }
            | PipelineError::State(_)
            | PipelineError::Cancelled => Disposition::Retry,
            PipelineError::NotReady { durable: false, .. } => Disposition::Retry,
            _ => Disposition::Durable,
        }
    }

    /// Reason recorded on the failing status condition
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::NotFound(_) => "ComponentNotFound",
            PipelineError::NotComponent(_) => "NotComponent",
            PipelineError::Blocked(_) => "Blocked",
            PipelineError::NotReady { .. } => "NotReady",
            PipelineError::ImageMissing(_) => "ImageMissing",
            PipelineError::CycleDetected { .. } => "CycleDetected",
            PipelineError::Invalid(_) => "Invalid",
            PipelineError::Tool { .. } => "ToolFailed",
            PipelineError::Registry { .. } => "RegistryError",
            PipelineError::Artifact { .. } => "InvalidArtifact",
            PipelineError::State(_) => "StateError",
            PipelineError::Cancelled => "Cancelled",
        }
    }

    /// Blocked steps wait silently for the referenced resource to catch up
    pub fn updates_status(&self) -> bool {
        !matches!(self, PipelineError::Blocked(_))
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    pub fn tool(context: impl Into<String>, source: ToolError) -> Self {
        match source {
            ToolError::Cancelled => PipelineError::Cancelled,
            source => PipelineError::Tool {
                context: context.into(),
                source,
            },
        }
    }

    pub fn registry(context: impl Into<String>, source: RegistryError) -> Self {
        match source {
            RegistryError::Artifact(source) => PipelineError::artifact(context, source),
            source => PipelineError::Registry {
                context: context.into(),
                source,
            },
        }
    }

    pub fn artifact(context: impl Into<String>, source: ArtifactError) -> Self {
        match source {
            ArtifactError::Tool(source) => PipelineError::tool(context, source),
            source => PipelineError::Artifact {
                context: context.into(),
                source,
            },
        }
    }
}

/// Run a registry call unless `cancel` fires first
pub(crate) async fn registry_call<T>(
    context: impl Into<String>,
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, RegistryError>>,
) -> Result<T, PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = call => result.map_err(|e| PipelineError::registry(context, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_is_one_based() {
        assert_eq!(Position::new(0, 3).to_string(), "(1 of 3)");
        assert_eq!(Position::new(2, 3).to_string(), "(3 of 3)");
    }

    #[test]
    fn test_dispositions() {
        assert_eq!(
            PipelineError::NotFound("x".into()).disposition(),
            Disposition::Durable
        );
        assert_eq!(
            PipelineError::Blocked("x".into()).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            PipelineError::NotReady {
                message: "x".into(),
                durable: true
            }
            .disposition(),
            Disposition::Durable
        );
        assert_eq!(
            PipelineError::NotReady {
                message: "x".into(),
                durable: false
            }
            .disposition(),
            Disposition::Retry
        );
        assert!(PipelineError::Cancelled.is_retryable());
        assert!(!PipelineError::Invalid("x".into()).is_retryable());
    }

    #[test]
    fn test_only_blocked_suppresses_status() {
        assert!(!PipelineError::Blocked("x".into()).updates_status());
        assert!(PipelineError::NotComponent("x".into()).updates_status());
        assert!(PipelineError::Cancelled.updates_status());
    }

    #[test]
    fn test_cancelled_tool_call_maps_to_cancelled() {
        let err = PipelineError::tool("compose", ToolError::Cancelled);
        assert!(matches!(err, PipelineError::Cancelled));

        let err = PipelineError::artifact("pack", ArtifactError::Tool(ToolError::Cancelled));
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn test_registry_not_found_is_retried() {
        let err = PipelineError::registry("pull", RegistryError::NotFound("image a".into()));
        assert_eq!(err.reason(), "RegistryError");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "pull: image a not found");
    }

    #[tokio::test]
    async fn test_registry_call_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = registry_call("push", &cancel, async { Ok(()) }).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
