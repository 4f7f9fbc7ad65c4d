pub mod artifact;
pub mod commands;
pub mod compose;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod resources;
pub mod state;
pub mod status;
pub mod tools;
pub mod trace;
pub mod types;
pub mod wit;

pub use error::PipelineError;
pub use pipeline::{Pipeline, Progress};
pub use request::CompositionRequest;

/// Version recorded by the CLI
pub const DEFAULT_VERSION: &str = env!("CARGO_PKG_VERSION");
