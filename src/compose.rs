//! Composition engine

use crate::error::PipelineError;
use crate::request::Mode;
use crate::tools::Tools;
use crate::types::ResolvedComponent;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Composer {
    tools: Tools,
}

impl Composer {
    pub fn new(tools: Tools) -> Self {
        Composer { tools }
    }

    /// Wire resolved dependencies into a single component
    ///
    /// Equal inputs always produce byte-identical output.
    pub async fn compose(
        &self,
        dependencies: &[ResolvedComponent],
        mode: &Mode,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, PipelineError> {
        let output = match mode {
            Mode::Plug => {
                if dependencies.is_empty() {
                    return Err(PipelineError::Invalid(
                        "plug requires at least one dependency".to_string(),
                    ));
                }
                tracing::debug!(
                    socket = %dependencies[0].name,
                    plugs = dependencies.len() - 1,
                    "Plugging dependencies"
                );
                self.tools.wac_plug(dependencies, cancel).await
            }
            Mode::Script(script) => {
                tracing::debug!(dependencies = dependencies.len(), "Composing with WAC script");
                self.tools.wac_compose(script, dependencies, cancel).await
            }
        };
        output.map_err(|e| PipelineError::tool("composition failed", e))
    }
}
