//! Embedded tool bridge
//!
//! WIT extraction, config synthesis and composition all run as named tools
//! behind a single byte-oriented call contract:
//! `call(tool, function, input) -> output`. Structured payloads are JSON in
//! both directions. [`EmbeddedTools`] runs the tools in-process from a pool
//! per tool; [`Tools`] is the async, cancellable client the pipeline uses.

pub mod pool;
pub mod static_config;
pub mod wac;
pub mod wit_tools;

use crate::types::ResolvedComponent;
use pool::Pool;
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const WIT_TOOL: &str = "wit-tools";
pub const CONFIG_TOOL: &str = "static-config";
pub const WAC_TOOL: &str = "wac";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("{tool}.{function} failed: {message}")]
    Failed {
        tool: String,
        function: String,
        message: String,
    },

    #[error("{tool}.{function} panicked: {message}")]
    Panicked {
        tool: String,
        function: String,
        message: String,
    },

    #[error("invalid tool payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("tool output is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("tool task aborted: {0}")]
    Join(String),

    #[error("tool invocation cancelled")]
    Cancelled,
}

/// A single, non-reentrant tool instance
pub trait Tool: Send {
    fn call(&mut self, function: &str, input: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Host-function style call contract shared by all tools
pub trait ToolBridge: Send + Sync {
    fn call(&self, tool: &str, function: &str, input: &[u8]) -> Result<Vec<u8>, ToolError>;
}

/// In-process tools, each drawn from its own pool
pub struct EmbeddedTools {
    pools: HashMap<&'static str, Pool<Box<dyn Tool>>>,
}

impl EmbeddedTools {
    /// Register the built-in tools, keeping up to `max_idle` instances of each
    pub fn new(max_idle: usize) -> Self {
        let mut tools = EmbeddedTools {
            pools: HashMap::new(),
        };
        tools.register(WIT_TOOL, max_idle, || Box::new(wit_tools::WitTool));
        tools.register(CONFIG_TOOL, max_idle, || {
            Box::new(static_config::StaticConfigTool::default())
        });
        tools.register(WAC_TOOL, max_idle, || Box::new(wac::WacTool));
        tools
    }

    pub fn register(
        &mut self,
        name: &'static str,
        max_idle: usize,
        factory: impl Fn() -> Box<dyn Tool> + Send + Sync + 'static,
    ) {
        self.pools.insert(name, Pool::new(max_idle, factory));
    }

    pub fn idle(&self, tool: &str) -> Option<usize> {
        self.pools.get(tool).map(Pool::idle)
    }
}

impl ToolBridge for EmbeddedTools {
    fn call(&self, tool: &str, function: &str, input: &[u8]) -> Result<Vec<u8>, ToolError> {
        let pool = self
            .pools
            .get(tool)
            .ok_or_else(|| ToolError::UnknownTool(tool.to_string()))?;

        let mut instance = pool.acquire();
        let outcome = catch_unwind(AssertUnwindSafe(|| instance.call(function, input)));
        drop(instance);

        match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(ToolError::Failed {
                tool: tool.to_string(),
                function: function.to_string(),
                message: format!("{:#}", err),
            }),
            Err(panic) => Err(ToolError::Panicked {
                tool: tool.to_string(),
                function: function.to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Async client over a [`ToolBridge`]
///
/// Calls run on the blocking thread pool and race the cancellation token;
/// a cancelled call returns [`ToolError::Cancelled`] and its output, if any,
/// is discarded.
#[derive(Clone)]
pub struct Tools {
    bridge: Arc<dyn ToolBridge>,
}

impl Tools {
    pub fn new(bridge: Arc<dyn ToolBridge>) -> Self {
        Tools { bridge }
    }

    pub fn embedded(max_idle: usize) -> Self {
        Tools::new(Arc::new(EmbeddedTools::new(max_idle)))
    }

    pub async fn invoke(
        &self,
        tool: &'static str,
        function: &'static str,
        input: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        let bridge = self.bridge.clone();
        let task = tokio::task::spawn_blocking(move || bridge.call(tool, function, &input));

        tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            joined = task => joined.map_err(|e| ToolError::Join(e.to_string()))?,
        }
    }

    /// Render the WIT package describing `binary`
    pub async fn extract_wit(
        &self,
        binary: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let output = self
            .invoke(WIT_TOOL, wit_tools::EXTRACT, binary.to_vec(), cancel)
            .await?;
        Ok(String::from_utf8(output)?)
    }

    /// Build a config component serving `values`
    ///
    /// Pairs are passed in key order so equal maps produce equal bytes.
    pub async fn synthesize_config(
        &self,
        values: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ToolError> {
        let pairs: Vec<(&String, &String)> = values.iter().collect();
        let input = serde_json::to_vec(&pairs)?;
        self.invoke(CONFIG_TOOL, static_config::BUILD_COMPONENT, input, cancel)
            .await
    }

    /// Compose `dependencies` by interpreting a WAC script
    pub async fn wac_compose(
        &self,
        script: &str,
        dependencies: &[ResolvedComponent],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ToolError> {
        let input = wac::WacInput::new(script, dependencies);
        self.invoke(WAC_TOOL, wac::COMPOSE, serde_json::to_vec(&input)?, cancel)
            .await
    }

    /// Plug every dependency after the first into the first
    pub async fn wac_plug(
        &self,
        dependencies: &[ResolvedComponent],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ToolError> {
        let input = wac::WacInput::new("", dependencies);
        self.invoke(WAC_TOOL, wac::PLUG, serde_json::to_vec(&input)?, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky;

    impl Tool for Flaky {
        fn call(&mut self, function: &str, input: &[u8]) -> anyhow::Result<Vec<u8>> {
            match function {
                "echo" => Ok(input.to_vec()),
                "fail" => anyhow::bail!("nope"),
                _ => panic!("exploded on {}", function),
            }
        }
    }

    fn flaky_tools() -> EmbeddedTools {
        let mut tools = EmbeddedTools::new(2);
        tools.register("flaky", 2, || Box::new(Flaky));
        tools
    }

    #[test]
    fn test_unknown_tool() {
        let tools = flaky_tools();
        let err = tools.call("missing", "x", b"").unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "missing"));
    }

    #[test]
    fn test_failure_is_structured_and_instance_released() {
        let tools = flaky_tools();
        let err = tools.call("flaky", "fail", b"").unwrap_err();
        assert!(matches!(err, ToolError::Failed { ref message, .. } if message == "nope"));
        assert_eq!(tools.idle("flaky"), Some(1));
    }

    #[test]
    fn test_panic_is_converted_and_instance_released() {
        let tools = flaky_tools();
        let err = tools.call("flaky", "kaboom", b"").unwrap_err();
        match err {
            ToolError::Panicked { message, .. } => assert!(message.contains("kaboom")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tools.idle("flaky"), Some(1));
        assert_eq!(tools.call("flaky", "echo", b"hi").unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_cancelled_before_invoke() {
        let tools = Tools::new(Arc::new(flaky_tools()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = tools.invoke("flaky", "echo", vec![1], &cancel).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn test_invoke_round_trips() {
        let tools = Tools::new(Arc::new(flaky_tools()));
        let out = tools
            .invoke("flaky", "echo", vec![1, 2, 3], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }
}
