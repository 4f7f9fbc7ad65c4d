//! Composition tool built on wac
//!
//! `compose` interprets a WAC script against the supplied packages; `plug`
//! treats the first dependency as the socket and auto-wires the remaining
//! dependencies into its imports.

use super::Tool;
use crate::types::{ResolvedComponent, base64_bytes};
use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use wac_graph::types::{BorrowedPackageKey, Package};
use wac_graph::{CompositionGraph, EncodeOptions, PackageId};
use wac_parser::Document;

pub const COMPOSE: &str = "compose";
pub const PLUG: &str = "plug";

/// Namespace applied to dependency names that are not already `ns:name`
pub const DEFAULT_PACKAGE_NAMESPACE: &str = "wacpack";

#[derive(Debug, Serialize, Deserialize)]
pub struct WacInput {
    pub script: String,
    pub dependencies: Vec<WacDependency>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WacDependency {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub component: Vec<u8>,
}

impl WacInput {
    pub fn new(script: &str, dependencies: &[ResolvedComponent]) -> Self {
        WacInput {
            script: script.to_string(),
            dependencies: dependencies
                .iter()
                .map(|d| WacDependency {
                    name: d.name.clone(),
                    component: d.bytes.clone(),
                })
                .collect(),
        }
    }
}

pub struct WacTool;

impl Tool for WacTool {
    fn call(&mut self, function: &str, input: &[u8]) -> Result<Vec<u8>> {
        let input: WacInput = serde_json::from_slice(input).context("Invalid wac payload")?;
        match function {
            COMPOSE => compose(&input),
            PLUG => plug(&input),
            other => anyhow::bail!("unknown function '{}'", other),
        }
    }
}

/// Resolve a WAC document against the dependency packages and encode it
///
/// Dependencies are visible to the script under their package names, e.g.
/// `wacpack:handler` for a dependency named `handler`.
pub fn compose(input: &WacInput) -> Result<Vec<u8>> {
    let document = Document::parse(&input.script)
        .map_err(|e| anyhow!("Failed to parse composition script: {}", e))?;

    let names: Vec<String> = input
        .dependencies
        .iter()
        .map(|d| package_name(&d.name))
        .collect();
    let mut packages = IndexMap::new();
    for (name, dependency) in names.iter().zip(&input.dependencies) {
        packages.insert(
            BorrowedPackageKey::from_name_and_version(name, None),
            dependency.component.clone(),
        );
    }

    let resolution = document
        .resolve(packages)
        .map_err(|e| anyhow!("Failed to resolve composition script: {}", e))?;
    resolution
        .encode(EncodeOptions::default())
        .map_err(|e| anyhow!("Failed to encode composition: {}", e))
}

/// Plug every dependency after the first into the first
pub fn plug(input: &WacInput) -> Result<Vec<u8>> {
    let (socket, plugs) = input
        .dependencies
        .split_first()
        .context("plug requires at least one dependency to act as the socket")?;

    let mut graph = CompositionGraph::new();
    let socket = register(&mut graph, socket)?;
    let plugs = plugs
        .iter()
        .map(|plug| register(&mut graph, plug))
        .collect::<Result<Vec<_>>>()?;

    wac_graph::plug(&mut graph, plugs, socket)
        .map_err(|e| anyhow!("Failed to plug dependencies: {}", e))?;

    graph
        .encode(EncodeOptions::default())
        .context("Failed to encode composition")
}

fn register(graph: &mut CompositionGraph, dependency: &WacDependency) -> Result<PackageId> {
    let name = package_name(&dependency.name);
    let package = Package::from_bytes(&name, None, dependency.component.clone(), graph.types_mut())
        .with_context(|| format!("Failed to load package: {}", dependency.name))?;
    graph
        .register_package(package)
        .with_context(|| format!("Failed to register package: {}", dependency.name))
}

/// Graph package names must be namespaced
fn package_name(name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{}:{}", DEFAULT_PACKAGE_NAMESPACE, name)
    }
}
