//! WIT extraction tool
//!
//! Accepts a component, a core module carrying `component-type` metadata, or
//! the text format of either, and prints the WIT package for its world.

use super::Tool;
use anyhow::{Context, Result};
use wat::Detect;
use wit_component::{DecodedWasm, WitPrinter};

pub const EXTRACT: &str = "extract";

pub struct WitTool;

impl Tool for WitTool {
    fn call(&mut self, function: &str, input: &[u8]) -> Result<Vec<u8>> {
        match function {
            EXTRACT => Ok(extract(input)?.into_bytes()),
            other => anyhow::bail!("unknown function '{}'", other),
        }
    }
}

/// Decode the WIT world embedded in a binary
pub fn decode(input: &[u8]) -> Result<DecodedWasm> {
    if let Detect::Unknown = Detect::from_bytes(input) {
        anyhow::bail!("unknown blob format: expected WebAssembly binary or text");
    }
    let wasm = wat::parse_bytes(input).context("Failed to parse WebAssembly text")?;

    if wasmparser::Parser::is_component(&wasm) {
        return wit_component::decode(&wasm).context("Failed to decode component");
    }

    let (module, bindgen) =
        wit_component::metadata::decode(&wasm).context("Failed to decode module metadata")?;
    if module.is_none() {
        anyhow::bail!(
            "core module has no `component-type` custom sections, so it carries no WIT; \
             was it meant to be a component?"
        );
    }
    Ok(DecodedWasm::Component(bindgen.resolve, bindgen.world))
}

/// Print the WIT package describing `input`
pub fn extract(input: &[u8]) -> Result<String> {
    let decoded = decode(input)?;
    let mut printer = WitPrinter::default();
    printer
        .print(decoded.resolve(), decoded.package(), &[])
        .context("Failed to print WIT")?;
    Ok(printer.output.to_string())
}

/// Whether the binary is a component rather than a core module
pub fn is_component(input: &[u8]) -> bool {
    wasmparser::Parser::is_component(input)
}
