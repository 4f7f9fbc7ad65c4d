//! Artifact commands: pack, pull, wit and config

use super::{Environment, interrupt_token};
use crate::artifact::Packager;
use crate::types::Reference;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Pack a local wasm file and push it to `tag`
pub async fn pack(env: &Environment, input: &Path, tag: &str) -> Result<Reference> {
    let target: Reference = tag
        .parse()
        .with_context(|| format!("Invalid image reference '{}'", tag))?;
    let binary = read_input(input).await?;
    let cancel = interrupt_token();

    let packed = Packager::new(env.tools.clone(), &env.config.artifact.author)
        .pack(binary, &cancel)
        .await
        .with_context(|| format!("Failed to package {}", input.display()))?;
    let pinned = env
        .registry
        .push(&target, &packed.image, env.credentials.default_provider())
        .await
        .with_context(|| format!("Failed to push {}", target))?;

    println!("✅ Pushed {}", pinned);
    Ok(pinned)
}

/// Pull `reference` and write its wasm layer to `output`
pub async fn pull(env: &Environment, reference: &str, output: &Path) -> Result<()> {
    let reference: Reference = reference
        .parse()
        .with_context(|| format!("Invalid image reference '{}'", reference))?;
    let pulled = env
        .registry
        .pull(&reference, env.credentials.default_provider())
        .await
        .with_context(|| format!("Failed to pull {}", reference))?;

    tokio::fs::write(output, &pulled.bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Pulled {} to {}", pulled.reference, output.display());
    let wit = pulled.config.wit();
    for import in &wit.imports {
        println!("  import {}", import);
    }
    for export in &wit.exports {
        println!("  export {}", export);
    }
    Ok(())
}

/// Print the WIT of a local wasm file
pub async fn wit(env: &Environment, input: &Path, json: bool) -> Result<()> {
    let binary = read_input(input).await?;
    let cancel = interrupt_token();

    if json {
        let wit = crate::wit::extract_imports_exports(&env.tools, &binary, &cancel)
            .await
            .with_context(|| format!("Failed to extract WIT from {}", input.display()))?;
        println!("{}", serde_json::to_string_pretty(&wit)?);
    } else {
        let text = crate::wit::extract(&env.tools, &binary, &cancel)
            .await
            .with_context(|| format!("Failed to extract WIT from {}", input.display()))?;
        print!("{}", text);
    }
    Ok(())
}

/// Build a config component from `key=value` pairs
pub async fn config(env: &Environment, pairs: &[String], output: &Path) -> Result<()> {
    let values = parse_values(pairs)?;
    let cancel = interrupt_token();
    let bytes = env
        .tools
        .synthesize_config(&values, &cancel)
        .await
        .context("Failed to build config component")?;

    tokio::fs::write(output, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {} ({} values, {} bytes)",
        output.display(),
        values.len(),
        bytes.len()
    );
    Ok(())
}

/// Parse `key=value` arguments; later keys win
pub fn parse_values(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("Invalid value '{}'. Expected: key=value", pair);
        };
        if key.is_empty() {
            anyhow::bail!("Key cannot be empty in '{}'", pair);
        }
        values.insert(key.to_string(), value.to_string());
    }
    Ok(values)
}

async fn read_input(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        let values = parse_values(&[
            "b=2".to_string(),
            "a=x=y".to_string(),
            "empty=".to_string(),
        ])
        .unwrap();
        assert_eq!(values["a"], "x=y");
        assert_eq!(values["b"], "2");
        assert_eq!(values["empty"], "");
        assert_eq!(values.keys().collect::<Vec<_>>(), vec!["a", "b", "empty"]);
    }

    #[test]
    fn test_parse_values_rejects_malformed() {
        assert!(parse_values(&["novalue".to_string()]).is_err());
        assert!(parse_values(&["=v".to_string()]).is_err());
    }
}
