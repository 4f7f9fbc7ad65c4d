//! Directory path management for wacpack
//!
//! All paths used by wacpack are centralized here.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Get the base wacpack directory (~/.config/wacpack/)
pub fn get_wacpack_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .context("Failed to get config directory")?
        .join("wacpack")
        .pipe(Ok)
}

/// Get the config file path (~/.config/wacpack/config.toml)
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_wacpack_dir()?.join("config.toml"))
}

/// Get the default OCI layout directory (~/.config/wacpack/layout/)
pub fn get_layout_dir() -> Result<PathBuf> {
    Ok(get_wacpack_dir()?.join("layout"))
}

/// Get the resource store file (~/.config/wacpack/resources.json)
pub fn get_resources_path() -> Result<PathBuf> {
    Ok(get_wacpack_dir()?.join("resources.json"))
}

/// Ensure the wacpack directories exist
///
/// Safe to call multiple times.
pub fn ensure_dirs() -> Result<()> {
    let dir = get_layout_dir()?;
    std::fs::create_dir_all(&dir)
        .context(format!("Failed to create directory: {}", dir.display()))
}

// Utility trait for Result<PathBuf> → Ok(PathBuf)
trait Pipe: Sized {
    fn pipe<F, R>(self, f: F) -> R
    where
        F: FnOnce(Self) -> R,
    {
        f(self)
    }
}

impl Pipe for PathBuf {}
