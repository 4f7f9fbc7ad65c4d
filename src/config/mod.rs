//! Configuration management for wacpack
//!
//! ## Architecture
//!
//! - `schema` - Configuration data structures and validation
//! - `io` - Reading and writing config files
//! - `paths` - Directory path management
//! - `template` - Repository template expansion
//!
//! ## Usage
//!
//! ```rust
//! use wacpack::config;
//!
//! # fn example() -> anyhow::Result<()> {
//! // Load config (returns default if file doesn't exist)
//! let config = config::load_config()?;
//! let layout = config::get_layout_dir()?;
//! # Ok(())
//! # }
//! ```

pub mod io;
pub mod paths;
pub mod schema;
pub mod template;

pub use io::{load_config, load_config_from, save_config_to};
pub use paths::{
    ensure_dirs, get_config_path, get_layout_dir, get_resources_path,
    get_wacpack_dir,
};
pub use schema::{RegistryKind, WacpackConfig};
pub use template::TemplateVars;
