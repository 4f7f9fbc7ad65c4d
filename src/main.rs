use wacpack::commands::{self, Environment, compose::ComposeOptions};
use wacpack::{config, logging, request, resources, types};

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "wacpack",
    about = "Resolve, compose and package WebAssembly components as OCI artifacts",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Run a composition request through the pipeline
    ///
    /// Dependencies are resolved one at a time, composed, packaged as an
    /// OCI artifact and pushed. Progress is persisted, so an interrupted
    /// run resumes where it stopped.
    ///
    /// Examples:
    ///   wacpack compose app.toml
    ///   wacpack compose app.toml --no-push -o app.wasm
    ///   wacpack compose app.toml --reset
    Compose {
        /// Composition request file (TOML)
        request: PathBuf,

        /// Also write the composed component here
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Stop after composing; requires --output
        #[arg(long, requires = "output")]
        no_push: bool,

        /// Discard persisted progress before running
        #[arg(long)]
        reset: bool,
    },

    /// Package a wasm file and push it to a tag
    ///
    /// Example:
    ///   wacpack pack greeter.wasm localhost:5000/components/greeter:v1
    Pack {
        /// Wasm module or component
        file: PathBuf,

        /// Image reference to push to
        tag: String,
    },

    /// Pull an artifact and write its wasm layer
    Pull {
        /// Image reference (tag or digest)
        reference: String,

        /// Output file
        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// Print the WIT of a wasm file
    Wit {
        /// Wasm module or component
        file: PathBuf,

        /// Print import and export lists as JSON instead
        #[arg(long)]
        json: bool,
    },

    /// Build a config component exporting the given values
    ///
    /// Example:
    ///   wacpack config greeting=hello target=world -o config.wasm
    Config {
        /// Values as key=value
        #[arg(required = true, value_name = "KEY=VALUE")]
        values: Vec<String>,

        /// Output file
        #[arg(long, short = 'o')]
        output: PathBuf,
    },

    /// Manage resources that requests can reference
    Resource {
        #[command(subcommand)]
        command: ResourceCommand,
    },

    /// Show the persisted status of a request
    Status {
        /// Request key: namespace/name, or a name in the default namespace
        key: String,

        /// Print the full status as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Parser)]
enum ResourceCommand {
    /// Register a component backed by a registry image
    ///
    /// Example:
    ///   wacpack resource add greeter localhost:5000/components/greeter:v1
    Add {
        /// Resource name
        name: String,

        /// Image reference
        image: String,

        #[arg(long, short = 'n', default_value = types::DEFAULT_NAMESPACE)]
        namespace: String,
    },

    /// Register a config store and publish its config component
    ///
    /// Example:
    ///   wacpack resource add-config settings greeting=hello target=world
    AddConfig {
        /// Resource name
        name: String,

        /// Values as key=value
        #[arg(required = true, value_name = "KEY=VALUE")]
        values: Vec<String>,

        #[arg(long, short = 'n', default_value = types::DEFAULT_NAMESPACE)]
        namespace: String,
    },

    /// List registered resources
    List,

    /// Remove a resource
    Remove {
        /// Resource name
        name: String,

        #[arg(long, short = 'n', default_value = types::DEFAULT_NAMESPACE)]
        namespace: String,

        /// Resource kind
        #[arg(long, short = 'k', default_value = resources::COMPONENT_KIND)]
        kind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose).context("Failed to initialize logging")?;
    config::ensure_dirs()?;

    let cfg = config::load_config().context("Failed to load config")?;
    if let Err(errors) = cfg.validate() {
        anyhow::bail!("Invalid configuration:\n  {}", errors.join("\n  "));
    }

    let state = wacpack::state::FileStateStore::default_location()?;
    let env = Environment::from_config(cfg, config::get_resources_path()?, state).await?;

    match cli.command {
        Command::Compose {
            request,
            output,
            no_push,
            reset,
        } => {
            commands::compose::run(
                &env,
                ComposeOptions {
                    request,
                    output,
                    no_push,
                    reset,
                },
            )
            .await
        }

        Command::Pack { file, tag } => commands::artifact::pack(&env, &file, &tag)
            .await
            .map(|_| ()),

        Command::Pull { reference, output } => {
            commands::artifact::pull(&env, &reference, &output).await
        }

        Command::Wit { file, json } => commands::artifact::wit(&env, &file, json).await,

        Command::Config { values, output } => {
            commands::artifact::config(&env, &values, &output).await
        }

        Command::Resource { command } => match command {
            ResourceCommand::Add {
                name,
                image,
                namespace,
            } => {
                request::validate_name(&name)?;
                commands::resource::add(&env, &namespace, &name, &image).await
            }
            ResourceCommand::AddConfig {
                name,
                values,
                namespace,
            } => {
                request::validate_name(&name)?;
                commands::resource::add_config(&env, &namespace, &name, &values).await
            }
            ResourceCommand::List => commands::resource::list(&env).await,
            ResourceCommand::Remove {
                name,
                namespace,
                kind,
            } => commands::resource::remove(&env, &kind, &namespace, &name).await,
        },

        Command::Status { key, json } => commands::resource::status(&env, &key, json).await,
    }
}
