// Runner Commands - CLI interface
//
// Each subcommand loads exactly one artifact, runs one operation against it
// and prints the result as JSON on stdout. Extension console output and logs
// go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::config::{self, EventInput, RunnerConfig};
use crate::destination::{DestinationEngine, DestinationRun};
use crate::extensions::{self, ExtensionKind, ExtensionRuntime};
use crate::sync::{JsonFileStateStore, SyncEngine, SyncRequest};
use crate::validation::{self, ValidationOutcome, ValidatorExport};

#[derive(Debug, Parser)]
#[command(name = "extension-runner")]
#[command(about = "Run source and destination extensions inside a sandbox")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub runner: RunnerConfig,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the extension descriptor and kind
    Describe {
        /// Built extension artifact
        artifact: PathBuf,
    },
    /// Run the extension's configuration validator
    ValidateConfig {
        /// Built extension artifact
        artifact: PathBuf,

        /// Configuration as inline JSON or a path to a JSON file
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Print the source catalog
    Catalog {
        /// Built extension artifact
        artifact: PathBuf,

        /// Configuration as inline JSON or a path to a JSON file
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Read one stream and commit its checkpoint
    Read {
        /// Built extension artifact
        artifact: PathBuf,

        /// Configuration as inline JSON or a path to a JSON file
        #[arg(short, long)]
        config: Option<String>,

        /// Stream name, or `{"name": ..., "mode": ..., ...params}`
        #[arg(short, long)]
        stream: Option<String>,

        /// Checkpoint file (default: <state-dir>/<extension id>.json)
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Print every stream message as a JSON line before the report
        #[arg(long)]
        messages: bool,

        /// Do not run the configuration validator first
        #[arg(long)]
        skip_validation: bool,
    },
    /// Run a destination over a batch of events
    Exec {
        /// Built extension artifact
        artifact: PathBuf,

        /// Configuration as inline JSON or a path to a JSON file
        #[arg(short, long)]
        config: Option<String>,

        /// Events as inline JSON (an object or an array of objects)
        #[arg(short, long)]
        events: Option<String>,

        /// Events as a JSON file
        #[arg(long)]
        events_file: Option<PathBuf>,

        /// Destination id passed to the transform context
        #[arg(long, default_value = "destination")]
        destination_id: String,

        /// Destination type passed to the transform context (default: descriptor id)
        #[arg(long)]
        destination_type: Option<String>,

        /// Do not run the configuration validator first
        #[arg(long)]
        skip_validation: bool,
    },
}

/// Dispatch a parsed command line
pub fn execute(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Describe { artifact } => describe(&cli.runner, artifact),
        Command::ValidateConfig { artifact, config } => validate_config(&cli.runner, artifact, config.as_deref()),
        Command::Catalog { artifact, config } => catalog(&cli.runner, artifact, config.as_deref()),
        Command::Read {
            artifact,
            config,
            stream,
            state_file,
            messages,
            skip_validation,
        } => read(
            &cli.runner,
            artifact,
            ReadOptions {
                config: config.as_deref(),
                stream: stream.as_deref(),
                state_file: state_file.as_deref(),
                print_messages: *messages,
                skip_validation: *skip_validation,
            },
        ),
        Command::Exec {
            artifact,
            config,
            events,
            events_file,
            destination_id,
            destination_type,
            skip_validation,
        } => exec(
            &cli.runner,
            artifact,
            ExecOptions {
                config: config.as_deref(),
                events: events.as_deref(),
                events_file: events_file.as_deref(),
                destination_id,
                destination_type: destination_type.as_deref(),
                skip_validation: *skip_validation,
            },
        ),
    }
}

fn load(runner: &RunnerConfig, artifact: &Path) -> Result<ExtensionRuntime> {
    extensions::load(artifact, &runner.sandbox_policy())
        .with_context(|| format!("Failed to load extension {}", artifact.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe(runner: &RunnerConfig, artifact: &Path) -> Result<()> {
    let extension = load(runner, artifact)?;
    let descriptor = extension.descriptor().context("Failed to read descriptor")?;

    print_json(&serde_json::json!({
        "kind": extension.kind(),
        "format": format!("{:?}", extension.extension().format),
        "exports": extension.exports(),
        "descriptor": descriptor,
    }))
}

fn validate_config(runner: &RunnerConfig, artifact: &Path, config: Option<&str>) -> Result<()> {
    let extension = load(runner, artifact)?;
    let config = config::parse_config(config)?;
    let outcome = run_validation(&extension, &config)?;

    print_json(&outcome)?;
    outcome.into_result().context("Configuration rejected")?;
    Ok(())
}

/// Declared parameters first, then the extension's own validator
fn run_validation(extension: &ExtensionRuntime, config: &serde_json::Value) -> Result<ValidationOutcome> {
    let descriptor = extension.descriptor().context("Failed to read descriptor")?;
    let config = match validation::check_declared_parameters(&descriptor, config) {
        Ok(config) => config,
        Err(crate::Error::ConfigInvalid { reason }) => return Ok(ValidationOutcome::Invalid(reason)),
        Err(err) => return Err(err.into()),
    };

    if !extension.has_validator() {
        log::info!("{} exports no validator", descriptor.id);
        return Ok(ValidationOutcome::Ok);
    }

    validation::validate(&config, |config| extension.run_validator(config)).context("Validator failed")
}

fn require_kind(extension: &ExtensionRuntime, kind: ExtensionKind) -> Result<()> {
    if extension.kind() != kind {
        anyhow::bail!(
            "{} is a {:?} extension, this command needs a {:?} extension",
            extension.extension().name,
            extension.kind(),
            kind
        );
    }
    Ok(())
}

fn catalog(runner: &RunnerConfig, artifact: &Path, config: Option<&str>) -> Result<()> {
    let extension = load(runner, artifact)?;
    require_kind(&extension, ExtensionKind::Source)?;
    let config = config::parse_config(config)?;

    let raw = crate::sync::SourceExtension::source_catalog(&extension, &config).context("sourceCatalog failed")?;
    let catalog = crate::sync::engine::parse_catalog(raw)?;
    print_json(&catalog)
}

struct ReadOptions<'a> {
    config: Option<&'a str>,
    stream: Option<&'a str>,
    state_file: Option<&'a Path>,
    print_messages: bool,
    skip_validation: bool,
}

fn read(runner: &RunnerConfig, artifact: &Path, options: ReadOptions<'_>) -> Result<()> {
    let extension = load(runner, artifact)?;
    require_kind(&extension, ExtensionKind::Source)?;
    let descriptor = extension.descriptor().context("Failed to read descriptor")?;

    let mut config = config::parse_config(options.config)?;
    if !options.skip_validation {
        config = validation::check_declared_parameters(&descriptor, &config)?;
        run_validation(&extension, &config)?
            .into_result()
            .context("Configuration rejected")?;
    }

    let selector = options.stream.map(config::parse_selector).transpose()?;
    let store = match options.state_file {
        Some(path) => JsonFileStateStore::new(path),
        None => JsonFileStateStore::for_extension(&runner.state_dir(), &descriptor.id),
    };
    log::info!("Checkpoint file: {}", store.path().display());

    let report = SyncEngine::new(&extension, &store)
        .run(&SyncRequest { config, selector })
        .with_context(|| format!("Sync of {} failed", descriptor.id))?;

    if options.print_messages {
        for message in &report.messages {
            println!("{}", serde_json::to_string(message)?);
        }
    }
    print_json(&report)
}

struct ExecOptions<'a> {
    config: Option<&'a str>,
    events: Option<&'a str>,
    events_file: Option<&'a Path>,
    destination_id: &'a str,
    destination_type: Option<&'a str>,
    skip_validation: bool,
}

fn exec(runner: &RunnerConfig, artifact: &Path, options: ExecOptions<'_>) -> Result<()> {
    let extension = load(runner, artifact)?;
    require_kind(&extension, ExtensionKind::Destination)?;
    let descriptor = extension.descriptor().context("Failed to read descriptor")?;

    let events = EventInput::resolve(options.events, options.events_file)?.load()?;
    let mut config = config::parse_config(options.config)?;
    if !options.skip_validation {
        config = validation::check_declared_parameters(&descriptor, &config)?;
    }

    let run = DestinationRun {
        destination_id: options.destination_id.to_string(),
        destination_type: options
            .destination_type
            .map(str::to_string)
            .unwrap_or_else(|| descriptor.id.clone()),
        config,
        skip_validation: options.skip_validation,
    };

    let report = DestinationEngine::new(&extension)
        .execute(&events, &run)
        .context("Destination run aborted")?;
    print_json(&report)?;

    if report.failed() > 0 {
        anyhow::bail!("{} of {} event(s) failed", report.failed(), events.len());
    }
    Ok(())
}
