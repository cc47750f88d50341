// Runner Inputs and Configuration
//
// Turns command line input into typed values: configuration objects and event
// batches given inline or as JSON files, stream selectors, and the runner
// options shared by every subcommand.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::extensions::{CapabilityTable, NetworkPolicy, SandboxPolicy};
use crate::sync::StreamSelector;

/// Longest slice of the offending input echoed back in errors
const MAX_ECHO_CHARS: usize = 200;

/// Options shared by all subcommands
#[derive(Debug, Clone, Args)]
pub struct RunnerConfig {
    /// Directory holding per-extension checkpoint files
    #[arg(long, env = "EXTENSION_RUNNER_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Host extension code may fetch from, subdomains included (repeatable, none allows any host)
    #[arg(long = "allow-host", value_name = "HOST", global = true)]
    pub allow_hosts: Vec<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

impl RunnerConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    pub fn sandbox_policy(&self) -> SandboxPolicy {
        SandboxPolicy {
            capabilities: CapabilityTable::standard(),
            network: NetworkPolicy::allow_hosts(self.allow_hosts.iter().cloned()),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            allow_hosts: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

/// `<data-local-dir>/extension-runner/state`
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("extension-runner")
        .join("state")
}

/// Parse JSON given inline (`{...}` or `[...]`) or as a path to a JSON file
pub fn parse_json_input(what: &'static str, input: &str) -> Result<Value> {
    let trimmed = input.trim();
    let inline = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));

    if inline {
        return serde_json::from_str(trimmed).map_err(|e| malformed(what, e, trimmed));
    }

    let path = Path::new(trimmed);
    if !path.exists() {
        return Err(Error::NotFound {
            kind: what,
            path: path.to_path_buf(),
        });
    }

    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| malformed(what, e, &content))
}

/// Extension configuration; absent input is an empty object
pub fn parse_config(input: Option<&str>) -> Result<Value> {
    let Some(input) = input else {
        return Ok(Value::Object(Map::new()));
    };

    match parse_json_input("configuration", input)? {
        config @ Value::Object(_) => Ok(config),
        other => Err(Error::MalformedInput {
            what: "configuration",
            message: "configuration must be a JSON object".to_string(),
            input: echo(&other.to_string()),
        }),
    }
}

/// `{ "name": ..., "mode"?: ..., ...parameters }` or a bare stream name
pub fn parse_selector(input: &str) -> Result<StreamSelector> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::MalformedInput {
            what: "stream selector",
            message: "stream selector is empty".to_string(),
            input: String::new(),
        });
    }

    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed).map_err(|e| malformed("stream selector", e, trimmed));
    }

    Ok(StreamSelector {
        name: trimmed.to_string(),
        ..Default::default()
    })
}

/// Where a destination batch comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventInput {
    Inline(String),
    File(PathBuf),
}

impl EventInput {
    /// Exactly one of inline JSON or a file must be given
    pub fn resolve(inline: Option<&str>, file: Option<&Path>) -> Result<Self> {
        match (inline, file) {
            (Some(inline), None) => Ok(EventInput::Inline(inline.to_string())),
            (None, Some(file)) => Ok(EventInput::File(file.to_path_buf())),
            (Some(_), Some(_)) => Err(Error::ConflictingInput(
                "events were given both inline and as a file; pass only one".to_string(),
            )),
            (None, None) => Err(Error::ConflictingInput(
                "no events given; pass them inline or as a file".to_string(),
            )),
        }
    }

    /// A single event object or an array of event objects
    pub fn load(&self) -> Result<Vec<Value>> {
        let raw = match self {
            EventInput::Inline(json) => serde_json::from_str(json.trim()).map_err(|e| malformed("events", e, json))?,
            EventInput::File(path) => parse_json_input("events file", &path.to_string_lossy())?,
        };

        let events = match raw {
            event @ Value::Object(_) => vec![event],
            Value::Array(events) => events,
            other => {
                return Err(Error::MalformedInput {
                    what: "events",
                    message: "expected an event object or an array of event objects".to_string(),
                    input: echo(&other.to_string()),
                })
            }
        };

        if let Some((index, event)) = events.iter().enumerate().find(|(_, e)| !e.is_object()) {
            return Err(Error::MalformedInput {
                what: "events",
                message: format!("event #{} is not an object", index),
                input: echo(&event.to_string()),
            });
        }

        Ok(events)
    }
}

fn malformed(what: &'static str, err: serde_json::Error, input: &str) -> Error {
    Error::MalformedInput {
        what,
        message: err.to_string(),
        input: echo(input),
    }
}

fn echo(input: &str) -> String {
    if input.chars().count() <= MAX_ECHO_CHARS {
        return input.to_string();
    }
    let mut truncated: String = input.chars().take(MAX_ECHO_CHARS).collect();
    truncated.push_str("...");
    truncated
}
