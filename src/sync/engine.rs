// Streaming Sync Engine
//
// Drives one source stream per invocation:
// Init (pick stream + mode) -> LoadCheckpoint -> Run -> Commit.
// The checkpoint is only written after the reader finished cleanly, so a
// failed run always resumes from the previous checkpoint.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::protocol::Message;
use super::sink::{MessageSink, StreamSink};
use super::state::{CheckpointState, StateStore};
use super::transaction::{self, MaterializedTable};
use crate::error::{Error, Result};
use crate::extensions::{StreamInstance, StreamOptions, SyncMode};

/// What a source extension must offer the engine
pub trait SourceExtension {
    /// Raw `sourceCatalog(config)` result
    fn source_catalog(&self, config: &Value) -> Result<Value>;

    /// Run `streamReader`, emitting into `sink` until it resolves
    fn read_stream(
        &self,
        config: &Value,
        stream_type: &str,
        options: &StreamOptions,
        state: &CheckpointState,
        sink: &mut dyn MessageSink,
    ) -> Result<()>;
}

/// `{ name, mode?, ...parameters }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSelector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SyncMode>,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub config: Value,
    pub selector: Option<StreamSelector>,
}

/// The stream instance and options chosen during Init
#[derive(Debug, Clone, Serialize)]
pub struct StreamSelection {
    pub stream_type: String,
    pub options: StreamOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Init,
    LoadCheckpoint,
    Run,
    Commit,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Init => "init",
            SyncPhase::LoadCheckpoint => "load-checkpoint",
            SyncPhase::Run => "run",
            SyncPhase::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub selection: StreamSelection,
    pub message_counts: BTreeMap<&'static str, usize>,
    pub transactions: usize,
    pub table: MaterializedTable,
    /// Checkpoint written by this run, `None` when the source sent no state
    pub committed_state: Option<CheckpointState>,
    #[serde(skip)]
    pub messages: Vec<Message>,
}

pub struct SyncEngine<'a, E: ?Sized, S: ?Sized> {
    extension: &'a E,
    store: &'a S,
}

impl<'a, E, S> SyncEngine<'a, E, S>
where
    E: SourceExtension + ?Sized,
    S: StateStore + ?Sized,
{
    pub fn new(extension: &'a E, store: &'a S) -> Self {
        Self { extension, store }
    }

    /// Resolve the catalog and the stream selection without reading
    pub fn plan(&self, request: &SyncRequest) -> Result<StreamSelection> {
        let catalog = parse_catalog(self.extension.source_catalog(&request.config)?)?;
        select_stream(&catalog, request.selector.as_ref())
    }

    pub fn run(&self, request: &SyncRequest) -> Result<SyncReport> {
        enter(SyncPhase::Init);
        let selection = self.plan(request)?;
        log::info!(
            "Selected stream `{}` in {} mode",
            selection.stream_type,
            selection.options.mode
        );

        enter(SyncPhase::LoadCheckpoint);
        let initial_state = self.store.load()?;

        enter(SyncPhase::Run);
        let mut sink = StreamSink::new();
        let outcome = self.extension.read_stream(
            &request.config,
            &selection.stream_type,
            &selection.options,
            &initial_state,
            &mut sink,
        );

        if let Err(err) = outcome {
            log::error!(
                "Stream `{}` failed after {} message(s); checkpoint left untouched: {}",
                selection.stream_type,
                sink.len(),
                err
            );
            return Err(err);
        }

        enter(SyncPhase::Commit);
        let committed_state = sink.latest_state().cloned();
        match &committed_state {
            Some(state) => self.store.save(state)?,
            None => log::debug!("Source sent no state message, keeping previous checkpoint"),
        }

        let messages = sink.into_messages();
        let mut message_counts = BTreeMap::new();
        for message in &messages {
            *message_counts.entry(message.kind()).or_insert(0) += 1;
        }
        let transactions = transaction::group(&messages);
        let mut table = MaterializedTable::new();
        for tx in &transactions {
            table.apply(tx);
        }

        Ok(SyncReport {
            selection,
            message_counts,
            transactions: transactions.len(),
            table,
            committed_state,
            messages,
        })
    }
}

fn enter(phase: SyncPhase) {
    log::debug!("Sync phase: {}", phase);
}

/// Parse and check a raw `sourceCatalog` result
pub fn parse_catalog(raw: Value) -> Result<Vec<StreamInstance>> {
    let catalog: Vec<StreamInstance> = serde_json::from_value(raw)
        .map_err(|e| Error::InvalidCatalog(format!("catalog must be an array of stream instances: {}", e)))?;

    if catalog.is_empty() {
        return Err(Error::InvalidCatalog("catalog has no stream instances".to_string()));
    }

    if let Some(instance) = catalog.iter().find(|i| i.supported_modes.is_empty()) {
        return Err(Error::InvalidCatalog(format!(
            "stream `{}` declares no supported sync modes",
            instance.stream_type
        )));
    }

    Ok(catalog)
}

/// Pick the stream instance, sync mode and parameters for this run
pub fn select_stream(catalog: &[StreamInstance], selector: Option<&StreamSelector>) -> Result<StreamSelection> {
    let names = || catalog.iter().map(|i| i.stream_type.clone()).collect::<Vec<_>>();

    let instance = match selector {
        Some(selector) => catalog
            .iter()
            .find(|i| i.stream_type == selector.name)
            .ok_or_else(|| Error::SelectorNotFound {
                what: "stream",
                requested: selector.name.clone(),
                options: names(),
            })?,
        None if catalog.len() == 1 => &catalog[0],
        None => {
            return Err(Error::SelectorRequired {
                what: "stream",
                options: names(),
            })
        }
    };

    let modes = || instance.supported_modes.iter().map(|m| m.to_string()).collect::<Vec<_>>();
    let mode = match selector.and_then(|s| s.mode) {
        Some(mode) if instance.supported_modes.contains(&mode) => mode,
        Some(mode) => {
            return Err(Error::SelectorNotFound {
                what: "sync mode",
                requested: mode.to_string(),
                options: modes(),
            })
        }
        None if instance.supported_modes.len() == 1 => instance.supported_modes[0],
        None => {
            return Err(Error::SelectorRequired {
                what: "sync mode",
                options: modes(),
            })
        }
    };

    let mut parameters = selector.map(|s| s.parameters.clone()).unwrap_or_default();
    for param in &instance.params {
        param.apply_default(&mut parameters);
        if param.is_missing(&parameters) {
            return Err(Error::config_invalid(format!(
                "stream `{}` requires parameter `{}`",
                instance.stream_type, param.id
            )));
        }
    }

    Ok(StreamSelection {
        stream_type: instance.stream_type.clone(),
        options: StreamOptions { mode, parameters },
    })
}
