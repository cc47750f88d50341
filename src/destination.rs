// Destination Execution Engine
//
// Runs a destination's transform over a batch of events, strictly in input
// order. The configuration is validated once up front; after that a failing
// event is recorded and the batch moves on. Outbound requests are only
// collected and checked, never sent.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::extensions::{DestinationContext, DestinationMessage};
use crate::validation::{self, ValidatorExport};

/// What a destination extension must offer the engine
pub trait DestinationExtension: ValidatorExport {
    /// Raw `destination(event, context)` result; `Null` for undefined
    fn transform(&self, event: &Value, context: &DestinationContext) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct DestinationRun {
    pub destination_id: String,
    pub destination_type: String,
    pub config: Value,
    pub skip_validation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EventOutcome {
    /// Transform returned nothing on purpose
    Skipped,
    Emitted { messages: Vec<DestinationMessage> },
    Failed { error: String, event: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventResult {
    pub index: usize,
    #[serde(flatten)]
    pub outcome: EventOutcome,
}

impl EventResult {
    pub fn message_count(&self) -> usize {
        match &self.outcome {
            EventOutcome::Emitted { messages } => messages.len(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DestinationReport {
    pub results: Vec<EventResult>,
}

impl DestinationReport {
    pub fn emitted(&self) -> usize {
        self.results.iter().map(EventResult::message_count).sum()
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, EventOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, EventOutcome::Failed { .. }))
    }

    pub fn succeeded(&self) -> usize {
        self.results.len() - self.failed()
    }

    fn count(&self, pred: impl Fn(&EventOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

pub struct DestinationEngine<'a, D: ?Sized> {
    extension: &'a D,
}

impl<'a, D> DestinationEngine<'a, D>
where
    D: DestinationExtension + ?Sized,
{
    pub fn new(extension: &'a D) -> Self {
        Self { extension }
    }

    pub fn execute(&self, events: &[Value], run: &DestinationRun) -> Result<DestinationReport> {
        if run.skip_validation {
            log::info!("Configuration validation skipped");
        } else if self.extension.has_validator() {
            validation::validate(&run.config, |config| self.extension.run_validator(config))?
                .into_result()?;
            log::info!("Configuration is valid");
        }

        let context = DestinationContext {
            destination_id: run.destination_id.clone(),
            destination_type: run.destination_type.clone(),
            config: run.config.clone(),
        };

        let mut report = DestinationReport::default();
        for (index, event) in events.iter().enumerate() {
            let outcome = match self.run_event(event, &context) {
                Ok(outcome) => outcome,
                // Load-class failures are fatal even mid-batch
                Err(err @ Error::ForbiddenImport { .. }) => return Err(err),
                Err(err) => {
                    log::error!("Event #{} failed: {}\nEvent: {}", index, err, event);
                    EventOutcome::Failed {
                        error: err.to_string(),
                        event: event.clone(),
                    }
                }
            };
            report.results.push(EventResult { index, outcome });
        }

        log::info!(
            "Processed {} event(s): {} message(s), {} skipped, {} failed",
            events.len(),
            report.emitted(),
            report.skipped(),
            report.failed()
        );

        Ok(report)
    }

    fn run_event(&self, event: &Value, context: &DestinationContext) -> Result<EventOutcome> {
        let raw = self.extension.transform(event, context)?;
        Ok(match parse_transform_result(raw)? {
            None => EventOutcome::Skipped,
            Some(messages) => EventOutcome::Emitted { messages },
        })
    }
}

/// Interpret a transform result: nothing, one message, or an array of them
pub fn parse_transform_result(raw: Value) -> Result<Option<Vec<DestinationMessage>>> {
    match raw {
        Value::Null => Ok(None),
        Value::Array(items) => items.into_iter().map(parse_message).collect::<Result<_>>().map(Some),
        single @ Value::Object(_) => Ok(Some(vec![parse_message(single)?])),
        other => Err(invalid_message(format!(
            "transform must return nothing, a message or an array of messages, got {}",
            other
        ))),
    }
}

fn parse_message(raw: Value) -> Result<DestinationMessage> {
    let message: DestinationMessage =
        serde_json::from_value(raw).map_err(|e| invalid_message(e.to_string()))?;

    if message.method.trim().is_empty() {
        return Err(invalid_message("message `method` is empty".to_string()));
    }
    url::Url::parse(&message.url)
        .map_err(|e| invalid_message(format!("message url `{}` is invalid: {}", message.url, e)))?;

    Ok(message)
}

fn invalid_message(message: String) -> Error {
    Error::MalformedInput {
        what: "destination message",
        message,
        input: String::new(),
    }
}
