// Config Validator
//
// Extension validators may answer with `true`, `false`, a reason string or
// `{ ok, message }`. The shape is converted into ValidatorResult right at the
// boundary and normalized to a ValidationOutcome; nothing past this module
// sees the raw union.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::extensions::ExtensionDescriptor;

/// An extension that may export a `validator` function
pub trait ValidatorExport {
    fn has_validator(&self) -> bool;

    /// Raw answer of `validator(config)`
    fn run_validator(&self, config: &Value) -> Result<Value>;
}

/// Raw validator answer, tagged by shape
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatorResult {
    Valid,
    Rejected,
    Reason(String),
    Report { ok: bool, message: Option<String> },
    Unrecognized(String),
}

impl From<Value> for ValidatorResult {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(true) => ValidatorResult::Valid,
            Value::Bool(false) => ValidatorResult::Rejected,
            Value::String(reason) => ValidatorResult::Reason(reason),
            Value::Object(obj) => match obj.get("ok").and_then(Value::as_bool) {
                Some(ok) => ValidatorResult::Report {
                    ok,
                    message: obj.get("message").and_then(Value::as_str).map(str::to_string),
                },
                None => ValidatorResult::Unrecognized(format!(
                    "validator returned an object without a boolean `ok`: {}",
                    Value::Object(obj)
                )),
            },
            Value::Null => ValidatorResult::Unrecognized("validator returned no result".to_string()),
            other => ValidatorResult::Unrecognized(format!("validator returned an unexpected value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ValidationOutcome {
    Ok,
    Invalid(Option<String>),
}

impl From<ValidatorResult> for ValidationOutcome {
    fn from(result: ValidatorResult) -> Self {
        match result {
            ValidatorResult::Valid => ValidationOutcome::Ok,
            ValidatorResult::Rejected => ValidationOutcome::Invalid(None),
            ValidatorResult::Reason(reason) => ValidationOutcome::Invalid(Some(reason)),
            ValidatorResult::Report { ok: true, .. } => ValidationOutcome::Ok,
            ValidatorResult::Report { ok: false, message } => ValidationOutcome::Invalid(message),
            ValidatorResult::Unrecognized(reason) => ValidationOutcome::Invalid(Some(reason)),
        }
    }
}

impl ValidationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ValidationOutcome::Ok)
    }

    /// `Invalid` becomes `ConfigInvalid` carrying the exact reason
    pub fn into_result(self) -> Result<()> {
        match self {
            ValidationOutcome::Ok => Ok(()),
            ValidationOutcome::Invalid(reason) => Err(Error::ConfigInvalid { reason }),
        }
    }
}

/// Run an extension validator and normalize its answer
///
/// An exception thrown by the validator is an `Invalid` outcome with the
/// exception message; sandbox and load errors still propagate.
pub fn validate<F>(config: &Value, validator: F) -> Result<ValidationOutcome>
where
    F: FnOnce(&Value) -> Result<Value>,
{
    match validator(config) {
        Ok(value) => Ok(ValidatorResult::from(value).into()),
        Err(Error::ExtensionRuntime(err)) => {
            log::warn!("Validator threw: {}", err);
            Ok(ValidationOutcome::Invalid(Some(err.message)))
        }
        Err(err) => Err(err),
    }
}

/// Fill declared defaults and check required descriptor parameters
pub fn check_declared_parameters(descriptor: &ExtensionDescriptor, config: &Value) -> Result<Value> {
    let mut values: Map<String, Value> = match config {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(Error::config_invalid(format!(
                "configuration must be an object, got {}",
                other
            )))
        }
    };

    let missing: Vec<&str> = descriptor
        .configuration_parameters
        .iter()
        .filter_map(|param| {
            param.apply_default(&mut values);
            param.is_missing(&values).then_some(param.id.as_str())
        })
        .collect();

    if !missing.is_empty() {
        return Err(Error::config_invalid(format!(
            "missing required parameter(s): {}",
            missing.join(", ")
        )));
    }

    Ok(Value::Object(values))
}
