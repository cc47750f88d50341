// Error Types
//
// One taxonomy shared by the loader, the sandbox and both engines. Load-time
// variants abort the invocation; per-event destination failures never reach
// this type (they are recorded in the destination report instead).

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where inside the artifact an exception was raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(f, "{}:{}:{}", self.file, self.line, column),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

/// An uncaught exception (or rejected promise) from extension code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionRuntimeError {
    pub message: String,
    pub stack: Option<String>,
    pub location: Option<SourceLocation>,
}

impl fmt::Display for ExtensionRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} (at {})", self.message, location),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ExtensionRuntimeError {}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} not found: {}", path.display())]
    NotFound { kind: &'static str, path: PathBuf },

    #[error(
        "unsupported artifact format in {artifact}: first line is `{marker}`, expected one of \
         //format=es, //format=esm, //format=cjs, //format=commonjs"
    )]
    UnsupportedFormat { artifact: String, marker: String },

    #[error("extension {artifact} tried to import `{module}`, which is neither linked into the artifact nor provided by the sandbox")]
    ForbiddenImport { artifact: String, module: String },

    #[error("extension error: {0}")]
    ExtensionRuntime(#[from] ExtensionRuntimeError),

    #[error("invalid extension exports: {reason} (exports: [{}])", exports.join(", "))]
    InvalidExports { reason: String, exports: Vec<String> },

    #[error("invalid source catalog: {0}")]
    InvalidCatalog(String),

    #[error("configuration is invalid{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConfigInvalid { reason: Option<String> },

    #[error("a {what} selector is required, available: [{}]", options.join(", "))]
    SelectorRequired { what: &'static str, options: Vec<String> },

    #[error("unknown {what} `{requested}`, available: [{}]", options.join(", "))]
    SelectorNotFound {
        what: &'static str,
        requested: String,
        options: Vec<String>,
    },

    #[error("conflicting input: {0}")]
    ConflictingInput(String),

    #[error("malformed {what}: {message}")]
    MalformedInput {
        what: &'static str,
        message: String,
        input: String,
    },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Error::ConfigInvalid {
            reason: Some(reason.into()),
        }
    }

    /// Structured detail printed beneath the one-line cause
    pub fn detail(&self) -> Option<String> {
        match self {
            Error::ExtensionRuntime(err) => err.stack.clone(),
            Error::ForbiddenImport { module, .. } => Some(format!("module: {module}")),
            Error::MalformedInput { input, .. } => Some(format!("input: {input}")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display_includes_location() {
        let err = ExtensionRuntimeError {
            message: "boom".to_string(),
            stack: None,
            location: Some(SourceLocation {
                file: "source.js".to_string(),
                line: 12,
                column: Some(4),
            }),
        };
        assert_eq!(err.to_string(), "boom (at source.js:12:4)");
    }

    #[test]
    fn test_config_invalid_message() {
        assert_eq!(
            Error::config_invalid("token missing").to_string(),
            "configuration is invalid: token missing"
        );
        assert_eq!(
            Error::ConfigInvalid { reason: None }.to_string(),
            "configuration is invalid"
        );
    }

    #[test]
    fn test_selector_required_lists_options() {
        let err = Error::SelectorRequired {
            what: "stream",
            options: vec!["users".to_string(), "orders".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "a stream selector is required, available: [users, orders]"
        );
    }
}
