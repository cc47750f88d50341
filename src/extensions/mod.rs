// Extension System Module
//
// Handles:
// - Artifact loading and module format detection
// - JavaScript sandboxing with QuickJS
// - Capability table and outbound URL policy
// - Calls into the exported extension functions

// Submodules
pub mod extension;
pub mod runtime;
pub mod sandbox;
pub mod types;

use std::path::Path;

use crate::error::Result;

// Re-exports
pub use extension::{check_exports, Extension, Isolation, ModuleFormat};
pub use runtime::ExtensionRuntime;
pub use sandbox::{CapabilityTable, NetworkPolicy, SandboxPolicy};
pub use types::{
    ConfigParam, DestinationContext, DestinationMessage, ExtensionDescriptor, ExtensionKind, StreamInstance,
    StreamOptions, SyncMode,
};

/// Read an artifact from disk and evaluate it under `policy`
pub fn load(path: &Path, policy: &SandboxPolicy) -> Result<ExtensionRuntime> {
    let extension = Extension::from_path(path)?;
    ExtensionRuntime::new(extension, policy)
}
