// Extension artifact and loader
//
// Defines the Extension type that holds a built artifact's code and module
// format, and checks the exported-symbols contract once the artifact has been
// evaluated.

use std::fs;
use std::path::{Path, PathBuf};

use super::types::ExtensionKind;
use crate::error::{Error, Result};

/// Module format declared on the artifact's first line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    /// `//format=es` or `//format=esm`
    EsModule,
    /// `//format=cjs` or `//format=commonjs`
    CommonJs,
}

/// How strongly an artifact is isolated from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// First-party builds, evaluated as a native ES module
    Native,
    /// Untrusted builds, evaluated behind the capability table
    Sandboxed,
}

impl ModuleFormat {
    pub fn from_marker(line: &str) -> Option<Self> {
        match line.trim_end_matches('\r') {
            "//format=es" | "//format=esm" => Some(ModuleFormat::EsModule),
            "//format=cjs" | "//format=commonjs" => Some(ModuleFormat::CommonJs),
            _ => None,
        }
    }

    pub fn isolation(&self) -> Isolation {
        match self {
            ModuleFormat::EsModule => Isolation::Native,
            ModuleFormat::CommonJs => Isolation::Sandboxed,
        }
    }
}

/// Represents a built extension artifact
#[derive(Debug, Clone)]
pub struct Extension {
    pub name: String,
    pub path: Option<PathBuf>,
    pub code: String,
    pub format: ModuleFormat,
}

impl Extension {
    /// Read an artifact from disk
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound {
                kind: "artifact",
                path: path.to_path_buf(),
            });
        }

        let code = fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut extension = Self::from_code(&name, &code)?;
        extension.path = Some(path.to_path_buf());
        Ok(extension)
    }

    /// Wrap in-memory artifact code
    pub fn from_code(name: &str, code: &str) -> Result<Self> {
        let marker = code.lines().next().unwrap_or_default();
        let format = ModuleFormat::from_marker(marker).ok_or_else(|| Error::UnsupportedFormat {
            artifact: name.to_string(),
            marker: marker.chars().take(80).collect(),
        })?;

        log::debug!("Artifact {} declares {:?} format", name, format);

        Ok(Self {
            name: name.to_string(),
            path: None,
            code: code.to_string(),
            format,
        })
    }

    pub fn isolation(&self) -> Isolation {
        self.format.isolation()
    }
}

/// Check the exported symbol set and derive the extension kind
///
/// `descriptor` is required, and exactly one of `destination` or the
/// `streamReader` + `sourceCatalog` pair must be present.
pub fn check_exports(exports: &[String]) -> Result<ExtensionKind> {
    let has = |name: &str| exports.iter().any(|e| e == name);
    let invalid = |reason: &str| Error::InvalidExports {
        reason: reason.to_string(),
        exports: exports.to_vec(),
    };

    if !has("descriptor") {
        return Err(invalid("`descriptor` is required"));
    }

    let destination = has("destination");
    let reader = has("streamReader");
    let catalog = has("sourceCatalog");

    match (destination, reader || catalog) {
        (true, true) => Err(invalid(
            "an extension must export either `destination` or `streamReader` + `sourceCatalog`, not both",
        )),
        (true, false) => Ok(ExtensionKind::Destination),
        (false, true) if reader && catalog => Ok(ExtensionKind::Source),
        (false, true) => Err(invalid(
            "`streamReader` and `sourceCatalog` must be exported together",
        )),
        (false, false) => Err(invalid(
            "an extension must export either `destination` or `streamReader` + `sourceCatalog`",
        )),
    }
}
