//! Manifest files and arbiter settings.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{ConfigError, Directive, PathCase, PathScopeTree, build_manifest};

/// What happens to accesses no rule covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Block and report.
    #[default]
    Strict,
    /// Allow and report.
    Permissive,
}

/// Per-job arbiter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Pip the job runs, stamped on every report.
    pub pip_id: u64,
    /// Handling of unexpected accesses.
    pub mode: EnforcementMode,
    /// Report every arbitrated access, not only flagged ones.
    pub report_all_accesses: bool,
}

/// Errors loading a manifest file.
#[derive(Debug, Error)]
pub enum ManifestLoadError {
    /// The file could not be read.
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not a valid manifest document.
    #[error("invalid manifest document: {0}")]
    Json(#[from] serde_json::Error),
    /// The directives do not form a usable manifest.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Serialized form of a job manifest.
///
/// ```json
/// {
///   "pip_id": 42,
///   "mode": "strict",
///   "directives": [
///     { "path": "/", "policy": "" },
///     { "path": "/src", "policy": "ALLOW_READ | ALLOW_ENUMERATE" },
///     { "path": "/src/gen.rs", "policy": "ALLOW_WRITE", "kind": "exact" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Pip the job runs.
    pub pip_id: u64,
    /// Handling of unexpected accesses.
    pub mode: EnforcementMode,
    /// Path comparison convention.
    pub case: PathCase,
    /// Report every arbitrated access.
    pub report_all_accesses: bool,
    /// Ordered rules.
    pub directives: Vec<Directive>,
}

impl ManifestConfig {
    /// Parse a manifest document.
    pub fn from_json(json: &str) -> Result<Self, ManifestLoadError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a manifest file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestLoadError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Arbiter settings carried by this manifest.
    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig {
            pip_id: self.pip_id,
            mode: self.mode,
            report_all_accesses: self.report_all_accesses,
        }
    }

    /// Build the scope tree and split off the arbiter settings.
    pub fn into_parts(self) -> Result<(PathScopeTree, ArbiterConfig), ConfigError> {
        let config = self.arbiter_config();
        let tree = build_manifest(&self.directives, self.case)?;
        Ok((tree, config))
    }
}
