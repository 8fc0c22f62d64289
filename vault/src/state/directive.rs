use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How strictly a remote object is held to its local source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStrategy {
    /// Remote must match byte-for-byte; extra remote entries are removed.
    #[default]
    Strict,
    /// Remote must be a superset of local; extras are tolerated and their
    /// combined hash memoized so unchanged trees cost nothing to re-poll.
    AllowAdds,
    /// Created once, then never touched again.
    EnsureCreated,
}

/// Declarative statement: object `name`, sourced from `local_path` in the
/// component staging directory, should exist in remote directory
/// `remote_dir` under `strategy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStateDirective {
    pub name: String,
    /// Staging-relative source; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Absolute remote directory; defaults to the component's remote
    /// working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_dir: Option<PathBuf>,
    #[serde(default)]
    pub strategy: SyncStrategy,
}

impl RemoteStateDirective {
    pub fn new(name: &str, strategy: SyncStrategy) -> Self {
        RemoteStateDirective {
            name: name.to_string(),
            local_path: None,
            remote_dir: None,
            strategy,
        }
    }

    pub fn local_relative(&self) -> PathBuf {
        self.local_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.name))
    }

    pub fn remote_directory(&self, default_workdir: &Path) -> PathBuf {
        self.remote_dir
            .clone()
            .unwrap_or_else(|| default_workdir.to_path_buf())
    }

    /// A directive may not name an absolute local source.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.local_relative().is_absolute() {
            return Err(StateError::InvalidDirective(format!(
                "local path must be relative in directive `{}`",
                self.name
            )));
        }
        Ok(())
    }
}

/// Reconciliation errors, recovered per directive: logged and skipped,
/// never fatal to the poll.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("managed object not found locally: `{0}`")]
    LocalObjectMissing(PathBuf),

    #[error("managed object unreadable: `{path}`: {source}")]
    LocalObjectUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid directive: {0}")]
    InvalidDirective(String),

    #[error("file exceeds the in-band ceiling: `{0}`")]
    FileTooLarge(PathBuf),
}
