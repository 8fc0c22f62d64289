use super::directive::{RemoteStateDirective, StateError, SyncStrategy};
use crate::fs_tree::hash;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// What one poll should do for a directive, decided from the remote's
/// top-level hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAssessment {
    /// Hashes match; nothing to do.
    InSync,
    /// Remote object does not exist yet.
    RemoteMissing,
    /// Remote differs but the strategy validated it on an earlier poll.
    ValidatedByStrategy,
    /// ENSURE_CREATED object already exists; never touched again.
    NoTouch,
    /// Remote differs and needs analyzing.
    Diverged,
}

/// Live reconciliation state for one directive against one agent. Only
/// the task currently running for that agent mutates it.
#[derive(Debug)]
pub struct FsEntryStateManager {
    remit: RemoteStateDirective,
    local_workdir: PathBuf,
    common_dir: Option<PathBuf>,
    remote_workdir: PathBuf,
    resolved_local: Option<PathBuf>,

    pub local_crc: u32,
    pub remote_crc: u32,
    pub validated_remote_crc: u32,
    pub in_sync: bool,
    pub local_exists: bool,
    pub remote_exists: bool,
    pub is_dir: bool,
}

impl FsEntryStateManager {
    pub fn new(
        remit: RemoteStateDirective,
        local_workdir: &Path,
        common_dir: Option<&Path>,
        remote_workdir: &Path,
    ) -> Self {
        FsEntryStateManager {
            remit,
            local_workdir: local_workdir.to_path_buf(),
            common_dir: common_dir.map(Path::to_path_buf),
            remote_workdir: remote_workdir.to_path_buf(),
            resolved_local: None,
            local_crc: 0,
            remote_crc: 0,
            validated_remote_crc: 0,
            in_sync: false,
            local_exists: false,
            remote_exists: false,
            is_dir: false,
        }
    }

    pub fn remit(&self) -> &RemoteStateDirective {
        &self.remit
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.remit.strategy
    }

    /// Where the object must exist on the agent.
    pub fn absolute_remote_path(&self) -> PathBuf {
        self.remit
            .remote_directory(&self.remote_workdir)
            .join(&self.remit.name)
    }

    /// Local source after validation, which may have fallen back to the
    /// application's common files.
    pub fn absolute_local_path(&self) -> PathBuf {
        self.resolved_local
            .clone()
            .unwrap_or_else(|| self.local_workdir.join(self.remit.local_relative()))
    }

    /// Find the local object and compute its hash. A directive whose
    /// source is missing from the component staging falls back to the
    /// application common files before being skipped.
    pub fn validate_local_object(&mut self) -> Result<(), StateError> {
        self.remit.validate()?;

        let mut path = self.local_workdir.join(self.remit.local_relative());

        if !path.exists() {
            let fallback = self
                .common_dir
                .as_ref()
                .map(|common| common.join(&self.remit.name))
                .filter(|p| p.exists());

            match fallback {
                Some(common_path) => {
                    info!(
                        object = %path.display(),
                        "managed object not found locally, using file from common directory"
                    );
                    path = common_path;
                }
                None => {
                    self.local_exists = false;
                    return Err(StateError::LocalObjectMissing(path));
                }
            }
        }

        self.local_exists = true;
        self.is_dir = path.is_dir();
        self.local_crc =
            hash::object_crc(&path).map_err(|source| StateError::LocalObjectUnreadable {
                path: path.clone(),
                source,
            })?;
        self.resolved_local = Some(path);
        Ok(())
    }

    /// Fold in the remote's top-level hash for this poll and decide what
    /// to do. A remote hash of 0 means the object is missing; an empty
    /// local file also hashes to 0, which is why `local_exists` is
    /// tracked separately.
    pub fn observe_remote(&mut self, remote_crc: u32) -> SyncAssessment {
        self.remote_crc = remote_crc;
        self.remote_exists = remote_crc != 0;

        if self.local_crc == remote_crc {
            self.in_sync = true;
            return SyncAssessment::InSync;
        }
        self.in_sync = false;

        if self.strategy() == SyncStrategy::EnsureCreated && self.remote_exists {
            return SyncAssessment::NoTouch;
        }

        if self.remote_exists && self.validated_remote_crc == remote_crc {
            return SyncAssessment::ValidatedByStrategy;
        }

        if !self.remote_exists {
            return SyncAssessment::RemoteMissing;
        }

        SyncAssessment::Diverged
    }

    /// ALLOW_ADDS memo: accept the observed remote so unchanged superset
    /// trees cost nothing on the next poll.
    pub fn memoize_validated_remote(&mut self) {
        self.validated_remote_crc = self.remote_crc;
    }

    /// Record a completed transfer; the remote now mirrors local.
    pub fn mark_synced(&mut self) {
        self.remote_crc = self.local_crc;
        self.remote_exists = true;
        self.in_sync = true;
    }
}

/// Split of a diverged directory: local descendants that need transfer,
/// and remote extras (roots only) that STRICT removes.
#[derive(Debug, Default, PartialEq)]
pub struct DirectoryPlan {
    pub candidates: Vec<String>,
    pub extras: Vec<PathBuf>,
}

/// Diff per-descendant hash maps. Keys are the relative form both sides
/// produce; `remote_parent` re-roots extra keys into absolute remote
/// paths.
pub fn plan_directory(
    local: &BTreeMap<String, u32>,
    remote: &BTreeMap<String, u32>,
    remote_parent: &Path,
) -> DirectoryPlan {
    let mut candidates: Vec<String> = local
        .iter()
        .filter(|(key, crc)| remote.get(*key) != Some(crc))
        .map(|(key, _)| key.clone())
        .collect();
    candidates.sort_by(|a, b| {
        a.to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b))
    });

    let mut extras: Vec<PathBuf> = Vec::new();
    for key in remote.keys() {
        if !local.contains_key(key) {
            extras = filter_hierarchy(remote_parent.join(key), extras);
        }
    }

    DirectoryPlan { candidates, extras }
}

/// Keep only tree roots: an ancestor in the list suppresses all of its
/// descendants.
pub fn filter_hierarchy(current: PathBuf, existing: Vec<PathBuf>) -> Vec<PathBuf> {
    if existing.iter().any(|e| current.starts_with(e)) {
        return existing;
    }
    let mut kept: Vec<PathBuf> = existing
        .into_iter()
        .filter(|e| !e.starts_with(&current))
        .collect();
    kept.push(current);
    kept
}
