use std::path::{Component, Path};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum FsError {
    #[error("invalid path: `{0}`")]
    InvalidPath(String),

    #[error("dots disallowed in path `{0}`")]
    DotsDisallowed(String),
}

/// Rejects paths that could escape their base directory through `..`
/// components. Written content always lands below the configured working
/// directory, so parent traversal is never legitimate.
pub fn validate_path(path: &Path) -> Result<(), FsError> {
    if path.to_str().is_none() {
        return Err(FsError::InvalidPath(path.to_string_lossy().into_owned()));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(FsError::DotsDisallowed(path.display().to_string()));
    }
    Ok(())
}

#[cfg(target_family = "unix")]
pub fn file_permissions() -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;

    std::fs::Permissions::from_mode(0o600)
}

#[cfg(target_family = "unix")]
pub fn directory_permissions() -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;

    std::fs::Permissions::from_mode(0o700)
}
