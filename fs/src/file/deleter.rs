use super::LocalFile;
use crate::utils::validate_path;
use std::path::Path;
use std::{fs, io};
use tracing::instrument;

pub trait FileDeleter {
    /// Remove a file or an entire directory tree. Missing paths are
    /// tolerated so removals can be retried.
    fn delete(&self, path: &Path) -> io::Result<()>;
}

impl FileDeleter for LocalFile {
    #[instrument(skip_all, fields(path = %path.display()))]
    fn delete(&self, path: &Path) -> io::Result<()> {
        validate_path(path).map_err(io::Error::other)?;

        if !path.exists() {
            return Ok(());
        }
        if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }
}
