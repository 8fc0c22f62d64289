use super::LocalFile;
use crate::utils::{validate_path, FsError};
use std::io::Write;
use std::path::Path;
use std::{fs, io};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("error creating file: {0}")]
    ErrorCreatingFile(#[from] io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(#[from] FsError),
}

pub trait FileWriter {
    fn write(&self, path: &Path, buf: &[u8]) -> Result<(), WriteError>;
}

impl FileWriter for LocalFile {
    /// Write `buf` to `path`, creating missing parent directories. On Unix
    /// the file lands with mode 600: agents hold secret material.
    #[instrument(skip_all, fields(path = %path.display()))]
    fn write(&self, path: &Path, buf: &[u8]) -> Result<(), WriteError> {
        validate_path(path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file_options = fs::OpenOptions::new();
        file_options.create(true).write(true).truncate(true);

        #[cfg(target_family = "unix")]
        {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

            file_options.mode(crate::utils::file_permissions().mode());
        }

        file_options.open(path)?.write_all(buf)?;
        Ok(())
    }
}

#[cfg(feature = "mocks")]
pub mod mock {
    use super::*;
    use crate::mock::MockLocalFile;
    use mockall::predicate;
    use std::path::PathBuf;

    impl MockLocalFile {
        pub fn should_write(&mut self, path: &Path, content: Vec<u8>) {
            let expected = PathBuf::from(path);
            self.expect_write()
                .withf(move |p, buf| p == expected && buf == content)
                .once()
                .returning(|_, _| Ok(()));
        }

        pub fn should_write_any(&mut self, times: usize) {
            self.expect_write().times(times).returning(|_, _| Ok(()));
        }
    }
}
