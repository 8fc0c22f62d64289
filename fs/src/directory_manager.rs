use super::utils::validate_path;
use std::fs::{remove_dir_all, DirBuilder};
use std::io;
use std::path::Path;
use tracing::instrument;

pub trait DirectoryManager {
    /// Create the directory and any missing parents.
    fn create(&self, path: &Path) -> io::Result<()>;

    /// Delete the directory and its contents. A missing directory is not an
    /// error.
    fn delete(&self, path: &Path) -> io::Result<()>;
}

#[derive(Clone, Default)]
pub struct DirectoryManagerFs;

impl DirectoryManager for DirectoryManagerFs {
    fn create(&self, path: &Path) -> io::Result<()> {
        validate_path(path).map_err(io::Error::other)?;
        let mut builder = DirBuilder::new();
        builder.recursive(true);

        #[cfg(target_family = "unix")]
        {
            use std::os::unix::fs::DirBuilderExt;
            use std::os::unix::fs::PermissionsExt;

            builder.mode(crate::utils::directory_permissions().mode());
        }

        builder.create(path)
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn delete(&self, path: &Path) -> io::Result<()> {
        validate_path(path).map_err(io::Error::other)?;

        if !path.exists() {
            return Ok(());
        }
        remove_dir_all(path)
    }
}

////////////////////////////////////////////////////////////////////////////////////
// Mock
////////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "mocks")]
pub mod mock {
    use super::*;
    use mockall::{mock, predicate};
    use std::path::PathBuf;

    mock! {
        pub DirectoryManager {}

        impl DirectoryManager for DirectoryManager {
            fn create(&self, path: &Path) -> io::Result<()>;
            fn delete(&self, path: &Path) -> io::Result<()>;
        }
        impl Clone for DirectoryManager {
            fn clone(&self) -> Self;
        }
    }

    impl MockDirectoryManager {
        pub fn should_create(&mut self, path: &Path) {
            let expected = PathBuf::from(path);
            self.expect_create()
                .with(predicate::eq(expected))
                .once()
                .returning(|_| Ok(()));
        }

        pub fn should_delete(&mut self, path: &Path) {
            let expected = PathBuf::from(path);
            self.expect_delete()
                .with(predicate::eq(expected))
                .once()
                .returning(|_| Ok(()));
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_path_to_create_cannot_contain_dots() {
        let path = PathBuf::from("some/path/../with/../dots");
        let directory_manager = DirectoryManagerFs;

        let result = directory_manager.create(&path);

        assert!(result.is_err());
    }

    #[test]
    fn test_folder_creation_sets_permissions() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("nested/new_dir");

        let directory_manager = DirectoryManagerFs;
        directory_manager.create(&path).unwrap();

        assert!(path.is_dir());

        #[cfg(target_family = "unix")]
        {
            use std::fs::metadata;
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(
                crate::utils::directory_permissions().mode() & 0o777,
                metadata(&path).unwrap().permissions().mode() & 0o777
            );
        }
    }

    #[test]
    fn test_folder_creation_does_not_fail_if_exists() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("already_there");

        let directory_manager = DirectoryManagerFs;
        directory_manager.create(&path).unwrap();
        directory_manager.create(&path).unwrap();
    }

    #[test]
    fn test_deleting_a_missing_folder_is_not_an_error() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("never_created");

        let directory_manager = DirectoryManagerFs;
        assert!(directory_manager.delete(&path).is_ok());
    }
}
