pub mod directory_manager;
pub mod file;
pub mod utils;

#[cfg(feature = "mocks")]
pub mod mock {
    use std::io;
    use std::path::Path;

    use super::file::deleter::FileDeleter;
    use super::file::reader::FileReader;
    use super::file::writer::{FileWriter, WriteError};
    use mockall::mock;

    mock! {
        pub LocalFile {}

        impl FileReader for LocalFile {
            fn read(&self, file_path: &Path) -> io::Result<Vec<u8>>;
        }

        impl FileWriter for LocalFile {
            fn write(&self, path: &Path, buf: &[u8]) -> Result<(), WriteError>;
        }

        impl FileDeleter for LocalFile {
            fn delete(&self, path: &Path) -> io::Result<()>;
        }
    }
}
