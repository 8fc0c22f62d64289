use super::LocalFile;
use std::fs;
use std::io;
use std::path::Path;

pub trait FileReader {
    /// Read the contents of `file_path` as raw bytes.
    fn read(&self, file_path: &Path) -> io::Result<Vec<u8>>;
}

impl FileReader for LocalFile {
    fn read(&self, file_path: &Path) -> io::Result<Vec<u8>> {
        if !file_path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found or not a file: {}", file_path.display()),
            ));
        }
        fs::read(file_path)
    }
}
