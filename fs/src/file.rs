pub mod deleter;
pub mod reader;
pub mod writer;

/// Performs file operations against the local filesystem.
#[derive(Clone, Default)]
pub struct LocalFile;
