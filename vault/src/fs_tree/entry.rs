use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Ceiling for whole-file in-band reads. Anything larger must be
/// streamed.
pub const INBAND_LIMIT: u64 = 50 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FsTreeError {
    #[error("base path must be a directory that exists: `{0}`")]
    NotADirectory(PathBuf),

    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),

    #[error("file exceeds the in-band ceiling: `{0}`")]
    FileTooLarge(PathBuf),

    #[error("not a readable file: `{0}`")]
    NotReadable(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEntryKind {
    File,
    Dir,
    Unknown,
}

pub type NodeId = usize;

/// One realized filesystem node. Children are owned (ids into the arena);
/// the parent is a back-reference by id, never an owning link.
#[derive(Debug)]
pub struct ConcreteFsEntry {
    pub path: PathBuf,
    pub kind: FsEntryKind,
    pub depth: usize,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl ConcreteFsEntry {
    pub fn is_file(&self) -> bool {
        self.kind == FsEntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FsEntryKind::Dir
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Arena-backed tree rooted at a base directory.
#[derive(Debug, Default)]
pub struct FsTree {
    nodes: Vec<ConcreteFsEntry>,
}

impl FsTree {
    /// Enumerate `base` recursively. Children are visited in lowercased
    /// name order for determinism; symbolic links are followed only when
    /// they resolve inside `base`.
    pub fn build(base: &Path) -> Result<FsTree, FsTreeError> {
        if !base.is_dir() {
            return Err(FsTreeError::NotADirectory(base.to_path_buf()));
        }
        let canonical_base = base.canonicalize()?;

        let mut tree = FsTree { nodes: Vec::new() };
        tree.build_node(base.to_path_buf(), &canonical_base, 0, None)?;
        Ok(tree)
    }

    fn build_node(
        &mut self,
        path: PathBuf,
        canonical_base: &Path,
        depth: usize,
        parent: Option<NodeId>,
    ) -> Result<NodeId, FsTreeError> {
        let kind = if path.is_dir() {
            FsEntryKind::Dir
        } else if path.is_file() {
            FsEntryKind::File
        } else {
            FsEntryKind::Unknown
        };

        let id = self.nodes.len();
        self.nodes.push(ConcreteFsEntry {
            path: path.clone(),
            kind,
            depth,
            size: 0,
            modified: None,
            parent,
            children: Vec::new(),
        });

        if kind == FsEntryKind::Dir {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&path)?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|e| e.path())
                .filter(|p| resolves_inside(p, canonical_base))
                .collect();
            entries.sort_by_key(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_default()
            });

            for child_path in entries {
                let child = self.build_node(child_path, canonical_base, depth + 1, Some(id))?;
                self.nodes[id].children.push(child);
            }
        }
        Ok(id)
    }

    pub fn root(&self) -> &ConcreteFsEntry {
        &self.nodes[0]
    }

    pub fn get(&self, id: NodeId) -> &ConcreteFsEntry {
        &self.nodes[id]
    }

    pub fn parent_of(&self, id: NodeId) -> Option<&ConcreteFsEntry> {
        self.nodes[id].parent.map(|p| &self.nodes[p])
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ConcreteFsEntry)> {
        self.nodes.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Populate sizes and modification times. A directory's size is the
    /// sum of its descendants' file sizes.
    pub fn realize(&mut self) -> Result<(), FsTreeError> {
        // Children precede nothing: the arena is in pre-order, so walking
        // backwards sees every child before its parent.
        for id in (0..self.nodes.len()).rev() {
            match self.nodes[id].kind {
                FsEntryKind::File => {
                    let meta = std::fs::metadata(&self.nodes[id].path)?;
                    self.nodes[id].size = meta.len();
                    self.nodes[id].modified = meta.modified().ok();
                }
                FsEntryKind::Dir => {
                    let total: u64 = self.nodes[id]
                        .children
                        .iter()
                        .map(|&c| self.nodes[c].size)
                        .sum();
                    self.nodes[id].size = total;
                    self.nodes[id].modified =
                        std::fs::metadata(&self.nodes[id].path).and_then(|m| m.modified()).ok();
                }
                FsEntryKind::Unknown => {}
            }
        }
        Ok(())
    }

    /// Total size of all files below (and including) the root.
    pub fn total_size(&self) -> u64 {
        self.root().size
    }
}

fn resolves_inside(path: &Path, canonical_base: &Path) -> bool {
    if !path.is_symlink() {
        return true;
    }
    match path.canonicalize() {
        Ok(resolved) => resolved.starts_with(canonical_base),
        Err(_) => false,
    }
}

/// Lazy file reader. Reading to EOF in one go is refused for files above
/// [`INBAND_LIMIT`]; callers stream those instead.
pub struct LazyReader {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl LazyReader {
    pub fn new(path: &Path) -> Self {
        LazyReader {
            path: path.to_path_buf(),
            file: None,
        }
    }

    async fn file(&mut self) -> Result<&mut tokio::fs::File, FsTreeError> {
        if self.file.is_none() {
            if !self.path.is_file() {
                return Err(FsTreeError::NotReadable(self.path.clone()));
            }
            self.file = Some(tokio::fs::File::open(&self.path).await?);
        }
        Ok(self.file.as_mut().expect("file opened above"))
    }

    /// Read the next `chunk_size` bytes, or the whole remaining file when
    /// `chunk_size` is `None`.
    pub async fn read(&mut self, chunk_size: Option<usize>) -> Result<Vec<u8>, FsTreeError> {
        if chunk_size.is_none() {
            let len = tokio::fs::metadata(&self.path).await?.len();
            if len > INBAND_LIMIT {
                return Err(FsTreeError::FileTooLarge(self.path.clone()));
            }
        }

        let file = self.file().await?;
        match chunk_size {
            None => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                Ok(buf)
            }
            Some(size) => {
                let mut buf = vec![0u8; size];
                let read = file.read(&mut buf).await?;
                buf.truncate(read);
                Ok(buf)
            }
        }
    }

    pub async fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("racing/cars")).unwrap();
        fs::write(root.join("racing/Readme.txt"), "readme").unwrap();
        fs::write(root.join("racing/cars/fast.txt"), "zoom").unwrap();
        fs::write(root.join("racing/apex.txt"), "late").unwrap();
    }

    #[test]
    fn test_build_orders_children_case_insensitively() {
        let tempdir = tempfile::tempdir().unwrap();
        sample_tree(tempdir.path());

        let tree = FsTree::build(&tempdir.path().join("racing")).unwrap();
        let names: Vec<String> = tree
            .root()
            .children
            .iter()
            .map(|&c| tree.get(c).name())
            .collect();
        assert_eq!(names, vec!["apex.txt", "cars", "Readme.txt"]);
    }

    #[test]
    fn test_realize_sums_directory_sizes() {
        let tempdir = tempfile::tempdir().unwrap();
        sample_tree(tempdir.path());

        let mut tree = FsTree::build(&tempdir.path().join("racing")).unwrap();
        tree.realize().unwrap();

        // "readme" + "zoom" + "late"
        assert_eq!(tree.total_size(), 14);
        let root = tree.root();
        assert!(root.is_dir());
        assert_eq!(root.depth, 0);
    }

    #[test]
    fn test_parent_is_a_back_reference() {
        let tempdir = tempfile::tempdir().unwrap();
        sample_tree(tempdir.path());

        let tree = FsTree::build(&tempdir.path().join("racing")).unwrap();
        for (id, node) in tree.iter().skip(1) {
            let parent = tree.parent_of(id).unwrap();
            assert_eq!(node.path.parent().unwrap(), parent.path);
        }
    }

    #[test]
    fn test_build_refuses_files() {
        let tempdir = tempfile::tempdir().unwrap();
        let file = tempdir.path().join("plain.txt");
        fs::write(&file, "x").unwrap();
        assert_matches!(FsTree::build(&file), Err(FsTreeError::NotADirectory(_)));
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn test_symlink_escaping_base_is_skipped() {
        let tempdir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "outside").unwrap();

        let base = tempdir.path().join("base");
        fs::create_dir(&base).unwrap();
        fs::write(base.join("inside.txt"), "inside").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), base.join("escape")).unwrap();

        let tree = FsTree::build(&base).unwrap();
        let names: Vec<String> = tree
            .root()
            .children
            .iter()
            .map(|&c| tree.get(c).name())
            .collect();
        assert_eq!(names, vec!["inside.txt"]);
    }

    #[tokio::test]
    async fn test_lazy_reader_reads_in_chunks() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("data.bin");
        fs::write(&path, b"0123456789").unwrap();

        let mut reader = LazyReader::new(&path);
        assert_eq!(reader.read(Some(4)).await.unwrap(), b"0123");
        assert_eq!(reader.read(Some(4)).await.unwrap(), b"4567");
        assert_eq!(reader.read(Some(4)).await.unwrap(), b"89");
        assert!(reader.read(Some(4)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lazy_reader_refuses_missing_file() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut reader = LazyReader::new(&tempdir.path().join("absent"));
        assert_matches!(
            reader.read(None).await,
            Err(FsTreeError::NotReadable(_))
        );
    }
}
