//! Hierarchical CRC-32 hashing.
//!
//! A file hashes its streamed contents. A directory hash is seeded by the
//! directory's own name and accumulates, in case-insensitive lexical
//! order, each child's name followed by the child's own hash under the
//! running accumulator. An empty directory therefore hashes to the CRC of
//! its name alone, and a rename changes every ancestor hash.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Files are hashed in chunks of this size to keep memory flat.
pub const CRC_CHUNK: usize = 128 * 1024;

fn crc32(data: &[u8], seed: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// Streaming CRC of one file's contents, continuing from `seed`.
pub fn crc_file(path: &Path, seed: u32) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; CRC_CHUNK];
    let mut crc = seed;
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            return Ok(crc);
        }
        crc = crc32(&buf[..read], crc);
    }
}

fn file_name_bytes(path: &Path) -> Vec<u8> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned().into_bytes())
        .unwrap_or_default()
}

fn sorted_children(path: &Path) -> io::Result<Vec<std::path::PathBuf>> {
    let mut children: Vec<_> = std::fs::read_dir(path)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    children.sort_by_key(|p| p.to_string_lossy().to_lowercase());
    Ok(children)
}

/// Recursive CRC of a directory tree, continuing from `seed`.
pub fn crc_directory(path: &Path, seed: u32) -> io::Result<u32> {
    let mut crc = crc32(&file_name_bytes(path), seed);
    for child in sorted_children(path)? {
        crc = crc32(&file_name_bytes(&child), crc);
        if child.is_file() {
            crc = crc_file(&child, crc)?;
        } else if child.is_dir() {
            crc = crc_directory(&child, crc)?;
        }
    }
    Ok(crc)
}

/// Hash of any object. Missing paths report 0, which callers tell apart
/// from an empty file (also 0) through their own existence flag.
pub fn object_crc(path: &Path) -> io::Result<u32> {
    if !path.exists() {
        return Ok(0);
    }
    if path.is_dir() {
        crc_directory(path, 0)
    } else {
        crc_file(path, 0)
    }
}

/// Per-node hashes for a directory and every descendant. Keys are paths
/// relative to the directory's parent, so both ends of a sync produce the
/// same key for the same node.
pub fn directory_hashes(dir: &Path) -> io::Result<BTreeMap<String, u32>> {
    let mut hashes = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(hashes);
    }
    let base = dir.parent().unwrap_or(dir);
    collect_hashes(dir, base, &mut hashes)?;
    Ok(hashes)
}

fn collect_hashes(
    dir: &Path,
    base: &Path,
    hashes: &mut BTreeMap<String, u32>,
) -> io::Result<()> {
    let key = relative_key(dir, base);
    hashes.insert(key, crc32(&file_name_bytes(dir), 0));

    for child in sorted_children(dir)? {
        if child.is_dir() {
            collect_hashes(&child, base, hashes)?;
        } else if child.is_file() {
            hashes.insert(relative_key(&child, base), crc_file(&child, 0)?);
        }
    }
    Ok(())
}

fn relative_key(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_crc_file_matches_known_value() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("quotes.txt");
        fs::write(&path, "alpha").unwrap();

        assert_eq!(crc_file(&path, 0).unwrap(), 0xd0e0396a);
    }

    #[test]
    fn test_crc_file_streams_identically_to_one_shot() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("big.bin");
        let content: Vec<u8> = (0..CRC_CHUNK * 3 + 17).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &content).unwrap();

        assert_eq!(crc_file(&path, 0).unwrap(), crc32(&content, 0));
    }

    #[test]
    fn test_empty_file_hashes_to_zero() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("empty");
        fs::write(&path, "").unwrap();
        assert_eq!(crc_file(&path, 0).unwrap(), 0);
    }

    #[test]
    fn test_missing_object_reports_zero() {
        let tempdir = tempfile::tempdir().unwrap();
        assert_eq!(object_crc(&tempdir.path().join("absent")).unwrap(), 0);
    }

    #[test]
    fn test_empty_directory_hashes_to_its_own_name() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = tempdir.path().join("hollow");
        fs::create_dir(&dir).unwrap();
        assert_eq!(crc_directory(&dir, 0).unwrap(), crc32(b"hollow", 0));
    }

    #[test]
    fn test_directory_hash_is_stable_across_creation_order() {
        let build = |root: &Path, order: &[&str]| {
            let dir = root.join("tree");
            fs::create_dir(&dir).unwrap();
            for name in order {
                fs::write(dir.join(name), format!("content-{name}")).unwrap();
            }
            crc_directory(&dir, 0).unwrap()
        };

        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let a = build(first.path(), &["Alpha", "beta", "Gamma"]);
        let b = build(second.path(), &["Gamma", "Alpha", "beta"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_directory_hash_changes_on_rename() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = tempdir.path().join("tree");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("one.txt"), "same bytes").unwrap();
        let before = crc_directory(&dir, 0).unwrap();

        fs::rename(dir.join("one.txt"), dir.join("two.txt")).unwrap();
        let after = crc_directory(&dir, 0).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_directory_hashes_cover_all_descendants() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = tempdir.path().join("racing");
        fs::create_dir_all(dir.join("cars")).unwrap();
        fs::write(dir.join("apex.txt"), "late").unwrap();
        fs::write(dir.join("cars/fast.txt"), "zoom").unwrap();

        let hashes = directory_hashes(&dir).unwrap();
        let keys: Vec<&str> = hashes.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["racing", "racing/apex.txt", "racing/cars", "racing/cars/fast.txt"]
        );
    }

    #[test]
    fn test_directory_hashes_match_on_identical_trees() {
        let make = |root: &Path| {
            let dir = root.join("app");
            fs::create_dir_all(dir.join("sub")).unwrap();
            fs::write(dir.join("a.txt"), "alpha").unwrap();
            fs::write(dir.join("sub/b.txt"), "beta").unwrap();
            directory_hashes(&dir).unwrap()
        };

        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        assert_eq!(make(local.path()), make(remote.path()));
    }
}
