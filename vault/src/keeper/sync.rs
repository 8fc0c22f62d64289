//! `sync_objects`: drive one agent's remote state to the declared state,
//! one directive at a time.

use crate::agent::api::{AgentApi, AgentCallError, ObjectWrite};
use crate::fs_tree::{hash, FsTree, INBAND_LIMIT};
use crate::state::manager::{plan_directory, SyncAssessment};
use crate::state::{FsEntryStateManager, SyncStrategy};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Counters for one sync pass, used for logging and tested directly.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: usize,
    pub removed: usize,
    pub streamed: usize,
    pub skipped: usize,
}

/// One polling cycle for a set of directives against a connected agent.
/// Failures of a single directive skip it; transport failures abort.
pub async fn sync_objects(
    api: &mut dyn AgentApi,
    managers: &mut [FsEntryStateManager],
) -> Result<SyncReport, AgentCallError> {
    let mut report = SyncReport::default();
    if managers.is_empty() {
        return Ok(report);
    }

    // Local state may have changed since the last poll.
    for manager in managers.iter_mut() {
        if let Err(err) = manager.validate_local_object() {
            warn!(%err, "skipping directive");
        }
    }

    let paths: Vec<String> = managers
        .iter()
        .map(|m| m.absolute_remote_path().display().to_string())
        .collect();
    let hashes = api.get_all_object_hashes(paths).await?;
    let remote_crcs: BTreeMap<String, u32> =
        hashes.into_iter().map(|o| (o.name, o.crc32)).collect();

    for manager in managers.iter_mut() {
        if !manager.local_exists {
            report.skipped += 1;
            continue;
        }

        let remote_path = manager.absolute_remote_path();
        let remote_crc = remote_crcs
            .get(&remote_path.display().to_string())
            .copied()
            .unwrap_or(0);

        match manager.observe_remote(remote_crc) {
            SyncAssessment::InSync => {
                info!(object = %remote_path.display(), "object is up to date... skipping");
            }
            SyncAssessment::NoTouch | SyncAssessment::ValidatedByStrategy => {}
            SyncAssessment::RemoteMissing | SyncAssessment::Diverged => {
                if manager.is_dir {
                    sync_directory(api, manager, &mut report).await?;
                } else {
                    sync_file(api, manager, &mut report).await?;
                }
            }
        }
    }

    info!(?report, "sync pass complete");
    Ok(report)
}

async fn sync_file(
    api: &mut dyn AgentApi,
    manager: &mut FsEntryStateManager,
    report: &mut SyncReport,
) -> Result<(), AgentCallError> {
    let local = manager.absolute_local_path();
    let remote = manager.absolute_remote_path();

    let size = match tokio::fs::metadata(&local).await {
        Ok(meta) => meta.len(),
        Err(err) => {
            warn!(local = %local.display(), %err, "local object vanished mid-sync");
            report.skipped += 1;
            return Ok(());
        }
    };

    if size > INBAND_LIMIT {
        api.stream_files(vec![(local, remote)]).await?;
        report.streamed += 1;
    } else {
        let contents = tokio::fs::read(&local).await.map_err(local_error)?;
        info!(object = %remote.display(), bytes = size, "sending object");
        api.write_object(ObjectWrite::file(&remote.display().to_string(), &contents))
            .await?;
        report.written += 1;
    }

    manager.mark_synced();
    Ok(())
}

async fn sync_directory(
    api: &mut dyn AgentApi,
    manager: &mut FsEntryStateManager,
    report: &mut SyncReport,
) -> Result<(), AgentCallError> {
    let local = manager.absolute_local_path();
    let remote = manager.absolute_remote_path();

    if !manager.remote_exists {
        cold_sync_directory(api, manager, report).await?;
        return Ok(());
    }

    let local_for_hash = local.clone();
    let local_hashes =
        tokio::task::spawn_blocking(move || hash::directory_hashes(&local_for_hash))
            .await
            .map_err(local_error)?
            .map_err(local_error)?;
    let remote_hashes = api
        .get_directory_hashes(remote.display().to_string())
        .await?;

    let remote_parent = remote.parent().unwrap_or(&remote).to_path_buf();
    let plan = plan_directory(&local_hashes, &remote_hashes, &remote_parent);

    match manager.strategy() {
        SyncStrategy::Strict => {
            if !plan.extras.is_empty() {
                let extras: Vec<String> = plan
                    .extras
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                info!(?extras, "removing remote extras");
                api.remove_objects(extras).await?;
                report.removed += plan.extras.len();
            }
        }
        SyncStrategy::AllowAdds => {
            manager.memoize_validated_remote();
        }
        SyncStrategy::EnsureCreated => {}
    }

    transfer_candidates(
        api,
        &plan.candidates,
        local.parent().unwrap_or(&local),
        &remote_parent,
        &remote_hashes,
        report,
    )
    .await?;

    if manager.strategy() == SyncStrategy::Strict {
        manager.mark_synced();
    }
    Ok(())
}

/// First contact: the remote object does not exist at all. A small tree
/// travels as one compressed tar; a large one is streamed file by file.
async fn cold_sync_directory(
    api: &mut dyn AgentApi,
    manager: &mut FsEntryStateManager,
    report: &mut SyncReport,
) -> Result<(), AgentCallError> {
    let local = manager.absolute_local_path();
    let remote = manager.absolute_remote_path();

    let walk_root = local.clone();
    let tree = tokio::task::spawn_blocking(move || -> io::Result<FsTree> {
        let mut tree = FsTree::build(&walk_root).map_err(io::Error::other)?;
        tree.realize().map_err(io::Error::other)?;
        Ok(tree)
    })
    .await
    .map_err(local_error)?
    .map_err(local_error)?;

    let total = tree.total_size();
    info!(object = %remote.display(), bytes = total, "remote object missing, sending tree");

    if total <= INBAND_LIMIT {
        let tar_root = local.clone();
        let archive = tokio::task::spawn_blocking(move || tar_directory(&tar_root))
            .await
            .map_err(local_error)?
            .map_err(local_error)?;
        api.write_object(ObjectWrite::tarball(&remote.display().to_string(), &archive))
            .await?;
        report.written += 1;
    } else {
        let mut pairs = Vec::new();
        let mut empty_dirs = Vec::new();
        for (_, node) in tree.iter() {
            let Ok(relative) = node.path.strip_prefix(&local) else {
                continue;
            };
            let remote_path = remote.join(relative);
            if node.is_file() {
                pairs.push((node.path.clone(), remote_path));
            } else if node.is_dir() && node.children.is_empty() {
                empty_dirs.push(remote_path);
            }
        }

        report.streamed += pairs.len();
        api.stream_files(pairs).await?;
        for dir in empty_dirs {
            api.write_object(ObjectWrite::empty_dir(&dir.display().to_string()))
                .await?;
            report.written += 1;
        }
    }

    manager.mark_synced();
    Ok(())
}

/// Ship the local descendants that differ. Inline below the in-band
/// ceiling, streamed above it; empty directories are created explicitly.
async fn transfer_candidates(
    api: &mut dyn AgentApi,
    candidates: &[String],
    local_parent: &Path,
    remote_parent: &Path,
    remote_hashes: &BTreeMap<String, u32>,
    report: &mut SyncReport,
) -> Result<(), AgentCallError> {
    let mut files: Vec<(PathBuf, PathBuf, u64)> = Vec::new();
    let mut empty_dirs: Vec<PathBuf> = Vec::new();

    for key in candidates {
        let local_path = local_parent.join(key);
        let remote_path = remote_parent.join(key);

        if local_path.is_file() {
            let size = tokio::fs::metadata(&local_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            files.push((local_path, remote_path, size));
        } else if local_path.is_dir() {
            let empty = std::fs::read_dir(&local_path)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if empty && !remote_hashes.contains_key(key) {
                empty_dirs.push(remote_path);
            }
        }
    }

    let total: u64 = files.iter().map(|(_, _, size)| size).sum();

    if total <= INBAND_LIMIT {
        for (local_path, remote_path, _) in files {
            let contents = tokio::fs::read(&local_path).await.map_err(local_error)?;
            api.write_object(ObjectWrite::file(
                &remote_path.display().to_string(),
                &contents,
            ))
            .await?;
            report.written += 1;
        }
    } else {
        let pairs: Vec<(PathBuf, PathBuf)> = files
            .into_iter()
            .map(|(local, remote, _)| (local, remote))
            .collect();
        report.streamed += pairs.len();
        api.stream_files(pairs).await?;
    }

    for dir in empty_dirs {
        api.write_object(ObjectWrite::empty_dir(&dir.display().to_string()))
            .await?;
        report.written += 1;
    }

    Ok(())
}

/// Pack a directory's contents into a gzip'd tar that extracts into the
/// target path.
fn tar_directory(dir: &Path) -> io::Result<Vec<u8>> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", dir)?;
    builder.into_inner()?.finish()
}

fn local_error(err: impl std::fmt::Display) -> AgentCallError {
    AgentCallError::Local(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::api::{MockAgentApi, ObjectCrc};
    use crate::state::RemoteStateDirective;
    use mockall::predicate::eq;
    use std::fs;
    use std::path::Path;

    fn managers_for(
        staging: &Path,
        name: &str,
        strategy: SyncStrategy,
    ) -> Vec<FsEntryStateManager> {
        vec![FsEntryStateManager::new(
            RemoteStateDirective::new(name, strategy),
            staging,
            None,
            Path::new("/app"),
        )]
    }

    fn hashes_reply(name: &str, crc: u32) -> Vec<ObjectCrc> {
        vec![ObjectCrc {
            name: name.to_string(),
            crc32: crc,
        }]
    }

    #[tokio::test]
    async fn test_cold_sync_single_file_writes_once() {
        let staging = tempfile::tempdir().unwrap();
        fs::write(staging.path().join("quotes.txt"), "alpha").unwrap();
        let mut managers =
            managers_for(staging.path(), "quotes.txt", SyncStrategy::Strict);

        let mut api = MockAgentApi::new();
        api.expect_get_all_object_hashes()
            .with(eq(vec!["/app/quotes.txt".to_string()]))
            .times(1)
            .returning(|_| Ok(hashes_reply("/app/quotes.txt", 0)));
        api.expect_write_object()
            .withf(|object| {
                object.path == "/app/quotes.txt"
                    && !object.is_dir
                    && object.data == hex::encode(b"alpha")
            })
            .times(1)
            .returning(|_| Ok(()));

        let report = sync_objects(&mut api, &mut managers).await.unwrap();

        assert_eq!(report.written, 1);
        assert!(managers[0].in_sync);
        assert_eq!(managers[0].remote_crc, 0xd0e0396a);
    }

    #[tokio::test]
    async fn test_second_poll_with_unchanged_state_is_quiet() {
        let staging = tempfile::tempdir().unwrap();
        fs::write(staging.path().join("quotes.txt"), "alpha").unwrap();
        let mut managers =
            managers_for(staging.path(), "quotes.txt", SyncStrategy::Strict);

        let mut api = MockAgentApi::new();
        // Remote already matches: the only call is the hash fetch.
        api.expect_get_all_object_hashes()
            .times(1)
            .returning(|_| Ok(hashes_reply("/app/quotes.txt", 0xd0e0396a)));
        api.expect_write_object().times(0);
        api.expect_remove_objects().times(0);

        let report = sync_objects(&mut api, &mut managers).await.unwrap();
        assert_eq!(report.written, 0);
        assert!(managers[0].in_sync);
    }

    #[tokio::test]
    async fn test_strict_removes_extras_without_writes() {
        let staging = tempfile::tempdir().unwrap();
        let dir = staging.path().join("dir");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a"), "aaa").unwrap();
        fs::write(dir.join("b"), "bbb").unwrap();
        let mut managers = managers_for(staging.path(), "dir", SyncStrategy::Strict);

        // Build the remote's answer: same a and b, plus extra c/d.
        let mut remote_hashes = hash::directory_hashes(&dir).unwrap();
        remote_hashes.insert("dir/c".to_string(), 777);
        remote_hashes.insert("dir/c/d".to_string(), 778);

        let mut api = MockAgentApi::new();
        api.expect_get_all_object_hashes()
            .times(1)
            .returning(|_| Ok(hashes_reply("/app/dir", 0xFEED)));
        api.expect_get_directory_hashes()
            .with(eq("/app/dir".to_string()))
            .times(1)
            .returning(move |_| Ok(remote_hashes.clone()));
        api.expect_remove_objects()
            .with(eq(vec!["/app/dir/c".to_string()]))
            .times(1)
            .returning(|_| Ok(()));
        api.expect_write_object().times(0);

        let report = sync_objects(&mut api, &mut managers).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.written, 0);
    }

    #[tokio::test]
    async fn test_allow_adds_memoizes_instead_of_removing() {
        let staging = tempfile::tempdir().unwrap();
        let dir = staging.path().join("dir");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a"), "aaa").unwrap();
        let mut managers = managers_for(staging.path(), "dir", SyncStrategy::AllowAdds);

        let mut remote_hashes = hash::directory_hashes(&dir).unwrap();
        remote_hashes.insert("dir/extra".to_string(), 555);

        let mut api = MockAgentApi::new();
        api.expect_get_all_object_hashes()
            .times(1)
            .returning(|_| Ok(hashes_reply("/app/dir", 0xFEED)));
        api.expect_get_directory_hashes()
            .times(1)
            .returning(move |_| Ok(remote_hashes.clone()));
        api.expect_remove_objects().times(0);
        api.expect_write_object().times(0);

        sync_objects(&mut api, &mut managers).await.unwrap();
        assert_eq!(managers[0].validated_remote_crc, 0xFEED);

        // Next poll with the same remote hash performs only the top-level
        // hash fetch.
        let mut quiet = MockAgentApi::new();
        quiet
            .expect_get_all_object_hashes()
            .times(1)
            .returning(|_| Ok(hashes_reply("/app/dir", 0xFEED)));
        quiet.expect_get_directory_hashes().times(0);
        quiet.expect_write_object().times(0);
        quiet.expect_remove_objects().times(0);

        sync_objects(&mut quiet, &mut managers).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_created_never_rewrites() {
        let staging = tempfile::tempdir().unwrap();
        fs::write(staging.path().join("seed.dat"), "mutated-after-first-sync").unwrap();
        let mut managers =
            managers_for(staging.path(), "seed.dat", SyncStrategy::EnsureCreated);

        let mut api = MockAgentApi::new();
        api.expect_get_all_object_hashes()
            .times(1)
            .returning(|_| Ok(hashes_reply("/app/seed.dat", 0x0DDBA11)));
        api.expect_write_object().times(0);

        let report = sync_objects(&mut api, &mut managers).await.unwrap();
        assert_eq!(report.written, 0);
    }

    #[tokio::test]
    async fn test_missing_local_object_is_skipped_not_deleted() {
        let staging = tempfile::tempdir().unwrap();
        let mut managers = managers_for(staging.path(), "ghost", SyncStrategy::Strict);

        let mut api = MockAgentApi::new();
        api.expect_get_all_object_hashes()
            .times(1)
            .returning(|_| Ok(hashes_reply("/app/ghost", 0xCAFE)));
        api.expect_remove_objects().times(0);
        api.expect_write_object().times(0);

        let report = sync_objects(&mut api, &mut managers).await.unwrap();
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_large_file_is_streamed_not_inlined() {
        let staging = tempfile::tempdir().unwrap();
        let path = staging.path().join("big.bin");
        fs::write(&path, b"placeholder").unwrap();
        // Pretend the file is huge by shrinking the comparison: instead,
        // actually grow the file past the ceiling with a sparse write.
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(INBAND_LIMIT + 1).unwrap();
        drop(file);

        let mut managers = managers_for(staging.path(), "big.bin", SyncStrategy::Strict);

        let mut api = MockAgentApi::new();
        api.expect_get_all_object_hashes()
            .times(1)
            .returning(|_| Ok(hashes_reply("/app/big.bin", 0)));
        api.expect_write_object().times(0);
        api.expect_stream_files()
            .withf(|pairs| {
                pairs.len() == 1 && pairs[0].1 == PathBuf::from("/app/big.bin")
            })
            .times(1)
            .returning(|_| Ok(()));

        let report = sync_objects(&mut api, &mut managers).await.unwrap();
        assert_eq!(report.streamed, 1);
    }

    #[test]
    fn test_tar_directory_round_trips() {
        let source = tempfile::tempdir().unwrap();
        let dir = source.path().join("tree");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("a.txt"), "alpha").unwrap();
        fs::write(dir.join("sub/b.txt"), "beta").unwrap();

        let archive = tar_directory(&dir).unwrap();
        assert!(archive.starts_with(&[0x1f, 0x8b]));

        let target = tempfile::tempdir().unwrap();
        let decoder = flate2::read::GzDecoder::new(&archive[..]);
        tar::Archive::new(decoder)
            .unpack(target.path().join("tree"))
            .unwrap();

        assert_eq!(
            fs::read(target.path().join("tree/a.txt")).unwrap(),
            b"alpha"
        );
        assert_eq!(
            fs::read(target.path().join("tree/sub/b.txt")).unwrap(),
            b"beta"
        );
    }
}
