//! Drives the directory tree from one device revision to the next.
//!
//! The remote is authoritative: nothing here mutates the tree except in
//! response to what the remote reports. `refresh` applies the ordered
//! change log since the tree's revision; `full_rebuild` walks the whole
//! remote hierarchy from scratch. Both end in a consistent tree whose
//! revision matches the remote's at the time of the call.
//!
//! The tree revision is advanced only after an entire change batch
//! applied. When any step fails the tree keeps its previous revision, so
//! the next refresh fetches and replays the same range; applying a batch
//! is idempotent, so the partial first attempt does no harm.

use tracing::{debug, info, warn};

use crate::api_client::{ChangeKind, DeviceChange, Remote, is_not_found_code};
use crate::cache::FileCache;
use crate::error::{MfError, MfResult};
use crate::tree::FolderTree;

/// Fetch one folder's direct contents, update the entries and replace the
/// folder's children list. Returns the keys of the subfolders so callers
/// can recurse. `None` addresses the root.
async fn list_folder<R: Remote + ?Sized>(
    tree: &mut FolderTree,
    remote: &R,
    key: Option<&str>,
) -> MfResult<Vec<String>> {
    let folders = remote.get_content_folders(key).await?;
    let files = remote.get_content_files(key).await?;

    let mut children = Vec::with_capacity(folders.len() + files.len());
    let mut subfolders = Vec::with_capacity(folders.len());

    for folder in &folders {
        if folder.folderkey.is_empty() {
            warn!("folder listing contains a record without a key, skipping");
            continue;
        }
        tree.add_or_update_folder(folder)?;
        children.push(folder.folderkey.clone());
        subfolders.push(folder.folderkey.clone());
    }
    for file in &files {
        if file.quickkey.is_empty() {
            warn!("file listing contains a record without a key, skipping");
            continue;
        }
        tree.add_or_update_file(file)?;
        children.push(file.quickkey.clone());
    }

    tree.set_children(key, children)?;
    Ok(subfolders)
}

/// Apply a single change-log entry.
///
/// A folder update refreshes the folder's metadata and its direct
/// children; a file update refreshes the file's metadata only. An update
/// whose key the remote no longer knows is skipped: the same batch carries
/// the deletion further down.
pub async fn apply_change<R: Remote + ?Sized>(
    tree: &mut FolderTree,
    remote: &R,
    change: &DeviceChange,
) -> MfResult<()> {
    match change.kind {
        ChangeKind::DeletedFile | ChangeKind::DeletedFolder => {
            tree.remove(&change.key);
            Ok(())
        }
        ChangeKind::UpdatedFolder => {
            let info = match remote.get_folder_info(Some(&change.key)).await {
                Ok(info) => info,
                Err(MfError::Remote { code, .. }) if is_not_found_code(code) => {
                    debug!(key = %change.key, "updated folder already gone remotely");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            tree.add_or_update_folder(&info)?;
            list_folder(tree, remote, Some(&change.key)).await?;
            Ok(())
        }
        ChangeKind::UpdatedFile => {
            let info = match remote.get_file_info(&change.key).await {
                Ok(info) => info,
                Err(MfError::Remote { code, .. }) if is_not_found_code(code) => {
                    debug!(key = %change.key, "updated file already gone remotely");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            tree.add_or_update_file(&info)
        }
    }
}

/// Ask the remote whether anything changed since the tree's revision and,
/// if so, apply the ordered change batch. Returns whether the tree moved.
pub async fn refresh<R: Remote + ?Sized>(
    tree: &mut FolderTree,
    remote: &R,
    expect_changes: bool,
) -> MfResult<bool> {
    let remote_revision = remote.get_status().await?;
    if remote_revision == tree.revision() {
        if expect_changes {
            warn!(revision = remote_revision, "expected remote changes but the revision is unchanged");
        }
        return Ok(false);
    }

    // the change log never names the root, so refresh its direct contents
    // by hand before walking the log
    list_folder(tree, remote, None).await?;

    let changes = remote.get_changes(tree.revision()).await?;
    for change in &changes {
        apply_change(tree, remote, change).await?;
    }

    // the new tree revision is the revision of the last change
    let new_revision = changes.last().map_or(remote_revision, |c| c.revision);
    debug!(from = tree.revision(), to = new_revision, applied = changes.len(), "refresh complete");
    tree.set_revision(new_revision);
    Ok(true)
}

/// Rebuild the tree by a full depth-first walk of the remote hierarchy.
/// Called on first use and whenever local and remote state diverge beyond
/// what the change log covers.
pub async fn full_rebuild<R: Remote + ?Sized>(
    tree: &mut FolderTree,
    cache: &FileCache,
    remote: &R,
) -> MfResult<()> {
    let revision_before = remote.get_status().await?;
    info!(revision = revision_before, "rebuilding the directory tree");

    tree.clear();
    tree.set_revision(revision_before);

    // whatever key the remote reports for the account root, locally it is
    // the keyless root entry
    let mut root = remote.get_folder_info(None).await?;
    root.folderkey.clear();
    tree.add_or_update_folder(&root)?;

    let mut stack: Vec<Option<String>> = vec![None];
    while let Some(key) = stack.pop() {
        let subfolders = list_folder(tree, remote, key.as_deref()).await?;
        stack.extend(subfolders.into_iter().map(Some));
    }

    // absorb whatever changed remotely while we were walking
    refresh(tree, remote, false).await?;
    housekeep(tree, cache);
    Ok(())
}

/// Mark-and-sweep over tree and cache directory. Entries that are
/// unreferenced but carry the current tree revision survive: they may be
/// mid-move, between the batch that rewrote the old parent and the one
/// that rewrites the new parent.
pub fn housekeep(tree: &mut FolderTree, cache: &FileCache) {
    let removed = tree.sweep_unreferenced();
    if !removed.is_empty() {
        info!(count = removed.len(), "removed unreferenced entries");
    }
    cache.sweep(tree);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ChangeKind;
    use crate::testutil::MockRemote;

    fn empty_cache() -> (tempfile::TempDir, FileCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        (dir, cache)
    }

    /// Fresh mount against a remote with one folder and one file in the
    /// root: the rebuilt tree lists both with the right metadata.
    #[tokio::test]
    async fn full_rebuild_of_a_fresh_root() {
        let remote = MockRemote::new();
        remote.set_revision(10);
        remote.add_folder("abcdefghijklm", "docs", "", 10);
        remote.add_file("aaaaaaaaaaaaaaa", "readme.txt", "", 10, b"hello world");

        let mut tree = FolderTree::new();
        let (_dir, cache) = empty_cache();
        full_rebuild(&mut tree, &cache, &remote).await.unwrap();

        assert_eq!(tree.revision(), 10);
        let root = tree.lookup_key(None).unwrap();
        let mut names: Vec<String> = root
            .children()
            .iter()
            .map(|k| tree.lookup_key(Some(k)).unwrap().name.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["docs", "readme.txt"]);
        assert_eq!(tree.lookup_path("/readme.txt").unwrap().file_size(), 11);
    }

    #[tokio::test]
    async fn rebuild_recurses_into_subfolders() {
        let remote = MockRemote::new();
        remote.set_revision(5);
        remote.add_folder("abcdefghijklm", "docs", "", 5);
        remote.add_folder("bcdefghijklmn", "deep", "abcdefghijklm", 5);
        remote.add_file("aaaaaaaaaaaaaaa", "leaf.txt", "bcdefghijklmn", 5, b"leaf");

        let mut tree = FolderTree::new();
        let (_dir, cache) = empty_cache();
        full_rebuild(&mut tree, &cache, &remote).await.unwrap();

        assert_eq!(tree.lookup_path("/docs/deep/leaf.txt").unwrap().file_size(), 4);
    }

    /// Incremental change: one file updated, one folder deleted.
    #[tokio::test]
    async fn refresh_applies_an_ordered_batch() {
        let remote = MockRemote::new();
        remote.set_revision(10);
        remote.add_folder("abcdefghijklm", "docs", "", 10);
        remote.add_file("aaaaaaaaaaaaaaa", "readme.txt", "", 10, b"hello world");

        let mut tree = FolderTree::new();
        let (_dir, cache) = empty_cache();
        full_rebuild(&mut tree, &cache, &remote).await.unwrap();

        remote.update_file("aaaaaaaaaaaaaaa", 11, b"hello world, again");
        remote.remove_entry("abcdefghijklm");
        remote.set_revision(12);
        remote.push_change(ChangeKind::UpdatedFile, "aaaaaaaaaaaaaaa", "", 11);
        remote.push_change(ChangeKind::DeletedFolder, "abcdefghijklm", "", 12);

        let moved = refresh(&mut tree, &remote, false).await.unwrap();
        assert!(moved);
        assert_eq!(tree.revision(), 12);
        assert!(tree.lookup_key(Some("abcdefghijklm")).is_none());
        assert!(matches!(tree.lookup_path("/docs"), Err(MfError::NotFound)));
        assert_eq!(tree.lookup_path("/readme.txt").unwrap().revision, 11);
    }

    #[tokio::test]
    async fn refresh_without_remote_changes_is_a_noop() {
        let remote = MockRemote::new();
        remote.set_revision(10);

        let mut tree = FolderTree::new();
        tree.set_revision(10);
        let moved = refresh(&mut tree, &remote, false).await.unwrap();
        assert!(!moved);
        assert_eq!(remote.call_count("get_changes"), 0);
    }

    /// Replaying a batch from the same starting state reproduces the same
    /// tree: a failed batch can safely be retried from the top.
    #[tokio::test]
    async fn change_batches_apply_idempotently() {
        let remote = MockRemote::new();
        remote.set_revision(10);
        remote.add_folder("abcdefghijklm", "docs", "", 10);
        remote.add_file("aaaaaaaaaaaaaaa", "readme.txt", "abcdefghijklm", 10, b"body");

        let mut tree = FolderTree::new();
        let (_dir, cache) = empty_cache();
        full_rebuild(&mut tree, &cache, &remote).await.unwrap();

        remote.update_file("aaaaaaaaaaaaaaa", 11, b"body v2");
        let batch = vec![
            DeviceChange {
                kind: ChangeKind::UpdatedFile,
                key: "aaaaaaaaaaaaaaa".into(),
                parent: "abcdefghijklm".into(),
                revision: 11,
            },
            DeviceChange {
                kind: ChangeKind::UpdatedFolder,
                key: "abcdefghijklm".into(),
                parent: "".into(),
                revision: 11,
            },
        ];

        for change in &batch {
            apply_change(&mut tree, &remote, change).await.unwrap();
        }
        let mut first = Vec::new();
        tree.store(&mut first).unwrap();

        for change in &batch {
            apply_change(&mut tree, &remote, change).await.unwrap();
        }
        let mut second = Vec::new();
        tree.store(&mut second).unwrap();

        assert_eq!(first, second);
    }

    /// A failing step aborts the batch and leaves the tree revision where
    /// it was, so the next refresh retries the same range.
    #[tokio::test]
    async fn failed_batch_keeps_the_previous_revision() {
        let remote = MockRemote::new();
        remote.set_revision(10);
        remote.add_folder("abcdefghijklm", "docs", "", 10);

        let mut tree = FolderTree::new();
        let (_dir, cache) = empty_cache();
        full_rebuild(&mut tree, &cache, &remote).await.unwrap();

        remote.set_revision(11);
        remote.push_change(ChangeKind::UpdatedFolder, "abcdefghijklm", "", 11);
        remote.fail_folder_info("abcdefghijklm", 900);

        let err = refresh(&mut tree, &remote, false).await.unwrap_err();
        assert!(matches!(err, MfError::Remote { code: 900, .. }));
        assert_eq!(tree.revision(), 10);
    }

    /// A folder updated and deleted within the same batch: the update step
    /// finds the key gone remotely and is skipped, the delete step wins.
    #[tokio::test]
    async fn update_of_a_vanished_key_is_skipped() {
        let remote = MockRemote::new();
        remote.set_revision(10);
        remote.add_folder("abcdefghijklm", "docs", "", 10);

        let mut tree = FolderTree::new();
        let (_dir, cache) = empty_cache();
        full_rebuild(&mut tree, &cache, &remote).await.unwrap();

        remote.remove_entry("abcdefghijklm");
        remote.set_revision(12);
        remote.push_change(ChangeKind::UpdatedFolder, "abcdefghijklm", "", 11);
        remote.push_change(ChangeKind::DeletedFolder, "abcdefghijklm", "", 12);

        refresh(&mut tree, &remote, false).await.unwrap();
        assert_eq!(tree.revision(), 12);
        assert!(tree.lookup_key(Some("abcdefghijklm")).is_none());
    }

    /// GC exception during a move: between the batch that detached the
    /// folder from its old parent and the one that attaches it to the new
    /// parent, housekeeping must not remove it.
    #[tokio::test]
    async fn housekeep_spares_an_entry_mid_move() {
        let remote = MockRemote::new();
        remote.set_revision(10);
        remote.add_folder("abcdefghijklm", "src", "", 10);
        remote.add_folder("bcdefghijklmn", "dst", "", 10);
        remote.add_folder("cdefghijklmno", "moving", "abcdefghijklm", 10);

        let mut tree = FolderTree::new();
        let (_dir, cache) = empty_cache();
        full_rebuild(&mut tree, &cache, &remote).await.unwrap();

        // first half of the move: the folder's own update arrives together
        // with the old parent's, the new parent's is still outstanding
        remote.set_folder_parent("cdefghijklmno", "bcdefghijklmn");
        remote.update_folder_revision("cdefghijklmno", 11);
        remote.set_revision(11);
        remote.push_change(ChangeKind::UpdatedFolder, "cdefghijklmno", "bcdefghijklmn", 11);
        remote.push_change(ChangeKind::UpdatedFolder, "abcdefghijklm", "", 11);
        refresh(&mut tree, &remote, false).await.unwrap();

        // the folder is unreferenced now, but carries the tree revision
        housekeep(&mut tree, &cache);
        assert!(tree.lookup_key(Some("cdefghijklmno")).is_some());

        // second half: the new parent picks it up
        remote.set_revision(12);
        remote.push_change(ChangeKind::UpdatedFolder, "bcdefghijklmn", "", 12);
        refresh(&mut tree, &remote, false).await.unwrap();
        assert_eq!(tree.lookup_path("/dst/moving").unwrap().key, "cdefghijklmno");
    }
}
