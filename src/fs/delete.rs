use super::prelude::*;

/// Delete a file: issue the remote call, then let the change log confirm.
pub(super) fn do_unlink<R: Remote>(fs: &mut MediaFs<R>, parent: u64, name: &str) -> MfResult<()> {
    let parent_path = fs.resolve(parent)?;
    let path = full_path(&parent_path, name);

    let key = {
        let entry = fs.tree.lookup_path(&path)?;
        if entry.is_folder() {
            // directories go through rmdir
            return Err(MfError::Unsupported);
        }
        entry.key.clone()
    };

    fs.runtime.block_on(fs.remote.file_delete(&key))?;
    fs.forget_path(&path);
    fs.refresh_expecting_changes();
    Ok(())
}

pub fn unlink<R: Remote>(
    fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    parent: u64,
    name: &OsStr,
    reply: ReplyEmpty,
) {
    let Some(name) = name.to_str() else {
        reply.error(ENOENT);
        return;
    };
    match do_unlink(fs, parent, name) {
        Ok(()) => reply.ok(),
        Err(MfError::Unsupported) => reply.error(EISDIR),
        Err(e) => reply.error(e.errno()),
    }
}

/// Delete an empty folder.
pub(super) fn do_rmdir<R: Remote>(fs: &mut MediaFs<R>, parent: u64, name: &str) -> MfResult<()> {
    let parent_path = fs.resolve(parent)?;
    let path = full_path(&parent_path, name);

    let key = {
        let entry = fs.tree.lookup_path(&path)?;
        if entry.is_file() {
            return Err(MfError::NotADirectory(path.clone()));
        }
        if entry.key.is_empty() {
            // the root cannot be removed
            return Err(MfError::Unsupported);
        }
        entry.key.clone()
    };

    fs.runtime.block_on(fs.remote.folder_delete(&key))?;
    fs.forget_path(&path);
    fs.refresh_expecting_changes();
    Ok(())
}

/// True while the mirror lists children for the directory.
fn has_children<R: Remote>(fs: &MediaFs<R>, parent: u64, name: &str) -> MfResult<bool> {
    let parent_path = fs.resolve(parent)?;
    let path = full_path(&parent_path, name);
    let entry = fs.tree.lookup_path(&path)?;
    Ok(!entry.children().is_empty())
}

pub fn rmdir<R: Remote>(
    fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    parent: u64,
    name: &OsStr,
    reply: ReplyEmpty,
) {
    let Some(name) = name.to_str() else {
        reply.error(ENOENT);
        return;
    };
    // the remote would happily delete a folder with contents; POSIX says no
    match has_children(fs, parent, name) {
        Ok(true) => {
            reply.error(ENOTEMPTY);
            return;
        }
        Ok(false) => {}
        Err(e) => {
            reply.error(e.errno());
            return;
        }
    }
    match do_rmdir(fs, parent, name) {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.errno()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testfs;
    use crate::testutil::MockRemote;

    fn remote_with_tree() -> MockRemote {
        let remote = MockRemote::new();
        remote.set_revision(10);
        remote.add_folder("abcdefghijklm", "docs", "", 10);
        remote.add_folder("bcdefghijklmn", "empty", "", 10);
        remote.add_file("aaaaaaaaaaaaaaa", "inside.txt", "abcdefghijklm", 10, b"x");
        remote
    }

    #[test]
    fn unlink_issues_the_remote_delete() {
        let (_dir, mut fs) = testfs::mount(remote_with_tree());
        let docs = fs.inode_for("/docs");
        do_unlink(&mut fs, docs, "inside.txt").unwrap();
        assert_eq!(fs.remote.call_count("file_delete"), 1);
    }

    #[test]
    fn unlink_of_a_folder_is_refused() {
        let (_dir, mut fs) = testfs::mount(remote_with_tree());
        assert!(matches!(do_unlink(&mut fs, 1, "docs"), Err(MfError::Unsupported)));
        assert_eq!(fs.remote.call_count("file_delete"), 0);
    }

    #[test]
    fn rmdir_refuses_a_folder_with_contents() {
        let (_dir, mut fs) = testfs::mount(remote_with_tree());
        assert_eq!(has_children(&fs, 1, "docs").unwrap(), true);
        assert_eq!(has_children(&fs, 1, "empty").unwrap(), false);
    }

    #[test]
    fn rmdir_of_an_empty_folder_succeeds() {
        let (_dir, mut fs) = testfs::mount(remote_with_tree());
        do_rmdir(&mut fs, 1, "empty").unwrap();
        assert_eq!(fs.remote.call_count("folder_delete"), 1);
    }

    #[test]
    fn unlink_of_a_missing_name_is_not_found() {
        let (_dir, mut fs) = testfs::mount(remote_with_tree());
        assert!(matches!(do_unlink(&mut fs, 1, "ghost.txt"), Err(MfError::NotFound)));
    }
}
