use tracing::debug;

use super::prelude::*;

/// Rename decomposes into up to two remote operations: a move when the
/// parent changed and a rename when the basename changed, each in its
/// file or folder variant. The tree is only updated through the refresh
/// that follows the acknowledgement.
pub(super) fn do_rename<R: Remote>(
    fs: &mut MediaFs<R>,
    parent: u64,
    name: &str,
    newparent: u64,
    newname: &str,
) -> MfResult<()> {
    let old_parent_path = fs.resolve(parent)?;
    let new_parent_path = fs.resolve(newparent)?;
    let old_path = full_path(&old_parent_path, name);
    let new_path = full_path(&new_parent_path, newname);

    let (key, is_file) = {
        let entry = fs.tree.lookup_path(&old_path)?;
        (entry.key.clone(), entry.is_file())
    };
    if key.is_empty() {
        return Err(MfError::NotFound);
    }

    if old_parent_path != new_parent_path {
        let dest_key = {
            let entry = fs.tree.lookup_path(&new_parent_path)?;
            if entry.is_file() {
                return Err(MfError::NotADirectory(new_parent_path.clone()));
            }
            (!entry.key.is_empty()).then(|| entry.key.clone())
        };
        debug!(%old_path, %new_path, "moving between folders");
        if is_file {
            fs.runtime
                .block_on(fs.remote.file_move(&key, dest_key.as_deref()))?;
        } else {
            fs.runtime
                .block_on(fs.remote.folder_move(&key, dest_key.as_deref()))?;
        }
    }

    if name != newname {
        debug!(%old_path, newname, "renaming");
        if is_file {
            fs.runtime.block_on(fs.remote.file_rename(&key, newname))?;
        } else {
            fs.runtime.block_on(fs.remote.folder_rename(&key, newname))?;
        }
    }

    fs.remap_path(&old_path, &new_path);
    fs.refresh_expecting_changes();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn rename<R: Remote>(
    fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    parent: u64,
    name: &OsStr,
    newparent: u64,
    newname: &OsStr,
    _flags: u32,
    reply: ReplyEmpty,
) {
    let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
        reply.error(ENOENT);
        return;
    };
    match do_rename(fs, parent, name, newparent, newname) {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.errno()),
    }
}
