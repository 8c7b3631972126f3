//! In-memory mirror of the remote directory hierarchy.
//!
//! The tree is a hashtable of entries keyed by the remote's opaque object
//! keys plus a root entry that has no key of its own. Folder and file keys
//! are base-36 strings, so the table uses the base-36 decoding of the first
//! three key characters as the bucket index: 36^3 buckets with tiny,
//! near-uniformly filled bucket vectors, and no general-purpose hash.
//!
//! Folders reference their children by key, not by pointer; every traversal
//! resolves through the table. A child key may transiently dangle (the
//! entry was removed but a stale parent still lists it) or an entry may be
//! transiently unreferenced (mid-move); both states are cleaned up by the
//! mark-and-sweep in `sweep_unreferenced`, which spares unreferenced
//! entries whose revision equals the tree revision because they may be
//! between the two halves of a move.
//!
//! The whole tree can be stored to and loaded from a compact binary
//! snapshot (magic `MFS`, version 0) where children are expressed as
//! indices into the serialized entry array.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::api_client::{RemoteFile, RemoteFolder};
use crate::error::{MfError, MfResult};

const NUM_BUCKETS: usize = 36 * 36 * 36;

const SNAPSHOT_MAGIC: &[u8; 3] = b"MFS";
const SNAPSHOT_VERSION: u8 = 0;

const KEY_BYTES: usize = 16;
const NAME_BYTES: usize = 256;

/// Decode one base-36 character; anything outside `[0-9a-z]` counts as 0,
/// which keeps the function total without affecting correctness (the
/// result is only a bucket index).
fn base36(c: u8) -> usize {
    match c {
        b'0'..=b'9' => (c - b'0') as usize,
        b'a'..=b'z' => (c - b'a') as usize + 10,
        _ => 0,
    }
}

fn bucket_index(key: &str) -> usize {
    let b = key.as_bytes();
    let (x, y, z) = (
        b.first().copied().unwrap_or(0),
        b.get(1).copied().unwrap_or(0),
        b.get(2).copied().unwrap_or(0),
    );
    base36(x) * 36 * 36 + base36(y) * 36 + base36(z)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Folder { children: Vec<String> },
    File { hash: [u8; 32], size: u64 },
}

/// A uniform record for files and folders, distinguished by `kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Opaque remote key: 13 characters for folders, 15 (or 11 for legacy
    /// files) for files. Empty for the root.
    pub key: String,
    pub name: String,
    pub revision: u64,
    /// Creation time, seconds since the epoch.
    pub created: u64,
    /// Transient mark for the sweep; never persisted.
    visited: bool,
    pub kind: EntryKind,
}

impl Entry {
    fn folder(key: &str, name: &str, revision: u64, created: u64) -> Entry {
        Entry {
            key: key.to_string(),
            name: name.to_string(),
            revision,
            created,
            visited: false,
            kind: EntryKind::Folder { children: Vec::new() },
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    pub fn is_folder(&self) -> bool {
        !self.is_file()
    }

    /// Child keys; empty for files.
    pub fn children(&self) -> &[String] {
        match &self.kind {
            EntryKind::Folder { children } => children,
            EntryKind::File { .. } => &[],
        }
    }

    pub fn file_size(&self) -> u64 {
        match &self.kind {
            EntryKind::File { size, .. } => *size,
            EntryKind::Folder { .. } => 0,
        }
    }

    pub fn file_hash(&self) -> Option<&[u8; 32]> {
        match &self.kind {
            EntryKind::File { hash, .. } => Some(hash),
            EntryKind::Folder { .. } => None,
        }
    }
}

pub struct FolderTree {
    revision: u64,
    buckets: Vec<Vec<Entry>>,
    root: Entry,
}

impl FolderTree {
    pub fn new() -> FolderTree {
        FolderTree {
            revision: 0,
            buckets: vec![Vec::new(); NUM_BUCKETS],
            root: Entry::folder("", "", 0, 0),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    /// Drop every entry and the root's children, keeping the revision.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.root.kind = EntryKind::Folder { children: Vec::new() };
    }

    pub fn entry_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.buckets.iter().flatten()
    }

    /// Look up an entry by key. `None` addresses the root.
    pub fn lookup_key(&self, key: Option<&str>) -> Option<&Entry> {
        match key {
            None => Some(&self.root),
            Some("") => Some(&self.root),
            Some(key) => self.buckets[bucket_index(key)]
                .iter()
                .find(|e| e.key == key),
        }
    }

    fn lookup_key_mut(&mut self, key: Option<&str>) -> Option<&mut Entry> {
        match key {
            None => Some(&mut self.root),
            Some("") => Some(&mut self.root),
            Some(key) => self.buckets[bucket_index(key)]
                .iter_mut()
                .find(|e| e.key == key),
        }
    }

    /// Insert a new file entry or update the existing one in place.
    pub fn add_or_update_file(&mut self, file: &RemoteFile) -> MfResult<()> {
        let hash = decode_hash(&file.hash)?;
        let kind = EntryKind::File { hash, size: file.size };

        if let Some(entry) = self.lookup_key_mut(Some(&file.quickkey)) {
            entry.name = file.name.clone();
            entry.revision = file.revision;
            entry.created = file.created;
            entry.kind = kind;
            return Ok(());
        }

        self.buckets[bucket_index(&file.quickkey)].push(Entry {
            key: file.quickkey.clone(),
            name: file.name.clone(),
            revision: file.revision,
            created: file.created,
            visited: false,
            kind,
        });
        Ok(())
    }

    /// Insert a new folder entry or update the existing one in place; the
    /// children list of an existing folder is preserved. An empty key
    /// addresses the root.
    pub fn add_or_update_folder(&mut self, folder: &RemoteFolder) -> MfResult<()> {
        let key = if folder.folderkey.is_empty() { None } else { Some(folder.folderkey.as_str()) };

        if let Some(entry) = self.lookup_key_mut(key) {
            entry.name = folder.name.clone();
            entry.revision = folder.revision;
            entry.created = folder.created;
            if entry.is_file() {
                // the key changed type remotely; start with an empty folder
                entry.kind = EntryKind::Folder { children: Vec::new() };
            }
            return Ok(());
        }

        let entry = Entry::folder(&folder.folderkey, &folder.name, folder.revision, folder.created);
        self.buckets[bucket_index(&folder.folderkey)].push(entry);
        Ok(())
    }

    /// Replace a folder's children list. The referenced entries stay owned
    /// by the table and may still be listed by other folders (reparenting
    /// in flight). Duplicates are dropped.
    pub fn set_children(&mut self, key: Option<&str>, mut children: Vec<String>) -> MfResult<()> {
        let mut seen = std::collections::HashSet::new();
        children.retain(|k| seen.insert(k.clone()));
        let entry = self.lookup_key_mut(key).ok_or(MfError::NotFound)?;
        match &mut entry.kind {
            EntryKind::Folder { children: slot } => {
                *slot = children;
                Ok(())
            }
            EntryKind::File { .. } => Err(MfError::NotADirectory(entry.key.clone())),
        }
    }

    /// Remove the entry with `key` together with its children list. Stale
    /// references from other folders become dangling and are cleaned up by
    /// the next sweep. Removing an unknown key is a no-op.
    pub fn remove(&mut self, key: &str) {
        if key.is_empty() {
            warn!("refusing to remove the root");
            return;
        }
        self.buckets[bucket_index(key)].retain(|e| e.key != key);
    }

    /// Resolve an absolute path to its entry. The path must begin with "/";
    /// resolution fails with `NotADirectory` if a non-terminal component is
    /// a file and with `NotFound` if a component is missing.
    pub fn lookup_path(&self, path: &str) -> MfResult<&Entry> {
        if !path.starts_with('/') {
            return Err(MfError::NotFound);
        }

        let mut current: Option<String> = None;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let folder = self.lookup_key(current.as_deref()).ok_or(MfError::NotFound)?;
            if folder.is_file() {
                return Err(MfError::NotADirectory(path.to_string()));
            }
            let mut next = None;
            for child_key in folder.children() {
                // dangling child keys are skipped until the sweep prunes them
                if let Some(child) = self.lookup_key(Some(child_key)) {
                    if child.name == segment {
                        next = Some(child.key.clone());
                        break;
                    }
                }
            }
            current = Some(next.ok_or(MfError::NotFound)?);
        }

        self.lookup_key(current.as_deref()).ok_or(MfError::NotFound)
    }

    /// Mark-and-sweep over the table rooted at the root entry.
    ///
    /// Unreferenced entries are removed unless their revision equals the
    /// tree revision: such entries may be mid-move, with the old parent's
    /// children already rewritten and the new parent's not yet. Dangling
    /// child keys left behind by `remove` are pruned as well. Returns the
    /// keys of the removed entries.
    pub fn sweep_unreferenced(&mut self) -> Vec<String> {
        for bucket in &mut self.buckets {
            for entry in bucket.iter_mut() {
                entry.visited = false;
            }
        }

        // walk from the root, marking reachable entries
        let mut stack: Vec<String> = self.root.children().to_vec();
        while let Some(key) = stack.pop() {
            if let Some(entry) = self.lookup_key_mut(Some(&key)) {
                if entry.visited {
                    continue;
                }
                entry.visited = true;
                stack.extend(entry.children().iter().cloned());
            }
        }

        let tree_revision = self.revision;
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            bucket.retain(|entry| {
                if entry.visited || entry.revision == tree_revision {
                    true
                } else {
                    debug!(key = %entry.key, name = %entry.name, "sweeping unreferenced entry");
                    removed.push(entry.key.clone());
                    false
                }
            });
        }

        self.prune_dangling_children();

        for bucket in &mut self.buckets {
            for entry in bucket.iter_mut() {
                entry.visited = false;
            }
        }

        removed
    }

    fn prune_dangling_children(&mut self) {
        let live: std::collections::HashSet<String> = self
            .entries()
            .map(|e| e.key.clone())
            .collect();
        let prune = |kind: &mut EntryKind| {
            if let EntryKind::Folder { children } = kind {
                children.retain(|k| live.contains(k));
            }
        };
        prune(&mut self.root.kind);
        for bucket in &mut self.buckets {
            for entry in bucket.iter_mut() {
                prune(&mut entry.kind);
            }
        }
    }

    /// Serialize the tree: header, fixed-size entry records (root first),
    /// then per-entry child lists as indices into the record array.
    pub fn store(&self, w: &mut impl Write) -> MfResult<()> {
        let order: Vec<&Entry> =
            std::iter::once(&self.root).chain(self.entries()).collect();
        let index_of: std::collections::HashMap<&str, u64> = order
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.as_str(), i as u64))
            .collect();

        // resolve child keys up front so the record counts match the arrays
        let children: Vec<Vec<u64>> = order
            .iter()
            .map(|e| {
                e.children()
                    .iter()
                    .filter_map(|k| index_of.get(k.as_str()).copied())
                    .collect()
            })
            .collect();

        w.write_all(SNAPSHOT_MAGIC)?;
        w.write_u8(SNAPSHOT_VERSION)?;
        w.write_u64::<LittleEndian>(self.revision)?;
        w.write_u64::<LittleEndian>(order.len() as u64)?;

        for (entry, kids) in order.iter().zip(&children) {
            write_padded(w, entry.key.as_bytes(), KEY_BYTES)?;
            write_padded(w, entry.name.as_bytes(), NAME_BYTES)?;
            w.write_u64::<LittleEndian>(entry.revision)?;
            w.write_u64::<LittleEndian>(entry.created)?;
            // atime doubles as the on-disk file/folder discriminator
            w.write_u64::<LittleEndian>(if entry.is_file() { 1 } else { 0 })?;
            w.write_all(entry.file_hash().unwrap_or(&[0u8; 32]))?;
            w.write_u64::<LittleEndian>(entry.file_size())?;
            w.write_u64::<LittleEndian>(kids.len() as u64)?;
        }

        for kids in &children {
            w.write_u64::<LittleEndian>(kids.len() as u64)?;
            for index in kids {
                w.write_u64::<LittleEndian>(*index)?;
            }
        }

        Ok(())
    }

    /// The inverse of `store`. Rejects a bad magic, an unknown version and
    /// out-of-range child indices.
    pub fn load(r: &mut impl Read) -> MfResult<FolderTree> {
        let mut magic = [0u8; 3];
        r.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(MfError::corrupt("snapshot magic mismatch"));
        }
        let version = r.read_u8()?;
        if version != SNAPSHOT_VERSION {
            return Err(MfError::corrupt(format!("unknown snapshot version {version}")));
        }

        let revision = r.read_u64::<LittleEndian>()?;
        let count = r.read_u64::<LittleEndian>()? as usize;
        if count == 0 {
            return Err(MfError::corrupt("snapshot without a root record"));
        }

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let key = read_padded(r, KEY_BYTES)?;
            let name = read_padded(r, NAME_BYTES)?;
            let entry_revision = r.read_u64::<LittleEndian>()?;
            let created = r.read_u64::<LittleEndian>()?;
            let atime = r.read_u64::<LittleEndian>()?;
            let mut hash = [0u8; 32];
            r.read_exact(&mut hash)?;
            let size = r.read_u64::<LittleEndian>()?;
            let num_children = r.read_u64::<LittleEndian>()?;

            let kind = if atime != 0 {
                EntryKind::File { hash, size }
            } else {
                EntryKind::Folder { children: Vec::new() }
            };
            records.push((
                Entry { key, name, revision: entry_revision, created, visited: false, kind },
                num_children,
            ));
        }

        for i in 0..count {
            let declared = records[i].1;
            let stored = r.read_u64::<LittleEndian>()?;
            if stored != declared {
                return Err(MfError::corrupt("child count mismatch"));
            }
            let mut keys = Vec::with_capacity(stored as usize);
            for _ in 0..stored {
                let index = r.read_u64::<LittleEndian>()? as usize;
                if index >= count {
                    return Err(MfError::corrupt("child index out of range"));
                }
                keys.push(records[index].0.key.clone());
            }
            if let EntryKind::Folder { children } = &mut records[i].0.kind {
                *children = keys;
            } else if stored != 0 {
                return Err(MfError::corrupt("file record with children"));
            }
        }

        let mut tree = FolderTree::new();
        tree.revision = revision;
        let mut records = records.into_iter().map(|(e, _)| e);
        let Some(root) = records.next() else {
            return Err(MfError::corrupt("snapshot without a root record"));
        };
        if root.is_file() || !root.key.is_empty() {
            return Err(MfError::corrupt("first snapshot record is not the root"));
        }
        tree.root = root;
        for entry in records {
            if entry.key.is_empty() {
                return Err(MfError::corrupt("non-root record without a key"));
            }
            tree.buckets[bucket_index(&entry.key)].push(entry);
        }
        Ok(tree)
    }
}

fn decode_hash(hash: &str) -> MfResult<[u8; 32]> {
    let raw = hex::decode(hash)
        .map_err(|e| MfError::corrupt(format!("bad hash encoding: {e}")))?;
    raw.try_into()
        .map_err(|_| MfError::corrupt(format!("hash has wrong length: {hash}")))
}

fn write_padded(w: &mut impl Write, data: &[u8], width: usize) -> MfResult<()> {
    if data.len() > width {
        return Err(MfError::corrupt("field too long for snapshot record"));
    }
    w.write_all(data)?;
    let padding = [0u8; NAME_BYTES];
    w.write_all(&padding[..width - data.len()])?;
    Ok(())
}

fn read_padded(r: &mut impl Read, width: usize) -> MfResult<String> {
    let mut buf = vec![0u8; width];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(width);
    buf.truncate(end);
    String::from_utf8(buf).map_err(|e| MfError::corrupt(format!("invalid utf-8 in snapshot: {e}")))
}
