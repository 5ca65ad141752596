use crate::cancel::CancelToken;
use crate::dirtree::{DirEntry, DirTree, FileMode};
use crate::error::{SagaError, SagaResult};
use crate::filetree::{self, FileRef};
use crate::hash::Oid;
use crate::io::{ReadExt, WriteExt};
use crate::odb::Odb;
use crate::path::RepoPath;
use crate::repo::ADMIN_DIR;
use crate::serialize::{Deserialize, Serialize};
use rayon::prelude::*;
use std::collections::btree_map::{self, BTreeMap};
use std::io::prelude::*;
use std::path::Path;

const INDEX_TAG: u8 = 0x04;

/// external predicate deciding which workspace paths participate in a
/// scan; ignore-list enforcement lives outside the core
pub type ScanFilter<'a> = dyn Fn(&RepoPath) -> bool + Sync + 'a;

/// the metadata of one tracked file
///
/// `mtime_ns` is a rescan hint only: two entries are equal when
/// everything but the mtime matches, and `checksum` stays authoritative
#[derive(Debug, Clone, Eq)]
pub struct IndexEntry {
    pub path: RepoPath,
    pub file: FileRef,
    pub mode: FileMode,
    pub size: u64,
    pub mtime_ns: i64,
    pub checksum: Oid,
}

impl PartialEq for IndexEntry {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.file == other.file
            && self.mode == other.mode
            && self.size == other.size
            && self.checksum == other.checksum
    }
}

/// lexicographically ordered mapping of repository paths to file roots;
/// the canonical handle passed to diff and merge
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkspaceIndex {
    entries: BTreeMap<RepoPath, IndexEntry>,
}

impl WorkspaceIndex {
    pub fn insert_entry(&mut self, entry: IndexEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn remove_entry(&mut self, path: &RepoPath) -> Option<IndexEntry> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &RepoPath) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> btree_map::Values<'_, RepoPath, IndexEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &RepoPath> {
        self.entries.keys()
    }

    /// stores the canonical encoding through the object store and
    /// returns its identity
    pub fn store(&self, odb: &dyn Odb) -> SagaResult<Oid> {
        odb.put(&self.to_bytes()?)
    }

    pub fn load(odb: &dyn Odb, oid: Oid) -> SagaResult<Self> {
        Self::deserialize_from_slice(&odb.get(oid)?)
    }

    /// walks the filesystem below `root_dir` and builds file trees for
    /// every file the filter admits
    ///
    /// `prior` enables the rescan optimization: entries whose size and
    /// mtime match are reused without rehashing
    pub fn scan(
        odb: &dyn Odb,
        root_dir: &Path,
        filter: &ScanFilter<'_>,
        prior: Option<&WorkspaceIndex>,
        cancel: &CancelToken,
    ) -> SagaResult<Self> {
        let mut candidates = vec![];
        let mut walker = walkdir::WalkDir::new(root_dir).sort_by_file_name().into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry?;
            cancel.check()?;
            if entry.file_type().is_dir() {
                if entry.depth() > 0 && entry.file_name() == std::ffi::OsStr::new(ADMIN_DIR) {
                    walker.skip_current_dir();
                }
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root_dir)
                .expect("walked paths always live under the root");
            let path = RepoPath::new(relative.to_string_lossy().into_owned())?;
            if !filter(&path) {
                continue;
            }
            candidates.push((path, entry.path().to_path_buf()));
        }

        let entries = candidates
            .into_par_iter()
            .map(|(path, fs_path)| {
                cancel.check()?;
                let entry = Self::scan_file(odb, path, &fs_path, prior)?;
                Ok((entry.path.clone(), entry))
            })
            .collect::<SagaResult<BTreeMap<_, _>>>()?;

        Ok(Self { entries })
    }

    fn scan_file(
        odb: &dyn Odb,
        path: RepoPath,
        fs_path: &Path,
        prior: Option<&WorkspaceIndex>,
    ) -> SagaResult<IndexEntry> {
        let metadata = std::fs::symlink_metadata(fs_path)?;
        let mode = FileMode::from_metadata(&metadata);
        let mtime_ns = mtime_nanos(&metadata);

        if let Some(prior_entry) = prior.and_then(|prior| prior.get(&path)) {
            if prior_entry.mtime_ns == mtime_ns
                && prior_entry.size == metadata.len()
                && prior_entry.mode == mode
            {
                return Ok(IndexEntry { path, ..prior_entry.clone() });
            }
        }

        let built = if mode.is_link() {
            let target = std::fs::read_link(fs_path)?;
            filetree::build_with_checksum(odb, target.as_os_str().as_encoded_bytes())?
        } else {
            filetree::build_with_checksum(odb, std::fs::File::open(fs_path)?)?
        };

        Ok(IndexEntry {
            path,
            file: built.file,
            mode,
            size: built.file.size,
            mtime_ns,
            checksum: built.checksum,
        })
    }

    /// traverses a directory tree into the equivalent index
    ///
    /// mtimes are unknowable from a tree and recorded as zero; they do
    /// not participate in index equality
    pub fn from_tree(odb: &dyn Odb, dir_root: Oid) -> SagaResult<Self> {
        let tree = DirTree::new(odb);
        let mut entries = BTreeMap::new();
        for (path, entry) in tree.list(dir_root, None)? {
            let size = filetree::file_size(odb, entry.target)?;
            let file = FileRef { root: entry.target, size };
            let checksum = crate::hash::hash_bytes(filetree::read_all(odb, file)?);
            let index_entry =
                IndexEntry { path: path.clone(), file, mode: entry.mode, size, mtime_ns: 0, checksum };
            entries.insert(path, index_entry);
        }
        Ok(Self { entries })
    }

    /// path-level diff against another index
    pub fn diff(&self, other: &WorkspaceIndex) -> crate::diff::WorkspaceDiff {
        crate::diff::diff_indexes(self, other)
    }

    /// the inverse of `from_tree`: builds a directory tree over the
    /// index entries
    pub fn to_tree(&self, odb: &dyn Odb) -> SagaResult<Oid> {
        let tree = DirTree::new(odb);
        let mut root = tree.empty()?;
        for entry in self.iter() {
            let dir_entry =
                DirEntry::new_file(entry.path.file_name(), entry.file.root, entry.mode);
            root = tree.insert(root, &entry.path, dir_entry)?;
        }
        Ok(root)
    }
}

impl<'a> IntoIterator for &'a WorkspaceIndex {
    type IntoIter = btree_map::Values<'a, RepoPath, IndexEntry>;
    type Item = &'a IndexEntry;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Serialize for WorkspaceIndex {
    fn serialize(&self, writer: &mut dyn Write) -> SagaResult<()> {
        writer.write_u8(INDEX_TAG)?;
        writer.write_varint(self.entries.len() as u64)?;
        for entry in self.entries.values() {
            writer.write_str(entry.path.as_str())?;
            writer.write_u32(entry.mode.as_u32())?;
            writer.write_u64(entry.size)?;
            writer.write_i64(entry.mtime_ns)?;
            writer.write_oid(entry.checksum)?;
            writer.write_oid(entry.file.root)?;
            writer.write_u64(entry.file.size)?;
        }
        Ok(())
    }
}

impl Deserialize for WorkspaceIndex {
    fn deserialize(reader: &mut impl BufRead) -> SagaResult<Self> {
        let tag = reader.read_u8()?;
        if tag != INDEX_TAG {
            bail!(SagaError::Corrupt(format!("unknown index tag `{:#04x}`", tag)));
        }
        let count = reader.read_varint()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let path = RepoPath::new(reader.read_str()?)?;
            let mode = FileMode::new(reader.read_u32()?)?;
            let size = reader.read_u64()?;
            let mtime_ns = reader.read_i64()?;
            let checksum = reader.read_oid()?;
            let root = reader.read_oid()?;
            let file_size = reader.read_u64()?;
            let entry = IndexEntry {
                path: path.clone(),
                file: FileRef { root, size: file_size },
                mode,
                size,
                mtime_ns,
                checksum,
            };
            entries.insert(path, entry);
        }
        Ok(Self { entries })
    }
}

fn mtime_nanos(metadata: &std::fs::Metadata) -> i64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec()
    }
    #[cfg(not(unix))]
    {
        metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|duration| duration.as_nanos() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests;
