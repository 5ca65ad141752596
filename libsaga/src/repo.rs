use crate::cancel::CancelToken;
use crate::commit::{Commit, Signature};
use crate::db::MetaDb;
use crate::error::{SagaError, SagaResult};
use crate::hash::Oid;
use crate::index::WorkspaceIndex;
use crate::lockfile::{Lockfile, LockfileFlags};
use crate::mmr;
use crate::names::seal_name;
use crate::odb::{LooseOdb, Odb};
use crate::path::RepoPath;
use crate::refs::{RefKind, RefStore};
use crate::shelf::ShelfStore;
use crate::time::Timestamp;
use anyhow::Context;
use log::debug;
use smallvec::{smallvec, SmallVec};
use std::io::prelude::*;
use std::path::{Path, PathBuf};

/// the administrative directory; never recorded inside tracked trees
pub const ADMIN_DIR: &str = ".saga";

const OBJECTS_DIR: &str = "objects";
const DB_FILE: &str = "metadata.db";
const STAGE_FILE: &str = "stage/files";
const HEAD_FILE: &str = "HEAD";
const MERGE_DIR: &str = "merge";

pub const DEFAULT_TIMELINE: &str = "main";

/// a repository handle: the workspace root plus the object store and
/// metadata database living under the administrative directory
pub struct SagaRepo {
    root: PathBuf,
    odb: LooseOdb,
    db: MetaDb,
}

impl SagaRepo {
    /// initializes a fresh repository at `root`: the administrative
    /// layout, the default timeline with a zero tip, and head
    pub fn init(root: impl AsRef<Path>) -> SagaResult<Self> {
        let root = root.as_ref().to_path_buf();
        let admin = root.join(ADMIN_DIR);
        if admin.exists() {
            bail!(SagaError::AlreadyExists(format!("repository at `{}`", root.display())));
        }
        debug!("SagaRepo::init(root: {})", root.display());
        std::fs::create_dir_all(admin.join(OBJECTS_DIR))?;
        std::fs::create_dir_all(admin.join(MERGE_DIR))?;
        std::fs::create_dir_all(admin.join("stage"))?;
        std::fs::create_dir_all(admin.join("shelves"))?;

        let repo = Self::open_at(root)?;
        repo.refs().create(DEFAULT_TIMELINE, RefKind::LocalTimeline, Oid::ZERO, "")?;
        repo.refs().set_current_timeline(DEFAULT_TIMELINE)?;
        repo.write_stage_file(&[])?;
        repo.write_head_mirror(DEFAULT_TIMELINE)?;
        Ok(repo)
    }

    /// opens an existing repository, searching upwards from `start` for
    /// the administrative directory
    pub fn open(start: impl AsRef<Path>) -> SagaResult<Self> {
        let start = start.as_ref();
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir.join(ADMIN_DIR).is_dir() {
                return Self::open_at(dir.to_path_buf());
            }
            current = dir.parent();
        }
        bail!(SagaError::NotFound(format!("no repository above `{}`", start.display())))
    }

    fn open_at(root: PathBuf) -> SagaResult<Self> {
        let admin = root.join(ADMIN_DIR);
        let odb = LooseOdb::new(admin.join(OBJECTS_DIR))?;
        let db = MetaDb::open(admin.join(DB_FILE))
            .with_context(|| format!("failed to open metadata database at `{}`", root.display()))?;
        Ok(Self { root, odb, db })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn odb(&self) -> &dyn Odb {
        &self.odb
    }

    #[inline]
    pub fn db(&self) -> &MetaDb {
        &self.db
    }

    pub fn refs(&self) -> RefStore<'_> {
        RefStore::new(&self.db)
    }

    pub fn shelves(&self) -> ShelfStore<'_> {
        ShelfStore::new(&self.db)
    }

    fn admin_path(&self, relative: &str) -> PathBuf {
        self.root.join(ADMIN_DIR).join(relative)
    }

    // the staged-path set: one repository-relative path per line

    pub fn staged_paths(&self) -> SagaResult<Vec<RepoPath>> {
        let path = self.admin_path(STAGE_FILE);
        if !path.exists() {
            return Ok(vec![]);
        }
        let mut paths = vec![];
        for line in std::fs::read_to_string(path)?.lines() {
            if line.is_empty() {
                continue;
            }
            paths.push(RepoPath::new(line)?);
        }
        Ok(paths)
    }

    /// adds paths to the staged set
    pub fn stage_paths(&self, paths: &[RepoPath]) -> SagaResult<()> {
        let mut staged = self.staged_paths()?;
        for path in paths {
            if !staged.contains(path) {
                staged.push(path.clone());
            }
        }
        staged.sort();
        self.write_stage_file(&staged)
    }

    /// replaces the staged set wholesale (shelf restoration)
    pub fn set_staged_paths(&self, paths: &[RepoPath]) -> SagaResult<()> {
        self.write_stage_file(paths)
    }

    pub fn clear_staged_paths(&self) -> SagaResult<()> {
        self.write_stage_file(&[])
    }

    fn write_stage_file(&self, paths: &[RepoPath]) -> SagaResult<()> {
        Lockfile::with_mut(self.admin_path(STAGE_FILE), LockfileFlags::empty(), |lockfile| {
            for path in paths {
                writeln!(lockfile, "{}", path)?;
            }
            Ok(())
        })
    }

    /// debugging mirror of the head bucket
    fn write_head_mirror(&self, timeline: &str) -> SagaResult<()> {
        Lockfile::with_mut(self.admin_path(HEAD_FILE), LockfileFlags::SET_READONLY, |lockfile| {
            writeln!(lockfile, "{}", timeline)?;
            Ok(())
        })
    }

    pub(crate) fn set_head(&self, timeline: &str) -> SagaResult<()> {
        self.refs().set_current_timeline(timeline)?;
        self.write_head_mirror(timeline)
    }

    // commits

    /// the current timeline and its tip (zero for an empty timeline)
    pub fn current_tip(&self) -> SagaResult<(String, Oid)> {
        let timeline = self.refs().current_timeline()?;
        let tip = self.refs().get(&timeline, RefKind::LocalTimeline)?.primary;
        Ok((timeline, tip))
    }

    pub fn read_commit(&self, oid: Oid) -> SagaResult<Commit> {
        Commit::read(self.odb(), oid)
    }

    /// the workspace index equivalent to a commit's tree; a zero commit
    /// yields the empty index
    pub fn commit_index(&self, commit: Oid) -> SagaResult<WorkspaceIndex> {
        if commit.is_zero() {
            return Ok(WorkspaceIndex::default());
        }
        let commit = self.read_commit(commit)?;
        WorkspaceIndex::from_tree(self.odb(), commit.tree)
    }

    /// creates a commit over `tree`: stores the commit bytes, appends
    /// the mmr leaf, records lifting pointers, indexes the seal name,
    /// and optionally moves a timeline tip, all in one transaction
    ///
    /// ordering within the transaction: commit stored, then mmr leaf
    /// appended, then ref updated
    pub fn create_commit(
        &self,
        tree: Oid,
        parents: SmallVec<[Oid; 2]>,
        author: Signature,
        committer: Signature,
        message: &str,
        update_timeline: Option<&str>,
    ) -> SagaResult<Oid> {
        let txn = self.db.begin_write()?;
        let mmr_index = mmr::leaf_count_within(&txn)?;
        let now = Timestamp::now();
        let commit = Commit {
            tree,
            parents,
            author,
            committer,
            author_time: now,
            commit_time: now,
            mmr_index,
            message: message.to_owned(),
        };
        let oid = commit.store(self.odb())?;
        debug!("SagaRepo::create_commit(..) :: oid = {}, mmr_index = {}", oid, mmr_index);

        let appended = mmr::append(&txn, oid)?;
        debug_assert_eq!(appended, mmr_index);
        mmr::record_ancestors(&txn, oid, commit.first_parent())?;
        RefStore::store_seal_name_within(&txn, &seal_name(oid), oid, message)?;
        if let Some(timeline) = update_timeline {
            RefStore::update_within(&txn, timeline, RefKind::LocalTimeline, oid)?;
        }
        txn.commit()?;
        Ok(oid)
    }

    /// captures the workspace: scans, builds the tree, and commits it
    /// onto the current timeline; clears the staged set on success
    pub fn seal_workspace(
        &self,
        message: &str,
        author: Signature,
        cancel: &CancelToken,
    ) -> SagaResult<Oid> {
        let (timeline, tip) = self.current_tip()?;
        let index = self.scan_workspace(cancel)?;
        let tree = index.to_tree(self.odb())?;
        let parents = if tip.is_zero() { SmallVec::new() } else { smallvec![tip] };
        let oid = self.create_commit(
            tree,
            parents,
            author.clone(),
            author,
            message,
            Some(&timeline),
        )?;
        self.clear_staged_paths()?;
        Ok(oid)
    }

    /// scans the workspace with the accept-everything filter
    pub fn scan_workspace(&self, cancel: &CancelToken) -> SagaResult<WorkspaceIndex> {
        WorkspaceIndex::scan(self.odb(), &self.root, &|_: &RepoPath| true, None, cancel)
    }

    /// creates a timeline pointing at the current tip
    pub fn create_timeline(&self, name: &str, description: &str) -> SagaResult<()> {
        let (_, tip) = self.current_tip()?;
        self.refs().create(name, RefKind::LocalTimeline, tip, description)
    }

    /// lowest common ancestor of two commits along their first-parent
    /// chains, answered through the mmr lifting index
    pub fn lowest_common_ancestor(&self, a: Oid, b: Oid) -> SagaResult<Option<Oid>> {
        mmr::lowest_common_ancestor(&self.db, a, b)
    }

    pub fn seal_name_of(&self, commit: Oid) -> String {
        seal_name(commit)
    }
}

#[cfg(test)]
mod tests;
