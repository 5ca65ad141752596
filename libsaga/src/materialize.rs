use crate::cancel::CancelToken;
use crate::db::MATERIALIZE_STATE;
use crate::diff::{diff_indexes, ChangeKind, FileChange};
use crate::error::{SagaError, SagaResult};
use crate::filetree;
use crate::hash::Oid;
use crate::index::{IndexEntry, WorkspaceIndex};
use crate::io::{ReadExt, WriteExt};
use crate::path::RepoPath;
use crate::refs::RefKind;
use crate::repo::{SagaRepo, ADMIN_DIR};
use crate::shelf::ShelfEntry;
use crate::time::Timestamp;
use log::{debug, trace};
use std::io::prelude::*;
use std::path::Path;

#[derive(Debug, Default)]
pub struct MaterializeOpts {
    pub strategy: MaterializeStrategy,
}

impl MaterializeOpts {
    pub fn forced() -> Self {
        Self { strategy: MaterializeStrategy::Force }
    }

    pub fn is_force(&self) -> bool {
        self.strategy == MaterializeStrategy::Force
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaterializeStrategy {
    #[default]
    Safe,
    Force,
}

/// drives minimal-diff workspace updates
///
/// not transactional across files: a recovery marker is persisted
/// before any file operation so a repeat invocation converges to the
/// same target
pub struct Materializer<'a> {
    repo: &'a SagaRepo,
    opts: MaterializeOpts,
    cancel: CancelToken,
}

impl SagaRepo {
    pub fn materializer(&self) -> Materializer<'_> {
        Materializer { repo: self, opts: MaterializeOpts::default(), cancel: CancelToken::new() }
    }

    pub fn materializer_with(&self, opts: MaterializeOpts, cancel: CancelToken) -> Materializer<'_> {
        Materializer { repo: self, opts, cancel }
    }
}

impl Materializer<'_> {
    /// the scanned state of the working directory right now
    pub fn current_state(&self) -> SagaResult<WorkspaceIndex> {
        self.repo.scan_workspace(&self.cancel)
    }

    /// makes the workspace match `to`, given that it currently matches
    /// `from`; refuses to overwrite untracked files unless forced
    pub fn apply(&self, from: &WorkspaceIndex, to: &WorkspaceIndex) -> SagaResult<()> {
        let diff = diff_indexes(from, to);
        if diff.is_empty() {
            return Ok(());
        }

        if !self.opts.is_force() {
            let conflicts = self.collect_conflicts(&diff.changes)?;
            if !conflicts.is_empty() {
                bail!(SagaError::WorkspaceConflict(conflicts));
            }
        }

        // deletions first so directory/file swaps never collide
        for change in diff.iter() {
            self.cancel.check()?;
            match change.kind {
                ChangeKind::Removed => self.delete_file(&change.path)?,
                ChangeKind::Added | ChangeKind::Modified => {}
            }
        }
        for change in diff.iter() {
            self.cancel.check()?;
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    let entry = change.new.as_ref().expect("additions carry a new entry");
                    self.write_file(entry)?;
                }
                ChangeKind::Removed => {}
            }
        }
        Ok(())
    }

    /// untracked files an addition would overwrite; identical content
    /// is not a conflict, it simply becomes tracked
    fn collect_conflicts(&self, changes: &[FileChange]) -> SagaResult<Vec<RepoPath>> {
        let mut conflicts = vec![];
        for change in changes {
            if change.kind != ChangeKind::Added {
                continue;
            }
            let fs_path = change.path.to_fs_path(self.repo.root());
            if !fs_path.exists() {
                continue;
            }
            let entry = change.new.as_ref().expect("additions carry a new entry");
            let on_disk = crate::hash::hash_bytes(std::fs::read(&fs_path)?);
            if on_disk != entry.checksum {
                conflicts.push(change.path.clone());
            }
        }
        Ok(conflicts)
    }

    fn delete_file(&self, path: &RepoPath) -> SagaResult<()> {
        let fs_path = path.to_fs_path(self.repo.root());
        trace!("Materializer::delete_file({})", path);
        match std::fs::remove_file(&fs_path) {
            Ok(()) => {}
            // converging reruns may find the file already gone
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.remove_empty_parents(&fs_path)
    }

    /// removes directories emptied by deletions, walking up to the
    /// workspace root; the administrative directory is never touched
    fn remove_empty_parents(&self, fs_path: &Path) -> SagaResult<()> {
        let root = self.repo.root();
        let mut current = fs_path.parent();
        while let Some(dir) = current {
            if dir == root || dir.file_name() == Some(std::ffi::OsStr::new(ADMIN_DIR)) {
                break;
            }
            match std::fs::remove_dir(dir) {
                Ok(()) => {}
                // not empty or already gone; either way stop climbing
                Err(..) => break,
            }
            current = dir.parent();
        }
        Ok(())
    }

    fn write_file(&self, entry: &IndexEntry) -> SagaResult<()> {
        let fs_path = entry.path.to_fs_path(self.repo.root());
        trace!("Materializer::write_file({})", entry.path);
        if let Some(parent) = fs_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&fs_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let bytes = filetree::read_all(self.repo.odb(), entry.file)?;
        if entry.mode.is_link() {
            #[cfg(unix)]
            {
                use std::ffi::OsStr;
                use std::os::unix::ffi::OsStrExt;
                std::os::unix::fs::symlink(OsStr::from_bytes(&bytes), &fs_path)?;
            }
            #[cfg(not(unix))]
            std::fs::write(&fs_path, &bytes)?;
        } else {
            let mut file = std::fs::File::create(&fs_path)?;
            file.write_all(&bytes)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(std::fs::Permissions::from_mode(
                    entry.mode.as_u32() & 0o777,
                ))?;
            }
        }
        Ok(())
    }

    /// switches to `name`: shelves uncommitted work on the departing
    /// timeline, applies the minimal diff to the target tip, moves
    /// head, and restores the target's shelf if one is waiting
    pub fn materialize_timeline(&self, name: &str, auto_shelf: bool) -> SagaResult<()> {
        let repo = self.repo;
        let target_ref = repo.refs().get(name, RefKind::LocalTimeline)?;
        let (departing, departing_tip) = repo.current_tip()?;
        debug!("Materializer::materialize_timeline({} -> {})", departing, name);

        let current_state = self.current_state()?;
        let target_index = repo.commit_index(target_ref.primary)?;

        if auto_shelf && departing != name {
            let base_index = repo.commit_index(departing_tip)?;
            let staged = repo.staged_paths()?;
            if current_state != base_index || !staged.is_empty() {
                let entry = ShelfEntry {
                    timeline: departing.clone(),
                    created_at: Timestamp::now(),
                    workspace_index: current_state.store(repo.odb())?,
                    base_index: base_index.store(repo.odb())?,
                    staged_paths: staged,
                    consumed: false,
                };
                repo.shelves().save(&entry)?;
            }
        }

        self.persist_pending(name, &target_index)?;
        self.apply(&current_state, &target_index)?;
        repo.set_head(name)?;
        repo.clear_staged_paths()?;

        if let Some(shelf) = repo.shelves().load(name)? {
            debug!("Materializer::materialize_timeline(..) :: restoring shelf for `{}`", name);
            let shelved = WorkspaceIndex::load(repo.odb(), shelf.workspace_index)?;
            self.apply(&target_index, &shelved)?;
            repo.set_staged_paths(&shelf.staged_paths)?;
            repo.shelves().consume(name)?;
        }

        self.clear_pending()?;
        Ok(())
    }

    /// re-materializes the current timeline at an arbitrary commit
    /// (time travel within a timeline); the tip ref is not moved
    pub fn materialize_commit(&self, commit: Oid) -> SagaResult<()> {
        let target_index = self.repo.commit_index(commit)?;
        let current_state = self.current_state()?;
        self.persist_pending(&self.repo.refs().current_timeline()?, &target_index)?;
        self.apply(&current_state, &target_index)?;
        self.clear_pending()
    }

    // recovery state: the target index hash and timeline are persisted
    // before any file operation; a crashed materialization is resumed
    // by converging the rescanned workspace onto the recorded target

    fn persist_pending(&self, timeline: &str, target: &WorkspaceIndex) -> SagaResult<()> {
        let target_oid = target.store(self.repo.odb())?;
        self.repo.db().with_write(|txn| {
            let mut buf = vec![];
            buf.write_str(timeline)?;
            buf.write_oid(target_oid)?;
            txn.open_table(MATERIALIZE_STATE)?.insert("pending", buf.as_slice())?;
            Ok(())
        })
    }

    fn clear_pending(&self) -> SagaResult<()> {
        self.repo.db().with_write(|txn| {
            txn.open_table(MATERIALIZE_STATE)?.remove("pending")?;
            Ok(())
        })
    }

    pub fn pending_target(&self) -> SagaResult<Option<(String, Oid)>> {
        let txn = self.repo.db().begin_read()?;
        let table = txn.open_table(MATERIALIZE_STATE)?;
        match table.get("pending")? {
            Some(guard) => {
                let mut bytes = guard.value();
                let reader = &mut bytes;
                let timeline = reader.read_str()?;
                let target = reader.read_oid()?;
                Ok(Some((timeline, target)))
            }
            None => Ok(None),
        }
    }

    /// finishes an interrupted materialization; returns whether there
    /// was anything to resume
    pub fn resume_pending(&self) -> SagaResult<bool> {
        let (timeline, target_oid) = match self.pending_target()? {
            Some(pending) => pending,
            None => return Ok(false),
        };
        debug!("Materializer::resume_pending(..) :: converging onto `{}`", timeline);
        let target = WorkspaceIndex::load(self.repo.odb(), target_oid)?;
        let current = self.current_state()?;
        // a rerun may find arbitrary partial progress; force convergence
        let forced = self.repo.materializer_with(MaterializeOpts::forced(), self.cancel.clone());
        forced.apply(&current, &target)?;
        self.repo.set_head(&timeline)?;
        self.clear_pending()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests;
