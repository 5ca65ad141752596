use crate::index::{IndexEntry, WorkspaceIndex};
use crate::path::RepoPath;
use itertools::{EitherOrBoth, Itertools};
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
        };
        write!(f, "{}", s)
    }
}

/// one path's difference between two indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: RepoPath,
    pub kind: ChangeKind,
    pub old: Option<IndexEntry>,
    pub new: Option<IndexEntry>,
}

/// the differences between two workspace indexes, in path order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkspaceDiff {
    pub changes: Vec<FileChange>,
}

impl WorkspaceDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileChange> {
        self.changes.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &RepoPath> {
        self.changes.iter().map(|change| &change.path)
    }

    /// the same diff seen from the other side: added and removed swap,
    /// old and new swap
    pub fn reversed(&self) -> WorkspaceDiff {
        let changes = self
            .changes
            .iter()
            .map(|change| FileChange {
                path: change.path.clone(),
                kind: match change.kind {
                    ChangeKind::Added => ChangeKind::Removed,
                    ChangeKind::Removed => ChangeKind::Added,
                    ChangeKind::Modified => ChangeKind::Modified,
                },
                old: change.new.clone(),
                new: change.old.clone(),
            })
            .collect();
        WorkspaceDiff { changes }
    }
}

/// path-level diff of two indexes; a path is modified iff it exists in
/// both with different file roots or modes
pub fn diff_indexes(a: &WorkspaceIndex, b: &WorkspaceIndex) -> WorkspaceDiff {
    let changes = a
        .iter()
        .merge_join_by(b.iter(), |old, new| old.path.cmp(&new.path))
        .filter_map(|pair| match pair {
            EitherOrBoth::Left(old) => Some(FileChange {
                path: old.path.clone(),
                kind: ChangeKind::Removed,
                old: Some(old.clone()),
                new: None,
            }),
            EitherOrBoth::Right(new) => Some(FileChange {
                path: new.path.clone(),
                kind: ChangeKind::Added,
                old: None,
                new: Some(new.clone()),
            }),
            EitherOrBoth::Both(old, new) => {
                if old.file == new.file && old.mode == new.mode {
                    return None;
                }
                Some(FileChange {
                    path: old.path.clone(),
                    kind: ChangeKind::Modified,
                    old: Some(old.clone()),
                    new: Some(new.clone()),
                })
            }
        })
        .collect();
    WorkspaceDiff { changes }
}
