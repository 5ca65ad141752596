use crate::cancel::CancelToken;
use crate::commit::Signature;
use crate::db::{MetaDb, MERGE_HISTORY, MERGE_SESSION};
use crate::error::{SagaError, SagaResult};
use crate::filetree::{self, ChunkRef, FileRef};
use crate::hash::Oid;
use crate::index::{IndexEntry, WorkspaceIndex};
use crate::io::{ReadExt, WriteExt};
use crate::mmr;
use crate::odb::Odb;
use crate::path::RepoPath;
use crate::refs::RefKind;
use crate::repo::SagaRepo;
use crate::time::Timestamp;
use log::debug;
use num_enum::TryFromPrimitive;
use redb::ReadableTable;
use rustc_hash::FxHashMap;
use smallvec::smallvec;
use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};

// the merge session state machine:
//
//   none -> detecting -> fast_forward -> updating_ref -> none
//                     \-> planning -> ready -> recording -> none
//                                  \-> conflicted -> resolve(path, choice) xN -> ready
//                                                 \-> abort -> none
//
// `merge_timeline` drives detecting/planning/recording in one call; a
// conflicted outcome leaves the persisted session active so resolution
// can continue across process restarts. `resolve_merge` records one
// per-path choice at a time; once every conflicted path carries a
// choice the session is ready and `commit_resolved_merge` performs the
// recording transition. re-running `merge_timeline` with a blanket
// strategy remains available as a coarser way out

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MergeStrategy {
    /// chunk-wise merge, conflicts are reported
    Auto   = 0,
    /// conflicted files take the target (left) side
    Ours   = 1,
    /// conflicted files take the source (right) side
    Theirs = 2,
    /// conflicted chunk runs concatenate left then right
    Union  = 3,
    /// conflicted files revert to the base version
    Base   = 4,
}

/// a per-path conflict decision recorded through `resolve_merge`
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ResolveChoice {
    /// keep the target (left) side of the file
    Left  = 0,
    /// take the source (right) side
    Right = 1,
    /// revert the file to the base version
    Base  = 2,
    /// concatenate left then right for conflicted chunk runs
    Union = 3,
}

impl ResolveChoice {
    fn strategy(self) -> MergeStrategy {
        match self {
            ResolveChoice::Left => MergeStrategy::Ours,
            ResolveChoice::Right => MergeStrategy::Theirs,
            ResolveChoice::Base => MergeStrategy::Base,
            ResolveChoice::Union => MergeStrategy::Union,
        }
    }
}

/// one conflicted chunk position within a file merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkConflict {
    pub chunk_index: usize,
    pub base: Option<Oid>,
    pub left: Option<Oid>,
    pub right: Option<Oid>,
}

/// outcome of merging one path; `success == false` carries the
/// conflicting chunk positions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMergeResult {
    pub path: RepoPath,
    pub success: bool,
    pub conflicts: Vec<ChunkConflict>,
}

/// the conflict set of a failed merge, stored as structured data; the
/// workspace is never polluted with sentinel markers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeConflicts {
    pub files: Vec<ChunkMergeResult>,
}

impl Display for MergeConflicts {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "merge produced conflicts in {} file(s):", self.files.len())?;
        for file in &self.files {
            writeln!(f, "  {} ({} chunk(s))", file.path, file.conflicts.len())?;
        }
        Ok(())
    }
}

/// result of a workspace-level merge; the workspace itself is never
/// mutated, the caller decides whether to materialize
#[derive(Debug)]
pub struct WorkspaceMerge {
    pub merged_index: Option<WorkspaceIndex>,
    pub conflicts: Vec<ChunkMergeResult>,
    pub success: bool,
}

enum FileMergeOutcome {
    Merged(Vec<ChunkRef>),
    Conflicted(Vec<ChunkConflict>),
}

/// longest common subsequence over chunk hashes; returns matched
/// (left index, right index) pairs in order
fn lcs_pairs(a: &[ChunkRef], b: &[ChunkRef]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    let mut lengths = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lengths[i][j] = if a[i].oid == b[j].oid {
                lengths[i + 1][j + 1] + 1
            } else {
                lengths[i + 1][j].max(lengths[i][j + 1])
            };
        }
    }
    let mut pairs = vec![];
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i].oid == b[j].oid {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if lengths[i + 1][j] >= lengths[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

fn sequences_equal(a: &[ChunkRef], b: &[ChunkRef]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.oid == y.oid)
}

/// a run of divergence between base and one side
#[derive(Debug, Copy, Clone)]
struct Hunk {
    b_lo: usize,
    b_hi: usize,
    o_lo: usize,
    o_hi: usize,
}

/// the change hunks between base and another sequence, derived from
/// their longest common subsequence
fn diff_hunks(base: &[ChunkRef], other: &[ChunkRef]) -> Vec<Hunk> {
    let mut hunks = vec![];
    let (mut bp, mut op) = (0, 0);
    for (bi, oi) in lcs_pairs(base, other) {
        if bi > bp || oi > op {
            hunks.push(Hunk { b_lo: bp, b_hi: bi, o_lo: op, o_hi: oi });
        }
        bp = bi + 1;
        op = oi + 1;
    }
    if base.len() > bp || other.len() > op {
        hunks.push(Hunk { b_lo: bp, b_hi: base.len(), o_lo: op, o_hi: other.len() });
    }
    hunks
}

/// a combined region where at least one side diverges from base
#[derive(Debug, Copy, Clone)]
struct Region {
    b_lo: usize,
    b_hi: usize,
    l_lo: usize,
    l_hi: usize,
    r_lo: usize,
    r_hi: usize,
}

/// folds the two hunk lists into combined regions, in the style of
/// diff3: hunks merge only when their base ranges genuinely overlap,
/// so adjacent single-side changes stay independently mergeable
fn combine_regions(base_len: usize, lh: &[Hunk], rh: &[Hunk]) -> Vec<Region> {
    fn overlaps(hunk: &Hunk, lo: usize, hi: usize) -> bool {
        if lo == hi { hunk.b_lo == lo } else { hunk.b_lo < hi }
    }

    let mut regions = vec![];
    let (mut li, mut ri) = (0usize, 0usize);
    // other_pos - base_pos once all consumed hunks are accounted for
    let (mut delta_l, mut delta_r) = (0isize, 0isize);
    loop {
        let lo = match (lh.get(li), rh.get(ri)) {
            (None, None) => break,
            (Some(hunk), None) | (None, Some(hunk)) => hunk.b_lo,
            (Some(a), Some(b)) => a.b_lo.min(b.b_lo),
        };
        let mut hi = lo;
        let delta_l_before = delta_l;
        let delta_r_before = delta_r;
        loop {
            let mut progressed = false;
            if let Some(hunk) = lh.get(li) {
                if overlaps(hunk, lo, hi) {
                    hi = hi.max(hunk.b_hi);
                    delta_l = hunk.o_hi as isize - hunk.b_hi as isize;
                    li += 1;
                    progressed = true;
                }
            }
            if let Some(hunk) = rh.get(ri) {
                if overlaps(hunk, lo, hi) {
                    hi = hi.max(hunk.b_hi);
                    delta_r = hunk.o_hi as isize - hunk.b_hi as isize;
                    ri += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        debug_assert!(hi <= base_len);
        regions.push(Region {
            b_lo: lo,
            b_hi: hi,
            l_lo: (lo as isize + delta_l_before) as usize,
            l_hi: (hi as isize + delta_l) as usize,
            r_lo: (lo as isize + delta_r_before) as usize,
            r_hi: (hi as isize + delta_r) as usize,
        });
    }
    regions
}

enum RegionOutcome {
    Take(Vec<ChunkRef>),
    Conflict,
}

fn classify_region(
    base_slice: &[ChunkRef],
    left_slice: &[ChunkRef],
    right_slice: &[ChunkRef],
) -> RegionOutcome {
    if sequences_equal(left_slice, base_slice) {
        RegionOutcome::Take(right_slice.to_vec())
    } else if sequences_equal(right_slice, base_slice)
        || sequences_equal(left_slice, right_slice)
    {
        RegionOutcome::Take(left_slice.to_vec())
    } else {
        RegionOutcome::Conflict
    }
}

/// three-way merge over chunk sequences: for every divergent region,
/// an unchanged side yields to the changed one, identical changes
/// collapse, and anything else conflicts at chunk granularity
fn merge_chunk_sequences(
    base: &[ChunkRef],
    left: &[ChunkRef],
    right: &[ChunkRef],
) -> FileMergeOutcome {
    let regions = combine_regions(base.len(), &diff_hunks(base, left), &diff_hunks(base, right));

    let mut merged = vec![];
    let mut conflicts = vec![];
    let mut stable_from = 0;
    for region in regions {
        merged.extend_from_slice(&base[stable_from..region.b_lo]);
        stable_from = region.b_hi;

        let base_slice = &base[region.b_lo..region.b_hi];
        let left_slice = &left[region.l_lo..region.l_hi];
        let right_slice = &right[region.r_lo..region.r_hi];
        match classify_region(base_slice, left_slice, right_slice) {
            RegionOutcome::Take(chunks) => merged.extend(chunks),
            RegionOutcome::Conflict => {
                let longest = base_slice.len().max(left_slice.len()).max(right_slice.len());
                for offset in 0..longest {
                    conflicts.push(ChunkConflict {
                        chunk_index: region.b_lo + offset,
                        base: base_slice.get(offset).map(|chunk| chunk.oid),
                        left: left_slice.get(offset).map(|chunk| chunk.oid),
                        right: right_slice.get(offset).map(|chunk| chunk.oid),
                    });
                }
            }
        }
    }
    merged.extend_from_slice(&base[stable_from..]);

    if conflicts.is_empty() {
        FileMergeOutcome::Merged(merged)
    } else {
        FileMergeOutcome::Conflicted(conflicts)
    }
}

/// three-way merge of one path at chunk granularity
///
/// `base` is `None` when the path was added on both sides
pub fn merge_file(
    odb: &dyn Odb,
    path: &RepoPath,
    base: Option<FileRef>,
    left: FileRef,
    right: FileRef,
    strategy: MergeStrategy,
) -> SagaResult<(Option<FileRef>, ChunkMergeResult)> {
    let base_chunks = match base {
        Some(base) => filetree::chunk_sequence(odb, base)?,
        None => vec![],
    };
    let left_chunks = filetree::chunk_sequence(odb, left)?;
    let right_chunks = filetree::chunk_sequence(odb, right)?;

    match merge_chunk_sequences(&base_chunks, &left_chunks, &right_chunks) {
        FileMergeOutcome::Merged(chunks) => {
            let file = filetree::build_from_chunks(odb, &chunks)?;
            Ok((Some(file), ChunkMergeResult { path: path.clone(), success: true, conflicts: vec![] }))
        }
        FileMergeOutcome::Conflicted(conflicts) => {
            let resolved = match strategy {
                MergeStrategy::Auto => None,
                MergeStrategy::Ours => Some(left),
                MergeStrategy::Theirs => Some(right),
                // without a base version there is nothing to revert to;
                // fall back to the target side
                MergeStrategy::Base => Some(base.unwrap_or(left)),
                MergeStrategy::Union => {
                    Some(union_merge(odb, &base_chunks, &left_chunks, &right_chunks)?)
                }
            };
            let success = resolved.is_some();
            Ok((resolved, ChunkMergeResult { path: path.clone(), success, conflicts }))
        }
    }
}

/// union resolution: re-runs the region walk, concatenating left then
/// right bytes for conflicted regions and splitting the result into
/// fresh chunks
fn union_merge(
    odb: &dyn Odb,
    base: &[ChunkRef],
    left: &[ChunkRef],
    right: &[ChunkRef],
) -> SagaResult<FileRef> {
    let regions = combine_regions(base.len(), &diff_hunks(base, left), &diff_hunks(base, right));

    let mut merged = vec![];
    let mut stable_from = 0;
    for region in regions {
        merged.extend_from_slice(&base[stable_from..region.b_lo]);
        stable_from = region.b_hi;

        let base_slice = &base[region.b_lo..region.b_hi];
        let left_slice = &left[region.l_lo..region.l_hi];
        let right_slice = &right[region.r_lo..region.r_hi];
        match classify_region(base_slice, left_slice, right_slice) {
            RegionOutcome::Take(chunks) => merged.extend(chunks),
            RegionOutcome::Conflict => {
                let mut bytes = vec![];
                for chunk in left_slice.iter().chain(right_slice) {
                    bytes.extend_from_slice(&odb.get(chunk.oid)?);
                }
                merged.extend(filetree::chunk_bytes(odb, &bytes)?);
            }
        }
    }
    merged.extend_from_slice(&base[stable_from..]);
    filetree::build_from_chunks(odb, &merged)
}

/// merges three workspace indexes; per-path rules per the table in the
/// module docs, chunk merge for paths modified on both sides
pub fn merge_workspaces(
    odb: &dyn Odb,
    base: &WorkspaceIndex,
    left: &WorkspaceIndex,
    right: &WorkspaceIndex,
    strategy: MergeStrategy,
) -> SagaResult<WorkspaceMerge> {
    merge_workspaces_with(odb, base, left, right, strategy, &FxHashMap::default())
}

/// workspace merge with per-path strategy overrides, the shape a
/// partially resolved session replays through
pub fn merge_workspaces_with(
    odb: &dyn Odb,
    base: &WorkspaceIndex,
    left: &WorkspaceIndex,
    right: &WorkspaceIndex,
    strategy: MergeStrategy,
    overrides: &FxHashMap<RepoPath, MergeStrategy>,
) -> SagaResult<WorkspaceMerge> {
    let mut paths = BTreeSet::new();
    paths.extend(base.paths().cloned());
    paths.extend(left.paths().cloned());
    paths.extend(right.paths().cloned());

    let mut merged = WorkspaceIndex::default();
    let mut conflicts = vec![];
    for path in &paths {
        let path_strategy = overrides.get(path).copied().unwrap_or(strategy);
        let b = base.get(path);
        let l = left.get(path);
        let r = right.get(path);
        match (b, l, r) {
            // deleted everywhere, or never existed
            (_, None, None) => {}
            // present on one side only: an addition, or a deletion of an
            // unmodified file on the other side
            (None, Some(l), None) => merged.insert_entry(l.clone()),
            (None, None, Some(r)) => merged.insert_entry(r.clone()),
            (Some(b), Some(l), None) =>
                if l.file != b.file {
                    // modify/delete: the modified side wins
                    merged.insert_entry(l.clone());
                },
            (Some(b), None, Some(r)) =>
                if r.file != b.file {
                    merged.insert_entry(r.clone());
                },
            (None, Some(l), Some(r)) =>
                if l.file == r.file {
                    merged.insert_entry(l.clone());
                } else {
                    merge_path(odb, path, None, l, r, path_strategy, &mut merged, &mut conflicts)?;
                },
            (Some(b), Some(l), Some(r)) =>
                if l.file == r.file {
                    merged.insert_entry(l.clone());
                } else if l.file == b.file {
                    merged.insert_entry(r.clone());
                } else if r.file == b.file {
                    merged.insert_entry(l.clone());
                } else {
                    merge_path(odb, path, Some(b), l, r, path_strategy, &mut merged, &mut conflicts)?;
                },
        }
    }

    let success = conflicts.is_empty();
    Ok(WorkspaceMerge { merged_index: success.then_some(merged), conflicts, success })
}

#[allow(clippy::too_many_arguments)]
fn merge_path(
    odb: &dyn Odb,
    path: &RepoPath,
    base: Option<&IndexEntry>,
    left: &IndexEntry,
    right: &IndexEntry,
    strategy: MergeStrategy,
    merged: &mut WorkspaceIndex,
    conflicts: &mut Vec<ChunkMergeResult>,
) -> SagaResult<()> {
    let (file, result) =
        merge_file(odb, path, base.map(|b| b.file), left.file, right.file, strategy)?;
    match file {
        Some(file) => {
            let checksum = crate::hash::hash_bytes(filetree::read_all(odb, file)?);
            merged.insert_entry(IndexEntry {
                path: path.clone(),
                file,
                mode: left.mode,
                size: file.size,
                mtime_ns: 0,
                checksum,
            });
        }
        None => conflicts.push(result),
    }
    Ok(())
}

// the persisted resolution store

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SessionStatus {
    Active    = 0,
    Completed = 1,
    Aborted   = 2,
}

/// one accumulated resolution: the conflicted path and the side chosen
/// for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: RepoPath,
    pub choice: ResolveChoice,
}

/// a conflict resolution session; survives process restarts while
/// `Active`
///
/// `resolved_paths` accumulates one record per `resolve_merge` call;
/// the session is ready to record once every conflicted path is covered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSession {
    pub source_timeline: String,
    pub target_timeline: String,
    pub source_commit: Oid,
    pub target_commit: Oid,
    pub strategy: MergeStrategy,
    pub resolved_paths: Vec<ResolvedPath>,
    pub created_at: Timestamp,
    pub status: SessionStatus,
}

impl MergeSession {
    /// records a per-path decision; resolving the same path again
    /// replaces the earlier choice
    pub fn record_resolution(&mut self, path: &RepoPath, choice: ResolveChoice) {
        match self.resolved_paths.iter_mut().find(|resolved| resolved.path == *path) {
            Some(resolved) => resolved.choice = choice,
            None => self.resolved_paths.push(ResolvedPath { path: path.clone(), choice }),
        }
    }

    pub fn resolution_for(&self, path: &RepoPath) -> Option<ResolveChoice> {
        self.resolved_paths
            .iter()
            .find(|resolved| resolved.path == *path)
            .map(|resolved| resolved.choice)
    }

    fn encode(&self) -> SagaResult<Vec<u8>> {
        let mut buf = vec![];
        buf.write_str(&self.source_timeline)?;
        buf.write_str(&self.target_timeline)?;
        buf.write_oid(self.source_commit)?;
        buf.write_oid(self.target_commit)?;
        buf.write_u8(self.strategy as u8)?;
        buf.write_varint(self.resolved_paths.len() as u64)?;
        for resolved in &self.resolved_paths {
            buf.write_str(resolved.path.as_str())?;
            buf.write_u8(resolved.choice as u8)?;
        }
        buf.write_i64(self.created_at.as_nanos())?;
        buf.write_u8(self.status as u8)?;
        Ok(buf)
    }

    fn decode(mut bytes: &[u8]) -> SagaResult<Self> {
        let reader = &mut bytes;
        let source_timeline = reader.read_str()?;
        let target_timeline = reader.read_str()?;
        let source_commit = reader.read_oid()?;
        let target_commit = reader.read_oid()?;
        let strategy = MergeStrategy::try_from(reader.read_u8()?)
            .map_err(|err| anyhow!(SagaError::Corrupt(format!("invalid strategy: {}", err))))?;
        let count = reader.read_varint()? as usize;
        let mut resolved_paths = Vec::with_capacity(count);
        for _ in 0..count {
            let path = RepoPath::new(reader.read_str()?)?;
            let choice = ResolveChoice::try_from(reader.read_u8()?)
                .map_err(|err| anyhow!(SagaError::Corrupt(format!("invalid choice: {}", err))))?;
            resolved_paths.push(ResolvedPath { path, choice });
        }
        let created_at = Timestamp::from_nanos(reader.read_i64()?);
        let status = SessionStatus::try_from(reader.read_u8()?)
            .map_err(|err| anyhow!(SagaError::Corrupt(format!("invalid status: {}", err))))?;
        Ok(Self {
            source_timeline,
            target_timeline,
            source_commit,
            target_commit,
            strategy,
            resolved_paths,
            created_at,
            status,
        })
    }
}

const CURRENT_SESSION: &str = "current";

pub struct SessionStore<'a> {
    db: &'a MetaDb,
}

impl<'a> SessionStore<'a> {
    pub fn new(db: &'a MetaDb) -> Self {
        Self { db }
    }

    pub fn save(&self, session: &MergeSession) -> SagaResult<()> {
        self.db.with_write(|txn| {
            txn.open_table(MERGE_SESSION)?.insert(CURRENT_SESSION, session.encode()?.as_slice())?;
            Ok(())
        })
    }

    pub fn load(&self) -> SagaResult<Option<MergeSession>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(MERGE_SESSION)?;
        match table.get(CURRENT_SESSION)? {
            Some(guard) => Ok(Some(MergeSession::decode(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self) -> SagaResult<()> {
        self.db.with_write(|txn| {
            txn.open_table(MERGE_SESSION)?.remove(CURRENT_SESSION)?;
            Ok(())
        })
    }

    /// records one per-path decision into the active session and
    /// persists it; the caller validates the path against the conflict
    /// set
    pub fn resolve(&self, path: &RepoPath, choice: ResolveChoice) -> SagaResult<MergeSession> {
        let mut session = match self.load()? {
            Some(session) if session.status == SessionStatus::Active => session,
            _ => bail!(SagaError::NotFound("active merge session".to_owned())),
        };
        session.record_resolution(path, choice);
        self.save(&session)?;
        Ok(session)
    }

    /// moves a finished session into the history bucket and clears the
    /// active slot
    pub fn archive_to_history(&self, session: &MergeSession) -> SagaResult<()> {
        debug_assert_ne!(session.status, SessionStatus::Active);
        self.db.with_write(|txn| {
            let mut history = txn.open_table(MERGE_HISTORY)?;
            let mut sequence = 0;
            for item in history.iter()? {
                let _ = item?;
                sequence += 1;
            }
            let key = format!("{}-{}", session.created_at.as_nanos(), sequence);
            history.insert(key.as_str(), session.encode()?.as_slice())?;
            txn.open_table(MERGE_SESSION)?.remove(CURRENT_SESSION)?;
            Ok(())
        })
    }

    pub fn history(&self) -> SagaResult<Vec<MergeSession>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(MERGE_HISTORY)?;
        let mut sessions = vec![];
        for item in table.iter()? {
            let (_, value) = item?;
            sessions.push(MergeSession::decode(value.value())?);
        }
        Ok(sessions)
    }
}

/// outcome of a timeline merge
#[derive(Debug, PartialEq)]
pub enum MergeResults {
    /// the source is already part of the target; nothing to do
    Null,
    /// the target tip is an ancestor of the source tip; the merge
    /// degenerated to a ref update
    FastForward { from: Oid, to: Oid },
    /// a merge commit was recorded
    Merged { commit: Oid },
    /// conflicts were found and persisted; the session stays active
    Conflicts(Vec<ChunkMergeResult>),
}

impl SagaRepo {
    pub fn sessions(&self) -> SessionStore<'_> {
        SessionStore::new(self.db())
    }

    /// merges `source` into the current timeline
    pub fn merge_timeline(
        &self,
        source: &str,
        strategy: MergeStrategy,
        author: Signature,
        cancel: &CancelToken,
    ) -> SagaResult<MergeResults> {
        MergeCtxt::new(self, source, strategy, cancel.clone())?.merge(author)
    }

    /// abandons the active merge session, if any
    pub fn abort_merge(&self) -> SagaResult<()> {
        let sessions = self.sessions();
        let mut session = match sessions.load()? {
            Some(session) => session,
            None => bail!(SagaError::NotFound("active merge session".to_owned())),
        };
        session.status = SessionStatus::Aborted;
        sessions.archive_to_history(&session)
    }

    fn active_session(&self) -> SagaResult<MergeSession> {
        match self.sessions().load()? {
            Some(session) if session.status == SessionStatus::Active => Ok(session),
            _ => bail!(SagaError::NotFound("active merge session".to_owned())),
        }
    }

    /// (base, left, right) indexes of a session, rebuilt from its
    /// recorded commits
    fn session_indexes(
        &self,
        session: &MergeSession,
    ) -> SagaResult<(WorkspaceIndex, WorkspaceIndex, WorkspaceIndex)> {
        let lca =
            mmr::lowest_common_ancestor(self.db(), session.target_commit, session.source_commit)?;
        let base = match lca {
            Some(lca) => self.commit_index(lca)?,
            None => WorkspaceIndex::default(),
        };
        let left = self.commit_index(session.target_commit)?;
        let right = self.commit_index(session.source_commit)?;
        Ok((base, left, right))
    }

    fn session_conflicts(&self, session: &MergeSession) -> SagaResult<Vec<ChunkMergeResult>> {
        let (base, left, right) = self.session_indexes(session)?;
        let outcome = merge_workspaces(self.odb(), &base, &left, &right, MergeStrategy::Auto)?;
        Ok(outcome.conflicts)
    }

    /// records the choice for one conflicted path of the active
    /// session; returns how many conflicted paths still await a
    /// decision, zero meaning the session is ready to record
    pub fn resolve_merge(&self, path: &RepoPath, choice: ResolveChoice) -> SagaResult<usize> {
        let session = self.active_session()?;
        let conflicts = self.session_conflicts(&session)?;
        ensure!(
            conflicts.iter().any(|conflict| conflict.path == *path),
            SagaError::NotFound(format!("no conflict recorded for `{}`", path))
        );
        debug!("SagaRepo::resolve_merge({}, {:?})", path, choice);
        let session = self.sessions().resolve(path, choice)?;
        let remaining = conflicts
            .iter()
            .filter(|conflict| session.resolution_for(&conflict.path).is_none())
            .count();
        Ok(remaining)
    }

    /// the recording transition of a resolved session: replays the
    /// merge with every recorded per-path choice, writes the merge
    /// commit and ref update, materializes the result, and archives
    /// the session as completed
    ///
    /// returns the still-conflicted set if any path lacks a choice
    pub fn commit_resolved_merge(
        &self,
        message: &str,
        author: Signature,
        cancel: &CancelToken,
    ) -> SagaResult<MergeResults> {
        let session = self.active_session()?;
        let target_tip =
            self.refs().get(&session.target_timeline, RefKind::LocalTimeline)?.primary;
        ensure!(
            target_tip == session.target_commit,
            SagaError::InvalidArgument(format!(
                "timeline `{}` moved while the merge session was active",
                session.target_timeline
            ))
        );

        let (base, left, right) = self.session_indexes(&session)?;
        let overrides = session
            .resolved_paths
            .iter()
            .map(|resolved| (resolved.path.clone(), resolved.choice.strategy()))
            .collect::<FxHashMap<_, _>>();

        cancel.check()?;
        let outcome = merge_workspaces_with(
            self.odb(),
            &base,
            &left,
            &right,
            MergeStrategy::Auto,
            &overrides,
        )?;
        if !outcome.success {
            // paths without a recorded choice are still conflicted
            return Ok(MergeResults::Conflicts(outcome.conflicts));
        }

        let merged_index = outcome.merged_index.expect("successful merges carry an index");
        let tree = merged_index.to_tree(self.odb())?;
        // ordering is significant: the first parent is the target's prior tip
        let commit = self.create_commit(
            tree,
            smallvec![session.target_commit, session.source_commit],
            author.clone(),
            author,
            message,
            Some(&session.target_timeline),
        )?;

        let current = self.scan_workspace(cancel)?;
        self.materializer().apply(&current, &merged_index)?;

        let mut completed = session;
        completed.status = SessionStatus::Completed;
        self.sessions().archive_to_history(&completed)?;

        Ok(MergeResults::Merged { commit })
    }
}

struct MergeCtxt<'a> {
    repo: &'a SagaRepo,
    source_timeline: String,
    target_timeline: String,
    source_tip: Oid,
    target_tip: Oid,
    strategy: MergeStrategy,
    cancel: CancelToken,
}

impl<'a> MergeCtxt<'a> {
    fn new(
        repo: &'a SagaRepo,
        source: &str,
        strategy: MergeStrategy,
        cancel: CancelToken,
    ) -> SagaResult<Self> {
        let source_tip = repo.refs().get(source, RefKind::LocalTimeline)?.primary;
        let (target_timeline, target_tip) = repo.current_tip()?;
        ensure!(
            !source_tip.is_zero(),
            SagaError::InvalidArgument(format!("timeline `{}` has no commits", source))
        );

        // one active session at a time; re-entering the same merge
        // (e.g. retrying with another strategy) resumes it
        if let Some(session) = repo.sessions().load()? {
            if session.status == SessionStatus::Active
                && (session.source_timeline != source
                    || session.target_timeline != target_timeline)
            {
                bail!(SagaError::MergeInProgress);
            }
        }

        Ok(Self {
            repo,
            source_timeline: source.to_owned(),
            target_timeline,
            source_tip,
            target_tip,
            strategy,
            cancel,
        })
    }

    fn merge(self, author: Signature) -> SagaResult<MergeResults> {
        let repo = self.repo;
        debug!(
            "MergeCtxt::merge({} -> {}, strategy: {:?})",
            self.source_timeline, self.target_timeline, self.strategy
        );

        if self.source_tip == self.target_tip {
            return Ok(MergeResults::Null);
        }

        // fast-forward detection via the mmr ancestor index
        let lca = if self.target_tip.is_zero() {
            None
        } else {
            mmr::lowest_common_ancestor(repo.db(), self.target_tip, self.source_tip)?
        };
        if self.target_tip.is_zero() || lca == Some(self.target_tip) {
            return self.fast_forward();
        }
        if lca == Some(self.source_tip) {
            // the source is already reachable from the target
            return Ok(MergeResults::Null);
        }

        let session = MergeSession {
            source_timeline: self.source_timeline.clone(),
            target_timeline: self.target_timeline.clone(),
            source_commit: self.source_tip,
            target_commit: self.target_tip,
            strategy: self.strategy,
            resolved_paths: vec![],
            created_at: Timestamp::now(),
            status: SessionStatus::Active,
        };
        repo.sessions().save(&session)?;

        let base_index = match lca {
            Some(lca) => repo.commit_index(lca)?,
            None => WorkspaceIndex::default(),
        };
        let left_index = repo.commit_index(self.target_tip)?;
        let right_index = repo.commit_index(self.source_tip)?;

        self.cancel.check()?;
        let outcome =
            merge_workspaces(repo.odb(), &base_index, &left_index, &right_index, self.strategy)?;

        if !outcome.success {
            // conflicts stay in the resolution store; the session
            // remains active for an external resolver
            return Ok(MergeResults::Conflicts(outcome.conflicts));
        }

        let merged_index = outcome.merged_index.expect("successful merges carry an index");
        let tree = merged_index.to_tree(repo.odb())?;
        let message =
            format!("Merge timeline `{}` into `{}`", self.source_timeline, self.target_timeline);
        // ordering is significant: the first parent is the target's prior tip
        let commit = repo.create_commit(
            tree,
            smallvec![self.target_tip, self.source_tip],
            author.clone(),
            author,
            &message,
            Some(&self.target_timeline),
        )?;

        // bring the workspace along to the merged state
        let current = repo.scan_workspace(&self.cancel)?;
        repo.materializer().apply(&current, &merged_index)?;

        let mut completed = session;
        completed.status = SessionStatus::Completed;
        repo.sessions().archive_to_history(&completed)?;

        Ok(MergeResults::Merged { commit })
    }

    fn fast_forward(self) -> SagaResult<MergeResults> {
        let repo = self.repo;
        debug!("MergeCtxt::fast_forward({} -> {})", self.target_tip, self.source_tip);
        let target_index = repo.commit_index(self.source_tip)?;
        let current = repo.scan_workspace(&self.cancel)?;
        repo.refs().update(&self.target_timeline, RefKind::LocalTimeline, self.source_tip)?;
        repo.materializer().apply(&current, &target_index)?;
        Ok(MergeResults::FastForward { from: self.target_tip, to: self.source_tip })
    }
}
