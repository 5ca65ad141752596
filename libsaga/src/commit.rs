use crate::error::{SagaError, SagaGenericError, SagaResult};
use crate::hash::Oid;
use crate::io::{ReadExt, WriteExt};
use crate::odb::Odb;
use crate::serialize::{Deserialize, Serialize};
use crate::time::Timestamp;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::{self, Display, Formatter};
use std::io::prelude::*;
use std::str::FromStr;

const COMMIT_TAG: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self { name: name.into(), email: email.into() }
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

impl FromStr for Signature {
    type Err = SagaGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let open = s.find('<').ok_or_else(|| {
            anyhow!(SagaError::Corrupt(format!("malformed signature `{}`", s)))
        })?;
        ensure!(s.ends_with('>'), SagaError::Corrupt(format!("malformed signature `{}`", s)));
        let name = s[..open].trim_end().to_owned();
        let email = s[open + 1..s.len() - 1].to_owned();
        Ok(Self { name, email })
    }
}

/// a seal: an immutable snapshot of a directory tree with parent links
///
/// parent order is significant: `parents[0]` is the target timeline's
/// prior tip, any further parents are merged-in tips
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: Oid,
    pub parents: SmallVec<[Oid; 2]>,
    pub author: Signature,
    pub committer: Signature,
    pub author_time: Timestamp,
    pub commit_time: Timestamp,
    /// position of this commit's leaf in the mmr
    pub mmr_index: u64,
    pub message: String,
}

impl Commit {
    pub fn first_parent(&self) -> Option<Oid> {
        self.parents.first().copied()
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn store(&self, odb: &dyn Odb) -> SagaResult<Oid> {
        odb.put(&self.to_bytes()?)
    }

    pub fn read(odb: &dyn Odb, oid: Oid) -> SagaResult<Self> {
        Self::deserialize_from_slice(&odb.get(oid)?)
    }
}

impl Serialize for Commit {
    fn serialize(&self, writer: &mut dyn Write) -> SagaResult<()> {
        writer.write_u8(COMMIT_TAG)?;
        writer.write_oid(self.tree)?;
        writer.write_varint(self.parents.len() as u64)?;
        for &parent in &self.parents {
            writer.write_oid(parent)?;
        }
        writer.write_str(&self.author.to_string())?;
        writer.write_str(&self.committer.to_string())?;
        writer.write_i64(self.author_time.as_nanos())?;
        writer.write_i64(self.commit_time.as_nanos())?;
        writer.write_u64(self.mmr_index)?;
        writer.write_str(&self.message)?;
        Ok(())
    }
}

impl Deserialize for Commit {
    fn deserialize(reader: &mut impl BufRead) -> SagaResult<Self> {
        let tag = reader.read_u8()?;
        if tag != COMMIT_TAG {
            bail!(SagaError::Corrupt(format!("unknown commit tag `{:#04x}`", tag)));
        }
        let tree = reader.read_oid()?;
        let parent_count = reader.read_varint()? as usize;
        let mut parents = SmallVec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(reader.read_oid()?);
        }
        let author = reader.read_str()?.parse()?;
        let committer = reader.read_str()?.parse()?;
        let author_time = Timestamp::from_nanos(reader.read_i64()?);
        let commit_time = Timestamp::from_nanos(reader.read_i64()?);
        let mmr_index = reader.read_u64()?;
        let message = reader.read_str()?;
        Ok(Self { tree, parents, author, committer, author_time, commit_time, mmr_index, message })
    }
}

/// linear history traversal via `parents[0]`
pub fn walk_first_parents(odb: &dyn Odb, start: Oid) -> FirstParentWalk<'_> {
    FirstParentWalk { odb, next: (!start.is_zero()).then_some(start) }
}

pub struct FirstParentWalk<'a> {
    odb: &'a dyn Odb,
    next: Option<Oid>,
}

impl Iterator for FirstParentWalk<'_> {
    type Item = SagaResult<(Oid, Commit)>;

    fn next(&mut self) -> Option<Self::Item> {
        let oid = self.next.take()?;
        match Commit::read(self.odb, oid) {
            Ok(commit) => {
                self.next = commit.first_parent();
                Some(Ok((oid, commit)))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// history walk over all parents, yielding commits newest-first by
/// commit time (ties broken by hash for determinism)
pub fn revwalk<'a>(odb: &'a dyn Odb, tips: &[Oid]) -> SagaResult<RevWalk<'a>> {
    let mut walk =
        RevWalk { odb, heap: BinaryHeap::new(), seen: FxHashSet::default() };
    for &tip in tips {
        if !tip.is_zero() {
            walk.push(tip)?;
        }
    }
    Ok(walk)
}

pub struct RevWalk<'a> {
    odb: &'a dyn Odb,
    heap: BinaryHeap<WalkEntry>,
    seen: FxHashSet<Oid>,
}

struct WalkEntry {
    time: Timestamp,
    oid: Oid,
    commit: Commit,
}

impl PartialEq for WalkEntry {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid
    }
}

impl Eq for WalkEntry {
}

impl PartialOrd for WalkEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WalkEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.cmp(&other.time).then_with(|| self.oid.cmp(&other.oid))
    }
}

impl RevWalk<'_> {
    fn push(&mut self, oid: Oid) -> SagaResult<()> {
        if !self.seen.insert(oid) {
            return Ok(());
        }
        let commit = Commit::read(self.odb, oid)?;
        self.heap.push(WalkEntry { time: commit.commit_time, oid, commit });
        Ok(())
    }
}

impl Iterator for RevWalk<'_> {
    type Item = SagaResult<(Oid, Commit)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.heap.pop()?;
        for &parent in &entry.commit.parents {
            if let Err(err) = self.push(parent) {
                return Some(Err(err));
            }
        }
        Some(Ok((entry.oid, entry.commit)))
    }
}
