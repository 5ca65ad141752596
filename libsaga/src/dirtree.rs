use crate::error::{SagaError, SagaResult};
use crate::hash::{name_hash, Oid};
use crate::io::{ReadExt, WriteExt};
use crate::odb::Odb;
use crate::path::RepoPath;
use crate::serialize::{Deserialize, Serialize};
use num_enum::TryFromPrimitive;
use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};
use std::io::prelude::*;

// hamt parameters; these shape directory hashes and are part of the
// on-disk contract
const HAMT_BITS: u32 = 5;
const HAMT_MASK: u32 = (1 << HAMT_BITS) - 1;
/// strides cover bits 0..30 of the name hash; entries that still collide
/// below the deepest stride land in a sorted collision list
const MAX_DEPTH: u8 = 6;
/// depth byte marking a collision-list node
const COLLISION_DEPTH: u8 = 0xff;

const DIR_TAG: u8 = 0x02;
const ENTRY_TAG: u8 = 0xe0;
const CHILD_TAG: u8 = 0xe1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum EntryKind {
    File = 0,
    Dir  = 1,
}

#[derive(Copy, PartialEq, Eq, Clone, Hash, TryFromPrimitive, PartialOrd, Ord)]
#[repr(u32)]
pub enum FileMode {
    REG  = 0o100644,
    EXEC = 0o100755,
    LINK = 0o120000,
    DIR  = 0o40000,
}

impl Display for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:06o}", *self as u32)
    }
}

impl std::fmt::Debug for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FileMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_link(self) -> bool {
        matches!(self, FileMode::LINK)
    }

    pub fn is_file(self) -> bool {
        matches!(self, FileMode::EXEC | FileMode::REG | FileMode::LINK)
    }

    pub fn is_dir(self) -> bool {
        matches!(self, FileMode::DIR)
    }

    pub fn new(mode: u32) -> SagaResult<Self> {
        Self::try_from(mode)
            .map_err(|_| anyhow!(SagaError::Corrupt(format!("invalid file mode `{:06o}`", mode))))
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::prelude::PermissionsExt;
        if metadata.file_type().is_symlink() {
            Self::LINK
        } else if metadata.is_dir() {
            Self::DIR
        } else if metadata.permissions().mode() & 0o111 != 0 {
            Self::EXEC
        } else {
            Self::REG
        }
    }
}

/// a named entry of a directory: either a file (target is a file-tree
/// root) or a subdirectory (target is the subdirectory's root dir node)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub target: Oid,
    pub mode: FileMode,
}

impl DirEntry {
    pub fn new_file(name: impl Into<String>, target: Oid, mode: FileMode) -> Self {
        debug_assert!(mode.is_file());
        Self { name: name.into(), kind: EntryKind::File, target, mode }
    }

    pub fn new_dir(name: impl Into<String>, target: Oid) -> Self {
        Self { name: name.into(), kind: EntryKind::Dir, target, mode: FileMode::DIR }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    /// ordering key that makes a depth-first walk yield flat
    /// lexicographic full-path order: directories compare as `name/`
    fn sort_key(&self) -> String {
        match self.kind {
            EntryKind::File => self.name.clone(),
            EntryKind::Dir => format!("{}/", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Entry(DirEntry),
    Child(Oid),
}

/// a node of the directory hamt
///
/// normal nodes hold a bitmap of populated stride slots and a dense
/// slot array in bitmap order; collision nodes (`depth == 0xff`) hold
/// entries sorted by name and reuse the bitmap field as a count
#[derive(Debug, Clone, PartialEq, Eq)]
struct DirNode {
    depth: u8,
    bitmap: u32,
    slots: Vec<Slot>,
}

impl DirNode {
    fn empty() -> Self {
        Self { depth: 0, bitmap: 0, slots: vec![] }
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn is_collision(&self) -> bool {
        self.depth == COLLISION_DEPTH
    }

    fn load(odb: &dyn Odb, oid: Oid) -> SagaResult<Self> {
        Self::deserialize_from_slice(&odb.get(oid)?)
    }

    fn store(&self, odb: &dyn Odb) -> SagaResult<Oid> {
        odb.put(&self.to_bytes()?)
    }
}

impl Serialize for DirNode {
    fn serialize(&self, writer: &mut dyn Write) -> SagaResult<()> {
        writer.write_u8(DIR_TAG)?;
        writer.write_u8(self.depth)?;
        writer.write_u32(self.bitmap)?;
        for slot in &self.slots {
            match slot {
                Slot::Entry(entry) => {
                    writer.write_u8(ENTRY_TAG)?;
                    writer.write_str(&entry.name)?;
                    writer.write_u8(entry.kind as u8)?;
                    writer.write_u32(entry.mode.as_u32())?;
                    writer.write_oid(entry.target)?;
                }
                Slot::Child(oid) => {
                    writer.write_u8(CHILD_TAG)?;
                    writer.write_oid(*oid)?;
                }
            }
        }
        Ok(())
    }
}

impl Deserialize for DirNode {
    fn deserialize(reader: &mut impl BufRead) -> SagaResult<Self> {
        let tag = reader.read_u8()?;
        if tag != DIR_TAG {
            bail!(SagaError::Corrupt(format!("unknown dir node tag `{:#04x}`", tag)));
        }
        let depth = reader.read_u8()?;
        let bitmap = reader.read_u32()?;
        let count = if depth == COLLISION_DEPTH { bitmap } else { bitmap.count_ones() };
        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let slot = match reader.read_u8()? {
                ENTRY_TAG => {
                    let name = reader.read_str()?;
                    let kind = EntryKind::try_from(reader.read_u8()?).map_err(|err| {
                        anyhow!(SagaError::Corrupt(format!("invalid entry kind: {}", err)))
                    })?;
                    let mode = FileMode::new(reader.read_u32()?)?;
                    let target = reader.read_oid()?;
                    Slot::Entry(DirEntry { name, kind, target, mode })
                }
                CHILD_TAG => Slot::Child(reader.read_oid()?),
                tag => bail!(SagaError::Corrupt(format!("unknown slot tag `{:#04x}`", tag))),
            };
            slots.push(slot);
        }
        Ok(Self { depth, bitmap, slots })
    }
}

/// what remains of a subtree once a removal has run its course
#[derive(Debug)]
enum Collapsed {
    /// nothing left below; the slot disappears
    Empty,
    /// exactly one entry left; it is inlined into the parent
    Entry(DirEntry),
    /// two or more entries remain; the subtree keeps its own node
    Keep(Oid),
}

/// a change between two directory trees, in flat full-path order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub path: RepoPath,
    pub old: Option<(Oid, FileMode)>,
    pub new: Option<(Oid, FileMode)>,
}

/// persistent directory-tree operations over an object store
///
/// every mutation returns the hash of a freshly stored root; existing
/// nodes are never modified
pub struct DirTree<'a> {
    odb: &'a dyn Odb,
}

impl<'a> DirTree<'a> {
    pub fn new(odb: &'a dyn Odb) -> Self {
        Self { odb }
    }

    /// the canonical empty directory
    pub fn empty(&self) -> SagaResult<Oid> {
        DirNode::empty().store(self.odb)
    }

    /// inserts (or replaces) the entry at `path`, creating intermediate
    /// directories; returns the new root
    pub fn insert(&self, root: Oid, path: &RepoPath, entry: DirEntry) -> SagaResult<Oid> {
        let components = path.components().collect::<Vec<_>>();
        debug_assert_eq!(entry.name, *components.last().expect("paths are never empty"));
        self.insert_at(root, &components, entry)
    }

    fn insert_at(&self, root: Oid, components: &[&str], entry: DirEntry) -> SagaResult<Oid> {
        let (&first, rest) = components.split_first().expect("empty component list");
        if rest.is_empty() {
            return self.node_insert(root, 0, entry);
        }
        let subdir_root = match self.node_lookup(root, 0, first)? {
            Some(existing) => {
                ensure!(
                    existing.is_dir(),
                    SagaError::InvalidArgument(format!("`{}` is not a directory", first))
                );
                existing.target
            }
            None => self.empty()?,
        };
        let new_subdir = self.insert_at(subdir_root, rest, entry)?;
        self.node_insert(root, 0, DirEntry::new_dir(first, new_subdir))
    }

    /// removes the entry at `path`, pruning directories left empty;
    /// returns the new root
    pub fn remove(&self, root: Oid, path: &RepoPath) -> SagaResult<Oid> {
        let components = path.components().collect::<Vec<_>>();
        self.remove_at(root, &components, path)
    }

    fn remove_at(&self, root: Oid, components: &[&str], full: &RepoPath) -> SagaResult<Oid> {
        let (&first, rest) = components.split_first().expect("empty component list");
        if rest.is_empty() {
            return match self.node_remove(root, 0, first)? {
                Some(new_root) => Ok(new_root),
                None => bail!(SagaError::NotFound(full.to_string())),
            };
        }
        let existing = self
            .node_lookup(root, 0, first)?
            .filter(DirEntry::is_dir)
            .ok_or_else(|| anyhow!(SagaError::NotFound(full.to_string())))?;
        let new_subdir = self.remove_at(existing.target, rest, full)?;
        if DirNode::load(self.odb, new_subdir)?.is_empty() {
            // prune the emptied directory
            match self.node_remove(root, 0, first)? {
                Some(new_root) => Ok(new_root),
                None => unreachable!("entry was just looked up"),
            }
        } else {
            self.node_insert(root, 0, DirEntry::new_dir(first, new_subdir))
        }
    }

    pub fn lookup(&self, root: Oid, path: &RepoPath) -> SagaResult<Option<DirEntry>> {
        let mut current = root;
        let components = path.components().collect::<Vec<_>>();
        for (idx, component) in components.iter().enumerate() {
            let entry = match self.node_lookup(current, 0, component)? {
                Some(entry) => entry,
                None => return Ok(None),
            };
            if idx + 1 == components.len() {
                return Ok(Some(entry));
            }
            if !entry.is_dir() {
                return Ok(None);
            }
            current = entry.target;
        }
        unreachable!("paths are never empty")
    }

    /// all file entries below `root`, ordered by full path; `prefix`
    /// restricts the walk to a subdirectory
    pub fn list(&self, root: Oid, prefix: Option<&RepoPath>) -> SagaResult<Vec<(RepoPath, DirEntry)>> {
        let (start, base) = match prefix {
            None => (root, None),
            Some(prefix) => match self.lookup(root, prefix)? {
                Some(entry) if entry.is_dir() => (entry.target, Some(prefix.clone())),
                _ => return Ok(vec![]),
            },
        };
        let mut out = vec![];
        self.walk(start, base, &mut out)?;
        Ok(out)
    }

    fn walk(
        &self,
        dir: Oid,
        base: Option<RepoPath>,
        out: &mut Vec<(RepoPath, DirEntry)>,
    ) -> SagaResult<()> {
        let mut entries = self.node_entries(dir)?;
        entries.sort_by_key(DirEntry::sort_key);
        for entry in entries {
            let path = match &base {
                Some(base) => base.join(&entry.name)?,
                None => RepoPath::new(entry.name.clone())?,
            };
            if entry.is_dir() {
                self.walk(entry.target, Some(path), out)?;
            } else {
                out.push((path, entry));
            }
        }
        Ok(())
    }

    /// structural diff of two directory trees; equal subtree hashes are
    /// skipped without loading their nodes
    pub fn diff(&self, a: Oid, b: Oid) -> SagaResult<Vec<PathChange>> {
        let mut out = vec![];
        self.diff_dirs(a, b, None, &mut out)?;
        Ok(out)
    }

    fn diff_dirs(
        &self,
        a: Oid,
        b: Oid,
        base: Option<RepoPath>,
        out: &mut Vec<PathChange>,
    ) -> SagaResult<()> {
        if a == b {
            return Ok(());
        }
        let mut old_entries = self.node_entries(a)?;
        let mut new_entries = self.node_entries(b)?;
        old_entries.sort_by_key(DirEntry::sort_key);
        new_entries.sort_by_key(DirEntry::sort_key);

        let mut old_iter = old_entries.into_iter().peekable();
        let mut new_iter = new_entries.into_iter().peekable();
        loop {
            let ordering = match (old_iter.peek(), new_iter.peek()) {
                (None, None) => break,
                (Some(..), None) => Ordering::Less,
                (None, Some(..)) => Ordering::Greater,
                (Some(old), Some(new)) => old.sort_key().cmp(&new.sort_key()),
            };
            match ordering {
                Ordering::Less => {
                    let old = old_iter.next().unwrap();
                    self.emit_side(&old, &base, false, out)?;
                }
                Ordering::Greater => {
                    let new = new_iter.next().unwrap();
                    self.emit_side(&new, &base, true, out)?;
                }
                Ordering::Equal => {
                    let old = old_iter.next().unwrap();
                    let new = new_iter.next().unwrap();
                    let path = Self::child_path(&base, &old.name)?;
                    if old.is_dir() && new.is_dir() {
                        self.diff_dirs(old.target, new.target, Some(path), out)?;
                    } else if old.target != new.target || old.mode != new.mode {
                        out.push(PathChange {
                            path,
                            old: Some((old.target, old.mode)),
                            new: Some((new.target, new.mode)),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// emits every file below `entry` as purely added (`new_side`) or
    /// purely removed
    fn emit_side(
        &self,
        entry: &DirEntry,
        base: &Option<RepoPath>,
        new_side: bool,
        out: &mut Vec<PathChange>,
    ) -> SagaResult<()> {
        let path = Self::child_path(base, &entry.name)?;
        if entry.is_dir() {
            for (sub_path, sub_entry) in self.list(entry.target, None)? {
                let full = RepoPath::new(format!("{}/{}", path, sub_path))?;
                out.push(Self::side_change(full, &sub_entry, new_side));
            }
        } else {
            out.push(Self::side_change(path, entry, new_side));
        }
        Ok(())
    }

    fn side_change(path: RepoPath, entry: &DirEntry, new_side: bool) -> PathChange {
        let side = Some((entry.target, entry.mode));
        if new_side {
            PathChange { path, old: None, new: side }
        } else {
            PathChange { path, old: side, new: None }
        }
    }

    fn child_path(base: &Option<RepoPath>, name: &str) -> SagaResult<RepoPath> {
        match base {
            Some(base) => base.join(name),
            None => RepoPath::new(name.to_owned()),
        }
    }

    // single-directory hamt operations

    fn slot_index(hash: u32, depth: u8) -> u32 {
        (hash >> (HAMT_BITS * depth as u32)) & HAMT_MASK
    }

    fn node_insert(&self, node_oid: Oid, depth: u8, entry: DirEntry) -> SagaResult<Oid> {
        let mut node = DirNode::load(self.odb, node_oid)?;

        if node.is_collision() {
            match node.slots.iter_mut().position(|slot| matches!(slot, Slot::Entry(existing) if existing.name == entry.name)) {
                Some(pos) => node.slots[pos] = Slot::Entry(entry),
                None => {
                    node.slots.push(Slot::Entry(entry));
                    node.slots.sort_by(|a, b| Self::collision_name(a).cmp(Self::collision_name(b)));
                    node.bitmap += 1;
                }
            }
            return node.store(self.odb);
        }

        let hash = name_hash(&entry.name);
        let idx = Self::slot_index(hash, depth);
        let bit = 1u32 << idx;
        let pos = (node.bitmap & (bit - 1)).count_ones() as usize;

        if node.bitmap & bit == 0 {
            node.slots.insert(pos, Slot::Entry(entry));
            node.bitmap |= bit;
            return node.store(self.odb);
        }

        match node.slots[pos].clone() {
            Slot::Entry(existing) if existing.name == entry.name =>
                node.slots[pos] = Slot::Entry(entry),
            Slot::Entry(existing) => {
                // two names share this stride slot; push both one level down
                let child = self.new_child(depth + 1, existing, entry)?;
                node.slots[pos] = Slot::Child(child);
            }
            Slot::Child(child_oid) => {
                let new_child = self.node_insert(child_oid, depth + 1, entry)?;
                node.slots[pos] = Slot::Child(new_child);
            }
        }
        node.store(self.odb)
    }

    fn new_child(&self, depth: u8, a: DirEntry, b: DirEntry) -> SagaResult<Oid> {
        let node = if depth >= MAX_DEPTH {
            let mut slots = vec![Slot::Entry(a), Slot::Entry(b)];
            slots.sort_by(|a, b| Self::collision_name(a).cmp(Self::collision_name(b)));
            DirNode { depth: COLLISION_DEPTH, bitmap: 2, slots }
        } else {
            let empty = DirNode { depth, bitmap: 0, slots: vec![] }.store(self.odb)?;
            let with_a = self.node_insert(empty, depth, a)?;
            return self.node_insert(with_a, depth, b);
        };
        node.store(self.odb)
    }

    fn collision_name(slot: &Slot) -> &str {
        match slot {
            Slot::Entry(entry) => &entry.name,
            Slot::Child(..) => unreachable!("collision nodes hold entries only"),
        }
    }

    /// removes `name`; `None` means the name was not present
    fn node_remove(&self, node_oid: Oid, depth: u8, name: &str) -> SagaResult<Option<Oid>> {
        let mut node = DirNode::load(self.odb, node_oid)?;

        if node.is_collision() {
            match node.slots.iter().position(|slot| Self::collision_name(slot) == name) {
                Some(pos) => {
                    node.slots.remove(pos);
                    node.bitmap -= 1;
                    return node.store(self.odb).map(Some);
                }
                None => return Ok(None),
            }
        }

        let hash = name_hash(name);
        let idx = Self::slot_index(hash, depth);
        let bit = 1u32 << idx;
        if node.bitmap & bit == 0 {
            return Ok(None);
        }
        let pos = (node.bitmap & (bit - 1)).count_ones() as usize;
        match node.slots[pos].clone() {
            Slot::Entry(existing) if existing.name == name => {
                node.slots.remove(pos);
                node.bitmap &= !bit;
            }
            Slot::Entry(..) => return Ok(None),
            Slot::Child(child_oid) => {
                let new_child = match self.node_remove(child_oid, depth + 1, name)? {
                    Some(oid) => oid,
                    None => return Ok(None),
                };
                // a subtree reduced to a single entry is folded back into
                // this node, however deep the removal left it
                match self.collapse_subtree(new_child)? {
                    Collapsed::Entry(entry) => node.slots[pos] = Slot::Entry(entry),
                    Collapsed::Empty => {
                        node.slots.remove(pos);
                        node.bitmap &= !bit;
                    }
                    Collapsed::Keep(oid) => node.slots[pos] = Slot::Child(oid),
                }
            }
        }
        node.store(self.odb).map(Some)
    }

    /// the folded form of a subtree after a removal: a lone entry is
    /// hoisted through any chain of single-child nodes; chains guarding
    /// two or more entries are canonical and kept
    fn collapse_subtree(&self, oid: Oid) -> SagaResult<Collapsed> {
        let node = DirNode::load(self.odb, oid)?;
        match node.slots.as_slice() {
            [] => Ok(Collapsed::Empty),
            [Slot::Entry(entry)] => Ok(Collapsed::Entry(entry.clone())),
            [Slot::Child(child)] => match self.collapse_subtree(*child)? {
                Collapsed::Keep(..) => Ok(Collapsed::Keep(oid)),
                collapsed => Ok(collapsed),
            },
            _ => Ok(Collapsed::Keep(oid)),
        }
    }

    fn node_lookup(&self, node_oid: Oid, depth: u8, name: &str) -> SagaResult<Option<DirEntry>> {
        let node = DirNode::load(self.odb, node_oid)?;

        if node.is_collision() {
            return Ok(node.slots.iter().find_map(|slot| match slot {
                Slot::Entry(entry) if entry.name == name => Some(entry.clone()),
                _ => None,
            }));
        }

        let hash = name_hash(name);
        let idx = Self::slot_index(hash, depth);
        let bit = 1u32 << idx;
        if node.bitmap & bit == 0 {
            return Ok(None);
        }
        let pos = (node.bitmap & (bit - 1)).count_ones() as usize;
        match &node.slots[pos] {
            Slot::Entry(entry) if entry.name == name => Ok(Some(entry.clone())),
            Slot::Entry(..) => Ok(None),
            Slot::Child(child) => self.node_lookup(*child, depth + 1, name),
        }
    }

    /// every entry of one directory level, across all trie nodes, unsorted
    fn node_entries(&self, node_oid: Oid) -> SagaResult<Vec<DirEntry>> {
        let mut entries = vec![];
        self.collect_entries(node_oid, &mut entries)?;
        Ok(entries)
    }

    fn collect_entries(&self, node_oid: Oid, out: &mut Vec<DirEntry>) -> SagaResult<()> {
        let node = DirNode::load(self.odb, node_oid)?;
        for slot in &node.slots {
            match slot {
                Slot::Entry(entry) => out.push(entry.clone()),
                Slot::Child(child) => self.collect_entries(*child, out)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
