use crate::db::{MetaDb, ANCESTOR_INDEX, MMR_LEAVES, MMR_META, MMR_NODES};
use crate::error::{SagaError, SagaResult};
use crate::hash::{hash_pair, Oid};
use crate::io::{ReadExt, WriteExt};
use redb::{ReadableTable, WriteTransaction};

const LEAF_COUNT_KEY: &str = "leaf-count";

// position arithmetic over the flat post-order mmr layout
//
// positions are 0-based; a mountain range over L leaves occupies
// 2L - popcount(L) node positions

fn all_ones(n: u64) -> bool {
    n != 0 && n.count_zeros() == n.leading_zeros()
}

fn jump_left(pos: u64) -> u64 {
    let bit_length = 64 - pos.leading_zeros();
    let most_significant = 1u64 << (bit_length - 1);
    pos - (most_significant - 1)
}

/// height of the node at `pos`; leaves have height zero
fn pos_height(pos: u64) -> u32 {
    let mut pos = pos + 1;
    while !all_ones(pos) {
        pos = jump_left(pos);
    }
    64 - pos.leading_zeros() - 1
}

/// total node positions occupied by a range over `leaf_count` leaves
fn mmr_size(leaf_count: u64) -> u64 {
    2 * leaf_count - leaf_count.count_ones() as u64
}

fn leaf_index_to_pos(index: u64) -> u64 {
    mmr_size(index)
}

/// peak positions left-to-right; one peak per set bit of `leaf_count`
fn peak_positions(leaf_count: u64) -> Vec<u64> {
    let mut acc = 0;
    let mut peaks = vec![];
    for bit in (0..64).rev() {
        let leaves = 1u64 << bit;
        if leaf_count & leaves != 0 {
            let nodes = 2 * leaves - 1;
            peaks.push(acc + nodes - 1);
            acc += nodes;
        }
    }
    peaks
}

/// bags peaks right-to-left; the accumulator always carries the right side
fn bag_peaks(peaks: &[Oid]) -> Oid {
    let mut iter = peaks.iter().rev();
    let mut acc = match iter.next() {
        Some(&peak) => peak,
        None => return Oid::ZERO,
    };
    for &peak in iter {
        acc = hash_pair(acc, peak);
    }
    acc
}

/// an inclusion proof for one leaf against the root at a fixed size
///
/// self-contained: verification needs only the proof, the leaf hash,
/// and the expected root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    pub leaf_index: u64,
    pub leaf_count: u64,
    /// sibling hashes from the leaf up to its peak
    pub path: Vec<Oid>,
    /// the other peaks, split around the proven leaf's peak
    pub peaks_before: Vec<Oid>,
    pub peaks_after: Vec<Oid>,
}

impl InclusionProof {
    pub fn verify(&self, leaf: Oid, root: Oid) -> bool {
        let peaks = peak_positions(self.leaf_count);
        let mut pos = leaf_index_to_pos(self.leaf_index);
        let mut height = 0;
        let mut hash = leaf;
        for &sibling in &self.path {
            if pos_height(pos + 1) == height + 1 {
                // `pos` is a right child
                hash = hash_pair(sibling, hash);
                pos += 1;
            } else {
                hash = hash_pair(hash, sibling);
                pos += (1 << (height + 1)) - 1 + 1;
            }
            height += 1;
        }
        if !peaks.contains(&pos) {
            return false;
        }
        let mut all_peaks = self.peaks_before.clone();
        all_peaks.push(hash);
        all_peaks.extend_from_slice(&self.peaks_after);
        if all_peaks.len() != peaks.len() {
            return false;
        }
        bag_peaks(&all_peaks) == root
    }
}

/// number of leaves appended so far
pub fn leaf_count(db: &MetaDb) -> SagaResult<u64> {
    let txn = db.begin_read()?;
    let table = txn.open_table(MMR_META)?;
    Ok(table.get(LEAF_COUNT_KEY)?.map(|guard| guard.value()).unwrap_or(0))
}

/// leaf count as seen by an open write transaction; commit creation
/// reads the next leaf index and appends in the same transaction
pub fn leaf_count_within(txn: &WriteTransaction) -> SagaResult<u64> {
    let table = txn.open_table(MMR_META)?;
    let value = table.get(LEAF_COUNT_KEY)?.map(|guard| guard.value()).unwrap_or(0);
    Ok(value)
}

/// appends a commit hash as the next leaf, combining equal-height peaks
/// on the way up; composes into the caller's transaction so commit
/// creation stays atomic
pub fn append(txn: &WriteTransaction, commit: Oid) -> SagaResult<u64> {
    let mut meta = txn.open_table(MMR_META)?;
    let mut nodes = txn.open_table(MMR_NODES)?;
    let mut leaves = txn.open_table(MMR_LEAVES)?;

    let count = meta.get(LEAF_COUNT_KEY)?.map(|guard| guard.value()).unwrap_or(0);
    let mut pos = leaf_index_to_pos(count);
    nodes.insert(pos, commit.as_bytes().as_slice())?;
    leaves.insert(count, commit.as_bytes().as_slice())?;

    let mut height = 0;
    let mut current = commit;
    while pos_height(pos + 1) > height {
        let left_pos = pos + 1 - (1 << (height + 1));
        let left = node_from_table(&nodes, left_pos)?;
        current = hash_pair(left, current);
        pos += 1;
        height += 1;
        nodes.insert(pos, current.as_bytes().as_slice())?;
    }

    meta.insert(LEAF_COUNT_KEY, count + 1)?;
    Ok(count)
}

fn node_from_table<T: ReadableTable<u64, &'static [u8]>>(table: &T, pos: u64) -> SagaResult<Oid> {
    match table.get(pos)? {
        Some(guard) => Oid::from_slice(guard.value()),
        None => bail!(SagaError::Corrupt(format!("missing mmr node at position {}", pos))),
    }
}

/// the commit hash recorded for a leaf index
pub fn commit_for_leaf(db: &MetaDb, index: u64) -> SagaResult<Oid> {
    let txn = db.begin_read()?;
    let table = txn.open_table(MMR_LEAVES)?;
    match table.get(index)? {
        Some(guard) => Oid::from_slice(guard.value()),
        None => bail!(SagaError::NotFound(format!("mmr leaf {}", index))),
    }
}

/// the root over the first `leaf_count` leaves; the mmr never rewrites,
/// so roots at historical sizes stay derivable
pub fn root_at(db: &MetaDb, leaf_count: u64) -> SagaResult<Oid> {
    if leaf_count == 0 {
        return Ok(Oid::ZERO);
    }
    let txn = db.begin_read()?;
    let nodes = txn.open_table(MMR_NODES)?;
    let peaks = peak_positions(leaf_count)
        .into_iter()
        .map(|pos| node_from_table(&nodes, pos))
        .collect::<SagaResult<Vec<_>>>()?;
    Ok(bag_peaks(&peaks))
}

pub fn root(db: &MetaDb) -> SagaResult<Oid> {
    let count = leaf_count(db)?;
    root_at(db, count)
}

/// builds the inclusion proof for `leaf_index` against the range of
/// `leaf_count` leaves
pub fn prove(db: &MetaDb, leaf_index: u64, leaf_count: u64) -> SagaResult<InclusionProof> {
    ensure!(
        leaf_index < leaf_count,
        SagaError::InvalidArgument(format!(
            "leaf {} is outside a range of {} leaves",
            leaf_index, leaf_count
        ))
    );
    let txn = db.begin_read()?;
    let nodes = txn.open_table(MMR_NODES)?;

    let peaks = peak_positions(leaf_count);
    let mut pos = leaf_index_to_pos(leaf_index);
    let mut height = 0;
    let mut path = vec![];
    while !peaks.contains(&pos) {
        let offset = (1u64 << (height + 1)) - 1;
        let sibling = if pos_height(pos + 1) == height + 1 {
            let sibling = pos - offset;
            pos += 1;
            sibling
        } else {
            let sibling = pos + offset;
            pos = sibling + 1;
            sibling
        };
        path.push(node_from_table(&nodes, sibling)?);
        height += 1;
    }

    let peak_idx = peaks.iter().position(|&peak| peak == pos).expect("loop ends on a peak");
    let peaks_before = peaks[..peak_idx]
        .iter()
        .map(|&peak| node_from_table(&nodes, peak))
        .collect::<SagaResult<Vec<_>>>()?;
    let peaks_after = peaks[peak_idx + 1..]
        .iter()
        .map(|&peak| node_from_table(&nodes, peak))
        .collect::<SagaResult<Vec<_>>>()?;

    Ok(InclusionProof { leaf_index, leaf_count, path, peaks_before, peaks_after })
}

// binary-lifting ancestor index along first-parent chains
//
// per commit we persist its first-parent depth plus pointers to the
// ancestors at distances 1, 2, 4, 8, ...; lca and ancestry queries are
// then logarithmic in history depth

struct AncestorRecord {
    depth: u64,
    ups: Vec<Oid>,
}

impl AncestorRecord {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_varint(self.depth).expect("vec writes are infallible");
        buf.write_varint(self.ups.len() as u64).expect("vec writes are infallible");
        for &up in &self.ups {
            buf.write_oid(up).expect("vec writes are infallible");
        }
        buf
    }

    fn decode(mut bytes: &[u8]) -> SagaResult<Self> {
        let reader = &mut bytes;
        let depth = reader.read_varint()?;
        let count = reader.read_varint()? as usize;
        let mut ups = Vec::with_capacity(count);
        for _ in 0..count {
            ups.push(reader.read_oid()?);
        }
        Ok(Self { depth, ups })
    }
}

fn ancestor_record<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    commit: Oid,
) -> SagaResult<AncestorRecord> {
    match table.get(commit.as_bytes().as_slice())? {
        Some(guard) => AncestorRecord::decode(guard.value()),
        None => bail!(SagaError::NotFound(format!("ancestor record for `{}`", commit))),
    }
}

/// records the lifting pointers for a freshly created commit; must run
/// in the same transaction as the mmr append
pub fn record_ancestors(
    txn: &WriteTransaction,
    commit: Oid,
    first_parent: Option<Oid>,
) -> SagaResult<()> {
    let mut table = txn.open_table(ANCESTOR_INDEX)?;
    let record = match first_parent {
        None => AncestorRecord { depth: 0, ups: vec![] },
        Some(parent) => {
            let parent_record = ancestor_record(&table, parent)?;
            let mut ups = vec![parent];
            // ups[k] = 2^(k-1) ancestor of ups[k-1]
            for k in 1.. {
                let prev = ups[k - 1];
                let prev_record = ancestor_record(&table, prev)?;
                match prev_record.ups.get(k - 1) {
                    Some(&up) => ups.push(up),
                    None => break,
                }
            }
            AncestorRecord { depth: parent_record.depth + 1, ups }
        }
    };
    table.insert(commit.as_bytes().as_slice(), record.encode().as_slice())?;
    Ok(())
}

/// first-parent depth of a commit (root commits have depth zero)
pub fn depth(db: &MetaDb, commit: Oid) -> SagaResult<u64> {
    let txn = db.begin_read()?;
    let table = txn.open_table(ANCESTOR_INDEX)?;
    Ok(ancestor_record(&table, commit)?.depth)
}

fn lift<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    mut commit: Oid,
    mut distance: u64,
) -> SagaResult<Option<Oid>> {
    while distance > 0 {
        let record = ancestor_record(table, commit)?;
        let k = distance.trailing_zeros() as usize;
        match record.ups.get(k) {
            Some(&up) => commit = up,
            None => return Ok(None),
        }
        distance &= distance - 1;
    }
    Ok(Some(commit))
}

/// lowest common ancestor of two commits along their first-parent
/// chains, answered via binary lifting
pub fn lowest_common_ancestor(db: &MetaDb, a: Oid, b: Oid) -> SagaResult<Option<Oid>> {
    if a == b {
        return Ok(Some(a));
    }
    let txn = db.begin_read()?;
    let table = txn.open_table(ANCESTOR_INDEX)?;

    let depth_a = ancestor_record(&table, a)?.depth;
    let depth_b = ancestor_record(&table, b)?.depth;

    // level both commits to the shallower depth
    let (mut a, mut b) = (a, b);
    if depth_a > depth_b {
        a = match lift(&table, a, depth_a - depth_b)? {
            Some(commit) => commit,
            None => return Ok(None),
        };
    } else if depth_b > depth_a {
        b = match lift(&table, b, depth_b - depth_a)? {
            Some(commit) => commit,
            None => return Ok(None),
        };
    }
    if a == b {
        return Ok(Some(a));
    }

    // descend from the highest jump that keeps the chains apart
    let mut k = 63;
    loop {
        let up_a = lift(&table, a, 1 << k)?;
        let up_b = lift(&table, b, 1 << k)?;
        if let (Some(up_a), Some(up_b)) = (up_a, up_b) {
            if up_a != up_b {
                a = up_a;
                b = up_b;
            }
        }
        if k == 0 {
            break;
        }
        k -= 1;
    }

    let parent_a = lift(&table, a, 1)?;
    let parent_b = lift(&table, b, 1)?;
    Ok(match (parent_a, parent_b) {
        (Some(parent_a), Some(parent_b)) if parent_a == parent_b => Some(parent_a),
        _ => None,
    })
}

/// true when `ancestor` lies on the first-parent chain above `descendant`
pub fn is_ancestor(db: &MetaDb, ancestor: Oid, descendant: Oid) -> SagaResult<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    let txn = db.begin_read()?;
    let table = txn.open_table(ANCESTOR_INDEX)?;
    let depth_anc = ancestor_record(&table, ancestor)?.depth;
    let depth_desc = ancestor_record(&table, descendant)?.depth;
    if depth_anc >= depth_desc {
        return Ok(false);
    }
    Ok(lift(&table, descendant, depth_desc - depth_anc)? == Some(ancestor))
}
