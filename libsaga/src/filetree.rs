use crate::error::{SagaError, SagaResult};
use crate::hash::{Checksummer, Oid};
use crate::io::{ReadExt, WriteExt};
use crate::odb::Odb;
use crate::serialize::{Deserialize, Serialize};
use fastcdc::v2020::StreamCDC;
use std::io::prelude::*;

// content-defined chunking parameters
//
// these constants shape every file-tree hash: two repositories dedup
// against each other iff they agree on them
pub const MIN_CHUNK: u32 = 16 * 1024;
pub const TARGET_CHUNK: u32 = 64 * 1024;
pub const MAX_CHUNK: u32 = 256 * 1024;

/// children per internal node
pub const FAN_OUT: usize = 128;

const LEAF_TAG: u8 = 0x00;
const INTERNAL_TAG: u8 = 0x01;

/// handle to a stored file: the root node hash plus the file length
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FileRef {
    pub root: Oid,
    pub size: u64,
}

/// an in-order leaf of a file tree: the raw chunk's content hash and length
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ChunkRef {
    pub oid: Oid,
    pub size: u64,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ChildRef {
    /// running total of subtree sizes within the parent, up to and including this child
    pub cumulative: u64,
    pub node: Oid,
}

/// a node of the merkle file tree
///
/// leaves reference a raw chunk in the object store; internal nodes
/// reference child nodes with cumulative sizes for O(depth) range lookups
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum FileNode {
    Leaf { chunk: Oid, size: u64 },
    Internal { children: Vec<ChildRef> },
}

impl FileNode {
    /// total number of content bytes below this node
    pub fn subtree_size(&self) -> u64 {
        match self {
            FileNode::Leaf { size, .. } => *size,
            FileNode::Internal { children } =>
                children.last().map(|child| child.cumulative).unwrap_or(0),
        }
    }

    fn load(odb: &dyn Odb, oid: Oid) -> SagaResult<Self> {
        Self::deserialize_from_slice(&odb.get(oid)?)
    }

    fn store(&self, odb: &dyn Odb) -> SagaResult<Oid> {
        odb.put(&self.to_bytes()?)
    }
}

impl Serialize for FileNode {
    fn serialize(&self, writer: &mut dyn Write) -> SagaResult<()> {
        match self {
            FileNode::Leaf { chunk, size } => {
                writer.write_u8(LEAF_TAG)?;
                writer.write_varint(*size)?;
                writer.write_oid(*chunk)?;
            }
            FileNode::Internal { children } => {
                writer.write_u8(INTERNAL_TAG)?;
                writer.write_varint(children.len() as u64)?;
                for child in children {
                    writer.write_varint(child.cumulative)?;
                    writer.write_oid(child.node)?;
                }
            }
        }
        Ok(())
    }
}

impl Deserialize for FileNode {
    fn deserialize(reader: &mut impl BufRead) -> SagaResult<Self> {
        match reader.read_u8()? {
            LEAF_TAG => {
                let size = reader.read_varint()?;
                let chunk = reader.read_oid()?;
                Ok(FileNode::Leaf { chunk, size })
            }
            INTERNAL_TAG => {
                let count = reader.read_varint()? as usize;
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    let cumulative = reader.read_varint()?;
                    let node = reader.read_oid()?;
                    children.push(ChildRef { cumulative, node });
                }
                Ok(FileNode::Internal { children })
            }
            tag => bail!(SagaError::Corrupt(format!("unknown file node tag `{:#04x}`", tag))),
        }
    }
}

/// a built file plus the blake3 checksum of its full content, computed
/// in the same streaming pass
#[derive(Copy, Clone, Debug)]
pub struct BuiltFile {
    pub file: FileRef,
    pub checksum: Oid,
}

/// chunks the reader, stores chunks and nodes, and returns the file root
///
/// streaming: only one chunk is resident at a time
pub fn build(odb: &dyn Odb, reader: impl Read) -> SagaResult<FileRef> {
    build_with_checksum(odb, reader).map(|built| built.file)
}

pub fn build_with_checksum(odb: &dyn Odb, reader: impl Read) -> SagaResult<BuiltFile> {
    let mut checksummer = Checksummer::new();
    let mut leaves = vec![];

    for chunk in StreamCDC::new(reader, MIN_CHUNK, TARGET_CHUNK, MAX_CHUNK) {
        let chunk = chunk?;
        checksummer.update(&chunk.data);
        let oid = odb.put(&chunk.data)?;
        leaves.push(ChunkRef { oid, size: chunk.length as u64 });
    }

    let file = build_from_chunks(odb, &leaves)?;
    Ok(BuiltFile { file, checksum: checksummer.finalize() })
}

/// assembles a file tree over an existing sequence of stored chunks
pub fn build_from_chunks(odb: &dyn Odb, chunks: &[ChunkRef]) -> SagaResult<FileRef> {
    // an empty file is a leaf over the empty chunk
    if chunks.is_empty() {
        let chunk = odb.put(b"")?;
        let root = FileNode::Leaf { chunk, size: 0 }.store(odb)?;
        return Ok(FileRef { root, size: 0 });
    }

    let size = chunks.iter().map(|chunk| chunk.size).sum();

    // (node oid, subtree size) pairs for the current level
    let mut level = chunks
        .iter()
        .map(|chunk| {
            let node = FileNode::Leaf { chunk: chunk.oid, size: chunk.size };
            Ok((node.store(odb)?, chunk.size))
        })
        .collect::<SagaResult<Vec<_>>>()?;

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + FAN_OUT - 1) / FAN_OUT);
        for group in level.chunks(FAN_OUT) {
            let mut cumulative = 0;
            let children = group
                .iter()
                .map(|&(node, subtree_size)| {
                    cumulative += subtree_size;
                    ChildRef { cumulative, node }
                })
                .collect::<Vec<_>>();
            let node = FileNode::Internal { children };
            next.push((node.store(odb)?, cumulative));
        }
        level = next;
    }

    let (root, _) = level[0];
    Ok(FileRef { root, size })
}

pub fn read_all(odb: &dyn Odb, file: FileRef) -> SagaResult<Vec<u8>> {
    let mut out = Vec::with_capacity(file.size as usize);
    collect(odb, file.root, &mut out)?;
    Ok(out)
}

fn collect(odb: &dyn Odb, node: Oid, out: &mut Vec<u8>) -> SagaResult<()> {
    match FileNode::load(odb, node)? {
        FileNode::Leaf { chunk, .. } => out.extend_from_slice(&odb.get(chunk)?),
        FileNode::Internal { children } =>
            for child in children {
                collect(odb, child.node, out)?;
            },
    }
    Ok(())
}

/// reads `len` bytes starting at `offset`; O(depth) to locate the
/// first chunk, O(len / chunk) to assemble
pub fn read_range(odb: &dyn Odb, file: FileRef, offset: u64, len: u64) -> SagaResult<Vec<u8>> {
    if offset + len > file.size {
        bail!(SagaError::OutOfRange { size: file.size, offset, len });
    }
    let mut out = Vec::with_capacity(len as usize);
    collect_range(odb, file.root, offset, len, &mut out)?;
    Ok(out)
}

fn collect_range(odb: &dyn Odb, node: Oid, offset: u64, len: u64, out: &mut Vec<u8>) -> SagaResult<()> {
    if len == 0 {
        return Ok(());
    }
    match FileNode::load(odb, node)? {
        FileNode::Leaf { chunk, .. } => {
            let bytes = odb.get(chunk)?;
            out.extend_from_slice(&bytes[offset as usize..(offset + len) as usize]);
        }
        FileNode::Internal { children } => {
            let mut start = 0;
            for child in children {
                let end = child.cumulative;
                // intersect [offset, offset + len) with this child's [start, end)
                if end > offset && start < offset + len {
                    let child_offset = offset.saturating_sub(start);
                    let child_len = (offset + len).min(end) - start.max(offset);
                    collect_range(odb, child.node, child_offset, child_len, out)?;
                }
                start = end;
            }
        }
    }
    Ok(())
}

/// the in-order sequence of raw chunk references; the unit the merge
/// engine diffs over
pub fn chunk_sequence(odb: &dyn Odb, file: FileRef) -> SagaResult<Vec<ChunkRef>> {
    let mut chunks = vec![];
    collect_chunks(odb, file.root, &mut chunks)?;
    Ok(chunks)
}

fn collect_chunks(odb: &dyn Odb, node: Oid, out: &mut Vec<ChunkRef>) -> SagaResult<()> {
    match FileNode::load(odb, node)? {
        FileNode::Leaf { chunk, size } => out.push(ChunkRef { oid: chunk, size }),
        FileNode::Internal { children } =>
            for child in children {
                collect_chunks(odb, child.node, out)?;
            },
    }
    Ok(())
}

/// resolves the size of a file given only its root node hash
/// (directory entries store the root but not the length)
pub fn file_size(odb: &dyn Odb, root: Oid) -> SagaResult<u64> {
    Ok(FileNode::load(odb, root)?.subtree_size())
}

/// runs raw bytes through the content-defined splitter and stores the
/// resulting chunks, without building a tree over them
pub fn chunk_bytes(odb: &dyn Odb, bytes: &[u8]) -> SagaResult<Vec<ChunkRef>> {
    let mut chunks = vec![];
    for chunk in StreamCDC::new(bytes, MIN_CHUNK, TARGET_CHUNK, MAX_CHUNK) {
        let chunk = chunk?;
        let oid = odb.put(&chunk.data)?;
        chunks.push(ChunkRef { oid, size: chunk.length as u64 });
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests;
