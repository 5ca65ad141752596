use crate::db::{MetaDb, SHELVES};
use crate::error::{SagaError, SagaResult};
use crate::hash::Oid;
use crate::io::{ReadExt, WriteExt};
use crate::path::RepoPath;
use crate::time::Timestamp;
use log::debug;
use redb::ReadableTable;

/// a persisted snapshot of uncommitted workspace state, captured when
/// leaving a timeline and restored on return
///
/// the indexes are stored as objects through the cas; the shelf record
/// itself holds only their identities plus the staged-path list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelfEntry {
    pub timeline: String,
    pub created_at: Timestamp,
    /// the divergent workspace index at departure time
    pub workspace_index: Oid,
    /// the index of the departing timeline's committed tip
    pub base_index: Oid,
    pub staged_paths: Vec<RepoPath>,
    pub consumed: bool,
}

impl ShelfEntry {
    fn encode(&self) -> SagaResult<Vec<u8>> {
        let mut buf = vec![];
        buf.write_str(&self.timeline)?;
        buf.write_i64(self.created_at.as_nanos())?;
        buf.write_oid(self.workspace_index)?;
        buf.write_oid(self.base_index)?;
        buf.write_varint(self.staged_paths.len() as u64)?;
        for path in &self.staged_paths {
            buf.write_str(path.as_str())?;
        }
        buf.write_u8(self.consumed as u8)?;
        Ok(buf)
    }

    fn decode(mut bytes: &[u8]) -> SagaResult<Self> {
        let reader = &mut bytes;
        let timeline = reader.read_str()?;
        let created_at = Timestamp::from_nanos(reader.read_i64()?);
        let workspace_index = reader.read_oid()?;
        let base_index = reader.read_oid()?;
        let count = reader.read_varint()? as usize;
        let mut staged_paths = Vec::with_capacity(count);
        for _ in 0..count {
            staged_paths.push(RepoPath::new(reader.read_str()?)?);
        }
        let consumed = reader.read_u8()? != 0;
        Ok(Self { timeline, created_at, workspace_index, base_index, staged_paths, consumed })
    }
}

fn archive_prefix(timeline: &str) -> String {
    format!("archive/{}/", timeline)
}

/// at most one active auto-shelf per timeline; replaced or consumed
/// shelves move to archive keys and stay inspectable
pub struct ShelfStore<'a> {
    db: &'a MetaDb,
}

impl<'a> ShelfStore<'a> {
    pub fn new(db: &'a MetaDb) -> Self {
        Self { db }
    }

    /// records `entry` as the active shelf for its timeline; an existing
    /// active shelf is archived, never lost
    pub fn save(&self, entry: &ShelfEntry) -> SagaResult<()> {
        debug!("ShelfStore::save(timeline: {})", entry.timeline);
        self.db.with_write(|txn| {
            let mut table = txn.open_table(SHELVES)?;
            let existing = match table.get(entry.timeline.as_str())? {
                Some(guard) => Some(ShelfEntry::decode(guard.value())?),
                None => None,
            };
            if let Some(existing) = existing {
                let key = Self::archive_key(&table, &existing)?;
                table.insert(key.as_str(), existing.encode()?.as_slice())?;
            }
            table.insert(entry.timeline.as_str(), entry.encode()?.as_slice())?;
            Ok(())
        })
    }

    pub fn load(&self, timeline: &str) -> SagaResult<Option<ShelfEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SHELVES)?;
        match table.get(timeline)? {
            Some(guard) => Ok(Some(ShelfEntry::decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// consumes the active shelf: removes it from the active slot and
    /// archives it with the consumed flag set
    pub fn consume(&self, timeline: &str) -> SagaResult<ShelfEntry> {
        self.db.with_write(|txn| {
            let mut table = txn.open_table(SHELVES)?;
            let entry = match table.remove(timeline)? {
                Some(guard) => ShelfEntry::decode(guard.value())?,
                None => bail!(SagaError::NotFound(format!("shelf for timeline `{}`", timeline))),
            };
            let mut archived = entry.clone();
            archived.consumed = true;
            let key = Self::archive_key(&table, &archived)?;
            table.insert(key.as_str(), archived.encode()?.as_slice())?;
            Ok(entry)
        })
    }

    /// archived (replaced or consumed) shelves for a timeline, oldest first
    pub fn archived(&self, timeline: &str) -> SagaResult<Vec<ShelfEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SHELVES)?;
        let prefix = archive_prefix(timeline);
        let mut entries = vec![];
        for item in table.iter()? {
            let (key, value) = item?;
            if key.value().starts_with(&prefix) {
                entries.push(ShelfEntry::decode(value.value())?);
            }
        }
        Ok(entries)
    }

    /// archive keys carry a sequence number so identical timestamps
    /// never clobber an archived record
    fn archive_key<T: ReadableTable<&'static str, &'static [u8]>>(
        table: &T,
        entry: &ShelfEntry,
    ) -> SagaResult<String> {
        let prefix = archive_prefix(&entry.timeline);
        let mut sequence = 0;
        for item in table.iter()? {
            let (key, _) = item?;
            if key.value().starts_with(&prefix) {
                sequence += 1;
            }
        }
        Ok(format!("{}{}-{}", prefix, entry.created_at.as_nanos(), sequence))
    }
}
