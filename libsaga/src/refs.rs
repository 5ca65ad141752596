use crate::db::{MetaDb, HEAD, LOCAL_REFS, REMOTE_CONFIG, REMOTE_REFS, SEAL_NAMES, TAG_REFS};
use crate::error::{SagaError, SagaResult};
use crate::hash::Oid;
use crate::io::{ReadExt, WriteExt};
use crate::time::Timestamp;
use log::trace;
use num_enum::TryFromPrimitive;
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use regex::Regex;
use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};

lazy_static! {
    /// defines what is an invalid reference name (anything else is valid)
    // a reference name is invalid if any of the following conditions are true
    // - any path component begins with `.` (i.e. `^.`, or `/.`)
    // - contains `..`
    // - contains any of the following `*` `:` `?` `[` `\` `^` `~` <space> <tab>
    // - ends with `/`
    // - contains `@{`
    static ref INVALID_NAME_REGEX: Regex =
        Regex::new(r#"^\.|/\.|\.\.|\*|:|\?|\[|\\|\^|~| |\t|/$|@\{"#).unwrap();
}

pub fn is_valid_name(s: &str) -> bool {
    !s.is_empty() && !INVALID_NAME_REGEX.is_match(s)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum RefKind {
    LocalTimeline  = 0,
    RemoteTimeline = 1,
    Tag            = 2,
}

impl Display for RefKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefKind::LocalTimeline => "timeline",
            RefKind::RemoteTimeline => "remote timeline",
            RefKind::Tag => "tag",
        };
        write!(f, "{}", s)
    }
}

fn table_for(kind: RefKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        RefKind::LocalTimeline => LOCAL_REFS,
        RefKind::RemoteTimeline => REMOTE_REFS,
        RefKind::Tag => TAG_REFS,
    }
}

/// a named mutable pointer into history
///
/// `primary` is the commit the ref points at (zero for an empty
/// timeline); `secondary` is an optional slot persisted verbatim with
/// no core semantics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaRef {
    pub name: String,
    pub kind: RefKind,
    pub primary: Oid,
    pub secondary: Oid,
    pub description: String,
    pub updated_at: Timestamp,
}

impl SagaRef {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_u8(self.kind as u8).expect("vec writes are infallible");
        buf.write_oid(self.primary).expect("vec writes are infallible");
        buf.write_oid(self.secondary).expect("vec writes are infallible");
        buf.write_i64(self.updated_at.as_nanos()).expect("vec writes are infallible");
        buf.write_str(&self.description).expect("vec writes are infallible");
        buf
    }

    fn decode(name: &str, mut bytes: &[u8]) -> SagaResult<Self> {
        let reader = &mut bytes;
        let kind = RefKind::try_from(reader.read_u8()?)
            .map_err(|err| anyhow!(SagaError::Corrupt(format!("invalid ref kind: {}", err))))?;
        let primary = reader.read_oid()?;
        let secondary = reader.read_oid()?;
        let updated_at = Timestamp::from_nanos(reader.read_i64()?);
        let description = reader.read_str()?;
        Ok(Self { name: name.to_owned(), kind, primary, secondary, description, updated_at })
    }
}

/// a recorded seal name with its commit and message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealRecord {
    pub name: String,
    pub commit: Oid,
    pub message: String,
    pub created_at: Timestamp,
}

impl SealRecord {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_oid(self.commit).expect("vec writes are infallible");
        buf.write_i64(self.created_at.as_nanos()).expect("vec writes are infallible");
        buf.write_str(&self.message).expect("vec writes are infallible");
        buf
    }

    fn decode(name: &str, mut bytes: &[u8]) -> SagaResult<Self> {
        let reader = &mut bytes;
        let commit = reader.read_oid()?;
        let created_at = Timestamp::from_nanos(reader.read_i64()?);
        let message = reader.read_str()?;
        Ok(Self { name: name.to_owned(), commit, message, created_at })
    }
}

/// named mutable pointers: timelines, tags, remote-tracking refs, the
/// current head, the seal-name index, and the remote-repo tuple
///
/// every mutating call is one database transaction
pub struct RefStore<'a> {
    db: &'a MetaDb,
}

impl<'a> RefStore<'a> {
    pub fn new(db: &'a MetaDb) -> Self {
        Self { db }
    }

    pub fn create(
        &self,
        name: &str,
        kind: RefKind,
        commit: Oid,
        description: &str,
    ) -> SagaResult<()> {
        ensure!(
            is_valid_name(name),
            SagaError::InvalidArgument(format!("invalid {} name `{}`", kind, name))
        );
        trace!("RefStore::create(name: {}, kind: {}, commit: {})", name, kind, commit);
        self.db.with_write(|txn| {
            let mut table = txn.open_table(table_for(kind))?;
            if table.get(name)?.is_some() {
                bail!(SagaError::AlreadyExists(name.to_owned()));
            }
            let saga_ref = SagaRef {
                name: name.to_owned(),
                kind,
                primary: commit,
                secondary: Oid::ZERO,
                description: description.to_owned(),
                updated_at: Timestamp::now(),
            };
            table.insert(name, saga_ref.encode().as_slice())?;
            Ok(())
        })
    }

    pub fn update(&self, name: &str, kind: RefKind, commit: Oid) -> SagaResult<()> {
        self.db.with_write(|txn| Self::update_within(txn, name, kind, commit))
    }

    /// ref update composed into a caller-owned transaction (commit
    /// creation updates the timeline tip atomically with the mmr append)
    pub fn update_within(
        txn: &WriteTransaction,
        name: &str,
        kind: RefKind,
        commit: Oid,
    ) -> SagaResult<()> {
        let mut table = txn.open_table(table_for(kind))?;
        let mut saga_ref = match table.get(name)? {
            Some(guard) => SagaRef::decode(name, guard.value())?,
            None => bail!(SagaError::NotFound(name.to_owned())),
        };
        saga_ref.primary = commit;
        saga_ref.updated_at = Timestamp::now();
        table.insert(name, saga_ref.encode().as_slice())?;
        Ok(())
    }

    pub fn delete(&self, name: &str, kind: RefKind) -> SagaResult<()> {
        if kind == RefKind::LocalTimeline {
            if let Ok(current) = self.current_timeline() {
                ensure!(
                    current != name,
                    SagaError::InvalidArgument(format!(
                        "cannot delete the current timeline `{}`",
                        name
                    ))
                );
            }
        }
        self.db.with_write(|txn| {
            let mut table = txn.open_table(table_for(kind))?;
            if table.remove(name)?.is_none() {
                bail!(SagaError::NotFound(name.to_owned()));
            }
            Ok(())
        })
    }

    pub fn get(&self, name: &str, kind: RefKind) -> SagaResult<SagaRef> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table_for(kind))?;
        match table.get(name)? {
            Some(guard) => SagaRef::decode(name, guard.value()),
            None => bail!(SagaError::NotFound(name.to_owned())),
        }
    }

    /// all refs of a kind, ordered by name
    pub fn list(&self, kind: RefKind) -> SagaResult<Vec<SagaRef>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table_for(kind))?;
        let mut refs = vec![];
        for entry in table.iter()? {
            let (name, value) = entry?;
            refs.push(SagaRef::decode(name.value(), value.value())?);
        }
        Ok(refs)
    }

    pub fn current_timeline(&self) -> SagaResult<String> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(HEAD)?;
        match table.get("HEAD")? {
            Some(guard) => Ok(guard.value().to_owned()),
            None => bail!(SagaError::NoCurrentTimeline),
        }
    }

    pub fn set_current_timeline(&self, name: &str) -> SagaResult<()> {
        // the named timeline must exist before head can point at it
        self.get(name, RefKind::LocalTimeline)?;
        self.db.with_write(|txn| Self::set_current_timeline_within(txn, name))
    }

    pub fn set_current_timeline_within(txn: &WriteTransaction, name: &str) -> SagaResult<()> {
        txn.open_table(HEAD)?.insert("HEAD", name)?;
        Ok(())
    }

    // seal names

    pub fn store_seal_name(&self, name: &str, commit: Oid, message: &str) -> SagaResult<()> {
        self.db.with_write(|txn| Self::store_seal_name_within(txn, name, commit, message))
    }

    pub fn store_seal_name_within(
        txn: &WriteTransaction,
        name: &str,
        commit: Oid,
        message: &str,
    ) -> SagaResult<()> {
        let record = SealRecord {
            name: name.to_owned(),
            commit,
            message: message.to_owned(),
            created_at: Timestamp::now(),
        };
        txn.open_table(SEAL_NAMES)?.insert(name, record.encode().as_slice())?;
        Ok(())
    }

    /// resolves any unambiguous prefix of either the 4-word name or the
    /// hex commit hash
    pub fn seal_by_name(&self, prefix: &str) -> SagaResult<SealRecord> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SEAL_NAMES)?;
        let mut candidates = vec![];
        for entry in table.iter()? {
            let (name, value) = entry?;
            let record = SealRecord::decode(name.value(), value.value())?;
            if record.name.starts_with(prefix) || record.commit.to_hex().starts_with(prefix) {
                candidates.push(record);
            }
        }
        match candidates.len() {
            0 => bail!(SagaError::NotFound(prefix.to_owned())),
            1 => Ok(candidates.pop().expect("length was just checked")),
            _ => bail!(SagaError::AmbiguousSealName(
                prefix.to_owned(),
                candidates.into_iter().map(|record| record.name).collect(),
            )),
        }
    }

    pub fn seal_name_by_hash(&self, commit: Oid) -> SagaResult<String> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SEAL_NAMES)?;
        for entry in table.iter()? {
            let (name, value) = entry?;
            let record = SealRecord::decode(name.value(), value.value())?;
            if record.commit == commit {
                return Ok(record.name);
            }
        }
        bail!(SagaError::NotFound(commit.to_hex()))
    }

    // remote config: the (owner, repo) tuple of the configured portal

    pub fn set_remote_config(&self, owner: &str, repo: &str) -> SagaResult<()> {
        self.db.with_write(|txn| {
            let mut buf = vec![];
            buf.write_str(owner)?;
            buf.write_str(repo)?;
            txn.open_table(REMOTE_CONFIG)?.insert("origin", buf.as_slice())?;
            Ok(())
        })
    }

    pub fn get_remote_config(&self) -> SagaResult<Option<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(REMOTE_CONFIG)?;
        match table.get("origin")? {
            Some(guard) => {
                let mut bytes = guard.value();
                let reader = &mut bytes;
                let owner = reader.read_str()?;
                let repo = reader.read_str()?;
                Ok(Some((owner, repo)))
            }
            None => Ok(None),
        }
    }

    pub fn clear_remote_config(&self) -> SagaResult<()> {
        self.db.with_write(|txn| {
            txn.open_table(REMOTE_CONFIG)?.remove("origin")?;
            Ok(())
        })
    }
}
