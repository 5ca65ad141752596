use crate::error::SagaResult;
use log::trace;
use redb::{Database, ReadTransaction, TableDefinition, WriteTransaction};
use std::path::Path;

// the buckets of the metadata database
//
// every mutating operation on refs, seal names, the mmr, shelves, and merge
// sessions is a single write transaction over one or more of these tables;
// a crash mid-transaction leaves no partial state visible
pub const LOCAL_REFS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("refs/local");
pub const REMOTE_REFS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("refs/remote");
pub const TAG_REFS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("refs/tags");
pub const HEAD: TableDefinition<'_, &str, &str> = TableDefinition::new("head");
pub const SEAL_NAMES: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("seal-names");
pub const MMR_NODES: TableDefinition<'_, u64, &[u8]> = TableDefinition::new("mmr/nodes");
pub const MMR_LEAVES: TableDefinition<'_, u64, &[u8]> = TableDefinition::new("mmr/leaves");
pub const MMR_META: TableDefinition<'_, &str, u64> = TableDefinition::new("mmr/meta");
pub const ANCESTOR_INDEX: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("ancestor-index");
pub const REMOTE_CONFIG: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("remote-config");
pub const SHELVES: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("shelves");
pub const MERGE_SESSION: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("merge-session");
pub const MERGE_HISTORY: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("merge-history");
pub const MATERIALIZE_STATE: TableDefinition<'_, &str, &[u8]> =
    TableDefinition::new("materialize-state");

/// durable key/value buckets with atomic multi-bucket write transactions
pub struct MetaDb {
    db: Database,
}

impl MetaDb {
    pub fn open(path: impl AsRef<Path>) -> SagaResult<Self> {
        let db = Database::create(path.as_ref())?;
        let this = Self { db };
        // eagerly create every bucket so later read transactions never
        // observe a missing table on a fresh database
        let txn = this.begin_write()?;
        {
            txn.open_table(LOCAL_REFS)?;
            txn.open_table(REMOTE_REFS)?;
            txn.open_table(TAG_REFS)?;
            txn.open_table(HEAD)?;
            txn.open_table(SEAL_NAMES)?;
            txn.open_table(MMR_NODES)?;
            txn.open_table(MMR_LEAVES)?;
            txn.open_table(MMR_META)?;
            txn.open_table(ANCESTOR_INDEX)?;
            txn.open_table(REMOTE_CONFIG)?;
            txn.open_table(SHELVES)?;
            txn.open_table(MERGE_SESSION)?;
            txn.open_table(MERGE_HISTORY)?;
            txn.open_table(MATERIALIZE_STATE)?;
        }
        txn.commit()?;
        Ok(this)
    }

    pub fn begin_read(&self) -> SagaResult<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    pub fn begin_write(&self) -> SagaResult<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    /// runs `f` inside a write transaction, committing on `Ok` and
    /// aborting on `Err`
    pub fn with_write<R>(&self, f: impl FnOnce(&WriteTransaction) -> SagaResult<R>) -> SagaResult<R> {
        let txn = self.begin_write()?;
        match f(&txn) {
            Ok(r) => {
                txn.commit()?;
                Ok(r)
            }
            Err(err) => {
                trace!("MetaDb::with_write(..) :: aborting transaction: {}", err);
                txn.abort()?;
                Err(err)
            }
        }
    }
}
