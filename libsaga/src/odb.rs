use crate::error::{SagaError, SagaResult};
use crate::hash::{self, Oid};
use log::trace;
use rayon::prelude::*;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

/// the content-addressed store: immutable byte blobs keyed by the blake3 of their payload
///
/// a trait rather than a concrete type so embeddings can supply alternate
/// backends; the filesystem implementation below is the only one the core ships
pub trait Odb: Send + Sync {
    /// stores the bytes; a no-op if the content already exists
    fn put(&self, bytes: &[u8]) -> SagaResult<Oid>;

    /// returns the exact bytes previously put, verifying the digest on read
    fn get(&self, oid: Oid) -> SagaResult<Vec<u8>>;

    fn has(&self, oid: Oid) -> SagaResult<bool>;

    /// batched put; atomic per item but not across items
    fn put_many(&self, items: &[Vec<u8>]) -> SagaResult<Vec<Oid>> {
        items.iter().map(|bytes| self.put(bytes)).collect()
    }
}

/// loose filesystem backend: one file per object under a two-level
/// directory layout keyed by the first hex byte of the hash
pub struct LooseOdb {
    objects_path: PathBuf,
}

impl LooseOdb {
    pub fn new(objects_path: impl AsRef<Path>) -> SagaResult<Self> {
        let objects_path = objects_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&objects_path)?;
        Ok(Self { objects_path })
    }

    // this should be infallible as it is used by write
    // in particular, this should *not* check for the existence of the path
    fn obj_path(&self, oid: Oid) -> PathBuf {
        let (dir, file) = oid.split();
        self.objects_path.join(dir).join(file)
    }
}

impl Odb for LooseOdb {
    fn put(&self, bytes: &[u8]) -> SagaResult<Oid> {
        let oid = hash::hash_bytes(bytes);
        let path = self.obj_path(oid);

        if path.exists() {
            #[cfg(debug_assertions)]
            {
                let existing = std::fs::read(&path)?;
                assert_eq!(existing, bytes, "same hash, different contents :O");
            }
            return Ok(oid);
        }

        let dir = path.parent().expect("object path always has a shard directory");
        std::fs::create_dir_all(dir)?;
        // stage to a temp name and atomically rename; concurrent writers of the
        // same content race benignly as both rename identical bytes into place
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(&path).map_err(|err| err.error)?;
        trace!("LooseOdb::put(..) :: wrote `{}` ({} bytes)", oid, bytes.len());
        Ok(oid)
    }

    fn get(&self, oid: Oid) -> SagaResult<Vec<u8>> {
        let path = self.obj_path(oid);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound =>
                bail!(SagaError::ObjectNotFound(oid)),
            Err(err) => return Err(err.into()),
        };
        let mut bytes = vec![];
        file.read_to_end(&mut bytes)?;

        let actual = hash::hash_bytes(&bytes);
        if actual != oid {
            bail!(SagaError::Corrupt(format!(
                "object `{}` hashes to `{}` on read",
                oid, actual
            )));
        }
        Ok(bytes)
    }

    fn has(&self, oid: Oid) -> SagaResult<bool> {
        Ok(self.obj_path(oid).exists())
    }

    fn put_many(&self, items: &[Vec<u8>]) -> SagaResult<Vec<Oid>> {
        items.par_iter().map(|bytes| self.put(bytes)).collect()
    }
}

#[cfg(test)]
mod tests;
