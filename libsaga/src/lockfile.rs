use crate::error::SagaResult;
use anyhow::Context;
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

const LOCK_FILE_EXT: &str = "lock";

bitflags! {
    pub struct LockfileFlags: u8 {
        const SET_READONLY = 1;
    }
}

/// guards a file update: writes go to `<path>.lock` and are atomically
/// renamed over the target on commit, or discarded on rollback
#[derive(Debug)]
pub struct Lockfile {
    // the file that this lockfile is guarding, None if it does not exist yet
    file: Option<File>,
    // the lockfile itself
    lockfile: File,
    flags: LockfileFlags,
    path: PathBuf,
    lockfile_path: PathBuf,
    committed: Cell<bool>,
    rolled_back: Cell<bool>,
}

impl Write for Lockfile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lockfile.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lockfile.flush()
    }
}

impl Lockfile {
    /// accepts the path to the file to be locked
    /// this function will create a lockfile with an extension `<path>.lock`
    // consumers of this api should never have access to the lockfile
    // directly, instead they should use the `with_` apis
    fn open(path: impl AsRef<Path>, flags: LockfileFlags) -> SagaResult<Self> {
        let path = path.as_ref();
        assert!(!path.exists() || path.is_file(), "cannot create lock on symlinks or directories");
        let lockfile_path = path.with_extension(LOCK_FILE_EXT);
        path.parent().map(std::fs::create_dir_all).transpose()?;
        let lockfile = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&lockfile_path)
            .or_else(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => Err(err).with_context(|| {
                    format!(
                        "failed to lock file `{}` (`{}` already exists)",
                        path.display(),
                        lockfile_path.display()
                    )
                }),
                _ => Err(err)
                    .with_context(|| format!("failed to create file `{}`", path.display())),
            })?;

        let file = path.exists().then(|| File::open(path)).transpose()?;

        Ok(Self {
            file,
            lockfile,
            flags,
            lockfile_path,
            path: path.to_path_buf(),
            committed: Cell::new(false),
            rolled_back: Cell::new(false),
        })
    }

    // should never have mutable access to `self.file`
    // as any writes should be done to the lockfile only
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn with_readonly<R>(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        f: impl FnOnce(&Self) -> SagaResult<R>,
    ) -> SagaResult<R> {
        let lockfile = Self::open(path, flags)?;
        let r = f(&lockfile);
        lockfile.rollback();
        r
    }

    pub fn with_mut<R>(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        f: impl FnOnce(&mut Self) -> SagaResult<R>,
    ) -> SagaResult<R> {
        Self::open(path, flags)?.with_mut_inner(f)
    }

    /// runs a function under the lock having mutable access to the underlying file
    /// if the closure returns an `Err` then the transaction is rolled back, otherwise it is
    /// committed to disk
    fn with_mut_inner<R>(mut self, f: impl FnOnce(&mut Self) -> SagaResult<R>) -> SagaResult<R> {
        match f(&mut self) {
            Ok(r) => {
                self.commit().with_context(|| anyhow!(
                        "failed to write lockfile to `{}`; the updated contents are stored in `{}`; please remove this file when done",
                        self.path.display(),
                        self.lockfile_path.display()
                    )
                )?;
                Ok(r)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// commits this file by renaming it to the target file
    /// replaces the old file if it exists
    fn commit(&self) -> io::Result<()> {
        // ignore commit after a rollback
        if self.rolled_back.get() {
            return Ok(());
        }
        let set_readonly = self.flags.contains(LockfileFlags::SET_READONLY);
        if set_readonly && self.path.exists() {
            let mut permissions = self.path.metadata()?.permissions();
            permissions.set_readonly(false);
            std::fs::set_permissions(&self.path, permissions)?;
        }

        std::fs::rename(&self.lockfile_path, &self.path)?;
        self.committed.set(true);

        if set_readonly {
            let mut permissions = self.path.metadata()?.permissions();
            permissions.set_readonly(true);
            std::fs::set_permissions(&self.path, permissions)?;
        }

        Ok(())
    }

    fn cleanup(&self) -> SagaResult<()> {
        std::fs::remove_file(&self.lockfile_path).with_context(|| {
            format!("failed to remove lockfile `{}`", self.lockfile_path.display())
        })
    }

    pub fn rollback(&self) {
        // don't do anything until the drop impl
        self.rolled_back.set(true);
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        // can't be both rolled_back and committed
        assert!(!self.rolled_back.get() || !self.committed.get());
        // if either explicitly rolled back, or not explicitly committed, then rollback
        if self.rolled_back.get() || !self.committed.get() {
            self.cleanup().expect("failed to remove lockfile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_replaces_target() -> SagaResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("target");
        std::fs::write(&path, "old")?;
        Lockfile::with_mut(&path, LockfileFlags::empty(), |lockfile| {
            lockfile.write_all(b"new")?;
            Ok(())
        })?;
        assert_eq!(std::fs::read_to_string(&path)?, "new");
        assert!(!path.with_extension(LOCK_FILE_EXT).exists());
        Ok(())
    }

    #[test]
    fn rollback_on_error_leaves_target_untouched() -> SagaResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("target");
        std::fs::write(&path, "old")?;
        let res: SagaResult<()> = Lockfile::with_mut(&path, LockfileFlags::empty(), |lockfile| {
            lockfile.write_all(b"new")?;
            bail!("nope")
        });
        assert!(res.is_err());
        assert_eq!(std::fs::read_to_string(&path)?, "old");
        assert!(!path.with_extension(LOCK_FILE_EXT).exists());
        Ok(())
    }
}
