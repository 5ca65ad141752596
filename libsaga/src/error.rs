use crate::hash::Oid;
use crate::merge::MergeConflicts;
use crate::path::RepoPath;
use std::fmt::{self, Display, Formatter};

pub type SagaResult<T> = Result<T, SagaGenericError>;
pub type SagaGenericError = anyhow::Error;

// usually we can just use anyhow for errors, but sometimes its nice to have a "rust" representation we can test or match against
#[derive(Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub enum SagaError {
    /// a content-addressed object is missing from the store
    ObjectNotFound(Oid),
    /// a named ref, seal name, or path does not exist
    NotFound(String),
    /// ref create against a name that is already taken
    AlreadyExists(String),
    /// content hash mismatch or malformed encoding
    Corrupt(String),
    /// chunk-level merge conflicts
    MergeConflict(MergeConflicts),
    /// the materializer refused to overwrite untracked or locally modified files
    WorkspaceConflict(Vec<RepoPath>),
    /// a seal-name prefix matched more than one recorded seal
    AmbiguousSealName(String, Vec<String>),
    /// invalid offset/length into a file tree
    OutOfRange { size: u64, offset: u64, len: u64 },
    /// another merge session is still active
    MergeInProgress,
    /// HEAD is unset
    NoCurrentTimeline,
    /// malformed path, forbidden character, empty name and friends
    InvalidArgument(String),
    /// the operation observed its cancellation signal
    Cancelled,
}

pub trait SagaErrorExt {
    fn try_into_saga_error(self) -> SagaResult<SagaError>;
    fn try_into_obj_not_found_err(self) -> SagaResult<Oid>;
    fn try_into_merge_conflict(self) -> SagaResult<MergeConflicts>;
    fn try_into_workspace_conflict(self) -> SagaResult<Vec<RepoPath>>;
    fn try_into_ambiguous_err(self) -> SagaResult<(String, Vec<String>)>;
}

impl SagaErrorExt for SagaGenericError {
    fn try_into_saga_error(self) -> SagaResult<SagaError> {
        self.downcast::<SagaError>()
    }

    /// tries to convert the generic error into the specific error and just returns the previous error on failure
    fn try_into_obj_not_found_err(self) -> SagaResult<Oid> {
        match self.try_into_saga_error()? {
            SagaError::ObjectNotFound(oid) => Ok(oid),
            err => Err(anyhow!(err)),
        }
    }

    fn try_into_merge_conflict(self) -> SagaResult<MergeConflicts> {
        match self.try_into_saga_error()? {
            SagaError::MergeConflict(conflicts) => Ok(conflicts),
            err => Err(anyhow!(err)),
        }
    }

    fn try_into_workspace_conflict(self) -> SagaResult<Vec<RepoPath>> {
        match self.try_into_saga_error()? {
            SagaError::WorkspaceConflict(paths) => Ok(paths),
            err => Err(anyhow!(err)),
        }
    }

    fn try_into_ambiguous_err(self) -> SagaResult<(String, Vec<String>)> {
        match self.try_into_saga_error()? {
            SagaError::AmbiguousSealName(prefix, candidates) => Ok((prefix, candidates)),
            err => Err(anyhow!(err)),
        }
    }
}

pub trait SagaResultExt {
    fn is_not_found_err(&self) -> bool;
    fn is_conflict_err(&self) -> bool;
    fn is_cancelled_err(&self) -> bool;
    fn is_fatal(&self) -> bool;
}

macro_rules! error_ext_is_method {
    ($method:ident) => {
        fn $method(&self) -> bool {
            match self {
                Ok(..) => false,
                Err(err) => err.$method(),
            }
        }
    };
}

impl<T> SagaResultExt for SagaResult<T> {
    error_ext_is_method!(is_not_found_err);

    error_ext_is_method!(is_conflict_err);

    error_ext_is_method!(is_cancelled_err);

    error_ext_is_method!(is_fatal);
}

impl SagaResultExt for SagaGenericError {
    fn is_not_found_err(&self) -> bool {
        match self.downcast_ref::<SagaError>() {
            Some(err) => matches!(err, SagaError::ObjectNotFound(..) | SagaError::NotFound(..)),
            None => false,
        }
    }

    fn is_conflict_err(&self) -> bool {
        match self.downcast_ref::<SagaError>() {
            Some(err) =>
                matches!(err, SagaError::MergeConflict(..) | SagaError::WorkspaceConflict(..)),
            None => false,
        }
    }

    fn is_cancelled_err(&self) -> bool {
        matches!(self.downcast_ref::<SagaError>(), Some(SagaError::Cancelled))
    }

    fn is_fatal(&self) -> bool {
        match self.downcast_ref::<SagaError>() {
            Some(err) => !matches!(
                err,
                SagaError::ObjectNotFound(..)
                    | SagaError::NotFound(..)
                    | SagaError::MergeConflict(..)
                    | SagaError::WorkspaceConflict(..)
                    | SagaError::AmbiguousSealName(..)
            ),
            None => true,
        }
    }
}

impl std::error::Error for SagaError {
}

impl Display for SagaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SagaError::ObjectNotFound(oid) => write!(f, "object `{}` not found", oid),
            SagaError::NotFound(name) => write!(f, "`{}` not found", name),
            SagaError::AlreadyExists(name) => write!(f, "`{}` already exists", name),
            SagaError::Corrupt(msg) => write!(f, "corrupt object: {}", msg),
            SagaError::MergeConflict(conflicts) => write!(f, "{}", conflicts),
            SagaError::WorkspaceConflict(paths) => {
                writeln!(f, "the following files would be overwritten:")?;
                for path in paths {
                    writeln!(f, "  {}", path)?;
                }
                Ok(())
            }
            SagaError::AmbiguousSealName(prefix, candidates) => {
                writeln!(f, "seal name prefix `{}` is ambiguous, candidates are:", prefix)?;
                for candidate in candidates {
                    writeln!(f, "  {}", candidate)?;
                }
                Ok(())
            }
            SagaError::OutOfRange { size, offset, len } =>
                write!(f, "range {}..{} is out of bounds for file of size {}", offset, offset + len, size),
            SagaError::MergeInProgress => write!(f, "another merge session is still active"),
            SagaError::NoCurrentTimeline => write!(f, "no current timeline is set"),
            SagaError::InvalidArgument(msg) => write!(f, "{}", msg),
            SagaError::Cancelled => write!(f, "operation was cancelled"),
        }
    }
}
