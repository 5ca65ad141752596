use crate::cancel::CancelToken;
use crate::commit::Signature;
use crate::error::SagaResult;
use crate::hash::Oid;
use crate::path::RepoPath;
use crate::repo::SagaRepo;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn test_signature() -> Signature {
    Signature::new("Test Author", "test@example.com")
}

/// runs `f` against a freshly initialized repository in a tempdir
pub fn with_empty_repo(f: impl FnOnce(&SagaRepo) -> SagaResult<()>) {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let repo = SagaRepo::init(dir.path()).expect("failed to init repo");
    f(&repo).expect("test failed");
}

pub fn write_file(repo: &SagaRepo, path: &str, content: impl AsRef<[u8]>) {
    let fs_path = repo.root().join(path);
    std::fs::create_dir_all(fs_path.parent().unwrap()).unwrap();
    std::fs::write(fs_path, content).unwrap();
}

pub fn read_file(repo: &SagaRepo, path: &str) -> Vec<u8> {
    std::fs::read(repo.root().join(path)).unwrap()
}

pub fn file_exists(repo: &SagaRepo, path: &str) -> bool {
    repo.root().join(path).exists()
}

pub fn remove_file(repo: &SagaRepo, path: &str) {
    std::fs::remove_file(repo.root().join(path)).unwrap()
}

/// captures the workspace onto the current timeline
pub fn seal(repo: &SagaRepo, message: &str) -> SagaResult<Oid> {
    repo.seal_workspace(message, test_signature(), &CancelToken::new())
}

pub fn repo_path(s: &str) -> RepoPath {
    RepoPath::new(s).unwrap()
}

/// deterministic pseudo-random content; the same seed always yields
/// the same bytes
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = vec![0; len];
    rng.fill(&mut bytes[..]);
    bytes
}
