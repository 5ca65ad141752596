use super::*;
use crate::error::SagaResultExt;
use crate::filetree;
use crate::mmr;
use crate::names::seal_name;
use crate::test_utils::*;

#[test]
fn init_creates_layout_and_default_timeline() {
    with_empty_repo(|repo| {
        assert!(repo.root().join(ADMIN_DIR).join("objects").is_dir());
        assert!(repo.root().join(ADMIN_DIR).join("metadata.db").is_file());
        assert!(repo.root().join(ADMIN_DIR).join("stage/files").is_file());
        assert_eq!(repo.refs().current_timeline()?, DEFAULT_TIMELINE);
        let (timeline, tip) = repo.current_tip()?;
        assert_eq!(timeline, DEFAULT_TIMELINE);
        assert!(tip.is_zero());
        Ok(())
    })
}

#[test]
fn init_twice_fails() {
    with_empty_repo(|repo| {
        assert!(SagaRepo::init(repo.root()).is_err());
        Ok(())
    })
}

#[test]
fn open_searches_upwards() -> SagaResult<()> {
    let dir = tempfile::tempdir()?;
    // drop the initializing handle before reopening: the metadata
    // database allows one open handle per process
    {
        SagaRepo::init(dir.path())?;
    }
    std::fs::create_dir_all(dir.path().join("sub/dir"))?;
    let reopened = SagaRepo::open(dir.path().join("sub/dir"))?;
    assert_eq!(reopened.root(), dir.path());
    assert!(SagaRepo::open(std::env::temp_dir().join("definitely-not-a-repo")).is_err());
    Ok(())
}

#[test]
fn empty_repo_diff_is_empty() {
    with_empty_repo(|repo| {
        let (_, tip) = repo.current_tip()?;
        let index = repo.commit_index(tip)?;
        assert!(index.is_empty());
        assert!(crate::diff::diff_indexes(&index, &index).is_empty());
        Ok(())
    })
}

#[test]
fn seal_records_commit_ref_name_and_mmr_leaf() {
    with_empty_repo(|repo| {
        write_file(repo, "foo.txt", "hello");
        repo.stage_paths(&[repo_path("foo.txt")])?;
        let oid = seal(repo, "first seal")?;

        // the timeline tip moved
        assert_eq!(repo.current_tip()?.1, oid);
        // the commit is readable and is a root
        let commit = repo.read_commit(oid)?;
        assert!(commit.is_root());
        assert_eq!(commit.message, "first seal");
        assert_eq!(commit.mmr_index, 0);
        // the mmr recorded the leaf
        assert_eq!(mmr::leaf_count(repo.db())?, 1);
        assert_eq!(mmr::commit_for_leaf(repo.db(), 0)?, oid);
        // the seal name was indexed
        assert_eq!(repo.refs().seal_name_by_hash(oid)?, seal_name(oid));
        // the staged set was cleared
        assert!(repo.staged_paths()?.is_empty());
        Ok(())
    })
}

#[test]
fn sequential_seals_chain_parents() {
    with_empty_repo(|repo| {
        write_file(repo, "f.txt", "1");
        let c0 = seal(repo, "c0")?;
        write_file(repo, "f.txt", "2");
        let c1 = seal(repo, "c1")?;

        let commit = repo.read_commit(c1)?;
        assert_eq!(commit.first_parent(), Some(c0));
        assert_eq!(commit.mmr_index, 1);
        assert_eq!(mmr::depth(repo.db(), c1)?, 1);
        Ok(())
    })
}

#[test]
fn staged_paths_roundtrip_through_the_stage_file() {
    with_empty_repo(|repo| {
        repo.stage_paths(&[repo_path("b.txt"), repo_path("a.txt")])?;
        repo.stage_paths(&[repo_path("a.txt")])?;
        assert_eq!(repo.staged_paths()?, vec![repo_path("a.txt"), repo_path("b.txt")]);

        let raw = std::fs::read_to_string(repo.root().join(ADMIN_DIR).join("stage/files"))?;
        assert_eq!(raw, "a.txt\nb.txt\n");

        repo.clear_staged_paths()?;
        assert!(repo.staged_paths()?.is_empty());
        Ok(())
    })
}

// capture and restore a single file across two commits
#[test]
fn capture_and_restore_single_file() {
    with_empty_repo(|repo| {
        let content_a = b"A".to_vec();
        let content_b = random_bytes(99, 300_000);

        write_file(repo, "foo.txt", &content_a);
        let c0 = seal(repo, "c0")?;
        write_file(repo, "foo.txt", &content_b);
        let c1 = seal(repo, "c1")?;

        repo.materializer().materialize_commit(c0)?;
        assert_eq!(read_file(repo, "foo.txt"), content_a);

        repo.materializer().materialize_commit(c1)?;
        assert_eq!(read_file(repo, "foo.txt"), content_b);
        Ok(())
    })
}

// two files with identical content share every chunk
#[test]
fn identical_files_dedup_chunks() {
    with_empty_repo(|repo| {
        let content = random_bytes(5, 300_000);
        write_file(repo, "foo.txt", &content);
        write_file(repo, "bar.txt", &content);
        let oid = seal(repo, "dedup")?;

        let index = repo.commit_index(oid)?;
        let foo = index.get(&repo_path("foo.txt")).unwrap();
        let bar = index.get(&repo_path("bar.txt")).unwrap();
        assert_eq!(foo.file, bar.file, "identical content must share the whole tree");

        let foo_chunks = filetree::chunk_sequence(repo.odb(), foo.file)?;
        let bar_chunks = filetree::chunk_sequence(repo.odb(), bar.file)?;
        assert_eq!(foo_chunks, bar_chunks);
        Ok(())
    })
}

#[test]
fn commit_index_traverses_the_real_tree() {
    with_empty_repo(|repo| {
        write_file(repo, "a.txt", "alpha");
        write_file(repo, "nested/b.txt", "beta");
        let oid = seal(repo, "c0")?;

        let index = repo.commit_index(oid)?;
        assert_eq!(index.len(), 2);
        let entry = index.get(&repo_path("nested/b.txt")).unwrap();
        assert_eq!(filetree::read_all(repo.odb(), entry.file)?, b"beta");
        Ok(())
    })
}

#[test]
fn seal_name_resolution_after_commits() {
    with_empty_repo(|repo| {
        write_file(repo, "f.txt", "x");
        let oid = seal(repo, "sealed work")?;
        let name = seal_name(oid);

        let record = repo.refs().seal_by_name(&name)?;
        assert_eq!(record.commit, oid);
        assert_eq!(record.message, "sealed work");

        // hex prefix resolution
        let record = repo.refs().seal_by_name(&oid.to_hex()[0..12])?;
        assert_eq!(record.commit, oid);
        Ok(())
    })
}

#[test]
fn timelines_branch_from_the_current_tip() {
    with_empty_repo(|repo| {
        write_file(repo, "f.txt", "x");
        let c0 = seal(repo, "c0")?;
        repo.create_timeline("feature", "butterfly:main")?;

        let feature = repo.refs().get("feature", crate::refs::RefKind::LocalTimeline)?;
        assert_eq!(feature.primary, c0);
        assert_eq!(feature.description, "butterfly:main");
        Ok(())
    })
}

#[test]
fn missing_object_reads_are_not_found() {
    with_empty_repo(|repo| {
        let res = repo.read_commit(crate::hash::hash_bytes(b"no such commit"));
        assert!(res.is_not_found_err());
        Ok(())
    })
}
