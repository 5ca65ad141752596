use super::*;
use crate::error::SagaErrorExt;
use crate::test_utils::*;

#[test]
fn apply_reaches_target_state() {
    with_empty_repo(|repo| {
        write_file(repo, "keep.txt", "keep");
        write_file(repo, "old.txt", "old");
        write_file(repo, "change.txt", "before");
        let from = repo.materializer().current_state()?;
        seal(repo, "baseline")?;

        remove_file(repo, "old.txt");
        write_file(repo, "change.txt", "after");
        write_file(repo, "nested/new.txt", "new");
        let to = repo.materializer().current_state()?;

        // rewind the workspace to the old state, then apply forward again
        repo.materializer().apply(&to, &from)?;
        assert_eq!(read_file(repo, "old.txt"), b"old");
        assert_eq!(read_file(repo, "change.txt"), b"before");
        assert!(!file_exists(repo, "nested/new.txt"));
        // the emptied directory is gone too
        assert!(!file_exists(repo, "nested"));

        repo.materializer().apply(&from, &to)?;
        assert!(!file_exists(repo, "old.txt"));
        assert_eq!(read_file(repo, "change.txt"), b"after");
        assert_eq!(read_file(repo, "nested/new.txt"), b"new");
        Ok(())
    })
}

#[test]
fn untracked_files_are_not_overwritten() {
    with_empty_repo(|repo| {
        write_file(repo, "tracked.txt", "v1");
        let from = repo.materializer().current_state()?;

        write_file(repo, "incoming.txt", "target version");
        let to = repo.materializer().current_state()?;

        // roll back to `from`, then drop a different incoming.txt in the way
        repo.materializer().apply(&to, &from)?;
        write_file(repo, "incoming.txt", "precious local data");

        let err = repo.materializer().apply(&from, &to).unwrap_err();
        let conflicts = err.try_into_workspace_conflict()?;
        assert_eq!(conflicts, vec![repo_path("incoming.txt")]);
        // the untracked file survived
        assert_eq!(read_file(repo, "incoming.txt"), b"precious local data");

        // force wins
        repo.materializer_with(MaterializeOpts::forced(), CancelToken::new())
            .apply(&from, &to)?;
        assert_eq!(read_file(repo, "incoming.txt"), b"target version");
        Ok(())
    })
}

#[test]
fn identical_untracked_content_is_not_a_conflict() {
    with_empty_repo(|repo| {
        let from = repo.materializer().current_state()?;
        write_file(repo, "same.txt", "identical");
        let to = repo.materializer().current_state()?;

        repo.materializer().apply(&to, &from)?;
        write_file(repo, "same.txt", "identical");
        repo.materializer().apply(&from, &to)?;
        assert_eq!(read_file(repo, "same.txt"), b"identical");
        Ok(())
    })
}

#[test]
fn admin_dir_survives_materialization() {
    with_empty_repo(|repo| {
        write_file(repo, "a/file.txt", "x");
        let state = repo.materializer().current_state()?;
        repo.materializer().apply(&state, &WorkspaceIndex::default())?;
        assert!(!file_exists(repo, "a"));
        assert!(repo.root().join(ADMIN_DIR).is_dir());
        Ok(())
    })
}

#[test]
fn materialize_timeline_switches_and_moves_head() {
    with_empty_repo(|repo| {
        write_file(repo, "shared.txt", "on main");
        seal(repo, "main c0")?;
        repo.create_timeline("feature", "")?;

        write_file(repo, "shared.txt", "changed on main");
        seal(repo, "main c1")?;

        repo.materializer().materialize_timeline("feature", false)?;
        assert_eq!(repo.refs().current_timeline()?, "feature");
        assert_eq!(read_file(repo, "shared.txt"), b"on main");
        Ok(())
    })
}

#[test]
fn materialize_missing_timeline_is_not_found() {
    with_empty_repo(|repo| {
        assert!(repo.materializer().materialize_timeline("ghost", true).is_err());
        Ok(())
    })
}

#[test]
fn auto_shelf_roundtrip() {
    with_empty_repo(|repo| {
        // tip C0 contains foo.txt = "A"
        write_file(repo, "foo.txt", "A");
        seal(repo, "c0")?;
        repo.create_timeline("feature", "")?;

        // diverge the workspace and stage bar.txt
        write_file(repo, "foo.txt", "A-modified");
        write_file(repo, "bar.txt", random_bytes(1, 300_000));
        repo.stage_paths(&[repo_path("bar.txt")])?;

        repo.materializer().materialize_timeline("feature", true)?;
        // the workspace now equals the c0 tree
        assert_eq!(read_file(repo, "foo.txt"), b"A");
        assert!(!file_exists(repo, "bar.txt"));
        assert!(repo.staged_paths()?.is_empty());
        // the divergent state was shelved under the departing timeline
        let shelf = repo.shelves().load("main")?.unwrap();
        assert_eq!(shelf.staged_paths, vec![repo_path("bar.txt")]);

        repo.materializer().materialize_timeline("main", true)?;
        assert_eq!(read_file(repo, "foo.txt"), b"A-modified");
        assert_eq!(read_file(repo, "bar.txt"), random_bytes(1, 300_000));
        assert_eq!(repo.staged_paths()?, vec![repo_path("bar.txt")]);
        // the shelf was consumed and archived
        assert!(repo.shelves().load("main")?.is_none());
        assert_eq!(repo.shelves().archived("main")?.len(), 1);
        Ok(())
    })
}

#[test]
fn clean_switch_leaves_no_shelf() {
    with_empty_repo(|repo| {
        write_file(repo, "file.txt", "content");
        seal(repo, "c0")?;
        repo.create_timeline("feature", "")?;
        repo.materializer().materialize_timeline("feature", true)?;
        assert!(repo.shelves().load("main")?.is_none());
        Ok(())
    })
}

#[test]
fn interrupted_materialization_resumes() {
    with_empty_repo(|repo| {
        write_file(repo, "a.txt", "a");
        write_file(repo, "b.txt", "b");
        seal(repo, "c0")?;
        let target = repo.materializer().current_state()?;

        // simulate a crash mid-apply: the pending marker is recorded
        // but the workspace was only partially updated
        repo.materializer().persist_pending("main", &target)?;
        remove_file(repo, "a.txt");
        write_file(repo, "b.txt", "clobbered");

        assert!(repo.materializer().pending_target()?.is_some());
        assert!(repo.materializer().resume_pending()?);
        assert_eq!(read_file(repo, "a.txt"), b"a");
        assert_eq!(read_file(repo, "b.txt"), b"b");
        assert!(repo.materializer().pending_target()?.is_none());

        // nothing left to resume
        assert!(!repo.materializer().resume_pending()?);
        Ok(())
    })
}

#[test]
fn cancelled_apply_leaves_resumable_state() {
    with_empty_repo(|repo| {
        write_file(repo, "file.txt", "v1");
        seal(repo, "c0")?;
        let from = repo.materializer().current_state()?;
        write_file(repo, "file.txt", "v2");
        let to = repo.materializer().current_state()?;

        let cancel = CancelToken::new();
        cancel.cancel();
        let materializer = repo.materializer_with(MaterializeOpts::default(), cancel);
        assert!(materializer.apply(&from, &to).is_err());
        Ok(())
    })
}
