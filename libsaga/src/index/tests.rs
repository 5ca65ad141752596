use super::*;
use crate::odb::LooseOdb;

fn odb() -> (tempfile::TempDir, LooseOdb) {
    let dir = tempfile::tempdir().unwrap();
    let odb = LooseOdb::new(dir.path().join("objects")).unwrap();
    (dir, odb)
}

fn accept_all(_: &RepoPath) -> bool {
    true
}

fn write_workspace(root: &Path, files: &[(&str, &[u8])]) {
    for (path, content) in files {
        let fs_path = root.join(path);
        std::fs::create_dir_all(fs_path.parent().unwrap()).unwrap();
        std::fs::write(fs_path, content).unwrap();
    }
}

#[test]
fn scan_builds_sorted_entries() -> SagaResult<()> {
    let (_odb_dir, odb) = odb();
    let workspace = tempfile::tempdir()?;
    write_workspace(workspace.path(), &[
        ("zebra.txt", b"z"),
        ("apple.txt", b"a"),
        ("nested/deep/file.txt", b"deep"),
    ]);

    let index =
        WorkspaceIndex::scan(&odb, workspace.path(), &accept_all, None, &CancelToken::new())?;
    let paths = index.paths().map(|path| path.to_string()).collect::<Vec<_>>();
    assert_eq!(paths, vec!["apple.txt", "nested/deep/file.txt", "zebra.txt"]);

    let entry = index.get(&RepoPath::new("nested/deep/file.txt")?).unwrap();
    assert_eq!(entry.size, 4);
    assert_eq!(entry.checksum, crate::hash::hash_bytes(b"deep"));
    assert_eq!(filetree::read_all(&odb, entry.file)?, b"deep");
    Ok(())
}

#[test]
fn scan_respects_filter() -> SagaResult<()> {
    let (_odb_dir, odb) = odb();
    let workspace = tempfile::tempdir()?;
    write_workspace(workspace.path(), &[("keep.txt", b"keep"), ("skip.log", b"skip")]);

    let filter = |path: &RepoPath| !path.as_str().ends_with(".log");
    let index = WorkspaceIndex::scan(&odb, workspace.path(), &filter, None, &CancelToken::new())?;
    assert_eq!(index.len(), 1);
    assert!(index.get(&RepoPath::new("keep.txt")?).is_some());
    Ok(())
}

#[test]
fn scan_skips_admin_dir() -> SagaResult<()> {
    let (_odb_dir, odb) = odb();
    let workspace = tempfile::tempdir()?;
    write_workspace(workspace.path(), &[("tracked.txt", b"t")]);
    write_workspace(&workspace.path().join(ADMIN_DIR), &[("objects/deadbeef", b"internal")]);

    let index =
        WorkspaceIndex::scan(&odb, workspace.path(), &accept_all, None, &CancelToken::new())?;
    assert_eq!(index.len(), 1);
    Ok(())
}

#[test]
fn rescan_reuses_unchanged_entries() -> SagaResult<()> {
    let (_odb_dir, odb) = odb();
    let workspace = tempfile::tempdir()?;
    write_workspace(workspace.path(), &[("stable.txt", b"stable")]);

    let first =
        WorkspaceIndex::scan(&odb, workspace.path(), &accept_all, None, &CancelToken::new())?;
    let second =
        WorkspaceIndex::scan(&odb, workspace.path(), &accept_all, Some(&first), &CancelToken::new())?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn cancelled_scan_bails() {
    let (_odb_dir, odb) = odb();
    let workspace = tempfile::tempdir().unwrap();
    write_workspace(workspace.path(), &[("file.txt", b"x")]);

    let cancel = CancelToken::new();
    cancel.cancel();
    let res = WorkspaceIndex::scan(&odb, workspace.path(), &accept_all, None, &cancel);
    assert!(res.is_err());
}

#[test]
fn tree_roundtrip_is_identity() -> SagaResult<()> {
    let (_odb_dir, odb) = odb();
    let workspace = tempfile::tempdir()?;
    write_workspace(workspace.path(), &[
        ("a.txt", b"alpha"),
        ("dir/b.txt", b"beta"),
        ("dir/sub/c.txt", b"gamma"),
    ]);

    let index =
        WorkspaceIndex::scan(&odb, workspace.path(), &accept_all, None, &CancelToken::new())?;
    let root = index.to_tree(&odb)?;
    let rebuilt = WorkspaceIndex::from_tree(&odb, root)?;
    assert_eq!(rebuilt, index);

    // and the rebuilt index re-encodes to the same tree
    assert_eq!(rebuilt.to_tree(&odb)?, root);
    Ok(())
}

#[test]
fn empty_index_roundtrips_through_empty_tree() -> SagaResult<()> {
    let (_odb_dir, odb) = odb();
    let index = WorkspaceIndex::default();
    let root = index.to_tree(&odb)?;
    assert_eq!(WorkspaceIndex::from_tree(&odb, root)?, index);
    Ok(())
}

#[test]
fn encoding_roundtrips_through_object_store() -> SagaResult<()> {
    let (_odb_dir, odb) = odb();
    let workspace = tempfile::tempdir()?;
    write_workspace(workspace.path(), &[("x.txt", b"x"), ("y/z.txt", b"z")]);

    let index =
        WorkspaceIndex::scan(&odb, workspace.path(), &accept_all, None, &CancelToken::new())?;
    let oid = index.store(&odb)?;
    let loaded = WorkspaceIndex::load(&odb, oid)?;
    assert_eq!(loaded, index);
    Ok(())
}

#[cfg(unix)]
#[test]
fn scan_records_symlinks_and_exec_bits() -> SagaResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let (_odb_dir, odb) = odb();
    let workspace = tempfile::tempdir()?;
    write_workspace(workspace.path(), &[("script.sh", b"#!/bin/sh\n")]);
    let script = workspace.path().join("script.sh");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
    std::os::unix::fs::symlink("script.sh", workspace.path().join("link"))?;

    let index =
        WorkspaceIndex::scan(&odb, workspace.path(), &accept_all, None, &CancelToken::new())?;
    assert_eq!(index.get(&RepoPath::new("script.sh")?).unwrap().mode, FileMode::EXEC);
    let link = index.get(&RepoPath::new("link")?).unwrap();
    assert_eq!(link.mode, FileMode::LINK);
    assert_eq!(filetree::read_all(&odb, link.file)?, b"script.sh");
    Ok(())
}
