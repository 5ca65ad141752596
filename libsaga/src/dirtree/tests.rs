use super::*;
use crate::hash::hash_bytes;
use crate::odb::LooseOdb;

fn odb() -> (tempfile::TempDir, LooseOdb) {
    let dir = tempfile::tempdir().unwrap();
    let odb = LooseOdb::new(dir.path().join("objects")).unwrap();
    (dir, odb)
}

fn path(s: &str) -> RepoPath {
    RepoPath::new(s).unwrap()
}

fn file_entry(name: &str) -> DirEntry {
    DirEntry::new_file(name, hash_bytes(name.as_bytes()), FileMode::REG)
}

#[test]
fn empty_dir_lists_nothing() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let root = tree.empty()?;
    assert!(tree.list(root, None)?.is_empty());
    Ok(())
}

#[test]
fn insert_lookup_remove() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let root = tree.empty()?;
    let root = tree.insert(root, &path("a/b/c.txt"), file_entry("c.txt"))?;

    let entry = tree.lookup(root, &path("a/b/c.txt"))?.unwrap();
    assert_eq!(entry.name, "c.txt");
    assert_eq!(entry.kind, EntryKind::File);

    let subdir = tree.lookup(root, &path("a/b"))?.unwrap();
    assert!(subdir.is_dir());

    let root = tree.remove(root, &path("a/b/c.txt"))?;
    assert!(tree.lookup(root, &path("a/b/c.txt"))?.is_none());
    // emptied intermediate directories are pruned
    assert!(tree.lookup(root, &path("a"))?.is_none());
    Ok(())
}

#[test]
fn remove_missing_is_not_found() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let root = tree.empty()?;
    assert!(tree.remove(root, &path("nope")).is_err());
    Ok(())
}

#[test]
fn canonical_roots_ignore_insertion_order() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let names = ["zebra", "apple", "mango", "dir/inner", "dir/other", "banana"];

    let mut forwards = tree.empty()?;
    for name in names {
        forwards = tree.insert(forwards, &path(name), file_entry(path(name).file_name()))?;
    }

    let mut backwards = tree.empty()?;
    for name in names.iter().rev() {
        backwards = tree.insert(backwards, &path(name), file_entry(path(name).file_name()))?;
    }

    assert_eq!(forwards, backwards);
    Ok(())
}

#[test]
fn insert_then_remove_restores_root() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let mut root = tree.empty()?;
    for name in ["one", "two", "three"] {
        root = tree.insert(root, &path(name), file_entry(name))?;
    }
    let with_extra = tree.insert(root, &path("extra"), file_entry("extra"))?;
    assert_ne!(with_extra, root);
    assert_eq!(tree.remove(with_extra, &path("extra"))?, root);
    Ok(())
}

#[test]
fn list_orders_by_full_path() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let mut root = tree.empty()?;
    for name in ["a/b", "a.txt", "b", "a/a", "c/d/e"] {
        root = tree.insert(root, &path(name), file_entry(path(name).file_name()))?;
    }
    let listed = tree.list(root, None)?.into_iter().map(|(p, _)| p.to_string()).collect::<Vec<_>>();
    assert_eq!(listed, vec!["a.txt", "a/a", "a/b", "b", "c/d/e"]);

    let under_a = tree.list(root, Some(&path("a")))?
        .into_iter()
        .map(|(p, _)| p.to_string())
        .collect::<Vec<_>>();
    assert_eq!(under_a, vec!["a/a", "a/b"]);
    Ok(())
}

#[test]
fn diff_reports_changes_in_path_order() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let mut a = tree.empty()?;
    for name in ["keep", "gone", "sub/stay", "sub/change"] {
        a = tree.insert(a, &path(name), file_entry(path(name).file_name()))?;
    }
    let mut b = tree.remove(a, &path("gone"))?;
    b = tree.insert(b, &path("fresh"), file_entry("fresh"))?;
    let mut changed = file_entry("change");
    changed.target = hash_bytes(b"different");
    b = tree.insert(b, &path("sub/change"), changed)?;

    let changes = tree.diff(a, b)?;
    let summary = changes
        .iter()
        .map(|change| (change.path.to_string(), change.old.is_some(), change.new.is_some()))
        .collect::<Vec<_>>();
    assert_eq!(summary, vec![
        ("fresh".to_owned(), false, true),
        ("gone".to_owned(), true, false),
        ("sub/change".to_owned(), true, true),
    ]);

    assert!(tree.diff(a, a)?.is_empty());
    Ok(())
}

/// brute-forces names whose 32-bit name hashes collide on the bottom
/// 30 bits, forcing the hamt down to its collision lists
fn colliding_names(count: usize) -> Vec<String> {
    use std::collections::HashMap;
    let mut buckets: HashMap<u32, Vec<String>> = HashMap::new();
    for i in 0u64.. {
        let name = format!("synthetic-{}", i);
        let key = name_hash(&name) & 0x3fff_ffff;
        let bucket = buckets.entry(key).or_default();
        bucket.push(name);
        if bucket.len() >= count {
            return bucket.clone();
        }
    }
    unreachable!()
}

#[test]
fn hash_collisions_fall_back_to_collision_list() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let names = colliding_names(2);

    let mut root = tree.empty()?;
    for name in &names {
        root = tree.insert(root, &path(name), file_entry(name))?;
    }
    for name in &names {
        let entry = tree.lookup(root, &path(name))?.unwrap();
        assert_eq!(entry.name, *name);
    }

    // removal collapses the chain back to an inline entry
    let root = tree.remove(root, &path(&names[0]))?;
    assert!(tree.lookup(root, &path(&names[0]))?.is_none());
    assert!(tree.lookup(root, &path(&names[1]))?.is_some());
    Ok(())
}

/// finds a name that shares the colliding pair's depth-0 stride while
/// diverging deeper, so the trie branches below the root
fn stride_colliding_name(target: &str) -> String {
    let want = name_hash(target) & 0x1f;
    let full = name_hash(target) & 0x3fff_ffff;
    for i in 0u64.. {
        let name = format!("branch-{}", i);
        let hash = name_hash(&name);
        if hash & 0x1f == want && hash & 0x3fff_ffff != full {
            return name;
        }
    }
    unreachable!()
}

fn build_tree(tree: &DirTree<'_>, names: &[&str]) -> SagaResult<Oid> {
    let mut root = tree.empty()?;
    for name in names {
        root = tree.insert(root, &path(name), file_entry(name))?;
    }
    Ok(root)
}

/// three colliding names where one branches off partway down the
/// chain: removing it leaves an ancestor holding a single child
/// subtree, which must still encode exactly like a fresh build
#[test]
fn branching_collision_removals_stay_canonical() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let pair = colliding_names(2);
    let branch = stride_colliding_name(&pair[0]);
    let (a, b, c) = (pair[0].as_str(), pair[1].as_str(), branch.as_str());

    let full = build_tree(&tree, &[a, b, c])?;

    // removing the branch entry leaves intermediate nodes with a lone
    // child subtree; the result must equal building {a, b} from scratch
    assert_eq!(tree.remove(full, &path(c))?, build_tree(&tree, &[a, b])?);

    // removing a deep entry hoists the survivor up through the chain
    // and into the branching node
    assert_eq!(tree.remove(full, &path(a))?, build_tree(&tree, &[b, c])?);

    // removing two names in either order converges on the same root
    let via_c_first = tree.remove(tree.remove(full, &path(c))?, &path(a))?;
    let via_a_first = tree.remove(tree.remove(full, &path(a))?, &path(c))?;
    assert_eq!(via_c_first, via_a_first);
    assert_eq!(via_c_first, build_tree(&tree, &[b])?);
    Ok(())
}

#[test]
fn deep_chain_collapses_on_remove() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let tree = DirTree::new(&odb);
    let names = colliding_names(2);

    let only_second = tree.insert(tree.empty()?, &path(&names[1]), file_entry(&names[1]))?;
    let mut both = tree.insert(tree.empty()?, &path(&names[0]), file_entry(&names[0]))?;
    both = tree.insert(both, &path(&names[1]), file_entry(&names[1]))?;

    // removing the first colliding name must produce the same canonical
    // root as never having inserted it
    assert_eq!(tree.remove(both, &path(&names[0]))?, only_second);
    Ok(())
}
