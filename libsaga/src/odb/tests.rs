use super::*;
use crate::error::SagaErrorExt;
use crate::hash::hash_bytes;

fn odb() -> (tempfile::TempDir, LooseOdb) {
    let dir = tempfile::tempdir().unwrap();
    let odb = LooseOdb::new(dir.path().join("objects")).unwrap();
    (dir, odb)
}

#[test]
fn put_get_roundtrip() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let oid = odb.put(b"the quick brown fox")?;
    assert_eq!(odb.get(oid)?, b"the quick brown fox");
    Ok(())
}

#[test]
fn put_is_idempotent() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let a = odb.put(b"same bytes")?;
    let b = odb.put(b"same bytes")?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn get_missing_is_not_found() {
    let (_dir, odb) = odb();
    let err = odb.get(hash_bytes(b"never stored")).unwrap_err();
    assert_eq!(err.try_into_obj_not_found_err().unwrap(), hash_bytes(b"never stored"));
}

#[test]
fn has_reports_presence() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let oid = odb.put(b"present")?;
    assert!(odb.has(oid)?);
    assert!(!odb.has(hash_bytes(b"absent"))?);
    Ok(())
}

#[test]
fn get_detects_corruption() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let oid = odb.put(b"original content")?;
    std::fs::write(odb.obj_path(oid), b"tampered content")?;
    let err = odb.get(oid).unwrap_err();
    assert!(err.to_string().contains("hashes to"), "unexpected error: {}", err);
    Ok(())
}

#[test]
fn put_many_matches_individual_puts() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let items: Vec<Vec<u8>> = (0u8..32).map(|i| vec![i; 100 * i as usize + 1]).collect();
    let oids = odb.put_many(&items)?;
    assert_eq!(oids.len(), items.len());
    for (bytes, oid) in items.iter().zip(&oids) {
        assert_eq!(*oid, hash_bytes(bytes));
        assert_eq!(odb.get(*oid)?, *bytes);
    }
    Ok(())
}

#[test]
fn empty_blob_roundtrips() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let oid = odb.put(b"")?;
    assert_eq!(odb.get(oid)?, Vec::<u8>::new());
    Ok(())
}

#[quickcheck]
fn qc_put_get_identity(bytes: Vec<u8>) -> bool {
    let (_dir, odb) = odb();
    let oid = odb.put(&bytes).unwrap();
    odb.get(oid).unwrap() == bytes
}
