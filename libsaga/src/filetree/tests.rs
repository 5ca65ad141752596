use super::*;
use crate::odb::LooseOdb;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn odb() -> (tempfile::TempDir, LooseOdb) {
    let dir = tempfile::tempdir().unwrap();
    let odb = LooseOdb::new(dir.path().join("objects")).unwrap();
    (dir, odb)
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = vec![0; len];
    rng.fill(&mut bytes[..]);
    bytes
}

#[test]
fn empty_file_roundtrips() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let file = build(&odb, &b""[..])?;
    assert_eq!(file.size, 0);
    assert_eq!(read_all(&odb, file)?, Vec::<u8>::new());
    assert_eq!(read_range(&odb, file, 0, 0)?, Vec::<u8>::new());
    Ok(())
}

#[test]
fn single_byte_roundtrips() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let file = build(&odb, &b"x"[..])?;
    assert_eq!(file.size, 1);
    assert_eq!(read_all(&odb, file)?, b"x");
    Ok(())
}

#[test]
fn large_file_roundtrips() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let bytes = random_bytes(42, 300_000);
    let file = build(&odb, &bytes[..])?;
    assert_eq!(file.size, 300_000);
    assert_eq!(read_all(&odb, file)?, bytes);
    Ok(())
}

#[test]
fn chunk_size_boundaries_roundtrip() -> SagaResult<()> {
    let (_dir, odb) = odb();
    for len in [MIN_CHUNK as usize, MAX_CHUNK as usize, MAX_CHUNK as usize + 1] {
        let bytes = random_bytes(len as u64, len);
        let file = build(&odb, &bytes[..])?;
        assert_eq!(file.size, len as u64);
        assert_eq!(read_all(&odb, file)?, bytes, "length {}", len);
    }
    Ok(())
}

#[test]
fn build_is_canonical() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let bytes = random_bytes(7, 500_000);
    let a = build(&odb, &bytes[..])?;
    let b = build(&odb, &bytes[..])?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn leaves_respect_max_chunk() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let bytes = random_bytes(13, 1_000_000);
    let file = build(&odb, &bytes[..])?;
    let chunks = chunk_sequence(&odb, file)?;
    assert!(chunks.len() > 1);
    assert_eq!(chunks.iter().map(|chunk| chunk.size).sum::<u64>(), file.size);
    for chunk in &chunks {
        assert!(chunk.size <= MAX_CHUNK as u64);
    }
    Ok(())
}

#[test]
fn identical_content_shares_chunks() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let bytes = random_bytes(3, 300_000);
    let a = build(&odb, &bytes[..])?;
    let b = build(&odb, &bytes[..])?;
    assert_eq!(
        chunk_sequence(&odb, a)?,
        chunk_sequence(&odb, b)?,
        "identical byte sequences must split at identical boundaries"
    );
    Ok(())
}

#[test]
fn read_range_arbitrary_windows() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let bytes = random_bytes(11, 400_000);
    let file = build(&odb, &bytes[..])?;
    for &(offset, len) in
        &[(0u64, 10u64), (100_000, 1), (399_999, 1), (0, 400_000), (65_000, 130_000)]
    {
        let expected = &bytes[offset as usize..(offset + len) as usize];
        assert_eq!(read_range(&odb, file, offset, len)?, expected, "range {}+{}", offset, len);
    }
    Ok(())
}

#[test]
fn read_range_out_of_bounds() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let file = build(&odb, &b"short"[..])?;
    assert!(read_range(&odb, file, 0, 6).is_err());
    assert!(read_range(&odb, file, 5, 1).is_err());
    assert_eq!(read_range(&odb, file, 5, 0)?, Vec::<u8>::new());
    Ok(())
}

#[test]
fn checksum_matches_whole_content_hash() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let bytes = random_bytes(5, 123_456);
    let built = build_with_checksum(&odb, &bytes[..])?;
    assert_eq!(built.checksum, crate::hash::hash_bytes(&bytes));
    assert_eq!(built.file.size, 123_456);
    Ok(())
}

#[test]
fn file_size_resolves_from_root() -> SagaResult<()> {
    let (_dir, odb) = odb();
    let bytes = random_bytes(9, 300_000);
    let file = build(&odb, &bytes[..])?;
    assert_eq!(file_size(&odb, file.root)?, file.size);
    Ok(())
}
