use btree_db::Config;
use test_log::test;

/// Between commits, every mutation lives in the write buffer; the file only
/// ever holds the last committed snapshot (plus reserved tail space). Copying
/// the file mid-transaction therefore simulates a crash, and the copy must
/// reopen at the committed state.
#[test]
fn mid_transaction_crash_recovers_committed_state() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("live.db");
    let crashed = folder.path().join("crashed.db");

    let db = Config::new(&path)
        .content_identifier("crash")
        .key_size(4)
        .auto_commit(false)
        .open()?;

    for x in 0..100u32 {
        db.insert(&x.to_be_bytes(), b"committed")?;
    }
    db.commit()?;

    // A whole uncommitted transaction: overwrites, deletes, inserts.
    for x in 0..50u32 {
        db.insert(&x.to_be_bytes(), b"uncommitted")?;
    }
    for x in 50..75u32 {
        db.remove(&x.to_be_bytes())?;
    }
    for x in 200..300u32 {
        db.insert(&x.to_be_bytes(), b"uncommitted")?;
    }

    std::fs::copy(&path, &crashed)?;

    {
        let recovered = Config::new(&crashed).open()?;

        assert_eq!(100, recovered.record_count()?);
        for x in 0..100u32 {
            assert_eq!(Some(b"committed".to_vec()), recovered.find(&x.to_be_bytes())?);
        }
        assert_eq!(None, recovered.find(&250u32.to_be_bytes())?);
    }

    // The live database commits as usual afterwards.
    db.commit()?;
    assert_eq!(175, db.record_count()?);

    Ok(())
}

#[test]
fn snapshot_after_commit_recovers_new_state() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("live.db");
    let snapshot = folder.path().join("snapshot.db");

    let db = Config::new(&path)
        .content_identifier("crash")
        .key_size(4)
        .auto_commit(false)
        .open()?;

    db.insert(&1u32.to_be_bytes(), b"old")?;
    db.commit()?;

    db.insert(&1u32.to_be_bytes(), b"new")?;
    db.insert(&2u32.to_be_bytes(), b"two")?;
    db.commit()?;

    std::fs::copy(&path, &snapshot)?;

    let recovered = Config::new(&snapshot).open()?;
    assert_eq!(Some(b"new".to_vec()), recovered.find(&1u32.to_be_bytes())?);
    assert_eq!(Some(b"two".to_vec()), recovered.find(&2u32.to_be_bytes())?);

    Ok(())
}

/// Reserved-but-uncommitted tail growth is truncated away on reopen.
#[test]
fn torn_tail_is_discarded_on_open() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("live.db");

    {
        let db = Config::new(&path)
            .content_identifier("crash")
            .key_size(4)
            .open()?;
        db.insert(&1u32.to_be_bytes(), b"one")?;
        db.close()?;
    }

    let committed_size = std::fs::metadata(&path)?.len();

    // Simulate a crash that left garbage past the committed extent.
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0xAA; 4_096])?;
    }
    assert!(std::fs::metadata(&path)?.len() > committed_size);

    {
        let db = Config::new(&path).open()?;
        assert_eq!(Some(b"one".to_vec()), db.find(&1u32.to_be_bytes())?);
        assert_eq!(committed_size, std::fs::metadata(&path)?.len());
    }

    Ok(())
}
