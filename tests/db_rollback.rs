use btree_db::Config;
use test_log::test;

#[test]
fn rollback_abandons_uncommitted_writes() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t4.db");

    let db = Config::new(&path)
        .content_identifier("t4")
        .key_size(4)
        .auto_commit(false)
        .open()?;

    db.insert(&1u32.to_be_bytes(), b"one")?;
    db.commit()?;

    let committed_size = std::fs::metadata(&path)?.len();

    db.insert(&2u32.to_be_bytes(), b"two")?;
    db.rollback()?;

    assert_eq!(Some(b"one".to_vec()), db.find(&1u32.to_be_bytes())?);
    assert_eq!(None, db.find(&2u32.to_be_bytes())?);
    assert_eq!(1, db.record_count()?);
    assert_eq!(committed_size, std::fs::metadata(&path)?.len());

    Ok(())
}

#[test]
fn rollback_then_new_writes_still_commit() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t4.db");

    {
        let db = Config::new(&path)
            .content_identifier("t4")
            .key_size(4)
            .auto_commit(false)
            .open()?;

        db.insert(&1u32.to_be_bytes(), b"one")?;
        db.commit()?;

        db.insert(&2u32.to_be_bytes(), b"discarded")?;
        db.rollback()?;

        db.insert(&3u32.to_be_bytes(), b"three")?;
        db.commit()?;
        db.close()?;
    }

    {
        let db = Config::new(&path).open()?;

        assert_eq!(Some(b"one".to_vec()), db.find(&1u32.to_be_bytes())?);
        assert_eq!(None, db.find(&2u32.to_be_bytes())?);
        assert_eq!(Some(b"three".to_vec()), db.find(&3u32.to_be_bytes())?);
    }

    Ok(())
}

#[test]
fn rollback_discards_many_buffered_mutations() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;

    let db = Config::new(folder.path().join("t4.db"))
        .content_identifier("t4")
        .key_size(8)
        .auto_commit(false)
        .open()?;

    for x in 0..500u64 {
        db.insert(&x.to_be_bytes(), b"keep")?;
    }
    db.commit()?;

    for x in 0..500u64 {
        db.remove(&x.to_be_bytes())?;
    }
    for x in 1_000..1_100u64 {
        db.insert(&x.to_be_bytes(), b"drop")?;
    }
    db.rollback()?;

    assert_eq!(500, db.record_count()?);
    assert_eq!(Some(b"keep".to_vec()), db.find(&0u64.to_be_bytes())?);
    assert_eq!(None, db.find(&1_050u64.to_be_bytes())?);

    Ok(())
}

#[test]
fn enabling_auto_commit_flushes_pending_writes() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t4.db");

    {
        let db = Config::new(&path)
            .content_identifier("t4")
            .key_size(4)
            .auto_commit(false)
            .open()?;

        db.insert(&7u32.to_be_bytes(), b"seven")?;
        db.set_auto_commit(true)?;

        // Rolling back after the implicit commit is a no-op.
        db.rollback()?;
        assert_eq!(Some(b"seven".to_vec()), db.find(&7u32.to_be_bytes())?);
        db.close()?;
    }

    {
        let db = Config::new(&path).open()?;
        assert_eq!(Some(b"seven".to_vec()), db.find(&7u32.to_be_bytes())?);
    }

    Ok(())
}
