use btree_db::Config;
use test_log::test;

#[test]
fn reopen_single_record() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t1.db");

    {
        let db = Config::new(&path)
            .content_identifier("t1")
            .key_size(4)
            .open()?;

        assert!(!db.insert(&1u32.to_be_bytes(), b"hello")?);
        db.commit()?;
        db.close()?;
    }

    {
        let db = Config::new(&path).open()?;

        assert_eq!(4, db.key_size());
        assert_eq!("t1", db.content_identifier());
        assert_eq!(Some(b"hello".to_vec()), db.find(&1u32.to_be_bytes())?);
        assert_eq!(None, db.find(&2u32.to_be_bytes())?);
        assert_eq!(1, db.record_count()?);
    }

    Ok(())
}

#[test]
fn reopen_adopts_file_geometry() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t1.db");

    {
        let db = Config::new(&path)
            .content_identifier("t1")
            .key_size(4)
            .block_size(512)
            .open()?;
        db.insert(&1u32.to_be_bytes(), b"hello")?;
        db.close()?;
    }

    // A caller configuring different geometry gets the file's instead.
    {
        let db = Config::new(&path).key_size(8).block_size(4_096).open()?;

        assert_eq!(4, db.key_size());
        assert_eq!(512, db.block_size());
        assert_eq!(Some(b"hello".to_vec()), db.find(&1u32.to_be_bytes())?);
    }

    Ok(())
}

#[test]
fn reopen_empty_database() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t1.db");

    {
        let db = Config::new(&path)
            .content_identifier("t1")
            .key_size(4)
            .open()?;
        assert_eq!(0, db.record_count()?);
        db.close()?;
    }

    {
        let db = Config::new(&path).open()?;

        assert_eq!(0, db.record_count()?);
        assert_eq!(0, db.index_levels()?);
        assert!(!db.remove(&1u32.to_be_bytes())?);

        let mut visited = 0;
        db.for_all(|_, _| visited += 1)?;
        assert_eq!(0, visited);
    }

    Ok(())
}

#[test]
fn reopen_round_trips_many_records() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t1.db");

    let mut expected = Vec::new();

    {
        let db = Config::new(&path)
            .content_identifier("t1")
            .key_size(8)
            .auto_commit(false)
            .open()?;

        for x in 0..1_000u64 {
            let value = nanoid::nanoid!();
            db.insert(&x.to_be_bytes(), value.as_bytes())?;
            expected.push((x.to_be_bytes().to_vec(), value.into_bytes()));
        }

        db.commit()?;
        db.close()?;
    }

    {
        let db = Config::new(&path).open()?;
        assert_eq!(1_000, db.record_count()?);

        let mut actual = Vec::new();
        db.for_all(|key, value| actual.push((key.to_vec(), value.to_vec())))?;
        assert_eq!(expected, actual);
    }

    Ok(())
}

#[test]
fn closed_database_rejects_operations() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;

    let db = Config::new(folder.path().join("t1.db"))
        .content_identifier("t1")
        .key_size(4)
        .open()?;

    assert!(db.is_open());
    db.close()?;
    assert!(!db.is_open());

    assert!(matches!(
        db.find(&1u32.to_be_bytes()),
        Err(btree_db::Error::InvalidState(_)),
    ));
    assert!(matches!(
        db.insert(&1u32.to_be_bytes(), b"x"),
        Err(btree_db::Error::InvalidState(_)),
    ));

    Ok(())
}

#[test]
fn creating_requires_identifier_and_key_size() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;

    assert!(matches!(
        Config::new(folder.path().join("a.db")).key_size(4).open(),
        Err(btree_db::Error::InvalidState(_)),
    ));

    assert!(matches!(
        Config::new(folder.path().join("b.db"))
            .content_identifier("b")
            .open(),
        Err(btree_db::Error::InvalidState(_)),
    ));

    assert!(matches!(
        Config::new(folder.path().join("c.db"))
            .content_identifier("an identifier too long")
            .key_size(4)
            .open(),
        Err(btree_db::Error::InvalidArgument(_)),
    ));

    Ok(())
}

#[test]
fn open_rejects_foreign_file() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("not_a_db");
    std::fs::write(&path, b"certainly not a database file")?;

    assert!(matches!(
        Config::new(&path).open(),
        Err(btree_db::Error::Format(_)),
    ));

    Ok(())
}
