use btree_db::Config;
use test_log::test;

#[test]
fn flatten_shrinks_churned_database() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t5.db");

    let db = Config::new(&path)
        .content_identifier("t5")
        .key_size(8)
        .auto_commit(false)
        .open()?;

    for x in 0..10_000u64 {
        let value = nanoid::nanoid!();
        db.insert(&x.to_be_bytes(), value.as_bytes())?;
    }
    db.commit()?;

    for x in (0..10_000u64).step_by(2) {
        assert!(db.remove(&x.to_be_bytes())?);
    }
    db.commit()?;

    let mut before = Vec::new();
    db.for_all(|key, value| before.push((key.to_vec(), value.to_vec())))?;
    let size_before = std::fs::metadata(&path)?.len();

    assert!(db.flatten()?, "churned file should exceed the free threshold");

    let size_after = std::fs::metadata(&path)?.len();
    assert!(
        size_after < size_before,
        "flatten did not shrink the file ({size_before} -> {size_after})",
    );

    let mut after = Vec::new();
    db.for_all(|key, value| after.push((key.to_vec(), value.to_vec())))?;
    assert_eq!(before, after);

    assert_eq!(5_000, db.record_count()?);
    db.close()?;

    // The compacted file reopens to identical contents.
    let db = Config::new(&path).open()?;
    let mut reopened = Vec::new();
    db.for_all(|key, value| reopened.push((key.to_vec(), value.to_vec())))?;
    assert_eq!(before, reopened);

    Ok(())
}

#[test]
fn flatten_skips_compact_database() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;

    let db = Config::new(folder.path().join("t5.db"))
        .content_identifier("t5")
        .key_size(8)
        .auto_commit(false)
        .open()?;

    // A root leaf cannot usefully be compacted.
    db.insert(&1u64.to_be_bytes(), b"x")?;
    db.commit()?;
    assert!(!db.flatten()?);

    Ok(())
}

#[test]
fn flatten_leaves_usable_tree_behind() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;

    let db = Config::new(folder.path().join("t5.db"))
        .content_identifier("t5")
        .key_size(8)
        .auto_commit(false)
        .open()?;

    for x in 0..2_000u64 {
        db.insert(&x.to_be_bytes(), &[5; 64])?;
    }
    db.commit()?;
    for x in 500..1_500u64 {
        db.remove(&x.to_be_bytes())?;
    }
    db.commit()?;

    db.flatten()?;

    // Mutations keep working on the compacted tree.
    for x in 500..1_500u64 {
        db.insert(&x.to_be_bytes(), &[6; 64])?;
    }
    db.commit()?;

    assert_eq!(2_000, db.record_count()?);
    assert_eq!(Some(vec![6; 64]), db.find(&1_000u64.to_be_bytes())?);
    assert_eq!(Some(vec![5; 64]), db.find(&1u64.to_be_bytes())?);

    Ok(())
}

#[test]
fn close_flattens_when_worthwhile() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("t5.db");

    {
        let db = Config::new(&path)
            .content_identifier("t5")
            .key_size(8)
            .auto_commit(false)
            .open()?;

        for x in 0..5_000u64 {
            db.insert(&x.to_be_bytes(), &[9; 48])?;
        }
        db.commit()?;
        for x in 0..4_000u64 {
            db.remove(&x.to_be_bytes())?;
        }
        db.commit()?;
        db.close()?;
    }

    {
        let db = Config::new(&path).open()?;
        assert_eq!(1_000, db.record_count()?);
        assert_eq!(Some(vec![9; 48]), db.find(&4_321u64.to_be_bytes())?);
    }

    Ok(())
}
