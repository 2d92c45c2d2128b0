use btree_db::Config;
use std::sync::Arc;
use test_log::test;

#[test]
fn readers_run_alongside_a_writer() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;

    let db = Arc::new(
        Config::new(folder.path().join("c.db"))
            .content_identifier("c")
            .key_size(8)
            .auto_commit(false)
            .open()?,
    );

    for x in 0..1_000u64 {
        db.insert(&x.to_be_bytes(), &x.to_be_bytes())?;
    }
    db.commit()?;

    let mut readers = Vec::new();
    for t in 0..4u64 {
        let db = db.clone();
        readers.push(std::thread::spawn(move || -> btree_db::Result<u64> {
            let mut hits = 0;
            for x in 0..1_000u64 {
                let key = ((x + t * 251) % 1_000).to_be_bytes();
                // Every committed key stays readable throughout; the value
                // is either the original or the writer's overwrite.
                let value = db.find(&key)?.expect("committed key must be present");
                hits += u64::from(!value.is_empty());
            }
            Ok(hits)
        }));
    }

    // Overwrite concurrently with the readers.
    for x in 0..1_000u64 {
        db.insert(&x.to_be_bytes(), &(x + 1).to_be_bytes())?;
        if x % 100 == 0 {
            db.commit()?;
        }
    }
    db.commit()?;

    for reader in readers {
        let hits = reader.join().expect("reader panicked")?;
        assert_eq!(1_000, hits);
    }

    assert_eq!(1_000, db.record_count()?);
    assert_eq!(Some(1_000u64.to_be_bytes().to_vec()), db.find(&999u64.to_be_bytes())?);

    Ok(())
}

#[test]
fn concurrent_scans_see_consistent_snapshots() -> btree_db::Result<()> {
    let folder = tempfile::tempdir()?;

    let db = Arc::new(
        Config::new(folder.path().join("c.db"))
            .content_identifier("c")
            .key_size(8)
            .auto_commit(false)
            .open()?,
    );

    for x in 0..500u64 {
        db.insert(&x.to_be_bytes(), b"v")?;
    }
    db.commit()?;

    let scanner = {
        let db = db.clone();
        std::thread::spawn(move || -> btree_db::Result<()> {
            for _ in 0..20 {
                let mut previous = None;
                let mut count = 0u64;
                db.for_all(|key, _| {
                    if let Some(previous) = &previous {
                        assert!(previous < &key.to_vec(), "scan out of order");
                    }
                    previous = Some(key.to_vec());
                    count += 1;
                })?;
                // Records are only ever added by the writer below.
                assert!(count >= 500);
            }
            Ok(())
        })
    };

    for x in 500..700u64 {
        db.insert(&x.to_be_bytes(), b"v")?;
        db.commit()?;
    }

    scanner.join().expect("scanner panicked")?;
    Ok(())
}
