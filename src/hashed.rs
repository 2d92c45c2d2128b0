// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Database variant accepting keys of any length.
//!
//! Caller keys are normalized to the tree's fixed width by hashing them with
//! SHA-256; the 32-byte digest is what the tree actually stores. Range scans
//! are meaningless under hashed keys, so only point operations are exposed.

use crate::{Config, Database, Result};
use sha2::{Digest, Sha256};

fn hash_key<K: AsRef<[u8]>>(key: K) -> [u8; 32] {
    Sha256::digest(key.as_ref()).into()
}

/// Key-value store over arbitrary-length keys, hashed down to a fixed
/// 32-byte key for the underlying [`Database`].
///
/// # Examples
///
/// ```
/// # use btree_db::{Config, Sha256Database};
/// # let dir = tempfile::tempdir()?;
/// let db = Sha256Database::open(
///     Config::new(dir.path().join("assets.db")).content_identifier("Assets1"),
/// )?;
///
/// db.insert("some/asset/path.png", b"contents")?;
/// assert!(db.contains("some/asset/path.png")?);
/// # Ok::<(), btree_db::Error>(())
/// ```
pub struct Sha256Database {
    db: Database,
}

impl Sha256Database {
    /// Opens a hashed-key database; the configured key size is overridden
    /// with the SHA-256 digest width.
    pub fn open(config: Config) -> Result<Self> {
        Ok(Self {
            db: config.key_size(32).open()?,
        })
    }

    /// Returns whether the database holds the given key.
    pub fn contains<K: AsRef<[u8]>>(&self, key: K) -> Result<bool> {
        self.db.contains(&hash_key(key))
    }

    /// Returns the value stored for the given key.
    pub fn find<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Vec<u8>>> {
        self.db.find(&hash_key(key))
    }

    /// Inserts a record, returning whether a previous value was overwritten.
    pub fn insert<K: AsRef<[u8]>>(&self, key: K, value: &[u8]) -> Result<bool> {
        self.db.insert(&hash_key(key), value)
    }

    /// Removes a record, returning whether it existed.
    pub fn remove<K: AsRef<[u8]>>(&self, key: K) -> Result<bool> {
        self.db.remove(&hash_key(key))
    }

    /// The wrapped database, for transaction control and metrics.
    pub fn inner(&self) -> &Database {
        &self.db
    }

    /// Flushes buffered writes and atomically switches to the new root.
    pub fn commit(&self) -> Result<()> {
        self.db.commit()
    }

    /// Discards everything since the last commit.
    pub fn rollback(&self) -> Result<()> {
        self.db.rollback()
    }

    /// Flushes and closes the database.
    pub fn close(&self) -> Result<()> {
        self.db.close()
    }
}
