// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A copy-on-write B+ tree key-value store over a single-file block device.
//!
//! ##### About
//!
//! This crate exports a [`Database`]: an ordered map from fixed-width keys
//! to variable-width byte values, persisted as a B+ tree laid out on
//! fixed-size blocks of one file.
//!
//! Mutations never overwrite committed state in place. Every modified node
//! is rewritten to a freshly allocated block, so the whole ancestor chain up
//! to the root moves on each change; a transaction becomes durable when the
//! header's double-buffered root descriptor is flipped with a single synced
//! byte write. A crash at any point leaves the file opening cleanly at the
//! last committed root. Freed blocks feed a persistent free list and are
//! recycled; a compaction pass ([`Database::flatten`]) squeezes out the
//! holes that churn leaves behind and shrinks the file.
//!
//! The database is built for one writer and many concurrent readers; reads
//! and scans take a shared lock, mutations and transaction control an
//! exclusive one.
//!
//! Also included: [`Sha256Database`], which hashes arbitrary-length keys
//! down to the tree's fixed width, and [`PackedArchive`], a read-only
//! build-once archive for serving many small assets out of one file.
//!
//! # Example usage
//!
//! ```
//! use btree_db::Config;
//!
//! # let folder = tempfile::tempdir()?;
//! let db = Config::new(folder.path().join("player.db"))
//!     .content_identifier("Player3")
//!     .key_size(4)
//!     .open()?;
//!
//! db.insert(b"key1", b"value")?;
//! assert_eq!(Some(b"value".to_vec()), db.find(b"key1")?);
//!
//! // Ordered scans over a key range (upper bound exclusive)
//! db.for_each(b"key0", b"key9", |_key, _value| {
//!     // ...
//! })?;
//!
//! // Transactions: batch writes, then commit (or roll back)
//! db.set_auto_commit(false)?;
//! db.insert(b"key2", b"other")?;
//! db.commit()?;
//! #
//! # Ok::<(), btree_db::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod archive;
mod codec;
mod db;
mod device;
mod error;
mod free_list;
mod hashed;
mod node;

#[doc(hidden)]
pub mod store;

#[doc(hidden)]
pub mod tree;

mod vlq;

pub use {
    archive::{AssetStream, BuildProgress, PackedArchive},
    db::{Config, Database},
    device::{BlockIndex, NULL_BLOCK},
    error::{Error, Result},
    hashed::Sha256Database,
};
