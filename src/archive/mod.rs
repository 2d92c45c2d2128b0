// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Packed read-only asset archive.
//!
//! A one-time build concatenates a directory of files into a single archive
//! indexed at the end:
//!
//! ```text
//! offset 0  : 8 bytes  "SBAsset6"
//! offset 8  : 8 bytes  index offset (u64 BE)
//! offset 16 : concatenated asset bodies
//! index     : 5 bytes "INDEX"
//!           : VLQ-length-prefixed metadata JSON object
//!           : VLQ entry count, then per asset:
//!             VLQ path length, path bytes, offset u64 BE, size u64 BE
//! ```
//!
//! The index preserves build order, which sorts assets by an optional
//! extension-priority list and then case-insensitively by path.

mod build;

use crate::device::read_full_at;
use crate::{vlq, Error, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

pub(crate) const ARCHIVE_MAGIC: &[u8; 8] = b"SBAsset6";
pub(crate) const INDEX_MAGIC: &[u8; 5] = b"INDEX";

/// Byte range of one asset inside the archive file.
#[derive(Copy, Clone, Debug)]
struct AssetRange {
    offset: u64,
    size: u64,
}

fn index_truncated(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Format("archive index is truncated".into())
    } else {
        Error::Io(e)
    }
}

/// Read-only archive of packed assets, indexed by path.
///
/// # Examples
///
/// ```no_run
/// # use btree_db::PackedArchive;
/// let archive = PackedArchive::open("assets.pak")?;
///
/// for path in archive.asset_paths() {
///     let contents = archive.read(path)?;
///     // ...
/// }
/// # Ok::<(), btree_db::Error>(())
/// ```
pub struct PackedArchive {
    file: Arc<File>,
    metadata: serde_json::Map<String, serde_json::Value>,
    index: Vec<(String, AssetRange)>,
    lookup: FxHashMap<String, usize>,
}

impl PackedArchive {
    /// Opens a packed archive, validating its signature and loading the
    /// index.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut header = [0; 16];
        read_full_at(&file, 0, &mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Format("file too short for a packed archive".into())
            } else {
                Error::Io(e)
            }
        })?;

        if header.get(0..8).expect("fixed buffer") != ARCHIVE_MAGIC {
            return Err(Error::Format("packed archive signature unrecognized".into()));
        }

        let index_offset = BigEndian::read_u64(header.get(8..16).expect("fixed buffer"));
        if index_offset < 16 || index_offset > file_size {
            return Err(Error::Format(format!(
                "archive index offset {index_offset} out of bounds",
            )));
        }

        let mut index_bytes = vec![0; (file_size - index_offset) as usize];
        read_full_at(&file, index_offset, &mut index_bytes)?;
        let mut reader = index_bytes.as_slice();

        let mut marker = [0; 5];
        reader.read_exact(&mut marker).map_err(index_truncated)?;
        if &marker != INDEX_MAGIC {
            return Err(Error::Format("no index marker found".into()));
        }

        let metadata_len = vlq::read_uvlq(&mut reader).map_err(index_truncated)? as usize;
        if metadata_len > reader.len() {
            return Err(Error::Format("archive index is truncated".into()));
        }
        let (metadata_bytes, rest) = reader.split_at(metadata_len);
        reader = rest;

        let metadata = if metadata_bytes.is_empty() {
            serde_json::Map::new()
        } else {
            match serde_json::from_slice(metadata_bytes) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => return Err(Error::Format("archive metadata is not a JSON object".into())),
                Err(e) => return Err(Error::Format(format!("invalid archive metadata: {e}"))),
            }
        };

        let count = vlq::read_uvlq(&mut reader).map_err(index_truncated)? as usize;
        let mut index = Vec::with_capacity(count.min(index_bytes.len()));
        let mut lookup =
            FxHashMap::with_capacity_and_hasher(count.min(index_bytes.len()), Default::default());

        for _ in 0..count {
            let path_len = vlq::read_uvlq(&mut reader).map_err(index_truncated)? as usize;
            if path_len > reader.len() {
                return Err(Error::Format("archive index is truncated".into()));
            }
            let (path_bytes, rest) = reader.split_at(path_len);
            reader = rest;

            let path = std::str::from_utf8(path_bytes)
                .map_err(|_| Error::Format("asset path is not valid UTF-8".into()))?
                .to_owned();

            let offset = reader.read_u64::<BigEndian>().map_err(index_truncated)?;
            let size = reader.read_u64::<BigEndian>().map_err(index_truncated)?;

            lookup.insert(path.clone(), index.len());
            index.push((path, AssetRange { offset, size }));
        }

        Ok(Self {
            file: Arc::new(file),
            metadata,
            index,
            lookup,
        })
    }

    /// Metadata blob recorded at build time.
    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    /// Asset paths, in archive order.
    pub fn asset_paths(&self) -> impl Iterator<Item = &str> {
        self.index.iter().map(|(path, _)| path.as_str())
    }

    /// Number of assets.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the archive holds no assets.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn range(&self, path: &str) -> Result<AssetRange> {
        self.lookup
            .get(path)
            .map(|i| self.index.get(*i).expect("lookup points into index").1)
            .ok_or_else(|| Error::NotFound(format!("no asset {path:?} in packed archive")))
    }

    /// Reads a whole asset.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let range = self.range(path)?;

        let mut contents = vec![0; range.size as usize];
        read_full_at(&self.file, range.offset, &mut contents)?;
        Ok(contents)
    }

    /// Opens a seekable read stream over one asset. Streams share the
    /// archive's file handle, so any number can be read concurrently.
    pub fn open_stream(&self, path: &str) -> Result<AssetStream> {
        let range = self.range(path)?;

        Ok(AssetStream {
            file: self.file.clone(),
            offset: range.offset,
            size: range.size,
            pos: 0,
        })
    }
}

/// Read-only stream over one asset's byte range.
///
/// Reads clamp to the asset's recorded range; the stream cannot observe
/// bytes of neighboring assets.
pub struct AssetStream {
    file: Arc<File>,
    offset: u64,
    size: u64,
    pos: u64,
}

impl AssetStream {
    /// Length of the asset in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for AssetStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        let len = (buf.len() as u64).min(remaining) as usize;

        if len == 0 {
            return Ok(0);
        }

        read_full_at(
            &self.file,
            self.offset + self.pos,
            buf.get_mut(..len).expect("len clamped to buffer"),
        )?;
        self.pos += len as u64;
        Ok(len)
    }
}

impl Seek for AssetStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::Current(d) => self
                .pos
                .saturating_add_signed(d)
                .min(self.size),
            SeekFrom::End(d) => self.size.saturating_add_signed(d).min(self.size),
        };

        Ok(self.pos)
    }
}

pub use build::BuildProgress;
