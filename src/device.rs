// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fixed-size block I/O over a single random-access file.
//!
//! The file starts with a 512-byte header followed by `block_size`-sized
//! blocks. The header carries the format magic, the block geometry and a
//! *pair* of root descriptors selected by a single byte: a commit writes the
//! inactive descriptor, syncs, then flips the selector with a one-byte write.
//! After a crash the selector still points at the last fully-synced root, and
//! any blocks written past it are simply unreachable.
//!
//! All block writes are buffered: the first touch of a block copies its
//! current contents into an in-memory buffer, later writes mutate the buffer,
//! and reads transparently prefer buffered contents. Nothing reaches the file
//! between commits except tail growth.

use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::path::Path;

/// Identifies a fixed-size block inside the database file.
pub type BlockIndex = u32;

/// Reserved block index meaning "no block".
pub const NULL_BLOCK: BlockIndex = BlockIndex::MAX;

pub(crate) const FORMAT_MAGIC: &[u8; 8] = b"BTreeDB5";

/// Fixed header prefix; blocks start at this offset.
pub(crate) const HEADER_SIZE: u64 = 512;

pub(crate) const CONTENT_IDENTIFIER_SIZE: usize = 12;

const ROOT_SELECTOR_OFFSET: u64 = 28;
const ROOT_INFO_OFFSET: u64 = 29;
const ROOT_INFO_SIZE: u64 = 21;

#[cfg(unix)]
pub(crate) fn read_full_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub(crate) fn write_full_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_full_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of file",
            ));
        }
        offset += n as u64;
        buf = buf.get_mut(n..).expect("advance within buffer");
    }

    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_full_at(file: &File, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        offset += n as u64;
        buf = buf.get(n..).expect("advance within buffer");
    }

    Ok(())
}

/// The `(free-index head, device size, root, root-is-leaf)` quadruple that
/// defines the tree's top-of-state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct RootDescriptor {
    pub free_head: BlockIndex,
    pub device_size: u64,
    pub root: BlockIndex,
    pub root_is_leaf: bool,
}

/// Static header fields established at creation time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct HeaderInfo {
    pub block_size: u32,
    pub content_identifier: String,
    pub key_size: u32,
}

pub(crate) struct BlockDevice {
    file: File,
    block_size: u32,

    /// Committed extent of the file; tail growth past this is reclaimed on
    /// rollback and reopen.
    device_size: u64,

    using_alt_root: bool,

    /// Uncommitted block contents, keyed by block index.
    writes: FxHashMap<BlockIndex, Vec<u8>>,
}

impl BlockDevice {
    pub fn open(path: &Path) -> Result<(File, u64)> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok((file, len))
    }

    /// Wraps a freshly-truncated file and writes the static header prefix.
    pub fn create(file: File, header: &HeaderInfo) -> Result<Self> {
        let mut buf = vec![0; HEADER_SIZE as usize];

        buf.get_mut(0..8)
            .expect("header fits")
            .copy_from_slice(FORMAT_MAGIC);
        BigEndian::write_u32(buf.get_mut(8..12).expect("header fits"), header.block_size);

        let id = header.content_identifier.as_bytes();
        buf.get_mut(12..12 + id.len())
            .expect("identifier fits header")
            .copy_from_slice(id);
        BigEndian::write_u32(buf.get_mut(24..28).expect("header fits"), header.key_size);

        file.set_len(HEADER_SIZE)?;
        write_full_at(&file, 0, &buf)?;

        Ok(Self {
            file,
            block_size: header.block_size,
            device_size: HEADER_SIZE,
            using_alt_root: false,
            writes: FxHashMap::default(),
        })
    }

    /// Wraps an existing file, validating the format magic and reading the
    /// static header fields. The root descriptor is read separately.
    pub fn load(file: File) -> Result<(Self, HeaderInfo)> {
        let mut buf = [0; 28];
        read_full_at(&file, 0, &mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Format("file too short for a database header".into())
            } else {
                Error::Io(e)
            }
        })?;

        if buf.get(0..8).expect("fixed buffer") != FORMAT_MAGIC {
            return Err(Error::Format("not a valid BTreeDB5 file".into()));
        }

        let block_size = BigEndian::read_u32(buf.get(8..12).expect("fixed buffer"));
        if block_size == 0 {
            return Err(Error::Format("header records a zero block size".into()));
        }

        let id_bytes = buf.get(12..24).expect("fixed buffer");
        let id_end = id_bytes.iter().position(|b| *b == 0).unwrap_or(id_bytes.len());
        let content_identifier =
            std::str::from_utf8(id_bytes.get(..id_end).expect("within identifier"))
                .map_err(|_| Error::Format("content identifier is not valid UTF-8".into()))?
                .to_owned();

        let key_size = BigEndian::read_u32(buf.get(24..28).expect("fixed buffer"));

        let device = Self {
            file,
            block_size,
            device_size: HEADER_SIZE,
            using_alt_root: false,
            writes: FxHashMap::default(),
        };

        let header = HeaderInfo {
            block_size,
            content_identifier,
            key_size,
        };

        Ok((device, header))
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn device_size(&self) -> u64 {
        self.device_size
    }

    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Number of blocks within the committed extent.
    pub fn block_count(&self) -> BlockIndex {
        ((self.device_size - HEADER_SIZE) / u64::from(self.block_size)) as BlockIndex
    }

    fn block_offset(&self, index: BlockIndex) -> u64 {
        HEADER_SIZE + u64::from(index) * u64::from(self.block_size)
    }

    fn check_block_index(&self, index: BlockIndex) -> Result<()> {
        if index >= self.block_count() {
            return Err(Error::Corruption(format!(
                "block index {index} out of range ({} blocks)",
                self.block_count(),
            )));
        }
        Ok(())
    }

    /// Reads part of a block, preferring uncommitted contents.
    pub fn read_block(&self, index: BlockIndex, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_block_index(index)?;

        let block_size = self.block_size as usize;
        if offset > block_size || buf.len() > block_size - offset {
            return Err(Error::Corruption(format!(
                "read past end of block, offset {offset} len {}",
                buf.len(),
            )));
        }

        if buf.is_empty() {
            return Ok(());
        }

        if let Some(buffered) = self.writes.get(&index) {
            buf.copy_from_slice(
                buffered
                    .get(offset..offset + buf.len())
                    .expect("checked against block size"),
            );
        } else {
            read_full_at(&self.file, self.block_offset(index) + offset as u64, buf)?;
        }

        Ok(())
    }

    /// Reads a whole block into a fresh buffer.
    pub fn read_block_vec(&self, index: BlockIndex) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.block_size as usize];
        self.read_block(index, 0, &mut buf)?;
        Ok(buf)
    }

    /// Writes part of a block into the uncommitted buffer, preloading the
    /// block's current contents on first touch.
    pub fn write_block(&mut self, index: BlockIndex, offset: usize, data: &[u8]) -> Result<()> {
        self.check_block_index(index)?;

        let block_size = self.block_size as usize;
        if offset > block_size || data.len() > block_size - offset {
            return Err(Error::Corruption(format!(
                "write past end of block, offset {offset} len {}",
                data.len(),
            )));
        }

        if data.is_empty() {
            return Ok(());
        }

        let buffered = match self.writes.entry(index) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let mut current = vec![0; block_size];
                read_full_at(
                    &self.file,
                    HEADER_SIZE + u64::from(index) * block_size as u64,
                    &mut current,
                )?;
                entry.insert(current)
            }
        };

        buffered
            .get_mut(offset..offset + data.len())
            .expect("checked against block size")
            .copy_from_slice(data);

        Ok(())
    }

    pub fn drop_buffered_write(&mut self, index: BlockIndex) {
        self.writes.remove(&index);
    }

    pub fn discard_writes(&mut self) {
        self.writes.clear();
    }

    /// Writes every buffered block to its absolute offset and syncs.
    pub fn flush_writes(&mut self) -> Result<()> {
        for (index, buf) in &self.writes {
            write_full_at(
                &self.file,
                HEADER_SIZE + u64::from(*index) * u64::from(self.block_size),
                buf,
            )?;
        }

        self.file.sync_all()?;
        self.writes.clear();
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn resize(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        self.device_size = size;
        Ok(())
    }

    /// Appends one block worth of zeroes, returning its index.
    pub fn grow_one_block(&mut self) -> Result<BlockIndex> {
        let index = self.block_count();
        self.device_size += u64::from(self.block_size);
        self.file.set_len(self.device_size)?;
        Ok(index)
    }

    /// Reads the selector bit and the root descriptor it points at.
    pub fn read_root(&mut self) -> Result<RootDescriptor> {
        let mut selector = [0];
        read_full_at(&self.file, ROOT_SELECTOR_OFFSET, &mut selector)?;
        self.using_alt_root = selector[0] != 0;

        let slot = ROOT_INFO_OFFSET + if self.using_alt_root { ROOT_INFO_SIZE } else { 0 };
        let mut buf = [0; ROOT_INFO_SIZE as usize];
        read_full_at(&self.file, slot, &mut buf)?;

        let descriptor = RootDescriptor {
            free_head: BigEndian::read_u32(buf.get(0..4).expect("fixed buffer")),
            device_size: BigEndian::read_u64(buf.get(4..12).expect("fixed buffer")),
            root: BigEndian::read_u32(buf.get(12..16).expect("fixed buffer")),
            root_is_leaf: buf.get(16).copied().expect("fixed buffer") != 0,
        };
        self.device_size = descriptor.device_size;

        Ok(descriptor)
    }

    /// Commits a new root: writes the descriptor into the inactive slot,
    /// syncs, flips the selector with a single-byte write, syncs again.
    pub fn write_root(&mut self, free_head: BlockIndex, root: BlockIndex, root_is_leaf: bool) -> Result<()> {
        let mut buf = [0; ROOT_INFO_SIZE as usize];
        BigEndian::write_u32(buf.get_mut(0..4).expect("fixed buffer"), free_head);
        BigEndian::write_u64(buf.get_mut(4..12).expect("fixed buffer"), self.device_size);
        BigEndian::write_u32(buf.get_mut(12..16).expect("fixed buffer"), root);
        buf[16] = u8::from(root_is_leaf);

        let slot = ROOT_INFO_OFFSET + if self.using_alt_root { 0 } else { ROOT_INFO_SIZE };
        write_full_at(&self.file, slot, &buf)?;
        self.file.sync_all()?;

        // The single selector byte is the only thing that commits.
        self.using_alt_root = !self.using_alt_root;
        write_full_at(&self.file, ROOT_SELECTOR_OFFSET, &[u8::from(self.using_alt_root)])?;
        self.file.sync_all()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn test_device() -> Result<(tempfile::TempDir, BlockDevice)> {
        let dir = tempfile::tempdir()?;
        let (file, _) = BlockDevice::open(&dir.path().join("dev"))?;

        let device = BlockDevice::create(
            file,
            &HeaderInfo {
                block_size: 64,
                content_identifier: "Test1".into(),
                key_size: 4,
            },
        )?;

        Ok((dir, device))
    }

    #[test]
    fn buffered_writes_are_read_back() -> Result<()> {
        let (_dir, mut device) = test_device()?;

        let a = device.grow_one_block()?;
        device.write_block(a, 0, b"hello")?;

        let mut buf = [0; 5];
        device.read_block(a, 0, &mut buf)?;
        assert_eq!(b"hello", &buf);

        // Not on disk until flushed.
        let offset = HEADER_SIZE;
        assert_eq!(device.file_size()?, offset + 64);

        device.flush_writes()?;
        let mut buf = [0; 5];
        device.read_block(a, 0, &mut buf)?;
        assert_eq!(b"hello", &buf);

        Ok(())
    }

    #[test]
    fn out_of_range_access_is_corruption() -> Result<()> {
        let (_dir, mut device) = test_device()?;
        let a = device.grow_one_block()?;

        let mut buf = [0; 8];
        assert!(matches!(
            device.read_block(a, 60, &mut buf),
            Err(Error::Corruption(_)),
        ));
        assert!(matches!(
            device.read_block(a + 1, 0, &mut buf),
            Err(Error::Corruption(_)),
        ));

        Ok(())
    }

    #[test]
    fn root_descriptor_flip() -> Result<()> {
        let (_dir, mut device) = test_device()?;
        device.write_root(NULL_BLOCK, 3, true)?;

        let descriptor = device.read_root()?;
        assert_eq!(3, descriptor.root);
        assert!(descriptor.root_is_leaf);
        assert_eq!(NULL_BLOCK, descriptor.free_head);

        device.write_root(7, 4, false)?;
        let descriptor = device.read_root()?;
        assert_eq!(4, descriptor.root);
        assert_eq!(7, descriptor.free_head);
        assert!(!descriptor.root_is_leaf);

        Ok(())
    }
}
