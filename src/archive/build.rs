// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Archive builder.
//!
//! Packs a directory of files into a single archive file. Assets are laid
//! out by an extension-priority sort: extensions named in the priority list
//! come first, in list order; everything else follows in one group; ties
//! break case-insensitively by path. A `_metadata` JSON-object file at the
//! source root becomes the archive metadata and is excluded from the asset
//! list.
//!
//! The archive is assembled in a temporary file next to the target and
//! persisted atomically once the index has been back-patched.

use super::{PackedArchive, ARCHIVE_MAGIC, INDEX_MAGIC};
use crate::device::write_full_at;
use crate::{vlq, Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the optional metadata file at the source root.
const METADATA_FILE: &str = "_metadata";

/// Build progress callback: `(index, total, filesystem path, asset path)`,
/// called before each asset is packed.
pub type BuildProgress<'a> = &'a mut dyn FnMut(usize, usize, &Path, &str);

/// Recursively collects `(asset path, filesystem path)` pairs.
fn collect_assets(
    root: &Path,
    dir: &Path,
    assets: &mut Vec<(String, PathBuf)>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            collect_assets(root, &path, assets)?;
        } else {
            if path.parent() == Some(root)
                && path.file_name() == Some(std::ffi::OsStr::new(METADATA_FILE))
            {
                continue;
            }

            let relative = path.strip_prefix(root).map_err(|_| {
                Error::InvalidArgument(format!("path {} escapes source directory", path.display()))
            })?;

            let mut asset_path = String::new();
            for component in relative.components() {
                asset_path.push('/');
                asset_path.push_str(&component.as_os_str().to_string_lossy());
            }

            assets.push((asset_path, path));
        }
    }

    Ok(())
}

/// Sort rank of one asset: priority group of its extension, then the
/// case-folded path.
fn ordering_value(extension_sort: &[&str], asset_path: &str) -> (usize, String) {
    let extension = asset_path
        .rfind('.')
        .map(|dot| asset_path.get(dot + 1..).expect("dot within path"))
        .unwrap_or_default()
        .to_lowercase();

    let group = extension_sort
        .iter()
        .position(|e| e.eq_ignore_ascii_case(&extension))
        .unwrap_or(extension_sort.len());

    (group, asset_path.to_lowercase())
}

impl PackedArchive {
    /// Packs every file under `source_dir` into an archive at `target`.
    ///
    /// `extension_sort` orders assets by extension (case-insensitive); any
    /// extension not listed sorts after all listed ones. `progress` is
    /// invoked per asset before it is packed.
    pub fn build(
        source_dir: impl AsRef<Path>,
        target: impl AsRef<Path>,
        extension_sort: &[&str],
        mut progress: Option<BuildProgress<'_>>,
    ) -> Result<()> {
        let source_dir = source_dir.as_ref();
        let target = target.as_ref();

        let metadata_path = source_dir.join(METADATA_FILE);
        let metadata: serde_json::Map<String, serde_json::Value> = if metadata_path.is_file() {
            match serde_json::from_slice(&std::fs::read(&metadata_path)?) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => {
                    return Err(Error::Format(format!(
                        "{METADATA_FILE} must hold a JSON object",
                    )))
                }
                Err(e) => return Err(Error::Format(format!("invalid {METADATA_FILE}: {e}"))),
            }
        } else {
            serde_json::Map::new()
        };

        let mut assets = Vec::new();
        collect_assets(source_dir, source_dir, &mut assets)?;
        assets.sort_by_cached_key(|(asset_path, _)| ordering_value(extension_sort, asset_path));

        let folder = target.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;

        let mut index: Vec<(String, u64, u64)> = Vec::with_capacity(assets.len());
        {
            let out = temp_file.as_file_mut();
            out.write_all(ARCHIVE_MAGIC)?;
            // Placeholder for the index offset, patched once it is known.
            out.write_u64::<BigEndian>(0)?;

            let mut pos: u64 = 16;
            let total = assets.len();

            for (i, (asset_path, fs_path)) in assets.iter().enumerate() {
                if let Some(callback) = progress.as_mut() {
                    callback(i, total, fs_path, asset_path);
                }

                let contents = std::fs::read(fs_path)?;
                out.write_all(&contents)?;

                index.push((asset_path.clone(), pos, contents.len() as u64));
                pos += contents.len() as u64;
            }

            let index_offset = pos;
            out.write_all(INDEX_MAGIC)?;

            let metadata_bytes = serde_json::to_vec(&serde_json::Value::Object(metadata))
                .map_err(|e| Error::Format(format!("unencodable metadata: {e}")))?;
            vlq::write_uvlq(out, metadata_bytes.len() as u64)?;
            out.write_all(&metadata_bytes)?;

            vlq::write_uvlq(out, index.len() as u64)?;
            for (asset_path, offset, size) in &index {
                vlq::write_uvlq(out, asset_path.len() as u64)?;
                out.write_all(asset_path.as_bytes())?;
                out.write_u64::<BigEndian>(*offset)?;
                out.write_u64::<BigEndian>(*size)?;
            }

            out.flush()?;

            let mut offset_field = [0; 8];
            BigEndian::write_u64(&mut offset_field, index_offset);
            write_full_at(out, 8, &offset_field)?;

            out.sync_all()?;
        }

        temp_file
            .persist(target)
            .map_err(|e| Error::Io(e.error))?;

        Ok(())
    }
}
