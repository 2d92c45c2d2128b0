// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Variable-length unsigned integer helpers.
//!
//! Record values and archive index entries are length-prefixed with a VLQ
//! (7 payload bits per byte, high bit set while more bytes follow).

use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

pub fn write_uvlq<W: Write>(writer: &mut W, value: u64) -> std::io::Result<()> {
    writer.write_u64_varint(value)
}

pub fn read_uvlq<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    reader.read_u64_varint()
}

/// Encoded byte length of `value`, without encoding it.
///
/// Leaf capacity arithmetic needs this for every record it sizes up.
pub fn uvlq_len(mut value: u64) -> usize {
    let mut len = 1;

    while value > 0x7F {
        value >>= 7;
        len += 1;
    }

    len
}
