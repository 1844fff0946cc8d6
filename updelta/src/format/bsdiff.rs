// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Applier for `BSDIFF40` patches. A patch consists of a 32-byte header
//! followed by three bzip2 streams: the control entries, the diff bytes, and
//! the extra bytes.

use std::{fmt, io::Read};

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::{
    format::compression::{CompressedFormat, CompressedReader},
    stream::ReadFixedSizeExt,
    util::NumBytes,
};

pub const MAGIC: &[u8; 8] = b"BSDIFF40";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Patch too small for header: {0:?}")]
    TooSmall(NumBytes<usize>),
    #[error("Invalid patch magic: {0:?}")]
    InvalidMagic([u8; 8]),
    #[error("{0:?} field is negative: {1}")]
    NegativeField(&'static str, i64),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Patch output is {new_size} bytes, but at most {limit} bytes fit")]
    OutputTooLarge { new_size: usize, limit: usize },
    #[error("Control entry #{index} writes past end of output ({new_size} bytes)")]
    OutputOverflow { index: usize, new_size: usize },
    #[error("Failed to read patch {0} data")]
    DataRead(&'static str, #[source] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Decode bsdiff's 64-bit sign-magnitude little endian integer.
pub fn decode_offtin(buf: [u8; 8]) -> i64 {
    let magnitude = u64::from_le_bytes(buf) & !(1 << 63);
    // Cannot overflow because the sign bit was masked off.
    let value = magnitude as i64;

    if buf[7] & 0x80 != 0 { -value } else { value }
}

/// Raw on-disk layout of the patch header.
#[derive(Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`MAGIC`].
    magic: [u8; 8],
    /// Compressed size of the control block.
    ctrl_len: [u8; 8],
    /// Compressed size of the diff block.
    diff_len: [u8; 8],
    /// Size of the output.
    new_size: [u8; 8],
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &self.magic)
            .field("ctrl_len", &decode_offtin(self.ctrl_len))
            .field("diff_len", &decode_offtin(self.diff_len))
            .field("new_size", &decode_offtin(self.new_size))
            .finish()
    }
}

fn non_negative(name: &'static str, value: i64) -> Result<usize> {
    if value < 0 {
        return Err(Error::NegativeField(name, value));
    }

    usize::try_from(value).map_err(|_| Error::IntegerTooLarge(name))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchHeader {
    pub ctrl_len: usize,
    pub diff_len: usize,
    pub new_size: usize,
}

impl PatchHeader {
    pub const SIZE: usize = 32;

    pub fn parse(patch: &[u8]) -> Result<Self> {
        let Ok((raw, _)) = RawHeader::ref_from_prefix(patch) else {
            return Err(Error::TooSmall(NumBytes(patch.len())));
        };

        if raw.magic != *MAGIC {
            return Err(Error::InvalidMagic(raw.magic));
        }

        let header = Self {
            ctrl_len: non_negative("ctrl_len", decode_offtin(raw.ctrl_len))?,
            diff_len: non_negative("diff_len", decode_offtin(raw.diff_len))?,
            new_size: non_negative("new_size", decode_offtin(raw.new_size))?,
        };

        let blocks_len = header
            .ctrl_len
            .checked_add(header.diff_len)
            .and_then(|n| n.checked_add(Self::SIZE))
            .ok_or(Error::IntegerTooLarge("blocks_len"))?;
        if blocks_len > patch.len() {
            return Err(Error::TooSmall(NumBytes(patch.len())));
        }

        Ok(header)
    }
}

fn read_offtin(reader: &mut impl Read) -> Result<i64> {
    reader
        .read_array_exact::<8>()
        .map(decode_offtin)
        .map_err(|e| Error::DataRead("control", e))
}

/// Apply `patch` to `old` and return the new data. The output size declared
/// by the patch must not exceed `limit`.
pub fn apply(old: &[u8], patch: &[u8], limit: usize) -> Result<Vec<u8>> {
    let header = PatchHeader::parse(patch)?;
    if header.new_size > limit {
        return Err(Error::OutputTooLarge {
            new_size: header.new_size,
            limit,
        });
    }

    let ctrl_start = PatchHeader::SIZE;
    let diff_start = ctrl_start + header.ctrl_len;
    let extra_start = diff_start + header.diff_len;

    let mut ctrl_reader =
        CompressedReader::with_format(&patch[ctrl_start..diff_start], CompressedFormat::Bzip2);
    let mut diff_reader =
        CompressedReader::with_format(&patch[diff_start..extra_start], CompressedFormat::Bzip2);
    let mut extra_reader =
        CompressedReader::with_format(&patch[extra_start..], CompressedFormat::Bzip2);

    let mut new = vec![0u8; header.new_size];
    let mut new_pos = 0usize;
    let mut old_pos = 0i64;
    let mut index = 0;

    while new_pos < header.new_size {
        let add_len = non_negative("add_len", read_offtin(&mut ctrl_reader)?)?;
        let copy_len = non_negative("copy_len", read_offtin(&mut ctrl_reader)?)?;
        let seek = read_offtin(&mut ctrl_reader)?;

        let add_end = new_pos
            .checked_add(add_len)
            .filter(|n| *n <= header.new_size)
            .ok_or(Error::OutputOverflow {
                index,
                new_size: header.new_size,
            })?;

        let chunk = &mut new[new_pos..add_end];
        diff_reader
            .read_exact(chunk)
            .map_err(|e| Error::DataRead("diff", e))?;

        // Bytes outside of the old data contribute nothing.
        for (i, b) in chunk.iter_mut().enumerate() {
            let Some(pos) = old_pos.checked_add(i as i64) else {
                break;
            };
            if let Some(old_byte) = usize::try_from(pos).ok().and_then(|p| old.get(p)) {
                *b = b.wrapping_add(*old_byte);
            }
        }

        new_pos = add_end;
        old_pos = old_pos
            .checked_add(add_len as i64)
            .ok_or(Error::IntegerTooLarge("old_pos"))?;

        let copy_end = new_pos
            .checked_add(copy_len)
            .filter(|n| *n <= header.new_size)
            .ok_or(Error::OutputOverflow {
                index,
                new_size: header.new_size,
            })?;

        extra_reader
            .read_exact(&mut new[new_pos..copy_end])
            .map_err(|e| Error::DataRead("extra", e))?;

        new_pos = copy_end;
        old_pos = old_pos
            .checked_add(seek)
            .ok_or(Error::IntegerTooLarge("old_pos"))?;
        index += 1;
    }

    Ok(new)
}
