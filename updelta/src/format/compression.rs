// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Compressed blob formats used by replace operations and bsdiff patches.

use std::io::{self, Read, Write};

use bzip2::{read::BzDecoder, write::BzEncoder};
use liblzma::{read::XzDecoder, write::XzEncoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedFormat {
    None,
    Bzip2,
    Xz,
}

pub enum CompressedReader<R: Read> {
    None(R),
    Bzip2(BzDecoder<R>),
    Xz(XzDecoder<R>),
}

impl<R: Read> CompressedReader<R> {
    pub fn with_format(reader: R, format: CompressedFormat) -> Self {
        match format {
            CompressedFormat::None => Self::None(reader),
            CompressedFormat::Bzip2 => Self::Bzip2(BzDecoder::new(reader)),
            CompressedFormat::Xz => Self::Xz(XzDecoder::new(reader)),
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::None(r) => r.read(buf),
            Self::Bzip2(r) => r.read(buf),
            Self::Xz(r) => r.read(buf),
        }
    }
}

pub enum CompressedWriter<W: Write> {
    None(W),
    Bzip2(BzEncoder<W>),
    Xz(XzEncoder<W>),
}

impl<W: Write> CompressedWriter<W> {
    pub fn new(writer: W, format: CompressedFormat) -> Self {
        match format {
            CompressedFormat::None => Self::None(writer),
            CompressedFormat::Bzip2 => {
                Self::Bzip2(BzEncoder::new(writer, bzip2::Compression::best()))
            }
            CompressedFormat::Xz => Self::Xz(XzEncoder::new(writer, 6)),
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::None(w) => Ok(w),
            Self::Bzip2(w) => w.finish(),
            Self::Xz(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::None(w) => w.write(buf),
            Self::Bzip2(w) => w.write(buf),
            Self::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::None(w) => w.flush(),
            Self::Bzip2(w) => w.flush(),
            Self::Xz(w) => w.flush(),
        }
    }
}
