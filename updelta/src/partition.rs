// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Block-range addressing over the kernel and rootfs partitions.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
    ops::Range,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    protobuf::chromeos_update_engine::Extent,
    stream::{self, ReadAt, WriteAt},
};

/// `start_block` value that marks an extent as a hole. Writes to a hole are
/// discarded and reads from one produce zeros.
pub const SPARSE_HOLE: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("No source partition available for {0}")]
    NoSourcePartition(PartitionKind),
    #[error("Extents cover {len} bytes, but partition is only {size} bytes")]
    OutOfBounds { len: u64, size: u64 },
    #[error("Expected {expected} bytes for extents, but have {actual} bytes")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("Failed to open partition: {0:?}")]
    Open(PathBuf, #[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionKind {
    Rootfs,
    Kernel,
}

impl PartitionKind {
    /// Order in which partitions are updated by a payload.
    pub const ALL: [Self; 2] = [Self::Rootfs, Self::Kernel];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rootfs => "rootfs",
            Self::Kernel => "kernel",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated [`Extent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockExtent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl BlockExtent {
    pub fn is_sparse(&self) -> bool {
        self.start_block == SPARSE_HOLE
    }

    pub fn byte_offset(&self, block_size: u64) -> Result<u64> {
        self.start_block
            .checked_mul(block_size)
            .ok_or(Error::IntegerTooLarge("start_block"))
    }

    pub fn byte_len(&self, block_size: u64) -> Result<u64> {
        self.num_blocks
            .checked_mul(block_size)
            .ok_or(Error::IntegerTooLarge("num_blocks"))
    }

    /// Byte range covered by a non-sparse extent.
    pub fn byte_range(&self, block_size: u64) -> Result<Range<u64>> {
        let start = self.byte_offset(block_size)?;
        let end = start
            .checked_add(self.byte_len(block_size)?)
            .ok_or(Error::IntegerTooLarge("extent_end"))?;

        Ok(start..end)
    }
}

impl TryFrom<&Extent> for BlockExtent {
    type Error = Error;

    fn try_from(extent: &Extent) -> Result<Self> {
        Ok(Self {
            start_block: extent
                .start_block
                .ok_or(Error::MissingField("start_block"))?,
            num_blocks: extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?,
        })
    }
}

pub fn parse_extents(extents: &[Extent]) -> Result<Vec<BlockExtent>> {
    extents.iter().map(BlockExtent::try_from).collect()
}

/// Total number of bytes covered by `extents`, including holes.
pub fn extents_byte_len(extents: &[BlockExtent], block_size: u64) -> Result<u64> {
    extents.iter().try_fold(0u64, |total, extent| {
        total
            .checked_add(extent.byte_len(block_size)?)
            .ok_or(Error::IntegerTooLarge("extents_length"))
    })
}

/// Paths to the partitions being updated. The source paths are only needed for
/// payloads that read from a separate copy of the old image.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPaths {
    pub rootfs: PathBuf,
    pub kernel: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_source: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_source: Option<PathBuf>,
}

impl PartitionPaths {
    pub fn target(&self, kind: PartitionKind) -> &Path {
        match kind {
            PartitionKind::Rootfs => &self.rootfs,
            PartitionKind::Kernel => &self.kernel,
        }
    }

    pub fn source(&self, kind: PartitionKind) -> Option<&Path> {
        match kind {
            PartitionKind::Rootfs => self.rootfs_source.as_deref(),
            PartitionKind::Kernel => self.kernel_source.as_deref(),
        }
    }
}

/// Where an operation reads its input blocks from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// The partition being written. Used by in-place updates.
    Target,
    /// A separate read-only copy of the old partition.
    Source,
}

struct PartitionHandles {
    target: Box<dyn WriteAt>,
    source: Option<Box<dyn ReadAt>>,
}

/// Open handles for both partitions.
pub struct Partitions {
    rootfs: PartitionHandles,
    kernel: PartitionHandles,
}

impl fmt::Debug for Partitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partitions")
            .field("rootfs_source", &self.rootfs.source.is_some())
            .field("kernel_source", &self.kernel.source.is_some())
            .finish_non_exhaustive()
    }
}

fn open_target(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| Error::Open(path.to_owned(), e))
}

fn open_source(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::Open(path.to_owned(), e))
}

impl Partitions {
    pub fn new(rootfs: Box<dyn WriteAt>, kernel: Box<dyn WriteAt>) -> Self {
        Self {
            rootfs: PartitionHandles {
                target: rootfs,
                source: None,
            },
            kernel: PartitionHandles {
                target: kernel,
                source: None,
            },
        }
    }

    pub fn with_sources(
        mut self,
        rootfs_source: Box<dyn ReadAt>,
        kernel_source: Box<dyn ReadAt>,
    ) -> Self {
        self.rootfs.source = Some(rootfs_source);
        self.kernel.source = Some(kernel_source);
        self
    }

    pub fn open(paths: &PartitionPaths) -> Result<Self> {
        let mut result = Self::new(
            Box::new(open_target(&paths.rootfs)?),
            Box::new(open_target(&paths.kernel)?),
        );

        for kind in PartitionKind::ALL {
            if let Some(path) = paths.source(kind) {
                let file = open_source(path)?;
                result.handles_mut(kind).source = Some(Box::new(file));
            }

            debug!(
                "Opened {kind} target {:?} with source {:?}",
                paths.target(kind),
                paths.source(kind),
            );
        }

        Ok(result)
    }

    fn handles(&self, kind: PartitionKind) -> &PartitionHandles {
        match kind {
            PartitionKind::Rootfs => &self.rootfs,
            PartitionKind::Kernel => &self.kernel,
        }
    }

    fn handles_mut(&mut self, kind: PartitionKind) -> &mut PartitionHandles {
        match kind {
            PartitionKind::Rootfs => &mut self.rootfs,
            PartitionKind::Kernel => &mut self.kernel,
        }
    }

    pub fn target(&self, kind: PartitionKind) -> &dyn WriteAt {
        &*self.handles(kind).target
    }

    /// Read all of `extents` into an owned buffer. Holes read as zeros.
    pub fn read_extents(
        &self,
        kind: PartitionKind,
        source: SourceKind,
        extents: &[BlockExtent],
        block_size: u64,
    ) -> Result<Vec<u8>> {
        let handles = self.handles(kind);

        match source {
            SourceKind::Target => read_extents_from(&*handles.target, extents, block_size),
            SourceKind::Source => {
                let reader = handles
                    .source
                    .as_deref()
                    .ok_or(Error::NoSourcePartition(kind))?;
                read_extents_from(reader, extents, block_size)
            }
        }
    }

    /// Write `data` across `extents`. The data must exactly fill the extents.
    pub fn write_extents(
        &self,
        kind: PartitionKind,
        extents: &[BlockExtent],
        block_size: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut writer = ExtentWriter::new(self.target(kind), extents, block_size)?;
        writer.write_all(data)?;
        writer.finish()
    }

    /// Flush both targets to durable storage.
    pub fn flush(&self) -> Result<()> {
        for kind in PartitionKind::ALL {
            self.target(kind).sync()?;
        }

        Ok(())
    }
}

fn read_extents_from<R: ?Sized + ReadAt>(
    reader: &R,
    extents: &[BlockExtent],
    block_size: u64,
) -> Result<Vec<u8>> {
    let total = extents_byte_len(extents, block_size)?;
    // Nothing can legitimately read more than the whole partition.
    let size = reader.size()?;
    if total > size {
        return Err(Error::OutOfBounds { len: total, size });
    }

    let total = usize::try_from(total).map_err(|_| Error::IntegerTooLarge("src_length"))?;
    let mut buf = vec![0u8; total];
    let mut pos = 0;

    for extent in extents {
        let len = extent.byte_len(block_size)? as usize;

        if !extent.is_sparse() {
            let range = extent.byte_range(block_size)?;
            reader.read_exact_at(&mut buf[pos..pos + len], range.start)?;
        }

        pos += len;
    }

    Ok(buf)
}

/// A writer that scatters a byte stream across a list of extents. Bytes that
/// land in a hole are consumed and dropped. Once every extent is full, writes
/// return `Ok(0)`.
pub struct ExtentWriter<'a, W: ?Sized> {
    file: &'a W,
    extents: &'a [BlockExtent],
    block_size: u64,
    index: usize,
    offset_in_extent: u64,
    capacity: u64,
    written: u64,
}

impl<'a, W: ?Sized + WriteAt> ExtentWriter<'a, W> {
    pub fn new(file: &'a W, extents: &'a [BlockExtent], block_size: u64) -> Result<Self> {
        for extent in extents.iter().filter(|e| !e.is_sparse()) {
            extent.byte_range(block_size)?;
        }

        Ok(Self {
            file,
            extents,
            block_size,
            index: 0,
            offset_in_extent: 0,
            capacity: extents_byte_len(extents, block_size)?,
            written: 0,
        })
    }

    /// Total number of bytes the extents can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Ensure that every extent was completely filled.
    pub fn finish(self) -> Result<()> {
        if self.written != self.capacity {
            return Err(Error::LengthMismatch {
                expected: self.capacity,
                actual: self.written,
            });
        }

        Ok(())
    }
}

impl<W: ?Sized + WriteAt> Write for ExtentWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        while self.index < self.extents.len() {
            let extent = &self.extents[self.index];
            // Bounds were validated by new().
            let extent_len = extent.num_blocks * self.block_size;

            if self.offset_in_extent == extent_len {
                self.index += 1;
                self.offset_in_extent = 0;
                continue;
            }

            let to_write = buf
                .len()
                .min((extent_len - self.offset_in_extent).min(usize::MAX as u64) as usize);

            let n = if extent.is_sparse() {
                to_write
            } else {
                let offset = extent
                    .start_block
                    .checked_mul(self.block_size)
                    .and_then(|o| o.checked_add(self.offset_in_extent))
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidInput, "Extent offset overflows")
                    })?;
                self.file.write_at(&buf[..to_write], offset)?
            };

            self.offset_in_extent += n as u64;
            self.written += n as u64;

            return Ok(n);
        }

        Ok(0)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compute the SHA-256 digest of the first `size` bytes of `file`.
pub fn hash_partition(
    file: &(impl ReadAt + ?Sized),
    size: u64,
    cancel_signal: &AtomicBool,
) -> Result<[u8; 32]> {
    let mut context = Context::new(&SHA256);
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0;

    while offset < size {
        stream::check_cancel(cancel_signal)?;

        let n = (size - offset).min(buf.len() as u64) as usize;
        file.read_exact_at(&mut buf[..n], offset)?;
        context.update(&buf[..n]);

        offset += n as u64;
    }

    let mut digest = [0u8; 32];
    digest.copy_from_slice(context.finish().as_ref());

    Ok(digest)
}

/// Compute the SHA-256 digest of the first `size` bytes of the partition at
/// `path`. If `size` is [`None`], the whole file is hashed. Returns the number
/// of bytes hashed along with the digest.
pub fn compute_partition_hash(
    path: &Path,
    size: Option<u64>,
    cancel_signal: &AtomicBool,
) -> Result<(u64, [u8; 32])> {
    let file = open_source(path)?;
    let size = match size {
        Some(s) => s,
        None => file.size()?,
    };

    let digest = hash_partition(&file, size, cancel_signal)?;

    Ok((size, digest))
}
