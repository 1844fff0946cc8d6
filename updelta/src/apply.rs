// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Execution of a single install operation against the partitions.

use std::io;

use ring::digest::{self, SHA256};
use thiserror::Error;
use tracing::trace;

use crate::{
    format::{
        bsdiff,
        compression::{CompressedFormat, CompressedReader},
    },
    partition::{self, BlockExtent, ExtentWriter, PartitionKind, Partitions, SourceKind},
    protobuf::chromeos_update_engine::{InstallOperation, install_operation::Type},
    stream::WriteZerosExt,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported operation type: {0}")]
    UnsupportedType(i32),
    #[error("{0:?} operation must not have data, but has {1} bytes")]
    UnexpectedData(Type, u64),
    #[error("{0:?} operation data does not fit in destination extents ({1} bytes)")]
    DataTooLarge(Type, u64),
    #[error("{what} is {actual} bytes, but expected {expected} bytes")]
    SizeMismatch {
        what: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("Source data hash mismatch: expected {expected}, but have {actual}")]
    SourceHashMismatch { expected: String, actual: String },
    #[error("Failed to decompress {0:?} data")]
    Decompress(Type, #[source] io::Error),
    #[error("Failed to apply bsdiff patch")]
    Bsdiff(#[from] bsdiff::Error),
    #[error("Partition error")]
    Partition(#[from] partition::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// What an operation does, with the details needed to dispatch it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// Write the (possibly compressed) data blob to the destination.
    Replace(CompressedFormat),
    /// Fill the destination with zeros.
    Zero,
    /// Copy source blocks to the destination.
    Copy(SourceKind),
    /// Patch source blocks with the data blob and write the result to the
    /// destination.
    Bsdiff(SourceKind),
}

impl OperationKind {
    pub fn from_type(ty: Type) -> Self {
        match ty {
            Type::Replace => Self::Replace(CompressedFormat::None),
            Type::ReplaceBz => Self::Replace(CompressedFormat::Bzip2),
            Type::ReplaceXz => Self::Replace(CompressedFormat::Xz),
            Type::Zero | Type::Discard => Self::Zero,
            Type::Move => Self::Copy(SourceKind::Target),
            Type::SourceCopy => Self::Copy(SourceKind::Source),
            Type::Bsdiff => Self::Bsdiff(SourceKind::Target),
            Type::SourceBsdiff => Self::Bsdiff(SourceKind::Source),
        }
    }

    /// Whether the operation reads old data.
    pub fn reads_source(self) -> bool {
        matches!(self, Self::Copy(_) | Self::Bsdiff(_))
    }
}

/// A validated [`InstallOperation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub partition: PartitionKind,
    pub ty: Type,
    pub kind: OperationKind,
    pub src_extents: Vec<BlockExtent>,
    pub src_length: Option<u64>,
    pub dst_extents: Vec<BlockExtent>,
    pub dst_length: Option<u64>,
    /// Offset of the data blob relative to the start of the blob section.
    pub data_offset: Option<u64>,
    pub data_length: u64,
    pub data_sha256_hash: Option<Vec<u8>>,
    pub src_sha256_hash: Option<Vec<u8>>,
}

impl Operation {
    pub fn decode(partition: PartitionKind, op: &InstallOperation) -> Result<Self> {
        let ty = Type::try_from(op.r#type).map_err(|_| Error::UnsupportedType(op.r#type))?;

        Ok(Self {
            partition,
            ty,
            kind: OperationKind::from_type(ty),
            src_extents: partition::parse_extents(&op.src_extents)?,
            src_length: op.src_length,
            dst_extents: partition::parse_extents(&op.dst_extents)?,
            dst_length: op.dst_length,
            data_offset: op.data_offset,
            data_length: op.data_length.unwrap_or(0),
            data_sha256_hash: op.data_sha256_hash.clone(),
            src_sha256_hash: op.src_sha256_hash.clone(),
        })
    }

    /// Whether every destination extent is a hole.
    pub fn all_dst_sparse(&self) -> bool {
        self.dst_extents.iter().all(BlockExtent::is_sparse)
    }
}

fn check_source_hash(op: &Operation, data: &[u8]) -> Result<()> {
    let Some(expected) = &op.src_sha256_hash else {
        return Ok(());
    };

    let actual = digest::digest(&SHA256, data);
    if actual.as_ref() != expected.as_slice() {
        return Err(Error::SourceHashMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }

    Ok(())
}

/// Read all source blocks into an owned buffer. This completes before anything
/// is written, so overlapping source and destination extents are safe.
fn read_source(
    partitions: &Partitions,
    op: &Operation,
    source: SourceKind,
    block_size: u64,
) -> Result<Vec<u8>> {
    let data = partitions.read_extents(op.partition, source, &op.src_extents, block_size)?;
    check_source_hash(op, &data)?;

    Ok(data)
}

/// Apply `op` using its data blob. The caller is responsible for verifying the
/// blob hash before calling this.
pub fn apply_operation(
    partitions: &Partitions,
    block_size: u64,
    op: &Operation,
    data: &[u8],
) -> Result<()> {
    trace!(
        "Applying {:?} to {} with {} bytes of data",
        op.ty,
        op.partition,
        data.len(),
    );

    if !matches!(op.kind, OperationKind::Replace(_) | OperationKind::Bsdiff(_))
        && !data.is_empty()
    {
        return Err(Error::UnexpectedData(op.ty, data.len() as u64));
    }

    let target = partitions.target(op.partition);

    match op.kind {
        OperationKind::Replace(format) => {
            let mut writer = ExtentWriter::new(target, &op.dst_extents, block_size)?;
            let capacity = writer.capacity();
            let mut reader = CompressedReader::with_format(data, format);

            io::copy(&mut reader, &mut writer).map_err(|e| {
                if e.kind() == io::ErrorKind::WriteZero {
                    Error::DataTooLarge(op.ty, capacity)
                } else if format == CompressedFormat::None {
                    Error::Partition(e.into())
                } else {
                    Error::Decompress(op.ty, e)
                }
            })?;

            writer.finish()?;
        }
        OperationKind::Zero => {
            let mut writer = ExtentWriter::new(target, &op.dst_extents, block_size)?;
            let capacity = writer.capacity();

            writer
                .write_zeros_exact(capacity)
                .map_err(partition::Error::from)?;
            writer.finish()?;
        }
        OperationKind::Copy(source) => {
            let buf = read_source(partitions, op, source, block_size)?;
            let capacity = partition::extents_byte_len(&op.dst_extents, block_size)?;

            if buf.len() as u64 != capacity {
                return Err(Error::SizeMismatch {
                    what: "Source extents",
                    expected: capacity,
                    actual: buf.len() as u64,
                });
            }

            partitions.write_extents(op.partition, &op.dst_extents, block_size, &buf)?;
        }
        OperationKind::Bsdiff(source) => {
            let mut old = read_source(partitions, op, source, block_size)?;

            if let Some(src_length) = op.src_length {
                if src_length > old.len() as u64 {
                    return Err(Error::SizeMismatch {
                        what: "Source extents",
                        expected: src_length,
                        actual: old.len() as u64,
                    });
                }
                old.truncate(src_length as usize);
            }

            let capacity = partition::extents_byte_len(&op.dst_extents, block_size)?;
            if op.dst_length.is_some_and(|n| n > capacity) {
                return Err(Error::DataTooLarge(op.ty, capacity));
            }
            let limit =
                usize::try_from(capacity).map_err(|_| Error::DataTooLarge(op.ty, capacity))?;

            let mut new = bsdiff::apply(&old, data, limit)?;

            if let Some(dst_length) = op.dst_length
                && new.len() as u64 != dst_length
            {
                return Err(Error::SizeMismatch {
                    what: "Patched data",
                    expected: dst_length,
                    actual: new.len() as u64,
                });
            }

            // The rest of the last block is zero filled.
            new.resize(capacity as usize, 0);

            partitions.write_extents(op.partition, &op.dst_extents, block_size, &new)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        format::compression::CompressedWriter,
        partition::SPARSE_HOLE,
        stream::{MemoryPartition, ReadAt, WriteAt},
    };

    const BLOCK_SIZE: u64 = 4;

    fn memory(data: &[u8]) -> Box<dyn WriteAt> {
        Box::new(MemoryPartition::new(data.to_vec()))
    }

    fn extent(start_block: u64, num_blocks: u64) -> BlockExtent {
        BlockExtent {
            start_block,
            num_blocks,
        }
    }

    fn operation(ty: Type, src: &[BlockExtent], dst: &[BlockExtent]) -> Operation {
        Operation {
            partition: PartitionKind::Rootfs,
            ty,
            kind: OperationKind::from_type(ty),
            src_extents: src.to_vec(),
            src_length: None,
            dst_extents: dst.to_vec(),
            dst_length: None,
            data_offset: None,
            data_length: 0,
            data_sha256_hash: None,
            src_sha256_hash: None,
        }
    }

    fn rootfs(partitions: &Partitions) -> Vec<u8> {
        let target = partitions.target(PartitionKind::Rootfs);
        let mut buf = vec![0u8; 16];
        target.read_exact_at(&mut buf, 0).unwrap();
        buf
    }

    fn compress(data: &[u8], format: CompressedFormat) -> Vec<u8> {
        let mut writer = CompressedWriter::new(Vec::new(), format);
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn replace_formats() {
        for format in [
            CompressedFormat::None,
            CompressedFormat::Bzip2,
            CompressedFormat::Xz,
        ] {
            let ty = match format {
                CompressedFormat::None => Type::Replace,
                CompressedFormat::Bzip2 => Type::ReplaceBz,
                CompressedFormat::Xz => Type::ReplaceXz,
            };
            let partitions = Partitions::new(memory(&[b'.'; 16]), memory(&[]));
            let op = operation(ty, &[], &[extent(2, 1), extent(SPARSE_HOLE, 1), extent(0, 1)]);
            let data = compress(b"aaaaXXXXbbbb", format);

            apply_operation(&partitions, BLOCK_SIZE, &op, &data).unwrap();
            assert_eq!(rootfs(&partitions), b"bbbb....aaaa....");
        }
    }

    #[test]
    fn replace_wrong_length() {
        let partitions = Partitions::new(memory(&[0; 16]), memory(&[]));
        let op = operation(Type::Replace, &[], &[extent(0, 1)]);

        assert_matches!(
            apply_operation(&partitions, BLOCK_SIZE, &op, b"abc"),
            Err(Error::Partition(partition::Error::LengthMismatch {
                expected: 4,
                actual: 3,
            }))
        );
        assert_matches!(
            apply_operation(&partitions, BLOCK_SIZE, &op, b"abcde"),
            Err(Error::DataTooLarge(Type::Replace, 4))
        );

        let op = operation(Type::ReplaceXz, &[], &[extent(0, 1)]);
        assert_matches!(
            apply_operation(&partitions, BLOCK_SIZE, &op, b"not xz data"),
            Err(Error::Decompress(Type::ReplaceXz, _))
        );
    }

    #[test]
    fn zero_and_discard() {
        for ty in [Type::Zero, Type::Discard] {
            let partitions = Partitions::new(memory(&[b'x'; 16]), memory(&[]));
            let op = operation(ty, &[], &[extent(1, 2)]);

            apply_operation(&partitions, BLOCK_SIZE, &op, &[]).unwrap();
            assert_eq!(rootfs(&partitions), b"xxxx\0\0\0\0\0\0\0\0xxxx");
        }
    }

    #[test]
    fn move_overlapping() {
        let partitions = Partitions::new(memory(b"aaaabbbbccccdddd"), memory(&[]));
        // Shift blocks 0-2 to 1-3. A naive block-by-block copy would smear
        // block 0 across the whole range.
        let op = operation(Type::Move, &[extent(0, 3)], &[extent(1, 3)]);

        apply_operation(&partitions, BLOCK_SIZE, &op, &[]).unwrap();
        assert_eq!(rootfs(&partitions), b"aaaaaaaabbbbcccc");

        assert_matches!(
            apply_operation(&partitions, BLOCK_SIZE, &op, b"data"),
            Err(Error::UnexpectedData(Type::Move, 4))
        );

        let op = operation(Type::Move, &[extent(0, 1)], &[extent(1, 2)]);
        assert_matches!(
            apply_operation(&partitions, BLOCK_SIZE, &op, &[]),
            Err(Error::SizeMismatch { .. })
        );
    }

    #[test]
    fn source_copy() {
        let partitions = Partitions::new(memory(&[0; 16]), memory(&[])).with_sources(
            Box::new(MemoryPartition::new(b"AAAABBBBCCCCDDDD".to_vec())),
            Box::new(MemoryPartition::new(Vec::new())),
        );
        let mut op = operation(Type::SourceCopy, &[extent(3, 1), extent(0, 1)], &[extent(0, 2)]);
        op.src_sha256_hash = Some(digest::digest(&SHA256, b"DDDDAAAA").as_ref().to_vec());

        apply_operation(&partitions, BLOCK_SIZE, &op, &[]).unwrap();
        assert_eq!(rootfs(&partitions), b"DDDDAAAA\0\0\0\0\0\0\0\0");

        op.src_sha256_hash = Some(vec![0u8; 32]);
        assert_matches!(
            apply_operation(&partitions, BLOCK_SIZE, &op, &[]),
            Err(Error::SourceHashMismatch { .. })
        );

        // The target must not be used when a source partition is required.
        let partitions = Partitions::new(memory(&[0; 16]), memory(&[]));
        op.src_sha256_hash = None;
        assert_matches!(
            apply_operation(&partitions, BLOCK_SIZE, &op, &[]),
            Err(Error::Partition(partition::Error::NoSourcePartition(
                PartitionKind::Rootfs
            )))
        );
    }

    #[test]
    fn destination_offset_overflow() {
        let partitions = Partitions::new(memory(&[b'.'; 16]), memory(&[]));

        // Either the start offset or the end of the extent overflows.
        for start_block in [u64::MAX / 2, u64::MAX / 4096] {
            let dst = [extent(0, 1), extent(start_block, 1)];

            let op = operation(Type::Replace, &[], &dst);
            assert_matches!(
                apply_operation(&partitions, 4096, &op, &[b'x'; 8192]),
                Err(Error::Partition(partition::Error::IntegerTooLarge(_)))
            );

            let op = operation(Type::Zero, &[], &dst);
            assert_matches!(
                apply_operation(&partitions, 4096, &op, &[]),
                Err(Error::Partition(partition::Error::IntegerTooLarge(_)))
            );
        }

        // Rejected before the valid first extent was written.
        assert_eq!(rootfs(&partitions), [b'.'; 16]);
    }

    #[test]
    fn bsdiff_output_limit() {
        let partitions = Partitions::new(memory(b"aaaabbbbccccdddd"), memory(&[]));
        let mut patch = bsdiff::MAGIC.to_vec();
        patch.extend_from_slice(&[0; 16]);
        patch.extend_from_slice(&(1u64 << 50).to_le_bytes());

        let op = operation(Type::Bsdiff, &[extent(0, 1)], &[extent(0, 1)]);
        assert_matches!(
            apply_operation(&partitions, BLOCK_SIZE, &op, &patch),
            Err(Error::Bsdiff(bsdiff::Error::OutputTooLarge {
                new_size: 0x4_0000_0000_0000,
                limit: 4,
            }))
        );

        let mut op = operation(Type::Bsdiff, &[extent(0, 1)], &[extent(0, 1)]);
        op.dst_length = Some(5);
        assert_matches!(
            apply_operation(&partitions, BLOCK_SIZE, &op, &patch),
            Err(Error::DataTooLarge(Type::Bsdiff, 4))
        );
    }

    #[test]
    fn unsupported_type() {
        let op = InstallOperation {
            r#type: 100,
            ..Default::default()
        };

        assert_matches!(
            Operation::decode(PartitionKind::Kernel, &op),
            Err(Error::UnsupportedType(100))
        );
    }
}
