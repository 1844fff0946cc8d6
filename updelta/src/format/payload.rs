// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io::Read, mem};

use prost::Message;
use thiserror::Error;
use zerocopy::{FromBytes, byteorder::big_endian};
use zerocopy_derive::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::{
    partition::PartitionKind,
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, InstallOperation, PartitionInfo, Signatures,
        install_operation::Type,
    },
    stream::{FromReader, ReadFixedSizeExt},
};

pub const MAGIC: &[u8; 4] = b"CrAU";

pub const MAJOR_VERSION_V1: u64 = 1;
pub const MAJOR_VERSION_V2: u64 = 2;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Full payloads only contain operations that do not read old data.
pub const MINOR_VERSION_FULL: u32 = 0;
/// Delta payloads that read from the partition being written.
pub const MINOR_VERSION_IN_PLACE: u32 = 1;
/// Delta payloads that read from a separate source partition.
pub const MINOR_VERSION_SOURCE: u32 = 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Failed to decode {0}")]
    Protobuf(&'static str, #[source] prost::DecodeError),
    #[error("Failed to read payload {0}")]
    DataRead(&'static str, #[source] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout of the fields shared by all payload versions.
#[derive(Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`MAGIC`].
    magic: [u8; 4],
    /// Major version.
    version: big_endian::U64,
    /// Size of the serialized [`DeltaArchiveManifest`].
    manifest_size: big_endian::U64,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &self.magic)
            .field("version", &self.version.get())
            .field("manifest_size", &self.manifest_size.get())
            .finish()
    }
}

impl RawHeader {
    fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::UnknownMagic(self.magic));
        }

        let version = self.version.get();
        if version != MAJOR_VERSION_V1 && version != MAJOR_VERSION_V2 {
            return Err(Error::UnsupportedVersion(version));
        }

        Ok(())
    }
}

/// Fixed-size header at the start of a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest_size: u64,
    /// Size of the inline metadata signature. Always 0 for version 1.
    pub metadata_signature_size: u32,
}

impl PayloadHeader {
    /// Size of the header for the given major version.
    pub fn size_for_version(version: u64) -> usize {
        if version >= MAJOR_VERSION_V2 {
            mem::size_of::<RawHeader>() + 4
        } else {
            mem::size_of::<RawHeader>()
        }
    }

    pub fn size(&self) -> u64 {
        Self::size_for_version(self.version) as u64
    }

    /// Size of the header and the manifest. The inline metadata signature is
    /// not included.
    pub fn metadata_size(&self) -> Result<u64> {
        self.size()
            .checked_add(self.manifest_size)
            .ok_or(Error::IntegerTooLarge("manifest_size"))
    }

    /// Offset where the data blobs start.
    pub fn blob_offset(&self) -> Result<u64> {
        self.metadata_size()?
            .checked_add(self.metadata_signature_size.into())
            .ok_or(Error::IntegerTooLarge("metadata_signature_size"))
    }

    /// Try to parse the header from the start of `data`. Returns [`None`] if
    /// more data is needed.
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        let Ok((raw, remain)) = RawHeader::ref_from_prefix(data) else {
            return Ok(None);
        };

        raw.validate()?;

        let version = raw.version.get();
        let metadata_signature_size = if version >= MAJOR_VERSION_V2 {
            let Ok((size, _)) = big_endian::U32::ref_from_prefix(remain) else {
                return Ok(None);
            };
            size.get()
        } else {
            0
        };

        Ok(Some(Self {
            version,
            manifest_size: raw.manifest_size.get(),
            metadata_signature_size,
        }))
    }
}

/// Everything in a payload before the data blobs.
#[derive(Clone, Debug)]
pub struct PayloadMetadata {
    pub header: PayloadHeader,
    pub manifest: DeltaArchiveManifest,
    pub metadata_signature: Option<Signatures>,
}

impl<R: Read> FromReader<R> for PayloadMetadata {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut data = reader
            .read_vec_exact(mem::size_of::<RawHeader>())
            .map_err(|e| Error::DataRead("header", e))?;

        // Version 2 headers have an extra field after the common fields.
        let header = loop {
            if let Some(h) = PayloadHeader::parse(&data)? {
                break h;
            }

            let [b] = reader
                .read_array_exact::<1>()
                .map_err(|e| Error::DataRead("header", e))?;
            data.push(b);
        };

        let manifest_size = usize::try_from(header.manifest_size)
            .map_err(|_| Error::IntegerTooLarge("manifest_size"))?;
        let manifest_raw = reader
            .read_vec_exact(manifest_size)
            .map_err(|e| Error::DataRead("manifest", e))?;
        let manifest = decode_manifest(&manifest_raw)?;

        let metadata_signature = if header.metadata_signature_size > 0 {
            let raw = reader
                .read_vec_exact(header.metadata_signature_size as usize)
                .map_err(|e| Error::DataRead("metadata signature", e))?;
            Some(decode_signatures(&raw)?)
        } else {
            None
        };

        Ok(Self {
            header,
            manifest,
            metadata_signature,
        })
    }
}

pub fn decode_manifest(data: &[u8]) -> Result<DeltaArchiveManifest> {
    DeltaArchiveManifest::decode(data).map_err(|e| Error::Protobuf("manifest", e))
}

pub fn decode_signatures(data: &[u8]) -> Result<Signatures> {
    Signatures::decode(data).map_err(|e| Error::Protobuf("signatures", e))
}

/// Whether the payload writes complete images without reading old data.
pub fn is_full_payload(manifest: &DeltaArchiveManifest) -> bool {
    manifest.old_kernel_info.is_none() && manifest.old_rootfs_info.is_none()
}

pub fn block_size(manifest: &DeltaArchiveManifest) -> u64 {
    manifest.block_size.unwrap_or(DEFAULT_BLOCK_SIZE).into()
}

pub fn old_partition_info(
    manifest: &DeltaArchiveManifest,
    kind: PartitionKind,
) -> Option<&PartitionInfo> {
    match kind {
        PartitionKind::Rootfs => manifest.old_rootfs_info.as_ref(),
        PartitionKind::Kernel => manifest.old_kernel_info.as_ref(),
    }
}

pub fn new_partition_info(
    manifest: &DeltaArchiveManifest,
    kind: PartitionKind,
) -> Option<&PartitionInfo> {
    match kind {
        PartitionKind::Rootfs => manifest.new_rootfs_info.as_ref(),
        PartitionKind::Kernel => manifest.new_kernel_info.as_ref(),
    }
}

pub fn partition_operations(
    manifest: &DeltaArchiveManifest,
    kind: PartitionKind,
) -> &[InstallOperation] {
    match kind {
        PartitionKind::Rootfs => &manifest.install_operations,
        PartitionKind::Kernel => &manifest.kernel_install_operations,
    }
}

/// Iterate over all operations in the order they are applied.
pub fn operations(
    manifest: &DeltaArchiveManifest,
) -> impl Iterator<Item = (PartitionKind, &InstallOperation)> {
    PartitionKind::ALL.into_iter().flat_map(move |kind| {
        partition_operations(manifest, kind)
            .iter()
            .map(move |op| (kind, op))
    })
}

/// Operation types that may appear in a payload with the given minor version.
pub fn allowed_operations(minor_version: u32) -> &'static [Type] {
    const FULL: &[Type] = &[
        Type::Replace,
        Type::ReplaceBz,
        Type::ReplaceXz,
        Type::Zero,
        Type::Discard,
    ];
    const IN_PLACE: &[Type] = &[
        Type::Replace,
        Type::ReplaceBz,
        Type::ReplaceXz,
        Type::Zero,
        Type::Discard,
        Type::Move,
        Type::Bsdiff,
    ];
    const SOURCE: &[Type] = &[
        Type::Replace,
        Type::ReplaceBz,
        Type::ReplaceXz,
        Type::Zero,
        Type::Discard,
        Type::SourceCopy,
        Type::SourceBsdiff,
    ];

    match minor_version {
        MINOR_VERSION_FULL => FULL,
        MINOR_VERSION_IN_PLACE => IN_PLACE,
        MINOR_VERSION_SOURCE => SOURCE,
        _ => &[],
    }
}
