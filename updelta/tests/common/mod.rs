// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::{fs, io::Write, path::Path};

use base64::{Engine, engine::general_purpose::STANDARD};
use pkcs8::DecodePrivateKey;
use prost::Message;
use ring::digest::{self, SHA256};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, traits::PublicKeyParts};
use sha2::Sha256;
use tempfile::TempDir;
use updelta::{
    format::{
        bsdiff,
        compression::{CompressedFormat, CompressedWriter},
        payload,
    },
    partition::{PartitionKind, PartitionPaths, SPARSE_HOLE},
    performer::{self, Performer},
    prefs::Prefs,
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, Extent, InstallOperation, PartitionInfo, Signatures,
        install_operation::Type, signatures::Signature,
    },
    verify::KeyRing,
};

pub const BLOCK_SIZE: usize = payload::DEFAULT_BLOCK_SIZE as usize;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut result = [0u8; 32];
    result.copy_from_slice(digest::digest(&SHA256, data).as_ref());
    result
}

/// Deterministic incompressible data.
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);

    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Deterministic, highly compressible data.
pub fn text(seed: u32, len: usize) -> Vec<u8> {
    format!("block {seed} contents. ")
        .bytes()
        .cycle()
        .take(len)
        .collect()
}

pub fn blocks(image: &[u8], start: usize, count: usize) -> &[u8] {
    &image[start * BLOCK_SIZE..(start + count) * BLOCK_SIZE]
}

pub fn compress(data: &[u8], format: CompressedFormat) -> Vec<u8> {
    let mut writer = CompressedWriter::new(Vec::new(), format);
    writer.write_all(data).unwrap();
    writer.finish().unwrap()
}

fn encode_offtin(value: i64) -> [u8; 8] {
    let mut buf = value.unsigned_abs().to_le_bytes();
    if value < 0 {
        buf[7] |= 0x80;
    }
    buf
}

/// Build a BSDIFF40 patch that turns `old` into `new`. The patch adds a byte
/// difference over the common prefix and inserts the rest of `new` verbatim.
pub fn bsdiff_patch(old: &[u8], new: &[u8]) -> Vec<u8> {
    let add_len = old.len().min(new.len());
    let diff = new[..add_len]
        .iter()
        .zip(old)
        .map(|(n, o)| n.wrapping_sub(*o))
        .collect::<Vec<_>>();
    let extra = &new[add_len..];

    let mut ctrl = vec![];
    ctrl.extend_from_slice(&encode_offtin(add_len as i64));
    ctrl.extend_from_slice(&encode_offtin(extra.len() as i64));
    ctrl.extend_from_slice(&encode_offtin(0));

    let ctrl = compress(&ctrl, CompressedFormat::Bzip2);
    let diff = compress(&diff, CompressedFormat::Bzip2);
    let extra = compress(extra, CompressedFormat::Bzip2);

    let mut patch = bsdiff::MAGIC.to_vec();
    patch.extend_from_slice(&encode_offtin(ctrl.len() as i64));
    patch.extend_from_slice(&encode_offtin(diff.len() as i64));
    patch.extend_from_slice(&encode_offtin(new.len() as i64));
    patch.extend_from_slice(&ctrl);
    patch.extend_from_slice(&diff);
    patch.extend_from_slice(&extra);
    patch
}

pub fn load_private_key(name: &str) -> RsaPrivateKey {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name);
    let data = fs::read_to_string(path).unwrap();
    RsaPrivateKey::from_pkcs8_pem(&data).unwrap()
}

pub fn key_ring(keys: &[(u32, &RsaPrivateKey)], expected_version: u32) -> KeyRing {
    let mut key_ring = KeyRing::new(expected_version);
    for (version, key) in keys {
        key_ring.insert(*version, key.to_public_key());
    }
    key_ring
}

fn sign(key: &RsaPrivateKey, digest: &[u8]) -> Vec<u8> {
    key.sign(Pkcs1v15Sign::new::<Sha256>(), digest).unwrap()
}

fn signatures(keys: &[(u32, &RsaPrivateKey)], digest: Option<&[u8]>) -> Signatures {
    Signatures {
        signatures: keys
            .iter()
            .map(|(version, key)| {
                let data = match digest {
                    Some(d) => sign(key, d),
                    None => vec![0u8; key.size()],
                };

                Signature {
                    version: Some(*version),
                    unpadded_signature_size: Some(data.len() as u32),
                    data: Some(data),
                }
            })
            .collect(),
    }
}

fn extents(ranges: &[(u64, u64)]) -> Vec<Extent> {
    ranges
        .iter()
        .map(|(start_block, num_blocks)| Extent {
            start_block: Some(*start_block),
            num_blocks: Some(*num_blocks),
        })
        .collect()
}

pub struct BuildOptions<'a> {
    pub major_version: u64,
    /// Keys for the payload signatures block.
    pub payload_keys: Vec<(u32, &'a RsaPrivateKey)>,
    /// Carry the signatures block in a kernel operation with a sparse
    /// destination instead of after the last operation.
    pub legacy_signature_op: bool,
    /// Key for the inline metadata signature. Only used for version 2.
    pub inline_metadata_key: Option<&'a RsaPrivateKey>,
    /// Do not record data hashes in operations.
    pub omit_hashes: bool,
}

impl<'a> BuildOptions<'a> {
    pub fn new(major_version: u64) -> Self {
        Self {
            major_version,
            payload_keys: vec![],
            legacy_signature_op: false,
            inline_metadata_key: None,
            omit_hashes: false,
        }
    }

    pub fn signed(major_version: u64, key: &'a RsaPrivateKey) -> Self {
        Self {
            payload_keys: vec![(1, key)],
            ..Self::new(major_version)
        }
    }
}

pub struct PayloadBuilder<'a> {
    pub manifest: DeltaArchiveManifest,
    options: BuildOptions<'a>,
    blobs: Vec<u8>,
}

impl<'a> PayloadBuilder<'a> {
    pub fn new(minor_version: u32, options: BuildOptions<'a>) -> Self {
        Self {
            manifest: DeltaArchiveManifest {
                block_size: Some(BLOCK_SIZE as u32),
                minor_version: Some(minor_version),
                ..Default::default()
            },
            options,
            blobs: vec![],
        }
    }

    pub fn set_old_info(&mut self, kind: PartitionKind, image: &[u8]) {
        let info = Some(PartitionInfo {
            size: Some(image.len() as u64),
            hash: Some(sha256(image).to_vec()),
        });

        match kind {
            PartitionKind::Rootfs => self.manifest.old_rootfs_info = info,
            PartitionKind::Kernel => self.manifest.old_kernel_info = info,
        }
    }

    pub fn set_new_info(&mut self, kind: PartitionKind, image: &[u8]) {
        let info = Some(PartitionInfo {
            size: Some(image.len() as u64),
            hash: Some(sha256(image).to_vec()),
        });

        match kind {
            PartitionKind::Rootfs => self.manifest.new_rootfs_info = info,
            PartitionKind::Kernel => self.manifest.new_kernel_info = info,
        }
    }

    fn operations_mut(&mut self, kind: PartitionKind) -> &mut Vec<InstallOperation> {
        match kind {
            PartitionKind::Rootfs => &mut self.manifest.install_operations,
            PartitionKind::Kernel => &mut self.manifest.kernel_install_operations,
        }
    }

    pub fn add_operation(
        &mut self,
        kind: PartitionKind,
        ty: Type,
        src: &[(u64, u64)],
        dst: &[(u64, u64)],
        data: &[u8],
    ) -> &mut InstallOperation {
        let mut op = InstallOperation {
            r#type: ty.into(),
            src_extents: extents(src),
            dst_extents: extents(dst),
            ..Default::default()
        };

        if !data.is_empty() {
            op.data_offset = Some(self.blobs.len() as u64);
            op.data_length = Some(data.len() as u64);
            if !self.options.omit_hashes {
                op.data_sha256_hash = Some(sha256(data).to_vec());
            }
            self.blobs.extend_from_slice(data);
        }

        let ops = self.operations_mut(kind);
        ops.push(op);
        ops.last_mut().unwrap()
    }

    pub fn build(mut self) -> Payload {
        let payload_keys = self.options.payload_keys.clone();

        let signatures_size = if payload_keys.is_empty() {
            None
        } else {
            let size = signatures(&payload_keys, None).encoded_len() as u64;
            let offset = self.blobs.len() as u64;

            self.manifest.signatures_offset = Some(offset);
            self.manifest.signatures_size = Some(size);

            if self.options.legacy_signature_op {
                self.manifest.kernel_install_operations.push(InstallOperation {
                    r#type: Type::Replace.into(),
                    data_offset: Some(offset),
                    data_length: Some(size),
                    dst_extents: extents(&[(SPARSE_HOLE, 1)]),
                    ..Default::default()
                });
            }

            Some(size)
        };

        let manifest_raw = self.manifest.encode_to_vec();
        let is_v2 = self.options.major_version >= payload::MAJOR_VERSION_V2;
        let inline_key = self.options.inline_metadata_key.filter(|_| is_v2);
        let metadata_signature_size = inline_key
            .map(|k| signatures(&[(1, k)], None).encoded_len())
            .unwrap_or(0);

        let mut data = payload::MAGIC.to_vec();
        data.extend_from_slice(&self.options.major_version.to_be_bytes());
        data.extend_from_slice(&(manifest_raw.len() as u64).to_be_bytes());
        if is_v2 {
            data.extend_from_slice(&(metadata_signature_size as u32).to_be_bytes());
        }
        data.extend_from_slice(&manifest_raw);

        let metadata_size = data.len() as u64;
        let metadata_digest = sha256(&data);

        if let Some(key) = inline_key {
            let raw = signatures(&[(1, key)], Some(&metadata_digest)).encode_to_vec();
            assert_eq!(raw.len(), metadata_signature_size);
            data.extend_from_slice(&raw);
        }

        let blob_offset = data.len() as u64;

        let mut signed = data[..metadata_size as usize].to_vec();
        signed.extend_from_slice(&self.blobs);
        let signed_digest = sha256(&signed);

        data.extend_from_slice(&self.blobs);

        if let Some(size) = signatures_size {
            let raw = signatures(&payload_keys, Some(&signed_digest)).encode_to_vec();
            assert_eq!(raw.len() as u64, size);
            data.extend_from_slice(&raw);
        }

        Payload {
            data,
            metadata_size,
            blob_offset,
            manifest: self.manifest,
        }
    }
}

pub struct Payload {
    pub data: Vec<u8>,
    pub metadata_size: u64,
    pub blob_offset: u64,
    pub manifest: DeltaArchiveManifest,
}

impl Payload {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn hash(&self) -> [u8; 32] {
        sha256(&self.data)
    }

    /// Base64-encoded raw signature of the metadata, as passed out-of-band in
    /// the install plan.
    pub fn metadata_signature(&self, key: &RsaPrivateKey) -> String {
        let digest = sha256(&self.data[..self.metadata_size as usize]);
        STANDARD.encode(sign(key, &digest))
    }
}

/// Scratch partition images in a temporary directory.
pub struct Target {
    pub dir: TempDir,
    pub paths: PartitionPaths,
}

impl Target {
    pub fn new(rootfs: &[u8], kernel: &[u8]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = PartitionPaths {
            rootfs: dir.path().join("rootfs.img"),
            kernel: dir.path().join("kernel.img"),
            rootfs_source: None,
            kernel_source: None,
        };

        fs::write(&paths.rootfs, rootfs).unwrap();
        fs::write(&paths.kernel, kernel).unwrap();

        Self { dir, paths }
    }

    pub fn with_sources(mut self, rootfs: &[u8], kernel: &[u8]) -> Self {
        let rootfs_source = self.dir.path().join("rootfs_source.img");
        let kernel_source = self.dir.path().join("kernel_source.img");

        fs::write(&rootfs_source, rootfs).unwrap();
        fs::write(&kernel_source, kernel).unwrap();

        self.paths.rootfs_source = Some(rootfs_source);
        self.paths.kernel_source = Some(kernel_source);
        self
    }

    pub fn read(&self, kind: PartitionKind) -> Vec<u8> {
        fs::read(self.paths.target(kind)).unwrap()
    }
}

/// Feed `data` to the performer `chunk_size` bytes at a time.
pub fn feed<P: Prefs>(
    performer: &mut Performer<P>,
    data: &[u8],
    chunk_size: usize,
) -> Result<(), performer::Error> {
    for chunk in data.chunks(chunk_size) {
        performer.write(chunk)?;
    }

    Ok(())
}
