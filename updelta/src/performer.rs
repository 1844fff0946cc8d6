// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Streaming payload application.
//!
//! The [`Performer`] accepts payload bytes in chunks of any size. It buffers
//! until the next structural unit (header, manifest, operation data blob,
//! signatures block) is complete and then acts on it. After every operation,
//! the partitions are flushed and a checkpoint is written to the preference
//! store so that an interrupted update can be resumed by feeding the same
//! payload again from the start.

use ring::digest::{self, SHA256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    apply::{self, Operation},
    format::payload::{self, MINOR_VERSION_FULL, PayloadHeader},
    partition::{self, PartitionKind, PartitionPaths, Partitions},
    plan::{self, InstallPlan},
    prefs::Prefs,
    progress::{self, ResumeState},
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, Signatures, install_operation::Type,
    },
    verify::{self, KeyRing, PayloadHashers},
};

/// Flat classification of [`Error`] for callers that only need to know what
/// kind of failure occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidState,
    MalformedPayload,
    UnsupportedMajorVersion,
    UnsupportedMinorVersion,
    UnsupportedOperation,
    InvalidMetadataSize,
    MetadataSignatureMissing,
    MetadataSignatureMismatch,
    SourcePartitionMismatch,
    OperationHashMismatch,
    OperationHashMissing,
    OperationExecutionError,
    SignatureMissing,
    PubKeyVerificationFailed,
    PayloadHashMismatch,
    PayloadSizeMismatch,
    StorageIo,
    ResumeInconsistent,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Partitions are not open")]
    NotOpen,
    #[error("Partitions are already open")]
    AlreadyOpen,
    #[error("Payload has not been completely applied")]
    Incomplete,
    #[error("Refusing to continue after earlier failure: {0:?}")]
    PreviousFailure(ErrorCode),
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Failed to parse payload")]
    Payload(#[from] payload::Error),
    #[error("Payload minor version {actual} is not supported (expected {expected})")]
    UnsupportedMinorVersion { actual: u32, expected: u32 },
    #[error("Operation #{index} ({ty:?}) is not allowed in minor version {minor_version}")]
    UnsupportedOperation {
        index: usize,
        ty: Type,
        minor_version: u32,
    },
    #[error("Invalid operation #{0}")]
    InvalidOperation(usize, #[source] apply::Error),
    #[error("Metadata size is {actual}, but expected {expected}")]
    MetadataSizeMismatch { expected: u64, actual: u64 },
    #[error("Metadata signature is required, but missing")]
    MetadataSignatureMissing,
    #[error("Metadata signature is not valid base64")]
    MetadataSignatureEncoding(#[source] base64::DecodeError),
    #[error("Metadata signature does not match")]
    MetadataSignatureMismatch(#[source] verify::Error),
    #[error("Source {kind} hash is {actual}, but expected {expected}")]
    SourceHashMismatch {
        kind: PartitionKind,
        expected: String,
        actual: String,
    },
    #[error("Operation #{index} data hash is {actual}, but expected {expected}")]
    OperationHashMismatch {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("Operation #{0} has data, but no data hash")]
    OperationHashMissing(usize),
    #[error("Failed to apply operation #{0}")]
    Apply(usize, #[source] apply::Error),
    #[error("Payload signature is required, but missing")]
    SignatureMissing,
    #[error("Failed to parse payload signatures")]
    SignatureDecode(#[source] payload::Error),
    #[error("Payload signature verification failed")]
    SignatureVerification(#[source] verify::Error),
    #[error("Payload hash is {actual}, but expected {expected}")]
    PayloadHashMismatch { expected: String, actual: String },
    #[error("Payload size is {actual}, but expected {expected}")]
    PayloadSizeMismatch { expected: u64, actual: u64 },
    #[error("Partition I/O error")]
    Storage(#[source] partition::Error),
    #[error("Resume state is inconsistent with payload: {0}")]
    ResumeInconsistent(String),
    #[error("Failed to access update progress")]
    Progress(#[from] progress::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotOpen | Self::AlreadyOpen | Self::Incomplete => ErrorCode::InvalidState,
            Self::PreviousFailure(code) => *code,
            Self::Malformed(_) => ErrorCode::MalformedPayload,
            Self::Payload(payload::Error::UnsupportedVersion(_)) => {
                ErrorCode::UnsupportedMajorVersion
            }
            Self::Payload(_) => ErrorCode::MalformedPayload,
            Self::UnsupportedMinorVersion { .. } => ErrorCode::UnsupportedMinorVersion,
            Self::UnsupportedOperation { .. } => ErrorCode::UnsupportedOperation,
            Self::InvalidOperation(_, apply::Error::UnsupportedType(_)) => {
                ErrorCode::UnsupportedOperation
            }
            Self::InvalidOperation(_, _) => ErrorCode::MalformedPayload,
            Self::MetadataSizeMismatch { .. } => ErrorCode::InvalidMetadataSize,
            Self::MetadataSignatureMissing => ErrorCode::MetadataSignatureMissing,
            Self::MetadataSignatureEncoding(_) | Self::MetadataSignatureMismatch(_) => {
                ErrorCode::MetadataSignatureMismatch
            }
            Self::SourceHashMismatch { .. } => ErrorCode::SourcePartitionMismatch,
            Self::OperationHashMismatch { .. } => ErrorCode::OperationHashMismatch,
            Self::OperationHashMissing(_) => ErrorCode::OperationHashMissing,
            Self::Apply(_, e) => match e {
                apply::Error::SourceHashMismatch { .. } => ErrorCode::SourcePartitionMismatch,
                apply::Error::UnsupportedType(_) => ErrorCode::UnsupportedOperation,
                apply::Error::Partition(partition::Error::Io(_) | partition::Error::Open(..)) => {
                    ErrorCode::StorageIo
                }
                _ => ErrorCode::OperationExecutionError,
            },
            Self::SignatureMissing => ErrorCode::SignatureMissing,
            Self::SignatureDecode(_) | Self::SignatureVerification(_) => {
                ErrorCode::PubKeyVerificationFailed
            }
            Self::PayloadHashMismatch { .. } => ErrorCode::PayloadHashMismatch,
            Self::PayloadSizeMismatch { .. } => ErrorCode::PayloadSizeMismatch,
            Self::Storage(_) => ErrorCode::StorageIo,
            Self::ResumeInconsistent(_) => ErrorCode::ResumeInconsistent,
            Self::Progress(progress::Error::Prefs(_)) => ErrorCode::StorageIo,
            Self::Progress(_) => ErrorCode::ResumeInconsistent,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Size and hash of a partition image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionSummary {
    pub size: u64,
    pub hash: Vec<u8>,
}

/// Expected contents of both partitions after the update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPartitionInfo {
    pub kernel: PartitionSummary,
    pub rootfs: PartitionSummary,
}

impl NewPartitionInfo {
    pub fn get(&self, kind: PartitionKind) -> &PartitionSummary {
        match kind {
            PartitionKind::Rootfs => &self.rootfs,
            PartitionKind::Kernel => &self.kernel,
        }
    }
}

/// Everything derived from the payload metadata.
#[derive(Debug)]
struct Metadata {
    manifest: DeltaArchiveManifest,
    block_size: u64,
    operations: Vec<Operation>,
}

impl Metadata {
    /// Whether `op` is the legacy operation that carries the signatures block
    /// instead of writing to a partition.
    fn is_signature_operation(&self, op: &Operation) -> bool {
        op.ty == Type::Replace
            && op.data_offset.is_some()
            && op.data_offset == self.manifest.signatures_offset
            && op.all_dst_sparse()
    }
}

fn hash_mismatch_hex(expected: &[u8], actual: &[u8]) -> (String, String) {
    (hex::encode(expected), hex::encode(actual))
}

fn check_operation_hash(
    index: usize,
    op: &Operation,
    data: &[u8],
    hash_checks_mandatory: bool,
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    let Some(expected) = &op.data_sha256_hash else {
        if hash_checks_mandatory {
            return Err(Error::OperationHashMissing(index));
        }

        warn!("Operation #{index} has no data hash; skipping verification");
        return Ok(());
    };

    let actual = digest::digest(&SHA256, data);
    if actual.as_ref() != expected.as_slice() {
        let (expected, actual) = hash_mismatch_hex(expected, actual.as_ref());
        return Err(Error::OperationHashMismatch {
            index,
            expected,
            actual,
        });
    }

    Ok(())
}

/// Applies a payload to the kernel and rootfs partitions.
pub struct Performer<P: Prefs> {
    prefs: P,
    plan: InstallPlan,
    key_ring: Option<KeyRing>,
    partitions: Option<Partitions>,
    minor_version: u32,
    /// Payload bytes that have not been consumed yet.
    buffer: Vec<u8>,
    /// Payload offset of the first byte in `buffer`.
    buffer_offset: u64,
    header: Option<PayloadHeader>,
    metadata: Option<Metadata>,
    /// Payload bytes before this offset were applied by an earlier run and are
    /// discarded without being hashed.
    skip_until: u64,
    next_operation: usize,
    /// Offset of the next data blob relative to the start of the blob section.
    blob_cursor: u64,
    hashers: PayloadHashers,
    signature_blob: Option<Vec<u8>>,
    resume: Option<ResumeState>,
    resume_metadata_size: Option<u64>,
    failure: Option<ErrorCode>,
    complete: bool,
}

impl<P: Prefs> Performer<P> {
    /// Create a new performer. Any update progress in `prefs` is loaded now
    /// and is used once the payload metadata has been parsed. If `key_ring` is
    /// [`None`], no signatures are checked.
    pub fn new(prefs: P, plan: InstallPlan, key_ring: Option<KeyRing>) -> Result<Self> {
        let resume = progress::load(&prefs)?;
        let resume_metadata_size = progress::load_metadata_size(&prefs)?;

        if let Some(state) = &resume {
            if resume_metadata_size.is_none() {
                return Err(Error::ResumeInconsistent(
                    "metadata size was not recorded".to_owned(),
                ));
            }

            info!(
                "Resuming update at operation #{} (data offset {})",
                state.next_operation, state.next_data_offset,
            );
        }

        Ok(Self {
            prefs,
            minor_version: plan.minor_version,
            plan,
            key_ring,
            partitions: None,
            buffer: Vec::new(),
            buffer_offset: 0,
            header: None,
            metadata: None,
            skip_until: 0,
            next_operation: 0,
            blob_cursor: 0,
            hashers: PayloadHashers::new(),
            signature_blob: None,
            resume,
            resume_metadata_size,
            failure: None,
            complete: false,
        })
    }

    /// Open the partitions at `paths` for writing. `minor_version` is the
    /// delta format that the target supports.
    pub fn open(&mut self, paths: &PartitionPaths, minor_version: u32) -> Result<()> {
        if self.partitions.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let partitions = Partitions::open(paths).map_err(Error::Storage)?;

        self.open_with(partitions, minor_version)
    }

    /// Like [`Self::open`], but with already opened partitions.
    pub fn open_with(&mut self, partitions: Partitions, minor_version: u32) -> Result<()> {
        if self.partitions.is_some() {
            return Err(Error::AlreadyOpen);
        }

        self.partitions = Some(partitions);
        self.minor_version = minor_version;

        Ok(())
    }

    /// Whether this run continues an interrupted update.
    pub fn is_resuming(&self) -> bool {
        self.resume.is_some() || self.skip_until > 0
    }

    /// Whether every operation was applied and the signatures block (if any)
    /// has been consumed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn next_operation(&self) -> usize {
        self.next_operation
    }

    /// Total number of operations, once the manifest has been parsed.
    pub fn operation_count(&self) -> Option<usize> {
        self.metadata.as_ref().map(|m| m.operations.len())
    }

    pub fn manifest(&self) -> Option<&DeltaArchiveManifest> {
        self.metadata.as_ref().map(|m| &m.manifest)
    }

    /// Feed the next chunk of payload bytes. After a failure, every later call
    /// fails with the original error code and no more data is written.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Some(code) = self.failure {
            return Err(Error::PreviousFailure(code));
        } else if self.partitions.is_none() {
            return Err(Error::NotOpen);
        }

        self.buffer.extend_from_slice(data);

        let result = self.process();
        if let Err(e) = &result {
            self.failure = Some(e.code());
        }

        result
    }

    fn process(&mut self) -> Result<()> {
        loop {
            let progressed = if self.metadata.is_none() {
                self.parse_metadata()?
            } else if self.buffer_offset < self.skip_until {
                self.skip_applied()
            } else if self.next_operation < self.operation_count().unwrap_or(0) {
                self.perform_next_operation()?
            } else if !self.complete {
                self.consume_signatures()?
            } else if !self.buffer.is_empty() {
                return Err(Error::Malformed(format!(
                    "{} bytes of trailing data after payload",
                    self.buffer.len(),
                )));
            } else {
                false
            };

            if !progressed {
                return Ok(());
            }
        }
    }

    fn consume(&mut self, len: usize) {
        self.buffer.drain(..len);
        self.buffer_offset += len as u64;
    }

    fn check_header(&self, header: &PayloadHeader) -> Result<()> {
        let metadata_size = header.metadata_size()?;

        if let Some(expected) = self.plan.metadata_size
            && expected != metadata_size
        {
            if self.plan.hash_checks_mandatory {
                return Err(Error::MetadataSizeMismatch {
                    expected,
                    actual: metadata_size,
                });
            }

            warn!("Metadata size is {metadata_size}, but expected {expected}; continuing");
        }

        if self.resume.is_some() && self.resume_metadata_size != Some(metadata_size) {
            return Err(Error::ResumeInconsistent(format!(
                "metadata size is {metadata_size}, but interrupted update had {:?}",
                self.resume_metadata_size,
            )));
        }

        Ok(())
    }

    fn verify_metadata_signature(
        &self,
        metadata: &[u8],
        inline_signature: Option<&Signatures>,
    ) -> Result<()> {
        let Some(key_ring) = &self.key_ring else {
            debug!("No public keys configured; skipping metadata signature check");
            return Ok(());
        };

        let digest = digest::digest(&SHA256, metadata);

        let signature = self
            .plan
            .metadata_signature_bytes()
            .map_err(|e| match e {
                plan::Error::MetadataSignature(e) => Error::MetadataSignatureEncoding(e),
                e => Error::Malformed(e.to_string()),
            })?;

        if let Some(signature) = signature {
            key_ring
                .verify_raw(digest.as_ref(), &signature)
                .map_err(Error::MetadataSignatureMismatch)?;
        } else if let Some(signatures) = inline_signature {
            key_ring
                .verify_signatures(digest.as_ref(), signatures)
                .map_err(Error::MetadataSignatureMismatch)?;
        } else if self.plan.hash_checks_mandatory {
            return Err(Error::MetadataSignatureMissing);
        } else {
            warn!("Metadata signature is missing; continuing without verification");
            return Ok(());
        }

        debug!("Verified metadata signature");

        Ok(())
    }

    fn validate_manifest(&self, manifest: &DeltaArchiveManifest) -> Result<Vec<Operation>> {
        if manifest.block_size == Some(0) {
            return Err(Error::Malformed("block size is 0".to_owned()));
        }

        let minor_version = manifest.minor_version.unwrap_or(MINOR_VERSION_FULL);
        let is_full = payload::is_full_payload(manifest);

        if is_full {
            if minor_version != MINOR_VERSION_FULL {
                return Err(Error::UnsupportedMinorVersion {
                    actual: minor_version,
                    expected: MINOR_VERSION_FULL,
                });
            }
        } else if minor_version == MINOR_VERSION_FULL || minor_version != self.minor_version {
            return Err(Error::UnsupportedMinorVersion {
                actual: minor_version,
                expected: self.minor_version,
            });
        }

        let allowed = payload::allowed_operations(minor_version);

        payload::operations(manifest)
            .enumerate()
            .map(|(index, (kind, raw_op))| {
                let op = Operation::decode(kind, raw_op)
                    .map_err(|e| Error::InvalidOperation(index, e))?;

                if !allowed.contains(&op.ty) {
                    return Err(Error::UnsupportedOperation {
                        index,
                        ty: op.ty,
                        minor_version,
                    });
                }

                Ok(op)
            })
            .collect()
    }

    fn check_source_hashes(&self, manifest: &DeltaArchiveManifest) -> Result<()> {
        if payload::is_full_payload(manifest) {
            return Ok(());
        }

        for kind in PartitionKind::ALL {
            let Some(expected) = self.plan.source_hash(kind) else {
                continue;
            };

            let actual = payload::old_partition_info(manifest, kind)
                .and_then(|info| info.hash.as_deref())
                .unwrap_or_default();

            if actual != expected.0 {
                let (expected, actual) = hash_mismatch_hex(&expected.0, actual);
                return Err(Error::SourceHashMismatch {
                    kind,
                    expected,
                    actual,
                });
            }
        }

        Ok(())
    }

    fn restore(
        &mut self,
        state: ResumeState,
        operation_count: usize,
        blob_offset: u64,
    ) -> Result<()> {
        let next_operation = usize::try_from(state.next_operation)
            .ok()
            .filter(|n| *n <= operation_count)
            .ok_or_else(|| {
                Error::ResumeInconsistent(format!(
                    "next operation #{} exceeds operation count {operation_count}",
                    state.next_operation,
                ))
            })?;

        let skip_until = blob_offset
            .checked_add(state.next_data_offset)
            .ok_or_else(|| Error::ResumeInconsistent("data offset too large".to_owned()))?;

        // The hash context covers exactly the bytes that were consumed.
        if state.hashers.full.total() != skip_until {
            return Err(Error::ResumeInconsistent(format!(
                "hash context covers {} bytes, but resume offset is {skip_until}",
                state.hashers.full.total(),
            )));
        }

        self.next_operation = next_operation;
        self.blob_cursor = state.next_data_offset;
        self.hashers = state.hashers;
        self.signature_blob = state.signature_blob;
        self.skip_until = skip_until;

        info!("Skipping {skip_until} bytes that were already applied");

        Ok(())
    }

    fn parse_metadata(&mut self) -> Result<bool> {
        let header = match self.header {
            Some(h) => h,
            None => {
                let Some(header) = PayloadHeader::parse(&self.buffer)? else {
                    return Ok(false);
                };

                self.check_header(&header)?;
                self.header = Some(header);

                debug!("Parsed payload header: {header:?}");

                header
            }
        };

        let metadata_size = header.metadata_size()?;
        let blob_offset = header.blob_offset()?;

        if (self.buffer.len() as u64) < blob_offset {
            return Ok(false);
        }

        // Both fit in the buffer.
        let metadata_end = metadata_size as usize;
        let blob_start = blob_offset as usize;

        let manifest =
            payload::decode_manifest(&self.buffer[header.size() as usize..metadata_end])?;
        let inline_signature = if blob_start > metadata_end {
            Some(payload::decode_signatures(
                &self.buffer[metadata_end..blob_start],
            )?)
        } else {
            None
        };

        self.verify_metadata_signature(&self.buffer[..metadata_end], inline_signature.as_ref())?;
        let operations = self.validate_manifest(&manifest)?;
        self.check_source_hashes(&manifest)?;

        info!(
            "Payload v{} with {} {} operations (minor version {})",
            header.version,
            operations.len(),
            if payload::is_full_payload(&manifest) {
                "full"
            } else {
                "delta"
            },
            manifest.minor_version.unwrap_or(MINOR_VERSION_FULL),
        );

        match self.resume.take() {
            Some(state) => self.restore(state, operations.len(), blob_offset)?,
            None => {
                self.hashers.update(&self.buffer[..metadata_end]);
                // The inline metadata signature is not covered by the payload
                // signature.
                self.hashers
                    .update_unsigned(&self.buffer[metadata_end..blob_start]);

                progress::store_metadata_size(&mut self.prefs, metadata_size)?;
            }
        }

        self.consume(blob_start);

        self.metadata = Some(Metadata {
            block_size: payload::block_size(&manifest),
            manifest,
            operations,
        });

        Ok(true)
    }

    fn skip_applied(&mut self) -> bool {
        let remain = self.skip_until - self.buffer_offset;
        let n = remain.min(self.buffer.len() as u64) as usize;
        if n == 0 {
            return false;
        }

        self.consume(n);

        true
    }

    fn checkpoint(&mut self) -> Result<()> {
        let state = ResumeState {
            next_operation: self.next_operation as u64,
            next_data_offset: self.blob_cursor,
            next_data_length: 0,
            hashers: self.hashers.clone(),
            signature_blob: self.signature_blob.clone(),
        };

        progress::checkpoint(&mut self.prefs, &state)?;

        Ok(())
    }

    fn perform_next_operation(&mut self) -> Result<bool> {
        let Some(metadata) = &self.metadata else {
            return Ok(false);
        };
        let index = self.next_operation;
        let op = &metadata.operations[index];
        let data_length = op.data_length;

        if data_length > 0 && op.data_offset != Some(self.blob_cursor) {
            return Err(Error::Malformed(format!(
                "operation #{index} data offset is {:?}, but expected {}",
                op.data_offset, self.blob_cursor,
            )));
        }

        if (self.buffer.len() as u64) < data_length {
            return Ok(false);
        }

        let data = &self.buffer[..data_length as usize];

        if metadata.is_signature_operation(op) {
            if let Some(size) = metadata.manifest.signatures_size
                && size != data_length
            {
                return Err(Error::Malformed(format!(
                    "signature operation has {data_length} bytes, but signatures size is {size}",
                )));
            }

            debug!("Operation #{index} carries the signatures block");

            self.signature_blob = Some(data.to_vec());
            self.hashers.update_unsigned(data);
        } else {
            if let Some(signatures_offset) = metadata.manifest.signatures_offset
                && self.blob_cursor + data_length > signatures_offset
            {
                return Err(Error::Malformed(format!(
                    "operation #{index} data overlaps signatures at {signatures_offset}",
                )));
            }

            // Verified before anything touches storage.
            check_operation_hash(index, op, data, self.plan.hash_checks_mandatory)?;

            let partitions = self.partitions.as_ref().ok_or(Error::NotOpen)?;

            debug!(
                "Operation #{index}: {:?} on {} with {data_length} bytes of data",
                op.ty, op.partition,
            );

            apply::apply_operation(partitions, metadata.block_size, op, data)
                .map_err(|e| Error::Apply(index, e))?;
            partitions.flush().map_err(Error::Storage)?;

            self.hashers.update(data);
        }

        self.consume(data_length as usize);
        self.blob_cursor += data_length;
        self.next_operation += 1;

        self.checkpoint()?;

        Ok(true)
    }

    fn consume_signatures(&mut self) -> Result<bool> {
        let Some(metadata) = &self.metadata else {
            return Ok(false);
        };

        let signatures_offset = match metadata.manifest.signatures_offset {
            Some(offset) if self.signature_blob.is_none() => offset,
            _ => {
                info!("All operations have been applied");
                self.complete = true;
                return Ok(true);
            }
        };

        if signatures_offset != self.blob_cursor {
            return Err(Error::Malformed(format!(
                "signatures offset is {signatures_offset}, but data ends at {}",
                self.blob_cursor,
            )));
        }

        let size = match metadata.manifest.signatures_size {
            Some(size) if size > 0 => size,
            _ => return Err(Error::Malformed("signatures size is missing".to_owned())),
        };

        if (self.buffer.len() as u64) < size {
            return Ok(false);
        }

        let blob = self.buffer[..size as usize].to_vec();
        self.hashers.update_unsigned(&blob);
        self.signature_blob = Some(blob);

        self.consume(size as usize);
        self.blob_cursor += size;

        self.checkpoint()?;

        info!("All operations have been applied");
        self.complete = true;

        Ok(true)
    }

    /// Flush and close the partitions. This is safe to call after a failed
    /// [`Self::write`] and more than once.
    pub fn close(&mut self) -> Result<()> {
        let Some(partitions) = self.partitions.take() else {
            return Ok(());
        };

        if !self.buffer.is_empty() {
            warn!("Discarding {} unconsumed payload bytes", self.buffer.len());
        }

        partitions.flush().map_err(Error::Storage)?;

        debug!("Closed partitions");

        Ok(())
    }

    /// Verify the whole payload after all bytes were written. The SHA-256 of
    /// every payload byte must equal `expected_hash` and the number of bytes
    /// must equal `payload_length`. If public keys are configured, the
    /// signatures block must contain a valid signature for the expected key
    /// version.
    pub fn verify_payload(&self, expected_hash: &[u8], payload_length: u64) -> Result<()> {
        if !self.complete {
            return Err(Error::Incomplete);
        }

        let total = self.hashers.full.total();
        if total != payload_length {
            return Err(Error::PayloadSizeMismatch {
                expected: payload_length,
                actual: total,
            });
        }

        let actual = self.hashers.full.finish();
        if actual != expected_hash {
            let (expected, actual) = hash_mismatch_hex(expected_hash, &actual);
            return Err(Error::PayloadHashMismatch { expected, actual });
        }

        let Some(key_ring) = &self.key_ring else {
            info!("No public keys configured; skipping payload signature check");
            return Ok(());
        };

        let Some(blob) = &self.signature_blob else {
            return Err(Error::SignatureMissing);
        };

        let signatures = payload::decode_signatures(blob).map_err(Error::SignatureDecode)?;

        key_ring
            .verify_signatures(&self.hashers.signed.finish(), &signatures)
            .map_err(Error::SignatureVerification)?;

        info!("Payload signature verified");

        Ok(())
    }

    /// Size and hash of both partitions as declared by the manifest. Only
    /// available once the payload has been completely applied.
    pub fn get_new_partition_info(&self) -> Result<NewPartitionInfo> {
        let metadata = match &self.metadata {
            Some(m) if self.complete && self.failure.is_none() => m,
            _ => return Err(Error::Incomplete),
        };

        let summary = |kind: PartitionKind| {
            let info = payload::new_partition_info(&metadata.manifest, kind)
                .ok_or_else(|| Error::Malformed(format!("new {kind} info is missing")))?;

            match (info.size, &info.hash) {
                (Some(size), Some(hash)) => Ok(PartitionSummary {
                    size,
                    hash: hash.clone(),
                }),
                _ => Err(Error::Malformed(format!("new {kind} info is incomplete"))),
            }
        };

        Ok(NewPartitionInfo {
            kernel: summary(PartitionKind::Kernel)?,
            rootfs: summary(PartitionKind::Rootfs)?,
        })
    }

    /// Discard saved progress. With `quick`, only the operation index is
    /// invalidated.
    pub fn reset_progress(&mut self, quick: bool) -> Result<()> {
        progress::reset(&mut self.prefs, quick)?;
        self.resume = None;

        Ok(())
    }

    pub fn into_prefs(self) -> P {
        self.prefs
    }
}
