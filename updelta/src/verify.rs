// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Whole-payload hashing and signature verification with key rotation.

use std::collections::BTreeMap;

use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::debug;

use crate::{
    crypto::{self, RsaPublicKeyExt},
    hash::Sha256Context,
    protobuf::chromeos_update_engine::{Signatures, signatures::Signature},
};

/// Maximum number of entries in a signatures block. Two key generations can
/// be present during a key rotation.
pub const MAX_SIGNATURES: usize = 2;

/// Key version assumed for signature entries that do not specify one.
pub const DEFAULT_KEY_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signatures block is empty")]
    NoSignatures,
    #[error("Signatures block has {0} entries, but at most {MAX_SIGNATURES} are allowed")]
    TooManySignatures(usize),
    #[error("No signature for key version {0}")]
    NoMatchingVersion(u32),
    #[error("No public key registered for key version {0}")]
    MissingKey(u32),
    #[error("Signature entry for key version {0} has no data")]
    MissingData(u32),
    #[error("Unpadded signature size ({size}) exceeds signature data size ({data_size})")]
    InvalidUnpaddedSize { size: u32, data_size: usize },
    #[error("Signature for key version {0} does not match")]
    Verify(u32, #[source] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Public keys indexed by key version, plus the version that the caller
/// requires a valid signature for.
#[derive(Clone, Debug)]
pub struct KeyRing {
    keys: BTreeMap<u32, RsaPublicKey>,
    expected_version: u32,
}

impl KeyRing {
    pub fn new(expected_version: u32) -> Self {
        Self {
            keys: BTreeMap::new(),
            expected_version,
        }
    }

    /// Key ring with a single key at the default version.
    pub fn single(key: RsaPublicKey) -> Self {
        let mut result = Self::new(DEFAULT_KEY_VERSION);
        result.insert(DEFAULT_KEY_VERSION, key);
        result
    }

    pub fn insert(&mut self, version: u32, key: RsaPublicKey) -> Option<RsaPublicKey> {
        self.keys.insert(version, key)
    }

    pub fn expected_version(&self) -> u32 {
        self.expected_version
    }

    pub fn set_expected_version(&mut self, version: u32) {
        self.expected_version = version;
    }

    fn key(&self, version: u32) -> Result<&RsaPublicKey> {
        self.keys.get(&version).ok_or(Error::MissingKey(version))
    }

    /// Verify a raw signature of `digest` with the expected key.
    pub fn verify_raw(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        let version = self.expected_version;

        self.key(version)?
            .verify_sig(digest, signature)
            .map_err(|e| Error::Verify(version, e))
    }

    /// Verify `digest` against the signatures block. Only the entry for the
    /// expected key version must verify. Entries for other versions are
    /// ignored.
    pub fn verify_signatures(&self, digest: &[u8], signatures: &Signatures) -> Result<()> {
        let entries = &signatures.signatures;
        if entries.is_empty() {
            return Err(Error::NoSignatures);
        } else if entries.len() > MAX_SIGNATURES {
            return Err(Error::TooManySignatures(entries.len()));
        }

        let version = self.expected_version;

        let signature = entries
            .iter()
            .find(|s| s.version.unwrap_or(DEFAULT_KEY_VERSION) == version)
            .ok_or(Error::NoMatchingVersion(version))?;

        self.verify_raw(digest, unpadded_signature(signature, version)?)?;

        debug!("Verified signature for key version {version}");

        Ok(())
    }
}

fn unpadded_signature(signature: &Signature, version: u32) -> Result<&[u8]> {
    let data = signature
        .data
        .as_deref()
        .ok_or(Error::MissingData(version))?;

    match signature.unpadded_signature_size {
        Some(size) if size as usize > data.len() => Err(Error::InvalidUnpaddedSize {
            size,
            data_size: data.len(),
        }),
        Some(size) => Ok(&data[..size as usize]),
        None => Ok(data),
    }
}

/// The two running hashes over a payload. `full` covers every byte. `signed`
/// covers only the bytes protected by the payload signature.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayloadHashers {
    pub full: Sha256Context,
    pub signed: Sha256Context,
}

impl PayloadHashers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash data that is covered by the payload signature.
    pub fn update(&mut self, data: &[u8]) {
        self.full.update(data);
        self.signed.update(data);
    }

    /// Hash data that is part of the payload, but not covered by the payload
    /// signature.
    pub fn update_unsigned(&mut self, data: &[u8]) {
        self.full.update(data);
    }
}
