// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Snapshot and restore of the state needed to resume applying a payload.
//!
//! Checkpoints are written so that a reader never observes an advanced
//! operation index without the matching offsets and hash contexts: the index
//! is invalidated first, every other field is written, and the index is
//! written last.

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    hash::{self, Sha256Context},
    prefs::{self, Prefs},
    verify::PayloadHashers,
};

pub mod keys {
    pub const MANIFEST_METADATA_SIZE: &str = "manifest-metadata-size";
    pub const NEXT_OPERATION: &str = "update-state-next-operation";
    pub const NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";
    pub const NEXT_DATA_LENGTH: &str = "update-state-next-data-length";
    pub const SHA256_CONTEXT: &str = "update-state-sha-256-context";
    pub const SIGNED_SHA256_CONTEXT: &str = "update-state-signed-sha-256-context";
    pub const SIGNATURE_BLOB: &str = "update-state-signature-blob";

    pub const ALL: &[&str] = &[
        MANIFEST_METADATA_SIZE,
        NEXT_OPERATION,
        NEXT_DATA_OFFSET,
        NEXT_DATA_LENGTH,
        SHA256_CONTEXT,
        SIGNED_SHA256_CONTEXT,
        SIGNATURE_BLOB,
    ];
}

/// Stored operation index meaning that there is nothing to resume.
pub const INVALID_OPERATION: i64 = -1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Resume state field {0:?} is missing")]
    MissingField(&'static str),
    #[error("Resume state field {0:?} has invalid value: {1}")]
    InvalidValue(&'static str, i64),
    #[error("Resume state field {0:?} is not valid base64")]
    Base64(&'static str, #[source] base64::DecodeError),
    #[error("Resume state field {0:?} has invalid hash context")]
    HashContext(&'static str, #[source] hash::Error),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Preference store error")]
    Prefs(#[from] prefs::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Everything needed to continue applying a payload after the last fully
/// applied operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeState {
    /// Global index of the next operation to apply.
    pub next_operation: u64,
    /// Offset of the next operation's data relative to the start of the blob
    /// section.
    pub next_data_offset: u64,
    /// Number of bytes of the next data blob that were already consumed.
    /// Checkpoints are only made at operation boundaries, so this is always
    /// 0 when written by [`checkpoint`].
    pub next_data_length: u64,
    pub hashers: PayloadHashers,
    /// Raw signatures block, once it has been read.
    pub signature_blob: Option<Vec<u8>>,
}

fn get_u64(prefs: &impl Prefs, key: &'static str) -> Result<u64> {
    let value = prefs.get_int(key)?.ok_or(Error::MissingField(key))?;

    u64::try_from(value).map_err(|_| Error::InvalidValue(key, value))
}

fn set_u64(prefs: &mut impl Prefs, key: &'static str, value: u64) -> Result<()> {
    let value = i64::try_from(value).map_err(|_| Error::IntegerTooLarge(key))?;
    prefs.set_int(key, value)?;

    Ok(())
}

fn get_bytes(prefs: &impl Prefs, key: &'static str) -> Result<Option<Vec<u8>>> {
    match prefs.get_string(key)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => STANDARD
            .decode(s.trim())
            .map(Some)
            .map_err(|e| Error::Base64(key, e)),
    }
}

fn get_context(prefs: &impl Prefs, key: &'static str) -> Result<Sha256Context> {
    let data = get_bytes(prefs, key)?.ok_or(Error::MissingField(key))?;

    Sha256Context::deserialize(&data).map_err(|e| Error::HashContext(key, e))
}

/// Load the resume state. Returns [`None`] if there is no update in progress.
/// If an update is in progress, but the state is incomplete or corrupt, an
/// error is returned.
pub fn load(prefs: &impl Prefs) -> Result<Option<ResumeState>> {
    let next_operation = match prefs.get_int(keys::NEXT_OPERATION)? {
        Some(n) if n > 0 => n as u64,
        Some(INVALID_OPERATION) | Some(0) | None => return Ok(None),
        Some(n) => return Err(Error::InvalidValue(keys::NEXT_OPERATION, n)),
    };

    let state = ResumeState {
        next_operation,
        next_data_offset: get_u64(prefs, keys::NEXT_DATA_OFFSET)?,
        next_data_length: get_u64(prefs, keys::NEXT_DATA_LENGTH)?,
        hashers: PayloadHashers {
            full: get_context(prefs, keys::SHA256_CONTEXT)?,
            signed: get_context(prefs, keys::SIGNED_SHA256_CONTEXT)?,
        },
        signature_blob: get_bytes(prefs, keys::SIGNATURE_BLOB)?,
    };

    // Checkpoints are only made between operations.
    if state.next_data_length != 0 {
        return Err(Error::InvalidValue(
            keys::NEXT_DATA_LENGTH,
            state.next_data_length as i64,
        ));
    }

    debug!(
        "Loaded resume state: next operation {}, data offset {}",
        state.next_operation, state.next_data_offset,
    );

    Ok(Some(state))
}

/// Durably record that `state.next_operation` is the next operation to apply.
pub fn checkpoint(prefs: &mut impl Prefs, state: &ResumeState) -> Result<()> {
    let next_operation =
        i64::try_from(state.next_operation).map_err(|_| Error::IntegerTooLarge("next_operation"))?;

    prefs.set_int(keys::NEXT_OPERATION, INVALID_OPERATION)?;

    set_u64(prefs, keys::NEXT_DATA_OFFSET, state.next_data_offset)?;
    set_u64(prefs, keys::NEXT_DATA_LENGTH, state.next_data_length)?;
    prefs.set_string(
        keys::SHA256_CONTEXT,
        &STANDARD.encode(state.hashers.full.serialize()),
    )?;
    prefs.set_string(
        keys::SIGNED_SHA256_CONTEXT,
        &STANDARD.encode(state.hashers.signed.serialize()),
    )?;

    match &state.signature_blob {
        Some(blob) => prefs.set_string(keys::SIGNATURE_BLOB, &STANDARD.encode(blob))?,
        None => prefs.delete(keys::SIGNATURE_BLOB)?,
    }

    prefs.set_int(keys::NEXT_OPERATION, next_operation)?;

    Ok(())
}

/// Discard any update progress. With `quick`, only the operation index is
/// invalidated, which is enough to prevent resuming.
pub fn reset(prefs: &mut impl Prefs, quick: bool) -> Result<()> {
    prefs.set_int(keys::NEXT_OPERATION, INVALID_OPERATION)?;

    if !quick {
        for key in keys::ALL {
            if *key != keys::NEXT_OPERATION {
                prefs.delete(key)?;
            }
        }
    }

    info!("Reset update progress (quick: {quick})");

    Ok(())
}

pub fn load_metadata_size(prefs: &impl Prefs) -> Result<Option<u64>> {
    match prefs.get_int(keys::MANIFEST_METADATA_SIZE)? {
        None => Ok(None),
        Some(n) if n <= 0 => Ok(None),
        Some(n) => Ok(Some(n as u64)),
    }
}

pub fn store_metadata_size(prefs: &mut impl Prefs, size: u64) -> Result<()> {
    set_u64(prefs, keys::MANIFEST_METADATA_SIZE, size)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::prefs::MemoryPrefs;

    fn sample_state() -> ResumeState {
        let mut hashers = PayloadHashers::new();
        hashers.update(b"signed bytes");
        hashers.update_unsigned(b"unsigned bytes");

        ResumeState {
            next_operation: 3,
            next_data_offset: 12345,
            next_data_length: 0,
            hashers,
            signature_blob: None,
        }
    }

    #[test]
    fn no_state() {
        let mut prefs = MemoryPrefs::new();
        assert_eq!(load(&prefs).unwrap(), None);

        prefs.set_int(keys::NEXT_OPERATION, INVALID_OPERATION).unwrap();
        assert_eq!(load(&prefs).unwrap(), None);

        prefs.set_int(keys::NEXT_OPERATION, 0).unwrap();
        assert_eq!(load(&prefs).unwrap(), None);

        prefs.set_int(keys::NEXT_OPERATION, -5).unwrap();
        assert_matches!(
            load(&prefs),
            Err(Error::InvalidValue(keys::NEXT_OPERATION, -5))
        );
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut prefs = MemoryPrefs::new();
        let mut state = sample_state();

        checkpoint(&mut prefs, &state).unwrap();
        assert_eq!(load(&prefs).unwrap(), Some(state.clone()));

        state.next_operation = 4;
        state.signature_blob = Some(b"signatures".to_vec());
        checkpoint(&mut prefs, &state).unwrap();
        assert_eq!(load(&prefs).unwrap(), Some(state.clone()));

        // A checkpoint without a blob must not leave a stale one behind.
        state.signature_blob = None;
        checkpoint(&mut prefs, &state).unwrap();
        assert_eq!(prefs.get_string(keys::SIGNATURE_BLOB).unwrap(), None);
    }

    #[test]
    fn incomplete_state() {
        let mut prefs = MemoryPrefs::new();
        checkpoint(&mut prefs, &sample_state()).unwrap();

        prefs.delete(keys::SIGNED_SHA256_CONTEXT).unwrap();
        assert_matches!(
            load(&prefs),
            Err(Error::MissingField(keys::SIGNED_SHA256_CONTEXT))
        );

        prefs
            .set_string(keys::SIGNED_SHA256_CONTEXT, "AAAA")
            .unwrap();
        assert_matches!(
            load(&prefs),
            Err(Error::HashContext(keys::SIGNED_SHA256_CONTEXT, _))
        );

        checkpoint(&mut prefs, &sample_state()).unwrap();
        prefs.set_int(keys::NEXT_DATA_LENGTH, 10).unwrap();
        assert_matches!(
            load(&prefs),
            Err(Error::InvalidValue(keys::NEXT_DATA_LENGTH, 10))
        );
    }

    #[test]
    fn reset_progress() {
        let mut prefs = MemoryPrefs::new();
        store_metadata_size(&mut prefs, 500).unwrap();
        checkpoint(&mut prefs, &sample_state()).unwrap();

        reset(&mut prefs, true).unwrap();
        assert_eq!(load(&prefs).unwrap(), None);
        assert_eq!(load_metadata_size(&prefs).unwrap(), Some(500));

        reset(&mut prefs, false).unwrap();
        assert_eq!(load_metadata_size(&prefs).unwrap(), None);
        assert_eq!(prefs.keys().collect::<Vec<_>>(), [keys::NEXT_OPERATION]);
    }
}
