// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Install plan: everything the caller knows about an update before the first
//! payload byte arrives.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    crypto,
    partition::{PartitionKind, PartitionPaths},
    verify::{DEFAULT_KEY_VERSION, KeyRing},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read install plan: {0:?}")]
    ReadFile(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse install plan: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Metadata signature is not valid base64")]
    MetadataSignature(#[source] base64::DecodeError),
    #[error("Failed to load public key for version {0}")]
    PublicKey(u32, #[source] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sha256Hash(
    #[serde(
        serialize_with = "hex::serialize",
        deserialize_with = "hex::deserialize"
    )]
    pub [u8; 32],
);

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyConfig {
    pub version: u32,
    /// PEM-encoded public key or X509 certificate.
    pub path: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallPlan {
    pub partitions: PartitionPaths,
    /// Minor payload version that the target supports.
    #[serde(default)]
    pub minor_version: u32,
    /// Whether missing metadata and operation hashes are fatal.
    #[serde(default)]
    pub hash_checks_mandatory: bool,
    /// Expected size of the payload header and manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u64>,
    /// Base64-encoded raw RSA signature of the payload metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_rootfs_hash: Option<Sha256Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kernel_hash: Option<Sha256Hash>,
    /// Key version that must have a valid signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_key_version: Option<u32>,
    #[serde(default, rename = "public_key", skip_serializing_if = "Vec::is_empty")]
    pub public_keys: Vec<PublicKeyConfig>,
    /// SHA-256 digest of the whole payload, as published by the update server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<Sha256Hash>,
    /// Size of the whole payload, as published by the update server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<u64>,
}

impl InstallPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

        toml_edit::de::from_str(&contents).map_err(|e| Error::Parse(path.to_owned(), e))
    }

    pub fn source_hash(&self, kind: PartitionKind) -> Option<&Sha256Hash> {
        match kind {
            PartitionKind::Rootfs => self.source_rootfs_hash.as_ref(),
            PartitionKind::Kernel => self.source_kernel_hash.as_ref(),
        }
    }

    /// Decode the out-of-band metadata signature, if there is one. An empty
    /// string counts as no signature.
    pub fn metadata_signature_bytes(&self) -> Result<Option<Vec<u8>>> {
        match self.metadata_signature.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => STANDARD
                .decode(s.trim())
                .map(Some)
                .map_err(Error::MetadataSignature),
        }
    }

    /// Load the configured public keys. Returns [`None`] if there are none, in
    /// which case signatures are not checked.
    pub fn load_key_ring(&self) -> Result<Option<KeyRing>> {
        if self.public_keys.is_empty() {
            return Ok(None);
        }

        let mut key_ring = KeyRing::new(self.expected_key_version.unwrap_or(DEFAULT_KEY_VERSION));

        for config in &self.public_keys {
            let key = crypto::read_public_key_file(&config.path)
                .map_err(|e| Error::PublicKey(config.version, e))?;
            key_ring.insert(config.version, key);
        }

        Ok(Some(key_ring))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_plan() {
        let plan: InstallPlan = toml_edit::de::from_str(
            r#"
            minor_version = 2
            hash_checks_mandatory = true
            metadata_size = 1234
            metadata_signature = "AAEC"
            source_rootfs_hash = "0000000000000000000000000000000000000000000000000000000000000001"
            expected_key_version = 2
            payload_hash = "ff00000000000000000000000000000000000000000000000000000000000000"
            payload_size = 4096

            [partitions]
            rootfs = "rootfs.img"
            kernel = "kernel.img"
            rootfs_source = "old_rootfs.img"

            [[public_key]]
            version = 1
            path = "key1.pub.pem"

            [[public_key]]
            version = 2
            path = "key2.pub.pem"
            "#,
        )
        .unwrap();

        assert_eq!(plan.minor_version, 2);
        assert!(plan.hash_checks_mandatory);
        assert_eq!(plan.metadata_size, Some(1234));
        assert_eq!(plan.metadata_signature_bytes().unwrap(), Some(vec![0, 1, 2]));
        assert_eq!(plan.partitions.kernel, Path::new("kernel.img"));
        assert_eq!(
            plan.partitions.source(PartitionKind::Rootfs),
            Some(Path::new("old_rootfs.img"))
        );
        assert_eq!(plan.partitions.source(PartitionKind::Kernel), None);

        let mut expected_hash = [0u8; 32];
        expected_hash[31] = 1;
        assert_eq!(
            plan.source_hash(PartitionKind::Rootfs),
            Some(&Sha256Hash(expected_hash))
        );
        assert_eq!(plan.source_hash(PartitionKind::Kernel), None);
        assert_eq!(plan.public_keys.len(), 2);

        let mut expected_hash = [0u8; 32];
        expected_hash[0] = 0xff;
        assert_eq!(plan.payload_hash, Some(Sha256Hash(expected_hash)));
        assert_eq!(plan.payload_size, Some(4096));
    }

    #[test]
    fn minimal_plan() {
        let plan: InstallPlan = toml_edit::de::from_str(
            r#"
            [partitions]
            rootfs = "a"
            kernel = "b"
            "#,
        )
        .unwrap();

        assert_eq!(plan.minor_version, 0);
        assert!(!plan.hash_checks_mandatory);
        assert_eq!(plan.metadata_signature_bytes().unwrap(), None);
        assert_eq!(plan.payload_hash, None);
        assert_eq!(plan.payload_size, None);
        assert!(plan.load_key_ring().unwrap().is_none());
    }

    #[test]
    fn reject_bad_values() {
        let plan = InstallPlan {
            metadata_signature: Some("not base64!".to_owned()),
            ..Default::default()
        };
        assert_matches!(
            plan.metadata_signature_bytes(),
            Err(Error::MetadataSignature(_))
        );

        let result = toml_edit::de::from_str::<InstallPlan>(
            r#"
            bogus = 1

            [partitions]
            rootfs = "a"
            kernel = "b"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn load_keys_from_plan() {
        let data_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data");
        let plan = InstallPlan {
            expected_key_version: Some(2),
            public_keys: vec![
                PublicKeyConfig {
                    version: 1,
                    path: data_dir.join("key1.pub.pem"),
                },
                PublicKeyConfig {
                    version: 2,
                    path: data_dir.join("key2.crt"),
                },
            ],
            ..Default::default()
        };

        let mut key_ring = plan.load_key_ring().unwrap().unwrap();
        assert_eq!(key_ring.expected_version(), 2);

        key_ring.set_expected_version(3);
        assert_matches!(
            key_ring.verify_raw(&[0u8; 32], &[]),
            Err(crate::verify::Error::MissingKey(3))
        );
    }
}
