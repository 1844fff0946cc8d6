// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey, traits::PublicKeyParts};
use sha2::Sha256;
use thiserror::Error;
use x509_cert::{
    Certificate,
    der::{DecodePem, referenced::OwnedToRef},
};

/// Length of a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

const CERT_BEGIN: &[u8] = b"-----BEGIN CERTIFICATE-----";
const CERT_END: &[u8] = b"-----END CERTIFICATE-----";

#[derive(Debug, Error)]
pub enum Error {
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("Invalid digest length ({0} bytes)")]
    InvalidDigestLength(usize),
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Failed to load RSA public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to load X509 certificate")]
    LoadCert(#[source] x509_cert::der::Error),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn check_key_size(size: usize) -> Result<()> {
    // RustCrypto does not support 8192-bit keys.
    if size > 4096 / 8 {
        return Err(Error::UnsupportedKeySize(size));
    }

    Ok(())
}

pub trait RsaPublicKeyExt {
    fn verify_sig(&self, digest: &[u8], signature: &[u8]) -> Result<()>;
}

impl RsaPublicKeyExt for RsaPublicKey {
    /// Verify a PKCS#1 v1.5 signature of a SHA-256 digest.
    fn verify_sig(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        // Check this explicitly so we can provide a better error message.
        if digest.len() != DIGEST_LEN {
            return Err(Error::InvalidDigestLength(digest.len()));
        }

        check_key_size(self.size())?;

        self.verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
            .map_err(|e| Error::RsaVerify(Box::new(e)))
    }
}

/// x509_cert/pem follow rfc7468 strictly instead of implementing a lenient
/// parser. The PEM decoder rejects lines in the base64 section that are longer
/// than 64 characters, excluding whitespace, so the data is reformatted before
/// parsing.
fn reformat_pem(data: &[u8]) -> Result<Vec<u8>> {
    let mut result = vec![];
    let mut base64 = vec![];
    let mut inside_base64 = false;

    for line in data.split(|&c| c == b'\n') {
        let line = line.trim_ascii_end();

        if line.is_empty() {
            continue;
        } else if line.starts_with(CERT_BEGIN) {
            inside_base64 = true;

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if line.starts_with(CERT_END) {
            inside_base64 = false;

            for chunk in base64.chunks(64) {
                result.extend_from_slice(chunk);
                result.push(b'\n');
            }

            base64.clear();

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if inside_base64 {
            base64.extend_from_slice(line);
        }
    }

    if inside_base64 {
        return Err(Error::PemNoEndTag);
    }

    Ok(result)
}

fn read_all(path: &Path, mut reader: impl Read) -> Result<Vec<u8>> {
    let mut data = vec![];
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    Ok(data)
}

/// Read PEM-encoded certificate from a reader.
pub fn read_pem_cert(path: &Path, reader: impl Read) -> Result<Certificate> {
    let data = read_all(path, reader)?;
    let data = reformat_pem(&data)?;
    let certificate = Certificate::from_pem(data).map_err(Error::LoadCert)?;

    Ok(certificate)
}

/// Read PEM-encoded PKCS8 public key from a reader.
pub fn read_pem_public_key(path: &Path, mut reader: impl Read) -> Result<RsaPublicKey> {
    let mut data = String::new();
    reader
        .read_to_string(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    let key = RsaPublicKey::from_public_key_pem(&data).map_err(Error::LoadPubKey)?;

    Ok(key)
}

/// Get the RSA public key from a certificate.
pub fn get_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let public_key =
        RsaPublicKey::try_from(cert.tbs_certificate.subject_public_key_info.owned_to_ref())
            .map_err(Error::LoadPubKey)?;

    Ok(public_key)
}

/// Read an RSA public key from a file containing either a PEM-encoded PKCS8
/// public key or a PEM-encoded X509 certificate.
pub fn read_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;
    let data = read_all(path, reader)?;

    if data.windows(CERT_BEGIN.len()).any(|w| w == CERT_BEGIN) {
        let cert = read_pem_cert(path, data.as_slice())?;
        get_public_key(&cert)
    } else {
        read_pem_public_key(path, data.as_slice())
    }
}
