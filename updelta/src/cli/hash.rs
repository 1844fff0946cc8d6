// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{partition, plan::Sha256Hash};

/// Compute the SHA-256 digest of a partition image.
///
/// This can be used to cross-check a partition against the size and hash
/// declared by a payload manifest.
#[derive(Debug, Parser)]
pub struct HashPartitionCli {
    /// Path to partition image or block device.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Only hash this many bytes from the start.
    #[arg(short, long, value_name = "BYTES")]
    pub size: Option<u64>,

    /// Fail if the digest does not match this hex-encoded SHA-256 digest.
    #[arg(long, value_name = "HEX", value_parser = parse_hash)]
    pub expected: Option<Sha256Hash>,
}

fn parse_hash(value: &str) -> Result<Sha256Hash> {
    let mut digest = [0u8; 32];
    hex::decode_to_slice(value, &mut digest)
        .with_context(|| format!("Invalid SHA-256 digest: {value:?}"))?;

    Ok(Sha256Hash(digest))
}

pub fn hash_partition_main(cli: &HashPartitionCli, cancel_signal: &AtomicBool) -> Result<()> {
    let (size, digest) = partition::compute_partition_hash(&cli.input, cli.size, cancel_signal)
        .with_context(|| format!("Failed to hash partition: {:?}", cli.input))?;

    println!("{}  {size}", hex::encode(digest));

    if let Some(expected) = &cli.expected
        && expected.0 != digest
    {
        bail!(
            "Digest does not match expected digest: {}",
            hex::encode(expected.0)
        );
    }

    Ok(())
}
