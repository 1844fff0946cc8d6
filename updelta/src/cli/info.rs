// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, fs::File, io::BufReader, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    format::payload::{self, PayloadMetadata},
    protobuf::chromeos_update_engine::install_operation::Type,
    stream::FromReader,
};

/// Display payload header and manifest information.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to input payload binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Only print a summary instead of the full manifest.
    #[arg(short, long)]
    pub summary: bool,
}

pub fn info_main(cli: &InfoCli) -> Result<()> {
    let reader = File::open(&cli.input)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open payload for reading: {:?}", cli.input))?;
    let metadata = PayloadMetadata::from_reader(reader)
        .with_context(|| format!("Failed to read payload metadata: {:?}", cli.input))?;
    let manifest = &metadata.manifest;

    if cli.summary {
        println!("{:#?}", metadata.header);
    } else {
        println!("{metadata:#?}");
    }

    let mut counts = BTreeMap::<String, usize>::new();
    for (_, op) in payload::operations(manifest) {
        let name = match Type::try_from(op.r#type) {
            Ok(t) => t.as_str_name().to_owned(),
            Err(_) => format!("UNKNOWN({})", op.r#type),
        };
        *counts.entry(name).or_default() += 1;
    }

    println!(
        "{} payload, minor version {}, block size {}",
        if payload::is_full_payload(manifest) {
            "Full"
        } else {
            "Delta"
        },
        manifest.minor_version.unwrap_or(payload::MINOR_VERSION_FULL),
        payload::block_size(manifest),
    );
    println!(
        "Metadata size: {}, data offset: {}",
        metadata.header.metadata_size()?,
        metadata.header.blob_offset()?,
    );
    for (name, count) in counts {
        println!("  {name}: {count}");
    }

    match (manifest.signatures_offset, manifest.signatures_size) {
        (Some(offset), Some(size)) => println!("Signatures: {size} bytes at data offset {offset}"),
        _ => println!("Signatures: none"),
    }

    Ok(())
}
