// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::Read,
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use ring::digest::{Context as DigestContext, SHA256};
use tracing::info;

use crate::{
    cli::{status, warning},
    partition::{self, PartitionKind},
    performer::Performer,
    plan::InstallPlan,
    prefs::FilePrefs,
    progress,
    stream,
};

/// Apply a payload to the partitions listed in an install plan.
///
/// Progress is saved to the state directory after every operation. If the
/// command is interrupted, running it again with the same payload continues
/// from the last completed operation.
#[derive(Debug, Parser)]
pub struct ApplyCli {
    /// Path to input payload binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to install plan TOML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub plan: PathBuf,

    /// Directory for storing update progress.
    #[arg(long, value_name = "DIR", value_parser)]
    pub state_dir: PathBuf,

    /// Number of payload bytes to feed at a time.
    #[arg(long, value_name = "BYTES", default_value_t = 1024 * 1024)]
    pub chunk_size: usize,

    /// Discard saved progress and start from the beginning.
    #[arg(long)]
    pub restart: bool,

    /// Do not hash the partitions after the update is applied.
    #[arg(long)]
    pub skip_partition_check: bool,
}

fn feed_payload(
    performer: &mut Performer<FilePrefs>,
    reader: &mut impl Read,
    chunk_size: usize,
    cancel_signal: &AtomicBool,
) -> Result<DigestContext> {
    let mut context = DigestContext::new(&SHA256);
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        stream::check_cancel(cancel_signal)?;

        let n = reader.read(&mut buf).context("Failed to read payload")?;
        if n == 0 {
            break;
        }

        context.update(&buf[..n]);
        performer.write(&buf[..n])?;
    }

    Ok(context)
}

pub fn apply_main(cli: &ApplyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let plan = InstallPlan::load(&cli.plan)?;
    let key_ring = plan.load_key_ring()?;
    if key_ring.is_none() {
        warning!("No public keys in install plan; signatures will not be checked");
    }

    let mut prefs = FilePrefs::new(&cli.state_dir)?;
    if cli.restart {
        progress::reset(&mut prefs, false)?;
    }

    let paths = plan.partitions.clone();
    let minor_version = plan.minor_version;
    let published_hash = plan.payload_hash;
    let published_size = plan.payload_size;

    let mut performer = Performer::new(prefs, plan, key_ring)?;
    if performer.is_resuming() {
        status!("Resuming interrupted update");
    }

    performer.open(&paths, minor_version)?;

    let mut file = File::open(&cli.input)
        .with_context(|| format!("Failed to open payload: {:?}", cli.input))?;
    let payload_length = file
        .metadata()
        .with_context(|| format!("Failed to stat payload: {:?}", cli.input))?
        .len();

    status!("Applying {:?}", cli.input);

    let result = feed_payload(&mut performer, &mut file, cli.chunk_size, cancel_signal);
    // Always flush whatever was written, even if feeding failed.
    performer.close()?;
    let context = result?;

    // The digest computed while feeding only proves that the file was read
    // back consistently. Values published alongside the payload take
    // precedence so that a modified file is detected.
    let file_hash = context.finish();
    let expected_hash = match &published_hash {
        Some(hash) => {
            info!("Checking payload against published hash {hash:?}");
            &hash.0[..]
        }
        None => {
            warning!("No payload hash in install plan; using digest of the input file");
            file_hash.as_ref()
        }
    };
    let expected_size = published_size.unwrap_or(payload_length);

    performer.verify_payload(expected_hash, expected_size)?;

    let new_info = performer.get_new_partition_info()?;

    if cli.skip_partition_check {
        info!("Skipping partition check");
    } else {
        for kind in PartitionKind::ALL {
            let expected = new_info.get(kind);
            let path = paths.target(kind);

            let (_, digest) =
                partition::compute_partition_hash(path, Some(expected.size), cancel_signal)
                    .with_context(|| format!("Failed to hash {kind}: {path:?}"))?;

            if digest[..] != expected.hash[..] {
                bail!(
                    "{kind} hash is {}, but expected {}",
                    hex::encode(digest),
                    hex::encode(&expected.hash),
                );
            }

            info!("Verified {kind} ({} bytes)", expected.size);
        }
    }

    performer.reset_progress(false)?;

    status!("Update applied successfully");

    Ok(())
}
