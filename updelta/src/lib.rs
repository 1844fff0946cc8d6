// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! updelta applies update payloads to a kernel and a root filesystem
//! partition. Payloads are consumed as a stream, every operation is verified
//! before it touches storage, and progress is recorded so that an interrupted
//! update can pick up where it left off.
//!
//! The semver versioning covers the CLI only. The Rust APIs can change at any
//! time.

pub mod apply;
pub mod cli;
pub mod crypto;
pub mod format;
pub mod hash;
pub mod partition;
pub mod performer;
pub mod plan;
pub mod prefs;
pub mod progress;
pub mod protobuf;
pub mod stream;
pub mod util;
pub mod verify;
