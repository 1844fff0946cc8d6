// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

pub mod bsdiff;
pub mod compression;
pub mod payload;
