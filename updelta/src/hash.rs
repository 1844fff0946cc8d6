// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! A SHA-256 context whose intermediate state can be serialized and restored.
//! This is needed to resume hashing a payload after an interruption without
//! rereading the bytes that were already consumed.

use std::fmt;

use sha2::digest::generic_array::GenericArray;
use thiserror::Error;

const BLOCK_SIZE: usize = 64;

const INITIAL_STATE: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Size of the serialized form without any pending bytes.
const SERIALIZED_FIXED_SIZE: usize = 8 * 4 + 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serialized hash context too short: {0} bytes")]
    TooShort(usize),
    #[error("Serialized hash context has too many pending bytes: {0}")]
    TooManyPending(usize),
    #[error("Serialized hash context has {pending} pending bytes, but total length is {total}")]
    InconsistentLength { pending: usize, total: u64 },
}

type Result<T> = std::result::Result<T, Error>;

/// Incremental SHA-256 built directly on the compression function.
#[derive(Clone, PartialEq, Eq)]
pub struct Sha256Context {
    state: [u32; 8],
    /// Total number of bytes fed into the context.
    total: u64,
    pending: [u8; BLOCK_SIZE],
    pending_len: usize,
}

impl fmt::Debug for Sha256Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sha256Context")
            .field("total", &self.total)
            .field("pending_len", &self.pending_len)
            .finish_non_exhaustive()
    }
}

impl Default for Sha256Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Sha256Context {
    pub fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            total: 0,
            pending: [0u8; BLOCK_SIZE],
            pending_len: 0,
        }
    }

    /// Number of bytes hashed so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn compress(state: &mut [u32; 8], block: &[u8]) {
        sha2::compress256(state, std::slice::from_ref(GenericArray::from_slice(block)));
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;

        if self.pending_len > 0 {
            let n = data.len().min(BLOCK_SIZE - self.pending_len);
            self.pending[self.pending_len..self.pending_len + n].copy_from_slice(&data[..n]);
            self.pending_len += n;
            data = &data[n..];

            if self.pending_len < BLOCK_SIZE {
                return;
            }

            Self::compress(&mut self.state, &self.pending);
            self.pending_len = 0;
        }

        let mut chunks = data.chunks_exact(BLOCK_SIZE);
        for block in &mut chunks {
            Self::compress(&mut self.state, block);
        }

        let remainder = chunks.remainder();
        self.pending[..remainder.len()].copy_from_slice(remainder);
        self.pending_len = remainder.len();
    }

    /// Compute the digest without consuming the context.
    pub fn finish(&self) -> [u8; 32] {
        let mut state = self.state;
        let mut block = [0u8; BLOCK_SIZE];
        block[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
        block[self.pending_len] = 0x80;

        if self.pending_len + 1 > BLOCK_SIZE - 8 {
            Self::compress(&mut state, &block);
            block = [0u8; BLOCK_SIZE];
        }

        let bit_len = self.total.wrapping_mul(8);
        block[BLOCK_SIZE - 8..].copy_from_slice(&bit_len.to_be_bytes());
        Self::compress(&mut state, &block);

        let mut digest = [0u8; 32];
        for (chunk, word) in digest.chunks_exact_mut(4).zip(state) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }

        digest
    }

    /// Serialize the intermediate state. The format is the eight state words
    /// and the total byte count, all big endian, followed by the bytes that
    /// have not been compressed yet.
    pub fn serialize(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(SERIALIZED_FIXED_SIZE + self.pending_len);

        for word in self.state {
            result.extend_from_slice(&word.to_be_bytes());
        }
        result.extend_from_slice(&self.total.to_be_bytes());
        result.extend_from_slice(&self.pending[..self.pending_len]);

        result
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < SERIALIZED_FIXED_SIZE {
            return Err(Error::TooShort(data.len()));
        }

        let (fixed, pending) = data.split_at(SERIALIZED_FIXED_SIZE);
        if pending.len() >= BLOCK_SIZE {
            return Err(Error::TooManyPending(pending.len()));
        }

        let mut state = [0u32; 8];
        for (word, chunk) in state.iter_mut().zip(fixed.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let mut total_bytes = [0u8; 8];
        total_bytes.copy_from_slice(&fixed[32..]);
        let total = u64::from_be_bytes(total_bytes);

        if total % BLOCK_SIZE as u64 != pending.len() as u64 {
            return Err(Error::InconsistentLength {
                pending: pending.len(),
                total,
            });
        }

        let mut result = Self {
            state,
            total,
            pending: [0u8; BLOCK_SIZE],
            pending_len: pending.len(),
        };
        result.pending[..pending.len()].copy_from_slice(pending);

        Ok(result)
    }
}
