// SPDX-FileCopyrightText: 2025 updelta contributors
// SPDX-License-Identifier: GPL-3.0-only

//! I/O helpers shared by the payload parser and the partition layer.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::util;

pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

pub trait WriteZerosExt {
    /// Write exactly `size` zero bytes. Fails with
    /// [`io::ErrorKind::WriteZero`] if the writer fills up first.
    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()>;
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros_exact(&mut self, mut size: u64) -> io::Result<()> {
        while size > 0 {
            let n = size.min(util::ZEROS.len() as u64) as usize;
            // write_all() reports WriteZero when the writer stops accepting
            // data, which is what callers check for.
            self.write_all(&util::ZEROS[..n])?;
            size -= n as u64;
        }

        Ok(())
    }
}

pub trait ReadFixedSizeExt {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// A partition image that can be read at arbitrary offsets. There is no shared
/// cursor, so extents can be read in any order.
pub trait ReadAt {
    /// Size of the image in bytes.
    fn size(&self) -> io::Result<u64>;

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("Partition ends before offset {offset}"),
                    ));
                }
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }

        Ok(())
    }
}

/// A partition image that can also be written at arbitrary offsets.
pub trait WriteAt: ReadAt {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_at(buf, offset)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("Partition ends before offset {offset}"),
                    ));
                }
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }

        Ok(())
    }

    /// Make every completed write durable. Progress is only recorded after
    /// this returns.
    fn sync(&self) -> io::Result<()>;
}

impl ReadAt for File {
    fn size(&self) -> io::Result<u64> {
        // Block devices report a length of 0 in their metadata.
        (&*self).seek(SeekFrom::End(0))
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl WriteAt for File {
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

/// A fixed-size partition image held in memory. Like a real block device, it
/// never grows: reads and writes past the end transfer 0 bytes.
#[derive(Debug, Default)]
pub struct MemoryPartition(Mutex<Vec<u8>>);

impl MemoryPartition {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(Mutex::new(data.into()))
    }

    fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        // A panic while holding the lock cannot leave the bytes in an invalid
        // state.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the range within a buffer of length `len` that an access of `n`
/// bytes at `offset` covers.
fn clamp_range(len: usize, offset: u64, n: usize) -> (usize, usize) {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
    let end = start.saturating_add(n).min(len);
    (start, end)
}

impl ReadAt for MemoryPartition {
    fn size(&self) -> io::Result<u64> {
        Ok(self.data().len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data();
        let (start, end) = clamp_range(data.len(), offset, buf.len());
        buf[..end - start].copy_from_slice(&data[start..end]);

        Ok(end - start)
    }
}

impl WriteAt for MemoryPartition {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut data = self.data();
        let (start, end) = clamp_range(data.len(), offset, buf.len());
        data[start..end].copy_from_slice(&buf[..end - start]);

        Ok(end - start)
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. Long-running loops call this once per iteration.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}
