//! I/O wrappers that report transfer progress.
//!
//! [`ProgressReader`] and [`ProgressWriter`] wrap any implementation of [`std::io::Read`] or
//! [`std::io::Write`] and report `bytes / total` into a [`ProgressToken`] after every
//! successful call. Useful for downloads, hashing large files, or compressing streams
//! whose length is known up front.
//!
//! The reader also reports `1.0` when the inner reader signals end of file, so a
//! stream that turns out shorter than expected still completes.

use std::io::{self, Read, Write};

use crate::token::ProgressToken;

#[allow(clippy::cast_precision_loss)]
fn fraction(position: u64, total: u64) -> f64 {
    position as f64 / total as f64
}

/// A wrapper around [`Read`] that reports the fraction of `total` bytes read.
#[derive(Debug)]
pub struct ProgressReader<R> {
    inner: R,
    token: ProgressToken,
    total: u64,
    position: u64,
}

impl<R> ProgressReader<R> {
    /// Creates a new `ProgressReader` expecting `total` bytes from `inner`.
    pub const fn new(inner: R, token: ProgressToken, total: u64) -> Self {
        Self {
            inner,
            token,
            total,
            position: 0,
        }
    }

    /// Bytes read so far.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Unwraps the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.token.report(1.0);
        } else if self.total > 0 {
            self.position += n as u64;
            self.token.report(fraction(self.position, self.total));
        }
        Ok(n)
    }
}

/// A wrapper around [`Write`] that reports the fraction of `total` bytes written.
#[derive(Debug)]
pub struct ProgressWriter<W> {
    inner: W,
    token: ProgressToken,
    total: u64,
    position: u64,
}

impl<W> ProgressWriter<W> {
    /// Creates a new `ProgressWriter` expecting `total` bytes to be written to `inner`.
    pub const fn new(inner: W, token: ProgressToken, total: u64) -> Self {
        Self {
            inner,
            token,
            total,
            position: 0,
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Unwraps the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        if self.total > 0 {
            self.token.report(fraction(self.position, self.total));
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
