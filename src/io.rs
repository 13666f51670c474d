/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Upload body sources.
//!
//! Multipart uploads consume their body strictly sequentially, one part at a
//! time, from the work loop. The [`InputStream`] trait is therefore a plain
//! pull interface rather than an async stream: each call hands back the next
//! run of bytes, and an empty return signals end of stream.

use bytes::{Bytes, BytesMut};
use std::error::Error;
use std::fmt;
use std::io::Read;

use crate::error::BoxError;

/// A strictly sequential source of upload bytes.
///
/// Implementations are never read concurrently; the transfer state machine
/// owns the stream and pulls exactly one part ahead of the uploads it has in
/// flight.
pub trait InputStream: Send + fmt::Debug {
    /// Reads up to `max` bytes. Returning an empty buffer means the stream
    /// is exhausted. Short (non-empty) reads are allowed.
    fn read(&mut self, max: usize) -> Result<Bytes, InputStreamError>;
}

/// Reads from `stream` until `part_size` bytes are gathered or the stream
/// ends, whichever comes first.
pub(crate) fn read_part(
    stream: &mut dyn InputStream,
    part_size: usize,
) -> Result<Bytes, InputStreamError> {
    let first = stream.read(part_size)?;
    if first.len() >= part_size || first.is_empty() {
        return Ok(first);
    }
    // Short read; keep pulling until the part fills or the stream ends.
    let mut buf = BytesMut::with_capacity(part_size);
    buf.extend_from_slice(&first);
    while buf.len() < part_size {
        let chunk = stream.read(part_size - buf.len())?;
        if chunk.is_empty() {
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Error produced by an [`InputStream`].
#[derive(Debug)]
pub struct InputStreamError {
    source: BoxError,
}

impl InputStreamError {
    /// Wraps an underlying failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl fmt::Display for InputStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to read upload body")
    }
}

impl Error for InputStreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref() as _)
    }
}

/// [`InputStream`] over an in-memory buffer.
#[derive(Debug)]
pub struct BytesInputStream {
    remaining: Bytes,
}

impl BytesInputStream {
    /// Creates a stream over `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            remaining: data.into(),
        }
    }
}

impl From<Bytes> for BytesInputStream {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl InputStream for BytesInputStream {
    fn read(&mut self, max: usize) -> Result<Bytes, InputStreamError> {
        let take = max.min(self.remaining.len());
        Ok(self.remaining.split_to(take))
    }
}

/// [`InputStream`] adapter over any [`std::io::Read`].
pub struct ReaderInputStream<R> {
    reader: R,
}

impl<R> ReaderInputStream<R> {
    /// Wraps `reader`.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R> fmt::Debug for ReaderInputStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderInputStream").finish_non_exhaustive()
    }
}

impl<R: Read + Send> InputStream for ReaderInputStream<R> {
    fn read(&mut self, max: usize) -> Result<Bytes, InputStreamError> {
        let mut buf = vec![0u8; max.min(64 * 1024)];
        let n = self.reader.read(&mut buf).map_err(InputStreamError::new)?;
        buf.truncate(n);
        Ok(buf.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_stream_reads_in_chunks() {
        let mut stream = BytesInputStream::new(Bytes::from_static(b"hello world"));
        assert_eq!(b"hello".as_slice(), &stream.read(5).unwrap()[..]);
        assert_eq!(b" world".as_slice(), &stream.read(100).unwrap()[..]);
        assert!(stream.read(100).unwrap().is_empty());
    }

    #[test]
    fn read_part_fills_from_short_reads() {
        // The reader adapter caps single reads at 64 KiB; read_part must
        // still assemble a full part from repeated pulls.
        let data = vec![7u8; 200 * 1024];
        let mut stream = ReaderInputStream::new(std::io::Cursor::new(data));
        let part = read_part(&mut stream, 150 * 1024).unwrap();
        assert_eq!(150 * 1024, part.len());
        let rest = read_part(&mut stream, 150 * 1024).unwrap();
        assert_eq!(50 * 1024, rest.len());
        assert!(read_part(&mut stream, 150 * 1024).unwrap().is_empty());
    }

    #[test]
    fn read_part_empty_stream() {
        let mut stream = BytesInputStream::new(Bytes::new());
        assert!(read_part(&mut stream, 1024).unwrap().is_empty());
    }
}
