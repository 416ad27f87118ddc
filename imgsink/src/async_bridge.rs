//! Bridge from async request body streams to synchronous [`Read`] types.
//!
//! Request bodies arrive as async streams of [`Bytes`], but the `tar` crate, the snappy decoder
//! and the data processors all operate on blocking `Read` impls.  The bridge keeps the body
//! streaming; nothing here buffers more than one chunk at a time.

use bytes::{buf::Reader, Buf, Bytes};
use futures::{Stream, StreamExt};
use std::{io::Read, pin::Pin};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Given a [`Stream`] impl that yields chunks of bytes, produce a [`Read`] implementation that
/// will expose those very same bytes for blocking reads.
///
/// NOTE: The resulting [`std::io::Read`] implementation will panic if any of its `read_*` methods
/// are called from an async context, like in block of async code.  Blocking reads must be
/// performed in a blocking worker thread, using [`tokio::task::spawn_blocking`].
pub(crate) fn stream_as_reader<S, E>(stream: S) -> impl Read + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    let handle = tokio::runtime::Handle::current();

    TryStreamReader {
        buffer: None,
        stream: Box::pin(stream.map(|result| result.map_err(Into::into))),
        handle,
    }
}

struct TryStreamReader {
    buffer: Option<Reader<Bytes>>,
    stream: Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>,
    handle: tokio::runtime::Handle,
}

impl Read for TryStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // If there's an existing buffer of data left over from a prior read, try to satisfy the
        // read request that way
        if let Some(mut buffer) = self.buffer.take() {
            if buffer.get_ref().remaining() > 0 {
                // `buf` may be bigger than what's left in the buffer.  `Read` doesn't require
                // filling it, so a short read is fine.
                let bytes_read = buffer.read(buf)?;

                if buffer.get_ref().remaining() > 0 {
                    self.buffer = Some(buffer);
                }

                return Ok(bytes_read);
            }
        }

        loop {
            // No existing buffer, so pull the next one from the stream
            match self.handle.block_on(async { self.stream.next().await }) {
                None => {
                    // The end of the stream.  That means EOF as far as the reader is concerned
                    return Ok(0);
                }
                Some(Err(e)) => {
                    // The body stream failed, ie the client went away mid-upload
                    return Err(std::io::Error::other(e));
                }
                Some(Ok(bytes)) if bytes.is_empty() => {
                    // A zero-length read would look like EOF to the caller, so keep going
                    continue;
                }
                Some(Ok(bytes)) => {
                    let mut buffer = bytes.reader();

                    let bytes_read = buffer.read(buf)?;

                    if buffer.get_ref().remaining() > 0 {
                        self.buffer = Some(buffer);
                    }

                    return Ok(bytes_read);
                }
            }
        }
    }
}
