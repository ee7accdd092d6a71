use std::io::{ErrorKind, Write};
use std::time::Duration;

use bytes::BytesMut;
use extsock_transport::PacketStream;
use tracing::trace;

use crate::codec::{encode_frame, Frame, MAX_FRAME_SIZE};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

/// Writes one frame per packet to a message-preserving stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Encode and send a frame as a single packet (blocking).
    ///
    /// The frame must go out in one `write`; splitting it would put two
    /// packets on the wire, so a partial write is an error.
    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        self.buf.clear();
        encode_frame(frame, &mut self.buf);

        let written = loop {
            match self.inner.write(&self.buf) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    return Err(FrameError::ConnectionClosed)
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        };

        if written != self.buf.len() {
            return Err(FrameError::ShortWrite {
                written,
                len: self.buf.len(),
            });
        }

        trace!(opcode = frame.opcode().name(), len = written, "sent frame");
        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl FrameWriter<PacketStream> {
    /// Create a frame writer for a packet stream and apply a send timeout.
    pub fn with_timeout(inner: PacketStream, timeout: Option<Duration>) -> Result<Self> {
        inner
            .set_write_timeout(timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::new(inner))
    }
}
