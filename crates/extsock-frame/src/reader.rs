use std::io::{ErrorKind, Read};
use std::time::Duration;

use extsock_transport::PacketStream;
use tracing::trace;

use crate::codec::{decode_frame, Frame};
use crate::error::{FrameError, Result};

/// Receive buffer size. Larger than any valid frame, so an oversized packet
/// is truncated to a length no opcode accepts.
pub const RECV_BUFFER_SIZE: usize = 32;

/// Reads one frame per packet from a message-preserving stream.
///
/// Each call to the inner `read` must yield exactly one packet, as
/// [`PacketStream`] does.
pub struct FrameReader<T> {
    inner: T,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Read the next frame (blocking, subject to the stream's read timeout).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when the peer has gone
    /// away. A read timeout surfaces as an `Io` error for which
    /// [`FrameError::is_timeout`] is true.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut packet = [0u8; RECV_BUFFER_SIZE];
        let read = loop {
            match self.inner.read(&mut packet) {
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        };

        if read == 0 {
            return Err(FrameError::ConnectionClosed);
        }

        let frame = decode_frame(&packet[..read])?;
        trace!(opcode = frame.opcode().name(), len = read, "received frame");
        Ok(frame)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl FrameReader<PacketStream> {
    /// Create a frame reader for a packet stream with a bounded receive.
    pub fn with_timeout(inner: PacketStream, timeout: Option<Duration>) -> Result<Self> {
        inner.set_read_timeout(timeout).map_err(transport_to_frame_error)?;
        Ok(Self::new(inner))
    }

    /// Change the bounded receive used by subsequent reads.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)
    }
}

pub(crate) fn transport_to_frame_error(err: extsock_transport::TransportError) -> FrameError {
    match err {
        extsock_transport::TransportError::Io(io)
        | extsock_transport::TransportError::Socket(io)
        | extsock_transport::TransportError::Accept(io) => FrameError::Io(io),
        extsock_transport::TransportError::Bind { source, .. }
        | extsock_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
