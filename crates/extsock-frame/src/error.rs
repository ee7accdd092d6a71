use crate::opcode::Opcode;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The first byte of a packet is not a known opcode.
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    /// A zero-length packet was received.
    #[error("empty frame")]
    Empty,

    /// The packet size does not match the fixed size of its opcode.
    #[error("bad length for {opcode}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        opcode: Opcode,
        expected: usize,
        actual: usize,
    },

    /// The transport accepted only part of a frame.
    #[error("short write ({written} of {len} bytes)")]
    ShortWrite { written: usize, len: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// True when a bounded receive expired without data.
    ///
    /// This is the only condition callers are expected to retry.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
