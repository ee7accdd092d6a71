use std::io::Write;
use std::sync::{Mutex, PoisonError};

use extsock_frame::{Frame, FrameWriter};
use tracing::debug;

use crate::error::Result;

/// The one write path to the device process.
///
/// Synchronous requests (CPU thread) and asynchronous responses (tick
/// context) share the connection; the lock keeps each frame a single
/// uninterrupted packet.
pub struct FrameSender {
    writer: Mutex<FrameWriter<Box<dyn Write + Send>>>,
}

impl FrameSender {
    pub fn new(stream: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(FrameWriter::new(Box::new(stream))),
        }
    }

    pub fn send(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.send(frame)?;
        debug!(opcode = %frame.opcode(), "frame sent");
        Ok(())
    }
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender").finish_non_exhaustive()
    }
}
