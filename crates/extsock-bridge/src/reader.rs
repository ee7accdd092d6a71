use std::sync::Arc;
use std::thread::{self, JoinHandle};

use extsock_frame::{Frame, FrameError, FrameReader, OpcodeClass};
use extsock_transport::{PacketStream, TransportError};
use tracing::{debug, info, trace};

use crate::error::{BridgeError, Result};
use crate::exchange::SyncExchange;
use crate::handoff::Handoff;
use crate::shutdown::ShutdownToken;

pub const READER_THREAD_NAME: &str = "extsock-reader";

/// Dedicated receive loop for one device connection.
///
/// Routes synchronous responses to the waiting CPU-side requester and
/// parks asynchronous requests in the single pending slot until the tick
/// services them. The reader blocks on the slot rather than overwrite an
/// unserviced request.
pub struct TransportReader {
    frames: FrameReader<PacketStream>,
    exchange: Arc<SyncExchange>,
    pending: Arc<Handoff<Frame>>,
    shutdown: ShutdownToken,
}

impl TransportReader {
    /// `frames` should carry a bounded receive so the loop observes
    /// shutdown between packets.
    pub fn new(
        frames: FrameReader<PacketStream>,
        exchange: Arc<SyncExchange>,
        pending: Arc<Handoff<Frame>>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            frames,
            exchange,
            pending,
            shutdown,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name(READER_THREAD_NAME.to_string())
            .spawn(move || self.run())
            .map_err(|err| BridgeError::Transport(TransportError::Io(err)))
    }

    /// Run until shutdown or a fatal error. Fatal errors are recorded on the
    /// shutdown token before returning.
    pub fn run(mut self) -> Result<()> {
        info!("transport reader started");
        match self.pump() {
            Ok(()) => {
                info!("transport reader stopped");
                Ok(())
            }
            Err(err) if self.shutdown.is_cancelled() && self.shutdown.fault().is_none() => {
                debug!(error = %err, "transport reader stopped during shutdown");
                Ok(())
            }
            Err(BridgeError::Terminated) => Err(BridgeError::Terminated),
            Err(err) => {
                self.shutdown.fail(&err);
                Err(err)
            }
        }
    }

    fn pump(&mut self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let frame = match self.frames.read_frame() {
                Ok(frame) => frame,
                Err(err) if err.is_timeout() => continue,
                Err(FrameError::ConnectionClosed) => {
                    return Err(BridgeError::Disconnected(
                        "connection closed by device".to_string(),
                    ));
                }
                Err(err) => return Err(err.into()),
            };

            self.route(frame)?;
        }
    }

    fn route(&self, frame: Frame) -> Result<()> {
        let opcode = frame.opcode();
        match opcode.class() {
            OpcodeClass::SyncResponse => self.exchange.deliver(frame),
            OpcodeClass::AsyncRequest => {
                trace!(opcode = %opcode, "buffering asynchronous request");
                self.pending.put(frame, &self.shutdown)?;
                debug!(opcode = %opcode, "asynchronous request pending");
                Ok(())
            }
            OpcodeClass::Registration | OpcodeClass::SyncRequest | OpcodeClass::AsyncResponse => {
                Err(BridgeError::UnexpectedOpcode {
                    context: "steady state",
                    opcode,
                })
            }
        }
    }
}
