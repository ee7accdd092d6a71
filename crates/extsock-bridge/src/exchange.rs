//! CPU-side request/response exchanges.
//!
//! Every memory or I/O access inside a registered region becomes one request
//! frame followed by a blocking wait for its response. The response is
//! delivered by the transport reader thread through a single-slot hand-off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use extsock_frame::{Frame, Opcode};
use tracing::{debug, trace};

use crate::error::{BridgeError, Result};
use crate::handoff::Handoff;
use crate::host::{MemoryHandler, PortHandler};
use crate::sender::FrameSender;
use crate::shutdown::ShutdownToken;

/// Issues synchronous requests for one device instance.
///
/// At most one request is outstanding at a time. Callers on other threads
/// block on `gate` until the current exchange has consumed its response.
pub struct SyncExchange {
    sender: Arc<FrameSender>,
    response: Handoff<Frame>,
    awaiting: AtomicBool,
    gate: Mutex<()>,
    shutdown: ShutdownToken,
}

impl SyncExchange {
    pub fn new(sender: Arc<FrameSender>, shutdown: ShutdownToken) -> Self {
        Self {
            sender,
            response: Handoff::new(),
            awaiting: AtomicBool::new(false),
            gate: Mutex::new(()),
            shutdown,
        }
    }

    pub fn mem_read_byte(&self, addr: u32) -> Result<u8> {
        self.exchange(
            Frame::MemReadRequest { addr },
            Opcode::MemReadResponse,
            |frame| match frame {
                Frame::MemReadResponse { value } => Some(value),
                _ => None,
            },
        )
    }

    pub fn mem_write_byte(&self, addr: u32, value: u8) -> Result<()> {
        self.exchange(
            Frame::MemWriteRequest { addr, value },
            Opcode::MemWriteAck,
            |frame| matches!(frame, Frame::MemWriteAck).then_some(()),
        )
    }

    pub fn io_read_byte(&self, port: u16) -> Result<u8> {
        self.exchange(
            Frame::IoReadRequest { port },
            Opcode::IoReadResponse,
            |frame| match frame {
                Frame::IoReadResponse { value } => Some(value),
                _ => None,
            },
        )
    }

    pub fn io_write_byte(&self, port: u16, value: u8) -> Result<()> {
        self.exchange(
            Frame::IoWriteRequest { port, value },
            Opcode::IoWriteAck,
            |frame| matches!(frame, Frame::IoWriteAck).then_some(()),
        )
    }

    /// Whether a request has been sent and its response not yet delivered.
    pub fn is_awaiting(&self) -> bool {
        self.awaiting.load(Ordering::SeqCst)
    }

    /// Hand a response frame to the waiting requester. Called by the
    /// transport reader.
    pub(crate) fn deliver(&self, frame: Frame) -> Result<()> {
        if !self.awaiting.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::UnsolicitedResponse(frame.opcode()));
        }
        trace!(opcode = %frame.opcode(), "delivering response");
        self.response.put(frame, &self.shutdown)
    }

    fn exchange<T>(
        &self,
        request: Frame,
        expected: Opcode,
        decode: impl FnOnce(Frame) -> Option<T>,
    ) -> Result<T> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::Terminated);
        }

        self.awaiting.store(true, Ordering::SeqCst);
        if let Err(err) = self.sender.send(&request) {
            self.awaiting.store(false, Ordering::SeqCst);
            return Err(self.fault(err));
        }

        let response = match self.response.take(&self.shutdown) {
            Ok(response) => response,
            Err(err) => {
                self.awaiting.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let actual = response.opcode();
        debug!(request = %request.opcode(), response = %actual, "exchange complete");
        decode(response).ok_or_else(|| {
            self.fault(BridgeError::ResponseMismatch {
                request: request.opcode(),
                expected,
                actual,
            })
        })
    }

    fn fault(&self, err: BridgeError) -> BridgeError {
        self.shutdown.fail(&err);
        err
    }
}

impl MemoryHandler for SyncExchange {
    fn mmio_read(&self, addr: u32) -> Result<u8> {
        self.mem_read_byte(addr)
    }

    fn mmio_write(&self, addr: u32, value: u8) -> Result<()> {
        self.mem_write_byte(addr, value)
    }
}

impl PortHandler for SyncExchange {
    fn io_read(&self, port: u16) -> Result<u8> {
        self.io_read_byte(port)
    }

    fn io_write(&self, port: u16, value: u8) -> Result<()> {
        self.io_write_byte(port, value)
    }
}
