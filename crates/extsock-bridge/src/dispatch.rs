//! Servicing of device-initiated requests on the host tick.
//!
//! The transport reader parks at most one asynchronous request. Each tick
//! takes it, performs the DMA or interrupt operation against the host
//! controllers, frees the slot, and only then sends the response.

use std::sync::Arc;

use extsock_frame::{DmaStatus, Frame};
use tracing::{debug, error, trace};

use crate::error::{BridgeError, Result};
use crate::handoff::Handoff;
use crate::host::{DmaController, InterruptController};
use crate::sender::FrameSender;
use crate::shutdown::ShutdownToken;

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    /// The request that was serviced.
    Serviced(Frame),
}

pub struct AsyncDispatcher {
    pending: Arc<Handoff<Frame>>,
    sender: Arc<FrameSender>,
    dma: Box<dyn DmaController>,
    interrupts: Box<dyn InterruptController>,
    shutdown: ShutdownToken,
}

impl AsyncDispatcher {
    pub fn new(
        pending: Arc<Handoff<Frame>>,
        sender: Arc<FrameSender>,
        dma: Box<dyn DmaController>,
        interrupts: Box<dyn InterruptController>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            pending,
            sender,
            dma,
            interrupts,
            shutdown,
        }
    }

    /// Timer callback body. Errors are already recorded as the device fault.
    pub fn on_tick(&mut self) {
        if let Err(err) = self.tick() {
            if !matches!(err, BridgeError::Terminated) {
                error!(error = %err, "asynchronous dispatch failed");
            }
        }
    }

    /// Service the pending request, if any. Never blocks.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::Terminated);
        }
        let Some(request) = self.pending.peek() else {
            trace!("no asynchronous request pending");
            return Ok(TickOutcome::Idle);
        };

        let response = match self.service(request) {
            Ok(response) => response,
            Err(err) => {
                self.shutdown.fail(&err);
                return Err(err);
            }
        };

        self.pending.release();
        if let Err(err) = self.sender.send(&response) {
            self.shutdown.fail(&err);
            return Err(err);
        }
        debug!(request = %request.opcode(), response = %response.opcode(), "asynchronous request serviced");
        Ok(TickOutcome::Serviced(request))
    }

    fn service(&mut self, request: Frame) -> Result<Frame> {
        match request {
            Frame::DmaReadRequest { channel } => {
                let read = self.dma.channel_read(channel);
                // No data means nothing was transferred.
                let data = if read.status.no_data { 0 } else { read.data };
                trace!(channel, data, status = read.status.bits(), "dma channel read");
                Ok(Frame::DmaReadResponse {
                    status: read.status,
                    data,
                })
            }
            Frame::DmaWriteRequest { channel, data } => {
                let status: DmaStatus = self.dma.channel_write(channel, data);
                trace!(channel, data, status = status.bits(), "dma channel write");
                Ok(Frame::DmaWriteResponse { status })
            }
            Frame::IrqRaiseRequest { line } => {
                self.interrupts.raise(line);
                trace!(line, "irq raised");
                Ok(Frame::IrqRaiseAck)
            }
            Frame::IrqLowerRequest { line } => {
                self.interrupts.lower(line);
                trace!(line, "irq lowered");
                Ok(Frame::IrqLowerAck)
            }
            other => Err(BridgeError::UnexpectedOpcode {
                context: "asynchronous dispatch",
                opcode: other.opcode(),
            }),
        }
    }
}
