//! Interfaces the bridge consumes from the hosting emulator.
//!
//! The emulator owns address decoding, the DMA controller, the interrupt
//! controller, and virtual time. The bridge only sees them through these
//! traits, so one device instance can be wired into any host that provides
//! them.

use std::sync::Arc;

use extsock_frame::DmaStatus;

use crate::error::Result;

/// Byte-wide memory access handler bound to one device instance.
pub trait MemoryHandler: Send + Sync {
    fn mmio_read(&self, addr: u32) -> Result<u8>;
    fn mmio_write(&self, addr: u32, value: u8) -> Result<()>;
}

/// Byte-wide I/O port handler bound to one device instance.
pub trait PortHandler: Send + Sync {
    fn io_read(&self, port: u16) -> Result<u8>;
    fn io_write(&self, port: u16, value: u8) -> Result<()>;
}

/// The host's address-space and port dispatch.
///
/// Once mapped, every CPU access inside `[base, base + size)` is routed to
/// the handler. Regions are never unmapped by the bridge.
pub trait RegionRegistry {
    fn map_memory(&mut self, base: u32, size: u32, handler: Arc<dyn MemoryHandler>);
    fn map_ports(&mut self, base: u16, size: u16, handler: Arc<dyn PortHandler>);
}

/// Result of one DMA channel read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaRead {
    pub status: DmaStatus,
    pub data: u16,
}

impl DmaRead {
    /// The channel had nothing to transfer.
    pub const NO_DATA: DmaRead = DmaRead {
        status: DmaStatus {
            no_data: true,
            end_of_transfer: false,
        },
        data: 0,
    };
}

/// The host's ISA DMA controller.
pub trait DmaController: Send {
    fn channel_read(&mut self, channel: u8) -> DmaRead;
    /// `no_data` in the returned status means the channel was not ready.
    fn channel_write(&mut self, channel: u8, data: u16) -> DmaStatus;
}

/// The host's interrupt controller.
pub trait InterruptController: Send {
    fn raise(&mut self, line: u8);
    fn lower(&mut self, line: u8);
}

pub type TickCallback = Box<dyn FnMut() + Send>;

/// The host's virtual-time facility.
pub trait TimerFacility {
    /// Run `callback` every `period` host timer units until disabled.
    fn schedule_periodic(&mut self, period: u64, callback: TickCallback) -> Box<dyn TimerHandle>;
}

/// A scheduled periodic callback.
pub trait TimerHandle: Send {
    /// Stop further invocations.
    fn disable(&mut self);
}

/// Controllers a device needs for device-initiated requests.
pub struct HostBindings {
    pub dma: Box<dyn DmaController>,
    pub interrupts: Box<dyn InterruptController>,
}
