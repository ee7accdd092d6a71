//! Host-side bridge between an emulated CPU and an external device process.
//!
//! A device process connects over a `SOCK_SEQPACKET` socket, announces the
//! memory and I/O regions it decodes, and then serves every CPU access to
//! them as a blocking request/response exchange. The device may also ask
//! the host for DMA transfers and interrupt line changes; those requests are
//! buffered one at a time and serviced on a periodic host tick.
//!
//! ```text
//!   CPU thread ── SyncExchange ──┐                ┌── TransportReader (thread)
//!                                ├── FrameSender ─┤
//!   host tick ── AsyncDispatcher ┘                └── pending slot ── tick
//! ```
//!
//! [`ExtSockDevice`] wires the pieces together against the host interfaces
//! in [`host`]. [`HeadlessHost`] provides those interfaces without an
//! emulator.

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod exchange;
pub mod handoff;
pub mod headless;
pub mod host;
pub mod reader;
pub mod registration;
pub mod sender;
pub mod shutdown;

#[cfg(test)]
mod test_support;

pub use config::{BridgeConfig, RegistrationConfig, DEFAULT_SOCKET_PATH, DEFAULT_TICK_PERIOD};
pub use device::ExtSockDevice;
pub use dispatch::{AsyncDispatcher, TickOutcome};
pub use error::{BridgeError, Result};
pub use exchange::SyncExchange;
pub use handoff::Handoff;
pub use headless::{HeadlessHost, HostEvent, OPEN_BUS};
pub use host::{
    DmaController, DmaRead, HostBindings, InterruptController, MemoryHandler, PortHandler,
    RegionRegistry, TickCallback, TimerFacility, TimerHandle,
};
pub use reader::TransportReader;
pub use registration::{register_regions, RegionDescriptor, RegionKind};
pub use sender::FrameSender;
pub use shutdown::ShutdownToken;
