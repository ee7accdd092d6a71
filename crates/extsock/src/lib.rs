//! Bridge an emulated CPU to an external device process.
//!
//! An external process implements an ISA-style peripheral and talks to the
//! emulator over a `SOCK_SEQPACKET` Unix socket. CPU accesses to the regions
//! it registers become blocking request/response exchanges; the device may
//! also request DMA transfers and interrupt changes, serviced on a host tick.
//!
//! # Crate Structure
//!
//! - [`transport`]: seqpacket connections, listeners and socket pairs
//! - [`frame`]: opcodes, typed frames and the one-frame-per-packet codec
//! - [`bridge`]: the device bridge itself (behind the `bridge` feature)

/// Re-export transport types.
pub mod transport {
    pub use extsock_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use extsock_frame::*;
}

/// Re-export bridge types (requires `bridge` feature).
#[cfg(feature = "bridge")]
pub mod bridge {
    pub use extsock_bridge::*;
}
