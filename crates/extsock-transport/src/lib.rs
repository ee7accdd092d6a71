//! Message-preserving transport for the extsock device bridge.
//!
//! The bridge and the external device process talk over a Unix domain socket
//! of type `SOCK_SEQPACKET`: the connection is ordered and reliable, and every
//! `send` arrives as exactly one `recv`. Higher layers rely on that property to
//! map one packet to one protocol frame without any reassembly.
//!
//! This is the lowest layer of extsock. Everything else builds on top of
//! the [`PacketStream`] type provided here.

pub mod error;
#[cfg(unix)]
pub mod traits;

#[cfg(unix)]
pub mod seqpacket;

pub use error::{Result, TransportError};
#[cfg(unix)]
pub use traits::PacketStream;

#[cfg(unix)]
pub use seqpacket::SeqPacketListener;
