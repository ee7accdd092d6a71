//! Fixed-layout opcode frames for the extsock device bridge protocol.
//!
//! Every message is a single opcode byte followed by a payload whose size and
//! layout are fixed by the opcode. Multi-byte integers are big-endian. The
//! transport delivers one frame per packet, so there is no length prefix and
//! no reassembly: decoding only checks that the packet has exactly the size
//! its opcode requires.

pub mod codec;
pub mod error;
pub mod opcode;
pub mod reader;
pub mod writer;

pub use codec::{decode_frame, encode_frame, DmaStatus, Frame, MAX_FRAME_SIZE};
pub use error::{FrameError, Result};
pub use opcode::{Direction, Opcode, OpcodeClass};
pub use reader::{FrameReader, RECV_BUFFER_SIZE};
pub use writer::FrameWriter;
