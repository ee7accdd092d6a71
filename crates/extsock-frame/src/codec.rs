use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::opcode::Opcode;

/// Largest frame in the protocol (`ADD_MEM_REGION`: opcode + two u32).
pub const MAX_FRAME_SIZE: usize = 9;

const DMA_NO_DATA: u8 = 0x01;
const DMA_END_OF_TRANSFER: u8 = 0x02;

/// Status flags carried by DMA responses.
///
/// Bit 0 means "no data" in a read response and "not ready to accept data" in
/// a write response; bit 1 marks the last unit of the transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaStatus {
    pub no_data: bool,
    pub end_of_transfer: bool,
}

impl DmaStatus {
    pub const fn bits(self) -> u8 {
        (if self.no_data { DMA_NO_DATA } else { 0 })
            | (if self.end_of_transfer {
                DMA_END_OF_TRANSFER
            } else {
                0
            })
    }

    /// Undefined bits are ignored.
    pub const fn from_bits(bits: u8) -> Self {
        Self {
            no_data: bits & DMA_NO_DATA != 0,
            end_of_transfer: bits & DMA_END_OF_TRANSFER != 0,
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    RegistrationComplete,
    AddMemRegion { base: u32, size: u32 },
    MemReadRequest { addr: u32 },
    MemReadResponse { value: u8 },
    MemWriteRequest { addr: u32, value: u8 },
    MemWriteAck,
    AddIoRegion { base: u16, size: u16 },
    IoReadRequest { port: u16 },
    IoReadResponse { value: u8 },
    IoWriteRequest { port: u16, value: u8 },
    IoWriteAck,
    DmaReadRequest { channel: u8 },
    DmaReadResponse { status: DmaStatus, data: u16 },
    DmaWriteRequest { channel: u8, data: u16 },
    DmaWriteResponse { status: DmaStatus },
    IrqRaiseRequest { line: u8 },
    IrqRaiseAck,
    IrqLowerRequest { line: u8 },
    IrqLowerAck,
}

impl Frame {
    pub const fn opcode(&self) -> Opcode {
        match self {
            Frame::RegistrationComplete => Opcode::RegistrationComplete,
            Frame::AddMemRegion { .. } => Opcode::AddMemRegion,
            Frame::MemReadRequest { .. } => Opcode::MemReadRequest,
            Frame::MemReadResponse { .. } => Opcode::MemReadResponse,
            Frame::MemWriteRequest { .. } => Opcode::MemWriteRequest,
            Frame::MemWriteAck => Opcode::MemWriteAck,
            Frame::AddIoRegion { .. } => Opcode::AddIoRegion,
            Frame::IoReadRequest { .. } => Opcode::IoReadRequest,
            Frame::IoReadResponse { .. } => Opcode::IoReadResponse,
            Frame::IoWriteRequest { .. } => Opcode::IoWriteRequest,
            Frame::IoWriteAck => Opcode::IoWriteAck,
            Frame::DmaReadRequest { .. } => Opcode::DmaReadRequest,
            Frame::DmaReadResponse { .. } => Opcode::DmaReadResponse,
            Frame::DmaWriteRequest { .. } => Opcode::DmaWriteRequest,
            Frame::DmaWriteResponse { .. } => Opcode::DmaWriteResponse,
            Frame::IrqRaiseRequest { .. } => Opcode::IrqRaiseRequest,
            Frame::IrqRaiseAck => Opcode::IrqRaiseAck,
            Frame::IrqLowerRequest { .. } => Opcode::IrqLowerRequest,
            Frame::IrqLowerAck => Opcode::IrqLowerAck,
        }
    }

    /// The total wire size of this frame.
    pub const fn wire_size(&self) -> usize {
        self.opcode().frame_len()
    }
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌──────────┬──────────────────────────────────────┐
/// │ Opcode   │ Payload (fixed per opcode, BE ints)  │
/// │ (1B)     │ (0..=8 bytes)                        │
/// └──────────┴──────────────────────────────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(frame.wire_size());
    dst.put_u8(frame.opcode().into());
    match *frame {
        Frame::RegistrationComplete
        | Frame::MemWriteAck
        | Frame::IoWriteAck
        | Frame::IrqRaiseAck
        | Frame::IrqLowerAck => {}
        Frame::AddMemRegion { base, size } => {
            dst.put_u32(base);
            dst.put_u32(size);
        }
        Frame::MemReadRequest { addr } => dst.put_u32(addr),
        Frame::MemReadResponse { value } | Frame::IoReadResponse { value } => dst.put_u8(value),
        Frame::MemWriteRequest { addr, value } => {
            dst.put_u32(addr);
            dst.put_u8(value);
        }
        Frame::AddIoRegion { base, size } => {
            dst.put_u16(base);
            dst.put_u16(size);
        }
        Frame::IoReadRequest { port } => dst.put_u16(port),
        Frame::IoWriteRequest { port, value } => {
            dst.put_u16(port);
            dst.put_u8(value);
        }
        Frame::DmaReadRequest { channel } => dst.put_u8(channel),
        Frame::DmaReadResponse { status, data } => {
            dst.put_u8(status.bits());
            dst.put_u16(data);
        }
        Frame::DmaWriteRequest { channel, data } => {
            dst.put_u8(channel);
            dst.put_u16(data);
        }
        Frame::DmaWriteResponse { status } => dst.put_u8(status.bits()),
        Frame::IrqRaiseRequest { line } | Frame::IrqLowerRequest { line } => dst.put_u8(line),
    }
}

/// Decode one complete frame.
///
/// `src` must hold exactly one packet; its length has to match the fixed size
/// of the opcode in its first byte.
pub fn decode_frame(src: &[u8]) -> Result<Frame> {
    let (&first, mut payload) = src.split_first().ok_or(FrameError::Empty)?;
    let opcode = Opcode::try_from(first)?;

    if src.len() != opcode.frame_len() {
        return Err(FrameError::LengthMismatch {
            opcode,
            expected: opcode.frame_len(),
            actual: src.len(),
        });
    }

    let frame = match opcode {
        Opcode::RegistrationComplete => Frame::RegistrationComplete,
        Opcode::AddMemRegion => Frame::AddMemRegion {
            base: payload.get_u32(),
            size: payload.get_u32(),
        },
        Opcode::MemReadRequest => Frame::MemReadRequest {
            addr: payload.get_u32(),
        },
        Opcode::MemReadResponse => Frame::MemReadResponse {
            value: payload.get_u8(),
        },
        Opcode::MemWriteRequest => Frame::MemWriteRequest {
            addr: payload.get_u32(),
            value: payload.get_u8(),
        },
        Opcode::MemWriteAck => Frame::MemWriteAck,
        Opcode::AddIoRegion => Frame::AddIoRegion {
            base: payload.get_u16(),
            size: payload.get_u16(),
        },
        Opcode::IoReadRequest => Frame::IoReadRequest {
            port: payload.get_u16(),
        },
        Opcode::IoReadResponse => Frame::IoReadResponse {
            value: payload.get_u8(),
        },
        Opcode::IoWriteRequest => Frame::IoWriteRequest {
            port: payload.get_u16(),
            value: payload.get_u8(),
        },
        Opcode::IoWriteAck => Frame::IoWriteAck,
        Opcode::DmaReadRequest => Frame::DmaReadRequest {
            channel: payload.get_u8(),
        },
        Opcode::DmaReadResponse => Frame::DmaReadResponse {
            status: DmaStatus::from_bits(payload.get_u8()),
            data: payload.get_u16(),
        },
        Opcode::DmaWriteRequest => Frame::DmaWriteRequest {
            channel: payload.get_u8(),
            data: payload.get_u16(),
        },
        Opcode::DmaWriteResponse => Frame::DmaWriteResponse {
            status: DmaStatus::from_bits(payload.get_u8()),
        },
        Opcode::IrqRaiseRequest => Frame::IrqRaiseRequest {
            line: payload.get_u8(),
        },
        Opcode::IrqRaiseAck => Frame::IrqRaiseAck,
        Opcode::IrqLowerRequest => Frame::IrqLowerRequest {
            line: payload.get_u8(),
        },
        Opcode::IrqLowerAck => Frame::IrqLowerAck,
    };

    debug_assert!(!payload.has_remaining());
    Ok(frame)
}
