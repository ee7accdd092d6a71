//! Protocol opcodes.
//!
//! The first byte of every frame. Values are fixed by the wire protocol and
//! shared with the external device process.

use std::fmt;

use crate::error::FrameError;

/// Which side originates a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the external device process.
    DeviceToBridge,
    /// Sent by the bridge.
    BridgeToDevice,
}

/// Routing class of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeClass {
    /// Region announcements and the end-of-registration marker.
    Registration,
    /// CPU-driven memory/I/O requests sent by the bridge.
    SyncRequest,
    /// Device answers to [`OpcodeClass::SyncRequest`] frames.
    SyncResponse,
    /// Device-initiated DMA and IRQ requests.
    AsyncRequest,
    /// Bridge answers to [`OpcodeClass::AsyncRequest`] frames.
    AsyncResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    RegistrationComplete = 0x00,
    AddMemRegion = 0x01,
    MemReadRequest = 0x02,
    MemReadResponse = 0x03,
    MemWriteRequest = 0x04,
    MemWriteAck = 0x05,
    AddIoRegion = 0x06,
    IoReadRequest = 0x07,
    IoReadResponse = 0x08,
    IoWriteRequest = 0x09,
    IoWriteAck = 0x0A,
    DmaReadRequest = 0x0B,
    DmaReadResponse = 0x0C,
    DmaWriteRequest = 0x0D,
    DmaWriteResponse = 0x0E,
    IrqRaiseRequest = 0x0F,
    IrqRaiseAck = 0x10,
    IrqLowerRequest = 0x11,
    IrqLowerAck = 0x12,
}

impl Opcode {
    /// Every opcode, in wire order.
    pub const ALL: [Opcode; 19] = [
        Opcode::RegistrationComplete,
        Opcode::AddMemRegion,
        Opcode::MemReadRequest,
        Opcode::MemReadResponse,
        Opcode::MemWriteRequest,
        Opcode::MemWriteAck,
        Opcode::AddIoRegion,
        Opcode::IoReadRequest,
        Opcode::IoReadResponse,
        Opcode::IoWriteRequest,
        Opcode::IoWriteAck,
        Opcode::DmaReadRequest,
        Opcode::DmaReadResponse,
        Opcode::DmaWriteRequest,
        Opcode::DmaWriteResponse,
        Opcode::IrqRaiseRequest,
        Opcode::IrqRaiseAck,
        Opcode::IrqLowerRequest,
        Opcode::IrqLowerAck,
    ];

    /// Size of the payload following the opcode byte.
    pub const fn payload_len(self) -> usize {
        match self {
            Opcode::RegistrationComplete
            | Opcode::MemWriteAck
            | Opcode::IoWriteAck
            | Opcode::IrqRaiseAck
            | Opcode::IrqLowerAck => 0,
            Opcode::MemReadResponse
            | Opcode::IoReadResponse
            | Opcode::DmaReadRequest
            | Opcode::DmaWriteResponse
            | Opcode::IrqRaiseRequest
            | Opcode::IrqLowerRequest => 1,
            Opcode::IoReadRequest => 2,
            Opcode::IoWriteRequest | Opcode::DmaReadResponse | Opcode::DmaWriteRequest => 3,
            Opcode::MemReadRequest | Opcode::AddIoRegion => 4,
            Opcode::MemWriteRequest => 5,
            Opcode::AddMemRegion => 8,
        }
    }

    /// Total frame size: opcode byte plus payload.
    pub const fn frame_len(self) -> usize {
        1 + self.payload_len()
    }

    pub const fn class(self) -> OpcodeClass {
        match self {
            Opcode::RegistrationComplete | Opcode::AddMemRegion | Opcode::AddIoRegion => {
                OpcodeClass::Registration
            }
            Opcode::MemReadRequest
            | Opcode::MemWriteRequest
            | Opcode::IoReadRequest
            | Opcode::IoWriteRequest => OpcodeClass::SyncRequest,
            Opcode::MemReadResponse
            | Opcode::MemWriteAck
            | Opcode::IoReadResponse
            | Opcode::IoWriteAck => OpcodeClass::SyncResponse,
            Opcode::DmaReadRequest
            | Opcode::DmaWriteRequest
            | Opcode::IrqRaiseRequest
            | Opcode::IrqLowerRequest => OpcodeClass::AsyncRequest,
            Opcode::DmaReadResponse
            | Opcode::DmaWriteResponse
            | Opcode::IrqRaiseAck
            | Opcode::IrqLowerAck => OpcodeClass::AsyncResponse,
        }
    }

    pub const fn direction(self) -> Direction {
        match self.class() {
            OpcodeClass::Registration | OpcodeClass::SyncResponse | OpcodeClass::AsyncRequest => {
                Direction::DeviceToBridge
            }
            OpcodeClass::SyncRequest | OpcodeClass::AsyncResponse => Direction::BridgeToDevice,
        }
    }

    /// The opcode that answers this request, if this is a request.
    pub const fn response(self) -> Option<Opcode> {
        match self {
            Opcode::MemReadRequest => Some(Opcode::MemReadResponse),
            Opcode::MemWriteRequest => Some(Opcode::MemWriteAck),
            Opcode::IoReadRequest => Some(Opcode::IoReadResponse),
            Opcode::IoWriteRequest => Some(Opcode::IoWriteAck),
            Opcode::DmaReadRequest => Some(Opcode::DmaReadResponse),
            Opcode::DmaWriteRequest => Some(Opcode::DmaWriteResponse),
            Opcode::IrqRaiseRequest => Some(Opcode::IrqRaiseAck),
            Opcode::IrqLowerRequest => Some(Opcode::IrqLowerAck),
            _ => None,
        }
    }

    /// Human-readable name for logs.
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::RegistrationComplete => "REGISTRATION_COMPLETE",
            Opcode::AddMemRegion => "ADD_MEM_REGION",
            Opcode::MemReadRequest => "MEM_READB_REQUEST",
            Opcode::MemReadResponse => "MEM_READB_RESPONSE",
            Opcode::MemWriteRequest => "MEM_WRITEB_REQUEST",
            Opcode::MemWriteAck => "MEM_WRITEB_ACK",
            Opcode::AddIoRegion => "ADD_IO_REGION",
            Opcode::IoReadRequest => "IO_READB_REQUEST",
            Opcode::IoReadResponse => "IO_READB_RESPONSE",
            Opcode::IoWriteRequest => "IO_WRITEB_REQUEST",
            Opcode::IoWriteAck => "IO_WRITEB_ACK",
            Opcode::DmaReadRequest => "DMA_READ_REQUEST",
            Opcode::DmaReadResponse => "DMA_READ_RESPONSE",
            Opcode::DmaWriteRequest => "DMA_WRITE_REQUEST",
            Opcode::DmaWriteResponse => "DMA_WRITE_RESPONSE",
            Opcode::IrqRaiseRequest => "IRQ_RAISE_REQUEST",
            Opcode::IrqRaiseAck => "IRQ_RAISE_ACK",
            Opcode::IrqLowerRequest => "IRQ_LOWER_REQUEST",
            Opcode::IrqLowerAck => "IRQ_LOWER_ACK",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Opcode::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(FrameError::UnknownOpcode(value))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), u8::from(*self))
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        opcode as u8
    }
}
