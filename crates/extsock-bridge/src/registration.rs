use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use extsock_frame::{Frame, FrameError, FrameReader};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::RegistrationConfig;
use crate::error::{BridgeError, Result};
use crate::host::{MemoryHandler, PortHandler, RegionRegistry};

const MEMORY_SPACE_END: u64 = 1 << 32;
const PORT_SPACE_END: u64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    Memory,
    Io,
}

/// An address range announced by the device during registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionDescriptor {
    pub kind: RegionKind,
    pub base: u32,
    pub size: u32,
}

impl RegionDescriptor {
    pub fn memory(base: u32, size: u32) -> Self {
        Self {
            kind: RegionKind::Memory,
            base,
            size,
        }
    }

    pub fn io(base: u16, size: u16) -> Self {
        Self {
            kind: RegionKind::Io,
            base: u32::from(base),
            size: u32::from(size),
        }
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && u64::from(addr) < self.end()
    }

    fn space_end(&self) -> u64 {
        match self.kind {
            RegionKind::Memory => MEMORY_SPACE_END,
            RegionKind::Io => PORT_SPACE_END,
        }
    }
}

/// Consume the registration burst and map every announced region.
///
/// Reads frames until `REGISTRATION_COMPLETE`. Each memory or I/O region is
/// validated and mapped immediately, in arrival order, with `memory` or
/// `ports` as its handler. Any other opcode aborts registration.
///
/// The reader's own timeout bounds each receive; `config.timeout` bounds the
/// whole exchange.
pub fn register_regions<R: Read>(
    reader: &mut FrameReader<R>,
    registry: &mut dyn RegionRegistry,
    memory: Arc<dyn MemoryHandler>,
    ports: Arc<dyn PortHandler>,
    config: &RegistrationConfig,
) -> Result<Vec<RegionDescriptor>> {
    let deadline = config.timeout.map(|timeout| (Instant::now() + timeout, timeout));
    let mut regions = Vec::new();

    loop {
        if let Some((deadline, timeout)) = deadline {
            if Instant::now() >= deadline {
                return Err(BridgeError::RegistrationTimeout(timeout));
            }
        }

        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) if err.is_timeout() => continue,
            Err(FrameError::ConnectionClosed) => {
                return Err(BridgeError::Disconnected(
                    "connection closed during registration".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        match frame {
            Frame::RegistrationComplete => {
                info!(regions = regions.len(), "registration complete");
                return Ok(regions);
            }
            Frame::AddMemRegion { base, size } => {
                let region = RegionDescriptor::memory(base, size);
                validate_region(&region, regions.len(), config)?;
                info!(base = format_args!("{base:#010x}"), size = format_args!("{size:#x}"), "adding memory region");
                registry.map_memory(base, size, Arc::clone(&memory));
                regions.push(region);
            }
            Frame::AddIoRegion { base, size } => {
                let region = RegionDescriptor::io(base, size);
                validate_region(&region, regions.len(), config)?;
                info!(base = format_args!("{base:#06x}"), size = format_args!("{size:#x}"), "adding io region");
                registry.map_ports(base, size, Arc::clone(&ports));
                regions.push(region);
            }
            other => {
                debug!(opcode = %other.opcode(), "rejecting frame during registration");
                return Err(BridgeError::UnexpectedOpcode {
                    context: "registration",
                    opcode: other.opcode(),
                });
            }
        }
    }
}

fn validate_region(
    region: &RegionDescriptor,
    registered: usize,
    config: &RegistrationConfig,
) -> Result<()> {
    if registered >= config.max_regions {
        return Err(BridgeError::RegistrationFailed(format!(
            "too many regions (max {})",
            config.max_regions
        )));
    }
    if region.size == 0 {
        return Err(BridgeError::RegistrationFailed(format!(
            "zero-size {:?} region at {:#x}",
            region.kind, region.base
        )));
    }
    if region.end() > region.space_end() {
        return Err(BridgeError::RegistrationFailed(format!(
            "{:?} region {:#x}+{:#x} wraps the address space",
            region.kind, region.base, region.size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::ErrorKind;
    use std::time::Duration;

    use extsock_frame::Opcode;

    use super::*;

    #[derive(Default)]
    struct RecordingRegistry {
        memory: Vec<(u32, u32)>,
        ports: Vec<(u16, u16)>,
    }

    impl RegionRegistry for RecordingRegistry {
        fn map_memory(&mut self, base: u32, size: u32, _handler: Arc<dyn MemoryHandler>) {
            self.memory.push((base, size));
        }

        fn map_ports(&mut self, base: u16, size: u16, _handler: Arc<dyn PortHandler>) {
            self.ports.push((base, size));
        }
    }

    struct NullHandler;

    impl MemoryHandler for NullHandler {
        fn mmio_read(&self, _addr: u32) -> Result<u8> {
            Ok(0xFF)
        }

        fn mmio_write(&self, _addr: u32, _value: u8) -> Result<()> {
            Ok(())
        }
    }

    impl PortHandler for NullHandler {
        fn io_read(&self, _port: u16) -> Result<u8> {
            Ok(0xFF)
        }

        fn io_write(&self, _port: u16, _value: u8) -> Result<()> {
            Ok(())
        }
    }

    /// One packet per read; `None` entries time out.
    struct Packets(VecDeque<Option<Vec<u8>>>);

    impl Packets {
        fn of(packets: &[&[u8]]) -> Self {
            Self(packets.iter().map(|p| Some(p.to_vec())).collect())
        }
    }

    impl Read for Packets {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.pop_front() {
                None => Ok(0),
                Some(None) => Err(std::io::Error::from(ErrorKind::WouldBlock)),
                Some(Some(packet)) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
            }
        }
    }

    fn run(packets: Packets, config: &RegistrationConfig) -> (Result<Vec<RegionDescriptor>>, RecordingRegistry) {
        let mut reader = FrameReader::new(packets);
        let mut registry = RecordingRegistry::default();
        let handler = Arc::new(NullHandler);
        let result = register_regions(
            &mut reader,
            &mut registry,
            handler.clone(),
            handler,
            config,
        );
        (result, registry)
    }

    #[test]
    fn io_region_registered_before_completion() {
        let (result, registry) = run(
            Packets::of(&[&[0x06, 0x03, 0xF8, 0x00, 0x08], &[0x00]]),
            &RegistrationConfig::default(),
        );

        let regions = result.unwrap();
        assert_eq!(regions, vec![RegionDescriptor::io(0x03F8, 0x0008)]);
        assert_eq!(regions[0].end(), 0x0400);
        assert!(regions[0].contains(0x03FF));
        assert!(!regions[0].contains(0x0400));
        assert_eq!(registry.ports, vec![(0x03F8, 0x0008)]);
        assert!(registry.memory.is_empty());
    }

    #[test]
    fn regions_registered_in_arrival_order() {
        let (result, registry) = run(
            Packets::of(&[
                &[0x01, 0x00, 0x0D, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00],
                &[0x06, 0x02, 0x20, 0x00, 0x10],
                &[0x01, 0x00, 0x0C, 0x80, 0x00, 0x00, 0x00, 0x40, 0x00],
                &[0x00],
            ]),
            &RegistrationConfig::default(),
        );

        let regions = result.unwrap();
        assert_eq!(
            regions,
            vec![
                RegionDescriptor::memory(0x000D_0000, 0x2000),
                RegionDescriptor::io(0x0220, 0x0010),
                RegionDescriptor::memory(0x000C_8000, 0x4000),
            ]
        );
        assert_eq!(registry.memory, vec![(0x000D_0000, 0x2000), (0x000C_8000, 0x4000)]);
        assert_eq!(registry.ports, vec![(0x0220, 0x0010)]);
    }

    #[test]
    fn empty_registration_is_allowed() {
        let (result, _) = run(Packets::of(&[&[0x00]]), &RegistrationConfig::default());
        assert!(result.unwrap().is_empty());
    }

    #[test]
    fn timeouts_between_frames_are_retried() {
        let packets = Packets(VecDeque::from(vec![
            None,
            Some(vec![0x06, 0x00, 0x60, 0x00, 0x01]),
            None,
            Some(vec![0x00]),
        ]));
        let (result, _) = run(packets, &RegistrationConfig::default());
        assert_eq!(result.unwrap().len(), 1);
    }

    #[test]
    fn unexpected_opcode_is_fatal() {
        let (result, registry) = run(
            Packets::of(&[&[0x06, 0x03, 0xF8, 0x00, 0x08], &[0x03, 0x7F]]),
            &RegistrationConfig::default(),
        );
        assert!(matches!(
            result,
            Err(BridgeError::UnexpectedOpcode {
                context: "registration",
                opcode: Opcode::MemReadResponse
            })
        ));
        assert_eq!(registry.ports.len(), 1);
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let (result, _) = run(Packets::of(&[&[0x7E]]), &RegistrationConfig::default());
        assert!(matches!(
            result,
            Err(BridgeError::Frame(FrameError::UnknownOpcode(0x7E)))
        ));
    }

    #[test]
    fn bad_length_is_fatal() {
        let (result, _) = run(
            Packets::of(&[&[0x06, 0x03, 0xF8, 0x00]]),
            &RegistrationConfig::default(),
        );
        assert!(matches!(
            result,
            Err(BridgeError::Frame(FrameError::LengthMismatch { .. }))
        ));
    }

    #[test]
    fn disconnect_during_registration() {
        let (result, _) = run(
            Packets::of(&[&[0x06, 0x03, 0xF8, 0x00, 0x08]]),
            &RegistrationConfig::default(),
        );
        assert!(matches!(result, Err(BridgeError::Disconnected(_))));
    }

    #[test]
    fn zero_size_region_rejected() {
        let (result, registry) = run(
            Packets::of(&[&[0x06, 0x03, 0xF8, 0x00, 0x00], &[0x00]]),
            &RegistrationConfig::default(),
        );
        assert!(matches!(result, Err(BridgeError::RegistrationFailed(_))));
        assert!(registry.ports.is_empty());
    }

    #[test]
    fn wrapping_region_rejected() {
        let (result, _) = run(
            Packets::of(&[&[0x06, 0xFF, 0xF0, 0x00, 0x20], &[0x00]]),
            &RegistrationConfig::default(),
        );
        assert!(matches!(result, Err(BridgeError::RegistrationFailed(_))));

        let (result, _) = run(
            Packets::of(&[&[0x01, 0xFF, 0xFF, 0xF0, 0x00, 0x00, 0x00, 0x00, 0x20], &[0x00]]),
            &RegistrationConfig::default(),
        );
        assert!(matches!(result, Err(BridgeError::RegistrationFailed(_))));
    }

    #[test]
    fn region_ending_at_top_of_space_accepted() {
        let (result, _) = run(
            Packets::of(&[&[0x06, 0xFF, 0xF0, 0x00, 0x10], &[0x00]]),
            &RegistrationConfig::default(),
        );
        assert_eq!(result.unwrap()[0].end(), 0x1_0000);
    }

    #[test]
    fn region_limit_enforced() {
        let config = RegistrationConfig {
            max_regions: 1,
            ..RegistrationConfig::default()
        };
        let (result, registry) = run(
            Packets::of(&[
                &[0x06, 0x00, 0x60, 0x00, 0x01],
                &[0x06, 0x00, 0x64, 0x00, 0x01],
                &[0x00],
            ]),
            &config,
        );
        assert!(matches!(result, Err(BridgeError::RegistrationFailed(_))));
        assert_eq!(registry.ports, vec![(0x0060, 0x0001)]);
    }

    #[test]
    fn registration_deadline() {
        let packets = Packets(std::iter::repeat_with(|| None).take(10_000).collect());
        let config = RegistrationConfig {
            timeout: Some(Duration::ZERO),
            ..RegistrationConfig::default()
        };
        let (result, _) = run(packets, &config);
        assert!(matches!(result, Err(BridgeError::RegistrationTimeout(_))));
    }
}
