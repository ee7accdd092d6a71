use std::sync::Arc;
use std::thread::JoinHandle;

use extsock_frame::{Frame, FrameReader};
use extsock_transport::{PacketStream, SeqPacketListener};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::dispatch::AsyncDispatcher;
use crate::error::{BridgeError, Result};
use crate::exchange::SyncExchange;
use crate::handoff::Handoff;
use crate::host::{HostBindings, RegionRegistry, TimerFacility, TimerHandle};
use crate::reader::TransportReader;
use crate::registration::{register_regions, RegionDescriptor};
use crate::sender::FrameSender;
use crate::shutdown::ShutdownToken;

/// One external device attached to the host.
///
/// Created by [`ExtSockDevice::open`] (or [`ExtSockDevice::attach`] for an
/// already connected stream). By the time either returns, every announced
/// region is mapped to this device, the transport reader is running, and the
/// dispatch tick is scheduled. Dropping the device closes it.
pub struct ExtSockDevice {
    exchange: Arc<SyncExchange>,
    pending: Arc<Handoff<Frame>>,
    regions: Vec<RegionDescriptor>,
    reader: Option<JoinHandle<Result<()>>>,
    timer: Option<Box<dyn TimerHandle>>,
    stream: PacketStream,
    shutdown: ShutdownToken,
    closed: bool,
}

impl ExtSockDevice {
    /// Connect to the device process at `config.socket_path` and attach it.
    pub fn open(
        config: &BridgeConfig,
        registry: &mut dyn RegionRegistry,
        timers: &mut dyn TimerFacility,
        host: HostBindings,
    ) -> Result<Self> {
        info!(path = %config.socket_path.display(), "connecting to device process");
        let stream = SeqPacketListener::connect(&config.socket_path)?;
        Self::attach(stream, config, registry, timers, host)
    }

    /// Run registration over `stream`, then start steady-state operation.
    pub fn attach(
        stream: PacketStream,
        config: &BridgeConfig,
        registry: &mut dyn RegionRegistry,
        timers: &mut dyn TimerFacility,
        host: HostBindings,
    ) -> Result<Self> {
        let shutdown = ShutdownToken::new();
        let sender = Arc::new(FrameSender::new(stream.try_clone()?));
        let exchange = Arc::new(SyncExchange::new(Arc::clone(&sender), shutdown.clone()));

        let mut frames = FrameReader::with_timeout(stream.try_clone()?, Some(config.poll_interval))?;
        let regions = register_regions(
            &mut frames,
            registry,
            exchange.clone(),
            exchange.clone(),
            &config.registration,
        )
        .map_err(|err| abandon(&stream, &shutdown, err))?;

        let pending = Arc::new(Handoff::new());
        let reader = TransportReader::new(
            frames,
            Arc::clone(&exchange),
            Arc::clone(&pending),
            shutdown.clone(),
        )
        .spawn()
        .map_err(|err| abandon(&stream, &shutdown, err))?;

        let mut dispatcher = AsyncDispatcher::new(
            Arc::clone(&pending),
            sender,
            host.dma,
            host.interrupts,
            shutdown.clone(),
        );
        let timer = timers.schedule_periodic(
            config.tick_period,
            Box::new(move || dispatcher.on_tick()),
        );

        info!(regions = regions.len(), "device attached");
        Ok(Self {
            exchange,
            pending,
            regions,
            reader: Some(reader),
            timer: Some(timer),
            stream,
            shutdown,
            closed: false,
        })
    }

    /// CPU-side access path, also mapped as the handler of every region.
    pub fn exchange(&self) -> &Arc<SyncExchange> {
        &self.exchange
    }

    /// Regions announced during registration, in arrival order.
    pub fn regions(&self) -> &[RegionDescriptor] {
        &self.regions
    }

    /// The fatal error that stopped the device, if any.
    pub fn fault(&self) -> Option<String> {
        self.shutdown.fault().map(str::to_owned)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Whether a device-initiated request is waiting for the next tick.
    pub fn has_pending_request(&self) -> bool {
        self.pending.is_occupied()
    }

    /// Stop the device: cancel waits, disable the tick, join the reader,
    /// and shut the connection down. Returns the reader's error, if it
    /// stopped on one.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.shutdown.cancel();
        if let Some(mut timer) = self.timer.take() {
            timer.disable();
        }

        let result = match self.reader.take() {
            Some(handle) => handle.join().unwrap_or(Err(BridgeError::ReaderPanicked)),
            None => Ok(()),
        };
        if let Err(err) = &result {
            debug!(error = %err, "transport reader exited with error");
        }

        if let Err(err) = self.stream.shutdown() {
            warn!(error = %err, "socket shutdown failed");
        }
        info!(fault = self.shutdown.fault(), "device closed");
        result
    }
}

/// Fail a half-attached device. Regions mapped before the failure stay with
/// the host, so their handlers must see `Terminated` instead of waiting on a
/// reader that will never run.
fn abandon(stream: &PacketStream, shutdown: &ShutdownToken, err: BridgeError) -> BridgeError {
    shutdown.fail(&err);
    if let Err(shutdown_err) = stream.shutdown() {
        warn!(error = %shutdown_err, "socket shutdown failed");
    }
    err
}

impl Drop for ExtSockDevice {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

impl std::fmt::Debug for ExtSockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtSockDevice")
            .field("regions", &self.regions)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use extsock_frame::DmaStatus;

    use super::*;
    use crate::headless::HeadlessHost;
    use crate::host::DmaRead;
    use crate::registration::RegionKind;
    use crate::test_support::{DeviceEnd, POLL};

    fn config() -> BridgeConfig {
        BridgeConfig {
            poll_interval: POLL,
            ..BridgeConfig::default()
        }
    }

    /// Queue the device's registration burst, then attach the host side.
    fn attach_with(
        host: &HeadlessHost,
        registration: &[Frame],
    ) -> (Result<ExtSockDevice>, DeviceEnd) {
        let (bridge, device) = PacketStream::pair().unwrap();
        let mut device = DeviceEnd::new(device);
        for frame in registration {
            device.send(frame);
        }
        let attached = host.attach(bridge, &config());
        (attached, device)
    }

    fn tick_until_serviced(host: &HeadlessHost, device: &ExtSockDevice) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !device.has_pending_request() {
            assert!(Instant::now() < deadline, "request never buffered");
            thread::sleep(Duration::from_millis(2));
        }
        host.advance_timers();
        assert!(!device.has_pending_request());
    }

    #[test]
    fn registration_then_io_write() {
        let host = HeadlessHost::new();
        let (device, mut remote) = attach_with(
            &host,
            &[
                Frame::AddIoRegion {
                    base: 0x03F8,
                    size: 0x0008,
                },
                Frame::RegistrationComplete,
            ],
        );
        let device = device.unwrap();
        assert_eq!(device.regions().len(), 1);
        assert_eq!(device.regions()[0].kind, RegionKind::Io);
        assert_eq!(host.regions(), device.regions());
        assert_eq!(host.active_timers(), 1);

        let cpu = {
            let host = host.clone();
            thread::spawn(move || host.io_write(0x03F9, 0x01))
        };
        remote.expect_raw(&[0x09, 0x03, 0xF9, 0x01]);
        remote.send_raw(&[0x0A]);
        cpu.join().unwrap().unwrap();

        device.close().unwrap();
        assert_eq!(host.active_timers(), 0);
    }

    #[test]
    fn memory_read_through_mapped_region() {
        let host = HeadlessHost::new();
        let (device, mut remote) = attach_with(
            &host,
            &[
                Frame::AddMemRegion {
                    base: 0x000A_0000,
                    size: 0x0002_0000,
                },
                Frame::RegistrationComplete,
            ],
        );
        let device = device.unwrap();

        let cpu = {
            let host = host.clone();
            thread::spawn(move || host.mem_read(0x000A_0000))
        };
        remote.expect_raw(&[0x02, 0x00, 0x0A, 0x00, 0x00]);
        remote.send_raw(&[0x03, 0x7F]);
        assert_eq!(cpu.join().unwrap().unwrap(), 0x7F);

        // Outside the region nothing reaches the device.
        assert_eq!(host.mem_read(0x000C_0000).unwrap(), 0xFF);
        assert!(remote.try_recv(Duration::from_millis(50)).is_none());

        device.close().unwrap();
    }

    #[test]
    fn irq_raise_serviced_on_tick() {
        let host = HeadlessHost::new();
        let (device, mut remote) = attach_with(&host, &[Frame::RegistrationComplete]);
        let device = device.unwrap();

        remote.send_raw(&[0x0F, 0x05]);
        tick_until_serviced(&host, &device);

        remote.expect_raw(&[0x10]);
        assert!(host.irq_level(5));
        device.close().unwrap();
    }

    #[test]
    fn dma_read_without_data_on_tick() {
        let host = HeadlessHost::new();
        let (device, mut remote) = attach_with(&host, &[Frame::RegistrationComplete]);
        let device = device.unwrap();

        remote.send_raw(&[0x0B, 0x02]);
        tick_until_serviced(&host, &device);

        remote.expect_raw(&[0x0C, 0x01, 0x00, 0x00]);
        device.close().unwrap();
    }

    #[test]
    fn async_requests_while_cpu_request_outstanding() {
        let host = HeadlessHost::new();
        host.queue_dma_read(
            1,
            DmaRead {
                status: DmaStatus::default(),
                data: 0x0042,
            },
        );
        let (device, mut remote) = attach_with(
            &host,
            &[
                Frame::AddIoRegion {
                    base: 0x0220,
                    size: 0x10,
                },
                Frame::RegistrationComplete,
            ],
        );
        let device = device.unwrap();

        let cpu = {
            let host = host.clone();
            thread::spawn(move || host.io_read(0x0220))
        };
        assert_eq!(remote.recv(), Frame::IoReadRequest { port: 0x0220 });

        // The device asks for DMA before answering the CPU.
        remote.send(&Frame::DmaReadRequest { channel: 1 });
        tick_until_serviced(&host, &device);
        assert_eq!(
            remote.recv(),
            Frame::DmaReadResponse {
                status: DmaStatus::default(),
                data: 0x0042
            }
        );

        remote.send(&Frame::IoReadResponse { value: 0x99 });
        assert_eq!(cpu.join().unwrap().unwrap(), 0x99);
        device.close().unwrap();
    }

    #[test]
    fn unexpected_frame_during_registration_fails_attach() {
        let host = HeadlessHost::new();
        let (device, _remote) = attach_with(&host, &[Frame::IrqRaiseRequest { line: 1 }]);
        assert!(matches!(
            device,
            Err(BridgeError::UnexpectedOpcode {
                context: "registration",
                ..
            })
        ));
        assert_eq!(host.active_timers(), 0);
    }

    #[test]
    fn failed_registration_terminates_regions_already_mapped() {
        let host = HeadlessHost::new();
        let (device, remote) = attach_with(
            &host,
            &[
                Frame::AddIoRegion {
                    base: 0x0060,
                    size: 1,
                },
                Frame::AddIoRegion {
                    base: 0x0064,
                    size: 0,
                },
            ],
        );
        assert!(matches!(device, Err(BridgeError::RegistrationFailed(_))));
        assert_eq!(host.regions(), vec![RegionDescriptor::io(0x0060, 1)]);

        let (tx, rx) = std::sync::mpsc::channel();
        let cpu = {
            let host = host.clone();
            thread::spawn(move || tx.send(host.io_read(0x0060)))
        };
        let read = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("read on a leftover region must not block");
        assert!(matches!(read, Err(BridgeError::Terminated)));
        cpu.join().unwrap().unwrap();

        let mut packet = [0u8; 8];
        assert_eq!(remote.stream().recv_packet(&mut packet).unwrap(), 0);
    }

    #[test]
    fn fault_terminates_later_accesses() {
        let host = HeadlessHost::new();
        let (device, mut remote) = attach_with(
            &host,
            &[
                Frame::AddIoRegion {
                    base: 0x0300,
                    size: 4,
                },
                Frame::RegistrationComplete,
            ],
        );
        let device = device.unwrap();

        let cpu = {
            let host = host.clone();
            thread::spawn(move || host.io_read(0x0300))
        };
        remote.recv();
        remote.send(&Frame::MemReadResponse { value: 0 });
        assert!(matches!(
            cpu.join().unwrap(),
            Err(BridgeError::ResponseMismatch { .. })
        ));

        assert!(!device.is_running());
        assert!(device.fault().is_some());
        assert!(matches!(host.io_read(0x0300), Err(BridgeError::Terminated)));
        device.close().unwrap();
    }

    #[test]
    fn device_disconnect_reported_on_close() {
        let host = HeadlessHost::new();
        let (device, remote) = attach_with(&host, &[Frame::RegistrationComplete]);
        let device = device.unwrap();

        remote.stream().shutdown().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while device.is_running() {
            assert!(Instant::now() < deadline, "disconnect not detected");
            thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(device.close(), Err(BridgeError::Disconnected(_))));
    }

    #[test]
    fn drop_closes_the_connection() {
        let host = HeadlessHost::new();
        let (device, remote) = attach_with(&host, &[Frame::RegistrationComplete]);
        drop(device.unwrap());

        let mut packet = [0u8; 8];
        assert_eq!(remote.stream().recv_packet(&mut packet).unwrap(), 0);
        assert_eq!(host.active_timers(), 0);
    }

    #[test]
    fn open_connects_to_listener() {
        let dir = std::env::temp_dir().join(format!("extsock-device-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("open.sock");
        let listener = SeqPacketListener::bind(&path).unwrap();

        let remote = thread::spawn(move || {
            let mut device = DeviceEnd::new(listener.accept().unwrap());
            device.send(&Frame::AddIoRegion {
                base: 0x0060,
                size: 1,
            });
            device.send(&Frame::RegistrationComplete);
            device
        });

        let host = HeadlessHost::new();
        let config = BridgeConfig {
            socket_path: path,
            ..config()
        };
        let device = host.open(&config).unwrap();
        let _remote = remote.join().unwrap();
        assert_eq!(device.regions().len(), 1);
        device.close().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn open_without_listener_fails() {
        let host = HeadlessHost::new();
        let config = BridgeConfig {
            socket_path: std::env::temp_dir().join("extsock-no-such-socket"),
            ..config()
        };
        assert!(matches!(host.open(&config), Err(BridgeError::Transport(_))));
    }
}
