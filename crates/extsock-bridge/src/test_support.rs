//! Socket-pair harness: a running transport reader on one end and a
//! scripted device process on the other.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use extsock_frame::{Frame, FrameReader, FrameWriter, RECV_BUFFER_SIZE};
use extsock_transport::PacketStream;

use crate::error::{BridgeError, Result};
use crate::exchange::SyncExchange;
use crate::handoff::Handoff;
use crate::reader::TransportReader;
use crate::sender::FrameSender;
use crate::shutdown::ShutdownToken;

pub(crate) const POLL: Duration = Duration::from_millis(20);
const DEVICE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct Harness {
    pub exchange: Arc<SyncExchange>,
    pub pending: Arc<Handoff<Frame>>,
    pub sender: Arc<FrameSender>,
    pub shutdown: ShutdownToken,
    pub device: DeviceEnd,
    reader: Option<JoinHandle<Result<()>>>,
}

impl Harness {
    pub fn start() -> Self {
        let (bridge, device) = PacketStream::pair().unwrap();
        let shutdown = ShutdownToken::new();
        let sender = Arc::new(FrameSender::new(bridge.try_clone().unwrap()));
        let exchange = Arc::new(SyncExchange::new(Arc::clone(&sender), shutdown.clone()));
        let pending = Arc::new(Handoff::new());
        let frames = FrameReader::with_timeout(bridge, Some(POLL)).unwrap();
        let reader = TransportReader::new(
            frames,
            Arc::clone(&exchange),
            Arc::clone(&pending),
            shutdown.clone(),
        )
        .spawn()
        .unwrap();

        Self {
            exchange,
            pending,
            sender,
            shutdown,
            device: DeviceEnd::new(device),
            reader: Some(reader),
        }
    }

    /// Cancel and join the reader, returning its result.
    pub fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        match self.reader.take() {
            Some(handle) => handle.join().map_err(|_| BridgeError::ReaderPanicked)?,
            None => Ok(()),
        }
    }

    pub fn disconnect_device(&self) {
        self.device.stream().shutdown().unwrap();
    }

    pub fn wait_for_fault(&self) {
        let deadline = Instant::now() + DEVICE_TIMEOUT;
        while self.shutdown.fault().is_none() {
            assert!(Instant::now() < deadline, "no fault recorded");
            thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn wait_for_pending(&self) {
        let deadline = Instant::now() + DEVICE_TIMEOUT;
        while !self.pending.is_occupied() {
            assert!(Instant::now() < deadline, "no asynchronous request buffered");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// The external device process side of the pair.
pub(crate) struct DeviceEnd {
    reader: FrameReader<PacketStream>,
    writer: FrameWriter<PacketStream>,
}

impl DeviceEnd {
    pub fn new(stream: PacketStream) -> Self {
        let reader =
            FrameReader::with_timeout(stream.try_clone().unwrap(), Some(DEVICE_TIMEOUT)).unwrap();
        Self {
            reader,
            writer: FrameWriter::new(stream),
        }
    }

    pub fn recv(&mut self) -> Frame {
        self.reader.read_frame().unwrap()
    }

    pub fn try_recv(&mut self, wait: Duration) -> Option<Frame> {
        self.reader.set_timeout(Some(wait)).unwrap();
        let result = self.reader.read_frame();
        self.reader.set_timeout(Some(DEVICE_TIMEOUT)).unwrap();
        match result {
            Ok(frame) => Some(frame),
            Err(err) if err.is_timeout() => None,
            Err(err) => panic!("device read failed: {err}"),
        }
    }

    /// Receive one packet and compare its exact bytes.
    pub fn expect_raw(&mut self, expected: &[u8]) {
        let mut packet = [0u8; RECV_BUFFER_SIZE];
        let len = self.reader.get_ref().recv_packet(&mut packet).unwrap();
        assert_eq!(&packet[..len], expected);
    }

    pub fn send(&mut self, frame: &Frame) {
        self.writer.send(frame).unwrap();
    }

    pub fn send_raw(&mut self, packet: &[u8]) {
        let sent = self.writer.get_ref().send_packet(packet).unwrap();
        assert_eq!(sent, packet.len());
    }

    pub fn stream(&self) -> &PacketStream {
        self.writer.get_ref()
    }
}
