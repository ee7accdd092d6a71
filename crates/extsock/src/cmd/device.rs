use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use extsock_bridge::{RegionDescriptor, RegionKind};
use extsock_frame::{Frame, FrameError, FrameReader, FrameWriter};
use extsock_transport::{PacketStream, SeqPacketListener, TransportError};

use crate::cmd::{install_ctrlc_handler, DeviceArgs};
use crate::exit::{frame_error, transport_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_session_summary, OutputFormat, SessionSummary};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const RECV_POLL: Duration = Duration::from_millis(200);

/// Byte store behind the announced regions. Unwritten bytes read as zero.
#[derive(Default)]
struct DeviceStore {
    memory: HashMap<u32, u8>,
    ports: HashMap<u16, u8>,
}

pub fn run(args: DeviceArgs, format: OutputFormat) -> CliResult<i32> {
    let listener =
        SeqPacketListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| transport_error("listener setup failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let regions: Vec<RegionDescriptor> = args.mem.iter().chain(args.io.iter()).copied().collect();
    let mut store = DeviceStore::default();

    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(TransportError::Accept(err)) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(transport_error("accept failed", err)),
        };
        tracing::info!(path = %args.path.display(), "host connected");

        let summary = serve(stream, &regions, &args, &mut store, &running)?;
        print_session_summary(&summary, format);

        if args.once {
            break;
        }
    }

    Ok(SUCCESS)
}

fn serve(
    stream: PacketStream,
    regions: &[RegionDescriptor],
    args: &DeviceArgs,
    store: &mut DeviceStore,
    running: &AtomicBool,
) -> CliResult<SessionSummary> {
    let reader_stream = stream
        .try_clone()
        .map_err(|err| transport_error("socket clone failed", err))?;
    let mut reader = FrameReader::with_timeout(reader_stream, Some(RECV_POLL))
        .map_err(|err| frame_error("socket setup failed", err))?;
    let mut writer = FrameWriter::new(stream);

    for region in regions {
        let frame = match region.kind {
            RegionKind::Memory => Frame::AddMemRegion {
                base: region.base,
                size: region.size,
            },
            // Port ranges were range-checked when parsed.
            RegionKind::Io => Frame::AddIoRegion {
                base: region.base as u16,
                size: region.size as u16,
            },
        };
        writer
            .send(&frame)
            .map_err(|err| frame_error("registration failed", err))?;
    }
    writer
        .send(&Frame::RegistrationComplete)
        .map_err(|err| frame_error("registration failed", err))?;
    tracing::info!(regions = regions.len(), "registration sent");

    let mut summary = SessionSummary {
        regions: regions.len(),
        ..SessionSummary::default()
    };

    // One device-initiated request in flight at a time.
    let mut queued: VecDeque<Frame> = VecDeque::new();
    if let Some(line) = args.raise_irq {
        queued.push_back(Frame::IrqRaiseRequest { line });
    }
    if let Some(channel) = args.dma_read {
        queued.push_back(Frame::DmaReadRequest { channel });
    }
    let mut in_flight = send_next(&mut writer, &mut queued)?;

    while running.load(Ordering::SeqCst) {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) if err.is_timeout() => continue,
            Err(FrameError::ConnectionClosed) => {
                tracing::info!("host disconnected");
                summary.closed_by_host = true;
                break;
            }
            Err(err) => return Err(frame_error("receive failed", err)),
        };

        let reply = match frame {
            Frame::MemReadRequest { addr } => {
                summary.reads += 1;
                let value = store.memory.get(&addr).copied().unwrap_or(0);
                tracing::debug!(addr, value, "memory read");
                Some(Frame::MemReadResponse { value })
            }
            Frame::MemWriteRequest { addr, value } => {
                summary.writes += 1;
                store.memory.insert(addr, value);
                tracing::debug!(addr, value, "memory write");
                Some(Frame::MemWriteAck)
            }
            Frame::IoReadRequest { port } => {
                summary.reads += 1;
                let value = store.ports.get(&port).copied().unwrap_or(0);
                tracing::debug!(port, value, "io read");
                Some(Frame::IoReadResponse { value })
            }
            Frame::IoWriteRequest { port, value } => {
                summary.writes += 1;
                store.ports.insert(port, value);
                tracing::debug!(port, value, "io write");
                Some(Frame::IoWriteAck)
            }
            Frame::DmaReadResponse { .. }
            | Frame::DmaWriteResponse { .. }
            | Frame::IrqRaiseAck
            | Frame::IrqLowerAck
                if in_flight =>
            {
                summary.async_completed += 1;
                tracing::info!(response = ?frame, "host completed request");
                in_flight = send_next(&mut writer, &mut queued)?;
                None
            }
            other => {
                return Err(CliError::new(
                    DATA_INVALID,
                    format!("unexpected {} from host", other.opcode()),
                ));
            }
        };

        if let Some(reply) = reply {
            writer
                .send(&reply)
                .map_err(|err| frame_error("send failed", err))?;
        }
    }

    Ok(summary)
}

fn send_next(
    writer: &mut FrameWriter<PacketStream>,
    queued: &mut VecDeque<Frame>,
) -> CliResult<bool> {
    match queued.pop_front() {
        Some(request) => {
            writer
                .send(&request)
                .map_err(|err| frame_error("send failed", err))?;
            tracing::info!(request = ?request, "requested host service");
            Ok(true)
        }
        None => Ok(false),
    }
}
