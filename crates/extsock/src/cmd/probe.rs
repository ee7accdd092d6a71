use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use extsock_bridge::{BridgeConfig, HeadlessHost, RegistrationConfig};

use crate::cmd::{install_ctrlc_handler, parse_duration, ProbeArgs};
use crate::exit::{bridge_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{
    now_unix_seconds, print_probe_report, AccessKind, AccessRecord, OutputFormat, ProbeReport,
};

const HOLD_POLL: Duration = Duration::from_millis(20);

pub fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let registration_timeout = parse_duration(&args.timeout)?;
    let tick = parse_duration(&args.tick)?;
    let hold = args.hold.as_deref().map(parse_duration).transpose()?;

    let config = BridgeConfig {
        socket_path: args.path.clone(),
        registration: RegistrationConfig {
            timeout: Some(registration_timeout),
            ..RegistrationConfig::default()
        },
        ..BridgeConfig::default()
    };

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let host = HeadlessHost::new();
    let device = host
        .open(&config)
        .map_err(|err| bridge_error("attach failed", err))?;
    let regions = device.regions().to_vec();

    let ticker = spawn_ticker(host.clone(), tick, running.clone())?;

    let accesses = perform_accesses(&host, &args);

    if let Some(hold) = hold {
        let deadline = Instant::now() + hold;
        while running.load(Ordering::SeqCst) && device.is_running() && Instant::now() < deadline {
            thread::sleep(HOLD_POLL);
        }
    }

    running.store(false, Ordering::SeqCst);
    if ticker.join().is_err() {
        tracing::warn!("tick thread panicked");
    }

    let fault = device.fault();
    let closed = device.close();

    let report = ProbeReport {
        socket: args.path.display().to_string(),
        regions,
        accesses: accesses.as_ref().cloned().unwrap_or_default(),
        events: host.take_events(),
        fault,
        timestamp: now_unix_seconds(),
    };
    print_probe_report(&report, format);

    accesses.map_err(|err| bridge_error("access failed", err))?;
    closed.map_err(|err| bridge_error("device stopped", err))?;
    Ok(SUCCESS)
}

/// Writes go out before reads so a read-back sees the written value.
fn perform_accesses(
    host: &HeadlessHost,
    args: &ProbeArgs,
) -> extsock_bridge::Result<Vec<AccessRecord>> {
    let mut records = Vec::new();

    for &(addr, value) in &args.mem_write {
        host.mem_write(addr, value)?;
        records.push(AccessRecord {
            kind: AccessKind::MemWrite,
            address: addr,
            value,
        });
    }
    for &(port, value) in &args.io_write {
        host.io_write(port, value)?;
        records.push(AccessRecord {
            kind: AccessKind::IoWrite,
            address: u32::from(port),
            value,
        });
    }
    for &addr in &args.mem_read {
        let value = host.mem_read(addr)?;
        records.push(AccessRecord {
            kind: AccessKind::MemRead,
            address: addr,
            value,
        });
    }
    for &port in &args.io_read {
        let value = host.io_read(port)?;
        records.push(AccessRecord {
            kind: AccessKind::IoRead,
            address: u32::from(port),
            value,
        });
    }

    Ok(records)
}

fn spawn_ticker(
    host: HeadlessHost,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> CliResult<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("extsock-tick".to_string())
        .spawn(move || {
            while running.load(Ordering::SeqCst) {
                host.advance_timers();
                thread::sleep(interval);
            }
        })
        .map_err(|err| CliError::new(INTERNAL, format!("tick thread failed to start: {err}")))
}
