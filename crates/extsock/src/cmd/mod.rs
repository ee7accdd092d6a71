use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use extsock_bridge::{RegionDescriptor, DEFAULT_SOCKET_PATH};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod device;
pub mod probe;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a simulated external device process.
    Device(DeviceArgs),
    /// Attach to a device process through a headless host and issue accesses.
    Probe(ProbeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Device(args) => device::run(args, format),
        Command::Probe(args) => probe::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Socket path to listen on.
    #[arg(env = "EXTSOCK_PATH", default_value = DEFAULT_SOCKET_PATH)]
    pub path: PathBuf,
    /// Memory region to announce (repeatable).
    #[arg(long, value_name = "BASE:SIZE", value_parser = parse_mem_region)]
    pub mem: Vec<RegionDescriptor>,
    /// I/O port range to announce (repeatable).
    #[arg(long, value_name = "BASE:SIZE", value_parser = parse_io_region)]
    pub io: Vec<RegionDescriptor>,
    /// Ask the host to raise this interrupt line after registration.
    #[arg(long, value_name = "LINE", value_parser = parse_u8)]
    pub raise_irq: Option<u8>,
    /// Ask the host for one DMA read on this channel after registration.
    #[arg(long, value_name = "CHANNEL", value_parser = parse_u8)]
    pub dma_read: Option<u8>,
    /// Serve a single connection and exit.
    #[arg(long)]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Socket path of the device process.
    #[arg(env = "EXTSOCK_PATH", default_value = DEFAULT_SOCKET_PATH)]
    pub path: PathBuf,
    /// Read one byte of device memory (repeatable).
    #[arg(long, value_name = "ADDR", value_parser = parse_u32)]
    pub mem_read: Vec<u32>,
    /// Write one byte of device memory (repeatable).
    #[arg(long, value_name = "ADDR=VALUE", value_parser = parse_mem_assignment)]
    pub mem_write: Vec<(u32, u8)>,
    /// Read one I/O port (repeatable).
    #[arg(long, value_name = "PORT", value_parser = parse_u16)]
    pub io_read: Vec<u16>,
    /// Write one I/O port (repeatable).
    #[arg(long, value_name = "PORT=VALUE", value_parser = parse_io_assignment)]
    pub io_write: Vec<(u16, u8)>,
    /// Keep servicing device requests this long after the accesses (e.g. 500ms, 2s).
    #[arg(long)]
    pub hold: Option<String>,
    /// Registration deadline (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Interval between dispatch ticks (e.g. 10ms).
    #[arg(long, default_value = "10ms")]
    pub tick: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

/// Hexadecimal with a `0x` prefix, otherwise decimal.
fn parse_u32(text: &str) -> Result<u32, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("invalid number '{text}': {err}"))
}

fn parse_u16(text: &str) -> Result<u16, String> {
    let value = parse_u32(text)?;
    u16::try_from(value).map_err(|_| format!("{value:#x} does not fit in 16 bits"))
}

fn parse_u8(text: &str) -> Result<u8, String> {
    let value = parse_u32(text)?;
    u8::try_from(value).map_err(|_| format!("{value:#x} does not fit in 8 bits"))
}

fn split_pair<'a>(text: &'a str, separator: char, shape: &str) -> Result<(&'a str, &'a str), String> {
    text.split_once(separator)
        .ok_or_else(|| format!("expected {shape}, got '{text}'"))
}

fn parse_mem_region(text: &str) -> Result<RegionDescriptor, String> {
    let (base, size) = split_pair(text, ':', "BASE:SIZE")?;
    Ok(RegionDescriptor::memory(parse_u32(base)?, parse_u32(size)?))
}

fn parse_io_region(text: &str) -> Result<RegionDescriptor, String> {
    let (base, size) = split_pair(text, ':', "BASE:SIZE")?;
    Ok(RegionDescriptor::io(parse_u16(base)?, parse_u16(size)?))
}

fn parse_mem_assignment(text: &str) -> Result<(u32, u8), String> {
    let (addr, value) = split_pair(text, '=', "ADDR=VALUE")?;
    Ok((parse_u32(addr)?, parse_u8(value)?))
}

fn parse_io_assignment(text: &str) -> Result<(u16, u8), String> {
    let (port, value) = split_pair(text, '=', "PORT=VALUE")?;
    Ok((parse_u16(port)?, parse_u8(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(parse_u32("0xA0000").unwrap(), 0x000A_0000);
        assert_eq!(parse_u32("1016").unwrap(), 0x03F8);
        assert!(parse_u8("0x100").is_err());
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn region_arguments() {
        assert_eq!(
            parse_io_region("0x3F8:8").unwrap(),
            RegionDescriptor::io(0x03F8, 8)
        );
        assert_eq!(
            parse_mem_region("0xD0000:0x2000").unwrap(),
            RegionDescriptor::memory(0x000D_0000, 0x2000)
        );
        assert!(parse_io_region("0x3F8").is_err());
        assert!(parse_io_region("0x10000:1").is_err());
    }

    #[test]
    fn assignments() {
        assert_eq!(parse_io_assignment("0x60=0x01").unwrap(), (0x0060, 0x01));
        assert_eq!(
            parse_mem_assignment("0xD0010=170").unwrap(),
            (0x000D_0010, 0xAA)
        );
        assert!(parse_io_assignment("0x60").is_err());
    }
}
